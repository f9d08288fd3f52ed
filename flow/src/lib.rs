pub mod activities;
pub mod orchestrator;
pub mod workflows;

pub use activities::{CheckConnectionResult, FlowActivities, FlowableActivity};
pub use orchestrator::{
    execute_activity, ActivityContext, ActivityError, ActivityOptions, FlowError, RetryPolicy,
};
pub use workflows::{CdcFlowState, CdcFlowWorkflow, QRepFlowState, QRepFlowWorkflow};
