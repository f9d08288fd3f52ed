pub mod cdc_flow;
pub mod qrep_flow;
pub mod snapshot_flow;

pub use cdc_flow::{CdcFlowState, CdcFlowWorkflow};
pub use qrep_flow::{QRepFlowState, QRepFlowWorkflow};

use crate::orchestrator::ActivityError;

/// True when the activity ended because the workflow was asked to shut
/// down rather than because the step failed.
pub(crate) fn ended_by_shutdown(err: &ActivityError) -> bool {
    err.is_cancelled()
}
