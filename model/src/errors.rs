use thiserror::Error;

/// Error classes the activity runtime treats as permanent. Anything else
/// coming out of a connector is considered transient and retried with
/// backoff.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Operator intervention required (schema drift the flow cannot
    /// absorb, unusable configuration). The workflow pauses and surfaces
    /// the message through its status.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// The batch cannot be decoded; the offset must not advance past it.
    #[error("data corruption: {0}")]
    DataCorruption(String),
}
