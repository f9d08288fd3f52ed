pub mod errors;
pub mod qrecord;
pub mod records;
pub mod requests;
pub mod stream;

pub use errors::FlowError;
pub use qrecord::*;
pub use records::*;
pub use requests::*;
pub use stream::*;

/// Default capacity of the bounded channel between a record pull and the
/// destination writer. The producer blocks when the consumer falls behind,
/// so destination write latency throttles source reads.
pub const FETCH_AND_CHANNEL_SIZE: usize = 256;
