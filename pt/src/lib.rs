pub mod flow;
pub mod peers;
pub mod qrep;
pub mod schema;

pub use flow::*;
pub use peers::*;
pub use qrep::*;
pub use schema::*;
