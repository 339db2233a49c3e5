//! QLink Protocol Library
//!
//! Asynchronous clients for the two QEMU machine-control protocols: QMP,
//! the JSON-per-line management protocol, and qtest, the whitespace-token
//! test protocol. Both ride the same engine: a reader task that frames and
//! dispatches inbound messages, a writer task draining a bounded outgoing
//! queue, and a dispatcher task pumping asynchronous events into a
//! registered callback.

pub mod error;
pub mod qmp;
pub mod qtest;
pub mod qtest_api;
pub mod transport;

mod protocol;
mod util;

// Re-export commonly used types
pub use error::{Error, ErrorClass, ErrorInfo, Result};
pub use protocol::State;
pub use qmp::QmpClient;
pub use qtest::QtestClient;
pub use qtest_api::{Endianness, Qtest};
pub use transport::Address;

/// QLink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
