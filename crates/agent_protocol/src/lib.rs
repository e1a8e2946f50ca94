pub mod control_client;
pub mod driver;
pub mod jsonrpc;
pub mod message;
pub mod rpc_server;

#[cfg(feature = "test-utils")]
pub mod driver_test_util;

pub use driver::{DriverError, InputDriver, OutputDriver, Record, Transform};
