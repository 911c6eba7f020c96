//! UDP control/data transport for walkie: JSON control dispatch, RPC with
//! retry, clock-offset estimation, and redundant broadcast fan-out.

pub mod chaos;
pub mod client;
pub mod error;

pub use client::UdpClient;
pub use error::{NetError, Result};
