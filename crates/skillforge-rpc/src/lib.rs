//! IPC contract for skillforged
//!
//! - `protocol`: JSON-RPC 2.0 envelope, one document per line
//! - `methods`: administrative method names and their params/results

pub mod methods;
pub mod protocol;

pub use protocol::{ErrorObject, Notification, Request, RequestId, Response, RpcError};
