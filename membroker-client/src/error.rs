//! Errors the client library can raise, layered over the wire-level
//! [`ErrorCode`] taxonomy (§7) the broker itself uses.

use membroker_proto::{CodecError, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] CodecError),
    #[error("broker rejected the request: {0}")]
    Broker(ErrorCode),
    #[error("response id {got} did not match the request id {expected}")]
    MismatchedId { expected: i32, got: i32 },
    #[error("operation not valid for a bidi client handle")]
    BadClientType,
    #[error("not connected")]
    NotConnected,
}
