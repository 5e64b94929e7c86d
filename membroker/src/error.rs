//! Engine and registry level errors.

use membroker_proto::ErrorCode;

use crate::ids::ClientId;

/// Errors the allocation engine can raise while handling one message.
///
/// Most variants map directly onto the wire-level [`ErrorCode`] taxonomy and
/// degrade only the offending client; [`BrokerError::ContractViolation`] is
/// fatal to the whole broker (§7) and the caller is expected to log it and
/// exit rather than continue serving.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown client id {0:?}")]
    UnknownClient(ClientId),
    #[error("client {0:?} is already registered")]
    AlreadyRegistered(ClientId),
    #[error("operation not valid for this client's type")]
    BadClientType,
    #[error("negative page count")]
    BadParam,
    #[error("contract violation by client {client:?}: {reason}")]
    ContractViolation { client: ClientId, reason: String },
}

impl BrokerError {
    /// Whether this error indicates a client bug serious enough that the
    /// broker itself must not continue (§7).
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }

    pub const fn as_wire_error(&self) -> ErrorCode {
        match self {
            Self::UnknownClient(_) => ErrorCode::BadId,
            Self::AlreadyRegistered(_) => ErrorCode::BadCode,
            Self::BadClientType => ErrorCode::BadClientType,
            Self::BadParam => ErrorCode::BadParam,
            Self::ContractViolation { .. } => ErrorCode::BadParam,
        }
    }
}
