//! Error taxonomy for route handling and the boundary that every public entry point runs through.

use std::panic::{self, AssertUnwindSafe};

use crate::host::{StoreError, TransportError};
use crate::validator::ValidationError;
use crate::wire::{DecodeError, EncodeError};

const EINVAL: i32 = 22;
const ENOMEM: i32 = 12;
const EIO: i32 = 5;
const EPROTO: i32 = 71;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Buffer too short, count mismatch, or arithmetic that would overrun.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Claimed address index invalid or address cardinality differs from ours.
    #[error("address mismatch: {0}")]
    AddressMismatch(String),
    #[error("incompatible protocol version {0}")]
    IncompatibleVersion(String),
    #[error("out of memory building route buffer")]
    OutOfMemory,
    /// Lower layer rejected a backend id block.
    #[error("backend {backend_id} update failed: {reason}")]
    BackendUpdateFailed { backend_id: u32, reason: String },
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl RouteError {
    /// Negative errno carried in the response status.
    pub fn errno(&self) -> i32 {
        match self {
            RouteError::Malformed(_)
            | RouteError::AddressMismatch(_)
            | RouteError::BackendUpdateFailed { .. } => -EINVAL,
            RouteError::IncompatibleVersion(_) => -EPROTO,
            RouteError::OutOfMemory => -ENOMEM,
            RouteError::Unexpected(_) => -EIO,
        }
    }
}

impl From<ValidationError> for RouteError {
    fn from(e: ValidationError) -> Self {
        RouteError::Malformed(e.to_string())
    }
}

impl From<DecodeError> for RouteError {
    fn from(e: DecodeError) -> Self {
        RouteError::Malformed(e.to_string())
    }
}

impl From<EncodeError> for RouteError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::OutOfMemory(_) => RouteError::OutOfMemory,
            other => RouteError::Unexpected(other.to_string()),
        }
    }
}

impl From<TransportError> for RouteError {
    fn from(e: TransportError) -> Self {
        RouteError::Unexpected(e.to_string())
    }
}

impl RouteError {
    pub(crate) fn backend_update(backend_id: u32, e: StoreError) -> Self {
        match e {
            StoreError::OutOfMemory => RouteError::OutOfMemory,
            other => RouteError::BackendUpdateFailed {
                backend_id,
                reason: other.to_string(),
            },
        }
    }
}

/// Run an entry point, turning a panic into `Unexpected` so it never crosses
/// the connection-handling boundary.
pub fn boundary<T>(
    op: &'static str,
    f: impl FnOnce() -> Result<T, RouteError>,
) -> Result<T, RouteError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(op, panic = %msg, "route handler panicked");
            Err(RouteError::Unexpected(format!("{}: {}", op, msg)))
        }
    }
}
