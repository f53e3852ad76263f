//! RPC error taxonomy shared by server and client.

use crate::protocol::StatusCode;
use std::fmt;
use std::io;

/// Errors surfaced by the delayed-echo operation and its client.
#[derive(Debug)]
pub enum RpcError {
    /// The channel could not be established.
    Connection(io::Error),
    /// The request was rejected before any work was done.
    InvalidArgument(String),
    /// The shared cancellation token fired while the call was waiting.
    Cancelled,
    /// Any other failure reported for the remote call.
    Remote { code: StatusCode, message: String },
}

impl RpcError {
    /// Build the client-side error for an `ERROR` frame.
    pub fn from_status(code: StatusCode, detail: String) -> Self {
        match code {
            StatusCode::InvalidArgument => RpcError::InvalidArgument(detail),
            StatusCode::Cancelled => RpcError::Cancelled,
            code => RpcError::Remote {
                code,
                message: detail,
            },
        }
    }

    pub(crate) fn channel_closed() -> Self {
        RpcError::Remote {
            code: StatusCode::Unavailable,
            message: "channel closed".to_string(),
        }
    }

    /// Status code used when this error is written back on the wire.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcError::Connection(_) => StatusCode::Unavailable,
            RpcError::InvalidArgument(_) => StatusCode::InvalidArgument,
            RpcError::Cancelled => StatusCode::Cancelled,
            RpcError::Remote { code, .. } => *code,
        }
    }

    /// Text carried in the detail field of an `ERROR` frame.
    pub fn detail(&self) -> String {
        match self {
            RpcError::Connection(e) => e.to_string(),
            RpcError::InvalidArgument(msg) => msg.clone(),
            RpcError::Cancelled => "call cancelled".to_string(),
            RpcError::Remote { message, .. } => message.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Connection(e) => write!(f, "connection failed: {}", e),
            RpcError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            RpcError::Cancelled => write!(f, "call cancelled"),
            RpcError::Remote { code, message } => write!(f, "remote error {}: {}", code, message),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            RpcError::from_status(StatusCode::InvalidArgument, "bad".into()),
            RpcError::InvalidArgument(msg) if msg == "bad"
        ));
        assert!(RpcError::from_status(StatusCode::Cancelled, String::new()).is_cancelled());
        assert!(matches!(
            RpcError::from_status(StatusCode::Internal, "boom".into()),
            RpcError::Remote { code: StatusCode::Internal, .. }
        ));
    }

    #[test]
    fn test_wire_form_matches_status() {
        let err = RpcError::InvalidArgument("delay_ms must be non-negative, got -5".into());
        assert_eq!(err.status_code(), StatusCode::InvalidArgument);
        assert_eq!(err.detail(), "delay_ms must be non-negative, got -5");
    }
}
