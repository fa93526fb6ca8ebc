use thiserror::Error;

/// Failures reported by the remote report gateway.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("gateway request timed out")]
    Timeout,
    #[error("session expired")]
    SessionExpired,
    #[error("not authorized")]
    Unauthorized,
    #[error("invalid report: {0}")]
    InvalidReport(String),
}

impl GatewayError {
    /// Errors after which periodic polling cannot succeed until the user
    /// signs in again.
    pub fn is_fatal_for_polling(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Unauthorized)
    }
}

/// Failures raised by message handlers. Always recovered by the processor.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("no handler registered for message type `{0}`")]
    UnknownType(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("handler for `{message_type}` failed: {reason}")]
    Failed { message_type: String, reason: String },
}

impl HandlerError {
    pub fn failed(message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed { message_type: message_type.into(), reason: reason.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cursor store io error: {0}")]
    Io(String),
    #[error("cursor store database error: {0}")]
    Database(String),
    #[error("cursor store rejected write: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// A message that does not chain onto the persisted cursor after gap
/// resolution. Unreachable unless the report or the resolver is broken.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error(
        "notification {id} expects previous id {actual_previous} but cursor is at {expected_previous}"
    )]
    Corruption { id: i64, expected_previous: i64, actual_previous: i64 },
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("notification pipeline is stopped")]
    Stopped,
    #[error("runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failures_stop_polling() {
        assert!(GatewayError::SessionExpired.is_fatal_for_polling());
        assert!(GatewayError::Unauthorized.is_fatal_for_polling());
        assert!(!GatewayError::Network("reset by peer".into()).is_fatal_for_polling());
        assert!(!GatewayError::Timeout.is_fatal_for_polling());
    }

    #[test]
    fn corruption_message_names_both_ids() {
        let err = SequenceError::Corruption { id: 9, expected_previous: 7, actual_previous: 8 };
        let rendered = err.to_string();
        assert!(rendered.contains("notification 9"));
        assert!(rendered.contains("cursor is at 7"));
    }
}
