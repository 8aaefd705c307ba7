//! Probe error types.

use huddle_protocol::stun::StunError;
use thiserror::Error;

/// Why a TURN check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    /// The endpoint could not be reached or did not answer in time.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server answered but rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server answered with something that is not a usable STUN reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The probe is not configured to complete the check.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The check task itself failed.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl TurnError {
    /// Metric label for this error.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            TurnError::Connection(_) => "connect",
            TurnError::Authentication(_) => "auth",
            TurnError::Protocol(_) => "protocol",
            TurnError::Configuration(_) => "config",
            TurnError::Unexpected(_) => "unexpected",
        }
    }

    /// Whether the server answered before the check failed.
    #[must_use]
    pub fn reachable(&self) -> bool {
        matches!(
            self,
            TurnError::Authentication(_) | TurnError::Protocol(_) | TurnError::Configuration(_)
        )
    }
}

impl From<StunError> for TurnError {
    fn from(err: StunError) -> Self {
        TurnError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(TurnError::Connection("x".into()).category(), "connect");
        assert_eq!(TurnError::Authentication("x".into()).category(), "auth");
        assert_eq!(TurnError::Protocol("x".into()).category(), "protocol");
        assert_eq!(TurnError::Configuration("x".into()).category(), "config");
        assert_eq!(TurnError::Unexpected("x".into()).category(), "unexpected");
    }

    #[test]
    fn test_stun_errors_are_protocol_errors() {
        let err: TurnError = StunError::Truncated.into();
        assert_eq!(err.category(), "protocol");
        assert!(err.reachable());
        assert!(!TurnError::Connection("timed out".into()).reachable());
    }
}
