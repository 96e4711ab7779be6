//! Server error types.
//!
//! Provides the error taxonomy shared by sockets, the broker and the server,
//! the payload shape remote peers see on rejects, and the close codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::middleware::Block;

/// WebSocket close codes used by the server.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Unexpected server condition.
    pub const SERVER_ERROR: u16 = 1011;
    /// Client missed a ping interval.
    pub const PING_TIMEOUT: u16 = 4000;
    /// Client sent a frame that could not be decoded.
    pub const BAD_MESSAGE: u16 = 4400;
    /// Connection or action blocked by middleware.
    pub const BLOCKED: u16 = 4403;

    /// Returns true for codes that do not warrant a protocol error event.
    #[must_use]
    pub fn is_ignored(code: u16) -> bool {
        matches!(code, NORMAL | GOING_AWAY | NO_STATUS)
    }

    /// Returns a human readable description of a close code.
    #[must_use]
    pub fn describe(code: u16) -> &'static str {
        match code {
            NORMAL => "Normal closure",
            GOING_AWAY => "Socket is going away",
            1002 => "A protocol error was encountered",
            1003 => "Server cannot accept this type of data",
            NO_STATUS => "No status code was provided",
            ABNORMAL => "Socket connection was closed abnormally",
            1007 => "Message payload was inconsistent with the message type",
            1008 => "Message violated the server policy",
            1009 => "Message was too big to process",
            SERVER_ERROR => "Server encountered an unexpected condition",
            PING_TIMEOUT => "Server ping timed out",
            BAD_MESSAGE => "Message format was incorrect",
            BLOCKED => "Connection was blocked by middleware",
            _ => "Unknown close code",
        }
    }
}

/// Errors raised by the socket server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Input had the wrong shape.
    #[error("{0}")]
    InvalidArguments(String),

    /// The action is not allowed in the current state.
    #[error("{0}")]
    InvalidAction(String),

    /// The auth token has expired.
    #[error("{message}")]
    AuthTokenExpired {
        /// Error message.
        message: String,
        /// When the token expired.
        expired_at: DateTime<Utc>,
    },

    /// The auth token is malformed or its signature does not match.
    #[error("{0}")]
    AuthTokenInvalid(String),

    /// The auth token is not valid yet.
    #[error("{message}")]
    AuthTokenNotBefore {
        /// Error message.
        message: String,
        /// When the token becomes valid.
        date: DateTime<Utc>,
    },

    /// Any other auth token failure.
    #[error("{0}")]
    AuthToken(String),

    /// A middleware deliberately blocked the action.
    #[error("{}", .0.message())]
    Blocked(Block),

    /// The connection closed with a non-benign code.
    #[error("socket protocol error {code}: {message}")]
    Protocol {
        /// Close code.
        code: u16,
        /// Close reason.
        message: String,
    },

    /// The configured port is taken.
    #[error("The port {0} is already in use.")]
    PortInUse(u16),

    /// The listener could not be started.
    #[error("failed to listen: {0}")]
    FailedToListen(String),

    /// The socket is closed.
    #[error("socket is not open")]
    NotOpen,

    /// An invoke was not acknowledged in time.
    #[error("{0}")]
    Timeout(String),

    /// The remote peer rejected an invoke.
    #[error("{}", .0.message)]
    Remote(ErrorPayload),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure inside application code or a background task.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServerError {
    /// Returns the error name shown to remote peers.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::InvalidArguments(_) => "InvalidArgumentsError",
            Self::InvalidAction(_) => "InvalidActionError",
            Self::AuthTokenExpired { .. } => "AuthTokenExpiredError",
            Self::AuthTokenInvalid(_) => "AuthTokenInvalidError",
            Self::AuthTokenNotBefore { .. } => "AuthTokenNotBeforeError",
            Self::AuthToken(_) => "AuthTokenError",
            Self::Blocked(block) => block.name.as_str(),
            Self::Protocol { .. } => "SocketProtocolError",
            Self::PortInUse(_) => "PortInUseError",
            Self::FailedToListen(_) => "FailedToListenError",
            Self::NotOpen => "BadConnectionError",
            Self::Timeout(_) => "TimeoutError",
            Self::Remote(payload) => payload.name.as_str(),
            Self::Config(_) => "ConfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns true if this is an auth token verification failure.
    #[must_use]
    pub fn is_bad_auth_token(&self) -> bool {
        matches!(
            self,
            Self::AuthTokenExpired { .. }
                | Self::AuthTokenInvalid(_)
                | Self::AuthTokenNotBefore { .. }
                | Self::AuthToken(_)
        )
    }

    /// Returns the code attached to the error, if any.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Blocked(block) => Some(block.code),
            Self::Protocol { code, .. } => Some(*code),
            Self::Remote(payload) => payload.code,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Error shape sent to the remote peer on a reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Error name.
    pub name: String,
    /// Error message.
    pub message: String,
    /// Optional code, set for blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Set when the reject came from an auth token failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bad_auth_token: bool,
}

impl ErrorPayload {
    /// Creates a payload with a name and message.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            bad_auth_token: false,
        }
    }
}

impl From<&ServerError> for ErrorPayload {
    fn from(error: &ServerError) -> Self {
        match error {
            ServerError::Remote(payload) => payload.clone(),
            // Internal details stay on the server.
            ServerError::Internal(_) => ErrorPayload::new("InternalError", "Internal server error"),
            other => Self {
                name: other.name().to_string(),
                message: other.to_string(),
                code: other.code(),
                bad_auth_token: other.is_bad_auth_token(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_ignored() {
        assert!(close_codes::is_ignored(1000));
        assert!(close_codes::is_ignored(1001));
        assert!(close_codes::is_ignored(1005));
        assert!(!close_codes::is_ignored(1006));
        assert!(!close_codes::is_ignored(4403));
    }

    #[test]
    fn test_port_in_use_display() {
        let err = ServerError::PortInUse(3000);
        assert_eq!(err.to_string(), "The port 3000 is already in use.");
        assert_eq!(err.name(), "PortInUseError");
    }

    #[test]
    fn test_bad_auth_token_classification() {
        assert!(ServerError::AuthTokenInvalid("bad".to_string()).is_bad_auth_token());
        assert!(ServerError::AuthToken("x".to_string()).is_bad_auth_token());
        assert!(!ServerError::InvalidArguments("x".to_string()).is_bad_auth_token());
    }

    #[test]
    fn test_blocked_payload_carries_code() {
        let err = ServerError::Blocked(Block::new(4001, "denied"));
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, Some(4001));
        assert_eq!(payload.message, "denied");
        assert_eq!(payload.name, "MiddlewareBlock");
        assert!(!payload.bad_auth_token);
    }

    #[test]
    fn test_internal_payload_does_not_leak() {
        let err = ServerError::Internal(anyhow::anyhow!("database password is hunter2"));
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.name, "InternalError");
        assert!(!payload.message.contains("hunter2"));
    }

    #[test]
    fn test_payload_serialization() {
        let mut payload = ErrorPayload::new("AuthTokenInvalidError", "invalid signature");
        payload.bad_auth_token = true;
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["badAuthToken"], true);
        assert!(json.get("code").is_none());
    }
}
