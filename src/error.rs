//! Error types for the Lumière voice core

use thiserror::Error;

/// Result type alias for voice core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or output device refused by the host
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device missing or unusable
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Session could not be established
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Mid-session transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound frame
    #[error("decode error: {0}")]
    Decode(String),

    /// Anything else
    #[error("{0}")]
    Unknown(String),
}

/// Failure taxonomy surfaced to the hosting UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    ConnectFailed,
    TransportError,
    DecodeError,
    Unknown,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Decode(_) => ErrorKind::DecodeError,
            Self::Config(_) | Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the session can continue after this error
    ///
    /// Only malformed inbound frames are recoverable: the frame is dropped.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::DecodeError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::DeviceUnavailable => write!(f, "device unavailable"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::TransportError => write!(f, "transport error"),
            Self::DecodeError => write!(f, "decode error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        assert!(Error::Decode("odd length".to_string()).is_recoverable());
        assert!(!Error::Transport("reset".to_string()).is_recoverable());
        assert!(!Error::PermissionDenied("mic".to_string()).is_recoverable());
        assert!(!Error::Unknown("?".to_string()).is_recoverable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::ConnectFailed("x".to_string()).kind(),
            ErrorKind::ConnectFailed
        );
        assert_eq!(
            Error::Transport("x".to_string()).kind(),
            ErrorKind::TransportError
        );
        assert_eq!(Error::Config("x".to_string()).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_decode_is_the_only_recoverable_kind() {
        let all = [
            Error::Config("x".to_string()),
            Error::PermissionDenied("x".to_string()),
            Error::DeviceUnavailable("x".to_string()),
            Error::ConnectFailed("x".to_string()),
            Error::Transport("x".to_string()),
            Error::Decode("x".to_string()),
            Error::Unknown("x".to_string()),
        ];

        let recoverable: Vec<ErrorKind> = all
            .iter()
            .filter(|e| e.is_recoverable())
            .map(Error::kind)
            .collect();
        assert_eq!(recoverable, vec![ErrorKind::DecodeError]);
    }
}
