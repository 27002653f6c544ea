use thiserror::Error;

/// Errors surfaced by a [`BusSession`](crate::session::BusSession).
///
/// Validation failures and hardware rejections share the same variants; the
/// message carries either the local reason or the driver's error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Configuration,
    Read,
    Write,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Connection => SessionError::Connection(message),
            ErrorKind::Configuration => SessionError::Configuration(message),
            ErrorKind::Read => SessionError::Read(message),
            ErrorKind::Write => SessionError::Write(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::Configuration(_) => ErrorKind::Configuration,
            SessionError::Read(_) => ErrorKind::Read,
            SessionError::Write(_) => ErrorKind::Write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, SessionError};

    #[test]
    fn test_new_and_kind() {
        let error = SessionError::new(ErrorKind::Read, "no messages available");
        assert_eq!(error, SessionError::Read("no messages available".to_owned()));
        assert_eq!(error.kind(), ErrorKind::Read);
        assert_eq!(error.to_string(), "read error: no messages available");
    }
}
