//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the rest of the workspace: a root Error struct
//! holding an error kind tree and an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the stream subsystem.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Authorization(AuthorizationErrorKind),
    Connection(ConnectionErrorKind),
    Registry,
    Serialization,
    /// Hard failure pushed into a stream to abort the HTTP body.
    Transport,
}

/// Outcomes of an authorization snapshot fetch that did not succeed.
#[derive(Debug, PartialEq)]
pub enum AuthorizationErrorKind {
    Unauthenticated,
    Forbidden,
    Expired,
    /// The permission service could not be reached or answered unexpectedly.
    Unavailable,
}

/// Connection lifecycle contract violations.
#[derive(Debug, PartialEq)]
pub enum ConnectionErrorKind {
    NotOpened,
    AlreadyOpened,
    Closed,
    LimitExceeded,
}

impl Error {
    /// True for authorization failures that end a stream gracefully
    /// (credential expired or access revoked), as opposed to outages.
    pub fn is_recoverable_authorization(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Authorization(
                AuthorizationErrorKind::Unauthenticated
                    | AuthorizationErrorKind::Forbidden
                    | AuthorizationErrorKind::Expired
            )
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Authorization(kind) => write!(f, "Authorization error: {:?}", kind)?,
            ErrorKind::Connection(kind) => write!(f, "Connection error: {:?}", kind)?,
            ErrorKind::Registry => write!(f, "Connection registry error")?,
            ErrorKind::Serialization => write!(f, "Serialization error")?,
            ErrorKind::Transport => write!(f, "Stream transport error")?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Registry,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Serialization,
        }
    }
}

/// Helper function to create authorization errors.
pub fn authorization_error(kind: AuthorizationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Authorization(kind),
    }
}

/// Helper function to create connection lifecycle errors.
pub fn connection_error(kind: ConnectionErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Connection(kind),
    }
}

/// Helper function to create registry errors.
pub fn registry_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Registry,
    }
}

/// Helper function to create transport errors.
pub fn transport_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport,
    }
}
