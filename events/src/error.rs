//! Error types for the `events` crate.
//!
//! Follows the same pattern as the other crates: a root Error struct holding an
//! error kind and an optional source.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// An event could not be encoded or decoded for the relay channel.
    Codec,
    /// The relay store rejected a command or dropped the connection.
    Relay,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Event bus error ({:?}): {}", self.error_kind, source),
            None => write!(f, "Event bus error ({:?})", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Codec,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Relay,
        }
    }
}
