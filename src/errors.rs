//! Error hierarchy for the document layer
//!
//! Errors are grouped by the layer that raises them: schema/codec mismatches,
//! key-value store failures, configuration problems and lock misuse. Lock
//! contention itself (not owned, timed out, evicted) is never an error; it is
//! reported through `bool` results.

use std::fmt;
use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type used for opaque sources (wire errors, handler failures)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Structural mismatch between a document/key and the schema
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Key-value service failures
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid lock construction or usage
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the failure is a transient connectivity problem that a read
    /// may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_retryable())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A document field has no counterpart in the schema
    #[error("Unknown field '{field}' at '{path}'")]
    UnknownField { path: String, field: String },

    /// A flat key cannot be turned back into a document path
    #[error("Malformed key '{key}': {reason}")]
    MalformedKey { key: String, reason: String },

    /// A leaf value does not match the schema type tag
    #[error("Wrong type at '{path}': expected {expected}, found {found}")]
    WrongType {
        path: String,
        expected: String,
        found: &'static str,
    },

    /// Identifiers and in-key values may not contain key separators
    #[error("Invalid identifier '{identifier}' at '{path}'")]
    InvalidIdentifier { path: String, identifier: String },

    /// Type tag string not understood
    #[error("Unknown type tag '{tag}' at '{path}'")]
    UnknownTypeTag { path: String, tag: String },

    /// Schema template file or JSON is not a valid template
    #[error("Invalid schema template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("Unknown scope '{0}'")]
    UnknownScope(String),

    #[error("Unknown schema version '{0}'")]
    UnknownVersion(String),

    /// Documents are built from JSON objects only
    #[error("Expected a JSON object, found {0}")]
    NotADocument(&'static str),

    /// No keys could be derived from the input document
    #[error("Document produced no keys: {0}")]
    EmptyDocument(String),

    /// `rename` was given two documents of different shapes
    #[error("Rename shape mismatch: {old_keys} old keys vs {new_keys} new keys")]
    RenameMismatch { old_keys: usize, new_keys: usize },

    /// More than one stored key holds a value-in-key leaf for the same parent
    #[error("Ambiguous value-in-key for '{pattern}': {matches:?}")]
    AmbiguousValueKey { pattern: String, matches: Vec<String> },
}

/// Logical connection a store operation ran against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Local,
    Replica,
    Master,
}

impl fmt::Display for ConnectionRole {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            ConnectionRole::Local => "local",
            ConnectionRole::Replica => "replica",
            ConnectionRole::Master => "master",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network or protocol failure talking to the key-value service
    #[error("{operation} on {connection} connection failed: {source}")]
    Connectivity {
        connection: ConnectionRole,
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// Operation exceeded its deadline
    #[error("{operation} on {connection} connection timed out after {duration:?}")]
    Timeout {
        connection: ConnectionRole,
        operation: &'static str,
        duration: Duration,
    },

    /// The service answered with something the operation cannot use
    #[error("{operation} on {connection} connection: {reason}")]
    Command {
        connection: ConnectionRole,
        operation: &'static str,
        reason: String,
    },

    /// The logical connection is turned off in configuration
    #[error("Connection {0} is disabled")]
    Disabled(ConnectionRole),

    /// The pool has been shut down
    #[error("Connection pool for {0} is closed")]
    PoolClosed(ConnectionRole),

    /// Blob value encoding/decoding failure
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Retry policy exhaustion
    #[error("Retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl StoreError {
    pub(crate) fn connectivity(
        connection: ConnectionRole,
        operation: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        StoreError::Connectivity {
            connection,
            operation,
            source: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Connectivity { .. } | StoreError::Timeout { .. }
        )
    }

    /// Logical connection the error came from, if any
    pub fn connection(&self) -> Option<ConnectionRole> {
        match self {
            StoreError::Connectivity { connection, .. }
            | StoreError::Timeout { connection, .. }
            | StoreError::Command { connection, .. } => Some(*connection),
            StoreError::Disabled(role) | StoreError::PoolClosed(role) => Some(*role),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Queue level must be between 1 and 9, got {0}")]
    InvalidQueueLevel(u32),

    #[error("Lock name '{0}' is not a valid identifier")]
    InvalidName(String),

    #[error("Owner identity must not be empty")]
    EmptyOwner,
}
