//! Error types for the Caesar service.
//!
//! Resource errors (create/open/destroy/send/receive on a named OS object) are
//! fatal for whoever owns the resource. Protocol errors and failures confined
//! to a single client's channels are recoverable for the service.

use crate::registry::ResourceKind;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Caesar service and client.
#[derive(Debug, Error)]
pub enum CaesarError {
    // Named OS object errors
    #[error("{operation} failed for {kind} '{name}': {source}")]
    Resource {
        /// Name of the failed OS call (`mq_open`, `sem_open`, ...).
        operation: &'static str,
        kind: ResourceKind,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared region '{name}' is {actual} bytes, expected at least {expected}")]
    RegionTooSmall {
        name: String,
        actual: usize,
        expected: usize,
    },

    // Local I/O (log files, daemonization)
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Per-client failures, recoverable for the service
    #[error("Channel failure for client '{client}': {source}")]
    ClientChannel {
        client: String,
        #[source]
        source: Box<CaesarError>,
    },

    // Protocol errors
    #[error("Protocol violation: expected '{expected}', received {received:?}")]
    Protocol {
        expected: &'static str,
        received: String,
    },

    #[error("Invalid registration: {message}")]
    InvalidRegistration { message: String },

    #[error("Timed out after {after:?} while waiting to {stage}")]
    Timeout {
        stage: &'static str,
        after: Duration,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Caesar operations.
pub type Result<T> = std::result::Result<T, CaesarError>;

impl From<std::io::Error> for CaesarError {
    fn from(err: std::io::Error) -> Self {
        CaesarError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CaesarError {
    /// Create a resource error from the current OS `errno`.
    pub fn last_os(operation: &'static str, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::resource(operation, kind, name, std::io::Error::last_os_error())
    }

    /// Create a resource error from an explicit I/O error.
    pub fn resource(
        operation: &'static str,
        kind: ResourceKind,
        name: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        CaesarError::Resource {
            operation,
            kind,
            name: name.into(),
            source,
        }
    }

    /// Attribute this error to a single client's channels.
    pub fn for_client(self, client: impl Into<String>) -> Self {
        match self {
            err @ CaesarError::Resource { .. } => CaesarError::ClientChannel {
                client: client.into(),
                source: Box::new(err),
            },
            other => other,
        }
    }

    /// Whether the error must terminate the process that hit it.
    ///
    /// Failures of the caller's own named objects are fatal; everything that
    /// can be blamed on a single peer is not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaesarError::Resource { .. } | CaesarError::RegionTooSmall { .. }
        )
    }

    /// Whether the error reports a missing named object.
    pub fn is_not_found(&self) -> bool {
        match self {
            CaesarError::Resource { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            CaesarError::ClientChannel { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error reports a name collision on exclusive create.
    pub fn is_already_exists(&self) -> bool {
        match self {
            CaesarError::Resource { source, .. } => {
                source.kind() == std::io::ErrorKind::AlreadyExists
            }
            _ => false,
        }
    }

    /// Process exit status for a binary that stops on this error.
    ///
    /// - 2: bad input (usage-style failure)
    /// - 130: interrupted
    /// - 1: everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            CaesarError::Validation { .. } | CaesarError::InvalidRegistration { .. } => 2,
            CaesarError::Cancelled => 130,
            CaesarError::ClientChannel { source, .. } => source.exit_code(),
            _ => 1,
        }
    }

    /// Name of the failed OS call, when there is one.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            CaesarError::Resource { operation, .. } => Some(*operation),
            CaesarError::ClientChannel { source, .. } => source.operation(),
            _ => None,
        }
    }
}
