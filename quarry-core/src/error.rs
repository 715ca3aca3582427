//! Error types for the quarry core.
//!
//! A single structured error enum is shared across the consensus, storage and
//! worker halves. Variants carry the operation that failed and, where one
//! exists, the source error, so callers can both match on the kind and log a
//! full cause chain.

use serde::{Deserialize, Serialize};

use crate::types::{SectorFileType, SectorId};

pub type QuarryResult<T> = Result<T, QuarryError>;

#[derive(Debug, thiserror::Error)]
pub enum QuarryError {
    /// No storage location holds the requested sector file.
    #[error("sector {sector} (type {file_type:?}) not found in any storage location{}", details.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
    SectorNotFound {
        sector: SectorId,
        file_type: SectorFileType,
        details: Option<String>,
    },

    /// `existing` and `allocate` overlap, or a single-type operation was
    /// handed a mask with the wrong population count.
    #[error("invalid acquire: {message}")]
    InvalidAcquire { message: String },

    #[error("unknown content type: '{media_type}'")]
    UnknownMediaType { media_type: String },

    /// Synthetic failure reported for calls that were in flight when the
    /// worker process restarted.
    #[error("worker restarted")]
    TempWorkerRestart,

    #[error("not leader for operation '{operation}', current leader: {leader_id:?}")]
    NotLeader {
        operation: String,
        leader_id: Option<u64>,
    },

    #[error("timed out during '{operation}'")]
    Timeout { operation: String },

    #[error("storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("raft operation '{operation}' failed")]
    Raft {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("http operation '{operation}' failed")]
    Http {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// HTTP request completed with an unexpected status code.
    #[error("http operation '{operation}' returned status {status}{}", body.as_deref().map(|b| format!(": {}", b)).unwrap_or_default())]
    HttpStatus {
        operation: String,
        status: u16,
        body: Option<String>,
    },

    #[error("rpc call '{method}' failed: {message}")]
    Rpc { method: String, message: String },

    #[error("validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("feature not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    pub fn storage<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn raft<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Raft {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn http<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Http {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

/// Error code carried across the worker return wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallErrorCode {
    Unknown,
    TempWorkerRestart,
}

/// Serializable form of a failed sealing call, delivered to the manager
/// through the typed return path and persisted by the call tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    pub code: CallErrorCode,
    pub message: String,
}

impl CallError {
    pub fn new(code: CallErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Wrap an arbitrary task failure for return delivery. Restart errors
    /// keep their kind so the manager can reschedule instead of failing the
    /// sector.
    pub fn from_error(err: &QuarryError) -> Self {
        match err {
            QuarryError::TempWorkerRestart => {
                Self::new(CallErrorCode::TempWorkerRestart, err.to_string())
            }
            other => Self::new(CallErrorCode::Unknown, other.to_string()),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
