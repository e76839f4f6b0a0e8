//! Error types shared by the store, the sessions and the RPC boundary.

use serde::{Deserialize, Serialize};

/// Errors returned by hub operations.
///
/// The enum crosses the RPC boundary unchanged, so every variant carries
/// plain data only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubError {
    /// No resource with this id is registered in the session.
    UnknownResource { id: String },
    /// A resource with this id is already registered in the session.
    DuplicateResource { id: String },
    /// The requested data is not available locally and waiting was not allowed.
    NotAvailable,
    /// The operation was cancelled by the client or by session teardown.
    Cancelled,
    /// The log is not owned by this process.
    NotWritable,
    /// Release requested on a log that is not locked.
    NotLocked,
    /// Release requested by a session that does not hold the lock.
    NotOwner,
    /// The session already has a log open under this id.
    SessionInUse { id: String },
    /// The session has no log open under this id.
    UnknownLog { id: String },
    /// The log was evicted or closed while the operation was outstanding.
    LogClosed,
    /// Malformed request arguments.
    InvalidArgument { message: String },
    /// Failure reported by the storage engine.
    Storage { message: String },
    /// Failure reported by the networking layer.
    Network { message: String },
    /// The daemon is shutting down.
    ShuttingDown,
}

impl HubError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HubError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unknown_resource(id: &str) -> Self {
        HubError::UnknownResource { id: id.to_string() }
    }

    pub fn unknown_log(id: &str) -> Self {
        HubError::UnknownLog { id: id.to_string() }
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::UnknownResource { id } => write!(f, "Invalid resource: {}", id),
            HubError::DuplicateResource { id } => write!(f, "Resource already exists: {}", id),
            HubError::NotAvailable => write!(f, "Block not available"),
            HubError::Cancelled => write!(f, "Operation was cancelled"),
            HubError::NotWritable => write!(f, "Log is not writable"),
            HubError::NotLocked => write!(f, "Log is not locked"),
            HubError::NotOwner => write!(f, "Log is not locked by you"),
            HubError::SessionInUse { id } => write!(f, "Session already in use: {}", id),
            HubError::UnknownLog { id } => write!(f, "Invalid log: {}", id),
            HubError::LogClosed => write!(f, "Log is closed"),
            HubError::InvalidArgument { message } => write!(f, "Invalid argument: {}", message),
            HubError::Storage { message } => write!(f, "Storage error: {}", message),
            HubError::Network { message } => write!(f, "Network error: {}", message),
            HubError::ShuttingDown => write!(f, "Hub is shutting down"),
        }
    }
}

impl std::error::Error for HubError {}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;
