//! Error types for the treesnap library
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! side is [`TreesnapError`]. These are programmer-error faults (unknown ids,
//! malformed paths, misuse of a patch session) or backend failures. Faults
//! observed while scanning a tree are *not* errors here: they travel as
//! [`NodeError`](crate::types::NodeError) data on the affected node or in a
//! coverage scope.

use crate::types::ErrorCode;
use thiserror::Error;

/// Type alias for Results in the treesnap library
pub type Result<T> = std::result::Result<T, TreesnapError>;

/// Main error type for all treesnap operations
#[derive(Debug, Error)]
pub enum TreesnapError {
    /// A VPath or canonical reference string is malformed
    #[error("Invalid vpath ({code:?}): {message}")]
    InvalidVPath {
        /// Classification of the fault
        code: ErrorCode,
        /// What was wrong with the input
        message: String,
    },

    /// A node reference has a layer stack that does not start with the OS layer
    #[error("Invalid layer stack: {0}")]
    InvalidLayers(String),

    /// Root id that cannot be embedded in a canonical string
    #[error("Invalid root id {0:?}: must be non-empty and free of \":/\"")]
    InvalidRootId(String),

    /// Root id is not registered in the store
    #[error("Root not found: {0}")]
    RootNotFound(String),

    /// Root id is already registered under a different root key
    #[error("Root id {root_id} is already registered with a different key (requested {root_key})")]
    RootIdConflict {
        /// Conflicting root id
        root_id: String,
        /// Root key of the rejected registration
        root_key: String,
    },

    /// Snapshot id is not known to the store
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Pagination cursor could not be parsed
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Coverage was recorded for a different run than the patch session's
    #[error("Coverage run mismatch - expected: {expected}, actual: {actual}")]
    CoverageRunMismatch {
        /// Run id of the patch session
        expected: String,
        /// Run id carried by the coverage report
        actual: String,
    },

    /// Commit was attempted before any coverage was recorded
    #[error("Coverage not recorded for this patch session")]
    CoverageNotRecorded,

    /// The patch session was already committed or aborted
    #[error("Patch session is closed")]
    SessionClosed,

    /// Observed size beyond what a snapshot can hold (`i64::MAX`)
    #[error("Size {size} of {vpath} exceeds the storable range")]
    SizeOutOfRange {
        /// Node the size was reported for
        vpath: String,
        /// Reported size
        size: u64,
    },

    /// Errors from the embedded SQL backend
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data that does not decode into the expected shape
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),

    /// Custom error type for extensions
    #[error("{0}")]
    Custom(String),
}

impl TreesnapError {
    /// Create a vpath error with the given classification
    pub fn invalid_vpath(code: ErrorCode, msg: impl Into<String>) -> Self {
        TreesnapError::InvalidVPath {
            code,
            message: msg.into(),
        }
    }

    /// Create a corrupt-data error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        TreesnapError::Corrupt(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        TreesnapError::Internal(msg.into())
    }

    /// Create a custom error with a custom message
    pub fn custom(msg: impl Into<String>) -> Self {
        TreesnapError::Custom(msg.into())
    }

    /// The vpath error code, if this is a vpath error
    pub fn vpath_code(&self) -> Option<ErrorCode> {
        match self {
            TreesnapError::InvalidVPath { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Only transient backend conditions qualify. Everything else is a
    /// caller mistake and retrying will fail the same way.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TreesnapError::Io(_) => true,
            TreesnapError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Check if this error signals API misuse rather than a backend failure
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            TreesnapError::InvalidVPath { .. }
                | TreesnapError::InvalidLayers(_)
                | TreesnapError::InvalidRootId(_)
                | TreesnapError::RootNotFound(_)
                | TreesnapError::RootIdConflict { .. }
                | TreesnapError::SnapshotNotFound(_)
                | TreesnapError::InvalidCursor(_)
                | TreesnapError::CoverageRunMismatch { .. }
                | TreesnapError::CoverageNotRecorded
                | TreesnapError::SessionClosed
                | TreesnapError::SizeOutOfRange { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            TreesnapError::SnapshotNotFound(id) => {
                format!("Snapshot '{}' not found. Use 'treesnap snapshots <root>' to list snapshots.", id)
            }
            TreesnapError::RootNotFound(id) => {
                format!("Root '{}' is not registered. Use 'treesnap roots' to list registered roots.", id)
            }
            TreesnapError::CoverageNotRecorded => {
                "No coverage was recorded. A patch must report which scopes it observed before committing."
                    .to_string()
            }
            TreesnapError::InvalidVPath { message, .. } => {
                format!("{}. Virtual paths are absolute, '/'-separated and percent-encoded.", message)
            }
            _ => self.to_string(),
        }
    }
}
