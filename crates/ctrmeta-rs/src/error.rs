//! Error types for the ctrmeta-rs library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, MetaError>`.
//!
//! # Error Categories
//!
//! Every error maps onto one of three [`ErrorKind`]s:
//!
//! - **Not found**: [`NotFound`]. A store file that does not exist. Missing
//!   buckets inside a store are never errors; decoders return empty results.
//! - **Corrupt**: [`Corrupt`]. The store header or page structure could not
//!   be decoded. Field-level corruption is not an error at all: the field
//!   falls back to its default and a `tracing` warning is emitted.
//! - **Platform failure**: [`Locked`], [`Io`], [`Config`], [`JsonParse`].
//!   The whole listing must be treated as failed.
//!
//! [`NotFound`]: MetaError::NotFound
//! [`Corrupt`]: MetaError::Corrupt
//! [`Locked`]: MetaError::Locked
//! [`Io`]: MetaError::Io
//! [`Config`]: MetaError::Config
//! [`JsonParse`]: MetaError::JsonParse
//!
//! # Error Handling Example
//!
//! ```no_run
//! use ctrmeta_rs::{ErrorKind, MetaStore};
//! use std::time::Duration;
//!
//! match MetaStore::open("/mnt/image/var/lib/containerd/io.containerd.metadata.v1.bolt/meta.db", Duration::from_secs(1)) {
//!     Ok(store) => println!("txid {}", store.db().txid()),
//!     Err(e) if e.kind() == ErrorKind::NotFound => eprintln!("no containerd here"),
//!     Err(e) => return Err(e),
//! }
//! # Ok::<(), ctrmeta_rs::MetaError>(())
//! ```

use std::path::PathBuf;

use crate::codec::CodecError;

/// Result type alias for operations that may return a MetaError.
pub type Result<T> = std::result::Result<T, MetaError>;

/// Error types for metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The store file does not exist.
    #[error("store not found at {0}")]
    NotFound(PathBuf),

    /// The store header or page structure is malformed.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// A shared lock on the store could not be obtained in time.
    #[error("store is locked: {0}")]
    Locked(PathBuf),

    /// The configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Coarse classification of a [`MetaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected absence; callers render an empty result.
    NotFound,
    /// Malformed persisted data.
    Corrupt,
    /// The invocation cannot continue.
    PlatformFailure,
}

impl MetaError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::NotFound(_) => ErrorKind::NotFound,
            MetaError::Corrupt(_) => ErrorKind::Corrupt,
            MetaError::Locked(_)
            | MetaError::Config(_)
            | MetaError::Io(_)
            | MetaError::JsonParse(_) => ErrorKind::PlatformFailure,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        MetaError::Corrupt(msg.into())
    }
}

impl From<CodecError> for MetaError {
    fn from(e: CodecError) -> Self {
        MetaError::Corrupt(e.to_string())
    }
}
