//! Shared advisory locking on store files.
//!
//! bbolt takes a `flock(2)` on its database file: exclusive for writers,
//! shared for read-only openers. Taking the shared side here means a copy
//! is never read while a writer holds the file, and a live daemon is never
//! blocked by us for longer than it takes to read the file once.
//!
//! Filesystems without flock support (some network and FUSE mounts, or
//! read-only forensic images exported over them) are read without a lock.
//!
//! # Example
//!
//! ```no_run
//! use cap_std::ambient_authority;
//! use cap_std::fs::Dir;
//! use ctrmeta_rs::lockfile::SharedLock;
//! use std::io::Read;
//! use std::time::Duration;
//!
//! let dir = Dir::open_ambient_dir("/var/lib/containerd/io.containerd.metadata.v1.bolt", ambient_authority())?;
//! let mut lock = SharedLock::acquire(dir.open("meta.db")?, Duration::from_secs(1))?;
//! let mut data = Vec::new();
//! lock.file_mut().read_to_end(&mut data)?;
//! drop(lock); // lock released
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::thread;
use std::time::{Duration, Instant};

use cap_std::fs::File;
use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;

/// Delay between non-blocking lock attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Error types for lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock operation failed.
    #[error("lock operation failed: {0}")]
    LockFailed(#[from] Errno),

    /// The lock was still held by another process when the timeout expired.
    #[error("lock not acquired within {0:?}")]
    WouldBlock(Duration),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// A file held under a shared `flock`. The lock is released on drop.
#[derive(Debug)]
pub struct SharedLock {
    file: File,
    locked: bool,
}

impl SharedLock {
    /// Take a shared lock on `file`, retrying until `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::WouldBlock`] if an exclusive holder keeps the
    /// lock past the timeout, or [`LockError::LockFailed`] for other errors.
    pub fn acquire(file: File, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match flock(&file, FlockOperation::NonBlockingLockShared) {
                Ok(()) => return Ok(Self { file, locked: true }),
                Err(e) if e == Errno::WOULDBLOCK || e == Errno::AGAIN => {
                    if Instant::now() >= deadline {
                        return Err(LockError::WouldBlock(timeout));
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    thread::sleep(RETRY_INTERVAL.min(remaining));
                }
                Err(e) if e == Errno::NOLCK || e == Errno::OPNOTSUPP || e == Errno::NOSYS => {
                    tracing::debug!(error = %e, "flock unsupported, reading without a lock");
                    return Ok(Self {
                        file,
                        locked: false,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether a lock is actually held.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The locked file.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        if self.locked {
            let _ = flock(&self.file, FlockOperation::Unlock);
        }
    }
}
