//! Locating and opening containerd's bbolt stores.
//!
//! # Store Layout
//!
//! ```text
//! <root>/
//! ├── io.containerd.metadata.v1.bolt/
//! │   └── meta.db                        # primary metadata store
//! └── io.containerd.snapshotter.v1.<name>/
//!     ├── metadata.db                    # per-snapshotter store
//!     └── snapshots/<id>/fs              # overlay directories
//!
//! <state>/
//! └── io.containerd.runtime.v2.task/<namespace>/<container>/init.pid
//! ```
//!
//! Store files are opened through cap-std directory handles, read once under
//! a shared lock, and released before any decoding starts.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::bolt::{Db, Tx};
use crate::config::ExplorerConfig;
use crate::error::{MetaError, Result};
use crate::lockfile::{LockError, SharedLock};
use crate::schema::BUCKET_KEY_VERSION;

/// Plugin directory of the metadata store.
pub const METADATA_PLUGIN_DIR: &str = "io.containerd.metadata.v1.bolt";
/// Metadata store file name.
pub const METADATA_DB_FILE: &str = "meta.db";
/// Plugin type prefix for snapshotters.
pub const SNAPSHOTTER_PLUGIN_TYPE: &str = "io.containerd.snapshotter.v1";
/// Snapshotter store file name.
pub const SNAPSHOTTER_DB_FILE: &str = "metadata.db";
/// Plugin directory of the v2 task runtime under the state directory.
pub const TASK_PLUGIN_DIR: &str = "io.containerd.runtime.v2.task";

/// A bbolt store read into memory.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    db: Db,
}

fn open_error(path: &Path) -> impl Fn(std::io::Error) -> MetaError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MetaError::NotFound(path.to_path_buf())
        } else {
            MetaError::Io(e)
        }
    }
}

impl MetaStore {
    /// Open a store file read-only.
    ///
    /// # Errors
    ///
    /// - [`MetaError::NotFound`] if `path` does not exist
    /// - [`MetaError::Locked`] if a shared lock is not granted within `timeout`
    /// - [`MetaError::Corrupt`] if the file is not a bbolt store or has no
    ///   top-level `v1` bucket
    /// - [`MetaError::Io`] for anything else
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .ok_or_else(|| MetaError::NotFound(path.to_path_buf()))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(open_error(path))?;
        let file = dir.open(file_name).map_err(open_error(path))?;

        let mut lock = SharedLock::acquire(file, timeout).map_err(|e| match e {
            LockError::WouldBlock(_) => MetaError::Locked(path.to_path_buf()),
            LockError::LockFailed(errno) => MetaError::Io(errno.into()),
        })?;
        let mut data = Vec::new();
        lock.file_mut().read_to_end(&mut data)?;
        drop(lock);

        let store = Self::from_bytes(path, data)?;
        tracing::debug!(
            path = %path.display(),
            page_size = store.db.page_size(),
            txid = store.db.txid(),
            "opened store"
        );
        Ok(store)
    }

    /// Build a store from an in-memory file image.
    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<Self> {
        let path = path.into();
        let db = Db::from_bytes(data).map_err(|e| match e {
            MetaError::Corrupt(msg) => MetaError::corrupt(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        if db.begin().bucket(BUCKET_KEY_VERSION)?.is_none() {
            return Err(MetaError::corrupt(format!(
                "{}: missing top-level bucket {}",
                path.display(),
                String::from_utf8_lossy(BUCKET_KEY_VERSION)
            )));
        }
        Ok(Self { path, db })
    }

    /// Path the store was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Begin a read-only transaction.
    pub fn begin(&self) -> Tx<'_> {
        self.db.begin()
    }
}

/// Resolves store locations from an [`ExplorerConfig`].
#[derive(Debug, Clone)]
pub struct Environment {
    config: ExplorerConfig,
}

impl Environment {
    pub fn new(config: ExplorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    /// Path of the primary metadata store.
    pub fn metadata_db_path(&self) -> PathBuf {
        self.config.metadata_db.clone().unwrap_or_else(|| {
            self.config
                .root
                .join(METADATA_PLUGIN_DIR)
                .join(METADATA_DB_FILE)
        })
    }

    /// Open the primary metadata store.
    pub fn open_metadata(&self) -> Result<MetaStore> {
        MetaStore::open(self.metadata_db_path(), self.config.lock_timeout())
    }

    /// Root directory of the snapshotter plugin `plugin`.
    ///
    /// This is `<root>/io.containerd.snapshotter.v1.<plugin>`.
    pub fn resolve_root(&self, plugin: &str) -> PathBuf {
        self.config
            .root
            .join(format!("{SNAPSHOTTER_PLUGIN_TYPE}.{plugin}"))
    }

    /// Open a snapshotter's own store, returning its root alongside.
    ///
    /// # Errors
    ///
    /// Plugin names that would escape the installation root are rejected
    /// as [`MetaError::Corrupt`]; otherwise as [`MetaStore::open`].
    pub fn open_snapshotter(&self, plugin: &str) -> Result<(PathBuf, MetaStore)> {
        if !is_plain_name(plugin) {
            return Err(MetaError::corrupt(format!(
                "invalid snapshotter name {plugin:?}"
            )));
        }
        let root = self.resolve_root(plugin);
        let store = MetaStore::open(root.join(SNAPSHOTTER_DB_FILE), self.config.lock_timeout())?;
        Ok((root, store))
    }

    /// Task state directory, when a state root is configured and present.
    pub fn task_state(&self) -> Option<TaskState> {
        let state = self.config.state.as_ref()?;
        let path = state.join(TASK_PLUGIN_DIR);
        match Dir::open_ambient_dir(&path, ambient_authority()) {
            Ok(dir) => Some(TaskState { dir }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "task state directory unavailable");
                None
            }
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Handle on `<state>/io.containerd.runtime.v2.task`.
#[derive(Debug)]
pub struct TaskState {
    dir: Dir,
}

/// Outcome of reading a task's recorded pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedPid {
    /// `init.pid` holds this pid.
    Pid(u32),
    /// No bundle or no `init.pid`.
    Missing,
    /// `init.pid` exists but does not hold a pid.
    Malformed,
}

impl TaskState {
    /// Read `<namespace>/<id>/init.pid`.
    pub fn recorded_pid(&self, namespace: &str, id: &str) -> RecordedPid {
        if !is_plain_name(namespace) || !is_plain_name(id) {
            return RecordedPid::Missing;
        }
        let bundle = match self.dir.open_dir(namespace).and_then(|d| d.open_dir(id)) {
            Ok(dir) => dir,
            Err(_) => return RecordedPid::Missing,
        };
        match bundle.read_to_string("init.pid") {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) => RecordedPid::Pid(pid),
                Err(_) => RecordedPid::Malformed,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecordedPid::Missing,
            Err(e) => {
                tracing::warn!(namespace, id, error = %e, "cannot read init.pid");
                RecordedPid::Malformed
            }
        }
    }
}
