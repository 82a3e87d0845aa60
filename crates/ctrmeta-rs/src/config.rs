//! Configuration for locating containerd state on a host or disk image.
//!
//! # Overview
//!
//! containerd keeps persistent state under a single installation root
//! (`/var/lib/containerd` by default) and transient task state under a
//! state directory (`/run/containerd`). When inspecting a mounted image the
//! root is usually something like `/mnt/evidence/var/lib/containerd`.
//!
//! The configuration uses TOML:
//!
//! ```toml
//! root = "/mnt/evidence/var/lib/containerd"
//! state = "/mnt/evidence/run/containerd"
//!
//! # Optional explicit path to the metadata database
//! metadata_db = "/cases/42/meta.db"
//!
//! # How long to wait for a shared lock on a store file
//! lock_timeout_ms = 1000
//! ```
//!
//! # Discovery
//!
//! [`ExplorerConfig::discover()`] searches, in order:
//! 1. `$CTRMETA_CONFIG`
//! 2. `/etc/ctrmeta/config.toml`
//!
//! and falls back to defaults when neither exists. `$CTRMETA_ROOT`, if set,
//! then overrides `root`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MetaError, Result};

/// Default containerd installation root.
pub const DEFAULT_ROOT: &str = "/var/lib/containerd";

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/ctrmeta/config.toml";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

/// Where to find containerd state and how to open it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorerConfig {
    /// containerd installation root.
    pub root: PathBuf,

    /// Explicit metadata database; derived from `root` when unset.
    pub metadata_db: Option<PathBuf>,

    /// containerd state directory holding task bundles. Task pids and
    /// statuses are only reported when this is set.
    pub state: Option<PathBuf>,

    /// Upper bound on waiting for a shared lock on any store file.
    pub lock_timeout_ms: u64,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            metadata_db: None,
            state: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl ExplorerConfig {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| MetaError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Discover configuration from the environment and default locations.
    pub fn discover() -> Result<Self> {
        let mut config = match Self::search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::load(&path)?
            }
            None => Self::default(),
        };
        if let Ok(root) = env::var("CTRMETA_ROOT") {
            config.root = PathBuf::from(root);
        }
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = env::var("CTRMETA_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from(SYSTEM_CONFIG_PATH));
        paths
    }

    /// Configuration rooted at `root` with defaults for everything else.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
