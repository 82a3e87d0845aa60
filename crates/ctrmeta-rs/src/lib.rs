#![forbid(unsafe_code)]
//! Read-only forensic access to containerd metadata stores.
//!
//! containerd records namespaces, containers, images, content, snapshots
//! and leases in a bbolt database of nested buckets, and each snapshotter
//! keeps its own bbolt store next to the directories it manages. This
//! library decodes both without a Go toolchain and without ever writing to
//! them, which makes it usable against a live host or a mounted disk image.
//!
//! # Overview
//!
//! - Store files are opened through `cap_std::fs::Dir` handles under a
//!   shared `flock`, read once, and released
//! - [`bolt`] parses the bbolt page format from the in-memory copy
//! - [`schema`] knows containerd's bucket layout and treats absence as
//!   `None` at every level
//! - one module per record kind decodes the typed records
//! - [`Explorer`] ties them together, one read transaction per listing
//!
//! Damage is contained: a field that fails to decode is reported with a
//! `tracing` warning and left empty, a damaged namespace is skipped, and
//! only an unusable store file is an error.
//!
//! # Example
//!
//! ```no_run
//! use ctrmeta_rs::{Explorer, ExplorerConfig};
//!
//! let explorer = Explorer::open(ExplorerConfig::discover()?)?;
//! for snapshot in explorer.list_snapshots()?.records {
//!     if let Some(path) = &snapshot.overlay_path {
//!         println!("{} {}", snapshot.key, path.display());
//!     }
//! }
//! # Ok::<(), ctrmeta_rs::MetaError>(())
//! ```
//!
//! # Command-Line Tool
//!
//! The `ctrmeta` binary renders every listing as a table or JSON:
//!
//! ```bash
//! ctrmeta --root /mnt/evidence/var/lib/containerd list containers
//! ctrmeta list snapshots --output json
//! ```

// Store access
pub mod bolt;
pub mod config;
pub mod environment;
pub mod error;
pub mod lockfile;

// Decoding
pub mod codec;
pub mod schema;

// Records
pub mod container;
pub mod content;
pub mod image;
pub mod lease;
pub mod namespace;
pub mod snapshot;
pub mod support;
pub mod task;

pub mod explorer;

#[cfg(any(test, feature = "fixture"))]
pub mod fixture;

pub use config::ExplorerConfig;
pub use container::Container;
pub use content::{Content, Ingest};
pub use environment::{Environment, MetaStore};
pub use error::{ErrorKind, MetaError, Result};
pub use explorer::{Explorer, NamespaceOutcome, NamespaceScan, Outcome};
pub use image::{Descriptor, Image};
pub use lease::Lease;
pub use namespace::Namespace;
pub use snapshot::{Snapshot, SnapshotKind};
pub use support::SupportClassifier;
pub use task::{Task, TaskStatus};
