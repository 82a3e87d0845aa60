//! Entry point for listing everything in a containerd installation.
//!
//! Every `list_*` call takes one read transaction on the primary store,
//! walks each namespace, and reports per namespace whether records were
//! found. A namespace whose subtree is damaged is reported as failed and
//! the scan moves on.
//!
//! # Example
//!
//! ```no_run
//! use ctrmeta_rs::{Explorer, ExplorerConfig};
//!
//! let explorer = Explorer::open(ExplorerConfig::with_root("/mnt/evidence/var/lib/containerd"))?;
//! for c in explorer.list_containers()?.records {
//!     println!("{}/{} {}", c.namespace, c.id, c.hostname);
//! }
//! # Ok::<(), ctrmeta_rs::MetaError>(())
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

use crate::bolt::Tx;
use crate::config::ExplorerConfig;
use crate::container::{self, Container};
use crate::content::{self, Content, Ingest};
use crate::environment::{Environment, MetaStore};
use crate::error::{ErrorKind, Result};
use crate::image::{self, Image};
use crate::lease::{self, Lease};
use crate::namespace::{self, Namespace};
use crate::snapshot::{self, Snapshot};
use crate::support::SupportClassifier;
use crate::task::{self, Task};

/// What scanning one namespace produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// This many records were found.
    Records(usize),
    /// The namespace holds nothing of this kind.
    Empty,
    /// The namespace subtree could not be read.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceOutcome {
    pub namespace: String,
    pub outcome: Outcome,
}

/// Records of one kind across all namespaces.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceScan<T> {
    /// Records in namespace order, then key order.
    pub records: Vec<T>,
    pub namespaces: Vec<NamespaceOutcome>,
}

impl<T> NamespaceScan<T> {
    /// Namespaces that contributed no records.
    pub fn empty_namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces
            .iter()
            .filter(|n| n.outcome == Outcome::Empty)
            .map(|n| n.namespace.as_str())
    }

    /// Namespaces that could not be read, with the reason.
    pub fn failed_namespaces(&self) -> impl Iterator<Item = (&str, &str)> {
        self.namespaces.iter().filter_map(|n| match &n.outcome {
            Outcome::Failed(reason) => Some((n.namespace.as_str(), reason.as_str())),
            _ => None,
        })
    }

    fn map<U>(self, f: impl FnOnce(Vec<T>) -> Vec<U>) -> NamespaceScan<U> {
        NamespaceScan {
            records: f(self.records),
            namespaces: self.namespaces,
        }
    }
}

/// Read-only view of a containerd installation.
#[derive(Debug)]
pub struct Explorer {
    env: Environment,
    store: MetaStore,
    classifier: SupportClassifier,
}

impl Explorer {
    /// Open the primary metadata store described by `config`.
    pub fn open(config: ExplorerConfig) -> Result<Self> {
        let env = Environment::new(config);
        let store = env.open_metadata()?;
        Ok(Self::from_store(env, store))
    }

    /// Use an already opened primary store.
    pub fn from_store(env: Environment, store: MetaStore) -> Self {
        Self {
            env,
            store,
            classifier: SupportClassifier::default(),
        }
    }

    /// Replace the support image classifier.
    pub fn with_classifier(mut self, classifier: SupportClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    /// Root directory of a snapshotter plugin.
    pub fn snapshot_root(&self, snapshotter: &str) -> PathBuf {
        self.env.resolve_root(snapshotter)
    }

    /// Namespace names.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        namespace::list_namespaces(&self.store.begin())
    }

    /// Namespaces with their labels.
    pub fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        namespace::list_namespace_records(&self.store.begin())
    }

    fn scan<T>(
        &self,
        kind: &str,
        decode: impl Fn(&Tx<'_>, &str) -> Result<Vec<T>>,
    ) -> Result<NamespaceScan<T>> {
        let tx = self.store.begin();
        let names = namespace::list_namespaces(&tx)?;
        if names.is_empty() {
            tracing::info!(path = %self.store.path().display(), "no namespaces in store");
        }
        let mut records = Vec::new();
        let mut namespaces = Vec::with_capacity(names.len());
        for name in names {
            let outcome = match decode(&tx, &name) {
                Ok(found) if found.is_empty() => {
                    tracing::debug!(namespace = %name, kind, "nothing found");
                    Outcome::Empty
                }
                Ok(found) => {
                    let n = found.len();
                    records.extend(found);
                    Outcome::Records(n)
                }
                Err(e) => {
                    tracing::warn!(namespace = %name, kind, error = %e, "skipping namespace");
                    Outcome::Failed(e.to_string())
                }
            };
            namespaces.push(NamespaceOutcome {
                namespace: name,
                outcome,
            });
        }
        Ok(NamespaceScan {
            records,
            namespaces,
        })
    }

    pub fn list_containers(&self) -> Result<NamespaceScan<Container>> {
        self.scan("containers", |tx, ns| {
            container::list_containers(tx, ns, &self.classifier)
        })
    }

    pub fn list_images(&self) -> Result<NamespaceScan<Image>> {
        self.scan("images", |tx, ns| image::list_images(tx, ns, &self.classifier))
    }

    pub fn list_content(&self) -> Result<NamespaceScan<Content>> {
        self.scan("content", content::list_content)
    }

    pub fn list_ingests(&self) -> Result<NamespaceScan<Ingest>> {
        self.scan("ingests", content::list_ingests)
    }

    pub fn list_leases(&self) -> Result<NamespaceScan<Lease>> {
        self.scan("leases", lease::list_leases)
    }

    /// Tasks derived from containers, with pids when a state root is set.
    pub fn list_tasks(&self) -> Result<NamespaceScan<Task>> {
        Ok(self
            .list_containers()?
            .map(|containers| self.tasks_of(&containers)))
    }

    /// The task of each container in `containers`, in the same order.
    pub fn tasks_of(&self, containers: &[Container]) -> Vec<Task> {
        task::tasks_for(containers, self.env.task_state().as_ref())
    }

    /// Snapshots with ids and overlay paths resolved from each
    /// snapshotter's own store.
    ///
    /// A snapshotter whose store is missing or corrupt leaves its snapshots
    /// with primary-store data only.
    ///
    /// # Errors
    ///
    /// Lock contention and I/O failures on a snapshotter store are fatal,
    /// as they are on the primary store.
    pub fn list_snapshots(&self) -> Result<NamespaceScan<Snapshot>> {
        let mut scan = self.scan("snapshots", snapshot::list_snapshots)?;
        let groups: Vec<(String, BTreeSet<usize>)> =
            snapshot::group_by_snapshotter(&scan.records)
                .into_iter()
                .map(|(name, idx)| (name.to_string(), idx.into_iter().collect()))
                .collect();

        for (snapshotter, indices) in groups {
            let (root, store) = match self.env.open_snapshotter(&snapshotter) {
                Ok(opened) => opened,
                Err(e) if e.kind() == ErrorKind::PlatformFailure => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        snapshotter = %snapshotter,
                        snapshots = indices.len(),
                        error = %e,
                        "snapshotter store unavailable"
                    );
                    continue;
                }
            };
            tracing::debug!(
                snapshotter = %snapshotter,
                root = %root.display(),
                db = %store.path().display(),
                "resolving snapshots"
            );
            let tx = store.begin();
            let members = scan
                .records
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| indices.contains(i))
                .map(|(_, s)| s);
            snapshot::attach_backend(members, &root, &tx);
        }

        for orphan in snapshot::orphaned_parents(&scan.records) {
            tracing::warn!(
                namespace = %orphan.namespace,
                snapshotter = %orphan.snapshotter,
                key = %orphan.key,
                parent = %orphan.parent,
                "snapshot parent not found"
            );
        }
        Ok(scan)
    }
}
