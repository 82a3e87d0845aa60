//! Test fixtures for isolated containerd installations.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use ctrmeta_rs::environment::{
    Environment, METADATA_DB_FILE, METADATA_PLUGIN_DIR, SNAPSHOTTER_DB_FILE, TASK_PLUGIN_DIR,
};
use ctrmeta_rs::fixture::{encode_spec, encode_time, encode_uvarint, encode_varint, BoltWriter, Tree};
use ctrmeta_rs::{Explorer, ExplorerConfig};

pub const PAGE_SIZE: usize = 4096;
const PAGE_FLAGS_OFFSET: usize = 8;
const FREELIST_PAGE_FLAG: u16 = 0x10;

/// An isolated containerd root and state directory.
///
/// Everything is removed when dropped.
pub struct TestHost {
    _temp_dir: TempDir,
    root: PathBuf,
    state: PathBuf,
}

impl TestHost {
    /// Create empty `root/` and `state/` directories.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("root");
        let state = temp_dir.path().join("state");
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(state.join(TASK_PLUGIN_DIR))?;
        Ok(Self {
            _temp_dir: temp_dir,
            root,
            state,
        })
    }

    /// A host populated with [`sample_metadata`] and its snapshotter stores.
    pub fn sample() -> color_eyre::Result<Self> {
        let host = Self::new()?;
        host.write_metadata(&sample_metadata())?;
        host.write_snapshotter("overlayfs", &sample_overlayfs())?;
        host.write_pid("k8s.io", "app-1", "31337\n")?;
        Ok(host)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &Path {
        &self.state
    }

    /// Configuration pointing at this host, including task state.
    pub fn config(&self) -> ExplorerConfig {
        ExplorerConfig {
            state: Some(self.state.clone()),
            lock_timeout_ms: 200,
            ..ExplorerConfig::with_root(&self.root)
        }
    }

    pub fn explorer(&self) -> color_eyre::Result<Explorer> {
        Ok(Explorer::open(self.config())?)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_PLUGIN_DIR).join(METADATA_DB_FILE)
    }

    pub fn snapshotter_root(&self, plugin: &str) -> PathBuf {
        Environment::new(self.config()).resolve_root(plugin)
    }

    /// Write the primary metadata store.
    pub fn write_metadata(&self, tree: &Tree) -> color_eyre::Result<()> {
        self.write_raw(&self.metadata_path(), &BoltWriter::new().write(tree))
    }

    /// Write a snapshotter's own store.
    pub fn write_snapshotter(&self, plugin: &str, tree: &Tree) -> color_eyre::Result<()> {
        let path = self.snapshotter_root(plugin).join(SNAPSHOTTER_DB_FILE);
        self.write_raw(&path, &BoltWriter::new().write(tree))
    }

    /// Write arbitrary bytes, creating parent directories.
    pub fn write_raw(&self, path: &Path, data: &[u8]) -> color_eyre::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Write the sample metadata plus a `broken` namespace whose containers
    /// page carries an invalid page type.
    pub fn write_broken_namespace(&self) -> color_eyre::Result<()> {
        let mut tree = sample_metadata();
        tree.path(&["v1", "broken", "containers", "only-in-broken-namespace"])
            .put("image", "busybox");
        let mut data = BoltWriter::new().inline_buckets(false).write(&tree);

        let page = data
            .chunks(PAGE_SIZE)
            .enumerate()
            .skip(3)
            .find(|(_, page)| {
                page.windows(b"only-in-broken-namespace".len())
                    .any(|w| w == b"only-in-broken-namespace")
            })
            .map(|(i, _)| i)
            .ok_or_else(|| color_eyre::eyre::eyre!("containers page not found"))?;
        let at = page * PAGE_SIZE + PAGE_FLAGS_OFFSET;
        data[at..at + 2].copy_from_slice(&FREELIST_PAGE_FLAG.to_le_bytes());
        self.write_raw(&self.metadata_path(), &data)
    }

    /// Record an `init.pid` for a task bundle.
    pub fn write_pid(&self, namespace: &str, id: &str, content: &str) -> color_eyre::Result<()> {
        let bundle = self.state.join(TASK_PLUGIN_DIR).join(namespace).join(id);
        self.write_raw(&bundle.join("init.pid"), content.as_bytes())
    }
}

/// Creation time used for every sample record.
pub fn sample_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26)
        .single()
        .unwrap_or_default()
}

/// Add a container with a runtime spec built from `spec_json`.
pub fn put_container<'a>(
    tree: &'a mut Tree,
    namespace: &str,
    id: &str,
    image: &str,
    spec_json: &str,
) -> &'a mut Tree {
    let bucket = tree.path(&["v1", namespace, "containers", id]);
    bucket
        .put("image", image)
        .put("createdat", encode_time(sample_time()))
        .put("updatedat", encode_time(sample_time()))
        .put("snapshotter", "overlayfs")
        .put("snapshotKey", id)
        .put("spec", encode_spec(spec_json));
    bucket.bucket("runtime").put("name", "io.containerd.runc.v2");
    bucket
}

/// Primary store of a small Kubernetes node.
///
/// - `k8s.io`: a workload container, a GKE support container, two images,
///   one blob, an ingest, three overlayfs snapshots and a lease
/// - `default`: one container on the `native` snapshotter
/// - `empty`: nothing
pub fn sample_metadata() -> Tree {
    let mut tree = Tree::new();

    put_container(
        &mut tree,
        "k8s.io",
        "app-1",
        "registry.example.com:5000/shop/web:v2",
        r#"{"ociVersion": "1.1.0", "hostname": "", "process": {"env": ["PATH=/usr/bin", "HOSTNAME=web-7d9f"]}}"#,
    )
    .bucket("labels")
    .put("io.cri-containerd.kind", "container")
    .put("io.kubernetes.pod.name", "web-7d9f");

    put_container(
        &mut tree,
        "k8s.io",
        "fluent-1",
        "gke.gcr.io/fluent-bit:v1.8.12-gke.3",
        r#"{"hostname": "gke-node-1"}"#,
    )
    .bucket("labels")
    .put("io.cri-containerd.kind", "container");

    let images = tree.path(&["v1", "k8s.io", "image"]);
    images
        .path(&["registry.example.com:5000/shop/web:v2", "target"])
        .put("digest", "sha256:1111")
        .put("mediatype", "application/vnd.oci.image.manifest.v1+json")
        .put("size", encode_varint(1024));
    images
        .path(&["gke.gcr.io/fluent-bit:v1.8.12-gke.3", "target"])
        .put("digest", "sha256:2222")
        .put("mediatype", "application/vnd.docker.distribution.manifest.v2+json")
        .put("size", encode_varint(2048));

    let content = tree.path(&["v1", "k8s.io", "content"]);
    content
        .path(&["blob", "sha256:1111"])
        .put("size", encode_varint(1024))
        .put("createdat", encode_time(sample_time()));
    content
        .path(&["ingests", "k8s.io-1-layer"])
        .put("ref", "k8s.io/1/layer-sha256:3333")
        .put("expected", "sha256:3333");

    let snaps = tree.path(&["v1", "k8s.io", "snapshots", "overlayfs"]);
    snaps
        .bucket("sha256:base")
        .put("name", "k8s.io/1/sha256:base")
        .put("createdat", encode_time(sample_time()));
    snaps
        .bucket("app-1")
        .put("name", "k8s.io/5/app-1")
        .put("parent", "sha256:base");
    snaps
        .bucket("fluent-1")
        .put("name", "k8s.io/6/fluent-1")
        .put("parent", "sha256:base");

    let lease = tree.path(&["v1", "k8s.io", "leases", "pull-1"]);
    lease.put("createdat", encode_time(sample_time()));
    lease.path(&["content"]).put("sha256:1111", "");
    lease.path(&["snapshots", "overlayfs"]).put("sha256:base", "");

    put_container(&mut tree, "default", "tool", "docker.io/library/busybox:1", "{}");
    tree.path(&["v1", "default", "snapshots", "native", "tool"])
        .put("name", "default/2/tool");

    tree.path(&["v1", "empty"]);
    tree
}

/// Store of the `overlayfs` snapshotter matching [`sample_metadata`].
///
/// Ids use both encodings containerd has written over time.
pub fn sample_overlayfs() -> Tree {
    let mut tree = Tree::new();
    let snaps = tree.path(&["v1", "snapshots"]);
    snaps
        .bucket("k8s.io/1/sha256:base")
        .put("id", 1u64.to_be_bytes())
        .put("kind", vec![3u8]);
    snaps
        .bucket("k8s.io/5/app-1")
        .put("id", encode_uvarint(5))
        .put("kind", vec![2u8])
        .put("parent", "k8s.io/1/sha256:base");
    snaps
        .bucket("k8s.io/6/fluent-1")
        .put("id", 6u64.to_be_bytes())
        .put("kind", vec![2u8])
        .put("parent", "k8s.io/1/sha256:base");
    tree
}
