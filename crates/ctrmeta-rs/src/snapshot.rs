//! Snapshot records and their on-disk locations.
//!
//! A snapshot lives in two stores. The primary metadata store records it
//! per namespace under `v1/<ns>/snapshots/<snapshotter>/<key>`, with `name`
//! pointing at the key the snapshotter itself uses. The snapshotter's own
//! store keeps `v1/snapshots/<name>` with the sequence id that names the
//! snapshot's directory:
//!
//! ```text
//! <snapshotter root>/snapshots/<id>/fs
//! ```
//!
//! Listing is done in two passes: [`list_snapshots`] reads the primary
//! records, then [`attach_backend`] fills in kind, id and path from each
//! snapshotter store, grouped by [`group_by_snapshotter`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bolt::{Bucket, Tx};
use crate::codec::{self, CodecError, SEQUENCE_ID_LEN};
use crate::error::Result;
use crate::schema::{self, *};

/// Lifecycle state recorded by a snapshotter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SnapshotKind {
    #[default]
    Unknown,
    View,
    Active,
    Committed,
}

impl SnapshotKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::View,
            2 => Self::Active,
            3 => Self::Committed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::View => "View",
            Self::Active => "Active",
            Self::Committed => "Committed",
        };
        f.write_str(s)
    }
}

/// A snapshot as seen from one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub namespace: String,
    pub snapshotter: String,
    /// Key within the namespace.
    pub key: String,
    /// Key within the snapshotter store.
    pub name: String,
    pub kind: SnapshotKind,
    /// Parent key within the namespace, empty for a base layer.
    pub parent: String,
    /// Parent name within the snapshotter store.
    pub backend_parent: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    /// Sequence id assigned by the snapshotter.
    pub id: Option<u64>,
    pub overlay_path: Option<PathBuf>,
}

/// What a snapshotter store records about one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendDetail {
    pub id: Option<u64>,
    pub kind: SnapshotKind,
    pub parent: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

/// Decode a snapshot sequence id.
///
/// Exactly eight bytes are a big-endian integer. Anything else is read as
/// the unsigned varint containerd's snapshotter stores.
pub fn decode_snapshot_id(raw: &[u8]) -> std::result::Result<u64, CodecError> {
    if raw.len() == SEQUENCE_ID_LEN {
        codec::decode_u64_be(raw)
    } else {
        codec::decode_uvarint(raw)
    }
}

/// Directory holding a snapshot's filesystem.
pub fn overlay_path(root: impl AsRef<Path>, id: u64) -> PathBuf {
    root.as_ref()
        .join("snapshots")
        .join(id.to_string())
        .join("fs")
}

fn read_snapshot(namespace: &str, snapshotter: &str, key: String, bucket: &Bucket<'_>) -> Snapshot {
    Snapshot {
        namespace: namespace.to_string(),
        snapshotter: snapshotter.to_string(),
        name: schema::read_string(bucket, BUCKET_KEY_NAME),
        kind: SnapshotKind::Unknown,
        parent: schema::read_string(bucket, BUCKET_KEY_PARENT),
        backend_parent: String::new(),
        created_at: schema::read_time(bucket, BUCKET_KEY_CREATED_AT),
        updated_at: schema::read_time(bucket, BUCKET_KEY_UPDATED_AT),
        labels: schema::read_labels(bucket),
        id: None,
        overlay_path: None,
        key,
    }
}

/// Primary-store snapshot records of one namespace, by snapshotter then key.
///
/// Kind, id and path are left unset until [`attach_backend`] runs.
pub fn list_snapshots(tx: &Tx<'_>, namespace: &str) -> Result<Vec<Snapshot>> {
    let Some(snapshotters) =
        schema::namespace_bucket(tx, namespace, &[BUCKET_KEY_OBJECT_SNAPSHOTS])?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for (snapshotter, bucket) in schema::sub_buckets(&snapshotters)? {
        let keys = match schema::sub_buckets(&bucket) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(namespace, snapshotter, error = %e, "skipping damaged snapshotter bucket");
                continue;
            }
        };
        out.extend(
            keys.into_iter()
                .map(|(key, b)| read_snapshot(namespace, &snapshotter, key, &b)),
        );
    }
    Ok(out)
}

/// Read `v1/snapshots/<name>` from a snapshotter store.
pub fn read_detail(tx: &Tx<'_>, name: &str) -> Result<Option<BackendDetail>> {
    let Some(bucket) = schema::navigate(
        tx,
        &[BUCKET_KEY_VERSION, BUCKET_KEY_OBJECT_SNAPSHOTS, name.as_bytes()],
    )?
    else {
        return Ok(None);
    };
    let id = match schema::read_field(&bucket, BUCKET_KEY_ID).map(decode_snapshot_id) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => {
            tracing::warn!(name, error = %e, "corrupt snapshot id");
            None
        }
        None => {
            tracing::warn!(name, "snapshot has no id");
            None
        }
    };
    let kind = schema::read_field(&bucket, BUCKET_KEY_KIND)
        .and_then(|raw| raw.first().copied())
        .map_or(SnapshotKind::Unknown, SnapshotKind::from_byte);
    Ok(Some(BackendDetail {
        id,
        kind,
        parent: schema::read_string(&bucket, BUCKET_KEY_PARENT),
        created_at: schema::read_time(&bucket, BUCKET_KEY_CREATED_AT),
        updated_at: schema::read_time(&bucket, BUCKET_KEY_UPDATED_AT),
        labels: schema::read_labels(&bucket),
    }))
}

/// Indices of `snapshots` grouped by snapshotter name.
pub fn group_by_snapshotter(snapshots: &[Snapshot]) -> BTreeMap<&str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, s) in snapshots.iter().enumerate() {
        groups.entry(s.snapshotter.as_str()).or_default().push(i);
    }
    groups
}

/// Fill in backend details for `snapshots` from one snapshotter store.
///
/// `root` is the snapshotter's root directory and `tx` a transaction on its
/// store. Records without a backend entry keep their primary data.
pub fn attach_backend<'s>(
    snapshots: impl IntoIterator<Item = &'s mut Snapshot>,
    root: &Path,
    tx: &Tx<'_>,
) {
    for snapshot in snapshots {
        let detail = match read_detail(tx, &snapshot.name) {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                tracing::warn!(
                    namespace = %snapshot.namespace,
                    key = %snapshot.key,
                    name = %snapshot.name,
                    "snapshot missing from snapshotter store"
                );
                continue;
            }
            Err(e) => {
                tracing::warn!(name = %snapshot.name, error = %e, "unreadable snapshot entry");
                continue;
            }
        };
        snapshot.kind = detail.kind;
        snapshot.id = detail.id;
        snapshot.overlay_path = detail.id.map(|id| overlay_path(root, id));
        snapshot.backend_parent = detail.parent;
        if snapshot.created_at.is_none() {
            snapshot.created_at = detail.created_at;
        }
        if snapshot.updated_at.is_none() {
            snapshot.updated_at = detail.updated_at;
        }
        for (k, v) in detail.labels {
            snapshot.labels.entry(k).or_insert(v);
        }
    }
}

/// Snapshots whose parent key is not present in their own
/// (namespace, snapshotter) scope.
pub fn orphaned_parents(snapshots: &[Snapshot]) -> Vec<&Snapshot> {
    let keys: BTreeSet<(&str, &str, &str)> = snapshots
        .iter()
        .map(|s| (s.namespace.as_str(), s.snapshotter.as_str(), s.key.as_str()))
        .collect();
    snapshots
        .iter()
        .filter(|s| {
            !s.parent.is_empty()
                && !keys.contains(&(s.namespace.as_str(), s.snapshotter.as_str(), s.parent.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::Db;
    use crate::fixture::{encode_uvarint, BoltWriter, Tree};

    #[test]
    fn test_overlay_path() {
        assert_eq!(
            overlay_path("/var/lib/plugins/overlayfs", 42),
            PathBuf::from("/var/lib/plugins/overlayfs/snapshots/42/fs")
        );
    }

    #[test]
    fn test_decode_snapshot_id() {
        for id in [0u64, 1, 42, u64::MAX] {
            assert_eq!(decode_snapshot_id(&id.to_be_bytes()).unwrap(), id);
        }
        assert_eq!(decode_snapshot_id(&encode_uvarint(300)).unwrap(), 300);
        assert_eq!(decode_snapshot_id(&[7]).unwrap(), 7);
        assert!(decode_snapshot_id(&[]).is_err());
        assert!(decode_snapshot_id(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_kind_from_byte() {
        assert_eq!(SnapshotKind::from_byte(0), SnapshotKind::Unknown);
        assert_eq!(SnapshotKind::from_byte(1), SnapshotKind::View);
        assert_eq!(SnapshotKind::from_byte(2), SnapshotKind::Active);
        assert_eq!(SnapshotKind::from_byte(3), SnapshotKind::Committed);
        assert_eq!(SnapshotKind::from_byte(9), SnapshotKind::Unknown);
        assert_eq!(SnapshotKind::Committed.to_string(), "Committed");
    }

    fn primary() -> Db {
        let mut tree = Tree::new();
        let snaps = tree.path(&["v1", "default", "snapshots"]);
        snaps
            .path(&["overlayfs", "base"])
            .put("name", "default/1/base");
        snaps
            .path(&["overlayfs", "top"])
            .put("name", "default/2/top")
            .put("parent", "base");
        snaps
            .path(&["overlayfs", "broken"])
            .put("name", "default/3/broken")
            .put("parent", "gone");
        snaps.path(&["native", "n1"]).put("name", "default/4/n1");
        Db::from_bytes(BoltWriter::new().write(&tree)).unwrap()
    }

    #[test]
    fn test_list_and_group() {
        let db = primary();
        let list = list_snapshots(&db.begin(), "default").unwrap();
        let keys: Vec<_> = list.iter().map(|s| (s.snapshotter.as_str(), s.key.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                ("native", "n1"),
                ("overlayfs", "base"),
                ("overlayfs", "broken"),
                ("overlayfs", "top"),
            ]
        );
        let groups = group_by_snapshotter(&list);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["overlayfs"], vec![1, 2, 3]);

        let orphans = orphaned_parents(&list);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].key, "broken");

        assert!(list_snapshots(&db.begin(), "nope").unwrap().is_empty());
    }

    #[test]
    fn test_attach_backend() {
        let db = primary();
        let mut list = list_snapshots(&db.begin(), "default").unwrap();

        let mut tree = Tree::new();
        let snaps = tree.path(&["v1", "snapshots"]);
        snaps
            .bucket("default/1/base")
            .put("id", 1u64.to_be_bytes())
            .put("kind", vec![3u8]);
        snaps
            .bucket("default/2/top")
            .put("id", encode_uvarint(2))
            .put("kind", vec![2u8])
            .put("parent", "default/1/base");
        snaps
            .bucket("default/3/broken")
            .put("id", vec![0xffu8, 0xff])
            .put("kind", vec![1u8]);
        let backend = Db::from_bytes(BoltWriter::new().write(&tree)).unwrap();

        let root = Path::new("/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs");
        let groups = group_by_snapshotter(&list);
        let idx = groups["overlayfs"].clone();
        attach_backend(
            list.iter_mut()
                .enumerate()
                .filter(|(i, _)| idx.contains(i))
                .map(|(_, s)| s),
            root,
            &backend.begin(),
        );

        let base = &list[1];
        assert_eq!(base.kind, SnapshotKind::Committed);
        assert_eq!(base.id, Some(1));
        assert_eq!(base.overlay_path, Some(root.join("snapshots/1/fs")));

        let broken = &list[2];
        assert_eq!(broken.kind, SnapshotKind::View);
        assert_eq!(broken.id, None);
        assert_eq!(broken.overlay_path, None);

        let top = &list[3];
        assert_eq!(top.id, Some(2));
        assert_eq!(top.backend_parent, "default/1/base");

        let native = &list[0];
        assert_eq!(native.kind, SnapshotKind::Unknown);
        assert_eq!(native.id, None);
    }
}
