//! Leases from `v1/<ns>/leases/<id>`.
//!
//! A lease is reported as an open JSON object rather than a fixed struct:
//! `ID`, `CreatedAt`, `Labels` and `Namespace` are always present, and the
//! resource lists `Content`, `Snapshots` and `Ingests` appear only when the
//! lease holds something of that kind.

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::bolt::{Bucket, Tx};
use crate::error::Result;
use crate::schema::{self, *};

/// A lease as an ordered JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Lease(pub Map<String, Value>);

impl Lease {
    pub fn id(&self) -> &str {
        self.str_field("ID")
    }

    pub fn namespace(&self) -> &str {
        self.str_field("Namespace")
    }

    fn str_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

fn key_list(bucket: &Bucket<'_>, what: &str) -> Vec<Value> {
    match bucket.entries() {
        Ok(entries) => entries
            .into_iter()
            .map(|e| Value::String(schema::key_string(e.key)))
            .collect(),
        Err(e) => {
            tracing::warn!(resource = what, error = %e, "unreadable lease resources");
            Vec::new()
        }
    }
}

fn child<'a>(bucket: &Bucket<'a>, key: &[u8]) -> Option<Bucket<'a>> {
    match bucket.bucket(key) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(bucket = %String::from_utf8_lossy(key), error = %e, "unreadable lease bucket");
            None
        }
    }
}

fn read_lease(namespace: &str, id: String, bucket: &Bucket<'_>) -> Lease {
    let mut map = Map::new();
    map.insert("ID".into(), Value::String(id));
    let created = schema::read_time(bucket, BUCKET_KEY_CREATED_AT)
        .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        .unwrap_or(Value::Null);
    map.insert("CreatedAt".into(), created);
    let labels = schema::read_labels(bucket)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    map.insert("Labels".into(), Value::Object(labels));
    map.insert("Namespace".into(), Value::String(namespace.to_string()));

    if let Some(content) = child(bucket, BUCKET_KEY_OBJECT_CONTENT) {
        let digests = key_list(&content, "content");
        if !digests.is_empty() {
            map.insert("Content".into(), Value::Array(digests));
        }
    }
    if let Some(snapshots) = child(bucket, BUCKET_KEY_OBJECT_SNAPSHOTS) {
        let mut by_snapshotter = Map::new();
        match schema::sub_buckets(&snapshots) {
            Ok(groups) => {
                for (snapshotter, keys) in groups {
                    by_snapshotter.insert(snapshotter, Value::Array(key_list(&keys, "snapshots")));
                }
            }
            Err(e) => tracing::warn!(namespace, error = %e, "unreadable lease snapshots"),
        }
        if !by_snapshotter.is_empty() {
            map.insert("Snapshots".into(), Value::Object(by_snapshotter));
        }
    }
    if let Some(ingests) = child(bucket, BUCKET_KEY_OBJECT_INGESTS) {
        let refs = key_list(&ingests, "ingests");
        if !refs.is_empty() {
            map.insert("Ingests".into(), Value::Array(refs));
        }
    }
    Lease(map)
}

/// Leases of one namespace in id order.
pub fn list_leases(tx: &Tx<'_>, namespace: &str) -> Result<Vec<Lease>> {
    let Some(leases) = schema::namespace_bucket(tx, namespace, &[BUCKET_KEY_OBJECT_LEASES])? else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&leases)?
        .into_iter()
        .map(|(id, bucket)| read_lease(namespace, id, &bucket))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::Db;
    use crate::fixture::{encode_time, BoltWriter, Tree};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_list_leases() {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut tree = Tree::new();
        let leases = tree.path(&["v1", "k8s.io", "leases"]);
        let pull = leases.bucket("pull-1");
        pull.put("createdat", encode_time(created));
        pull.bucket("labels").put("containerd.io/gc.expire", "2024-06-01T13:00:00Z");
        pull.path(&["content", "sha256:aaaa"]);
        pull.path(&["snapshots", "overlayfs"]).put("extract-1", "");
        leases.bucket("empty");

        let db = Db::from_bytes(BoltWriter::new().write(&tree)).unwrap();
        let list = list_leases(&db.begin(), "k8s.io").unwrap();
        assert_eq!(list.len(), 2);

        let empty = &list[0];
        assert_eq!(empty.id(), "empty");
        assert_eq!(empty.get("CreatedAt"), Some(&Value::Null));
        assert!(empty.get("Content").is_none());

        let pull = &list[1];
        assert_eq!(pull.id(), "pull-1");
        assert_eq!(pull.namespace(), "k8s.io");
        assert_eq!(pull.get("CreatedAt").unwrap(), "2024-06-01T12:00:00Z");
        assert_eq!(pull.get("Content").unwrap(), &serde_json::json!(["sha256:aaaa"]));
        assert_eq!(
            pull.get("Snapshots").unwrap(),
            &serde_json::json!({"overlayfs": ["extract-1"]})
        );
        assert_eq!(
            pull.get("Labels").unwrap()["containerd.io/gc.expire"],
            "2024-06-01T13:00:00Z"
        );
        assert!(pull.get("Ingests").is_none());

        assert!(list_leases(&db.begin(), "default").unwrap().is_empty());
    }
}
