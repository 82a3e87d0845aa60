//! Container records from `v1/<ns>/containers/<id>`.
//!
//! The stored runtime spec is decoded only far enough to recover the
//! hostname the container was configured with.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bolt::{Bucket, Tx};
use crate::codec;
use crate::error::{MetaError, Result};
use crate::schema::{self, *};
use crate::support::SupportClassifier;

/// Label the CRI plugin sets to `sandbox` or `container`.
pub const CRI_KIND_LABEL: &str = "io.cri-containerd.kind";

/// Namespace the Docker engine uses for its containers.
pub const DOCKER_NAMESPACE: &str = "moby";

/// A container as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Container {
    pub namespace: String,
    pub id: String,
    pub image: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    /// Hostname from the runtime spec, possibly empty.
    pub hostname: String,
    pub support_container: bool,
    /// `sandbox`, `container`, `docker` or empty.
    pub container_type: String,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub runtime: String,
    pub sandbox_id: String,
}

/// The parts of an OCI runtime spec that are inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

/// Decode the protobuf `Any` envelope around a JSON runtime spec.
pub fn decode_spec(raw: &[u8]) -> Result<RuntimeSpec> {
    let any = codec::decode_any(raw)?;
    if any.value.is_empty() {
        return Err(MetaError::corrupt(format!(
            "empty spec payload (type {})",
            any.type_url
        )));
    }
    Ok(serde_json::from_slice(&any.value)?)
}

/// The hostname a container was configured with.
///
/// The explicit `hostname` wins; otherwise the first `HOSTNAME=` entry in
/// the process environment.
pub fn resolve_hostname(spec: &RuntimeSpec) -> String {
    if let Some(hostname) = spec.hostname.as_deref().filter(|h| !h.is_empty()) {
        return hostname.to_string();
    }
    spec.process
        .as_ref()
        .and_then(|p| p.env.as_ref())
        .and_then(|env| env.iter().find_map(|kv| kv.strip_prefix("HOSTNAME=")))
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

/// Classify a container from its labels and namespace.
pub fn container_type(namespace: &str, labels: &BTreeMap<String, String>) -> String {
    if let Some(kind) = labels.get(CRI_KIND_LABEL) {
        return kind.clone();
    }
    if namespace == DOCKER_NAMESPACE || labels.keys().any(|k| k.starts_with("com.docker.")) {
        return "docker".to_string();
    }
    String::new()
}

fn spec_hostname(namespace: &str, id: &str, bucket: &Bucket<'_>) -> String {
    let Some(raw) = schema::read_field(bucket, BUCKET_KEY_SPEC) else {
        tracing::info!(namespace, id, "container has no runtime spec");
        return String::new();
    };
    match decode_spec(raw) {
        Ok(spec) => resolve_hostname(&spec),
        Err(e) => {
            tracing::warn!(namespace, id, error = %e, "undecodable runtime spec");
            String::new()
        }
    }
}

fn read_container(
    namespace: &str,
    id: String,
    bucket: &Bucket<'_>,
    classifier: &SupportClassifier,
) -> Container {
    let image = schema::read_string(bucket, BUCKET_KEY_IMAGE);
    let labels = schema::read_labels(bucket);
    let runtime = match bucket.bucket(BUCKET_KEY_RUNTIME) {
        Ok(Some(rt)) => schema::read_string(&rt, BUCKET_KEY_NAME),
        Ok(None) => String::new(),
        Err(e) => {
            tracing::warn!(namespace, id, error = %e, "unreadable runtime bucket");
            String::new()
        }
    };
    Container {
        hostname: spec_hostname(namespace, &id, bucket),
        support_container: classifier.is_support_image(&image),
        container_type: container_type(namespace, &labels),
        created_at: schema::read_time(bucket, BUCKET_KEY_CREATED_AT),
        updated_at: schema::read_time(bucket, BUCKET_KEY_UPDATED_AT),
        snapshotter: schema::read_string(bucket, BUCKET_KEY_SNAPSHOTTER),
        snapshot_key: schema::read_string(bucket, BUCKET_KEY_SNAPSHOT_KEY),
        sandbox_id: schema::read_string(bucket, BUCKET_KEY_SANDBOX_ID),
        namespace: namespace.to_string(),
        runtime,
        labels,
        image,
        id,
    }
}

/// Containers of one namespace in id order.
pub fn list_containers(
    tx: &Tx<'_>,
    namespace: &str,
    classifier: &SupportClassifier,
) -> Result<Vec<Container>> {
    let Some(containers) = schema::namespace_bucket(tx, namespace, &[BUCKET_KEY_OBJECT_CONTAINERS])?
    else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&containers)?
        .into_iter()
        .map(|(id, bucket)| read_container(namespace, id, &bucket, classifier))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::Db;
    use crate::fixture::{encode_spec, encode_time, BoltWriter, Tree};
    use chrono::TimeZone;

    fn spec(json: &str) -> RuntimeSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_hostname_from_env() {
        let s = spec(r#"{"hostname": "", "process": {"env": ["PATH=/bin", "HOSTNAME=foo"]}}"#);
        assert_eq!(resolve_hostname(&s), "foo");
    }

    #[test]
    fn test_hostname_explicit_wins() {
        let s = spec(r#"{"hostname": "web-1", "process": {"env": ["HOSTNAME=foo"]}}"#);
        assert_eq!(resolve_hostname(&s), "web-1");
    }

    #[test]
    fn test_hostname_first_env_entry_trimmed() {
        let s = spec(r#"{"process": {"env": ["HOSTNAME= a b ", "HOSTNAME=second"]}}"#);
        assert_eq!(resolve_hostname(&s), "a b");
        assert_eq!(resolve_hostname(&RuntimeSpec::default()), "");
    }

    #[test]
    fn test_decode_spec_envelope() {
        let raw = encode_spec(r#"{"ociVersion": "1.0.2", "hostname": "db"}"#);
        assert_eq!(decode_spec(&raw).unwrap().hostname.as_deref(), Some("db"));

        assert!(decode_spec(&encode_spec("")).is_err());
        assert!(decode_spec(&encode_spec("{not json")).is_err());
        assert!(decode_spec(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_container_type() {
        let mut labels = BTreeMap::new();
        assert_eq!(container_type("default", &labels), "");
        assert_eq!(container_type("moby", &labels), "docker");
        labels.insert("com.docker.compose.project".into(), "x".into());
        assert_eq!(container_type("default", &labels), "docker");
        labels.insert(CRI_KIND_LABEL.into(), "sandbox".into());
        assert_eq!(container_type("k8s.io", &labels), "sandbox");
    }

    #[test]
    fn test_list_containers() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut tree = Tree::new();
        let containers = tree.path(&["v1", "k8s.io", "containers"]);
        let fluent = containers.bucket("fluent");
        fluent
            .put("image", "gke.gcr.io/fluent-bit:v1.8")
            .put("createdat", encode_time(created))
            .put("snapshotter", "overlayfs")
            .put("snapshotKey", "fluent")
            .put("spec", encode_spec(r#"{"process": {"env": ["HOSTNAME=node-a"]}}"#));
        fluent.bucket("runtime").put("name", "io.containerd.runc.v2");
        fluent.bucket("labels").put(CRI_KIND_LABEL, "container");
        containers
            .bucket("web")
            .put("image", "myapp/web:v2")
            .put("spec", vec![0xffu8, 0x01]);
        tree.path(&["v1", "empty"]);

        let db = Db::from_bytes(BoltWriter::new().write(&tree)).unwrap();
        let tx = db.begin();
        let classifier = SupportClassifier::default();

        let list = list_containers(&tx, "k8s.io", &classifier).unwrap();
        assert_eq!(list.len(), 2);
        let c = &list[0];
        assert_eq!(c.id, "fluent");
        assert_eq!(c.hostname, "node-a");
        assert!(c.support_container);
        assert_eq!(c.created_at, Some(created));
        assert_eq!(c.updated_at, None);
        assert_eq!(c.runtime, "io.containerd.runc.v2");
        assert_eq!(c.container_type, "container");
        assert_eq!(c.snapshot_key, "fluent");

        let web = &list[1];
        assert_eq!(web.hostname, "");
        assert!(!web.support_container);

        assert!(list_containers(&tx, "empty", &classifier).unwrap().is_empty());
        assert!(list_containers(&tx, "missing", &classifier).unwrap().is_empty());
    }
}
