//! Namespace enumeration.
//!
//! Every bucket directly under `v1` is a namespace.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::bolt::Tx;
use crate::error::Result;
use crate::schema::{self, BUCKET_KEY_VERSION};

/// A namespace and its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Namespace names in key order. A store without `v1` has none.
pub fn list_namespaces(tx: &Tx<'_>) -> Result<Vec<String>> {
    match tx.bucket(BUCKET_KEY_VERSION)? {
        Some(v1) => schema::sub_bucket_names(&v1),
        None => Ok(Vec::new()),
    }
}

/// Namespaces with the labels stored in `v1/<ns>/labels`.
pub fn list_namespace_records(tx: &Tx<'_>) -> Result<Vec<Namespace>> {
    let Some(v1) = tx.bucket(BUCKET_KEY_VERSION)? else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&v1)?
        .into_iter()
        .map(|(name, bucket)| Namespace {
            labels: schema::read_labels(&bucket),
            name,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::Db;
    use crate::fixture::{BoltWriter, Tree};

    #[test]
    fn test_list_namespaces() {
        let mut tree = Tree::new();
        let v1 = tree.bucket("v1");
        v1.bucket("k8s.io").bucket("labels").put("owner", "kubelet");
        v1.bucket("default");
        v1.put("stray", "value");
        let db = Db::from_bytes(BoltWriter::new().write(&tree)).unwrap();
        let tx = db.begin();

        assert_eq!(list_namespaces(&tx).unwrap(), vec!["default", "k8s.io"]);

        let records = list_namespace_records(&tx).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].labels.is_empty());
        assert_eq!(records[1].labels["owner"], "kubelet");
    }

    #[test]
    fn test_no_version_bucket() {
        let mut tree = Tree::new();
        tree.bucket("v2").bucket("default");
        let db = Db::from_bytes(BoltWriter::new().write(&tree)).unwrap();
        assert!(list_namespaces(&db.begin()).unwrap().is_empty());
    }
}
