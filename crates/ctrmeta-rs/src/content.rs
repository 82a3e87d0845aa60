//! Content blobs and in-progress ingests from `v1/<ns>/content`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bolt::Tx;
use crate::error::Result;
use crate::schema::{self, *};

/// A committed content blob. The digest is kept as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub namespace: String,
    pub digest: String,
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

/// An ingest that had not been committed when the store was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ingest {
    pub namespace: String,
    pub reference: String,
    /// Digest the ingest was expected to produce, if known.
    pub expected: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Blobs of one namespace in digest order.
pub fn list_content(tx: &Tx<'_>, namespace: &str) -> Result<Vec<Content>> {
    let Some(blobs) = schema::namespace_bucket(
        tx,
        namespace,
        &[BUCKET_KEY_OBJECT_CONTENT, BUCKET_KEY_OBJECT_BLOB],
    )?
    else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&blobs)?
        .into_iter()
        .map(|(digest, bucket)| Content {
            namespace: namespace.to_string(),
            size: schema::read_varint(&bucket, BUCKET_KEY_SIZE).unwrap_or_default(),
            created_at: schema::read_time(&bucket, BUCKET_KEY_CREATED_AT),
            updated_at: schema::read_time(&bucket, BUCKET_KEY_UPDATED_AT),
            labels: schema::read_labels(&bucket),
            digest,
        })
        .collect())
}

/// Ingests of one namespace in reference order.
pub fn list_ingests(tx: &Tx<'_>, namespace: &str) -> Result<Vec<Ingest>> {
    let Some(ingests) = schema::namespace_bucket(
        tx,
        namespace,
        &[BUCKET_KEY_OBJECT_CONTENT, BUCKET_KEY_OBJECT_INGESTS],
    )?
    else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&ingests)?
        .into_iter()
        .map(|(key, bucket)| {
            let stored = schema::read_string(&bucket, BUCKET_KEY_REF);
            Ingest {
                namespace: namespace.to_string(),
                reference: if stored.is_empty() { key } else { stored },
                expected: schema::read_string(&bucket, BUCKET_KEY_EXPECTED),
                expires_at: schema::read_time(&bucket, BUCKET_KEY_EXPIRE_AT),
            }
        })
        .collect())
}
