//! Bucket layout of containerd's metadata stores and helpers for walking it.
//!
//! Absence is never an error here: a missing bucket or key is `None`, and
//! a value that fails to decode is reported with a warning and treated as
//! absent. Only structural page damage surfaces as `Err`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::bolt::{Bucket, EntryValue, Tx};
use crate::codec;
use crate::error::Result;

pub const BUCKET_KEY_VERSION: &[u8] = b"v1";

pub const BUCKET_KEY_OBJECT_LABELS: &[u8] = b"labels";
pub const BUCKET_KEY_OBJECT_IMAGES: &[u8] = b"image";
pub const BUCKET_KEY_OBJECT_CONTAINERS: &[u8] = b"containers";
pub const BUCKET_KEY_OBJECT_SNAPSHOTS: &[u8] = b"snapshots";
pub const BUCKET_KEY_OBJECT_CONTENT: &[u8] = b"content";
pub const BUCKET_KEY_OBJECT_BLOB: &[u8] = b"blob";
pub const BUCKET_KEY_OBJECT_INGESTS: &[u8] = b"ingests";
pub const BUCKET_KEY_OBJECT_LEASES: &[u8] = b"leases";

pub const BUCKET_KEY_DIGEST: &[u8] = b"digest";
pub const BUCKET_KEY_MEDIA_TYPE: &[u8] = b"mediatype";
pub const BUCKET_KEY_SIZE: &[u8] = b"size";
pub const BUCKET_KEY_IMAGE: &[u8] = b"image";
pub const BUCKET_KEY_RUNTIME: &[u8] = b"runtime";
pub const BUCKET_KEY_NAME: &[u8] = b"name";
pub const BUCKET_KEY_PARENT: &[u8] = b"parent";
pub const BUCKET_KEY_SPEC: &[u8] = b"spec";
pub const BUCKET_KEY_SNAPSHOTTER: &[u8] = b"snapshotter";
pub const BUCKET_KEY_SNAPSHOT_KEY: &[u8] = b"snapshotKey";
pub const BUCKET_KEY_SANDBOX_ID: &[u8] = b"sandboxid";
pub const BUCKET_KEY_TARGET: &[u8] = b"target";
pub const BUCKET_KEY_CREATED_AT: &[u8] = b"createdat";
pub const BUCKET_KEY_UPDATED_AT: &[u8] = b"updatedat";
pub const BUCKET_KEY_EXPIRE_AT: &[u8] = b"expireat";
pub const BUCKET_KEY_EXPECTED: &[u8] = b"expected";
pub const BUCKET_KEY_REF: &[u8] = b"ref";

// Snapshotter store keys.
pub const BUCKET_KEY_ID: &[u8] = b"id";
pub const BUCKET_KEY_KIND: &[u8] = b"kind";

/// Walk nested buckets from the transaction root.
///
/// Returns `Ok(None)` as soon as any segment is missing.
pub fn navigate<'a>(tx: &Tx<'a>, segments: &[&[u8]]) -> Result<Option<Bucket<'a>>> {
    let mut bucket = tx.root();
    for segment in segments {
        match bucket.bucket(segment)? {
            Some(next) => bucket = next,
            None => return Ok(None),
        }
    }
    Ok(Some(bucket))
}

/// Navigate below `v1/<namespace>`.
pub fn namespace_bucket<'a>(
    tx: &Tx<'a>,
    namespace: &str,
    segments: &[&[u8]],
) -> Result<Option<Bucket<'a>>> {
    let mut path: Vec<&[u8]> = Vec::with_capacity(segments.len() + 2);
    path.push(BUCKET_KEY_VERSION);
    path.push(namespace.as_bytes());
    path.extend_from_slice(segments);
    navigate(tx, &path)
}

/// Decode a bucket key or name as UTF-8, lossily.
pub fn key_string(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let lossy = String::from_utf8_lossy(raw).into_owned();
            tracing::warn!(key = %lossy, "non-UTF-8 key decoded lossily");
            lossy
        }
    }
}

/// Raw value of a plain key.
pub fn read_field<'a>(bucket: &Bucket<'a>, key: &[u8]) -> Option<&'a [u8]> {
    match bucket.get(key) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(field = %String::from_utf8_lossy(key), error = %e, "unreadable field");
            None
        }
    }
}

/// String field, or empty when absent.
pub fn read_string(bucket: &Bucket<'_>, key: &[u8]) -> String {
    read_field(bucket, key).map(key_string).unwrap_or_default()
}

/// Binary timestamp field.
pub fn read_time(bucket: &Bucket<'_>, key: &[u8]) -> Option<DateTime<Utc>> {
    let raw = read_field(bucket, key)?;
    match codec::decode_time(raw) {
        Ok(ts) => ts,
        Err(e) => {
            tracing::warn!(field = %String::from_utf8_lossy(key), error = %e, "undecodable timestamp");
            None
        }
    }
}

/// Signed varint field.
pub fn read_varint(bucket: &Bucket<'_>, key: &[u8]) -> Option<i64> {
    let raw = read_field(bucket, key)?;
    match codec::decode_varint(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(field = %String::from_utf8_lossy(key), error = %e, "undecodable integer");
            None
        }
    }
}

/// Key/value pairs of the `labels` sub-bucket of `bucket`.
pub fn read_labels(bucket: &Bucket<'_>) -> BTreeMap<String, String> {
    let labels = match bucket.bucket(BUCKET_KEY_OBJECT_LABELS) {
        Ok(Some(labels)) => labels,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable labels bucket");
            return BTreeMap::new();
        }
    };
    read_string_map(&labels)
}

/// All plain values of `bucket` as strings.
pub fn read_string_map(bucket: &Bucket<'_>) -> BTreeMap<String, String> {
    match bucket.entries() {
        Ok(entries) => entries
            .into_iter()
            .filter_map(|e| match e.value {
                EntryValue::Data(v) => Some((key_string(e.key), key_string(v))),
                EntryValue::Bucket(_) | EntryValue::Damaged(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable bucket entries");
            BTreeMap::new()
        }
    }
}

/// Named sub-buckets of `bucket`, in key order.
///
/// Plain values at this level are ignored. A sub-bucket with a malformed
/// header is skipped with a warning; the others are still returned.
pub fn sub_buckets<'a>(bucket: &Bucket<'a>) -> Result<Vec<(String, Bucket<'a>)>> {
    Ok(bucket
        .entries()?
        .into_iter()
        .filter_map(|e| match e.value {
            EntryValue::Bucket(b) => Some((key_string(e.key), b)),
            EntryValue::Damaged(header) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(e.key),
                    header_len = header.len(),
                    "skipping record with malformed bucket header"
                );
                None
            }
            EntryValue::Data(_) => None,
        })
        .collect())
}

/// Names of the sub-buckets of `bucket`.
pub fn sub_bucket_names(bucket: &Bucket<'_>) -> Result<Vec<String>> {
    Ok(sub_buckets(bucket)?.into_iter().map(|(k, _)| k).collect())
}
