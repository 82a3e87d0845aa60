//! Image records from `v1/<ns>/image/<name>`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bolt::{Bucket, Tx};
use crate::error::Result;
use crate::schema::{self, *};
use crate::support::SupportClassifier;

/// Content descriptor an image name points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// A named image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub namespace: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub target: Descriptor,
    pub support_image: bool,
}

fn read_target(bucket: &Bucket<'_>) -> Descriptor {
    let target = match bucket.bucket(BUCKET_KEY_TARGET) {
        Ok(Some(target)) => target,
        Ok(None) => return Descriptor::default(),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable image target");
            return Descriptor::default();
        }
    };
    Descriptor {
        digest: schema::read_string(&target, BUCKET_KEY_DIGEST),
        media_type: schema::read_string(&target, BUCKET_KEY_MEDIA_TYPE),
        size: schema::read_varint(&target, BUCKET_KEY_SIZE).unwrap_or_default(),
    }
}

/// Images of one namespace in name order.
pub fn list_images(
    tx: &Tx<'_>,
    namespace: &str,
    classifier: &SupportClassifier,
) -> Result<Vec<Image>> {
    let Some(images) = schema::namespace_bucket(tx, namespace, &[BUCKET_KEY_OBJECT_IMAGES])? else {
        return Ok(Vec::new());
    };
    Ok(schema::sub_buckets(&images)?
        .into_iter()
        .map(|(name, bucket)| Image {
            namespace: namespace.to_string(),
            support_image: classifier.is_support_image(&name),
            created_at: schema::read_time(&bucket, BUCKET_KEY_CREATED_AT),
            updated_at: schema::read_time(&bucket, BUCKET_KEY_UPDATED_AT),
            labels: schema::read_labels(&bucket),
            target: read_target(&bucket),
            name,
        })
        .collect())
}
