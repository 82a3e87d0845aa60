//! bbolt writer for building test stores.
//!
//! Produces byte-for-byte valid bbolt files from an in-memory [`Tree`] so
//! tests can exercise the reader without a Go toolchain. Only the subset of
//! the format the reader consumes is emitted: two meta pages, an empty
//! freelist, leaf pages (with overflow), one level of branch pages for large
//! buckets, and optional inline buckets.
//!
//! Also provides the value encoders containerd uses, mirroring
//! [`crate::codec`].
//!
//! ```
//! use ctrmeta_rs::fixture::{BoltWriter, Tree};
//!
//! let mut root = Tree::new();
//! root.bucket("v1").bucket("default").bucket("labels").put("team", "red");
//! let bytes = BoltWriter::new().write(&root);
//! let db = ctrmeta_rs::bolt::Db::from_bytes(bytes).unwrap();
//! assert!(db.begin().bucket(b"v1").unwrap().is_some());
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use prost::Message;

use crate::bolt::{
    fnv1a64, BRANCH_PAGE_FLAG, BUCKET_HEADER_SIZE, BUCKET_LEAF_FLAG, ELEMENT_SIZE,
    FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, MAGIC, META_CHECKSUM_OFFSET, META_PAGE_FLAG,
    PAGE_HEADER_SIZE, VERSION,
};

const GO_UNIX_TO_INTERNAL: i64 = 62_135_596_800;

/// A node in a bucket tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// Plain value.
    Value(Vec<u8>),
    /// Nested bucket.
    Bucket(Tree),
}

/// An in-memory bucket: sorted keys mapping to values or nested buckets.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    entries: BTreeMap<Vec<u8>, Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a plain value, replacing whatever was under `key`.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.entries
            .insert(key.as_ref().to_vec(), Node::Value(value.into()));
        self
    }

    /// Get or create the nested bucket `key`.
    pub fn bucket(&mut self, key: impl AsRef<[u8]>) -> &mut Tree {
        let node = self
            .entries
            .entry(key.as_ref().to_vec())
            .or_insert_with(|| Node::Bucket(Tree::new()));
        if let Node::Value(_) = node {
            *node = Node::Bucket(Tree::new());
        }
        match node {
            Node::Bucket(tree) => tree,
            Node::Value(_) => unreachable!("replaced above"),
        }
    }

    /// Get or create a chain of nested buckets.
    pub fn path(&mut self, segments: &[&str]) -> &mut Tree {
        segments
            .iter()
            .fold(self, |tree, segment| tree.bucket(segment))
    }

    /// Remove `key`, returning whether it existed.
    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> bool {
        self.entries.remove(key.as_ref()).is_some()
    }

    fn has_buckets(&self) -> bool {
        self.entries.values().any(|n| matches!(n, Node::Bucket(_)))
    }
}

/// Serializes a [`Tree`] into a bbolt file image.
#[derive(Debug, Clone)]
pub struct BoltWriter {
    page_size: usize,
    max_leaf_entries: usize,
    inline_buckets: bool,
}

impl Default for BoltWriter {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_leaf_entries: 64,
            inline_buckets: true,
        }
    }
}

struct Item {
    key: Vec<u8>,
    flags: u32,
    value: Vec<u8>,
}

struct Pages {
    buf: Vec<u8>,
    page_size: usize,
    next: u64,
}

impl Pages {
    /// Allocate enough contiguous pages for `page` and copy it in.
    fn store(&mut self, mut page: Vec<u8>) -> u64 {
        let count = page.len().max(1).div_ceil(self.page_size);
        let id = self.next;
        self.next += count as u64;
        page[0..8].copy_from_slice(&id.to_le_bytes());
        page[12..16].copy_from_slice(&((count - 1) as u32).to_le_bytes());

        let start = id as usize * self.page_size;
        self.buf.resize(self.next as usize * self.page_size, 0);
        self.buf[start..start + page.len()].copy_from_slice(&page);
        id
    }
}

fn page_header(flags: u16, count: usize) -> Vec<u8> {
    let mut out = vec![0u8; PAGE_HEADER_SIZE];
    out[8..10].copy_from_slice(&flags.to_le_bytes());
    out[10..12].copy_from_slice(&(count as u16).to_le_bytes());
    out
}

fn encode_leaf(items: &[Item]) -> Vec<u8> {
    let mut page = page_header(LEAF_PAGE_FLAG, items.len());
    let mut data = Vec::new();
    let elements_end = PAGE_HEADER_SIZE + items.len() * ELEMENT_SIZE;
    for (i, item) in items.iter().enumerate() {
        let elem_at = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
        let pos = elements_end + data.len() - elem_at;
        page.extend_from_slice(&item.flags.to_le_bytes());
        page.extend_from_slice(&(pos as u32).to_le_bytes());
        page.extend_from_slice(&(item.key.len() as u32).to_le_bytes());
        page.extend_from_slice(&(item.value.len() as u32).to_le_bytes());
        data.extend_from_slice(&item.key);
        data.extend_from_slice(&item.value);
    }
    page.extend_from_slice(&data);
    page
}

fn encode_branch(children: &[(Vec<u8>, u64)]) -> Vec<u8> {
    let mut page = page_header(BRANCH_PAGE_FLAG, children.len());
    let mut data = Vec::new();
    let elements_end = PAGE_HEADER_SIZE + children.len() * ELEMENT_SIZE;
    for (i, (key, pgid)) in children.iter().enumerate() {
        let elem_at = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
        let pos = elements_end + data.len() - elem_at;
        page.extend_from_slice(&(pos as u32).to_le_bytes());
        page.extend_from_slice(&(key.len() as u32).to_le_bytes());
        page.extend_from_slice(&pgid.to_le_bytes());
        data.extend_from_slice(key);
    }
    page.extend_from_slice(&data);
    page
}

fn bucket_header(root: u64) -> Vec<u8> {
    let mut out = vec![0u8; BUCKET_HEADER_SIZE];
    out[0..8].copy_from_slice(&root.to_le_bytes());
    out
}

impl BoltWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page size to write (default 4096).
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Split buckets with more entries than this across a branch page.
    pub fn max_leaf_entries(mut self, n: usize) -> Self {
        self.max_leaf_entries = n.max(1);
        self
    }

    /// Store small leaf-only buckets inline in their parent (default on).
    pub fn inline_buckets(mut self, inline: bool) -> Self {
        self.inline_buckets = inline;
        self
    }

    /// Serialize `root` as the database's root bucket.
    pub fn write(&self, root: &Tree) -> Vec<u8> {
        let mut pages = Pages {
            buf: vec![0u8; 3 * self.page_size],
            page_size: self.page_size,
            next: 3,
        };
        let root_pgid = self.write_paged(root, &mut pages);

        let freelist = page_header(FREELIST_PAGE_FLAG, 0);
        let at = 2 * self.page_size;
        pages.buf[at..at + PAGE_HEADER_SIZE].copy_from_slice(&freelist);
        pages.buf[at..at + 8].copy_from_slice(&2u64.to_le_bytes());

        for txid in 0..2u64 {
            let meta = self.meta_page(txid, root_pgid, pages.next);
            let at = txid as usize * self.page_size;
            pages.buf[at..at + meta.len()].copy_from_slice(&meta);
        }
        pages.buf
    }

    /// Serialize `root` and write it to `path`.
    pub fn write_to(&self, root: &Tree, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.write(root))
    }

    fn meta_page(&self, txid: u64, root: u64, high_water: u64) -> Vec<u8> {
        let mut page = page_header(META_PAGE_FLAG, 0);
        page[0..8].copy_from_slice(&txid.to_le_bytes());
        let mut meta = Vec::with_capacity(64);
        meta.extend_from_slice(&MAGIC.to_le_bytes());
        meta.extend_from_slice(&VERSION.to_le_bytes());
        meta.extend_from_slice(&(self.page_size as u32).to_le_bytes());
        meta.extend_from_slice(&0u32.to_le_bytes());
        meta.extend_from_slice(&root.to_le_bytes());
        meta.extend_from_slice(&0u64.to_le_bytes());
        meta.extend_from_slice(&2u64.to_le_bytes());
        meta.extend_from_slice(&high_water.to_le_bytes());
        meta.extend_from_slice(&txid.to_le_bytes());
        let checksum = fnv1a64(&meta[..META_CHECKSUM_OFFSET]);
        meta.extend_from_slice(&checksum.to_le_bytes());
        page.extend_from_slice(&meta);
        page
    }

    fn items(&self, tree: &Tree, pages: &mut Pages) -> Vec<Item> {
        tree.entries
            .iter()
            .map(|(key, node)| match node {
                Node::Value(v) => Item {
                    key: key.clone(),
                    flags: 0,
                    value: v.clone(),
                },
                Node::Bucket(child) => Item {
                    key: key.clone(),
                    flags: BUCKET_LEAF_FLAG,
                    value: self.bucket_value(child, pages),
                },
            })
            .collect()
    }

    fn bucket_value(&self, tree: &Tree, pages: &mut Pages) -> Vec<u8> {
        if self.inline_buckets && !tree.has_buckets() {
            let items = self.items(tree, pages);
            let leaf = encode_leaf(&items);
            if BUCKET_HEADER_SIZE + leaf.len() <= self.page_size / 4 {
                let mut value = bucket_header(0);
                value.extend_from_slice(&leaf);
                return value;
            }
        }
        bucket_header(self.write_paged(tree, pages))
    }

    fn write_paged(&self, tree: &Tree, pages: &mut Pages) -> u64 {
        let items = self.items(tree, pages);
        if items.len() <= self.max_leaf_entries {
            return pages.store(encode_leaf(&items));
        }
        let children: Vec<(Vec<u8>, u64)> = items
            .chunks(self.max_leaf_entries)
            .map(|chunk| (chunk[0].key.clone(), pages.store(encode_leaf(chunk))))
            .collect();
        pages.store(encode_branch(&children))
    }
}

/// Shrink the stored header of the nested bucket `key` to 4 bytes.
///
/// Only buckets held in paged leaves are found, so write the store with
/// `inline_buckets(false)`. Returns whether a matching element was patched.
pub fn truncate_bucket_header(data: &mut [u8], page_size: usize, key: &[u8]) -> bool {
    let le_u32 = |b: &[u8], at: usize| u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
    for page in data.chunks_mut(page_size).skip(3) {
        if u16::from_le_bytes([page[8], page[9]]) != LEAF_PAGE_FLAG {
            continue;
        }
        let count = u16::from_le_bytes([page[10], page[11]]) as usize;
        for i in 0..count {
            let at = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
            let flags = le_u32(&*page, at);
            let key_start = at + le_u32(&*page, at + 4) as usize;
            let ksize = le_u32(&*page, at + 8) as usize;
            if flags & BUCKET_LEAF_FLAG != 0 && page.get(key_start..key_start + ksize) == Some(key) {
                page[at + 12..at + 16].copy_from_slice(&4u32.to_le_bytes());
                return true;
            }
        }
    }
    false
}

/// Encode a timestamp the way Go's `time.Time.MarshalBinary` does (UTC).
pub fn encode_time(ts: DateTime<Utc>) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(&(ts.timestamp() + GO_UNIX_TO_INTERNAL).to_be_bytes());
    out.extend_from_slice(&(ts.timestamp_subsec_nanos() as i32).to_be_bytes());
    out.extend_from_slice(&(-1i16).to_be_bytes());
    out
}

/// Encode an unsigned LEB128 varint.
pub fn encode_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

/// Encode a Go signed (zig-zag) varint.
pub fn encode_varint(value: i64) -> Vec<u8> {
    let ux = ((value as u64) << 1) ^ ((value >> 63) as u64);
    encode_uvarint(ux)
}

/// Wrap a JSON runtime spec in the protobuf `Any` envelope containerd stores.
pub fn encode_spec(json: &str) -> Vec<u8> {
    prost_types::Any {
        type_url: "types.containerd.io/opencontainers/runtime-spec/1/Spec".to_string(),
        value: json.as_bytes().to_vec(),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn test_encoders_match_decoders() {
        let ts = DateTime::from_timestamp(1_700_000_123, 42).unwrap();
        assert_eq!(codec::decode_time(&encode_time(ts)).unwrap(), Some(ts));
        for v in [0i64, 1, -1, 1250, i64::MIN, i64::MAX] {
            assert_eq!(codec::decode_varint(&encode_varint(v)).unwrap(), v);
        }
        assert_eq!(encode_uvarint(300), vec![0xac, 0x02]);
    }

    #[test]
    fn test_bucket_replaces_value() {
        let mut tree = Tree::new();
        tree.put("x", "1");
        tree.bucket("x").put("y", "2");
        assert!(tree.has_buckets());
        assert!(tree.remove("x"));
        assert!(!tree.remove("x"));
    }

    #[test]
    fn test_page_size_is_respected() {
        let mut root = Tree::new();
        root.bucket("v1");
        let bytes = BoltWriter::new().page_size(8192).write(&root);
        assert_eq!(bytes.len() % 8192, 0);
        let db = crate::bolt::Db::from_bytes(bytes).unwrap();
        assert_eq!(db.page_size(), 8192);
    }
}
