//! Read-only reader for bbolt database files.
//!
//! containerd keeps its metadata in [bbolt](https://github.com/etcd-io/bbolt)
//! files. This module understands just enough of the on-disk format to walk
//! the bucket tree without ever writing to the file.
//!
//! # File Layout
//!
//! ```text
//! page 0   meta      (magic, version, page size, root bucket, txid, checksum)
//! page 1   meta      (second copy; the valid one with the higher txid wins)
//! page N   freelist  (ignored)
//! page M   branch    (separator keys + child page ids)
//! page K   leaf      (key/value elements; a flag marks nested buckets)
//! ```
//!
//! Every page starts with a 16-byte header (`id`, `flags`, `count`,
//! `overflow`). A page may span `overflow` additional pages. Nested buckets
//! are stored as a 16-byte bucket header (`root`, `sequence`); a `root` of 0
//! means the bucket's single leaf page is stored inline right after the
//! header.
//!
//! All multi-byte integers in page structures are little-endian.
//!
//! # Consistency
//!
//! The whole file is read into memory when the [`Db`] is created, so a
//! [`Tx`] always observes a single point-in-time copy no matter what other
//! processes do to the file afterwards.

use std::cmp::Ordering;

use crate::error::{MetaError, Result};

/// bbolt file magic.
pub const MAGIC: u32 = 0xED0C_DAED;

/// Supported file format version.
pub const VERSION: u32 = 2;

pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const ELEMENT_SIZE: usize = 16;
pub(crate) const BUCKET_HEADER_SIZE: usize = 16;
pub(crate) const META_CHECKSUM_OFFSET: usize = 56;
pub(crate) const META_SIZE: usize = 64;

pub(crate) const BRANCH_PAGE_FLAG: u16 = 0x01;
pub(crate) const LEAF_PAGE_FLAG: u16 = 0x02;
pub(crate) const META_PAGE_FLAG: u16 = 0x04;
pub(crate) const FREELIST_PAGE_FLAG: u16 = 0x10;

pub(crate) const BUCKET_LEAF_FLAG: u32 = 0x01;

/// Page sizes tried when the first meta page is unusable.
const FALLBACK_PAGE_SIZES: [usize; 6] = [4096, 8192, 16384, 65536, 1024, 2048];

const MIN_PAGE_SIZE: usize = 512;
const MAX_PAGE_SIZE: usize = 1 << 20;

/// Maximum branch depth followed before a page tree is declared cyclic.
const MAX_DEPTH: usize = 64;

/// Page identifier.
pub type Pgid = u64;

/// FNV-1a 64-bit hash, as used for meta page checksums.
pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn le_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn le_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// Decoded meta page.
#[derive(Debug, Clone, Copy)]
struct Meta {
    page_size: usize,
    root: Pgid,
    txid: u64,
    high_water: Pgid,
}

impl Meta {
    /// Parse and validate the meta page starting at `page`.
    fn parse(page: &[u8]) -> std::result::Result<Self, String> {
        let flags = le_u16(page, 8).ok_or("meta page truncated")?;
        if flags & META_PAGE_FLAG == 0 {
            return Err(format!("page flags {flags:#x} are not a meta page"));
        }
        let meta = page
            .get(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE)
            .ok_or("meta page truncated")?;

        let magic = le_u32(meta, 0).ok_or("meta page truncated")?;
        if magic != MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }
        let version = le_u32(meta, 4).ok_or("meta page truncated")?;
        if version != VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let checksum = le_u64(meta, META_CHECKSUM_OFFSET).ok_or("meta page truncated")?;
        if checksum != fnv1a64(&meta[..META_CHECKSUM_OFFSET]) {
            return Err("meta checksum mismatch".to_string());
        }

        let page_size = le_u32(meta, 8).ok_or("meta page truncated")? as usize;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(format!("implausible page size {page_size}"));
        }
        Ok(Self {
            page_size,
            root: le_u64(meta, 16).ok_or("meta page truncated")?,
            txid: le_u64(meta, 48).ok_or("meta page truncated")?,
            high_water: le_u64(meta, 40).ok_or("meta page truncated")?,
        })
    }
}

/// An in-memory copy of a bbolt file.
#[derive(Debug)]
pub struct Db {
    data: Vec<u8>,
    meta: Meta,
}

impl Db {
    /// Parse a bbolt file image.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Corrupt`] if the file is too short or neither
    /// meta page is valid.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE + META_SIZE {
            return Err(MetaError::corrupt(format!(
                "file too small for a bbolt header ({} bytes)",
                data.len()
            )));
        }

        let meta0 = Meta::parse(&data);
        let meta1 = match &meta0 {
            Ok(m) => data.get(m.page_size..).map(Meta::parse),
            // Without a trustworthy page size, probe the usual candidates.
            Err(_) => FALLBACK_PAGE_SIZES.iter().find_map(|&size| {
                let m = Meta::parse(data.get(size..)?).ok()?;
                (m.page_size == size).then_some(Ok(m))
            }),
        };

        let meta = match (meta0, meta1) {
            (Ok(a), Some(Ok(b))) => {
                if b.txid > a.txid {
                    b
                } else {
                    a
                }
            }
            (Ok(a), _) => a,
            (Err(_), Some(Ok(b))) => b,
            (Err(e), _) => {
                return Err(MetaError::corrupt(format!("no valid meta page: {e}")));
            }
        };

        tracing::debug!(
            page_size = meta.page_size,
            txid = meta.txid,
            root = meta.root,
            high_water = meta.high_water,
            "parsed bbolt meta page"
        );

        Ok(Self { data, meta })
    }

    /// Begin a read-only transaction.
    pub fn begin(&self) -> Tx<'_> {
        Tx { db: self }
    }

    /// Page size recorded in the active meta page.
    pub fn page_size(&self) -> usize {
        self.meta.page_size
    }

    /// Transaction id of the active meta page.
    pub fn txid(&self) -> u64 {
        self.meta.txid
    }

    /// Load the page with id `id`, including its overflow pages.
    fn page(&self, id: Pgid) -> Result<Page<'_>> {
        let out_of_range = || MetaError::corrupt(format!("page {id} is beyond the end of file"));
        let start = usize::try_from(id)
            .ok()
            .and_then(|i| i.checked_mul(self.meta.page_size))
            .ok_or_else(out_of_range)?;
        let header = self
            .data
            .get(start..start + PAGE_HEADER_SIZE)
            .ok_or_else(out_of_range)?;

        let stored_id = le_u64(header, 0).ok_or_else(out_of_range)?;
        if stored_id != id {
            return Err(MetaError::corrupt(format!(
                "page {id} carries id {stored_id}"
            )));
        }
        let overflow = le_u32(header, 12).ok_or_else(out_of_range)? as usize;
        let len = overflow
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.meta.page_size))
            .ok_or_else(out_of_range)?;
        let data = self
            .data
            .get(start..start.checked_add(len).ok_or_else(out_of_range)?)
            .ok_or_else(out_of_range)?;
        Page::new(id, data)
    }
}

/// A read-only transaction over a [`Db`].
#[derive(Debug, Clone, Copy)]
pub struct Tx<'a> {
    db: &'a Db,
}

impl<'a> Tx<'a> {
    /// The root bucket, whose children are the top-level buckets.
    pub fn root(&self) -> Bucket<'a> {
        Bucket {
            db: self.db,
            root: Root::Page(self.db.meta.root),
        }
    }

    /// Look up a top-level bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>> {
        self.root().bucket(name)
    }

    /// Transaction id this view was taken at.
    pub fn id(&self) -> u64 {
        self.db.meta.txid
    }
}

#[derive(Debug, Clone, Copy)]
enum Root<'a> {
    Page(Pgid),
    Inline(&'a [u8]),
}

/// A bucket inside a transaction.
#[derive(Debug, Clone, Copy)]
pub struct Bucket<'a> {
    db: &'a Db,
    root: Root<'a>,
}

/// A key stored in a bucket and what it holds.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    /// Raw key bytes.
    pub key: &'a [u8],
    /// Plain value or nested bucket.
    pub value: EntryValue<'a>,
}

/// Contents of an [`Entry`].
#[derive(Debug, Clone, Copy)]
pub enum EntryValue<'a> {
    /// A plain value.
    Data(&'a [u8]),
    /// A nested bucket.
    Bucket(Bucket<'a>),
    /// A nested bucket whose header cannot be parsed; holds the raw header.
    Damaged(&'a [u8]),
}

impl<'a> Entry<'a> {
    /// The nested bucket, if this entry is one.
    pub fn as_bucket(&self) -> Option<Bucket<'a>> {
        match self.value {
            EntryValue::Bucket(b) => Some(b),
            EntryValue::Data(_) | EntryValue::Damaged(_) => None,
        }
    }
}

impl<'a> Bucket<'a> {
    fn from_value(db: &'a Db, value: &'a [u8]) -> Result<Self> {
        let truncated =
            || MetaError::corrupt(format!("bucket header truncated ({} bytes)", value.len()));
        let root = le_u64(value, 0).ok_or_else(truncated)?;
        let root = if root == 0 {
            Root::Inline(value.get(BUCKET_HEADER_SIZE..).ok_or_else(truncated)?)
        } else {
            Root::Page(root)
        };
        Ok(Self { db, root })
    }

    fn page(&self, id: Pgid) -> Result<Page<'a>> {
        self.db.page(id)
    }

    fn root_page(&self) -> Result<Page<'a>> {
        match self.root {
            Root::Page(id) => self.page(id),
            Root::Inline(data) => Page::new(0, data),
        }
    }

    /// Find the leaf element for `key`, if present.
    fn seek(&self, key: &[u8]) -> Result<Option<LeafElement<'a>>> {
        let mut page = self.root_page()?;
        for _ in 0..MAX_DEPTH {
            if page.is_leaf() {
                for i in 0..page.count {
                    let elem = page.leaf_element(i)?;
                    match elem.key.cmp(key) {
                        Ordering::Equal => return Ok(Some(elem)),
                        Ordering::Greater => return Ok(None),
                        Ordering::Less => {}
                    }
                }
                return Ok(None);
            }

            // Branch: descend into the last child whose separator is <= key.
            let mut child = None;
            for i in 0..page.count {
                let (sep, pgid) = page.branch_element(i)?;
                if i == 0 || sep <= key {
                    child = Some(pgid);
                }
                if sep > key {
                    break;
                }
            }
            let Some(child) = child else {
                return Ok(None);
            };
            page = self.page(child)?;
        }
        Err(MetaError::corrupt("page tree exceeds maximum depth"))
    }

    /// Get a plain value. Nested buckets under `key` yield `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        Ok(self
            .seek(key)?
            .filter(|e| e.flags & BUCKET_LEAF_FLAG == 0)
            .map(|e| e.value))
    }

    /// Get a nested bucket. Plain values under `key` yield `None`.
    pub fn bucket(&self, key: &[u8]) -> Result<Option<Bucket<'a>>> {
        match self.seek(key)? {
            Some(e) if e.flags & BUCKET_LEAF_FLAG != 0 => {
                Bucket::from_value(self.db, e.value).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// All entries in raw key order.
    ///
    /// A nested bucket with a malformed header is returned as
    /// [`EntryValue::Damaged`] so its siblings stay readable. Damage to the
    /// page tree of this bucket itself is an error.
    pub fn entries(&self) -> Result<Vec<Entry<'a>>> {
        let mut out = Vec::new();
        self.collect(self.root_page()?, 0, &mut out)?;
        Ok(out)
    }

    /// Nested buckets in raw key order, skipping plain values and damaged
    /// bucket headers.
    pub fn buckets(&self) -> Result<Vec<(&'a [u8], Bucket<'a>)>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|e| e.as_bucket().map(|b| (e.key, b)))
            .collect())
    }

    fn collect(&self, page: Page<'a>, depth: usize, out: &mut Vec<Entry<'a>>) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(MetaError::corrupt("page tree exceeds maximum depth"));
        }
        if page.is_leaf() {
            for i in 0..page.count {
                let elem = page.leaf_element(i)?;
                let value = if elem.flags & BUCKET_LEAF_FLAG != 0 {
                    match Bucket::from_value(self.db, elem.value) {
                        Ok(bucket) => EntryValue::Bucket(bucket),
                        Err(_) => EntryValue::Damaged(elem.value),
                    }
                } else {
                    EntryValue::Data(elem.value)
                };
                out.push(Entry {
                    key: elem.key,
                    value,
                });
            }
            return Ok(());
        }
        for i in 0..page.count {
            let (_, child) = page.branch_element(i)?;
            self.collect(self.page(child)?, depth + 1, out)?;
        }
        Ok(())
    }
}

struct LeafElement<'a> {
    flags: u32,
    key: &'a [u8],
    value: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct Page<'a> {
    id: Pgid,
    flags: u16,
    count: usize,
    data: &'a [u8],
}

impl<'a> Page<'a> {
    fn new(id: Pgid, data: &'a [u8]) -> Result<Self> {
        let truncated = || MetaError::corrupt(format!("page {id} header truncated"));
        let flags = le_u16(data, 8).ok_or_else(truncated)?;
        let count = le_u16(data, 10).ok_or_else(truncated)? as usize;
        if flags & (BRANCH_PAGE_FLAG | LEAF_PAGE_FLAG) == 0 {
            return Err(MetaError::corrupt(format!(
                "page {id} has unexpected flags {flags:#x}"
            )));
        }
        Ok(Self {
            id,
            flags,
            count,
            data,
        })
    }

    fn is_leaf(&self) -> bool {
        self.flags & LEAF_PAGE_FLAG != 0
    }

    fn element(&self, index: usize) -> Result<(usize, &'a [u8])> {
        let at = PAGE_HEADER_SIZE + index * ELEMENT_SIZE;
        let elem = self.data.get(at..at + ELEMENT_SIZE).ok_or_else(|| {
            MetaError::corrupt(format!("page {} element {index} out of bounds", self.id))
        })?;
        Ok((at, elem))
    }

    fn slice(&self, start: usize, len: usize, what: &str) -> Result<&'a [u8]> {
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| {
                MetaError::corrupt(format!("page {} {what} out of bounds", self.id))
            })
    }

    fn leaf_element(&self, index: usize) -> Result<LeafElement<'a>> {
        let (at, elem) = self.element(index)?;
        let bad = || MetaError::corrupt(format!("page {} leaf element malformed", self.id));
        let flags = le_u32(elem, 0).ok_or_else(bad)?;
        let pos = le_u32(elem, 4).ok_or_else(bad)? as usize;
        let ksize = le_u32(elem, 8).ok_or_else(bad)? as usize;
        let vsize = le_u32(elem, 12).ok_or_else(bad)? as usize;

        let key_start = at.checked_add(pos).ok_or_else(bad)?;
        let key = self.slice(key_start, ksize, "key")?;
        let value = self.slice(key_start + ksize, vsize, "value")?;
        Ok(LeafElement { flags, key, value })
    }

    fn branch_element(&self, index: usize) -> Result<(&'a [u8], Pgid)> {
        let (at, elem) = self.element(index)?;
        let bad = || MetaError::corrupt(format!("page {} branch element malformed", self.id));
        let pos = le_u32(elem, 0).ok_or_else(bad)? as usize;
        let ksize = le_u32(elem, 4).ok_or_else(bad)? as usize;
        let pgid = le_u64(elem, 8).ok_or_else(bad)?;
        let key = self.slice(at.checked_add(pos).ok_or_else(bad)?, ksize, "key")?;
        Ok((key, pgid))
    }
}
