//! Index entry types stored in [`IndexPage`]s.

use std::fmt;

use bytes::{Buf, BufMut};

use super::index_page::IndexPage;
use super::{IndexId, LogicalPageId, ObjectId};
use crate::storage::error::{StorageError, StorageResult};

/// An entry kept in sorted order on an index page.
pub trait IndexInfo: Ord + Clone + fmt::Debug + Send + Sync + Sized {
    /// Bytes this entry occupies on a page.
    fn encoded_len(&self) -> usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> StorageResult<Self>;

    /// Builds the parent entry pointing at `child`: the child's lowest entry
    /// plus the child's logical id.
    fn link_to_page(child: &IndexPage<Self>) -> StorageResult<Self>;

    /// Size of every entry, for flavors whose entries do not vary.
    fn fixed_len() -> Option<usize> {
        None
    }
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize, what: &str) -> StorageResult<()> {
    if buf.remaining() < needed {
        return Err(StorageError::Corrupt(format!(
            "{} needs {} bytes, {} left",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_key<B: Buf>(buf: &mut B, what: &str) -> StorageResult<Vec<u8>> {
    ensure_remaining(buf, 2, what)?;
    let len = buf.get_u16_le() as usize;
    ensure_remaining(buf, len, what)?;
    let mut key = vec![0u8; len];
    buf.copy_to_slice(&mut key);
    Ok(key)
}

fn encode_key<B: BufMut>(key: &[u8], buf: &mut B) {
    buf.put_u16_le(key.len() as u16);
    buf.put_slice(key);
}

fn lowest_entry<E: IndexInfo>(child: &IndexPage<E>) -> StorageResult<&E> {
    if child.logical_id().is_zero() {
        return Err(StorageError::InvariantViolation(format!(
            "cannot link to {} without a logical id",
            child.virtual_id()
        )));
    }
    child.entries().first().ok_or_else(|| {
        StorageError::InvariantViolation(format!(
            "cannot link to empty index page {}",
            child.logical_id()
        ))
    })
}

/// Clustered index entry: a key and the page holding rows from that key on.
///
/// Layout: key length u16, key bytes, logical page u64.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClusteredIndexInfo {
    pub key: Vec<u8>,
    pub logical_page_id: LogicalPageId,
}

impl ClusteredIndexInfo {
    pub fn new(key: impl Into<Vec<u8>>, logical_page_id: LogicalPageId) -> Self {
        Self {
            key: key.into(),
            logical_page_id,
        }
    }
}

impl IndexInfo for ClusteredIndexInfo {
    fn encoded_len(&self) -> usize {
        2 + self.key.len() + 8
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_key(&self.key, buf);
        buf.put_u64_le(self.logical_page_id.0);
    }

    fn decode<B: Buf>(buf: &mut B) -> StorageResult<Self> {
        let key = decode_key(buf, "clustered index entry")?;
        ensure_remaining(buf, 8, "clustered index entry")?;
        Ok(Self {
            key,
            logical_page_id: LogicalPageId(buf.get_u64_le()),
        })
    }

    fn link_to_page(child: &IndexPage<Self>) -> StorageResult<Self> {
        let lowest = lowest_entry(child)?;
        Ok(Self::new(lowest.key.clone(), child.logical_id()))
    }
}

/// Location of a row: its data page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowLocator {
    pub logical_page_id: LogicalPageId,
    pub slot: u16,
}

/// Unclustered index entry: a key, the row it refers to and, on
/// non-leaf pages, the child page.
///
/// Layout: key length u16, key bytes, row page u64, row slot u16, child u64.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnclusteredIndexInfo {
    pub key: Vec<u8>,
    pub row: RowLocator,
    /// Zero on leaf pages.
    pub child: LogicalPageId,
}

impl UnclusteredIndexInfo {
    pub fn leaf(key: impl Into<Vec<u8>>, row: RowLocator) -> Self {
        Self {
            key: key.into(),
            row,
            child: LogicalPageId::ZERO,
        }
    }
}

impl IndexInfo for UnclusteredIndexInfo {
    fn encoded_len(&self) -> usize {
        2 + self.key.len() + 8 + 2 + 8
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_key(&self.key, buf);
        buf.put_u64_le(self.row.logical_page_id.0);
        buf.put_u16_le(self.row.slot);
        buf.put_u64_le(self.child.0);
    }

    fn decode<B: Buf>(buf: &mut B) -> StorageResult<Self> {
        let key = decode_key(buf, "unclustered index entry")?;
        ensure_remaining(buf, 18, "unclustered index entry")?;
        let row = RowLocator {
            logical_page_id: LogicalPageId(buf.get_u64_le()),
            slot: buf.get_u16_le(),
        };
        Ok(Self {
            key,
            row,
            child: LogicalPageId(buf.get_u64_le()),
        })
    }

    fn link_to_page(child: &IndexPage<Self>) -> StorageResult<Self> {
        let lowest = lowest_entry(child)?;
        Ok(Self {
            key: lowest.key.clone(),
            row: lowest.row,
            child: child.logical_id(),
        })
    }
}

/// Descriptor of one index: where its root lives and how full to pack it.
///
/// Ordered by object, then index. Fixed 38-byte layout: index id u32,
/// object id u32, owner object id u32, name (16 bytes, zero padded),
/// root logical page u64, root depth u8, fill factor u8.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RootIndexInfo {
    pub object_id: ObjectId,
    pub index_id: IndexId,
    pub owner_object_id: ObjectId,
    name: [u8; Self::NAME_LEN],
    pub root_logical_id: LogicalPageId,
    pub root_depth: u8,
    fill_factor: u8,
}

impl RootIndexInfo {
    pub const NAME_LEN: usize = 16;
    pub const ENCODED_LEN: usize = 38;
    pub const DEFAULT_FILL_FACTOR: u8 = 90;

    pub fn new(object_id: ObjectId, index_id: IndexId, name: &str) -> Self {
        let mut info = Self {
            object_id,
            index_id,
            owner_object_id: object_id,
            name: [0; Self::NAME_LEN],
            root_logical_id: LogicalPageId::ZERO,
            root_depth: 0,
            fill_factor: Self::DEFAULT_FILL_FACTOR,
        };
        info.set_name(name);
        info
    }

    /// Name with trailing padding removed.
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(Self::NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Stores at most 16 bytes of `name`, cut on a character boundary.
    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(Self::NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = [0; Self::NAME_LEN];
        self.name[..end].copy_from_slice(&name.as_bytes()[..end]);
    }

    pub fn fill_factor(&self) -> u8 {
        self.fill_factor
    }

    /// 0 and 100 both mean "fill pages to capacity".
    pub fn set_fill_factor(&mut self, fill_factor: u8) -> StorageResult<()> {
        if fill_factor > 100 {
            return Err(StorageError::Other(format!(
                "fill factor must be between 0 and 100, got {}",
                fill_factor
            )));
        }
        self.fill_factor = fill_factor;
        Ok(())
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.index_id.0);
        buf.put_u32_le(self.object_id.0);
        buf.put_u32_le(self.owner_object_id.0);
        buf.put_slice(&self.name);
        buf.put_u64_le(self.root_logical_id.0);
        buf.put_u8(self.root_depth);
        buf.put_u8(self.fill_factor);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> StorageResult<Self> {
        ensure_remaining(buf, Self::ENCODED_LEN, "root index descriptor")?;
        let index_id = IndexId(buf.get_u32_le());
        let object_id = ObjectId(buf.get_u32_le());
        let owner_object_id = ObjectId(buf.get_u32_le());
        let mut name = [0u8; Self::NAME_LEN];
        buf.copy_to_slice(&mut name);
        let root_logical_id = LogicalPageId(buf.get_u64_le());
        let root_depth = buf.get_u8();
        let fill_factor = buf.get_u8();
        if fill_factor > 100 {
            return Err(StorageError::Corrupt(format!(
                "root index descriptor has fill factor {}",
                fill_factor
            )));
        }
        Ok(Self {
            object_id,
            index_id,
            owner_object_id,
            name,
            root_logical_id,
            root_depth,
            fill_factor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustered_ordering_and_layout() {
        let a = ClusteredIndexInfo::new(b"apple".to_vec(), LogicalPageId(9));
        let b = ClusteredIndexInfo::new(b"banana".to_vec(), LogicalPageId(1));
        assert!(a < b);

        let mut buf = Vec::new();
        a.encode(&mut buf);
        assert_eq!(buf.len(), a.encoded_len());
        assert_eq!(&buf[0..2], &5u16.to_le_bytes());
        assert_eq!(ClusteredIndexInfo::decode(&mut buf.as_slice()).unwrap(), a);
    }

    #[test]
    fn test_unclustered_orders_by_key_then_row() {
        let row = |page, slot| RowLocator {
            logical_page_id: LogicalPageId(page),
            slot,
        };
        let a = UnclusteredIndexInfo::leaf(b"k".to_vec(), row(1, 7));
        let b = UnclusteredIndexInfo::leaf(b"k".to_vec(), row(2, 0));
        let c = UnclusteredIndexInfo::leaf(b"l".to_vec(), row(0, 0));
        assert!(a < b && b < c);

        let mut buf = Vec::new();
        b.encode(&mut buf);
        assert_eq!(buf.len(), b.encoded_len());
        assert_eq!(UnclusteredIndexInfo::decode(&mut buf.as_slice()).unwrap(), b);
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let entry = ClusteredIndexInfo::new(b"abcdef".to_vec(), LogicalPageId(3));
        let mut buf = Vec::new();
        entry.encode(&mut buf);

        let mut short = &buf[..buf.len() - 1];
        assert!(matches!(
            ClusteredIndexInfo::decode(&mut short),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_root_index_info() {
        let mut info = RootIndexInfo::new(ObjectId(4), IndexId(2), "orders_by_customer_id");
        assert_eq!(info.name(), "orders_by_custom");
        assert_eq!(info.fill_factor(), 90);
        assert!(info.set_fill_factor(101).is_err());
        info.set_fill_factor(75).unwrap();
        info.root_logical_id = LogicalPageId(12);
        info.root_depth = 2;

        let mut buf = Vec::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), RootIndexInfo::ENCODED_LEN);
        assert_eq!(RootIndexInfo::decode(&mut buf.as_slice()).unwrap(), info);

        let other = RootIndexInfo::new(ObjectId(4), IndexId(3), "x");
        assert!(info < other);
    }
}
