//! Index contract
//!
//! Segments only ever see indices through [`ReadableIndex`]: exact
//! search by key bytes, an ordered cursor with `seek_lower_bound`, and
//! a read-only view of the backing store used for row reconstruction
//! on readonly segments.
//!
//! Ids returned by an index are *physical* ids; the owning segment
//! translates them to logical ids through its purge bitmap.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::ReadableStore;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// Positioned on a key equal to the target
    Exact,
    /// Positioned on the first key greater than the target
    Greater,
    /// No key >= target exists
    End,
}

pub trait ReadableIndex: Send + Sync {
    fn num_index_rows(&self) -> u64;

    fn index_storage_size(&self) -> u64;

    fn is_unique(&self) -> bool;

    /// Append the physical ids of all records whose key equals `key`.
    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> Result<()>;

    fn cursor(&self) -> Box<dyn IndexCursor + '_>;

    /// Read-only view of the underlying key store, when the index can
    /// serve row reconstruction. In-memory writable indices cannot.
    fn readable_store(self: Arc<Self>) -> Option<Arc<dyn ReadableStore>>;

    /// Persist as `<base>.<suffix>`; returns the file name written.
    fn save(&self, base: &Path) -> Result<String>;
}

/// Ordered cursor over `(key, physical id)` pairs.
pub trait IndexCursor {
    fn seek_lower_bound(
        &mut self,
        key: &[u8],
        id: &mut u64,
        key_out: &mut Vec<u8>,
    ) -> Result<SeekResult>;

    fn next(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> Result<bool>;

    fn reset(&mut self);
}

// ============================================================================
// MemKeyIndex — writable segment index
// ============================================================================

/// Ordered in-memory index for writable segments. Maintained by the
/// table on every append/update/remove; never persisted (the converter
/// rebuilds a compressed index from the frozen data).
pub struct MemKeyIndex {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u64>>>,
    unique: bool,
}

impl MemKeyIndex {
    pub fn new(unique: bool) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            unique,
        }
    }

    pub fn insert(&self, key: &[u8], id: u64) {
        let mut map = self.map.write();
        map.entry(key.to_vec()).or_default().push(id);
    }

    pub fn remove(&self, key: &[u8], id: u64) {
        let mut map = self.map.write();
        if let Some(ids) = map.get_mut(key) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                map.remove(key);
            }
        }
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

impl ReadableIndex for MemKeyIndex {
    fn num_index_rows(&self) -> u64 {
        self.map.read().values().map(|v| v.len() as u64).sum()
    }

    fn index_storage_size(&self) -> u64 {
        let map = self.map.read();
        map.iter()
            .map(|(k, v)| (k.len() + v.len() * 8) as u64)
            .sum()
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> Result<()> {
        if let Some(ids) = self.map.read().get(key) {
            out.extend_from_slice(ids);
        }
        Ok(())
    }

    fn cursor(&self) -> Box<dyn IndexCursor + '_> {
        Box::new(MemIndexCursor {
            index: self,
            // (key, position within the key's id list) of the next entry
            pos: None,
        })
    }

    fn readable_store(self: Arc<Self>) -> Option<Arc<dyn ReadableStore>> {
        None
    }

    fn save(&self, _base: &Path) -> Result<String> {
        Err(crate::EngineError::logic(
            "in-memory index is rebuilt by conversion, not saved",
        ))
    }
}

struct MemIndexCursor<'a> {
    index: &'a MemKeyIndex,
    pos: Option<(Vec<u8>, usize)>,
}

impl MemIndexCursor<'_> {
    fn emit(
        &mut self,
        key: &[u8],
        slot: usize,
        id: &mut u64,
        key_out: &mut Vec<u8>,
    ) -> Result<bool> {
        let map = self.index.map.read();
        if let Some(ids) = map.get(key) {
            if slot < ids.len() {
                *id = ids[slot];
                key_out.clear();
                key_out.extend_from_slice(key);
                self.pos = Some((key.to_vec(), slot + 1));
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl IndexCursor for MemIndexCursor<'_> {
    fn seek_lower_bound(
        &mut self,
        key: &[u8],
        id: &mut u64,
        key_out: &mut Vec<u8>,
    ) -> Result<SeekResult> {
        let found = {
            let map = self.index.map.read();
            map.range(key.to_vec()..).next().map(|(k, _)| k.clone())
        };
        match found {
            None => {
                self.pos = None;
                Ok(SeekResult::End)
            }
            Some(k) => {
                let exact = k.as_slice() == key;
                self.emit(&k, 0, id, key_out)?;
                Ok(if exact {
                    SeekResult::Exact
                } else {
                    SeekResult::Greater
                })
            }
        }
    }

    fn next(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> Result<bool> {
        let (key, slot) = match self.pos.clone() {
            None => return Ok(false),
            Some(p) => p,
        };
        if self.emit(&key, slot, id, key_out)? {
            return Ok(true);
        }
        // advance to the next key
        let next_key = {
            let map = self.index.map.read();
            map.range((
                std::ops::Bound::Excluded(key),
                std::ops::Bound::Unbounded,
            ))
                .next()
                .map(|(k, _)| k.clone())
        };
        match next_key {
            None => {
                self.pos = None;
                Ok(false)
            }
            Some(k) => self.emit(&k, 0, id, key_out),
        }
    }

    fn reset(&mut self) {
        self.pos = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_index_search() {
        let idx = MemKeyIndex::new(false);
        idx.insert(b"b", 1);
        idx.insert(b"a", 0);
        idx.insert(b"b", 2);
        let mut ids = Vec::new();
        idx.search_exact_append(b"b", &mut ids).unwrap();
        assert_eq!(ids, vec![1, 2]);
        idx.remove(b"b", 1);
        ids.clear();
        idx.search_exact_append(b"b", &mut ids).unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_mem_index_cursor_order() {
        let idx = MemKeyIndex::new(true);
        idx.insert(b"cherry", 2);
        idx.insert(b"apple", 0);
        idx.insert(b"banana", 1);
        let mut c = idx.cursor();
        let mut id = 0u64;
        let mut key = Vec::new();
        assert_eq!(
            c.seek_lower_bound(b"b", &mut id, &mut key).unwrap(),
            SeekResult::Greater
        );
        assert_eq!(key, b"banana");
        assert_eq!(id, 1);
        assert!(c.next(&mut id, &mut key).unwrap());
        assert_eq!(key, b"cherry");
        assert!(!c.next(&mut id, &mut key).unwrap());
    }
}
