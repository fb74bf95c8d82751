//! Fixed-length key index
//!
//! Keys of at most 16 bytes, kept densely in physical order plus a
//! bytewise-sorted permutation for binary search. Doubles as the
//! column store of its group.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ReadableStore, RecVec, StoreCursor};
use crate::index::{IndexCursor, ReadableIndex, SeekResult};
use crate::{EngineError, Result};

const MAGIC: &[u8; 8] = b"STRAFKEY";
pub const FIXKEY_SUFFIX: &str = "fixlen";

#[derive(Serialize, Deserialize)]
struct Disk {
    fixlen: u32,
    pool: Vec<u8>,
    perm: Vec<u32>,
    unique: bool,
}

pub struct FixedLenKeyIndex {
    fixlen: usize,
    /// Keys in physical id order
    pool: Vec<u8>,
    /// Physical ids ordered by key bytes
    perm: Vec<u32>,
    unique: bool,
}

impl FixedLenKeyIndex {
    pub fn build(recs: &RecVec, unique: bool) -> Result<Self> {
        let fixlen = recs.fixlen;
        if fixlen == 0 {
            return Err(EngineError::invalid(
                "fixed-len key index needs fixed-length keys",
            ));
        }
        let rows = recs.len();
        let mut perm: Vec<u32> = (0..rows as u32).collect();
        perm.sort_by(|&a, &b| recs.get(a as usize).cmp(recs.get(b as usize)));
        let mut pool = Vec::with_capacity(rows * fixlen);
        for i in 0..rows {
            pool.extend_from_slice(recs.get(i));
        }
        Ok(Self {
            fixlen,
            pool,
            perm,
            unique,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 8 || &bytes[..8] != MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad fixed-len key index header", path.display()),
            )));
        }
        let disk: Disk = bincode::deserialize(&bytes[8..]).map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Self {
            fixlen: disk.fixlen as usize,
            pool: disk.pool,
            perm: disk.perm,
            unique: disk.unique,
        })
    }

    fn rows(&self) -> u64 {
        (self.pool.len() / self.fixlen.max(1)) as u64
    }

    fn key_at(&self, phys: u64) -> &[u8] {
        let beg = phys as usize * self.fixlen;
        &self.pool[beg..beg + self.fixlen]
    }

    /// First permutation slot whose key is >= `key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        self.perm
            .partition_point(|&i| self.key_at(i as u64) < key)
    }
}

impl ReadableIndex for FixedLenKeyIndex {
    fn num_index_rows(&self) -> u64 {
        self.rows()
    }

    fn index_storage_size(&self) -> u64 {
        (self.pool.len() + self.perm.len() * 4) as u64
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> Result<()> {
        if key.len() != self.fixlen {
            return Err(EngineError::invalid(format!(
                "key width {} != index key width {}",
                key.len(),
                self.fixlen
            )));
        }
        let mut slot = self.lower_bound(key);
        while slot < self.perm.len() && self.key_at(self.perm[slot] as u64) == key {
            out.push(self.perm[slot] as u64);
            slot += 1;
        }
        Ok(())
    }

    fn cursor(&self) -> Box<dyn IndexCursor + '_> {
        Box::new(Cursor {
            index: self,
            slot: 0,
        })
    }

    fn readable_store(self: Arc<Self>) -> Option<Arc<dyn ReadableStore>> {
        Some(self)
    }

    fn save(&self, base: &Path) -> Result<String> {
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            FIXKEY_SUFFIX
        );
        let disk = Disk {
            fixlen: self.fixlen as u32,
            pool: self.pool.clone(),
            perm: self.perm.clone(),
            unique: self.unique,
        };
        let mut f = std::fs::File::create(base.with_file_name(&fname))?;
        f.write_all(MAGIC)?;
        let body = bincode::serialize(&disk).map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        f.write_all(&body)?;
        f.sync_all()?;
        Ok(fname)
    }
}

impl ReadableStore for FixedLenKeyIndex {
    fn num_data_rows(&self) -> u64 {
        self.rows()
    }

    fn data_inflate_size(&self) -> u64 {
        self.pool.len() as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.pool.len() as u64
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.rows() {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.rows(),
            });
        }
        out.extend_from_slice(self.key_at(id));
        Ok(())
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(StoreCur {
            index: self,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        ReadableIndex::save(self, base)
    }
}

struct StoreCur<'a> {
    index: &'a FixedLenKeyIndex,
    next_id: u64,
}

impl StoreCursor for StoreCur<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.next_id >= self.index.rows() {
            return Ok(None);
        }
        let id = self.next_id;
        out.extend_from_slice(self.index.key_at(id));
        self.next_id = id + 1;
        Ok(Some(id))
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.index.rows() {
            return Ok(false);
        }
        out.extend_from_slice(self.index.key_at(id));
        self.next_id = id + 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = 0;
    }
}

struct Cursor<'a> {
    index: &'a FixedLenKeyIndex,
    slot: usize,
}

impl Cursor<'_> {
    fn emit(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> bool {
        if self.slot >= self.index.perm.len() {
            return false;
        }
        let phys = self.index.perm[self.slot] as u64;
        *id = phys;
        key_out.clear();
        key_out.extend_from_slice(self.index.key_at(phys));
        self.slot += 1;
        true
    }
}

impl IndexCursor for Cursor<'_> {
    fn seek_lower_bound(
        &mut self,
        key: &[u8],
        id: &mut u64,
        key_out: &mut Vec<u8>,
    ) -> Result<SeekResult> {
        self.slot = self.index.lower_bound(key);
        if self.slot >= self.index.perm.len() {
            return Ok(SeekResult::End);
        }
        let exact = self.index.key_at(self.index.perm[self.slot] as u64) == key;
        self.emit(id, key_out);
        Ok(if exact {
            SeekResult::Exact
        } else {
            SeekResult::Greater
        })
    }

    fn next(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> Result<bool> {
        Ok(self.emit(id, key_out))
    }

    fn reset(&mut self) {
        self.slot = 0;
    }
}
