//! Variable-length key index
//!
//! General index backend for keys the packed-int and fixed-len
//! backends cannot take: a key pool with offsets in physical order
//! plus a bytewise-sorted permutation. Saved with the `.nlt` suffix
//! like the other general-key backends.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ReadableStore, RecVec, StoreCursor};
use crate::index::{IndexCursor, ReadableIndex, SeekResult};
use crate::{EngineError, Result};

const MAGIC: &[u8; 8] = b"STRASKEY";
pub const SORTED_KEY_SUFFIX: &str = "nlt";

#[derive(Serialize, Deserialize)]
struct Disk {
    pool: Vec<u8>,
    offsets: Vec<u64>,
    perm: Vec<u32>,
    unique: bool,
}

pub struct SortedKeyIndex {
    pool: Vec<u8>,
    /// `offsets[i]..offsets[i+1]` is the key of physical id `i`
    offsets: Vec<u64>,
    perm: Vec<u32>,
    unique: bool,
}

impl SortedKeyIndex {
    pub fn build(recs: &RecVec, unique: bool) -> Result<Self> {
        let rows = recs.len();
        let mut pool = Vec::new();
        let mut offsets = Vec::with_capacity(rows + 1);
        offsets.push(0u64);
        for i in 0..rows {
            pool.extend_from_slice(recs.get(i));
            offsets.push(pool.len() as u64);
        }
        let mut perm: Vec<u32> = (0..rows as u32).collect();
        perm.sort_by(|&a, &b| {
            let ka = &pool[offsets[a as usize] as usize..offsets[a as usize + 1] as usize];
            let kb = &pool[offsets[b as usize] as usize..offsets[b as usize + 1] as usize];
            ka.cmp(kb)
        });
        Ok(Self {
            pool,
            offsets,
            perm,
            unique,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 8 || &bytes[..8] != MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad key index header", path.display()),
            )));
        }
        let disk: Disk = bincode::deserialize(&bytes[8..]).map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Self {
            pool: disk.pool,
            offsets: disk.offsets,
            perm: disk.perm,
            unique: disk.unique,
        })
    }

    fn rows(&self) -> u64 {
        (self.offsets.len() - 1) as u64
    }

    fn key_at(&self, phys: u64) -> &[u8] {
        let i = phys as usize;
        &self.pool[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    fn lower_bound(&self, key: &[u8]) -> usize {
        self.perm
            .partition_point(|&i| self.key_at(i as u64) < key)
    }
}

impl ReadableIndex for SortedKeyIndex {
    fn num_index_rows(&self) -> u64 {
        self.rows()
    }

    fn index_storage_size(&self) -> u64 {
        (self.pool.len() + self.offsets.len() * 8 + self.perm.len() * 4) as u64
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> Result<()> {
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
            SORTED_KEY_SUFFIX
        );
        let disk = Disk {
            pool: self.pool.clone(),
            offsets: self.offsets.clone(),
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

impl ReadableStore for SortedKeyIndex {
    fn num_data_rows(&self) -> u64 {
        self.rows()
    }

    fn data_inflate_size(&self) -> u64 {
        self.pool.len() as u64
    }

    fn data_storage_size(&self) -> u64 {
        (self.pool.len() + self.offsets.len() * 8) as u64
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
    index: &'a SortedKeyIndex,
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
    index: &'a SortedKeyIndex,
    slot: usize,
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
        let phys = self.index.perm[self.slot] as u64;
        let exact = self.index.key_at(phys) == key;
        *id = phys;
        key_out.clear();
        key_out.extend_from_slice(self.index.key_at(phys));
        self.slot += 1;
        Ok(if exact {
            SeekResult::Exact
        } else {
            SeekResult::Greater
        })
    }

    fn next(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> Result<bool> {
        if self.slot >= self.index.perm.len() {
            return Ok(false);
        }
        let phys = self.index.perm[self.slot] as u64;
        *id = phys;
        key_out.clear();
        key_out.extend_from_slice(self.index.key_at(phys));
        self.slot += 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.slot = 0;
    }
}
