//! Min/max bit-width packed integer stores
//!
//! A single-integer-column group is packed as `value - min` in
//! `width` bits, where `width` covers `max - min`. `ZipIntStore` is the
//! plain store; `ZipIntKeyIndex` additionally keeps a sorted
//! permutation for key lookups. Build fails on records that are not
//! the column's exact width; callers fall back to a fixed-length store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ReadableStore, RecVec, StoreCursor};
use crate::index::{IndexCursor, ReadableIndex, SeekResult};
use crate::schema::ColumnType;
use crate::{EngineError, Result};

pub const ZINT_SUFFIX: &str = "zint";
const MAGIC_STORE: &[u8; 8] = b"STRAZINT";
const MAGIC_INDEX: &[u8; 8] = b"STRAZIDX";

fn decode_int(bytes: &[u8], ctype: ColumnType) -> i128 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    let raw = u64::from_le_bytes(buf);
    if ctype.is_signed() {
        let bits = bytes.len() * 8;
        let shifted = (raw as i64) << (64 - bits);
        (shifted >> (64 - bits)) as i128
    } else {
        raw as i128
    }
}

fn encode_int(v: i128, fixlen: usize, out: &mut Vec<u8>) {
    let raw = v as i64 as u64;
    out.extend_from_slice(&raw.to_le_bytes()[..fixlen]);
}

// ============================================================================
// Packed payload shared by store and index
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Packed {
    ctype: ColumnType,
    fixlen: u32,
    min: i128,
    width: u32,
    rows: u64,
    words: Vec<u64>,
}

impl Packed {
    fn build(ctype: ColumnType, recs: &RecVec) -> Result<Self> {
        let fixlen = ctype.fixed_size();
        if !ctype.is_integer() || fixlen == 0 {
            return Err(EngineError::invalid("zip-int needs an integer column"));
        }
        if recs.fixlen != fixlen {
            return Err(EngineError::invalid(format!(
                "zip-int build: record width {} != column width {}",
                recs.fixlen, fixlen
            )));
        }
        let rows = recs.len();
        let mut min = i128::MAX;
        let mut max = i128::MIN;
        for i in 0..rows {
            let v = decode_int(recs.get(i), ctype);
            min = min.min(v);
            max = max.max(v);
        }
        if rows == 0 {
            min = 0;
            max = 0;
        }
        let span = (max - min) as u128;
        let width = (128 - span.leading_zeros()).min(64);
        let mut words = vec![0u64; ((rows as u64 * width as u64 + 63) / 64) as usize];
        for i in 0..rows {
            let v = decode_int(recs.get(i), ctype);
            let diff = (v - min) as u128 as u64;
            set_bits(&mut words, i as u64 * width as u64, width, diff);
        }
        Ok(Self {
            ctype,
            fixlen: fixlen as u32,
            min,
            width,
            rows: rows as u64,
            words,
        })
    }

    #[inline]
    fn diff(&self, i: u64) -> u64 {
        get_bits(&self.words, i * self.width as u64, self.width)
    }

    #[inline]
    fn value(&self, i: u64) -> i128 {
        self.min + self.diff(i) as i128
    }

    fn append_value(&self, i: u64, out: &mut Vec<u8>) {
        encode_int(self.value(i), self.fixlen as usize, out);
    }

    fn storage_size(&self) -> u64 {
        self.words.len() as u64 * 8 + 64
    }
}

fn set_bits(words: &mut [u64], pos: u64, width: u32, v: u64) {
    if width == 0 {
        return;
    }
    let w = (pos / 64) as usize;
    let off = (pos % 64) as u32;
    words[w] |= v << off;
    if off + width > 64 {
        words[w + 1] |= v >> (64 - off);
    }
}

fn get_bits(words: &[u64], pos: u64, width: u32) -> u64 {
    if width == 0 {
        return 0;
    }
    let w = (pos / 64) as usize;
    let off = (pos % 64) as u32;
    let mask = if width == 64 { !0u64 } else { (1u64 << width) - 1 };
    let mut v = words[w] >> off;
    if off + width > 64 {
        v |= words[w + 1] << (64 - off);
    }
    v & mask
}

fn write_packed(magic: &[u8; 8], path: &Path, body: &impl Serialize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(magic)?;
    let bytes = bincode::serialize(body)
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    f.write_all(&bytes)?;
    f.sync_all()?;
    Ok(())
}

fn read_packed<T: for<'de> Deserialize<'de>>(magic: &[u8; 8], path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 8 || &bytes[..8] != magic {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: bad zip-int header", path.display()),
        )));
    }
    bincode::deserialize(&bytes[8..])
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

// ============================================================================
// ZipIntStore
// ============================================================================

pub struct ZipIntStore {
    packed: Packed,
}

impl ZipIntStore {
    pub fn build(ctype: ColumnType, recs: &RecVec) -> Result<Self> {
        Ok(Self {
            packed: Packed::build(ctype, recs)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            packed: read_packed(MAGIC_STORE, path)?,
        })
    }
}

impl ReadableStore for ZipIntStore {
    fn num_data_rows(&self) -> u64 {
        self.packed.rows
    }

    fn data_inflate_size(&self) -> u64 {
        self.packed.rows * self.packed.fixlen as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.packed.storage_size()
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.packed.rows {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.packed.rows,
            });
        }
        self.packed.append_value(id, out);
        Ok(())
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(ZintCursor {
            store: self,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            ZINT_SUFFIX
        );
        write_packed(MAGIC_STORE, &base.with_file_name(&fname), &self.packed)?;
        Ok(fname)
    }
}

struct ZintCursor<'a> {
    store: &'a ZipIntStore,
    next_id: u64,
}

impl StoreCursor for ZintCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.next_id >= self.store.packed.rows {
            return Ok(None);
        }
        let id = self.next_id;
        self.store.packed.append_value(id, out);
        self.next_id += 1;
        Ok(Some(id))
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.store.packed.rows {
            return Ok(false);
        }
        self.store.packed.append_value(id, out);
        self.next_id = id + 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = 0;
    }
}

// ============================================================================
// ZipIntKeyIndex
// ============================================================================

#[derive(Serialize, Deserialize)]
struct ZipIntIndexDisk {
    packed: Packed,
    perm: Vec<u32>,
    unique: bool,
}

pub struct ZipIntKeyIndex {
    packed: Packed,
    /// Physical ids ordered by key value
    perm: Vec<u32>,
    unique: bool,
}

impl ZipIntKeyIndex {
    pub fn build(ctype: ColumnType, recs: &RecVec, unique: bool) -> Result<Self> {
        let packed = Packed::build(ctype, recs)?;
        let mut perm: Vec<u32> = (0..packed.rows as u32).collect();
        perm.sort_by_key(|&i| packed.diff(i as u64));
        Ok(Self {
            packed,
            perm,
            unique,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let disk: ZipIntIndexDisk = read_packed(MAGIC_INDEX, path)?;
        Ok(Self {
            packed: disk.packed,
            perm: disk.perm,
            unique: disk.unique,
        })
    }

    fn key_value(&self, key: &[u8]) -> Result<i128> {
        if key.len() != self.packed.fixlen as usize {
            return Err(EngineError::invalid(format!(
                "key width {} != column width {}",
                key.len(),
                self.packed.fixlen
            )));
        }
        Ok(decode_int(key, self.packed.ctype))
    }

    /// First permutation slot whose key is >= `val`.
    fn lower_bound(&self, val: i128) -> usize {
        self.perm
            .partition_point(|&i| self.packed.value(i as u64) < val)
    }
}

impl ReadableIndex for ZipIntKeyIndex {
    fn num_index_rows(&self) -> u64 {
        self.packed.rows
    }

    fn index_storage_size(&self) -> u64 {
        self.packed.storage_size() + self.perm.len() as u64 * 4
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> Result<()> {
        let val = self.key_value(key)?;
        let mut slot = self.lower_bound(val);
        while slot < self.perm.len() {
            let id = self.perm[slot] as u64;
            if self.packed.value(id) != val {
                break;
            }
            out.push(id);
            slot += 1;
        }
        Ok(())
    }

    fn cursor(&self) -> Box<dyn IndexCursor + '_> {
        Box::new(ZintIndexCursor {
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
            ZINT_SUFFIX
        );
        let disk = ZipIntIndexDisk {
            packed: self.packed.clone(),
            perm: self.perm.clone(),
            unique: self.unique,
        };
        write_packed(MAGIC_INDEX, &base.with_file_name(&fname), &disk)?;
        Ok(fname)
    }
}

impl ReadableStore for ZipIntKeyIndex {
    fn num_data_rows(&self) -> u64 {
        self.packed.rows
    }

    fn data_inflate_size(&self) -> u64 {
        self.packed.rows * self.packed.fixlen as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.packed.storage_size()
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.packed.rows {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.packed.rows,
            });
        }
        self.packed.append_value(id, out);
        Ok(())
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(ZintKeyStoreCursor {
            index: self,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        ReadableIndex::save(self, base)
    }
}

struct ZintKeyStoreCursor<'a> {
    index: &'a ZipIntKeyIndex,
    next_id: u64,
}

impl StoreCursor for ZintKeyStoreCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.next_id >= self.index.packed.rows {
            return Ok(None);
        }
        let id = self.next_id;
        self.index.packed.append_value(id, out);
        self.next_id += 1;
        Ok(Some(id))
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.index.packed.rows {
            return Ok(false);
        }
        self.index.packed.append_value(id, out);
        self.next_id = id + 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = 0;
    }
}

struct ZintIndexCursor<'a> {
    index: &'a ZipIntKeyIndex,
    slot: usize,
}

impl IndexCursor for ZintIndexCursor<'_> {
    fn seek_lower_bound(&mut self, key: &[u8], id: &mut u64, key_out: &mut Vec<u8>) -> Result<SeekResult> {
        let val = self.index.key_value(key)?;
        self.slot = self.index.lower_bound(val);
        if self.slot >= self.index.perm.len() {
            return Ok(SeekResult::End);
        }
        let phys = self.index.perm[self.slot] as u64;
        *id = phys;
        key_out.clear();
        self.index.packed.append_value(phys, key_out);
        self.slot += 1;
        if self.index.packed.value(phys) == val {
            Ok(SeekResult::Exact)
        } else {
            Ok(SeekResult::Greater)
        }
    }

    fn next(&mut self, id: &mut u64, key_out: &mut Vec<u8>) -> Result<bool> {
        if self.slot >= self.index.perm.len() {
            return Ok(false);
        }
        let phys = self.index.perm[self.slot] as u64;
        *id = phys;
        key_out.clear();
        self.index.packed.append_value(phys, key_out);
        self.slot += 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.slot = 0;
    }
}
