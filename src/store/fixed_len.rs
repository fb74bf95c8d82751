//! Fixed-length row store
//!
//! Dense byte array of `fixlen × rows`. The only backend that supports
//! in-place updates: a row slot may be overwritten without rewriting
//! the store, which is what keeps in-place updatable column groups and
//! the converter's update replay cheap. Loaded as a writable mapping so
//! slot writes on a readonly segment persist.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use super::{ReadableStore, StoreCursor};
use crate::schema::Schema;
use crate::{EngineError, Result};

const MAGIC: &[u8; 8] = b"STRAFLEN";
const HEADER_SIZE: usize = 24; // magic + fixlen u64 + rows u64

pub const FIXLEN_SUFFIX: &str = "fixlen";

enum Inner {
    Heap(Vec<u8>),
    Map { mmap: MmapMut, rows: usize },
}

pub struct FixedLenStore {
    fixlen: usize,
    inner: RwLock<Inner>,
}

impl FixedLenStore {
    pub fn new(schema: &Schema) -> Self {
        debug_assert!(schema.fixed_row_len() > 0);
        Self::with_fixlen(schema.fixed_row_len())
    }

    pub fn with_fixlen(fixlen: usize) -> Self {
        Self {
            fixlen,
            inner: RwLock::new(Inner::Heap(Vec::new())),
        }
    }

    pub fn fixlen(&self) -> usize {
        self.fixlen
    }

    pub fn reserve_rows(&self, rows: usize) {
        if let Inner::Heap(pool) = &mut *self.inner.write() {
            pool.reserve(rows * self.fixlen);
        }
    }

    /// Append one record, returning its id.
    pub fn append(&self, rec: &[u8]) -> Result<u64> {
        if rec.len() != self.fixlen {
            return Err(EngineError::invalid(format!(
                "fixed-len store expects {} bytes, got {}",
                self.fixlen,
                rec.len()
            )));
        }
        match &mut *self.inner.write() {
            Inner::Heap(pool) => {
                let id = (pool.len() / self.fixlen) as u64;
                pool.extend_from_slice(rec);
                Ok(id)
            }
            Inner::Map { .. } => Err(EngineError::logic(
                "append on a mapped fixed-len store",
            )),
        }
    }

    /// Overwrite the whole slot of `id`.
    pub fn write_row(&self, id: u64, rec: &[u8]) -> Result<()> {
        if rec.len() != self.fixlen {
            return Err(EngineError::invalid(format!(
                "fixed-len store expects {} bytes, got {}",
                self.fixlen,
                rec.len()
            )));
        }
        let mut inner = self.inner.write();
        let rows = rows_of(&inner, self.fixlen);
        if id >= rows {
            return Err(EngineError::OutOfRange { id, rows });
        }
        let beg = id as usize * self.fixlen;
        match &mut *inner {
            Inner::Heap(pool) => pool[beg..beg + self.fixlen].copy_from_slice(rec),
            Inner::Map { mmap, .. } => {
                mmap[HEADER_SIZE + beg..HEADER_SIZE + beg + self.fixlen].copy_from_slice(rec)
            }
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` inside the slot of `id`.
    pub fn read_slot(&self, id: u64, offset: usize, len: usize, out: &mut Vec<u8>) -> Result<()> {
        debug_assert!(offset + len <= self.fixlen);
        let inner = self.inner.read();
        let rows = rows_of(&inner, self.fixlen);
        if id >= rows {
            return Err(EngineError::OutOfRange { id, rows });
        }
        let beg = id as usize * self.fixlen + offset;
        match &*inner {
            Inner::Heap(pool) => out.extend_from_slice(&pool[beg..beg + len]),
            Inner::Map { mmap, .. } => {
                out.extend_from_slice(&mmap[HEADER_SIZE + beg..HEADER_SIZE + beg + len])
            }
        }
        Ok(())
    }

    /// Copy one slot from another fixed-len store of the same width.
    pub fn copy_row_from(&self, dst_id: u64, src: &FixedLenStore, src_id: u64) -> Result<()> {
        debug_assert_eq!(self.fixlen, src.fixlen);
        let mut buf = Vec::with_capacity(self.fixlen);
        src.read_slot(src_id, 0, src.fixlen, &mut buf)?;
        self.write_row(dst_id, &buf)
    }

    pub fn shrink_to_fit(&self) {
        if let Inner::Heap(pool) = &mut *self.inner.write() {
            pool.shrink_to_fit();
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn write_file(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let rows = rows_of(&inner, self.fixlen);
        let mut f = std::fs::File::create(path)?;
        f.write_all(MAGIC)?;
        f.write_all(&(self.fixlen as u64).to_le_bytes())?;
        f.write_all(&rows.to_le_bytes())?;
        match &*inner {
            Inner::Heap(pool) => f.write_all(pool)?,
            Inner::Map { mmap, .. } => f.write_all(&mmap[HEADER_SIZE..])?,
        }
        f.sync_all()?;
        Ok(())
    }

    fn open_map(path: &Path) -> Result<(MmapMut, usize, usize)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if mmap.len() < HEADER_SIZE || &mmap[..8] != MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad fixed-len store header", path.display()),
            )));
        }
        let fixlen = u64::from_le_bytes(mmap[8..16].try_into().unwrap()) as usize;
        let rows = u64::from_le_bytes(mmap[16..24].try_into().unwrap()) as usize;
        if fixlen == 0 || mmap.len() < HEADER_SIZE + fixlen * rows {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: fixed-len store truncated", path.display()),
            )));
        }
        Ok((mmap, fixlen, rows))
    }

    /// Load as a writable mapping (readonly segments, in-place updates
    /// write through).
    pub fn load(schema: &Schema, path: &Path) -> Result<Self> {
        let (mmap, fixlen, rows) = Self::open_map(path)?;
        if schema.fixed_row_len() != 0 && schema.fixed_row_len() != fixlen {
            return Err(EngineError::invalid(format!(
                "{}: fixlen {} does not match schema {}",
                path.display(),
                fixlen,
                schema.fixed_row_len()
            )));
        }
        Ok(Self {
            fixlen,
            inner: RwLock::new(Inner::Map { mmap, rows }),
        })
    }

    /// Load into heap memory (writable segments keep appending).
    pub fn load_heap(schema: &Schema, path: &Path) -> Result<Self> {
        let (mmap, fixlen, rows) = Self::open_map(path)?;
        if schema.fixed_row_len() != 0 && schema.fixed_row_len() != fixlen {
            return Err(EngineError::invalid(format!(
                "{}: fixlen {} does not match schema {}",
                path.display(),
                fixlen,
                schema.fixed_row_len()
            )));
        }
        let pool = mmap[HEADER_SIZE..HEADER_SIZE + fixlen * rows].to_vec();
        Ok(Self {
            fixlen,
            inner: RwLock::new(Inner::Heap(pool)),
        })
    }

    pub fn flush(&self) -> Result<()> {
        if let Inner::Map { mmap, .. } = &*self.inner.read() {
            mmap.flush()?;
        }
        Ok(())
    }
}

fn rows_of(inner: &Inner, fixlen: usize) -> u64 {
    match inner {
        Inner::Heap(pool) => (pool.len() / fixlen) as u64,
        Inner::Map { rows, .. } => *rows as u64,
    }
}

impl ReadableStore for FixedLenStore {
    fn num_data_rows(&self) -> u64 {
        rows_of(&self.inner.read(), self.fixlen)
    }

    fn data_inflate_size(&self) -> u64 {
        self.num_data_rows() * self.fixlen as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.data_inflate_size() + HEADER_SIZE as u64
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        self.read_slot(id, 0, self.fixlen, out)
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(FixedCursor {
            store: self,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            FIXLEN_SUFFIX
        );
        self.write_file(&base.with_file_name(&fname))?;
        Ok(fname)
    }

    fn as_fixed_len(&self) -> Option<&FixedLenStore> {
        Some(self)
    }
}

struct FixedCursor<'a> {
    store: &'a FixedLenStore,
    next_id: u64,
}

impl StoreCursor for FixedCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.next_id >= self.store.num_data_rows() {
            return Ok(None);
        }
        let id = self.next_id;
        self.store.get_value_append(id, out)?;
        self.next_id += 1;
        Ok(Some(id))
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.store.num_data_rows() {
            return Ok(false);
        }
        self.store.get_value_append(id, out)?;
        self.next_id = id + 1;
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType};
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::new(
            "score",
            vec![ColumnMeta {
                name: "score".into(),
                ctype: ColumnType::Float64,
            }],
            vec![0],
        )
    }

    #[test]
    fn test_append_update_read() {
        let s = FixedLenStore::new(&schema());
        let id0 = s.append(&1.0f64.to_le_bytes()).unwrap();
        let id1 = s.append(&2.0f64.to_le_bytes()).unwrap();
        assert_eq!((id0, id1), (0, 1));
        s.write_row(1, &9.5f64.to_le_bytes()).unwrap();
        let mut out = Vec::new();
        s.get_value(1, &mut out).unwrap();
        assert_eq!(out, 9.5f64.to_le_bytes());
        assert!(s.write_row(2, &0.0f64.to_le_bytes()).is_err());
    }

    #[test]
    fn test_save_load_inplace_write_persists() {
        let dir = tempdir().unwrap();
        let sch = schema();
        let s = FixedLenStore::new(&sch);
        for i in 0..10 {
            s.append(&(i as f64).to_le_bytes()).unwrap();
        }
        let base = dir.path().join("colgroup-score");
        let fname = s.save(&base).unwrap();
        assert_eq!(fname, "colgroup-score.fixlen");

        let loaded = FixedLenStore::load(&sch, &dir.path().join(&fname)).unwrap();
        assert_eq!(loaded.num_data_rows(), 10);
        loaded.write_row(3, &42.0f64.to_le_bytes()).unwrap();
        loaded.flush().unwrap();
        drop(loaded);

        let again = FixedLenStore::load(&sch, &dir.path().join(&fname)).unwrap();
        let mut out = Vec::new();
        again.get_value(3, &mut out).unwrap();
        assert_eq!(out, 42.0f64.to_le_bytes());
    }

    #[test]
    fn test_cursor_reset() {
        let s = FixedLenStore::with_fixlen(2);
        s.append(b"ab").unwrap();
        s.append(b"cd").unwrap();
        let mut c = s.cursor();
        let mut buf = Vec::new();
        assert_eq!(c.next(&mut buf).unwrap(), Some(0));
        assert_eq!(c.next(&mut buf).unwrap(), Some(1));
        assert_eq!(c.next(&mut buf).unwrap(), None);
        c.reset();
        buf.clear();
        assert_eq!(c.next(&mut buf).unwrap(), Some(0));
        assert_eq!(buf, b"ab");
    }
}
