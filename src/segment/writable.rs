//! Writable segment
//!
//! Accepts appends, updates and removes. Full rows (minus in-place
//! updatable groups) land in the `__wrtStore__` row store; each
//! in-place updatable group keeps its own fixed-length store. Point
//! reads splice the two back together through the column projection.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{remove_segment_dir, DelState, SegmentBase};
use crate::bits::DelMap;
use crate::context::DbContext;
use crate::index::{MemKeyIndex, ReadableIndex};
use crate::schema::{ColumnType, SchemaConfig};
use crate::store::{FixedLenStore, ReadableStore, StoreCursor};
use crate::{EngineError, Result};

pub const WRT_STORE_FILE: &str = "__wrtStore__";
const WRT_MAGIC: &[u8; 8] = b"STRAWRTS";
const REMOVED: u64 = u64::MAX;

// ============================================================================
// RowStore — the __wrtStore__ backing
// ============================================================================

/// Append-only row pool with an entry table. Updates append the new
/// bytes and repoint the entry; removes tombstone it.
#[derive(Default)]
pub struct RowStore {
    pool: Vec<u8>,
    entries: Vec<(u64, u32)>,
}

impl RowStore {
    pub fn rows(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn append(&mut self, rec: &[u8]) -> u64 {
        let id = self.entries.len() as u64;
        self.entries.push((self.pool.len() as u64, rec.len() as u32));
        self.pool.extend_from_slice(rec);
        id
    }

    pub fn update(&mut self, id: u64, rec: &[u8]) -> Result<()> {
        if id >= self.rows() {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.rows(),
            });
        }
        let off = self.pool.len() as u64;
        self.pool.extend_from_slice(rec);
        self.entries[id as usize] = (off, rec.len() as u32);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Result<()> {
        if id >= self.rows() {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.rows(),
            });
        }
        self.entries[id as usize] = (REMOVED, 0);
        Ok(())
    }

    pub fn is_removed(&self, id: u64) -> bool {
        self.entries[id as usize].0 == REMOVED
    }

    pub fn get_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.rows() || self.is_removed(id) {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.rows(),
            });
        }
        let (off, len) = self.entries[id as usize];
        out.extend_from_slice(&self.pool[off as usize..off as usize + len as usize]);
        Ok(())
    }

    pub fn data_size(&self) -> u64 {
        self.pool.len() as u64
    }

    pub fn shrink_to_fit(&mut self) {
        self.pool.shrink_to_fit();
        self.entries.shrink_to_fit();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(WRT_MAGIC)?;
            f.write_all(&(self.entries.len() as u64).to_le_bytes())?;
            for (off, len) in &self.entries {
                f.write_all(&off.to_le_bytes())?;
                f.write_all(&len.to_le_bytes())?;
            }
            f.write_all(&self.pool)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let mut head = [0u8; 16];
        f.read_exact(&mut head)?;
        if &head[..8] != WRT_MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad row store header", path.display()),
            )));
        }
        let rows = u64::from_le_bytes(head[8..16].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(rows);
        let mut ent = [0u8; 12];
        for _ in 0..rows {
            f.read_exact(&mut ent)?;
            entries.push((
                u64::from_le_bytes(ent[0..8].try_into().unwrap()),
                u32::from_le_bytes(ent[8..12].try_into().unwrap()),
            ));
        }
        let mut pool = Vec::new();
        f.read_to_end(&mut pool)?;
        Ok(Self { pool, entries })
    }
}

// ============================================================================
// WritableSegment
// ============================================================================

pub struct WritableSegment {
    pub base: SegmentBase,
    wrt: RwLock<RowStore>,
    /// One slot per column group; `Some` only for in-place updatable
    colgroups: Vec<Option<Arc<FixedLenStore>>>,
    pub(crate) indices: Vec<Arc<MemKeyIndex>>,
}

impl WritableSegment {
    fn index_set(schema: &SchemaConfig) -> Vec<Arc<MemKeyIndex>> {
        (0..schema.index_num)
            .map(|i| Arc::new(MemKeyIndex::new(schema.colgroups[i].is_unique)))
            .collect()
    }

    fn colgroup_set(schema: &SchemaConfig) -> Vec<Option<Arc<FixedLenStore>>> {
        (0..schema.colgroup_num())
            .map(|g| {
                if schema.colgroups[g].is_inplace_updatable {
                    Some(Arc::new(FixedLenStore::new(&schema.colgroups[g])))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Create a fresh segment directory.
    pub fn create(schema: Arc<SchemaConfig>, dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let base = SegmentBase::new(schema.clone(), dir.clone());
        *base.del.write() = DelState::Map(DelMap::create(&dir)?);
        Ok(Self {
            indices: Self::index_set(&base.schema),
            colgroups: Self::colgroup_set(&base.schema),
            base,
            wrt: RwLock::new(RowStore::default()),
        })
    }

    /// Open an existing segment directory and rebuild the in-memory
    /// indices from its live rows. A segment that died before its
    /// first flush has only an `IsDel` file; missing stores come back
    /// empty and the converter's under-run recovery owns the rest.
    pub fn open(schema: Arc<SchemaConfig>, dir: PathBuf) -> Result<Self> {
        let base = SegmentBase::new(schema.clone(), dir.clone());
        base.load_is_del(&dir)?;
        let wrt_path = dir.join(WRT_STORE_FILE);
        let wrt = if wrt_path.exists() {
            RowStore::load(&wrt_path)?
        } else {
            RowStore::default()
        };
        let mut colgroups = Vec::with_capacity(schema.colgroup_num());
        for g in 0..schema.colgroup_num() {
            let gs = &schema.colgroups[g];
            if gs.is_inplace_updatable {
                let fname = dir.join(format!("colgroup-{}.fixlen", gs.name));
                if fname.exists() {
                    colgroups.push(Some(Arc::new(FixedLenStore::load_heap(gs, &fname)?)));
                } else {
                    colgroups.push(Some(Arc::new(FixedLenStore::new(gs))));
                }
            } else {
                colgroups.push(None);
            }
        }
        let seg = Self {
            indices: Self::index_set(&schema),
            colgroups,
            base,
            wrt: RwLock::new(wrt),
        };
        seg.rebuild_indices()?;
        Ok(seg)
    }

    fn rebuild_indices(&self) -> Result<()> {
        let schema = &self.base.schema;
        let mut ctx = DbContext::new();
        let rows = self.base.num_data_rows();
        let mut row = Vec::new();
        let mut key = Vec::new();
        for id in 0..rows {
            if self.base.is_deleted(id)? {
                continue;
            }
            {
                let wrt = self.wrt.read();
                if id >= wrt.rows() || wrt.is_removed(id) {
                    continue;
                }
            }
            row.clear();
            self.get_value_append(id, &mut row, &mut ctx)?;
            schema.row_schema.parse_row(&row, &mut ctx.cols1)?;
            for (i, idx) in self.indices.iter().enumerate() {
                schema.colgroups[i].select_parent(&ctx.cols1, &row, &mut key);
                idx.insert(&key, id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Parse and append one row; every per-group append must agree on
    /// the id.
    pub fn append(&self, row: &[u8], ctx: &mut DbContext) -> Result<u64> {
        let schema = &self.base.schema;
        schema.row_schema.parse_row(row, &mut ctx.cols1)?;
        schema
            .wrt_schema
            .select_parent(&ctx.cols1, row, &mut ctx.buf1);
        let id1 = self.wrt.write().append(&ctx.buf1);
        for &g in &schema.updatable_colgroups {
            schema.colgroups[g].select_parent(&ctx.cols1, row, &mut ctx.buf1);
            let store = self.colgroups[g].as_ref().expect("updatable store");
            let id2 = store.append(&ctx.buf1)?;
            if id1 != id2 {
                return Err(EngineError::logic(format!(
                    "group {} append returned id {}, row store {}",
                    schema.colgroups[g].name, id2, id1
                )));
            }
        }
        self.base.set_dirty(true);
        Ok(id1)
    }

    /// Overwrite one row in place (row store and updatable groups).
    pub fn update(&self, id: u64, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let schema = &self.base.schema;
        schema.row_schema.parse_row(row, &mut ctx.cols1)?;
        schema
            .wrt_schema
            .select_parent(&ctx.cols1, row, &mut ctx.buf1);
        self.wrt.write().update(id, &ctx.buf1)?;
        self.update_inplace_groups(id, row, ctx)?;
        self.base.set_dirty(true);
        self.base.add_to_update_list(id);
        Ok(())
    }

    /// Write only the in-place updatable groups of a row. The one
    /// mutation allowed on a frozen segment besides deletion.
    pub fn update_inplace_groups(&self, id: u64, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let schema = &self.base.schema;
        schema.row_schema.parse_row(row, &mut ctx.cols2)?;
        for &g in &schema.updatable_colgroups {
            schema.colgroups[g].select_parent(&ctx.cols2, row, &mut ctx.buf2);
            let store = self.colgroups[g].as_ref().expect("updatable store");
            store.write_row(id, &ctx.buf2)?;
        }
        Ok(())
    }

    pub fn remove(&self, id: u64) -> Result<()> {
        self.wrt.write().remove(id)?;
        self.base.set_dirty(true);
        Ok(())
    }

    pub fn push_is_del(&self, v: bool) -> Result<()> {
        let mut del = self.base.del.write();
        match &mut *del {
            DelState::Map(m) => m.push(v),
            DelState::Mem(_) => Err(EngineError::logic("writable IsDel must be mapped")),
        }?;
        if v {
            self.base.set_delcnt(self.base.delcnt() + 1);
        }
        Ok(())
    }

    pub fn pop_is_del(&self) {
        let mut del = self.base.del.write();
        if let DelState::Map(m) = &mut *del {
            m.pop();
        }
    }

    pub fn shrink_to_fit(&self) {
        self.wrt.write().shrink_to_fit();
        for g in self.colgroups.iter().flatten() {
            g.shrink_to_fit();
        }
    }

    /// In-place updatable store of group `g`, when it has one.
    pub(crate) fn updatable_store(&self, g: usize) -> Option<&FixedLenStore> {
        self.colgroups[g].as_deref()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read_wrt(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        self.wrt.read().get_append(id, out)
    }

    /// Reassemble the full row of `id` in row-schema order.
    pub fn get_value_append(&self, id: u64, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let rows = self.base.num_data_rows();
        if id >= rows {
            return Err(EngineError::OutOfRange { id, rows });
        }
        let schema = &self.base.schema;
        if schema.updatable_colgroups.is_empty() {
            return self.read_wrt(id, out);
        }
        ctx.buf1.clear();
        self.read_wrt(id, &mut ctx.buf1)?;
        self.combine_append(id, &ctx.buf1, out, &mut ctx.cols1)
    }

    /// Splice the wrt-store part with the in-place updatable groups.
    pub(crate) fn combine_append(
        &self,
        id: u64,
        wrt_bytes: &[u8],
        out: &mut Vec<u8>,
        cols: &mut Vec<std::ops::Range<usize>>,
    ) -> Result<()> {
        let schema = &self.base.schema;
        schema.wrt_schema.parse_row(wrt_bytes, cols)?;
        let mut slot = Vec::new();
        for col in 0..schema.column_num() {
            let cp = schema.col_project[col];
            let gs = &schema.colgroups[cp.colgroup_id];
            if gs.is_inplace_updatable {
                let store = self.colgroups[cp.colgroup_id]
                    .as_ref()
                    .expect("updatable store");
                let (off, len) = gs.fixed_slot(cp.sub_col);
                slot.clear();
                store.read_slot(id, off, len, &mut slot)?;
                schema.row_schema.project_append(&slot, col, out);
            } else {
                let sub = schema.row_to_wrt[col].expect("column in wrt schema");
                let r = cols[sub].clone();
                schema.row_schema.project_append(&wrt_bytes[r], col, out);
            }
        }
        Ok(())
    }

    /// Search one index for `key`, appending the logical ids of live
    /// matches.
    pub fn index_search_exact_append(
        &self,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        let idx = &self.indices[index_id];
        ctx.rec_ids.clear();
        idx.search_exact_append(key, &mut ctx.rec_ids)?;
        let del = self.base.del.read();
        for &id in ctx.rec_ids.iter() {
            if !del.get(id as usize) {
                out.push(id);
            }
        }
        Ok(())
    }

    /// Project a subset of columns of one row, in request order.
    pub fn select_columns(
        &self,
        id: u64,
        col_ids: &[usize],
        out: &mut Vec<u8>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        let schema = &self.base.schema;
        out.clear();
        let mut wrt_parsed = false;
        let mut slot = Vec::new();
        for (k, &col) in col_ids.iter().enumerate() {
            if col >= schema.column_num() {
                return Err(EngineError::invalid(format!("unknown column id {}", col)));
            }
            let cp = schema.col_project[col];
            let gs = &schema.colgroups[cp.colgroup_id];
            let last = k + 1 == col_ids.len();
            if gs.is_inplace_updatable {
                let store = self.colgroups[cp.colgroup_id]
                    .as_ref()
                    .expect("updatable store");
                let (off, len) = gs.fixed_slot(cp.sub_col);
                slot.clear();
                store.read_slot(id, off, len, &mut slot)?;
                append_selected(&slot, schema.row_schema.columns[col].ctype, last, out);
            } else {
                if !wrt_parsed {
                    ctx.buf1.clear();
                    self.read_wrt(id, &mut ctx.buf1)?;
                    schema.wrt_schema.parse_row(&ctx.buf1, &mut ctx.cols1)?;
                    wrt_parsed = true;
                }
                let sub = schema.row_to_wrt[col].expect("column in wrt schema");
                let r = ctx.cols1[sub].clone();
                let data = ctx.buf1[r].to_vec();
                append_selected(&data, schema.row_schema.columns[col].ctype, last, out);
            }
        }
        Ok(())
    }

    pub fn select_one_column(
        &self,
        id: u64,
        col: usize,
        out: &mut Vec<u8>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        self.select_columns(id, &[col], out, ctx)
    }

    pub fn select_colgroups(
        &self,
        id: u64,
        group_ids: &[usize],
        out: &mut Vec<Vec<u8>>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        let schema = &self.base.schema;
        out.clear();
        for &g in group_ids {
            if g >= schema.colgroup_num() {
                return Err(EngineError::OutOfRange {
                    id: g as u64,
                    rows: schema.colgroup_num() as u64,
                });
            }
            let mut buf = Vec::new();
            if let Some(store) = &self.colgroups[g] {
                store.get_value_append(id, &mut buf)?;
            } else {
                let cols: Vec<usize> = schema.colgroups[g].parent_cols.clone();
                self.select_columns(id, &cols, &mut buf, ctx)?;
            }
            out.push(buf);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Forward cursor over live row-store entries (deletion bits are
    /// the caller's business).
    pub fn cursor_forward(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(WritableCursor {
            seg: self,
            next_id: 0,
            backward: false,
        })
    }

    pub fn cursor_backward(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(WritableCursor {
            seg: self,
            next_id: self.wrt.read().rows(),
            backward: true,
        })
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn save(&self, dir: &Path) -> Result<()> {
        for &g in &self.base.schema.updatable_colgroups {
            let gs = &self.base.schema.colgroups[g];
            let store = self.colgroups[g].as_ref().expect("updatable store");
            store.save(&dir.join(format!("colgroup-{}", gs.name)))?;
        }
        self.wrt.read().save(&dir.join(WRT_STORE_FILE))?;
        self.base.save_is_del(dir)?;
        Ok(())
    }

    pub fn flush_segment(&self) -> Result<()> {
        if self.base.tobe_del() {
            return Ok(());
        }
        if self.base.is_dirty() {
            self.save(&self.base.dir())?;
            self.base.set_dirty(false);
        }
        Ok(())
    }

    pub fn total_storage_size(&self) -> u64 {
        let mut size = self.wrt.read().data_size();
        for g in self.colgroups.iter().flatten() {
            size += g.data_storage_size();
        }
        size += self
            .indices
            .iter()
            .map(|i| i.index_storage_size())
            .sum::<u64>();
        size
    }

    pub fn data_inflate_size(&self) -> u64 {
        let mut size = self.wrt.read().data_size();
        for g in self.colgroups.iter().flatten() {
            size += g.data_inflate_size();
        }
        size
    }
}

impl Drop for WritableSegment {
    fn drop(&mut self) {
        if self.base.tobe_del() {
            self.base.close_is_del();
            remove_segment_dir(&self.base.dir());
        } else if self.base.is_dirty() {
            if let Err(e) = self.flush_segment() {
                log::error!("flush of {} failed: {}", self.base.dir().display(), e);
            }
        }
    }
}

/// Encode one selected column: variable-length values carry a length
/// prefix unless they close the output.
fn append_selected(data: &[u8], ctype: ColumnType, last: bool, out: &mut Vec<u8>) {
    if ctype.is_variable_length() && !last {
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
}

struct WritableCursor<'a> {
    seg: &'a WritableSegment,
    next_id: u64,
    backward: bool,
}

impl WritableCursor<'_> {
    fn read_combined(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        let seg = self.seg;
        if seg.base.schema.updatable_colgroups.is_empty() {
            seg.read_wrt(id, out)
        } else {
            let mut wrt = Vec::new();
            seg.read_wrt(id, &mut wrt)?;
            let mut cols = Vec::new();
            seg.combine_append(id, &wrt, out, &mut cols)
        }
    }
}

impl StoreCursor for WritableCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        let rows = self.seg.wrt.read().rows();
        if self.backward {
            while self.next_id > 0 {
                let id = self.next_id - 1;
                self.next_id = id;
                if !self.seg.wrt.read().is_removed(id) {
                    self.read_combined(id, out)?;
                    return Ok(Some(id));
                }
            }
            Ok(None)
        } else {
            while self.next_id < rows {
                let id = self.next_id;
                self.next_id += 1;
                if !self.seg.wrt.read().is_removed(id) {
                    self.read_combined(id, out)?;
                    return Ok(Some(id));
                }
            }
            Ok(None)
        }
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        let wrt = self.seg.wrt.read();
        if id >= wrt.rows() || wrt.is_removed(id) {
            return Ok(false);
        }
        drop(wrt);
        self.read_combined(id, out)?;
        self.next_id = if self.backward { id } else { id + 1 };
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = if self.backward {
            self.seg.wrt.read().rows()
        } else {
            0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, RowBuilder, SchemaConfigBuilder};
    use tempfile::tempdir;

    fn config() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("score", ColumnType::Float64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            .add_colgroup("score", &["score"], true);
        Arc::new(b.build().unwrap())
    }

    fn row(cfg: &SchemaConfig, id: i64, score: f64, name: &str) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_i64(id)
            .push_f64(score)
            .push_str(name)
            .finish()
            .unwrap()
    }

    fn fresh(dir: &Path) -> WritableSegment {
        WritableSegment::create(config(), dir.join("wr-0000")).unwrap()
    }

    #[test]
    fn test_append_and_combined_read() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        for i in 0..5i64 {
            let r = row(&cfg, i, i as f64 * 0.5, &format!("r{}", i));
            let id = seg.append(&r, &mut ctx).unwrap();
            seg.push_is_del(false).unwrap();
            assert_eq!(id, i as u64);
        }
        let mut out = Vec::new();
        seg.get_value_append(3, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 3, 1.5, "r3"));
    }

    #[test]
    fn test_inplace_update_changes_combined_row() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        let r = row(&cfg, 7, 1.0, "seven");
        seg.append(&r, &mut ctx).unwrap();
        seg.push_is_del(false).unwrap();

        let r2 = row(&cfg, 7, 2.5, "seven");
        seg.update_inplace_groups(0, &r2, &mut ctx).unwrap();
        let mut out = Vec::new();
        seg.get_value_append(0, &mut out, &mut ctx).unwrap();
        assert_eq!(out, r2);
    }

    #[test]
    fn test_select_columns_mixed_sources() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        seg.append(&row(&cfg, 1, 4.5, "one"), &mut ctx).unwrap();
        seg.push_is_del(false).unwrap();

        let mut out = Vec::new();
        // score comes from the in-place store, name from the row store
        seg.select_columns(0, &[1, 2], &mut out, &mut ctx).unwrap();
        let mut expect = 4.5f64.to_le_bytes().to_vec();
        expect.extend_from_slice(b"one");
        assert_eq!(out, expect);
    }

    #[test]
    fn test_select_one_column_and_colgroups() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        seg.append(&row(&cfg, 9, 1.25, "nine"), &mut ctx).unwrap();
        seg.push_is_del(false).unwrap();

        let mut out = Vec::new();
        seg.select_one_column(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, b"nine");
        seg.select_one_column(0, 1, &mut out, &mut ctx).unwrap();
        assert_eq!(out, 1.25f64.to_le_bytes());

        let mut groups = Vec::new();
        seg.select_colgroups(0, &[1, 2], &mut groups, &mut ctx)
            .unwrap();
        assert_eq!(groups[0], 1.25f64.to_le_bytes());
        assert_eq!(groups[1], b"nine");
    }

    #[test]
    fn test_backward_cursor() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        for i in 0..3i64 {
            seg.append(&row(&cfg, i, 0.0, "x"), &mut ctx).unwrap();
            seg.push_is_del(false).unwrap();
        }
        let mut c = seg.cursor_backward();
        let mut out = Vec::new();
        let mut ids = Vec::new();
        while let Some(id) = c.next(&mut out).unwrap() {
            ids.push(id);
            out.clear();
        }
        assert_eq!(ids, vec![2, 1, 0]);
        assert!(seg.total_storage_size() > 0);
    }

    #[test]
    fn test_cursor_skips_removed() {
        let dir = tempdir().unwrap();
        let seg = fresh(dir.path());
        let cfg = seg.base.schema.clone();
        let mut ctx = DbContext::new();
        for i in 0..4i64 {
            seg.append(&row(&cfg, i, 0.0, "x"), &mut ctx).unwrap();
            seg.push_is_del(false).unwrap();
        }
        seg.remove(2).unwrap();
        let mut c = seg.cursor_forward();
        let mut out = Vec::new();
        let mut ids = Vec::new();
        while let Some(id) = c.next(&mut out).unwrap() {
            ids.push(id);
            out.clear();
        }
        assert_eq!(ids, vec![0, 1, 3]);
    }

    #[test]
    fn test_save_open_roundtrip() {
        let dir = tempdir().unwrap();
        let seg_dir = dir.path().join("wr-0000");
        let cfg = config();
        let mut ctx = DbContext::new();
        {
            let seg = WritableSegment::create(cfg.clone(), seg_dir.clone()).unwrap();
            for i in 0..3i64 {
                seg.append(&row(&cfg, i, i as f64, &format!("n{}", i)), &mut ctx)
                    .unwrap();
                seg.push_is_del(false).unwrap();
            }
            seg.save(&seg_dir).unwrap();
            seg.base.set_dirty(false);
        }
        let seg = WritableSegment::open(cfg.clone(), seg_dir).unwrap();
        assert_eq!(seg.base.num_data_rows(), 3);
        let mut out = Vec::new();
        seg.get_value_append(1, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 1, 1.0, "n1"));
        // indices rebuilt
        let mut ids = Vec::new();
        seg.index_search_exact_append(0, &2i64.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![2]);
    }
}
