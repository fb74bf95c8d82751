//! Readonly segment
//!
//! Immutable column-group stores behind a logical→physical id mapping.
//! The only mutations ever applied are monotonic `IsDel` bits and
//! in-place writes to fixed-length updatable groups. Rows are
//! reconstructed by asking every group store for its bytes at the
//! physical id and reassembling them in row-schema order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{remove_segment_dir, SegmentBase, PURGE_FILE};
use crate::bits::{write_del_file, BitVec, RankSelect};
use crate::context::DbContext;
use crate::index::ReadableIndex;
use crate::schema::{ColRange, Schema, SchemaConfig};
use crate::store::{
    open_store, EmptyStore, FixedLenKeyIndex, MultiPartStore, ReadableStore, SortedKeyIndex,
    StoreCursor, ZipIntKeyIndex,
};
use crate::{EngineError, Result};

pub struct ReadonlySegment {
    pub base: SegmentBase,
    pub(crate) indices: Vec<Arc<dyn ReadableIndex>>,
    pub(crate) colgroups: Vec<Arc<dyn ReadableStore>>,
    data_mem_size: AtomicU64,
    data_inflate_size: AtomicU64,
}

impl ReadonlySegment {
    pub fn new(schema: Arc<SchemaConfig>, dir: PathBuf) -> Self {
        let base = SegmentBase::new(schema, dir);
        base.freeze();
        Self {
            base,
            indices: Vec::new(),
            colgroups: Vec::new(),
            data_mem_size: AtomicU64::new(0),
            data_inflate_size: AtomicU64::new(0),
        }
    }

    pub fn data_storage_size(&self) -> u64 {
        self.data_mem_size.load(Ordering::Relaxed)
    }

    pub fn data_inflate_size(&self) -> u64 {
        self.data_inflate_size.load(Ordering::Relaxed)
    }

    pub fn total_index_size(&self) -> u64 {
        self.indices.iter().map(|i| i.index_storage_size()).sum()
    }

    pub(crate) fn compute_sizes(&self) {
        let mem: u64 = self.colgroups.iter().map(|g| g.data_storage_size()).sum();
        let inflate: u64 = self.colgroups.iter().map(|g| g.data_inflate_size()).sum();
        self.data_mem_size.store(mem, Ordering::Relaxed);
        self.data_inflate_size.store(inflate, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_value_append(&self, logical: u64, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        let phys = self.base.physical_id(logical)?;
        self.get_value_by_physic(phys, out, ctx)
    }

    pub(crate) fn get_value_by_physic(
        &self,
        phys: u64,
        out: &mut Vec<u8>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        let schema = &self.base.schema;
        ctx.buf1.clear();
        let mut group_cols: Vec<Vec<ColRange>> = Vec::with_capacity(self.colgroups.len());
        for (g, store) in self.colgroups.iter().enumerate() {
            let gs = &schema.colgroups[g];
            if gs.has_any_keep_col() {
                let old = ctx.buf1.len();
                store.get_value_append(phys, &mut ctx.buf1)?;
                let mut cols = Vec::with_capacity(gs.column_num());
                gs.parse_row_append(&ctx.buf1, old, &mut cols)?;
                group_cols.push(cols);
            } else {
                group_cols.push(Vec::new());
            }
        }
        schema.combine_row(&ctx.buf1, &group_cols, out)
    }

    /// Search one index, translating physical hits back to live
    /// logical ids.
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
        let purged = self.base.purged();
        let del = self.base.del.read();
        for &phys in ctx.rec_ids.iter() {
            let logical = match &purged {
                None => phys,
                Some(p) => p.select0(phys as usize)? as u64,
            };
            if !del.get(logical as usize) {
                out.push(logical);
            }
        }
        Ok(())
    }

    pub fn select_columns(
        &self,
        logical: u64,
        col_ids: &[usize],
        out: &mut Vec<u8>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        let phys = self.base.physical_id(logical)?;
        let schema = &self.base.schema;
        out.clear();
        ctx.buf1.clear();
        let mut parsed: Vec<Option<Vec<ColRange>>> = vec![None; schema.colgroup_num()];
        for (k, &col) in col_ids.iter().enumerate() {
            if col >= schema.column_num() {
                return Err(EngineError::invalid(format!("unknown column id {}", col)));
            }
            let cp = schema.col_project[col];
            let gs = &schema.colgroups[cp.colgroup_id];
            if parsed[cp.colgroup_id].is_none() {
                let old = ctx.buf1.len();
                self.colgroups[cp.colgroup_id].get_value_append(phys, &mut ctx.buf1)?;
                let mut cols = Vec::with_capacity(gs.column_num());
                gs.parse_row_append(&ctx.buf1, old, &mut cols)?;
                parsed[cp.colgroup_id] = Some(cols);
            }
            let r = parsed[cp.colgroup_id].as_ref().unwrap()[cp.sub_col].clone();
            let data = ctx.buf1[r].to_vec();
            let ctype = schema.row_schema.columns[col].ctype;
            if ctype.is_variable_length() && k + 1 < col_ids.len() {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(&data);
        }
        Ok(())
    }

    pub fn select_one_column(
        &self,
        logical: u64,
        col: usize,
        out: &mut Vec<u8>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        self.select_columns(logical, &[col], out, ctx)
    }

    pub fn select_colgroups(
        &self,
        logical: u64,
        group_ids: &[usize],
        out: &mut Vec<Vec<u8>>,
        _ctx: &mut DbContext,
    ) -> Result<()> {
        let phys = self.base.physical_id(logical)?;
        out.clear();
        for &g in group_ids {
            if g >= self.base.schema.colgroup_num() {
                return Err(EngineError::OutOfRange {
                    id: g as u64,
                    rows: self.base.schema.colgroup_num() as u64,
                });
            }
            let mut buf = Vec::new();
            self.colgroups[g].get_value_append(phys, &mut buf)?;
            out.push(buf);
        }
        Ok(())
    }

    /// Overwrite the in-place updatable groups of one live row.
    pub fn update_inplace(&self, logical: u64, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let phys = self.base.physical_id(logical)?;
        let schema = &self.base.schema;
        schema.row_schema.parse_row(row, &mut ctx.cols2)?;
        for &g in &schema.updatable_colgroups {
            schema.colgroups[g].select_parent(&ctx.cols2, row, &mut ctx.buf2);
            let store = self.colgroups[g]
                .as_fixed_len()
                .ok_or_else(|| EngineError::logic("updatable group is not fixed-length"))?;
            store.write_row(phys, &ctx.buf2)?;
        }
        Ok(())
    }

    /// Forward cursor over live rows by logical id.
    pub fn cursor_forward<'a>(&'a self, ctx: &'a mut DbContext) -> ReadonlyCursor<'a> {
        ReadonlyCursor {
            seg: self,
            ctx,
            next_id: 0,
            backward: false,
        }
    }

    pub fn cursor_backward<'a>(&'a self, ctx: &'a mut DbContext) -> ReadonlyCursor<'a> {
        ReadonlyCursor {
            seg: self,
            ctx,
            next_id: self.base.num_data_rows(),
            backward: true,
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    pub fn load(&mut self, dir: &Path) -> Result<()> {
        self.base.load_is_del(dir)?;
        self.open_indices(dir)?;
        self.load_record_store(dir)?;
        self.remove_purge_bits_for_compact_idspace(dir)?;
        self.compute_sizes();
        Ok(())
    }

    fn open_indices(&mut self, dir: &Path) -> Result<()> {
        if !self.indices.is_empty() {
            return Err(EngineError::invalid("indices must be empty before load"));
        }
        let schema = self.base.schema.clone();
        for i in 0..schema.index_num {
            let gs = &schema.colgroups[i];
            let base = dir.join(format!("index-{}", gs.name));
            self.indices.push(open_index(gs, &base)?);
        }
        Ok(())
    }

    fn load_record_store(&mut self, dir: &Path) -> Result<()> {
        if !self.colgroups.is_empty() {
            return Err(EngineError::invalid("colgroups must be empty before load"));
        }
        let schema = self.base.schema.clone();
        for i in 0..schema.index_num {
            let store = self.indices[i]
                .clone()
                .readable_store()
                .ok_or_else(|| EngineError::logic("index has no readable store"))?;
            self.colgroups.push(store);
        }
        // discover colgroup files; `-dict` dictionaries and `.seq`
        // linear-scan streams are sidecars, not stores
        let mut files: Vec<String> = Vec::new();
        for ent in std::fs::read_dir(dir)? {
            let name = ent?.file_name().to_string_lossy().to_string();
            if name.starts_with("colgroup-") && !name.ends_with("-dict") && !name.ends_with(".seq")
            {
                files.push(name);
            }
        }
        files.sort();
        for g in schema.index_num..schema.colgroup_num() {
            let gs = &schema.colgroups[g];
            let prefix = format!("colgroup-{}.", gs.name);
            let group_files: Vec<&String> =
                files.iter().filter(|f| f.starts_with(&prefix)).collect();
            if group_files.is_empty() {
                return Err(EngineError::invalid(format!(
                    "missing store for column group {} in {}",
                    gs.name,
                    dir.display()
                )));
            }
            let first_rest = &group_files[0][prefix.len()..];
            if first_rest.starts_with("0000.") {
                let mut parts: Vec<Arc<dyn ReadableStore>> = Vec::new();
                for (i, fname) in group_files.iter().enumerate() {
                    let rest = &fname[prefix.len()..];
                    let part_idx: usize = rest
                        .split('.')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            EngineError::invalid(format!("bad part file name: {}", fname))
                        })?;
                    if part_idx != i {
                        return Err(EngineError::invalid(format!(
                            "missing part {:04} of column group {}",
                            i, gs.name
                        )));
                    }
                    parts.push(open_store(gs, dir, fname)?);
                }
                self.colgroups.push(Arc::new(MultiPartStore::new(parts)));
            } else {
                if group_files.len() != 1 {
                    return Err(EngineError::invalid(format!(
                        "column group {} has {} store files",
                        gs.name,
                        group_files.len()
                    )));
                }
                self.colgroups.push(open_store(gs, dir, group_files[0])?);
            }
        }
        Ok(())
    }

    /// Apply the persisted purge bitmap: keep it when the segment is
    /// configured to preserve logical ids, otherwise compact the id
    /// space and delete it. Interrupted compactions are recovered from
    /// the `IsDel.backup` left behind.
    fn remove_purge_bits_for_compact_idspace(&mut self, dir: &Path) -> Result<()> {
        let purge_path = dir.join(PURGE_FILE);
        if !purge_path.exists() {
            return Ok(());
        }
        let formal = dir.join(crate::bits::ISDEL_FILE);
        let backup = dir.join(format!("{}.backup", crate::bits::ISDEL_FILE));
        let rs = RankSelect::load(&purge_path)?;
        if self.base.num_data_rows() as usize != rs.len() {
            // a previous compaction died between the two renames
            if self.base.num_data_rows() as usize > rs.len() || !backup.exists() {
                return Err(EngineError::logic(format!(
                    "{}: IsDel has {} rows but IsPurged has {}",
                    dir.display(),
                    self.base.num_data_rows(),
                    rs.len()
                )));
            }
            self.base.close_is_del();
            std::fs::remove_file(&formal)?;
            std::fs::rename(&backup, &formal)?;
            self.base.load_is_del(dir)?;
        }
        if self.base.with_purge_bits() {
            // logical ids stay translatable through select0
            self.base.set_purged(Some(Arc::new(rs)));
            return Ok(());
        }
        // compact: the new id space is rank0 of the old
        let old = self.base.del.read().snapshot();
        let new_rows = rs.max_rank0();
        let mut new_del = BitVec::with_len(new_rows, false);
        let mut new_id = 0usize;
        for old_id in 0..old.len() {
            if !rs.get(old_id) {
                if old.get(old_id) {
                    new_del.set1(new_id);
                }
                new_id += 1;
            } else {
                debug_assert!(old.get(old_id), "purged row must be deleted");
            }
        }
        debug_assert_eq!(new_id, new_rows);
        self.base.close_is_del();
        std::fs::rename(&formal, &backup)?;
        if let Err(e) = write_del_file(dir, &new_del) {
            log::error!(
                "{}: compacted IsDel write failed ({}), restoring backup",
                dir.display(),
                e
            );
            std::fs::rename(&backup, &formal)?;
            self.base.load_is_del(dir)?;
            self.base.set_purged(Some(Arc::new(rs)));
            return Ok(());
        }
        self.base.load_is_del(dir)?;
        self.base.set_purged(None);
        std::fs::remove_file(&purge_path)?;
        std::fs::remove_file(&backup)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    pub fn save(&self, dir: &Path) -> Result<()> {
        if self.base.tobe_del() {
            return Ok(());
        }
        self.save_purge_bits(dir)?;
        self.save_record_store(dir)?;
        self.save_indices(dir)?;
        self.base.save_is_del(dir)?;
        Ok(())
    }

    fn save_purge_bits(&self, dir: &Path) -> Result<()> {
        if let Some(p) = self.base.purged() {
            debug_assert!(p.max_rank1() as u64 <= self.base.delcnt());
            p.save(&dir.join(PURGE_FILE))?;
        }
        Ok(())
    }

    fn save_record_store(&self, dir: &Path) -> Result<()> {
        let schema = &self.base.schema;
        for g in schema.index_num..schema.colgroup_num() {
            let gs = &schema.colgroups[g];
            self.colgroups[g].save(&dir.join(format!("colgroup-{}", gs.name)))?;
        }
        Ok(())
    }

    fn save_indices(&self, dir: &Path) -> Result<()> {
        let schema = &self.base.schema;
        for (i, idx) in self.indices.iter().enumerate() {
            let gs = &schema.colgroups[i];
            idx.save(&dir.join(format!("index-{}", gs.name)))?;
        }
        Ok(())
    }

    /// Drop every open mapping and store.
    pub fn close_files(&mut self) {
        self.base.close_is_del();
        self.base.set_purged(None);
        self.indices.clear();
        self.colgroups.clear();
    }
}

impl Drop for ReadonlySegment {
    fn drop(&mut self) {
        if self.base.tobe_del() {
            self.close_files();
            remove_segment_dir(&self.base.dir());
        }
    }
}

/// Open a persisted index by probing the known suffixes.
pub fn open_index(schema: &Schema, base: &Path) -> Result<Arc<dyn ReadableIndex>> {
    let probe = |suffix: &str| -> PathBuf {
        base.with_file_name(format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            suffix
        ))
    };
    let p = probe("zint");
    if p.exists() {
        return Ok(Arc::new(ZipIntKeyIndex::load(&p)?));
    }
    let p = probe("fixlen");
    if p.exists() {
        return Ok(Arc::new(FixedLenKeyIndex::load(&p)?));
    }
    let p = probe("empty");
    if p.exists() {
        return Ok(Arc::new(EmptyStore::load(&p)?));
    }
    let p = probe("nlt");
    if p.exists() {
        return Ok(Arc::new(SortedKeyIndex::load(&p)?));
    }
    Err(EngineError::invalid(format!(
        "no index file found for {}",
        base.display()
    )))
}

pub struct ReadonlyCursor<'a> {
    seg: &'a ReadonlySegment,
    ctx: &'a mut DbContext,
    next_id: u64,
    backward: bool,
}

impl StoreCursor for ReadonlyCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        let rows = self.seg.base.num_data_rows();
        if self.backward {
            while self.next_id > 0 {
                let id = self.next_id - 1;
                self.next_id = id;
                if !self.seg.base.is_deleted(id)? {
                    self.seg.get_value_append(id, out, self.ctx)?;
                    return Ok(Some(id));
                }
            }
            Ok(None)
        } else {
            while self.next_id < rows {
                let id = self.next_id;
                self.next_id += 1;
                if !self.seg.base.is_deleted(id)? {
                    self.seg.get_value_append(id, out, self.ctx)?;
                    return Ok(Some(id));
                }
            }
            Ok(None)
        }
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.seg.base.num_data_rows() || self.seg.base.is_deleted(id)? {
            return Ok(false);
        }
        self.seg.get_value_append(id, out, self.ctx)?;
        self.next_id = if self.backward { id } else { id + 1 };
        Ok(true)
    }

    fn reset(&mut self) {
        self.next_id = if self.backward {
            self.seg.base.num_data_rows()
        } else {
            0
        };
    }
}
