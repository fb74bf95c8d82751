//! Minimal table host
//!
//! The engine core is the segment lifecycle; this is the collaborator
//! that owns the segment vector behind a reader-writer lock, assigns
//! segment directories, routes row operations to the right segment,
//! and provides the store/index build hooks the converter and purger
//! call back into.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::context::DbContext;
use crate::index::ReadableIndex;
use crate::schema::{Schema, SchemaConfig};
use crate::segment::{convert, purge, ReadonlySegment, SegmentBase, WritableSegment};
use crate::store::{
    build_trie_store, FixedLenStore, FixedLenKeyIndex, ReadableStore, RecVec, SortedKeyIndex,
    ZipIntKeyIndex, ZipIntStore,
};
use crate::{EngineError, Result};

// ============================================================================
// Segment handles
// ============================================================================

/// Shared reference to a segment in either lifecycle stage. Handles
/// pulled out under a read lock stay valid after a swap replaces the
/// slot; the directory is torn down when the last holder drops.
#[derive(Clone)]
pub enum SegmentHandle {
    Writable(Arc<WritableSegment>),
    Readonly(Arc<ReadonlySegment>),
}

impl SegmentHandle {
    pub fn base(&self) -> &SegmentBase {
        match self {
            SegmentHandle::Writable(w) => &w.base,
            SegmentHandle::Readonly(r) => &r.base,
        }
    }

    pub fn get_value_append(&self, id: u64, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        match self {
            SegmentHandle::Writable(w) => w.get_value_append(id, out, ctx),
            SegmentHandle::Readonly(r) => r.get_value_append(id, out, ctx),
        }
    }

    pub fn index_search_exact_append(
        &self,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        match self {
            SegmentHandle::Writable(w) => w.index_search_exact_append(index_id, key, out, ctx),
            SegmentHandle::Readonly(r) => r.index_search_exact_append(index_id, key, out, ctx),
        }
    }
}

pub struct SegArray {
    pub segs: Vec<SegmentHandle>,
    /// Bumped on every swap into the vector
    pub update_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStatus {
    None,
    Purging,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Rows per writable segment before rollover
    pub rollover_rows: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            rollover_rows: 1 << 20,
        }
    }
}

// ============================================================================
// Table
// ============================================================================

pub struct Table {
    dir: PathBuf,
    schema: Arc<SchemaConfig>,
    config: TableConfig,
    inner: RwLock<SegArray>,
    next_seg_id: AtomicU64,
    purge_status: Mutex<PurgeStatus>,
    scanning: AtomicU32,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Table {
    pub fn create(dir: &Path, schema: Arc<SchemaConfig>, config: TableConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let tab = Self {
            dir: dir.to_path_buf(),
            schema,
            config,
            inner: RwLock::new(SegArray {
                segs: Vec::new(),
                update_seq: 0,
            }),
            next_seg_id: AtomicU64::new(0),
            purge_status: Mutex::new(PurgeStatus::None),
            scanning: AtomicU32::new(0),
        };
        tab.push_new_writable(&mut tab.inner.write())?;
        Ok(tab)
    }

    /// Open an existing table directory, loading every segment in id
    /// order. In-flight `.tmp` builds and `.backup-N` directories are
    /// ignored; an interrupted conversion leaves the source segment
    /// authoritative.
    pub fn open(dir: &Path, schema: Arc<SchemaConfig>, config: TableConfig) -> Result<Self> {
        let mut found: Vec<(u64, bool, PathBuf)> = Vec::new();
        for ent in std::fs::read_dir(dir)? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") || name.contains(".backup") {
                continue;
            }
            let (writable, rest) = if let Some(r) = name.strip_prefix("wr-") {
                (true, r)
            } else if let Some(r) = name.strip_prefix("rd-") {
                (false, r)
            } else {
                continue;
            };
            let id: u64 = rest.parse().map_err(|_| {
                EngineError::invalid(format!("bad segment directory name: {}", name))
            })?;
            found.push((id, writable, ent.path()));
        }
        found.sort_by_key(|(id, writable, _)| (*id, *writable));
        // a crash between a conversion's rename and the source cleanup
        // leaves both wr-NNNN and rd-NNNN; the readonly one won
        found.dedup_by(|(id_b, wr_b, path_b), (id_a, _, _)| {
            let dup = id_a == id_b;
            if dup {
                debug_assert!(*wr_b);
                log::warn!("ignoring stale segment dir: {}", path_b.display());
            }
            dup
        });

        let mut segs = Vec::with_capacity(found.len());
        let mut max_id = 0u64;
        for (id, writable, path) in found {
            max_id = max_id.max(id + 1);
            if writable {
                let seg = WritableSegment::open(schema.clone(), path)?;
                segs.push(SegmentHandle::Writable(Arc::new(seg)));
            } else {
                let mut seg = ReadonlySegment::new(schema.clone(), path.clone());
                seg.base.set_with_purge_bits(schema.keep_purge_bits);
                seg.load(&path)?;
                segs.push(SegmentHandle::Readonly(Arc::new(seg)));
            }
        }
        let tab = Self {
            dir: dir.to_path_buf(),
            schema,
            config,
            inner: RwLock::new(SegArray {
                segs,
                update_seq: 0,
            }),
            next_seg_id: AtomicU64::new(max_id),
            purge_status: Mutex::new(PurgeStatus::None),
            scanning: AtomicU32::new(0),
        };
        {
            let mut inner = tab.inner.write();
            let need_writable = !matches!(
                inner.segs.last(),
                Some(SegmentHandle::Writable(w)) if !w.base.is_freezed()
            );
            if need_writable {
                tab.push_new_writable(&mut inner)?;
            }
        }
        Ok(tab)
    }

    fn push_new_writable(&self, inner: &mut SegArray) -> Result<()> {
        let id = self.next_seg_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.dir.join(format!("wr-{:04}", id));
        let seg = WritableSegment::create(self.schema.clone(), dir)?;
        inner.segs.push(SegmentHandle::Writable(Arc::new(seg)));
        inner.update_seq += 1;
        Ok(())
    }

    pub fn schema(&self) -> &Arc<SchemaConfig> {
        &self.schema
    }

    pub(crate) fn inner(&self) -> &RwLock<SegArray> {
        &self.inner
    }

    pub fn new_context(&self) -> DbContext {
        DbContext::new()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segs.len()
    }

    pub fn segment(&self, seg_idx: usize) -> Result<SegmentHandle> {
        let inner = self.inner.read();
        inner
            .segs
            .get(seg_idx)
            .cloned()
            .ok_or_else(|| EngineError::OutOfRange {
                id: seg_idx as u64,
                rows: inner.segs.len() as u64,
            })
    }

    pub fn update_seq(&self) -> u64 {
        self.inner.read().update_seq
    }

    // ------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------

    /// Append one row into the current writable segment, maintaining
    /// its indices. Returns `(segment index, logical id)`.
    pub fn append_row(&self, row: &[u8], ctx: &mut DbContext) -> Result<(usize, u64)> {
        let mut inner = self.inner.write();
        let rollover = match inner.segs.last() {
            Some(SegmentHandle::Writable(w)) => {
                w.base.is_freezed() || w.base.num_data_rows() >= self.config.rollover_rows
            }
            _ => true,
        };
        if rollover {
            if let Some(SegmentHandle::Writable(w)) = inner.segs.last() {
                w.base.freeze();
            }
            self.push_new_writable(&mut inner)?;
        }
        let seg_idx = inner.segs.len() - 1;
        let seg = match inner.segs.last().unwrap() {
            SegmentHandle::Writable(w) => w.clone(),
            SegmentHandle::Readonly(_) => unreachable!("rollover keeps a writable tail"),
        };

        seg.push_is_del(false)?;
        let id = match seg.append(row, ctx) {
            Ok(id) => id,
            Err(e) => {
                seg.pop_is_del();
                return Err(e);
            }
        };
        debug_assert_eq!(id + 1, seg.base.num_data_rows());
        self.schema.row_schema.parse_row(row, &mut ctx.cols1)?;
        for i in 0..self.schema.index_num {
            self.schema.colgroups[i].select_parent(&ctx.cols1, row, &mut ctx.buf2);
            seg.indices[i].insert(&ctx.buf2, id);
        }
        Ok((seg_idx, id))
    }

    /// Tombstone one row. Idempotent: returns false when it was
    /// already deleted.
    ///
    /// The table read lock is held for the whole mutation: that is
    /// what guarantees a conversion's final writer-locked replay pass
    /// observes every earlier deletion.
    pub fn remove_row(&self, seg_idx: usize, id: u64, ctx: &mut DbContext) -> Result<bool> {
        let inner = self.inner.read();
        let handle = inner
            .segs
            .get(seg_idx)
            .cloned()
            .ok_or_else(|| EngineError::OutOfRange {
                id: seg_idx as u64,
                rows: inner.segs.len() as u64,
            })?;
        match &handle {
            SegmentHandle::Writable(w) => {
                if w.base.is_deleted(id)? {
                    return Ok(false);
                }
                if !w.base.is_freezed() {
                    let mut row = Vec::new();
                    w.get_value_append(id, &mut row, ctx)?;
                    self.schema.row_schema.parse_row(&row, &mut ctx.cols1)?;
                    for i in 0..self.schema.index_num {
                        self.schema.colgroups[i].select_parent(&ctx.cols1, &row, &mut ctx.buf2);
                        w.indices[i].remove(&ctx.buf2, id);
                    }
                    w.remove(id)?;
                }
                w.base.set_del(id)
            }
            SegmentHandle::Readonly(r) => {
                if r.base.is_deleted(id)? {
                    return Ok(false);
                }
                r.base.set_del(id)
            }
        }
    }

    /// Overwrite one row. On a live writable segment the whole row is
    /// rewritten; on a frozen or readonly segment only the in-place
    /// updatable groups may change.
    pub fn update_row(&self, seg_idx: usize, id: u64, row: &[u8], ctx: &mut DbContext) -> Result<()> {
        let inner = self.inner.read();
        let handle = inner
            .segs
            .get(seg_idx)
            .cloned()
            .ok_or_else(|| EngineError::OutOfRange {
                id: seg_idx as u64,
                rows: inner.segs.len() as u64,
            })?;
        match &handle {
            SegmentHandle::Writable(w) => {
                if !w.base.is_freezed() {
                    let mut old = Vec::new();
                    w.get_value_append(id, &mut old, ctx)?;
                    self.schema.row_schema.parse_row(&old, &mut ctx.cols1)?;
                    for i in 0..self.schema.index_num {
                        self.schema.colgroups[i].select_parent(&ctx.cols1, &old, &mut ctx.buf2);
                        w.indices[i].remove(&ctx.buf2, id);
                    }
                    w.update(id, row, ctx)?;
                    self.schema.row_schema.parse_row(row, &mut ctx.cols1)?;
                    for i in 0..self.schema.index_num {
                        self.schema.colgroups[i].select_parent(&ctx.cols1, row, &mut ctx.buf2);
                        w.indices[i].insert(&ctx.buf2, id);
                    }
                    Ok(())
                } else {
                    w.update_inplace_groups(id, row, ctx)?;
                    w.base.add_to_update_list(id);
                    Ok(())
                }
            }
            SegmentHandle::Readonly(r) => {
                r.update_inplace(id, row, ctx)?;
                r.base.add_to_update_list(id);
                Ok(())
            }
        }
    }

    pub fn get_value(&self, seg_idx: usize, id: u64, out: &mut Vec<u8>, ctx: &mut DbContext) -> Result<()> {
        out.clear();
        self.segment(seg_idx)?.get_value_append(id, out, ctx)
    }

    pub fn index_search(
        &self,
        seg_idx: usize,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut DbContext,
    ) -> Result<()> {
        out.clear();
        self.segment(seg_idx)?
            .index_search_exact_append(index_id, key, out, ctx)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Freeze the current writable segment and open a new one.
    /// Returns the frozen segment's index.
    pub fn freeze_current_segment(&self) -> Result<usize> {
        let mut inner = self.inner.write();
        let idx = match inner.segs.last() {
            Some(SegmentHandle::Writable(w)) if !w.base.is_freezed() => {
                w.base.freeze();
                inner.segs.len() - 1
            }
            _ => return Err(EngineError::invalid("no live writable segment to freeze")),
        };
        self.push_new_writable(&mut inner)?;
        Ok(idx)
    }

    /// Convert the frozen writable segment in `seg_idx` to readonly.
    pub fn convert_segment(&self, seg_idx: usize) -> Result<()> {
        convert::convert_from(self, seg_idx).map(|_| ())
    }

    /// Purge tombstoned rows out of the readonly segment in `seg_idx`.
    pub fn purge_segment(&self, seg_idx: usize) -> Result<()> {
        purge::purge_deleted_records(self, seg_idx).map(|_| ())
    }

    pub fn purge_status(&self) -> PurgeStatus {
        *self.purge_status.lock()
    }

    pub(crate) fn set_purge_status(&self, s: PurgeStatus) {
        *self.purge_status.lock() = s;
    }

    pub fn table_scanning_ref_count(&self) -> u32 {
        self.scanning.load(Ordering::Acquire)
    }

    /// Hold the returned guard for the duration of a table scan;
    /// purges refuse to run while any guard is alive.
    pub fn begin_scan(&self) -> ScanGuard<'_> {
        self.scanning.fetch_add(1, Ordering::AcqRel);
        ScanGuard { tab: self }
    }
}

pub struct ScanGuard<'a> {
    tab: &'a Table,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.tab.scanning.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Build hooks
// ============================================================================

/// Build an index from collected key records: packed-int for a single
/// integer column, binary-searched fixed keys up to 16 bytes, sorted
/// variable keys otherwise. A failed packed-int build falls back with
/// a warning.
pub fn build_index(gs: &Schema, recs: &RecVec) -> Result<Arc<dyn ReadableIndex>> {
    if gs.column_num() == 1 && gs.columns[0].ctype.is_integer() {
        match ZipIntKeyIndex::build(gs.columns[0].ctype, recs, gs.is_unique) {
            Ok(idx) => return Ok(Arc::new(idx)),
            Err(e) => {
                log::warn!(
                    "packed-int index build failed on {}: {}, falling back",
                    gs.name,
                    e
                );
            }
        }
    }
    let fixlen = gs.fixed_row_len();
    if fixlen > 0 && fixlen <= 16 {
        return Ok(Arc::new(FixedLenKeyIndex::build(recs, gs.is_unique)?));
    }
    Ok(Arc::new(SortedKeyIndex::build(recs, gs.is_unique)?))
}

/// Build a column-group store from collected records: packed-int for a
/// single integer column (falling back to fixed-length), fixed-length
/// for other fixed rows, block-compressed blobs otherwise.
pub fn build_store(gs: &Schema, recs: &RecVec) -> Result<Arc<dyn ReadableStore>> {
    if gs.column_num() == 1 && gs.columns[0].ctype.is_integer() {
        match ZipIntStore::build(gs.columns[0].ctype, recs) {
            Ok(s) => return Ok(Arc::new(s)),
            Err(e) => {
                log::warn!(
                    "packed-int store build failed on {}: {}, falling back to fixed-length",
                    gs.name,
                    e
                );
            }
        }
    }
    if gs.fixed_row_len() > 0 {
        let store = FixedLenStore::new(gs);
        store.reserve_rows(recs.len());
        for i in 0..recs.len() {
            store.append(recs.get(i))?;
        }
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(build_trie_store(gs, recs)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, RowBuilder, SchemaConfigBuilder};
    use tempfile::tempdir;

    fn config() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true);
        Arc::new(b.build().unwrap())
    }

    fn row(cfg: &SchemaConfig, id: i64, name: &str) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_i64(id)
            .push_str(name)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_append_get_remove() {
        let dir = tempdir().unwrap();
        let cfg = config();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let (seg, id) = tab.append_row(&row(&cfg, 1, "one"), &mut ctx).unwrap();
        assert_eq!((seg, id), (0, 0));
        let mut out = Vec::new();
        tab.get_value(seg, id, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 1, "one"));
        assert!(tab.remove_row(seg, id, &mut ctx).unwrap());
        assert!(!tab.remove_row(seg, id, &mut ctx).unwrap()); // idempotent
        assert_eq!(tab.segment(seg).unwrap().base().delcnt(), 1);
    }

    #[test]
    fn test_index_search_skips_deleted() {
        let dir = tempdir().unwrap();
        let cfg = config();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..5i64 {
            tab.append_row(&row(&cfg, i, &format!("r{}", i)), &mut ctx)
                .unwrap();
        }
        tab.remove_row(0, 3, &mut ctx).unwrap();
        let mut ids = Vec::new();
        tab.index_search(0, 0, &3i64.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert!(ids.is_empty());
        tab.index_search(0, 0, &2i64.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_rollover_creates_new_segment() {
        let dir = tempdir().unwrap();
        let cfg = config();
        let tab = Table::create(
            dir.path(),
            cfg.clone(),
            TableConfig { rollover_rows: 3 },
        )
        .unwrap();
        let mut ctx = tab.new_context();
        for i in 0..7i64 {
            tab.append_row(&row(&cfg, i, "x"), &mut ctx).unwrap();
        }
        assert_eq!(tab.segment_count(), 3);
        let h = tab.segment(0).unwrap();
        assert!(h.base().is_freezed());
        assert_eq!(h.base().num_data_rows(), 3);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        let cfg = config();
        {
            let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
            let mut ctx = tab.new_context();
            for i in 0..3i64 {
                tab.append_row(&row(&cfg, i, &format!("r{}", i)), &mut ctx)
                    .unwrap();
            }
        }
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let mut out = Vec::new();
        tab.get_value(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 2, "r2"));
    }
}
