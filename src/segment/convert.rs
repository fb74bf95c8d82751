//! Writable → readonly conversion
//!
//! Streams a frozen writable segment into per-colgroup temp files,
//! builds indices and compressed stores from them, reloads everything
//! mmap-backed, then replays the deletions and in-place updates that
//! happened while the build ran. The replay runs three times: once
//! with no table lock (greedy catch-up), once under a read lock (to
//! narrow the window), and once under the writer lock that also swaps
//! the new segment in (to close it).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLockUpgradableReadGuard;

use super::{DelState, ReadonlySegment};
use crate::bits::RankSelect;
use crate::schema::{ColRange, Schema, SchemaConfig, DICT_ZIP_AVG_LEN_TRIGGER};
use crate::store::{
    build_dict_zip_store, FixedLenStore, ReadableStore, RecVec, SeqReadAppendonlyStore,
    StoreCursor,
};
use crate::table::{build_index, build_store, SegmentHandle, Table};
use crate::{EngineError, Result};

/// Deterministic per-segment seed for dict-zip sampling.
pub(crate) fn segment_seed(dir: &Path) -> u64 {
    let mut h = DefaultHasher::new();
    dir.file_name().map(|n| n.hash(&mut h));
    h.finish()
}

// ============================================================================
// Temp files
// ============================================================================

pub(crate) enum TempStore {
    Fixed(Arc<FixedLenStore>),
    Seq(SeqReadAppendonlyStore),
    Taken,
}

impl TempStore {
    pub(crate) fn as_store(&self) -> &dyn ReadableStore {
        match self {
            TempStore::Fixed(s) => s.as_ref(),
            TempStore::Seq(s) => s,
            TempStore::Taken => unreachable!("temp store already consumed"),
        }
    }
}

/// One temp store per column group: fixed-length groups go to an
/// in-memory fixed store, everything else streams to an append-only
/// file in the build directory.
pub(crate) struct TempFileList {
    stores: Vec<TempStore>,
    proj: Vec<u8>,
}

impl TempFileList {
    pub(crate) fn new(tmp_dir: &Path, schema: &SchemaConfig) -> Result<Self> {
        let mut stores = Vec::with_capacity(schema.colgroup_num());
        for gs in &schema.colgroups {
            if gs.fixed_row_len() > 0 {
                stores.push(TempStore::Fixed(Arc::new(FixedLenStore::new(gs))));
            } else {
                stores.push(TempStore::Seq(SeqReadAppendonlyStore::create(
                    tmp_dir,
                    &format!("colgroup-{}", gs.name),
                )?));
            }
        }
        Ok(Self {
            stores,
            proj: Vec::new(),
        })
    }

    /// Project one parsed row into every group's temp store.
    pub(crate) fn write_colgroups(
        &mut self,
        schema: &SchemaConfig,
        cols: &[ColRange],
        row: &[u8],
    ) -> Result<()> {
        for (g, store) in self.stores.iter_mut().enumerate() {
            let gs = &schema.colgroups[g];
            gs.select_parent(cols, row, &mut self.proj);
            match store {
                TempStore::Fixed(s) => {
                    s.append(&self.proj)?;
                }
                TempStore::Seq(s) => {
                    s.append(&self.proj)?;
                }
                TempStore::Taken => unreachable!(),
            }
        }
        Ok(())
    }

    pub(crate) fn complete_write(&self) -> Result<()> {
        for s in &self.stores {
            if let TempStore::Seq(seq) = s {
                seq.complete_write()?;
            }
        }
        Ok(())
    }

    pub(crate) fn store(&self, g: usize) -> &TempStore {
        &self.stores[g]
    }

    /// Adopt a fixed-length temp store as the final store of its group.
    pub(crate) fn take_fixed(&mut self, g: usize) -> Arc<FixedLenStore> {
        match std::mem::replace(&mut self.stores[g], TempStore::Taken) {
            TempStore::Fixed(s) => s,
            _ => unreachable!("group is not fixed-length"),
        }
    }

    pub(crate) fn delete(&mut self, g: usize) -> Result<()> {
        match std::mem::replace(&mut self.stores[g], TempStore::Taken) {
            TempStore::Seq(s) => s.delete_files(),
            _ => Ok(()),
        }
    }

    /// Pull records from `cursor` until `max_mem` is exceeded.
    /// Fixed-length groups ignore the bound and drain completely.
    pub(crate) fn collect_data(
        gs: &Schema,
        cursor: &mut dyn StoreCursor,
        recs: &mut RecVec,
        max_mem: usize,
    ) -> Result<u64> {
        let fixlen = gs.fixed_row_len();
        let mut buf = Vec::new();
        let mut n = 0u64;
        loop {
            if fixlen == 0 && recs.mem_size() >= max_mem {
                break;
            }
            buf.clear();
            if cursor.next(&mut buf)?.is_none() {
                break;
            }
            recs.push(&buf);
            n += 1;
        }
        Ok(n)
    }
}

// ============================================================================
// Conversion
// ============================================================================

/// Derive the readonly directory from the writable one (`wr-NNNN` →
/// `rd-NNNN` next to it).
fn readonly_dir_for(input_dir: &Path) -> Result<PathBuf> {
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| EngineError::invalid("segment directory has no name"))?;
    let suffix = name.strip_prefix("wr-").ok_or_else(|| {
        EngineError::invalid(format!("not a writable segment directory: {}", name))
    })?;
    Ok(input_dir.with_file_name(format!("rd-{}", suffix)))
}

pub(crate) fn tmp_dir_of(seg_dir: &Path) -> PathBuf {
    let name = seg_dir.file_name().unwrap().to_string_lossy();
    seg_dir.with_file_name(format!("{}.tmp", name))
}

/// Convert the frozen writable segment in slot `seg_idx` into a
/// readonly segment and swap it into the table.
pub fn convert_from(tab: &Table, seg_idx: usize) -> Result<Arc<ReadonlySegment>> {
    let schema = tab.schema().clone();
    let input = {
        let inner = tab.inner().read();
        match inner.segs.get(seg_idx) {
            Some(SegmentHandle::Writable(w)) => w.clone(),
            Some(SegmentHandle::Readonly(_)) => {
                return Err(EngineError::invalid("segment is already readonly"))
            }
            None => {
                return Err(EngineError::OutOfRange {
                    id: seg_idx as u64,
                    rows: inner.segs.len() as u64,
                })
            }
        }
    };
    if !input.base.is_freezed() {
        return Err(EngineError::invalid("conversion input must be frozen"));
    }
    if !input.base.updates_empty() || input.base.book_updates() {
        return Err(EngineError::invalid(
            "conversion input already has update bookkeeping",
        ));
    }
    input.base.reserve_update_list(1024);
    input.base.set_book_updates(true);

    let seg_dir = readonly_dir_for(&input.base.dir())?;
    let tmp_dir = tmp_dir_of(&seg_dir);
    std::fs::create_dir_all(&tmp_dir)?;

    // deletions after this snapshot are caught by the replay passes
    let mut is_del = input.base.del.read().snapshot();
    let logic_rows = is_del.len() as u64;
    let mut new_seg = ReadonlySegment::new(schema.clone(), seg_dir.clone());

    // Phase A: stream live rows into per-colgroup temp files
    let mut temp = TempFileList::new(&tmp_dir, &schema)?;
    let mut new_rows = 0u64;
    {
        let mut cursor = input.cursor_forward();
        let mut buf = Vec::new();
        let mut cols = Vec::new();
        let mut prev: Option<u64> = None;
        let mut seen: Option<u64> = None;
        while let Some(id) = {
            buf.clear();
            cursor.next(&mut buf)?
        } {
            if id >= logic_rows {
                break;
            }
            seen = Some(id);
            if !is_del.get(id as usize) {
                schema.row_schema.parse_row(&buf, &mut cols)?;
                temp.write_colgroups(&schema, &cols, &buf)?;
                new_rows += 1;
                let gap_beg = prev.map_or(0, |p| p + 1);
                is_del.set_range1(gap_beg as usize, id as usize);
                prev = Some(id);
            }
        }
        let input_rows = seen.map_or(0, |s| s + 1);
        if input_rows < logic_rows {
            log::warn!(
                "conversion of {}: store yielded {} rows, IsDel has {}; marking the tail deleted",
                input.base.dir().display(),
                input_rows,
                logic_rows
            );
            is_del.set_range1(input_rows as usize, logic_rows as usize);
            for id in input_rows..logic_rows {
                input.base.set_del(id)?;
            }
        }
    }
    let delcnt = is_del.popcnt() as u64;
    if logic_rows - new_rows != delcnt {
        return Err(EngineError::DataLoss {
            real: new_rows,
            expected: logic_rows - delcnt,
        });
    }
    temp.complete_write()?;

    // Phase B: build indices from the temp files
    for i in 0..schema.index_num {
        let gs = &schema.colgroups[i];
        let mut recs = new_recvec(gs);
        {
            let mut cur = temp.store(i).as_store().cursor();
            TempFileList::collect_data(gs, &mut *cur, &mut recs, usize::MAX)?;
        }
        let idx = build_index(gs, &recs)?;
        let store = idx
            .clone()
            .readable_store()
            .ok_or_else(|| EngineError::logic("built index has no readable store"))?;
        new_seg.indices.push(idx);
        new_seg.colgroups.push(store);
        if !gs.enable_linear_scan {
            temp.delete(i)?;
        }
    }

    // Phase C: build the remaining column groups
    let seed = segment_seed(&seg_dir);
    for g in schema.index_num..schema.colgroup_num() {
        let gs = &schema.colgroups[g];
        if gs.should_use_fixed_len_store() {
            new_seg.colgroups.push(temp.take_fixed(g));
            continue;
        }
        if dict_zip_wanted(gs, temp.store(g).as_store(), new_rows) {
            let store = {
                let tmp_store = temp.store(g).as_store();
                let mut cur = tmp_store.cursor();
                build_dict_zip_store(gs, &mut *cur, tmp_store.data_inflate_size(), None, None, seed)?
            };
            new_seg.colgroups.push(Arc::new(store));
            temp.delete(g)?;
            continue;
        }
        let store = build_parts(
            gs,
            temp.store(g).as_store(),
            new_rows,
            schema.compressing_work_mem,
        )?;
        new_seg.colgroups.push(store);
        temp.delete(g)?;
    }

    // install the deletion snapshot
    *new_seg.base.del.write() = DelState::Mem(is_del);
    new_seg.base.set_delcnt(delcnt);

    let arc = complete_and_reload(new_seg, tab, seg_idx, &SegmentHandle::Writable(input.clone()))?;

    std::fs::rename(&tmp_dir, &seg_dir)?;
    input.base.delete_segment();
    Ok(arc)
}

fn new_recvec(gs: &Schema) -> RecVec {
    if gs.fixed_row_len() > 0 {
        RecVec::new_fixed(gs.fixed_row_len())
    } else {
        RecVec::new_var()
    }
}

pub(crate) fn dict_zip_wanted(gs: &Schema, store: &dyn ReadableStore, rows: u64) -> bool {
    if !gs.dict_zip_local_match || gs.dict_zip_sample_ratio < 0.0 {
        return false;
    }
    let ratio = gs.dict_zip_sample_ratio;
    if ratio > 0.0 {
        return true;
    }
    if rows == 0 {
        return false;
    }
    let avg = store.data_inflate_size() as f64 / rows as f64;
    ratio < f32::EPSILON && avg > DICT_ZIP_AVG_LEN_TRIGGER
}

/// Split a temp store into parts bounded by the compression work
/// memory, building each part with the store policy.
fn build_parts(
    gs: &Schema,
    tmp_store: &dyn ReadableStore,
    total_rows: u64,
    max_mem: usize,
) -> Result<Arc<dyn ReadableStore>> {
    let mut parts: Vec<Arc<dyn ReadableStore>> = Vec::new();
    let mut rows = 0u64;
    let mut cur = tmp_store.cursor();
    while rows < total_rows {
        let mut recs = new_recvec(gs);
        let got = TempFileList::collect_data(gs, &mut *cur, &mut recs, max_mem)?;
        if got == 0 {
            break;
        }
        rows += got;
        parts.push(build_store(gs, &recs)?);
    }
    Ok(match parts.len() {
        0 => Arc::new(crate::store::EmptyStore::new()),
        1 => parts.pop().unwrap(),
        _ => Arc::new(crate::store::MultiPartStore::new(parts)),
    })
}

// ============================================================================
// Reload + replay + swap
// ============================================================================

/// Persist the built segment into its tmp directory, reload it
/// mmap-backed, replay concurrent deletions/updates in three passes,
/// and swap it into the table under the writer lock.
pub(crate) fn complete_and_reload(
    mut new_seg: ReadonlySegment,
    tab: &Table,
    seg_idx: usize,
    input: &SegmentHandle,
) -> Result<Arc<ReadonlySegment>> {
    new_seg.compute_sizes();
    let delcnt = new_seg.base.delcnt();
    if delcnt > 0 {
        let snapshot = new_seg.base.del.read().snapshot();
        new_seg
            .base
            .set_purged(Some(Arc::new(RankSelect::build(&snapshot))));
        new_seg.base.set_with_purge_bits(true);
    }
    let tmp_dir = tmp_dir_of(&new_seg.base.dir());
    new_seg.save(&tmp_dir)?;

    // drop the heap state, reload everything as mmap
    new_seg.close_files();
    new_seg.load(&tmp_dir)?;
    debug_assert_eq!(new_seg.base.num_data_rows(), input.base().num_data_rows());
    debug_assert_eq!(new_seg.base.del.read().popcnt() as u64, delcnt);

    let arc = Arc::new(new_seg);
    sync_new_deletion_mark(&arc, input)?; // no lock
    let inner = tab.inner().upgradable_read();
    sync_new_deletion_mark(&arc, input)?; // reader locked
    let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
    sync_new_deletion_mark(&arc, input)?; // writer locked
    arc.base.set_delcnt(input.base().delcnt());

    #[cfg(debug_assertions)]
    verify_against_input(&arc, input);

    inner.segs[seg_idx] = SegmentHandle::Readonly(arc.clone());
    inner.update_seq += 1;
    drop(inner);
    Ok(arc)
}

/// Drain the source's update bookkeeping and apply it to the new
/// segment: deletions become IsDel bits, in-place updates are copied
/// between the fixed-length stores at matching physical ids.
fn sync_new_deletion_mark(dst: &Arc<ReadonlySegment>, input: &SegmentHandle) -> Result<()> {
    debug_assert!(input.base().book_updates());
    let mut u = input.base().take_updates();
    if !u.list.is_empty() {
        debug_assert!(u.bits.is_empty());
        u.list.sort_unstable();
        u.list.dedup();
        for &id in &u.list {
            let id = id as u64;
            if input.base().is_deleted(id)? {
                dst.base.del.write().set1(id as usize);
            } else {
                sync_update_record(dst, input, id)?;
            }
        }
    } else if !u.bits.is_empty() {
        debug_assert_eq!(u.bits.len() as u64, dst.base.num_data_rows() + 1);
        let rows = dst.base.num_data_rows();
        for id in 0..rows {
            if u.bits.get(id as usize) && !input.base().is_deleted(id)? {
                sync_update_record(dst, input, id)?;
            }
        }
        // bulk-copy the deletion bits the bitmap epoch accumulated
        let src_bits = input.base().del.read().snapshot();
        match &mut *dst.base.del.write() {
            DelState::Map(m) => m.copy_from(&src_bits),
            DelState::Mem(b) => *b = src_bits,
        }
    }
    Ok(())
}

fn sync_update_record(dst: &Arc<ReadonlySegment>, input: &SegmentHandle, logic_id: u64) -> Result<()> {
    let dst_phys = dst.base.physical_id(logic_id)?;
    let src_phys = input.base().physical_id(logic_id)?;
    let schema = &dst.base.schema;
    for &g in &schema.updatable_colgroups {
        let dst_store = dst.colgroups[g]
            .as_fixed_len()
            .ok_or_else(|| EngineError::logic("updatable group is not fixed-length"))?;
        input.with_updatable_store(g, |src_store| {
            dst_store.copy_row_from(dst_phys, src_store, src_phys)
        })?;
    }
    Ok(())
}

#[cfg(debug_assertions)]
fn verify_against_input(dst: &Arc<ReadonlySegment>, input: &SegmentHandle) {
    let mut ctx = crate::context::DbContext::new();
    let mut ctx2 = crate::context::DbContext::new();
    let rows = dst.base.num_data_rows();
    let mut r1 = Vec::new();
    let mut r2 = Vec::new();
    for id in 0..rows {
        let src_deleted = input.base().is_deleted(id).unwrap();
        let dst_deleted = dst.base.is_deleted(id).unwrap();
        assert_eq!(src_deleted, dst_deleted, "IsDel mismatch at {}", id);
        if !src_deleted {
            r1.clear();
            r2.clear();
            dst.get_value_append(id, &mut r1, &mut ctx).unwrap();
            input.get_value_append(id, &mut r2, &mut ctx2).unwrap();
            assert_eq!(r1, r2, "row {} differs after conversion", id);
        }
    }
    if let Some(p) = dst.base.purged() {
        for id in 0..rows {
            if p.get(id as usize) {
                assert!(dst.base.is_deleted(id).unwrap());
            }
        }
    }
}

/// Internal helper on the handle: run `f` with the in-place updatable
/// store of group `g`.
impl SegmentHandle {
    pub(crate) fn with_updatable_store<R>(
        &self,
        g: usize,
        f: impl FnOnce(&FixedLenStore) -> Result<R>,
    ) -> Result<R> {
        match self {
            SegmentHandle::Writable(w) => {
                let store = w
                    .updatable_store(g)
                    .ok_or_else(|| EngineError::logic("group has no updatable store"))?;
                f(store)
            }
            SegmentHandle::Readonly(r) => {
                let store = r.colgroups[g]
                    .as_fixed_len()
                    .ok_or_else(|| EngineError::logic("updatable group is not fixed-length"))?;
                f(store)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, RowBuilder, SchemaConfigBuilder};
    use crate::table::{Table, TableConfig};
    use crate::EngineError;
    use tempfile::tempdir;

    fn config_basic() -> Arc<SchemaConfig> {
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
    fn test_insert_delete_alternate_convert() {
        let dir = tempdir().unwrap();
        let cfg = config_basic();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..10i64 {
            tab.append_row(&row(&cfg, i, &format!("r{}", i)), &mut ctx)
                .unwrap();
        }
        for i in (0..10u64).step_by(2) {
            tab.remove_row(0, i, &mut ctx).unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();

        let handle = tab.segment(0).unwrap();
        assert!(matches!(handle, SegmentHandle::Readonly(_)));
        assert_eq!(handle.base().delcnt(), 5);
        assert_eq!(handle.base().purged().unwrap().max_rank1(), 5);
        assert_eq!(handle.base().physic_rows(), 5);

        let mut out = Vec::new();
        for i in [1i64, 3, 5, 7, 9] {
            out.clear();
            handle
                .get_value_append(i as u64, &mut out, &mut ctx)
                .unwrap();
            assert_eq!(out, row(&cfg, i, &format!("r{}", i)));
        }
        for i in [0u64, 2, 4, 6, 8] {
            let err = handle
                .get_value_append(i, &mut Vec::new(), &mut ctx)
                .unwrap_err();
            assert!(matches!(err, EngineError::OutOfRange { .. }));
        }
        // index lookups survive with logical ids
        let mut ids = Vec::new();
        tab.index_search(0, 0, &7i64.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![7]);
        tab.index_search(0, 0, &4i64.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert!(ids.is_empty());
        // the writable directory is replaced by the readonly one
        assert!(dir.path().join("rd-0000").exists());

        // iteration sees only live logical ids, in both directions
        if let SegmentHandle::Readonly(rd) = &handle {
            let mut fwd = Vec::new();
            {
                let mut c = rd.cursor_forward(&mut ctx);
                while let Some(id) = c.next(&mut out).unwrap() {
                    fwd.push(id);
                    out.clear();
                }
            }
            assert_eq!(fwd, vec![1, 3, 5, 7, 9]);
            let mut bwd = Vec::new();
            {
                let mut c = rd.cursor_backward(&mut ctx);
                while let Some(id) = c.next(&mut out).unwrap() {
                    bwd.push(id);
                    out.clear();
                }
            }
            assert_eq!(bwd, vec![9, 7, 5, 3, 1]);

            // single-column projection translates ids the same way
            rd.select_one_column(3, 1, &mut out, &mut ctx).unwrap();
            assert_eq!(out, b"r3");
            let mut groups = Vec::new();
            rd.select_colgroups(3, &[0, 1], &mut groups, &mut ctx).unwrap();
            assert_eq!(groups[0], 3i64.to_le_bytes());
            assert_eq!(groups[1], b"r3");
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_convert_with_concurrent_delete() {
        let dir = tempdir().unwrap();
        let cfg = config_basic();
        let tab = Arc::new(
            Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap(),
        );
        let mut ctx = tab.new_context();
        for i in 0..1000i64 {
            tab.append_row(&row(&cfg, i, &format!("name-{}", i)), &mut ctx)
                .unwrap();
        }
        let frozen = tab.freeze_current_segment().unwrap();
        let input = tab.segment(frozen).unwrap();

        let tab2 = tab.clone();
        let conv = std::thread::spawn(move || tab2.convert_segment(frozen).unwrap());
        // wait until the converter starts booking updates, then delete
        while !input.base().book_updates() {
            std::thread::yield_now();
        }
        for id in [100u64, 200, 300] {
            tab.remove_row(frozen, id, &mut ctx).unwrap();
        }
        conv.join().unwrap();

        let handle = tab.segment(frozen).unwrap();
        assert!(matches!(handle, SegmentHandle::Readonly(_)));
        // rollover and swap each bump the array sequence
        assert!(tab.update_seq() >= 2);
        for id in [100u64, 200, 300] {
            assert!(handle.base().is_deleted(id).unwrap());
        }
        assert_eq!(handle.base().delcnt(), 3);
        assert_eq!(handle.base().del.read().popcnt(), 3);
        // untouched rows still read back
        let mut out = Vec::new();
        handle.get_value_append(500, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 500, "name-500"));
    }

    fn config_dict(zip_on_short_rows: bool) -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("body", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            .dict_zip_local_match("body", true)
            .dict_zip_sample_ratio("body", if zip_on_short_rows { 0.5 } else { 0.0 });
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_dict_zip_skipped_for_short_rows() {
        let dir = tempdir().unwrap();
        let cfg = config_dict(false);
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..3i64 {
            // average length well under the trigger
            tab.append_row(&row(&cfg, i, "short body content"), &mut ctx)
                .unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        let rd = dir.path().join("rd-0000");
        assert!(rd.join("colgroup-body.nlt").exists());
        assert!(!rd.join("colgroup-body.nlt-dict").exists());
    }

    #[test]
    fn test_dict_zip_used_for_long_rows() {
        let dir = tempdir().unwrap();
        let cfg = config_dict(false);
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let long = "x".repeat(500);
        for i in 0..3i64 {
            tab.append_row(&row(&cfg, i, &long), &mut ctx).unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        let rd = dir.path().join("rd-0000");
        assert!(rd.join("colgroup-body.nlt").exists());
        assert!(rd.join("colgroup-body.nlt-dict").exists());

        let mut out = Vec::new();
        tab.segment(0)
            .unwrap()
            .get_value_append(1, &mut out, &mut ctx)
            .unwrap();
        assert_eq!(out, row(&cfg, 1, &long));
    }

    fn config_parts() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            // 40-byte names + 8-byte offsets: 334 records per part
            .compressing_work_mem(48 * 334);
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_multi_part_build_and_load() {
        let dir = tempdir().unwrap();
        let cfg = config_parts();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..1000i64 {
            let name = format!("{:040}", i);
            tab.append_row(&row(&cfg, i, &name), &mut ctx).unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();

        let rd = dir.path().join("rd-0000");
        for part in ["0000", "0001", "0002"] {
            assert!(
                rd.join(format!("colgroup-name.{}.nlt", part)).exists(),
                "part {} missing",
                part
            );
        }
        assert!(!rd.join("colgroup-name.0003.nlt").exists());

        // reload discovers and reassembles the parts
        drop(tab);
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let mut out = Vec::new();
        for i in [0i64, 333, 334, 667, 668, 999] {
            out.clear();
            tab.get_value(0, i as u64, &mut out, &mut ctx).unwrap();
            assert_eq!(out, row(&cfg, i, &format!("{:040}", i)));
        }

        // a missing middle part must be rejected
        drop(tab);
        std::fs::remove_file(rd.join("colgroup-name.0001.nlt")).unwrap();
        let err = Table::open(dir.path(), cfg, TableConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_crash_between_save_and_rename_is_recoverable() {
        let dir = tempdir().unwrap();
        let cfg = config_basic();
        {
            let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
            let mut ctx = tab.new_context();
            for i in 0..4i64 {
                tab.append_row(&row(&cfg, i, &format!("r{}", i)), &mut ctx)
                    .unwrap();
            }
            tab.freeze_current_segment().unwrap();
        }
        // a converter died after writing its tmp dir, before the rename
        let tmp = dir.path().join("rd-0000.tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("partial"), b"torn build").unwrap();

        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let handle = tab.segment(0).unwrap();
        assert!(matches!(handle, SegmentHandle::Writable(_)));
        let mut out = Vec::new();
        tab.get_value(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 2, "r2"));
    }

    fn config_inplace() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("score", ColumnType::Float64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            .add_colgroup("score", &["score"], true)
            .keep_purge_bits(true);
        Arc::new(b.build().unwrap())
    }

    fn row3(cfg: &SchemaConfig, id: i64, score: f64, name: &str) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_i64(id)
            .push_f64(score)
            .push_str(name)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_inplace_group_survives_convert_and_updates() {
        let dir = tempdir().unwrap();
        let cfg = config_inplace();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..6i64 {
            tab.append_row(&row3(&cfg, i, i as f64, &format!("n{}", i)), &mut ctx)
                .unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();

        let mut out = Vec::new();
        tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row3(&cfg, 4, 4.0, "n4"));

        // in-place update on the readonly segment
        tab.update_row(0, 4, &row3(&cfg, 4, 99.5, "n4"), &mut ctx)
            .unwrap();
        tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row3(&cfg, 4, 99.5, "n4"));
    }

    fn config_composite() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("a", ColumnType::Int32)
            .add_column("b", ColumnType::Int32)
            .add_column("name", ColumnType::Utf8)
            .add_index("ab", &["a", "b"], true)
            .keep_purge_bits(true);
        Arc::new(b.build().unwrap())
    }

    fn composite_row(cfg: &SchemaConfig, a: i32, b: i32, name: &str) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_i64(a as i64)
            .push_i64(b as i64)
            .push_str(name)
            .finish()
            .unwrap()
    }

    fn composite_key(a: i32, b: i32) -> Vec<u8> {
        let mut key = a.to_le_bytes().to_vec();
        key.extend_from_slice(&b.to_le_bytes());
        key
    }

    #[test]
    fn test_convert_builds_fixed_len_key_index_for_composite_key() {
        let dir = tempdir().unwrap();
        let cfg = config_composite();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..6i32 {
            tab.append_row(
                &composite_row(&cfg, i, i * 10, &format!("row{}", i)),
                &mut ctx,
            )
            .unwrap();
        }
        tab.remove_row(0, 2, &mut ctx).unwrap();
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();

        // two fixed columns, 8 bytes total: the binary-searched
        // fixed-key backend, not the packed-int one
        let rd = dir.path().join("rd-0000");
        assert!(rd.join("index-ab.fixlen").exists());
        assert!(!rd.join("index-ab.zint").exists());

        let mut ids = Vec::new();
        tab.index_search(0, 0, &composite_key(3, 30), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![3]);
        tab.index_search(0, 0, &composite_key(2, 20), &mut ids, &mut ctx)
            .unwrap();
        assert!(ids.is_empty()); // deleted before the freeze
        let mut out = Vec::new();
        tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
        assert_eq!(out, composite_row(&cfg, 4, 40, "row4"));

        // reopen: the index comes back through the .fixlen probe
        drop(tab);
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        tab.index_search(0, 0, &composite_key(5, 50), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![5]);
        tab.get_value(0, 5, &mut out, &mut ctx).unwrap();
        assert_eq!(out, composite_row(&cfg, 5, 50, "row5"));
    }

    fn config_utf8_key() -> Arc<SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("name", ColumnType::Utf8)
            .add_column("val", ColumnType::Int64)
            .add_index("name", &["name"], false)
            .keep_purge_bits(true);
        Arc::new(b.build().unwrap())
    }

    fn utf8_row(cfg: &SchemaConfig, name: &str, val: i64) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_str(name)
            .push_i64(val)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_convert_builds_sorted_key_index_for_utf8_key() {
        let dir = tempdir().unwrap();
        let cfg = config_utf8_key();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for (i, name) in ["apple", "fig", "apple", "pear", "fig"].iter().enumerate() {
            tab.append_row(&utf8_row(&cfg, name, i as i64), &mut ctx)
                .unwrap();
        }
        tab.remove_row(0, 1, &mut ctx).unwrap(); // the first "fig"
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();

        let rd = dir.path().join("rd-0000");
        assert!(rd.join("index-name.nlt").exists());

        let mut ids = Vec::new();
        tab.index_search(0, 0, b"apple", &mut ids, &mut ctx).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 2]);
        tab.index_search(0, 0, b"fig", &mut ids, &mut ctx).unwrap();
        assert_eq!(ids, vec![4]);
        tab.index_search(0, 0, b"quince", &mut ids, &mut ctx).unwrap();
        assert!(ids.is_empty());
        let mut out = Vec::new();
        tab.get_value(0, 3, &mut out, &mut ctx).unwrap();
        assert_eq!(out, utf8_row(&cfg, "pear", 3));

        // reopen: the index comes back through the .nlt probe
        drop(tab);
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        tab.index_search(0, 0, b"apple", &mut ids, &mut ctx).unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 2]);
        tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
        assert_eq!(out, utf8_row(&cfg, "fig", 4));
    }

    #[test]
    fn test_save_load_roundtrip_with_purge_bits() {
        let dir = tempdir().unwrap();
        let cfg = config_inplace();
        {
            let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
            let mut ctx = tab.new_context();
            for i in 0..8i64 {
                tab.append_row(&row3(&cfg, i, i as f64, &format!("n{}", i)), &mut ctx)
                    .unwrap();
            }
            for id in [1u64, 5] {
                tab.remove_row(0, id, &mut ctx).unwrap();
            }
            tab.freeze_current_segment().unwrap();
            tab.convert_segment(0).unwrap();
        }
        // reopen: keep_purge_bits preserves the logical id space
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().num_data_rows(), 8);
        assert_eq!(handle.base().delcnt(), 2);
        assert_eq!(handle.base().purged().unwrap().max_rank1(), 2);
        let mut out = Vec::new();
        for i in [0i64, 2, 3, 4, 6, 7] {
            out.clear();
            tab.get_value(0, i as u64, &mut out, &mut ctx).unwrap();
            assert_eq!(out, row3(&cfg, i, i as f64, &format!("n{}", i)));
        }
        assert!(tab.get_value(0, 5, &mut out, &mut ctx).is_err());
    }
}
