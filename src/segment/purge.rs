//! Readonly → compacted readonly purge
//!
//! Rebuilds a readonly segment without its physically-deleted rows.
//! Indices and column groups are regenerated from the live records,
//! the same three-pass replay as conversion absorbs concurrent
//! deletions, and the directory swap goes through a `.backup-N`
//! rename so a failed swap can roll back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::convert::{complete_and_reload, dict_zip_wanted, segment_seed, tmp_dir_of};
use super::{DelState, ReadonlySegment};
use crate::bits::BitVec;
use crate::index::ReadableIndex;
use crate::store::{
    build_dict_zip_store, EmptyStore, FixedLenStore, MultiPartStore, ReadableStore, RecVec,
    SeqReadAppendonlyStore,
};
use crate::table::{build_index, build_store, PurgeStatus, SegmentHandle, Table};
use crate::{EngineError, Result};

/// Pick the first unused `.backup-N` name and rename the directory to
/// it.
fn rename_to_backup(seg_dir: &Path) -> Result<PathBuf> {
    let name = seg_dir.file_name().unwrap().to_string_lossy().to_string();
    for n in 0.. {
        let backup = seg_dir.with_file_name(format!("{}.backup-{}", name, n));
        if !backup.exists() {
            std::fs::rename(seg_dir, &backup)?;
            return Ok(backup);
        }
        log::error!("stale backup exists: {}", backup.display());
    }
    unreachable!()
}

/// Compact the readonly segment in slot `seg_idx`, dropping all
/// tombstoned rows, and swap the result in.
pub fn purge_deleted_records(tab: &Table, seg_idx: usize) -> Result<Arc<ReadonlySegment>> {
    if tab.table_scanning_ref_count() > 0 {
        return Err(EngineError::invalid("cannot purge under an active scan"));
    }
    let schema = tab.schema().clone();
    let input = {
        let inner = tab.inner().upgradable_read();
        let input = match inner.segs.get(seg_idx) {
            Some(SegmentHandle::Readonly(r)) => r.clone(),
            Some(SegmentHandle::Writable(_)) => {
                return Err(EngineError::invalid("purge input must be readonly"))
            }
            None => {
                return Err(EngineError::OutOfRange {
                    id: seg_idx as u64,
                    rows: inner.segs.len() as u64,
                })
            }
        };
        if input.base.book_updates() {
            return Err(EngineError::invalid(
                "purge input already has update bookkeeping",
            ));
        }
        input.base.reserve_update_list(1024);
        input.base.set_book_updates(true);
        let _writer = parking_lot::RwLockUpgradableReadGuard::upgrade(inner);
        tab.set_purge_status(PurgeStatus::Purging);
        input
    };
    log::info!("purging {}", input.base.dir().display());

    let is_del = input.base.del.read().snapshot();
    let delcnt = is_del.popcnt() as u64;
    let seg_dir = input.base.dir();
    let tmp_dir = tmp_dir_of(&seg_dir);
    std::fs::create_dir_all(&tmp_dir)?;

    let mut new_seg = ReadonlySegment::new(schema.clone(), seg_dir.clone());
    for i in 0..schema.index_num {
        let idx = purge_index(i, &input, &is_del, delcnt)?;
        let store = idx
            .clone()
            .readable_store()
            .ok_or_else(|| EngineError::logic("purged index has no readable store"))?;
        new_seg.indices.push(idx);
        new_seg.colgroups.push(store);
    }
    for g in schema.index_num..schema.colgroup_num() {
        let store = purge_colgroup(g, &input, &is_del, &tmp_dir)?;
        new_seg.colgroups.push(store);
    }
    *new_seg.base.del.write() = DelState::Mem(is_del);
    new_seg.base.set_delcnt(delcnt);

    let arc = complete_and_reload(
        new_seg,
        tab,
        seg_idx,
        &SegmentHandle::Readonly(input.clone()),
    )?;

    // swap directories: input moves aside, tmp becomes the segment
    let backup = rename_to_backup(&seg_dir)?;
    {
        let _writer = tab.inner().write();
        input.base.set_dir(backup.clone());
        input.base.delete_segment();
    }
    if let Err(e) = std::fs::rename(&tmp_dir, &seg_dir) {
        log::error!(
            "rename {} -> {} failed ({}), restoring backup",
            tmp_dir.display(),
            seg_dir.display(),
            e
        );
        std::fs::rename(&backup, &seg_dir)?;
        return Err(EngineError::Io(e));
    }
    tab.set_purge_status(PurgeStatus::None);
    Ok(arc)
}

/// Rebuild one index from the live records of the input segment.
fn purge_index(
    index_id: usize,
    input: &Arc<ReadonlySegment>,
    is_del: &BitVec,
    delcnt: u64,
) -> Result<Arc<dyn ReadableIndex>> {
    let schema = &input.base.schema;
    let gs = &schema.colgroups[index_id];
    let input_rows = input.base.num_data_rows();
    if is_del.len() as u64 == delcnt {
        return Ok(Arc::new(EmptyStore::new()));
    }
    let purged = input.base.purged();
    let mut recs = if gs.fixed_row_len() > 0 {
        RecVec::new_fixed(gs.fixed_row_len())
    } else {
        RecVec::new_var()
    };
    let seq_path = input
        .base
        .dir()
        .join(format!("colgroup-{}.seq", gs.name));
    if gs.fixed_row_len() == 0 && gs.enable_linear_scan && seq_path.exists() {
        // linear re-read of the kept temp stream
        let store = SeqReadAppendonlyStore::open(&seq_path)?;
        let mut cur = store.cursor();
        let mut rec = Vec::new();
        for logic in 0..input_rows {
            if purged.as_ref().map_or(false, |p| p.get(logic as usize)) {
                continue;
            }
            rec.clear();
            if cur.next(&mut rec)?.is_none() {
                return Err(EngineError::logic(format!(
                    "sequential store of index {} ran out at logical id {}",
                    gs.name, logic
                )));
            }
            if !is_del.get(logic as usize) {
                recs.push(&rec);
            }
        }
    } else {
        let store = input.indices[index_id]
            .clone()
            .readable_store()
            .ok_or_else(|| EngineError::logic("input index has no readable store"))?;
        let mut rec = Vec::new();
        let mut physic = 0u64;
        for logic in 0..input_rows {
            if purged.as_ref().map_or(false, |p| p.get(logic as usize)) {
                continue;
            }
            if !is_del.get(logic as usize) {
                rec.clear();
                store.get_value_append(physic, &mut rec)?;
                recs.push(&rec);
            }
            physic += 1;
        }
    }
    build_index(gs, &recs)
}

/// Rebuild one non-index column group from the live records.
fn purge_colgroup(
    g: usize,
    input: &Arc<ReadonlySegment>,
    is_del: &BitVec,
    tmp_dir: &Path,
) -> Result<Arc<dyn ReadableStore>> {
    let schema = &input.base.schema;
    let gs = &schema.colgroups[g];
    let input_rows = input.base.num_data_rows();
    let delcnt = is_del.popcnt() as u64;
    if is_del.len() as u64 == delcnt {
        return Ok(Arc::new(EmptyStore::new()));
    }
    let purged = input.base.purged();
    let colgroup = &input.colgroups[g];

    if gs.should_use_fixed_len_store() {
        let store = FixedLenStore::new(gs);
        store.reserve_rows((is_del.len() as u64 - delcnt) as usize);
        let mut buf = Vec::new();
        let mut physic = 0u64;
        for logic in 0..input_rows {
            if purged.as_ref().map_or(false, |p| p.get(logic as usize)) {
                continue;
            }
            if !is_del.get(logic as usize) {
                buf.clear();
                colgroup.get_value_append(physic, &mut buf)?;
                store.append(&buf)?;
            }
            physic += 1;
        }
        return Ok(Arc::new(store));
    }

    if dict_zip_wanted(gs, colgroup.as_ref(), colgroup.num_data_rows().max(1)) {
        let seed = segment_seed(&input.base.dir());
        let mut cur = colgroup.cursor();
        let store = build_dict_zip_store(
            gs,
            &mut *cur,
            colgroup.data_inflate_size(),
            Some(is_del),
            purged.as_deref(),
            seed,
        )?;
        return Ok(Arc::new(store));
    }

    // multi-part rebuild bounded by the compression work memory
    let max_mem = schema.compressing_work_mem;
    let seq_store = if gs.enable_linear_scan {
        Some(SeqReadAppendonlyStore::create(
            tmp_dir,
            &format!("colgroup-{}", gs.name),
        )?)
    } else {
        None
    };
    let mut parts: Vec<Arc<dyn ReadableStore>> = Vec::new();
    let mut recs = if gs.fixed_row_len() > 0 {
        RecVec::new_fixed(gs.fixed_row_len())
    } else {
        RecVec::new_var()
    };
    let mut buf = Vec::new();
    let mut push_record = |recs: &mut RecVec,
                           parts: &mut Vec<Arc<dyn ReadableStore>>,
                           rec: &[u8]|
     -> Result<()> {
        if recs.mem_size() >= max_mem && !recs.is_empty() {
            parts.push(build_store(gs, recs)?);
            recs.clear();
        }
        recs.push(rec);
        if let Some(seq) = &seq_store {
            seq.append(rec)?;
        }
        Ok(())
    };

    if let Some(mp) = colgroup.as_multi_part() {
        // each part advances its own sub-physical id
        let mut logic = 0u64;
        for j in 0..mp.num_parts() {
            let part = mp.part(j);
            let part_rows = part.num_data_rows();
            let mut sub = 0u64;
            while logic < input_rows && sub < part_rows {
                if purged.as_ref().map_or(true, |p| !p.get(logic as usize)) {
                    if !is_del.get(logic as usize) {
                        buf.clear();
                        part.get_value_append(sub, &mut buf)?;
                        push_record(&mut recs, &mut parts, &buf)?;
                    }
                    sub += 1;
                }
                logic += 1;
            }
            if sub != part_rows {
                return Err(EngineError::logic(format!(
                    "part {} of group {} has {} rows, walked {}",
                    j, gs.name, part_rows, sub
                )));
            }
        }
    } else {
        let mut physic = 0u64;
        for logic in 0..input_rows {
            if purged.as_ref().map_or(false, |p| p.get(logic as usize)) {
                continue;
            }
            if !is_del.get(logic as usize) {
                buf.clear();
                colgroup.get_value_append(physic, &mut buf)?;
                push_record(&mut recs, &mut parts, &buf)?;
            }
            physic += 1;
        }
    }
    if !recs.is_empty() {
        parts.push(build_store(gs, &recs)?);
    }
    if let Some(seq) = &seq_store {
        seq.complete_write()?;
    }
    Ok(match parts.len() {
        0 => Arc::new(EmptyStore::new()),
        1 => parts.pop().unwrap(),
        _ => Arc::new(MultiPartStore::new(parts)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, RowBuilder, SchemaConfigBuilder};
    use crate::table::{Table, TableConfig};
    use crate::EngineError;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(keep_purge_bits: bool) -> Arc<crate::schema::SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            .keep_purge_bits(keep_purge_bits);
        Arc::new(b.build().unwrap())
    }

    fn row(cfg: &crate::schema::SchemaConfig, id: i64, name: &str) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_i64(id)
            .push_str(name)
            .finish()
            .unwrap()
    }

    /// Build a readonly segment with 8 rows and no purge bits, then
    /// tombstone ids 2, 3, 5, 7 on it.
    fn readonly_with_tombstones(
        dir: &std::path::Path,
        cfg: &Arc<crate::schema::SchemaConfig>,
    ) -> Table {
        let tab = Table::create(dir, cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..8i64 {
            tab.append_row(&row(cfg, i, &format!("r{}", i)), &mut ctx)
                .unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        for id in [2u64, 3, 5, 7] {
            tab.remove_row(0, id, &mut ctx).unwrap();
        }
        tab
    }

    #[test]
    fn test_purge_without_purge_bits_compacts_id_space() {
        let dir = tempdir().unwrap();
        let cfg = config(false);
        {
            let tab = readonly_with_tombstones(dir.path(), &cfg);
            tab.purge_segment(0).unwrap();
            // in-process the logical ids still work through select0
            let mut ctx = tab.new_context();
            let mut out = Vec::new();
            tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
            assert_eq!(out, row(&cfg, 4, "r4"));
        }
        // reload without keep_purge_bits: id space is compacted
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().num_data_rows(), 4);
        assert_eq!(handle.base().delcnt(), 0);
        assert!(handle.base().purged().is_none());
        let rd = dir.path().join("rd-0000");
        assert!(!rd.join("IsPurged.rs").exists());
        assert!(!rd.join("IsDel.backup").exists());
        // surviving rows are renumbered 0..4 in insertion order
        let mut ctx = tab.new_context();
        let mut out = Vec::new();
        for (new_id, old) in [0i64, 1, 4, 6].iter().enumerate() {
            out.clear();
            tab.get_value(0, new_id as u64, &mut out, &mut ctx).unwrap();
            assert_eq!(out, row(&cfg, *old, &format!("r{}", old)));
        }
        assert!(tab.get_value(0, 4, &mut out, &mut ctx).is_err());
    }

    #[test]
    fn test_purge_with_purge_bits_keeps_logical_ids() {
        let dir = tempdir().unwrap();
        let cfg = config(true);
        {
            let tab = readonly_with_tombstones(dir.path(), &cfg);
            tab.purge_segment(0).unwrap();
            assert_eq!(tab.segment(0).unwrap().base().physic_rows(), 4);
        }
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().num_data_rows(), 8);
        assert_eq!(handle.base().delcnt(), 4);
        assert_eq!(handle.base().purged().unwrap().max_rank1(), 4);
        let mut ctx = tab.new_context();
        let mut out = Vec::new();
        for i in [0i64, 1, 4, 6] {
            out.clear();
            tab.get_value(0, i as u64, &mut out, &mut ctx).unwrap();
            assert_eq!(out, row(&cfg, i, &format!("r{}", i)));
        }
        for i in [2u64, 3, 5, 7] {
            let err = tab.get_value(0, i, &mut out, &mut ctx).unwrap_err();
            assert!(matches!(err, EngineError::OutOfRange { .. }));
        }
    }

    #[test]
    fn test_purge_twice_is_noop() {
        let dir = tempdir().unwrap();
        let cfg = config(true);
        let tab = readonly_with_tombstones(dir.path(), &cfg);
        tab.purge_segment(0).unwrap();
        let delcnt = tab.segment(0).unwrap().base().delcnt();
        tab.purge_segment(0).unwrap();
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().delcnt(), delcnt);
        assert_eq!(handle.base().physic_rows(), 4);
        let mut ctx = tab.new_context();
        let mut out = Vec::new();
        tab.get_value(0, 6, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row(&cfg, 6, "r6"));
    }

    #[test]
    fn test_purge_refused_under_active_scan() {
        let dir = tempdir().unwrap();
        let cfg = config(true);
        let tab = readonly_with_tombstones(dir.path(), &cfg);
        let guard = tab.begin_scan();
        let err = tab.purge_segment(0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        drop(guard);
        tab.purge_segment(0).unwrap();
    }

    #[test]
    fn test_purge_all_deleted_yields_empty_stores() {
        let dir = tempdir().unwrap();
        let cfg = config(true);
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..4i64 {
            tab.append_row(&row(&cfg, i, "gone"), &mut ctx).unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        for id in 0..4u64 {
            tab.remove_row(0, id, &mut ctx).unwrap();
        }
        tab.purge_segment(0).unwrap();
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().physic_rows(), 0);
        assert!(tab.get_value(0, 0, &mut Vec::new(), &mut ctx).is_err());
        let rd = dir.path().join("rd-0000");
        assert!(rd.join("index-id.empty").exists());
    }

    fn config_utf8_key() -> Arc<crate::schema::SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("name", ColumnType::Utf8)
            .add_column("val", ColumnType::Int64)
            .add_index("name", &["name"], false)
            .keep_purge_bits(true);
        Arc::new(b.build().unwrap())
    }

    fn utf8_row(cfg: &crate::schema::SchemaConfig, name: &str, val: i64) -> Vec<u8> {
        RowBuilder::new(&cfg.row_schema)
            .push_str(name)
            .push_i64(val)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_purge_rebuilds_sorted_key_index() {
        let dir = tempdir().unwrap();
        let cfg = config_utf8_key();
        let tab = Table::create(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        for i in 0..6i64 {
            tab.append_row(&utf8_row(&cfg, &format!("n{}", i), i), &mut ctx)
                .unwrap();
        }
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        for id in [1u64, 3] {
            tab.remove_row(0, id, &mut ctx).unwrap();
        }
        tab.purge_segment(0).unwrap();

        // the var-len key index was rebuilt from the live records
        assert!(dir.path().join("rd-0000").join("index-name.nlt").exists());
        let mut ids = Vec::new();
        tab.index_search(0, 0, b"n1", &mut ids, &mut ctx).unwrap();
        assert!(ids.is_empty());
        tab.index_search(0, 0, b"n4", &mut ids, &mut ctx).unwrap();
        assert_eq!(ids, vec![4]);
        let mut out = Vec::new();
        tab.get_value(0, 4, &mut out, &mut ctx).unwrap();
        assert_eq!(out, utf8_row(&cfg, "n4", 4));

        // reopen: purger-written files load through the .nlt probe
        drop(tab);
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        tab.index_search(0, 0, b"n2", &mut ids, &mut ctx).unwrap();
        assert_eq!(ids, vec![2]);
        tab.get_value(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, utf8_row(&cfg, "n2", 2));
    }

    fn config_composite() -> Arc<crate::schema::SchemaConfig> {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("a", ColumnType::Int32)
            .add_column("b", ColumnType::Int32)
            .add_column("name", ColumnType::Utf8)
            .add_index("ab", &["a", "b"], true)
            .keep_purge_bits(true);
        Arc::new(b.build().unwrap())
    }

    fn composite_row(cfg: &crate::schema::SchemaConfig, a: i32, b: i32, name: &str) -> Vec<u8> {
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
    fn test_purge_rebuilds_fixed_len_key_index() {
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
        tab.freeze_current_segment().unwrap();
        tab.convert_segment(0).unwrap();
        for id in [0u64, 5] {
            tab.remove_row(0, id, &mut ctx).unwrap();
        }
        tab.purge_segment(0).unwrap();

        assert!(dir.path().join("rd-0000").join("index-ab.fixlen").exists());
        let handle = tab.segment(0).unwrap();
        assert_eq!(handle.base().physic_rows(), 4);
        let mut ids = Vec::new();
        tab.index_search(0, 0, &composite_key(0, 0), &mut ids, &mut ctx)
            .unwrap();
        assert!(ids.is_empty());
        tab.index_search(0, 0, &composite_key(3, 30), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![3]);

        // reopen: purger-written files load through the .fixlen probe
        drop(tab);
        let tab = Table::open(dir.path(), cfg.clone(), TableConfig::default()).unwrap();
        let mut ctx = tab.new_context();
        tab.index_search(0, 0, &composite_key(2, 20), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![2]);
        let mut out = Vec::new();
        tab.get_value(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, composite_row(&cfg, 2, 20, "row2"));
    }

    #[test]
    fn test_backup_dir_is_removed_after_swap() {
        let dir = tempdir().unwrap();
        let cfg = config(true);
        let tab = readonly_with_tombstones(dir.path(), &cfg);
        tab.purge_segment(0).unwrap();
        // the old segment moved to .backup-0 and is torn down when the
        // last reference drops
        drop(tab);
        assert!(!dir.path().join("rd-0000.backup-0").exists());
        assert!(dir.path().join("rd-0000").exists());
    }
}
