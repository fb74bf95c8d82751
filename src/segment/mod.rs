//! Segment state shared by every lifecycle stage
//!
//! A segment owns a directory, its `IsDel` bitmap, an optional
//! `IsPurged` rank/select bitmap, and the update bookkeeping that lets
//! a conversion run against it while deletions and in-place updates
//! keep happening.
//!
//! Lifecycle: writable → frozen writable → readonly → purged readonly.
//! Logical row ids never change within a segment; physical ids are
//! positions in a readonly segment's stores, translated through the
//! purge bitmap.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bits::{write_del_file, BitVec, DelMap, RankSelect};
use crate::schema::SchemaConfig;
use crate::{EngineError, Result};

pub mod convert;
pub mod purge;
pub mod readonly;
pub mod writable;

pub use readonly::ReadonlySegment;
pub use writable::WritableSegment;

pub const PURGE_FILE: &str = "IsPurged.rs";

/// Deletion bitmap in either build (heap) or mapped (mmap) form.
pub enum DelState {
    Mem(BitVec),
    Map(DelMap),
}

impl DelState {
    pub fn len(&self) -> usize {
        match self {
            DelState::Mem(b) => b.len(),
            DelState::Map(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        match self {
            DelState::Mem(b) => b.get(i),
            DelState::Map(m) => m.get(i),
        }
    }

    pub fn set1(&mut self, i: usize) -> bool {
        match self {
            DelState::Mem(b) => b.set1(i),
            DelState::Map(m) => m.set1(i),
        }
    }

    pub fn popcnt(&self) -> usize {
        match self {
            DelState::Mem(b) => b.popcnt(),
            DelState::Map(m) => m.popcnt(),
        }
    }

    pub fn snapshot(&self) -> BitVec {
        match self {
            DelState::Mem(b) => b.clone(),
            DelState::Map(m) => m.snapshot(),
        }
    }
}

/// Logical ids touched since `book_updates` was switched on: a sparse
/// list, escalated to a bitmap once it would exceed `rows / 256`.
#[derive(Default)]
pub struct UpdateTracking {
    pub list: Vec<u32>,
    pub bits: BitVec,
}

impl UpdateTracking {
    pub fn is_empty(&self) -> bool {
        self.list.is_empty() && self.bits.is_empty()
    }
}

pub struct SegmentBase {
    pub schema: Arc<SchemaConfig>,
    dir: RwLock<PathBuf>,
    pub(crate) del: RwLock<DelState>,
    delcnt: AtomicU64,
    purged: RwLock<Option<Arc<RankSelect>>>,
    is_freezed: AtomicBool,
    is_dirty: AtomicBool,
    tobe_del: AtomicBool,
    with_purge_bits: AtomicBool,
    book_updates: AtomicBool,
    updates: Mutex<UpdateTracking>,
}

impl SegmentBase {
    pub fn new(schema: Arc<SchemaConfig>, dir: PathBuf) -> Self {
        Self {
            schema,
            dir: RwLock::new(dir),
            del: RwLock::new(DelState::Mem(BitVec::new())),
            delcnt: AtomicU64::new(0),
            purged: RwLock::new(None),
            is_freezed: AtomicBool::new(false),
            is_dirty: AtomicBool::new(false),
            tobe_del: AtomicBool::new(false),
            with_purge_bits: AtomicBool::new(false),
            book_updates: AtomicBool::new(false),
            updates: Mutex::new(UpdateTracking::default()),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    pub fn set_dir(&self, dir: PathBuf) {
        *self.dir.write() = dir;
    }

    // ------------------------------------------------------------------
    // Id space
    // ------------------------------------------------------------------

    pub fn num_data_rows(&self) -> u64 {
        self.del.read().len() as u64
    }

    pub fn physic_rows(&self) -> u64 {
        match &*self.purged.read() {
            Some(p) => p.max_rank0() as u64,
            None => self.del.read().len() as u64,
        }
    }

    /// Translate a logical id into a store position. Purged rows are
    /// no longer addressable.
    pub fn physical_id(&self, logical: u64) -> Result<u64> {
        let rows = self.num_data_rows();
        if logical >= rows {
            return Err(EngineError::OutOfRange { id: logical, rows });
        }
        match &*self.purged.read() {
            None => Ok(logical),
            Some(p) => {
                debug_assert_eq!(p.len() as u64, rows);
                if p.get(logical as usize) {
                    return Err(EngineError::OutOfRange { id: logical, rows });
                }
                Ok(p.rank0(logical as usize) as u64)
            }
        }
    }

    /// Translate a store position back into a logical id.
    pub fn logical_id(&self, physical: u64) -> Result<u64> {
        match &*self.purged.read() {
            None => {
                let rows = self.num_data_rows();
                if physical >= rows {
                    return Err(EngineError::OutOfRange { id: physical, rows });
                }
                Ok(physical)
            }
            Some(p) => Ok(p.select0(physical as usize)? as u64),
        }
    }

    pub fn purged(&self) -> Option<Arc<RankSelect>> {
        self.purged.read().clone()
    }

    pub fn set_purged(&self, p: Option<Arc<RankSelect>>) {
        *self.purged.write() = p;
    }

    // ------------------------------------------------------------------
    // Deletions
    // ------------------------------------------------------------------

    pub fn delcnt(&self) -> u64 {
        self.delcnt.load(Ordering::Acquire)
    }

    pub(crate) fn set_delcnt(&self, v: u64) {
        self.delcnt.store(v, Ordering::Release);
    }

    pub fn is_deleted(&self, logical: u64) -> Result<bool> {
        let del = self.del.read();
        if logical >= del.len() as u64 {
            return Err(EngineError::OutOfRange {
                id: logical,
                rows: del.len() as u64,
            });
        }
        Ok(del.get(logical as usize))
    }

    /// Mark one row deleted. Idempotent; returns whether the bit was
    /// newly set. Also records the id for a conversion in flight.
    pub fn set_del(&self, logical: u64) -> Result<bool> {
        let newly = {
            let mut del = self.del.write();
            if logical >= del.len() as u64 {
                return Err(EngineError::OutOfRange {
                    id: logical,
                    rows: del.len() as u64,
                });
            }
            del.set1(logical as usize)
        };
        if newly {
            self.delcnt.fetch_add(1, Ordering::AcqRel);
            self.is_dirty.store(true, Ordering::Release);
        }
        self.add_to_update_list(logical);
        Ok(newly)
    }

    // ------------------------------------------------------------------
    // IsDel persistence
    // ------------------------------------------------------------------

    pub fn load_is_del(&self, dir: &Path) -> Result<()> {
        let dm = DelMap::load(dir)?;
        let cnt = dm.popcnt() as u64;
        *self.del.write() = DelState::Map(dm);
        self.delcnt.store(cnt, Ordering::Release);
        Ok(())
    }

    pub fn save_is_del(&self, dir: &Path) -> Result<()> {
        let del = self.del.read();
        debug_assert_eq!(del.popcnt() as u64, self.delcnt());
        if let DelState::Map(m) = &*del {
            if m.path().parent() == Some(dir) {
                // live mapping over the same file, flushing is enough
                return m.flush();
            }
        }
        write_del_file(dir, &del.snapshot())
    }

    pub fn close_is_del(&self) {
        *self.del.write() = DelState::Mem(BitVec::new());
        self.delcnt.store(0, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    pub fn is_freezed(&self) -> bool {
        self.is_freezed.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.is_freezed.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, v: bool) {
        self.is_dirty.store(v, Ordering::Release);
    }

    pub fn tobe_del(&self) -> bool {
        self.tobe_del.load(Ordering::Acquire)
    }

    /// Schedule directory removal for when the last reference drops.
    pub fn delete_segment(&self) {
        self.tobe_del.store(true, Ordering::Release);
    }

    pub fn with_purge_bits(&self) -> bool {
        self.with_purge_bits.load(Ordering::Acquire)
    }

    pub fn set_with_purge_bits(&self, v: bool) {
        self.with_purge_bits.store(v, Ordering::Release);
    }

    pub fn book_updates(&self) -> bool {
        self.book_updates.load(Ordering::Acquire)
    }

    pub fn set_book_updates(&self, v: bool) {
        self.book_updates.store(v, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Update tracking
    // ------------------------------------------------------------------

    pub fn reserve_update_list(&self, n: usize) {
        self.updates.lock().list.reserve(n);
    }

    pub fn updates_empty(&self) -> bool {
        self.updates.lock().is_empty()
    }

    /// Record a logical id as touched since bookkeeping started.
    pub fn add_to_update_list(&self, logical: u64) {
        if !self.book_updates.load(Ordering::Acquire) {
            return;
        }
        let rows = self.del.read().len();
        let mut u = self.updates.lock();
        if !u.bits.is_empty() {
            debug_assert_eq!(u.bits.len(), rows + 1);
            u.bits.set1(logical as usize);
        } else if u.list.len() < u.list.capacity() || u.list.len() < rows / 256 {
            u.list.push(logical as u32);
        } else {
            // escalate to a bitmap; the trailing bit is a stop sentinel
            let mut bits = BitVec::with_len(rows + 1, false);
            for &id in &u.list {
                bits.set1(id as usize);
            }
            bits.set1(logical as usize);
            bits.set1(rows);
            u.bits = bits;
            u.list.clear();
        }
    }

    /// Swap out the pending update records (replay passes).
    pub fn take_updates(&self) -> UpdateTracking {
        std::mem::take(&mut *self.updates.lock())
    }
}

/// Remove a doomed segment directory, swallowing failures (Windows
/// cannot delete hardlinked files still in use).
pub(crate) fn remove_segment_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    log::info!("remove segment dir: {}", dir.display());
    if let Err(e) = std::fs::remove_dir_all(dir) {
        log::error!("failed to remove {}: {}", dir.display(), e);
    }
}
