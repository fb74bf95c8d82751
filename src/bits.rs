//! Bitmaps and rank/select
//!
//! Three flavors back the id space of a segment:
//! - [`BitVec`]: plain heap bitmap, used for scratch copies and builds.
//! - [`RankSelect`]: immutable bitmap with a rank cache every 512 bits,
//!   answering `rank0`/`rank1`/`select0` for logical↔physical mapping.
//! - [`DelMap`]: the mmap-backed `IsDel` file. Layout: one little-endian
//!   `u64` row count, then packed bits, zero-padded so the file size is
//!   a chunk multiple. Capacity grows by truncate+remap.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{EngineError, Result};

/// IsDel growth chunk, counted in file bits (header included).
#[cfg(debug_assertions)]
pub const CHUNK_BITS: usize = 4 * 1024;
#[cfg(not(debug_assertions))]
pub const CHUNK_BITS: usize = 1024 * 1024;

const HEADER_BITS: usize = 64;

#[inline]
fn word_of(i: usize) -> (usize, u64) {
    (i / 64, 1u64 << (i % 64))
}

#[inline]
fn words_for(bits: usize) -> usize {
    (bits + 63) / 64
}

fn popcnt_words(words: &[u64], len: usize) -> usize {
    let full = len / 64;
    let mut n: usize = words[..full].iter().map(|w| w.count_ones() as usize).sum();
    let tail = len % 64;
    if tail > 0 {
        n += (words[full] & ((1u64 << tail) - 1)).count_ones() as usize;
    }
    n
}

// ============================================================================
// BitVec
// ============================================================================

/// Heap bitmap. Trailing bits past `len` are kept zero.
#[derive(Debug, Clone, Default)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
}

impl BitVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize, fill: bool) -> Self {
        let mut words = vec![if fill { !0u64 } else { 0 }; words_for(len)];
        if fill {
            let tail = len % 64;
            if tail > 0 {
                *words.last_mut().unwrap() &= (1u64 << tail) - 1;
            }
        }
        Self { words, len }
    }

    pub fn from_words(words: Vec<u64>, len: usize) -> Self {
        debug_assert!(words.len() >= words_for(len));
        let mut v = Self { words, len };
        v.mask_tail();
        v
    }

    fn mask_tail(&mut self) {
        let full = words_for(self.len);
        self.words.truncate(full);
        let tail = self.len % 64;
        if tail > 0 {
            if let Some(w) = self.words.last_mut() {
                *w &= (1u64 << tail) - 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, m) = word_of(i);
        self.words[w] & m != 0
    }

    /// Returns true when the bit was newly set.
    #[inline]
    pub fn set1(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, m) = word_of(i);
        let old = self.words[w];
        self.words[w] = old | m;
        old & m == 0
    }

    /// Set all bits in `[beg, end)`.
    pub fn set_range1(&mut self, beg: usize, end: usize) {
        debug_assert!(end <= self.len);
        let mut i = beg;
        while i < end && i % 64 != 0 {
            self.set1(i);
            i += 1;
        }
        while i + 64 <= end {
            self.words[i / 64] = !0u64;
            i += 64;
        }
        while i < end {
            self.set1(i);
            i += 1;
        }
    }

    pub fn push(&mut self, v: bool) {
        if self.len % 64 == 0 && self.len / 64 == self.words.len() {
            self.words.push(0);
        }
        if v {
            let (w, m) = word_of(self.len);
            self.words[w] |= m;
        }
        self.len += 1;
    }

    pub fn popcnt(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        popcnt_words(&self.words, self.len)
    }
}

// ============================================================================
// RankSelect
// ============================================================================

const RANK_BLOCK_BITS: usize = 512;

enum RsWords {
    Heap(Vec<u64>),
    Map(Mmap),
}

impl RsWords {
    fn slice(&self, nwords: usize) -> &[u64] {
        match self {
            RsWords::Heap(v) => &v[..nwords],
            RsWords::Map(m) => {
                let bytes = &m[8..8 + nwords * 8];
                debug_assert_eq!(bytes.as_ptr() as usize % 8, 0);
                unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u64, nwords) }
            }
        }
    }
}

/// Immutable bitmap with a rank cache, answering rank/select queries.
pub struct RankSelect {
    words: RsWords,
    len: usize,
    /// Cumulative rank1 at the start of each 512-bit block, plus a
    /// final total entry.
    ranks: Vec<u64>,
    ones: usize,
}

impl RankSelect {
    pub fn build(bits: &BitVec) -> Self {
        let len = bits.len();
        let words = bits.words().to_vec();
        let mut rs = Self {
            words: RsWords::Heap(words),
            len,
            ranks: Vec::new(),
            ones: 0,
        };
        rs.build_cache();
        rs
    }

    fn build_cache(&mut self) {
        let len = self.len;
        let nwords = words_for(len);
        let words = self.words.slice(nwords);
        let nblocks = (len + RANK_BLOCK_BITS - 1) / RANK_BLOCK_BITS;
        let mut ranks = Vec::with_capacity(nblocks + 1);
        let mut acc: u64 = 0;
        for b in 0..nblocks {
            ranks.push(acc);
            let beg = b * RANK_BLOCK_BITS / 64;
            let end = ((b + 1) * RANK_BLOCK_BITS / 64).min(nwords);
            for w in &words[beg..end] {
                acc += w.count_ones() as u64;
            }
        }
        // the last word may hold bits past len; they are zero by invariant
        ranks.push(acc);
        self.ones = acc as usize;
        self.ranks = ranks;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mem_size(&self) -> usize {
        words_for(self.len) * 8 + self.ranks.len() * 8
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, m) = word_of(i);
        self.words.slice(words_for(self.len))[w] & m != 0
    }

    /// Count of set bits in `[0, i)`.
    pub fn rank1(&self, i: usize) -> usize {
        debug_assert!(i <= self.len);
        let words = self.words.slice(words_for(self.len));
        let block = i / RANK_BLOCK_BITS;
        let mut n = self.ranks[block] as usize;
        let mut bit = block * RANK_BLOCK_BITS;
        while bit + 64 <= i {
            n += words[bit / 64].count_ones() as usize;
            bit += 64;
        }
        if bit < i {
            n += (words[bit / 64] & ((1u64 << (i - bit)) - 1)).count_ones() as usize;
        }
        n
    }

    /// Count of unset bits in `[0, i)`.
    pub fn rank0(&self, i: usize) -> usize {
        i - self.rank1(i)
    }

    pub fn max_rank1(&self) -> usize {
        self.ones
    }

    pub fn max_rank0(&self) -> usize {
        self.len - self.ones
    }

    /// Position of the k-th (0-based) unset bit.
    pub fn select0(&self, k: usize) -> Result<usize> {
        if k >= self.max_rank0() {
            return Err(EngineError::OutOfRange {
                id: k as u64,
                rows: self.max_rank0() as u64,
            });
        }
        let nblocks = self.ranks.len() - 1;
        // zeros before block b: b*512 - ranks[b]
        let mut lo = 0usize;
        let mut hi = nblocks;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let zeros = mid * RANK_BLOCK_BITS - self.ranks[mid] as usize;
            if zeros <= k {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let words = self.words.slice(words_for(self.len));
        let mut remaining = k - (lo * RANK_BLOCK_BITS - self.ranks[lo] as usize);
        let mut bit = lo * RANK_BLOCK_BITS;
        loop {
            let w = !words[bit / 64];
            let zeros_in_word = w.count_ones() as usize;
            if remaining < zeros_in_word {
                // select within the word
                let mut w = w;
                for _ in 0..remaining {
                    w &= w - 1; // clear lowest set bit
                }
                let pos = bit + w.trailing_zeros() as usize;
                debug_assert!(pos < self.len);
                return Ok(pos);
            }
            remaining -= zeros_in_word;
            bit += 64;
        }
    }

    // ------------------------------------------------------------------
    // Persistence: <u64 bit count><packed words>
    // ------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        let nwords = words_for(self.len);
        let words = self.words.slice(nwords);
        let mut f = File::create(path)?;
        f.write_all(&(self.len as u64).to_le_bytes())?;
        for w in words {
            f.write_all(&w.to_le_bytes())?;
        }
        f.sync_all()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path)?;
        let map = unsafe { MmapOptions::new().map(&f)? };
        if map.len() < 8 {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: truncated rank-select file", path.display()),
            )));
        }
        let len = u64::from_le_bytes(map[0..8].try_into().unwrap()) as usize;
        if map.len() < 8 + words_for(len) * 8 {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: rank-select words truncated", path.display()),
            )));
        }
        let mut rs = Self {
            words: RsWords::Map(map),
            len,
            ranks: Vec::new(),
            ones: 0,
        };
        rs.build_cache();
        Ok(rs)
    }

}

// ============================================================================
// DelMap — mmap-backed IsDel
// ============================================================================

pub const ISDEL_FILE: &str = "IsDel";

/// Writable mmap over the `IsDel` file of a segment directory.
pub struct DelMap {
    file: File,
    mmap: Option<MmapMut>,
    path: PathBuf,
    len: usize,
}

impl DelMap {
    fn map_file(file: &File) -> Result<MmapMut> {
        Ok(unsafe { MmapOptions::new().map_mut(file)? })
    }

    /// Create a fresh one-chunk IsDel file.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(ISDEL_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((CHUNK_BITS / 8) as u64)?;
        let mmap = Self::map_file(&file)?;
        let mut dm = Self {
            file,
            mmap: Some(mmap),
            path,
            len: 0,
        };
        dm.write_header();
        Ok(dm)
    }

    /// Open an existing IsDel file as a writable mapping.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ISDEL_FILE);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let bytes = file.metadata()?.len() as usize;
        if bytes < 8 {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: missing IsDel header", path.display()),
            )));
        }
        let mmap = Self::map_file(&file)?;
        let len = u64::from_le_bytes(mmap[0..8].try_into().unwrap()) as usize;
        if len > bytes * 8 - HEADER_BITS {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "{}: IsDel header claims {} rows, capacity {}",
                    path.display(),
                    len,
                    bytes * 8 - HEADER_BITS
                ),
            )));
        }
        Ok(Self {
            file,
            mmap: Some(mmap),
            path,
            len,
        })
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(ISDEL_FILE).exists()
    }

    fn mmap(&self) -> &MmapMut {
        self.mmap.as_ref().expect("IsDel map present")
    }

    fn words(&self) -> &[u64] {
        let m = self.mmap();
        let bytes = &m[8..];
        debug_assert_eq!(bytes.as_ptr() as usize % 8, 0);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u64, bytes.len() / 8) }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        let m = self.mmap.as_mut().expect("IsDel map present");
        let bytes = &mut m[8..];
        debug_assert_eq!(bytes.as_ptr() as usize % 8, 0);
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut u64, bytes.len() / 8) }
    }

    fn write_header(&mut self) {
        let len = self.len as u64;
        let m = self.mmap.as_mut().expect("IsDel map present");
        m[0..8].copy_from_slice(&len.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in bits (excluding the header word).
    pub fn capacity(&self) -> usize {
        self.mmap().len() * 8 - HEADER_BITS
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, m) = word_of(i);
        self.words()[w] & m != 0
    }

    /// Returns true when the bit was newly set.
    #[inline]
    pub fn set1(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, m) = word_of(i);
        let words = self.words_mut();
        let old = words[w];
        words[w] = old | m;
        old & m == 0
    }

    pub fn push(&mut self, v: bool) -> Result<()> {
        if self.len == self.capacity() {
            self.grow()?;
        }
        let i = self.len;
        let (w, m) = word_of(i);
        let words = self.words_mut();
        if v {
            words[w] |= m;
        } else {
            words[w] &= !m;
        }
        self.len += 1;
        self.write_header();
        Ok(())
    }

    pub fn pop(&mut self) {
        debug_assert!(self.len >= 1);
        self.len -= 1;
        let i = self.len;
        let (w, m) = word_of(i);
        self.words_mut()[w] &= !m;
        self.write_header();
    }

    fn grow(&mut self) -> Result<()> {
        let new_file_bits =
            (HEADER_BITS + self.len + 2 * CHUNK_BITS - 1) & !(CHUNK_BITS - 1);
        if let Some(m) = self.mmap.take() {
            m.flush()?;
            drop(m);
        }
        self.file.set_len((new_file_bits / 8) as u64)?;
        self.mmap = Some(Self::map_file(&self.file)?);
        Ok(())
    }

    pub fn popcnt(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        popcnt_words(self.words(), self.len)
    }

    pub fn snapshot(&self) -> BitVec {
        BitVec::from_words(self.words()[..words_for(self.len)].to_vec(), self.len)
    }

    /// Overwrite from a bitmap of equal length (replay bulk path).
    pub fn copy_from(&mut self, bits: &BitVec) {
        assert_eq!(self.len, bits.len());
        let n = words_for(self.len);
        self.words_mut()[..n].copy_from_slice(&bits.words()[..n]);
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap().flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DelMap {
    fn drop(&mut self) {
        if let Some(m) = &self.mmap {
            let _ = m.flush();
        }
    }
}

/// Write a heap bitmap as an `IsDel` file: header word, packed bits,
/// zero padding up to a chunk boundary. Goes through `<path>.tmp` +
/// rename.
pub fn write_del_file(dir: &Path, bits: &BitVec) -> Result<()> {
    let path = dir.join(ISDEL_FILE);
    let tmp = dir.join(format!("{}.tmp", ISDEL_FILE));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&(bits.len() as u64).to_le_bytes())?;
        let nwords = words_for(bits.len());
        for w in &bits.words()[..nwords] {
            f.write_all(&w.to_le_bytes())?;
        }
        let written = 8 + nwords * 8;
        let file_bytes = ((HEADER_BITS + bits.len() + CHUNK_BITS - 1) & !(CHUNK_BITS - 1)) / 8;
        if file_bytes > written {
            f.set_len(file_bytes as u64)?;
        }
        f.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bitvec_basics() {
        let mut bv = BitVec::new();
        for i in 0..200 {
            bv.push(i % 3 == 0);
        }
        assert_eq!(bv.len(), 200);
        assert_eq!(bv.popcnt(), (0..200).filter(|i| i % 3 == 0).count());
        assert!(bv.get(0));
        assert!(!bv.get(1));
        assert!(bv.set1(1));
        assert!(!bv.set1(1)); // already set
        bv.set_range1(50, 130);
        for i in 50..130 {
            assert!(bv.get(i));
        }
    }

    #[test]
    fn test_rank_select_roundtrip() {
        let mut bv = BitVec::new();
        for i in 0..3000 {
            bv.push(i % 7 == 0 || i % 11 == 0);
        }
        let rs = RankSelect::build(&bv);
        assert_eq!(rs.max_rank1(), bv.popcnt());
        assert_eq!(rs.max_rank0(), bv.len() - bv.popcnt());
        let mut zeros_seen = 0;
        for i in 0..bv.len() {
            assert_eq!(rs.rank0(i), i - rs.rank1(i));
            if !bv.get(i) {
                assert_eq!(rs.select0(zeros_seen).unwrap(), i);
                zeros_seen += 1;
            }
        }
        assert!(rs.select0(rs.max_rank0()).is_err());
    }

    #[test]
    fn test_rank_select_save_load() {
        let dir = tempdir().unwrap();
        let mut bv = BitVec::new();
        for i in 0..1500 {
            bv.push(i % 5 == 0);
        }
        let rs = RankSelect::build(&bv);
        let path = dir.path().join("IsPurged.rs");
        rs.save(&path).unwrap();
        let rs2 = RankSelect::load(&path).unwrap();
        assert_eq!(rs2.len(), rs.len());
        assert_eq!(rs2.max_rank1(), rs.max_rank1());
        for k in 0..rs.max_rank0() {
            assert_eq!(rs.select0(k).unwrap(), rs2.select0(k).unwrap());
        }
    }

    #[test]
    fn test_delmap_push_grow_reload() {
        let dir = tempdir().unwrap();
        let n = CHUNK_BITS + 1000; // force at least one growth
        {
            let mut dm = DelMap::create(dir.path()).unwrap();
            for i in 0..n {
                dm.push(i % 2 == 0).unwrap();
            }
            assert_eq!(dm.len(), n);
            assert_eq!(dm.popcnt(), n / 2 + n % 2);
            dm.flush().unwrap();
        }
        let dm = DelMap::load(dir.path()).unwrap();
        assert_eq!(dm.len(), n);
        assert!(dm.get(0));
        assert!(!dm.get(1));
        assert_eq!(dm.popcnt(), n / 2 + n % 2);
    }

    #[test]
    fn test_delmap_pop_keeps_tail_zero() {
        let dir = tempdir().unwrap();
        let mut dm = DelMap::create(dir.path()).unwrap();
        dm.push(true).unwrap();
        dm.push(true).unwrap();
        dm.pop();
        dm.push(false).unwrap();
        assert!(!dm.get(1));
        assert_eq!(dm.popcnt(), 1);
    }

    #[test]
    fn test_write_del_file_and_header() {
        let dir = tempdir().unwrap();
        let mut bv = BitVec::new();
        for i in 0..100 {
            bv.push(i % 4 == 0);
        }
        write_del_file(dir.path(), &bv).unwrap();
        let dm = DelMap::load(dir.path()).unwrap();
        assert_eq!(dm.len(), 100);
        assert_eq!(dm.popcnt(), bv.popcnt());
        // file is chunk padded
        let bytes = std::fs::metadata(dir.path().join(ISDEL_FILE)).unwrap().len();
        assert_eq!(bytes as usize % (CHUNK_BITS / 8), 0);
    }
}
