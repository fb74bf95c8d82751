//! Compressed blob stores
//!
//! One backend, three codecs, replacing a dynamic-cast chain with a
//! tagged variant:
//!
//! - `Trie`: records grouped into blocks, each block zstd-compressed;
//!   the block granularity comes from the schema's rank-select class
//!   (256 or 512 records, invalid values warn and use 512).
//! - `FastZip`: every record zstd-compressed on its own, no dictionary.
//! - `DictZip`: like `FastZip` but with a dictionary trained from
//!   sampled records, persisted in a `-dict` sidecar.
//!
//! The dict-zip build is the memory-heavy phase of a conversion, so a
//! process-wide mutex serializes it across threads; the contract is
//! bounded peak memory, not correctness. Sampling uses a deterministic
//! per-segment seed so rebuilds are reproducible; the sample set only
//! affects compression ratio.
//!
//! File layout: magic, u64 header length, bincode header, payload.

use std::io::Write;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{ReadableStore, RecVec, StoreCursor};
use crate::bits::{BitVec, RankSelect};
use crate::schema::Schema;
use crate::{EngineError, Result};

pub const BLOB_SUFFIX: &str = "nlt";
pub const DICT_SIDECAR_SUFFIX: &str = "-dict";
const MAGIC: &[u8; 8] = b"STRABLOB";
const ZSTD_LEVEL: i32 = 3;
const MAX_DICT_BYTES: usize = 64 * 1024;
const DEFAULT_SAMPLE_RATIO: f64 = 0.05;

/// Serializes the memory-heavy phase of dict-zip builds across the
/// whole process.
static REDUCE_MEM_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobCodec {
    Trie { block: u32 },
    FastZip,
    DictZip,
}

impl BlobCodec {
    fn tag(&self) -> u8 {
        match self {
            BlobCodec::Trie { .. } => 0,
            BlobCodec::FastZip => 1,
            BlobCodec::DictZip => 2,
        }
    }

    fn from_tag(tag: u8, block: u32) -> Result<Self> {
        match tag {
            0 => Ok(BlobCodec::Trie { block }),
            1 => Ok(BlobCodec::FastZip),
            2 => Ok(BlobCodec::DictZip),
            _ => Err(EngineError::invalid(format!("unknown blob codec {}", tag))),
        }
    }
}

/// Map a schema's rank-select class onto a block granularity.
pub fn block_of_rank_select_class(schema: &Schema) -> u32 {
    match schema.rank_select_class {
        -256 | 256 => 256,
        512 => 512,
        other => {
            log::warn!(
                "group {}: invalid rank-select class {}, using 512",
                schema.name,
                other
            );
            512
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    codec: u8,
    block: u32,
    rows: u64,
    inflate: u64,
    max_rec_len: u64,
    /// Trie codec: length of every record
    rec_lens: Vec<u32>,
    /// Trie: compressed block offsets; zip codecs: per-record offsets
    offsets: Vec<u64>,
    dict_len: u64,
}

enum Payload {
    Heap(Vec<u8>),
    Map { mmap: Mmap, off: usize },
}

impl Payload {
    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Heap(v) => v,
            Payload::Map { mmap, off } => &mmap[*off..],
        }
    }
}

pub struct BlobStore {
    codec: BlobCodec,
    rows: u64,
    inflate: u64,
    max_rec_len: usize,
    rec_lens: Vec<u32>,
    offsets: Vec<u64>,
    payload: Payload,
    dict: Vec<u8>,
    /// Last decompressed trie block, point-read cache
    block_cache: Mutex<Option<(u64, Vec<u8>)>>,
}

impl BlobStore {
    pub fn codec(&self) -> BlobCodec {
        self.codec
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn record_span(&self, id: u64) -> (usize, usize) {
        let beg = self.offsets[id as usize] as usize;
        let end = self.offsets[id as usize + 1] as usize;
        (beg, end)
    }

    fn trie_block_bounds(&self, block_id: u64, block: u32) -> (u64, u64) {
        let beg = block_id * block as u64;
        let end = (beg + block as u64).min(self.rows);
        (beg, end)
    }

    fn read_trie(&self, id: u64, block: u32, out: &mut Vec<u8>) -> Result<()> {
        let block_id = id / block as u64;
        let mut cache = self.block_cache.lock();
        let hit = matches!(&*cache, Some((b, _)) if *b == block_id);
        if !hit {
            let (rec_beg, rec_end) = self.trie_block_bounds(block_id, block);
            let raw_len: usize = self.rec_lens[rec_beg as usize..rec_end as usize]
                .iter()
                .map(|&l| l as usize)
                .sum();
            let cbeg = self.offsets[block_id as usize] as usize;
            let cend = self.offsets[block_id as usize + 1] as usize;
            let raw = zstd::bulk::decompress(&self.payload.bytes()[cbeg..cend], raw_len)
                .map_err(EngineError::Io)?;
            if raw.len() != raw_len {
                return Err(EngineError::logic(format!(
                    "blob block {} inflated to {} bytes, expected {}",
                    block_id,
                    raw.len(),
                    raw_len
                )));
            }
            *cache = Some((block_id, raw));
        }
        let (_, raw) = cache.as_ref().unwrap();
        let (rec_beg, _) = self.trie_block_bounds(block_id, block);
        let mut pos = 0usize;
        for i in rec_beg..id {
            pos += self.rec_lens[i as usize] as usize;
        }
        let len = self.rec_lens[id as usize] as usize;
        out.extend_from_slice(&raw[pos..pos + len]);
        Ok(())
    }

    fn read_zip(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        let (beg, end) = self.record_span(id);
        let src = &self.payload.bytes()[beg..end];
        let raw = if self.dict.is_empty() {
            zstd::bulk::decompress(src, self.max_rec_len).map_err(EngineError::Io)?
        } else {
            let mut d = zstd::bulk::Decompressor::with_dictionary(&self.dict)
                .map_err(EngineError::Io)?;
            d.decompress(src, self.max_rec_len).map_err(EngineError::Io)?
        };
        out.extend_from_slice(&raw);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        if mmap.len() < 16 || &mmap[..8] != MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad blob store header", path.display()),
            )));
        }
        let header_len = u64::from_le_bytes(mmap[8..16].try_into().unwrap()) as usize;
        if mmap.len() < 16 + header_len {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: blob header truncated", path.display()),
            )));
        }
        let header: Header = bincode::deserialize(&mmap[16..16 + header_len]).map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let codec = BlobCodec::from_tag(header.codec, header.block)?;
        let dict = if codec == BlobCodec::DictZip {
            let side = sidecar_path(path);
            let dict = std::fs::read(&side)?;
            if dict.len() as u64 != header.dict_len {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}: dictionary sidecar size mismatch", side.display()),
                )));
            }
            dict
        } else {
            Vec::new()
        };
        Ok(Self {
            codec,
            rows: header.rows,
            inflate: header.inflate,
            max_rec_len: header.max_rec_len as usize,
            rec_lens: header.rec_lens,
            offsets: header.offsets,
            payload: Payload::Map { mmap, off: 16 + header_len },
            dict,
            block_cache: Mutex::new(None),
        })
    }
}

fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let fname = format!(
        "{}{}",
        path.file_name().unwrap().to_string_lossy(),
        DICT_SIDECAR_SUFFIX
    );
    path.with_file_name(fname)
}

impl ReadableStore for BlobStore {
    fn num_data_rows(&self) -> u64 {
        self.rows
    }

    fn data_inflate_size(&self) -> u64 {
        self.inflate
    }

    fn data_storage_size(&self) -> u64 {
        self.payload.bytes().len() as u64 + self.dict.len() as u64
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        if id >= self.rows {
            return Err(EngineError::OutOfRange {
                id,
                rows: self.rows,
            });
        }
        match self.codec {
            BlobCodec::Trie { block } => self.read_trie(id, block, out),
            BlobCodec::FastZip | BlobCodec::DictZip => self.read_zip(id, out),
        }
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(BlobCursor {
            store: self,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            BLOB_SUFFIX
        );
        let path = base.with_file_name(&fname);
        let header = Header {
            codec: self.codec.tag(),
            block: match self.codec {
                BlobCodec::Trie { block } => block,
                _ => 0,
            },
            rows: self.rows,
            inflate: self.inflate,
            max_rec_len: self.max_rec_len as u64,
            rec_lens: self.rec_lens.clone(),
            offsets: self.offsets.clone(),
            dict_len: self.dict.len() as u64,
        };
        let body = bincode::serialize(&header).map_err(|e| {
            EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let mut f = std::fs::File::create(&path)?;
        f.write_all(MAGIC)?;
        f.write_all(&(body.len() as u64).to_le_bytes())?;
        f.write_all(&body)?;
        f.write_all(self.payload.bytes())?;
        f.sync_all()?;
        if self.codec == BlobCodec::DictZip {
            let mut df = std::fs::File::create(sidecar_path(&path))?;
            df.write_all(&self.dict)?;
            df.sync_all()?;
        }
        Ok(fname)
    }
}

struct BlobCursor<'a> {
    store: &'a BlobStore,
    next_id: u64,
}

impl StoreCursor for BlobCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if self.next_id >= self.store.rows {
            return Ok(None);
        }
        let id = self.next_id;
        self.store.get_value_append(id, out)?;
        self.next_id += 1;
        Ok(Some(id))
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id >= self.store.rows {
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

// ============================================================================
// Builder
// ============================================================================

pub struct BlobBuilder {
    codec: BlobCodec,
    dict: Vec<u8>,
    payload: Vec<u8>,
    offsets: Vec<u64>,
    rec_lens: Vec<u32>,
    cur_block: Vec<u8>,
    cur_block_recs: u32,
    rows: u64,
    inflate: u64,
    max_rec_len: usize,
}

impl BlobBuilder {
    pub fn new(codec: BlobCodec) -> Self {
        Self {
            codec,
            dict: Vec::new(),
            payload: Vec::new(),
            offsets: vec![0],
            rec_lens: Vec::new(),
            cur_block: Vec::new(),
            cur_block_recs: 0,
            rows: 0,
            inflate: 0,
            max_rec_len: 0,
        }
    }

    pub fn with_dictionary(dict: Vec<u8>) -> Self {
        let mut b = Self::new(BlobCodec::DictZip);
        b.dict = dict;
        b
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.cur_block_recs == 0 {
            return Ok(());
        }
        let compressed =
            zstd::bulk::compress(&self.cur_block, ZSTD_LEVEL).map_err(EngineError::Io)?;
        self.payload.extend_from_slice(&compressed);
        self.offsets.push(self.payload.len() as u64);
        self.cur_block.clear();
        self.cur_block_recs = 0;
        Ok(())
    }

    pub fn add_record(&mut self, rec: &[u8]) -> Result<()> {
        self.rows += 1;
        self.inflate += rec.len() as u64;
        self.max_rec_len = self.max_rec_len.max(rec.len());
        match self.codec {
            BlobCodec::Trie { block } => {
                self.rec_lens.push(rec.len() as u32);
                self.cur_block.extend_from_slice(rec);
                self.cur_block_recs += 1;
                if self.cur_block_recs == block {
                    self.flush_block()?;
                }
            }
            BlobCodec::FastZip => {
                let compressed =
                    zstd::bulk::compress(rec, ZSTD_LEVEL).map_err(EngineError::Io)?;
                self.payload.extend_from_slice(&compressed);
                self.offsets.push(self.payload.len() as u64);
            }
            BlobCodec::DictZip => {
                let compressed = if self.dict.is_empty() {
                    zstd::bulk::compress(rec, ZSTD_LEVEL).map_err(EngineError::Io)?
                } else {
                    let mut c =
                        zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, &self.dict)
                            .map_err(EngineError::Io)?;
                    c.compress(rec).map_err(EngineError::Io)?
                };
                self.payload.extend_from_slice(&compressed);
                self.offsets.push(self.payload.len() as u64);
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<BlobStore> {
        if let BlobCodec::Trie { .. } = self.codec {
            self.flush_block()?;
        }
        Ok(BlobStore {
            codec: self.codec,
            rows: self.rows,
            inflate: self.inflate,
            max_rec_len: self.max_rec_len,
            rec_lens: self.rec_lens,
            offsets: self.offsets,
            payload: Payload::Heap(self.payload),
            dict: self.dict,
            block_cache: Mutex::new(None),
        })
    }
}

/// Build the block-compressed variant from collected records.
pub fn build_trie_store(schema: &Schema, recs: &RecVec) -> Result<BlobStore> {
    let block = block_of_rank_select_class(schema);
    let mut b = BlobBuilder::new(BlobCodec::Trie { block });
    for i in 0..recs.len() {
        b.add_record(recs.get(i))?;
    }
    b.finish()
}

// ============================================================================
// Dict-zip two-pass build
// ============================================================================

/// Train a dictionary from sampled records, then compress every live
/// record with it. The cursor yields physical ids; with a purge bitmap
/// the physical order is walked strictly in logical order, stepping
/// only on non-purged rows.
///
/// `seed` makes sampling deterministic per segment.
pub fn build_dict_zip_store(
    schema: &Schema,
    cursor: &mut dyn StoreCursor,
    src_inflate: u64,
    is_del: Option<&BitVec>,
    is_purged: Option<&RankSelect>,
    seed: u64,
) -> Result<BlobStore> {
    let mut ratio = if schema.dict_zip_sample_ratio > f32::EPSILON {
        schema.dict_zip_sample_ratio as f64
    } else {
        DEFAULT_SAMPLE_RATIO
    };
    // keep the sample pool below what the trainer can address
    let limit = 0.95 * (i32::MAX as f64);
    if src_inflate as f64 * ratio >= limit {
        ratio = limit / src_inflate as f64;
    }
    let mut rng = StdRng::seed_from_u64(seed);

    let mut sample_pool = Vec::new();
    let mut sample_sizes = Vec::new();
    let mut last_rec = Vec::new();
    let mut rec = Vec::new();

    // pass 1: sampling
    match is_purged {
        None => {
            loop {
                rec.clear();
                let id = match cursor.next(&mut rec)? {
                    None => break,
                    Some(id) => id,
                };
                if is_del.map_or(false, |d| d.get(id as usize)) {
                    continue;
                }
                last_rec.clear();
                last_rec.extend_from_slice(&rec);
                if rng.gen::<f64>() < ratio {
                    sample_pool.extend_from_slice(&rec);
                    sample_sizes.push(rec.len());
                }
            }
        }
        Some(purged) => {
            let is_del = is_del.ok_or_else(|| {
                EngineError::invalid("purged dict-zip build needs a deletion bitmap")
            })?;
            let mut physic_id = 0u64;
            for logic_id in 0..purged.len() {
                if purged.get(logic_id) {
                    continue;
                }
                if !is_del.get(logic_id) {
                    rec.clear();
                    if !cursor.seek_exact(physic_id, &mut rec)? {
                        return Err(EngineError::logic(format!(
                            "blob source ended at physical id {}",
                            physic_id
                        )));
                    }
                    last_rec.clear();
                    last_rec.extend_from_slice(&rec);
                    if rng.gen::<f64>() < ratio {
                        sample_pool.extend_from_slice(&rec);
                        sample_sizes.push(rec.len());
                    }
                }
                physic_id += 1;
            }
        }
    }
    if sample_sizes.is_empty() {
        // guarantee non-empty training input
        let fallback: &[u8] = if last_rec.is_empty() {
            b"Hello World!"
        } else {
            &last_rec
        };
        sample_pool.extend_from_slice(fallback);
        sample_sizes.push(fallback.len());
    }

    // heavy phase: dictionary training and compression
    let _guard = REDUCE_MEM_MUTEX.lock();
    let dict = match zstd::dict::from_continuous(&sample_pool, &sample_sizes, MAX_DICT_BYTES) {
        Ok(d) => d,
        Err(e) => {
            log::warn!(
                "group {}: dictionary training failed ({}), using raw sample bytes",
                schema.name,
                e
            );
            let mut d = sample_pool.clone();
            d.truncate(4096);
            d
        }
    };
    let mut builder = BlobBuilder::with_dictionary(dict);

    // pass 2: same order as pass 1
    cursor.reset();
    match is_purged {
        None => loop {
            rec.clear();
            let id = match cursor.next(&mut rec)? {
                None => break,
                Some(id) => id,
            };
            if is_del.map_or(false, |d| d.get(id as usize)) {
                continue;
            }
            builder.add_record(&rec)?;
        },
        Some(purged) => {
            let is_del = is_del.unwrap();
            let mut physic_id = 0u64;
            for logic_id in 0..purged.len() {
                if purged.get(logic_id) {
                    continue;
                }
                rec.clear();
                if cursor.next(&mut rec)?.is_none() {
                    return Err(EngineError::logic(format!(
                        "blob source ended at physical id {}",
                        physic_id
                    )));
                }
                if !is_del.get(logic_id) {
                    builder.add_record(&rec)?;
                }
                physic_id += 1;
            }
        }
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType};
    use tempfile::tempdir;

    fn var_schema(name: &str) -> Schema {
        Schema::new(
            name,
            vec![ColumnMeta {
                name: name.into(),
                ctype: ColumnType::Utf8,
            }],
            vec![0],
        )
    }

    fn sample_recs(n: usize) -> RecVec {
        let mut rv = RecVec::new_var();
        for i in 0..n {
            rv.push(format!("record payload number {:06} with shared prefix", i).as_bytes());
        }
        rv
    }

    #[test]
    fn test_trie_store_roundtrip() {
        let schema = var_schema("notes");
        let recs = sample_recs(1000);
        let store = build_trie_store(&schema, &recs).unwrap();
        assert_eq!(store.num_data_rows(), 1000);
        assert!(store.data_storage_size() < store.data_inflate_size());
        let mut out = Vec::new();
        for i in [0usize, 255, 256, 511, 512, 999] {
            out.clear();
            store.get_value_append(i as u64, &mut out).unwrap();
            assert_eq!(out, recs.get(i));
        }
    }

    #[test]
    fn test_invalid_rank_select_class_falls_back() {
        let mut schema = var_schema("notes");
        schema.rank_select_class = 777;
        assert_eq!(block_of_rank_select_class(&schema), 512);
        schema.rank_select_class = -256;
        assert_eq!(block_of_rank_select_class(&schema), 256);
    }

    #[test]
    fn test_save_load_with_dict_sidecar() {
        let dir = tempdir().unwrap();
        let schema = var_schema("body");
        let recs = sample_recs(300);
        let mut cursor = RecVecCursor { recs: &recs, next_id: 0 };
        let store =
            build_dict_zip_store(&schema, &mut cursor, 300 * 48, None, None, 42).unwrap();
        assert_eq!(store.codec(), BlobCodec::DictZip);
        let base = dir.path().join("colgroup-body");
        let fname = store.save(&base).unwrap();
        assert_eq!(fname, "colgroup-body.nlt");
        assert!(dir.path().join("colgroup-body.nlt-dict").exists());

        let loaded = BlobStore::load(&dir.path().join(&fname)).unwrap();
        assert_eq!(loaded.num_data_rows(), 300);
        let mut out = Vec::new();
        loaded.get_value(123, &mut out).unwrap();
        assert_eq!(out, recs.get(123));
    }

    #[test]
    fn test_dict_zip_skips_deleted() {
        let schema = var_schema("body");
        let recs = sample_recs(50);
        let mut del = BitVec::with_len(50, false);
        del.set1(0);
        del.set1(49);
        let mut cursor = RecVecCursor { recs: &recs, next_id: 0 };
        let store =
            build_dict_zip_store(&schema, &mut cursor, 50 * 48, Some(&del), None, 7).unwrap();
        assert_eq!(store.num_data_rows(), 48);
        let mut out = Vec::new();
        store.get_value(0, &mut out).unwrap();
        assert_eq!(out, recs.get(1)); // physical 0 is the first live row
    }

    #[test]
    fn test_empty_source_still_builds() {
        let schema = var_schema("body");
        let recs = RecVec::new_var();
        let mut cursor = RecVecCursor { recs: &recs, next_id: 0 };
        let store = build_dict_zip_store(&schema, &mut cursor, 0, None, None, 1).unwrap();
        assert_eq!(store.num_data_rows(), 0);
        assert!(store.get_value(0, &mut Vec::new()).is_err());
    }

    struct RecVecCursor<'a> {
        recs: &'a RecVec,
        next_id: u64,
    }

    impl StoreCursor for RecVecCursor<'_> {
        fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
            if self.next_id >= self.recs.len() as u64 {
                return Ok(None);
            }
            let id = self.next_id;
            out.extend_from_slice(self.recs.get(id as usize));
            self.next_id += 1;
            Ok(Some(id))
        }

        fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
            if id >= self.recs.len() as u64 {
                return Ok(false);
            }
            out.extend_from_slice(self.recs.get(id as usize));
            self.next_id = id + 1;
            Ok(true)
        }

        fn reset(&mut self) {
            self.next_id = 0;
        }
    }
}
