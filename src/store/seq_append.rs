//! Sequential append-only store
//!
//! Forward-only record stream used for the converter's per-colgroup
//! temp files and for linear-scan rebuilds during purge. Records are
//! `u32` length prefixed. Cursors are only valid after
//! `complete_write` closed the writer.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{ReadableStore, StoreCursor};
use crate::{EngineError, Result};

pub const SEQ_SUFFIX: &str = "seq";

pub struct SeqReadAppendonlyStore {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    rows: AtomicU64,
    payload: AtomicU64,
}

impl SeqReadAppendonlyStore {
    /// Create a fresh stream at `<dir>/<base>.seq`.
    pub fn create(dir: &Path, base: &str) -> Result<Self> {
        let path = dir.join(format!("{}.{}", base, SEQ_SUFFIX));
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::with_capacity(256 * 1024, file))),
            rows: AtomicU64::new(0),
            payload: AtomicU64::new(0),
        })
    }

    /// Open an existing completed stream, scanning it to count rows.
    pub fn open(path: &Path) -> Result<Self> {
        let mut rows = 0u64;
        let mut payload = 0u64;
        let mut r = BufReader::new(File::open(path)?);
        let mut len_buf = [0u8; 4];
        loop {
            match read_len(&mut r, &mut len_buf)? {
                None => break,
                Some(len) => {
                    std::io::copy(&mut r.by_ref().take(len as u64), &mut std::io::sink())?;
                    rows += 1;
                    payload += len as u64;
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(None),
            rows: AtomicU64::new(rows),
            payload: AtomicU64::new(payload),
        })
    }

    pub fn append(&self, rec: &[u8]) -> Result<u64> {
        let mut guard = self.writer.lock();
        let w = guard
            .as_mut()
            .ok_or_else(|| EngineError::logic("append on a completed sequential store"))?;
        w.write_all(&(rec.len() as u32).to_le_bytes())?;
        w.write_all(rec)?;
        self.payload.fetch_add(rec.len() as u64, Ordering::Relaxed);
        Ok(self.rows.fetch_add(1, Ordering::Relaxed))
    }

    /// Flush and close the writer; the stream becomes readable.
    pub fn complete_write(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        if let Some(mut w) = guard.take() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn delete_files(&self) -> Result<()> {
        self.complete_write()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_len(r: &mut impl Read, buf: &mut [u8; 4]) -> Result<Option<u32>> {
    let mut read = 0;
    while read < 4 {
        let n = r.read(&mut buf[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "torn record length in sequential store",
            )));
        }
        read += n;
    }
    Ok(Some(u32::from_le_bytes(*buf)))
}

impl ReadableStore for SeqReadAppendonlyStore {
    fn num_data_rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    fn data_inflate_size(&self) -> u64 {
        self.payload.load(Ordering::Relaxed)
    }

    fn data_storage_size(&self) -> u64 {
        self.payload.load(Ordering::Relaxed) + 4 * self.rows.load(Ordering::Relaxed)
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        // no random access; a cursor must be used
        let mut c = self.cursor();
        if c.seek_exact(id, out)? {
            Ok(())
        } else {
            Err(EngineError::OutOfRange {
                id,
                rows: self.num_data_rows(),
            })
        }
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(SeqCursor {
            store: self,
            reader: None,
            next_id: 0,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        self.complete_write()?;
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            SEQ_SUFFIX
        );
        let target = base.with_file_name(&fname);
        if target != self.path {
            std::fs::copy(&self.path, &target)?;
        }
        Ok(fname)
    }
}

struct SeqCursor<'a> {
    store: &'a SeqReadAppendonlyStore,
    reader: Option<BufReader<File>>,
    next_id: u64,
}

impl SeqCursor<'_> {
    fn ensure_reader(&mut self) -> Result<&mut BufReader<File>> {
        if self.reader.is_none() {
            self.reader = Some(BufReader::new(File::open(&self.store.path)?));
        }
        Ok(self.reader.as_mut().unwrap())
    }
}

impl StoreCursor for SeqCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        let r = self.ensure_reader()?;
        let mut len_buf = [0u8; 4];
        match read_len(r, &mut len_buf)? {
            None => Ok(None),
            Some(len) => {
                let start = out.len();
                out.resize(start + len as usize, 0);
                r.read_exact(&mut out[start..])?;
                let id = self.next_id;
                self.next_id += 1;
                Ok(Some(id))
            }
        }
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        if id < self.next_id {
            self.reset();
        }
        let mut skip = Vec::new();
        while self.next_id < id {
            skip.clear();
            if self.next(&mut skip)?.is_none() {
                return Ok(false);
            }
        }
        Ok(self.next(out)?.is_some())
    }

    fn reset(&mut self) {
        self.reader = None;
        self.next_id = 0;
    }
}
