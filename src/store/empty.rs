//! Empty store / index
//!
//! Stands in for the stores of an all-deleted segment: zero rows,
//! every lookup misses, saved as a bare `.empty` marker file.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use super::{ReadableStore, StoreCursor};
use crate::index::{IndexCursor, ReadableIndex, SeekResult};
use crate::{EngineError, Result};

pub const EMPTY_SUFFIX: &str = "empty";
const MAGIC: &[u8; 8] = b"STRAEMPT";

#[derive(Default)]
pub struct EmptyStore;

impl EmptyStore {
    pub fn new() -> Self {
        Self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 8 || &bytes[..8] != MAGIC {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad empty store marker", path.display()),
            )));
        }
        Ok(Self)
    }

    fn write_marker(base: &Path) -> Result<String> {
        let fname = format!(
            "{}.{}",
            base.file_name().unwrap().to_string_lossy(),
            EMPTY_SUFFIX
        );
        let mut f = std::fs::File::create(base.with_file_name(&fname))?;
        f.write_all(MAGIC)?;
        f.sync_all()?;
        Ok(fname)
    }
}

impl ReadableStore for EmptyStore {
    fn num_data_rows(&self) -> u64 {
        0
    }

    fn data_inflate_size(&self) -> u64 {
        0
    }

    fn data_storage_size(&self) -> u64 {
        0
    }

    fn get_value_append(&self, id: u64, _out: &mut Vec<u8>) -> Result<()> {
        Err(EngineError::OutOfRange { id, rows: 0 })
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(EmptyCursor)
    }

    fn save(&self, base: &Path) -> Result<String> {
        Self::write_marker(base)
    }
}

impl ReadableIndex for EmptyStore {
    fn num_index_rows(&self) -> u64 {
        0
    }

    fn index_storage_size(&self) -> u64 {
        0
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn search_exact_append(&self, _key: &[u8], _out: &mut Vec<u64>) -> Result<()> {
        Ok(())
    }

    fn cursor(&self) -> Box<dyn IndexCursor + '_> {
        Box::new(EmptyCursor)
    }

    fn readable_store(self: Arc<Self>) -> Option<Arc<dyn ReadableStore>> {
        Some(self)
    }

    fn save(&self, base: &Path) -> Result<String> {
        Self::write_marker(base)
    }
}

struct EmptyCursor;

impl StoreCursor for EmptyCursor {
    fn next(&mut self, _out: &mut Vec<u8>) -> Result<Option<u64>> {
        Ok(None)
    }

    fn seek_exact(&mut self, _id: u64, _out: &mut Vec<u8>) -> Result<bool> {
        Ok(false)
    }

    fn reset(&mut self) {}
}

impl IndexCursor for EmptyCursor {
    fn seek_lower_bound(
        &mut self,
        _key: &[u8],
        _id: &mut u64,
        _key_out: &mut Vec<u8>,
    ) -> Result<SeekResult> {
        Ok(SeekResult::End)
    }

    fn next(&mut self, _id: &mut u64, _key_out: &mut Vec<u8>) -> Result<bool> {
        Ok(false)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_roundtrip() {
        let dir = tempdir().unwrap();
        let s = EmptyStore::new();
        let base = dir.path().join("index-id");
        let fname = ReadableStore::save(&s, &base).unwrap();
        assert_eq!(fname, "index-id.empty");
        let loaded = EmptyStore::load(&dir.path().join(fname)).unwrap();
        assert_eq!(ReadableStore::num_data_rows(&loaded), 0);
        assert!(loaded.get_value_append(0, &mut Vec::new()).is_err());
    }
}
