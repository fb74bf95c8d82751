//! Multi-part store
//!
//! Concatenation of N stores with an id offset table. Produced when a
//! column group's build exceeds the compression work-memory bound and
//! gets split into parts named `<base>.NNNN.<suffix>`.

use std::path::Path;
use std::sync::Arc;

use super::{ReadableStore, StoreCursor};
use crate::{EngineError, Result};

pub struct MultiPartStore {
    parts: Vec<Arc<dyn ReadableStore>>,
    /// `offsets[i]` is the first id of part `i`; one trailing total
    offsets: Vec<u64>,
}

impl MultiPartStore {
    pub fn new(parts: Vec<Arc<dyn ReadableStore>>) -> Self {
        let mut offsets = Vec::with_capacity(parts.len() + 1);
        let mut total = 0u64;
        for p in &parts {
            offsets.push(total);
            total += p.num_data_rows();
        }
        offsets.push(total);
        Self { parts, offsets }
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, i: usize) -> &Arc<dyn ReadableStore> {
        &self.parts[i]
    }

    fn locate(&self, id: u64) -> Result<(usize, u64)> {
        let rows = *self.offsets.last().unwrap();
        if id >= rows {
            return Err(EngineError::OutOfRange { id, rows });
        }
        let part = self.offsets.partition_point(|&o| o <= id) - 1;
        Ok((part, id - self.offsets[part]))
    }
}

impl ReadableStore for MultiPartStore {
    fn num_data_rows(&self) -> u64 {
        *self.offsets.last().unwrap()
    }

    fn data_inflate_size(&self) -> u64 {
        self.parts.iter().map(|p| p.data_inflate_size()).sum()
    }

    fn data_storage_size(&self) -> u64 {
        self.parts.iter().map(|p| p.data_storage_size()).sum()
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> Result<()> {
        let (part, sub) = self.locate(id)?;
        self.parts[part].get_value_append(sub, out)
    }

    fn cursor(&self) -> Box<dyn StoreCursor + '_> {
        Box::new(MultiCursor {
            store: self,
            part: 0,
            inner: None,
        })
    }

    fn save(&self, base: &Path) -> Result<String> {
        let base_name = base.file_name().unwrap().to_string_lossy().to_string();
        let mut first = String::new();
        for (i, p) in self.parts.iter().enumerate() {
            let part_base = base.with_file_name(format!("{}.{:04}", base_name, i));
            let fname = p.save(&part_base)?;
            if i == 0 {
                first = fname;
            }
        }
        Ok(first)
    }

    fn as_multi_part(&self) -> Option<&MultiPartStore> {
        Some(self)
    }
}

struct MultiCursor<'a> {
    store: &'a MultiPartStore,
    part: usize,
    inner: Option<Box<dyn StoreCursor + 'a>>,
}

impl StoreCursor for MultiCursor<'_> {
    fn next(&mut self, out: &mut Vec<u8>) -> Result<Option<u64>> {
        loop {
            if self.part >= self.store.parts.len() {
                return Ok(None);
            }
            if self.inner.is_none() {
                self.inner = Some(self.store.parts[self.part].cursor());
            }
            if let Some(sub) = self.inner.as_mut().unwrap().next(out)? {
                return Ok(Some(self.store.offsets[self.part] + sub));
            }
            self.part += 1;
            self.inner = None;
        }
    }

    fn seek_exact(&mut self, id: u64, out: &mut Vec<u8>) -> Result<bool> {
        let (part, sub) = match self.store.locate(id) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };
        if part != self.part || self.inner.is_none() {
            self.part = part;
            self.inner = Some(self.store.parts[part].cursor());
        }
        self.inner.as_mut().unwrap().seek_exact(sub, out)
    }

    fn reset(&mut self) {
        self.part = 0;
        self.inner = None;
    }
}
