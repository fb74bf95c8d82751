//! Per-caller scratch context
//!
//! Read paths reuse these buffers instead of allocating per call. A
//! context is cheap to create and must not be shared across threads.

use crate::schema::ColRange;

#[derive(Debug, Default)]
pub struct DbContext {
    pub buf1: Vec<u8>,
    pub buf2: Vec<u8>,
    pub cols1: Vec<ColRange>,
    pub cols2: Vec<ColRange>,
    pub rec_ids: Vec<u64>,
}

impl DbContext {
    pub fn new() -> Self {
        Self::default()
    }
}
