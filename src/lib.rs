//! Stratabase Core Storage Engine
//!
//! A segmented, columnar, write-once-compact storage engine for
//! structured rows. Rows are ingested into a mutable writable segment;
//! frozen segments are converted into compressed readonly segments, and
//! tombstone-heavy readonly segments are purged into compacted ones.
//!
//! Layout on disk:
//! ```text
//! table_dir/
//! ├── wr-0000/           # writable segment
//! │   ├── IsDel          # u64 row count + packed deletion bits
//! │   ├── __wrtStore__   # row store for full-row writes
//! │   └── colgroup-<g>.fixlen   # in-place updatable column groups
//! ├── rd-0001/           # readonly segment
//! │   ├── IsDel
//! │   ├── IsPurged.rs    # rank/select purge bitmap (optional)
//! │   ├── index-<name>.{zint,fixlen,empty,nlt}
//! │   └── colgroup-<name>[.NNNN].{fixlen,zint,nlt,seq,empty}
//! └── rd-0002.tmp/       # in-flight build, renamed on success
//! ```

pub mod bits;
pub mod context;
pub mod index;
pub mod schema;
pub mod segment;
pub mod store;
pub mod table;

pub use context::DbContext;
pub use schema::{ColumnType, Schema, SchemaConfig, SchemaConfigBuilder};
pub use segment::{ReadonlySegment, SegmentBase, WritableSegment};
pub use table::{SegmentHandle, Table};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("id out of range: {id}, rows: {rows}")]
    OutOfRange { id: u64, rows: u64 },

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("data loss: store yielded {real} rows, expected {expected}")]
    DataLoss { real: u64, expected: u64 },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        EngineError::LogicError(msg.into())
    }
}
