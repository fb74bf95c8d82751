//! Row schema, column groups and column projection
//!
//! A table's rows are described by a flat row schema. Columns are
//! partitioned into *column groups*; each group is persisted by one
//! store backend. Index groups come first in the group vector, data
//! groups after them. `ColProject` maps a row column id to its
//! `(colgroup, sub column)` location.
//!
//! Encoding of a row (and of any group projection of it): fixed-size
//! columns are stored as their raw little-endian bytes; variable-size
//! columns carry a `u32` length prefix, except the last column of the
//! encoding which takes the remainder.

use std::ops::Range;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

// ============================================================================
// Column types
// ============================================================================

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    Binary,
}

impl ColumnType {
    /// Fixed size in bytes (0 for variable-length types)
    pub fn fixed_size(&self) -> usize {
        match self {
            ColumnType::Bool | ColumnType::Int8 | ColumnType::UInt8 => 1,
            ColumnType::Int16 | ColumnType::UInt16 => 2,
            ColumnType::Int32 | ColumnType::UInt32 | ColumnType::Float32 => 4,
            ColumnType::Int64 | ColumnType::UInt64 | ColumnType::Float64 => 8,
            ColumnType::Utf8 | ColumnType::Binary => 0,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        matches!(self, ColumnType::Utf8 | ColumnType::Binary)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8
                | ColumnType::Int16
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::UInt8
                | ColumnType::UInt16
                | ColumnType::UInt32
                | ColumnType::UInt64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64
        )
    }
}

/// Column definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub ctype: ColumnType,
}

/// Byte range of one column inside a parse buffer
pub type ColRange = Range<usize>;

// ============================================================================
// Schema (one column group, or the whole row)
// ============================================================================

/// Default dict-zip sample ratio trigger: 0 means "decide by average
/// row length", negative disables dict-zip entirely.
pub const DICT_ZIP_AVG_LEN_TRIGGER: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Row-schema column id of each column in this group
    pub parent_cols: Vec<usize>,
    /// Columns of this group that participate in row reconstruction
    pub keep_cols: Vec<bool>,
    pub is_index: bool,
    pub is_unique: bool,
    pub is_inplace_updatable: bool,
    pub enable_linear_scan: bool,
    pub dict_zip_local_match: bool,
    pub dict_zip_sample_ratio: f32,
    /// Rank-select flavor for the blob backend: 256 or 512
    pub rank_select_class: i32,
    fixed_row_len: usize,
    fixed_offsets: Vec<usize>,
}

impl Schema {
    pub fn new(name: &str, columns: Vec<ColumnMeta>, parent_cols: Vec<usize>) -> Self {
        let mut fixed_row_len = 0;
        let mut fixed_offsets = Vec::with_capacity(columns.len());
        let mut all_fixed = true;
        for c in &columns {
            fixed_offsets.push(fixed_row_len);
            let sz = c.ctype.fixed_size();
            if sz == 0 {
                all_fixed = false;
            }
            fixed_row_len += sz;
        }
        if !all_fixed {
            fixed_row_len = 0;
        }
        let ncols = columns.len();
        Self {
            name: name.to_string(),
            columns,
            parent_cols,
            keep_cols: vec![true; ncols],
            is_index: false,
            is_unique: false,
            is_inplace_updatable: false,
            enable_linear_scan: false,
            dict_zip_local_match: true,
            dict_zip_sample_ratio: 0.0,
            rank_select_class: 512,
            fixed_row_len,
            fixed_offsets,
        }
    }

    pub fn column_num(&self) -> usize {
        self.columns.len()
    }

    /// Total row length when every column is fixed-size, else 0
    pub fn fixed_row_len(&self) -> usize {
        self.fixed_row_len
    }

    /// Byte slot of a column inside a fixed-length row
    pub fn fixed_slot(&self, sub_col: usize) -> (usize, usize) {
        debug_assert!(self.fixed_row_len > 0);
        (
            self.fixed_offsets[sub_col],
            self.columns[sub_col].ctype.fixed_size(),
        )
    }

    /// In-place updatable groups keep their temp store as the final
    /// store; everything else goes through the store builders.
    pub fn should_use_fixed_len_store(&self) -> bool {
        self.is_inplace_updatable && self.fixed_row_len > 0
    }

    pub fn has_any_keep_col(&self) -> bool {
        self.keep_cols.iter().any(|&k| k)
    }

    // ------------------------------------------------------------------
    // Row encoding
    // ------------------------------------------------------------------

    /// Parse one encoded row, appending column ranges (relative to the
    /// whole buffer) starting at `start`.
    pub fn parse_row_append(
        &self,
        buf: &[u8],
        start: usize,
        cols: &mut Vec<ColRange>,
    ) -> Result<()> {
        let mut pos = start;
        let end = buf.len();
        let last = self.columns.len().saturating_sub(1);
        for (i, c) in self.columns.iter().enumerate() {
            let sz = c.ctype.fixed_size();
            if sz > 0 {
                if pos + sz > end {
                    return Err(EngineError::logic(format!(
                        "row underflow in group {}: col {} at {}, buf len {}",
                        self.name, i, pos, end
                    )));
                }
                cols.push(pos..pos + sz);
                pos += sz;
            } else if i == last {
                cols.push(pos..end);
                pos = end;
            } else {
                if pos + 4 > end {
                    return Err(EngineError::logic(format!(
                        "row underflow in group {}: missing length prefix",
                        self.name
                    )));
                }
                let len =
                    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
                        as usize;
                pos += 4;
                if pos + len > end {
                    return Err(EngineError::logic(format!(
                        "row underflow in group {}: col {} len {}",
                        self.name, i, len
                    )));
                }
                cols.push(pos..pos + len);
                pos += len;
            }
        }
        Ok(())
    }

    pub fn parse_row(&self, buf: &[u8], cols: &mut Vec<ColRange>) -> Result<()> {
        cols.clear();
        self.parse_row_append(buf, 0, cols)
    }

    /// Append one column value using this schema's encoding rules.
    /// `sub_col` is the column position inside this schema.
    pub fn project_append(&self, data: &[u8], sub_col: usize, out: &mut Vec<u8>) {
        let ctype = self.columns[sub_col].ctype;
        if ctype.is_variable_length() && sub_col + 1 < self.columns.len() {
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
        out.extend_from_slice(data);
    }

    /// Encode this group's projection of a parsed parent row.
    pub fn select_parent(
        &self,
        parent_cols: &[ColRange],
        parent_buf: &[u8],
        out: &mut Vec<u8>,
    ) {
        out.clear();
        for (sub, &parent_id) in self.parent_cols.iter().enumerate() {
            let r = parent_cols[parent_id].clone();
            self.project_append(&parent_buf[r], sub, out);
        }
    }
}

// ============================================================================
// SchemaConfig (the whole table layout)
// ============================================================================

/// `(columnId) → (colgroupId, subColumnId)`
#[derive(Debug, Clone, Copy)]
pub struct ColProject {
    pub colgroup_id: usize,
    pub sub_col: usize,
}

#[derive(Debug)]
pub struct SchemaConfig {
    pub row_schema: Schema,
    /// Index groups first, data groups after
    pub colgroups: Vec<Schema>,
    pub index_num: usize,
    /// Subset of row columns stored in the writable row store
    pub wrt_schema: Schema,
    /// Row column id → wrt-schema column id
    pub row_to_wrt: Vec<Option<usize>>,
    /// Group ids of in-place updatable groups
    pub updatable_colgroups: Vec<usize>,
    pub col_project: Vec<ColProject>,
    /// Memory bound for one compressed part during conversion
    pub compressing_work_mem: usize,
    /// Keep `IsPurged.rs` after a purge so logical ids survive reloads
    pub keep_purge_bits: bool,
}

impl SchemaConfig {
    pub fn colgroup_num(&self) -> usize {
        self.colgroups.len()
    }

    pub fn column_num(&self) -> usize {
        self.row_schema.column_num()
    }

    pub fn get_colgroup_schema(&self, i: usize) -> &Schema {
        &self.colgroups[i]
    }

    pub fn get_index_schema(&self, i: usize) -> &Schema {
        debug_assert!(i < self.index_num);
        &self.colgroups[i]
    }

    /// Reassemble a full row from per-group column data.
    ///
    /// `group_cols[g]` holds the parsed column ranges of group `g` into
    /// `buf`; groups whose columns were skipped hold empty ranges.
    pub fn combine_row(
        &self,
        buf: &[u8],
        group_cols: &[Vec<ColRange>],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let ncols = self.column_num();
        let mut row_cols: Vec<Option<ColRange>> = vec![None; ncols];
        for (g, schema) in self.colgroups.iter().enumerate() {
            for (sub, &parent) in schema.parent_cols.iter().enumerate() {
                if schema.keep_cols[sub] {
                    row_cols[parent] = Some(group_cols[g][sub].clone());
                }
            }
        }
        out.clear();
        for (i, slot) in row_cols.iter().enumerate() {
            let r = slot.clone().ok_or_else(|| {
                EngineError::logic(format!("column {} missing during row reassembly", i))
            })?;
            self.row_schema.project_append(&buf[r], i, out);
        }
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SchemaConfigBuilder {
    columns: Vec<ColumnMeta>,
    name_to_col: AHashMap<String, usize>,
    indices: Vec<(String, Vec<String>, bool)>,
    groups: Vec<(String, Vec<String>, bool)>,
    group_tweaks: AHashMap<String, GroupTweaks>,
    compressing_work_mem: usize,
    keep_purge_bits: bool,
}

#[derive(Default, Clone)]
struct GroupTweaks {
    dict_zip_sample_ratio: Option<f32>,
    dict_zip_local_match: Option<bool>,
    rank_select_class: Option<i32>,
    enable_linear_scan: Option<bool>,
}

impl Default for SchemaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaConfigBuilder {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            name_to_col: AHashMap::new(),
            indices: Vec::new(),
            groups: Vec::new(),
            group_tweaks: AHashMap::new(),
            compressing_work_mem: 512 * 1024 * 1024,
            keep_purge_bits: false,
        }
    }

    pub fn add_column(&mut self, name: &str, ctype: ColumnType) -> &mut Self {
        if !self.name_to_col.contains_key(name) {
            self.name_to_col
                .insert(name.to_string(), self.columns.len());
            self.columns.push(ColumnMeta {
                name: name.to_string(),
                ctype,
            });
        }
        self
    }

    pub fn add_index(&mut self, name: &str, cols: &[&str], unique: bool) -> &mut Self {
        self.indices.push((
            name.to_string(),
            cols.iter().map(|s| s.to_string()).collect(),
            unique,
        ));
        self
    }

    pub fn add_colgroup(&mut self, name: &str, cols: &[&str], inplace_updatable: bool) -> &mut Self {
        self.groups.push((
            name.to_string(),
            cols.iter().map(|s| s.to_string()).collect(),
            inplace_updatable,
        ));
        self
    }

    pub fn dict_zip_sample_ratio(&mut self, group: &str, ratio: f32) -> &mut Self {
        self.group_tweaks
            .entry(group.to_string())
            .or_default()
            .dict_zip_sample_ratio = Some(ratio);
        self
    }

    pub fn dict_zip_local_match(&mut self, group: &str, on: bool) -> &mut Self {
        self.group_tweaks
            .entry(group.to_string())
            .or_default()
            .dict_zip_local_match = Some(on);
        self
    }

    pub fn rank_select_class(&mut self, group: &str, class: i32) -> &mut Self {
        self.group_tweaks
            .entry(group.to_string())
            .or_default()
            .rank_select_class = Some(class);
        self
    }

    pub fn enable_linear_scan(&mut self, group: &str, on: bool) -> &mut Self {
        self.group_tweaks
            .entry(group.to_string())
            .or_default()
            .enable_linear_scan = Some(on);
        self
    }

    pub fn compressing_work_mem(&mut self, bytes: usize) -> &mut Self {
        self.compressing_work_mem = bytes;
        self
    }

    pub fn keep_purge_bits(&mut self, keep: bool) -> &mut Self {
        self.keep_purge_bits = keep;
        self
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|n| {
                self.name_to_col
                    .get(n)
                    .copied()
                    .ok_or_else(|| EngineError::invalid(format!("unknown column: {}", n)))
            })
            .collect()
    }

    pub fn build(&self) -> Result<SchemaConfig> {
        if self.columns.is_empty() {
            return Err(EngineError::invalid("schema has no columns"));
        }
        let ncols = self.columns.len();
        let mut owner: Vec<Option<usize>> = vec![None; ncols];
        let mut colgroups: Vec<Schema> = Vec::new();

        let mut claim = |col: usize, group: usize| -> Result<()> {
            if owner[col].is_some() {
                return Err(EngineError::invalid(format!(
                    "column {} belongs to more than one group",
                    self.columns[col].name
                )));
            }
            owner[col] = Some(group);
            Ok(())
        };

        for (name, cols, unique) in &self.indices {
            let parents = self.resolve(cols)?;
            let metas = parents.iter().map(|&c| self.columns[c].clone()).collect();
            let gid = colgroups.len();
            for &c in &parents {
                claim(c, gid)?;
            }
            let mut s = Schema::new(name, metas, parents);
            s.is_index = true;
            s.is_unique = *unique;
            colgroups.push(s);
        }
        let index_num = colgroups.len();

        for (name, cols, inplace) in &self.groups {
            let parents = self.resolve(cols)?;
            let metas: Vec<ColumnMeta> =
                parents.iter().map(|&c| self.columns[c].clone()).collect();
            let gid = colgroups.len();
            for &c in &parents {
                claim(c, gid)?;
            }
            let mut s = Schema::new(name, metas, parents);
            s.is_inplace_updatable = *inplace;
            if *inplace && s.fixed_row_len() == 0 {
                return Err(EngineError::invalid(format!(
                    "in-place updatable group {} must be fixed-length",
                    name
                )));
            }
            colgroups.push(s);
        }

        // every unclaimed column becomes its own group
        for col in 0..ncols {
            if owner[col].is_none() {
                let gid = colgroups.len();
                owner[col] = Some(gid);
                let meta = self.columns[col].clone();
                let name = meta.name.clone();
                colgroups.push(Schema::new(&name, vec![meta], vec![col]));
            }
        }

        for s in colgroups.iter_mut() {
            if let Some(t) = self.group_tweaks.get(&s.name) {
                if let Some(v) = t.dict_zip_sample_ratio {
                    s.dict_zip_sample_ratio = v;
                }
                if let Some(v) = t.dict_zip_local_match {
                    s.dict_zip_local_match = v;
                }
                if let Some(v) = t.rank_select_class {
                    s.rank_select_class = v;
                }
                if let Some(v) = t.enable_linear_scan {
                    s.enable_linear_scan = v;
                }
            }
        }

        let mut col_project = vec![
            ColProject {
                colgroup_id: 0,
                sub_col: 0,
            };
            ncols
        ];
        for (g, schema) in colgroups.iter().enumerate() {
            for (sub, &parent) in schema.parent_cols.iter().enumerate() {
                col_project[parent] = ColProject {
                    colgroup_id: g,
                    sub_col: sub,
                };
            }
        }

        let updatable_colgroups: Vec<usize> = colgroups
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_inplace_updatable)
            .map(|(g, _)| g)
            .collect();

        // wrt schema: everything not stored in an in-place updatable group
        let mut wrt_cols = Vec::new();
        let mut wrt_parents = Vec::new();
        let mut row_to_wrt = vec![None; ncols];
        for col in 0..ncols {
            let g = owner[col].unwrap();
            if !colgroups[g].is_inplace_updatable {
                row_to_wrt[col] = Some(wrt_cols.len());
                wrt_cols.push(self.columns[col].clone());
                wrt_parents.push(col);
            }
        }
        if wrt_cols.is_empty() {
            return Err(EngineError::invalid(
                "all columns are in in-place updatable groups",
            ));
        }
        let wrt_schema = Schema::new("__wrt__", wrt_cols, wrt_parents);

        let row_schema = Schema::new(
            "__row__",
            self.columns.clone(),
            (0..ncols).collect(),
        );

        Ok(SchemaConfig {
            row_schema,
            colgroups,
            index_num,
            wrt_schema,
            row_to_wrt,
            updatable_colgroups,
            col_project,
            compressing_work_mem: self.compressing_work_mem,
            keep_purge_bits: self.keep_purge_bits,
        })
    }
}

// ============================================================================
// Row builder (test / ingest helper)
// ============================================================================

/// Builds one encoded row in row-schema column order.
pub struct RowBuilder<'a> {
    schema: &'a Schema,
    buf: Vec<u8>,
    next_col: usize,
}

impl<'a> RowBuilder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            buf: Vec::new(),
            next_col: 0,
        }
    }

    fn push_raw(&mut self, data: &[u8]) -> &mut Self {
        let col = self.next_col;
        debug_assert!(col < self.schema.column_num());
        self.schema.project_append(data, col, &mut self.buf);
        self.next_col += 1;
        self
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        let sz = self.schema.columns[self.next_col].ctype.fixed_size();
        let bytes = v.to_le_bytes();
        self.push_raw(&bytes[..sz])
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        let sz = self.schema.columns[self.next_col].ctype.fixed_size();
        let bytes = v.to_le_bytes();
        self.push_raw(&bytes[..sz])
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        let bytes = v.to_le_bytes();
        self.push_raw(&bytes)
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.push_raw(&[v as u8])
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        self.push_raw(v.as_bytes())
    }

    pub fn push_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.push_raw(v)
    }

    pub fn finish(&mut self) -> Result<Vec<u8>> {
        if self.next_col != self.schema.column_num() {
            return Err(EngineError::invalid(format!(
                "row has {} columns, schema needs {}",
                self.next_col,
                self.schema.column_num()
            )));
        }
        self.next_col = 0;
        Ok(std::mem::take(&mut self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col_config() -> SchemaConfig {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true);
        b.build().unwrap()
    }

    #[test]
    fn test_groups_and_projection() {
        let cfg = two_col_config();
        assert_eq!(cfg.index_num, 1);
        assert_eq!(cfg.colgroup_num(), 2);
        assert_eq!(cfg.col_project[0].colgroup_id, 0);
        assert_eq!(cfg.col_project[1].colgroup_id, 1);
        assert_eq!(cfg.colgroups[0].fixed_row_len(), 8);
        assert_eq!(cfg.colgroups[1].fixed_row_len(), 0);
    }

    #[test]
    fn test_row_roundtrip() {
        let cfg = two_col_config();
        let row = RowBuilder::new(&cfg.row_schema)
            .push_i64(42)
            .push_str("hello")
            .finish()
            .unwrap();
        let mut cols = Vec::new();
        cfg.row_schema.parse_row(&row, &mut cols).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(&row[cols[0].clone()], &42i64.to_le_bytes());
        assert_eq!(&row[cols[1].clone()], b"hello");

        // project onto the index group and back
        let mut key = Vec::new();
        cfg.colgroups[0].select_parent(&cols, &row, &mut key);
        assert_eq!(&key, &42i64.to_le_bytes());
    }

    #[test]
    fn test_mid_row_var_column_is_length_prefixed() {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("a", ColumnType::Utf8)
            .add_column("b", ColumnType::Utf8);
        let cfg = b.build().unwrap();
        let row = RowBuilder::new(&cfg.row_schema)
            .push_str("xy")
            .push_str("zw")
            .finish()
            .unwrap();
        // 4-byte prefix for "xy", none for the trailing column
        assert_eq!(row.len(), 4 + 2 + 2);
        let mut cols = Vec::new();
        cfg.row_schema.parse_row(&row, &mut cols).unwrap();
        assert_eq!(&row[cols[0].clone()], b"xy");
        assert_eq!(&row[cols[1].clone()], b"zw");
    }

    #[test]
    fn test_double_membership_rejected() {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_index("id", &["id"], true)
            .add_colgroup("also_id", &["id"], false);
        assert!(b.build().is_err());
    }

    #[test]
    fn test_wrt_schema_excludes_updatable_groups() {
        let mut b = SchemaConfigBuilder::new();
        b.add_column("id", ColumnType::Int64)
            .add_column("score", ColumnType::Float64)
            .add_column("name", ColumnType::Utf8)
            .add_index("id", &["id"], true)
            .add_colgroup("score", &["score"], true);
        let cfg = b.build().unwrap();
        assert_eq!(cfg.wrt_schema.column_num(), 2);
        assert_eq!(cfg.row_to_wrt[0], Some(0));
        assert_eq!(cfg.row_to_wrt[1], None);
        assert_eq!(cfg.row_to_wrt[2], Some(1));
        assert_eq!(cfg.updatable_colgroups, vec![1]);
    }
}
