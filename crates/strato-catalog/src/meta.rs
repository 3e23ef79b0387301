//! Persisted catalog metadata.
//!
//! Checkpoint payloads are self-describing bincode streams; the catalog
//! consumes them via [`CatalogInfo::read_from`] / [`TableMeta::read_from`].

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use strato_common::{Schema, SegmentId, TableId, Timestamp, Version};

use crate::error::CatalogResult;

/// Sort state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataState {
    /// The segment is a set of unsorted block files.
    Unsorted,
    /// The segment has been merged into a single sorted file.
    Sorted,
}

/// Catalog state of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Segment id, unique within the table.
    pub id: SegmentId,
    /// Sort state.
    pub data_state: DataState,
    /// Number of blocks the segment was built from.
    pub block_count: u64,
}

impl SegmentMeta {
    /// Creates an unsorted segment descriptor.
    pub fn unsorted(id: SegmentId, block_count: u64) -> Self {
        Self {
            id,
            data_state: DataState::Unsorted,
            block_count,
        }
    }

    /// Returns true if the segment is sorted.
    pub fn is_sorted(&self) -> bool {
        self.data_state == DataState::Sorted
    }

    /// Promotes the segment to sorted if it is not already.
    pub fn try_sorted(&mut self) {
        if self.data_state == DataState::Unsorted {
            self.data_state = DataState::Sorted;
        }
    }
}

/// Catalog state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Column schema.
    pub schema: Schema,
    /// Segments in creation order.
    pub segments: Vec<SegmentMeta>,
    /// When the table was dropped, if it has been.
    pub deleted_at: Option<Timestamp>,
}

impl TableMeta {
    /// Creates a live table descriptor.
    pub fn new(id: TableId, name: impl Into<String>, schema: Schema) -> Self {
        Self {
            id,
            name: name.into(),
            schema,
            segments: Vec::new(),
            deleted_at: None,
        }
    }

    /// Returns true if the table was dropped at or before `ts`.
    pub fn is_deleted(&self, ts: Timestamp) -> bool {
        self.deleted_at.map(|d| d <= ts).unwrap_or(false)
    }

    /// Recomputes derived in-memory state after deserialization.
    ///
    /// Segments are restored in id order regardless of the order they
    /// were checkpointed in.
    pub fn replay(&mut self) {
        self.segments.sort_by_key(|s| s.id);
    }

    /// Deserializes a table checkpoint payload.
    pub fn read_from(reader: impl Read) -> CatalogResult<Self> {
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Serializes a table checkpoint payload.
    pub fn write_to(&self, writer: impl Write) -> CatalogResult<()> {
        Ok(bincode::serialize_into(writer, self)?)
    }
}

/// The global catalog checkpoint: every table descriptor plus the
/// catalog version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogInfo {
    /// Catalog version.
    pub version: Version,
    /// Table descriptors by raw table id.
    pub tables: HashMap<u64, TableMeta>,
}

impl CatalogInfo {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table with the given name, if live.
    pub fn table_by_name(&self, name: &str) -> Option<&TableMeta> {
        self.tables.values().find(|t| t.name == name)
    }

    /// Deserializes an info checkpoint payload.
    pub fn read_from(reader: impl Read) -> CatalogResult<Self> {
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Serializes an info checkpoint payload.
    pub fn write_to(&self, writer: impl Write) -> CatalogResult<()> {
        Ok(bincode::serialize_into(writer, self)?)
    }
}
