//! Core data model for StratoDB.
//!
//! The modules here define the identifiers used by the storage layer, the
//! schema descriptors, and the columnar batch model the execution engine
//! operates on.

mod batch;
mod ids;
mod schema;
mod value;

pub use batch::{Batch, Column};
pub use ids::{BlockId, NodeId, SegmentId, SnapshotId, TableId, Timestamp, Version};
pub use schema::{ColumnType, DataType, Field, Schema};
pub use value::Value;
