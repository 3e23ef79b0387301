//! Engine contracts consumed by scopes, plus the concrete adapters.
//!
//! The traits here are the seam between execution and storage: a scope
//! only ever talks to an [`Engine`], which hands out [`Database`],
//! [`Relation`], and [`Reader`] views under a snapshot token.

mod disk;
mod mem;

pub use disk::DiskEngine;
pub use mem::{BatchReader, MemEngine};

use std::sync::Arc;

use async_trait::async_trait;

use strato_common::{Batch, ColumnType, NodeId, Schema, SnapshotId, StratoResult, Timestamp};

/// Column compression algorithm carried through descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlg {
    /// No compression.
    None,
    /// LZ4 block compression.
    Lz4,
}

/// Tri-state default expression of a column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DefaultValue {
    /// Whether a default exists.
    pub exist: bool,
    /// The default literal, when it exists.
    pub value: String,
    /// Whether the default is NULL.
    pub is_null: bool,
}

/// A fully-specified column attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Column name.
    pub name: String,
    /// Compression algorithm.
    pub alg: CompressAlg,
    /// Column type.
    pub column_type: ColumnType,
    /// Default expression.
    pub default: DefaultValue,
    /// Whether the column is part of the primary key.
    pub primary: bool,
}

/// A key/value table property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property key.
    pub key: String,
    /// Property value.
    pub value: String,
}

/// A table definition item handed to [`Database::create_table`]:
/// column attributes followed by table-level definitions.
#[derive(Debug, Clone, PartialEq)]
pub enum TableDef {
    /// One column.
    Attribute(Attribute),
    /// The primary index over the named columns.
    PrimaryIndex {
        /// Key column names.
        names: Vec<String>,
    },
    /// A secondary index.
    Index {
        /// Indexed column names.
        col_names: Vec<String>,
        /// Index name.
        name: String,
    },
    /// Table properties.
    Properties {
        /// Key/value pairs.
        properties: Vec<Property>,
    },
}

/// The storage engine surface a scope executes against.
#[async_trait]
pub trait Engine: Send + Sync {
    /// The node this engine instance runs on.
    fn node_id(&self) -> NodeId {
        NodeId::LOCAL
    }

    /// Creates a database.
    async fn create_database(
        &self,
        ts: Timestamp,
        name: &str,
        snapshot: SnapshotId,
    ) -> StratoResult<()>;

    /// Drops a database.
    async fn delete_database(
        &self,
        ts: Timestamp,
        name: &str,
        snapshot: SnapshotId,
    ) -> StratoResult<()>;

    /// Opens a database view under a snapshot.
    async fn database(&self, name: &str, snapshot: SnapshotId) -> StratoResult<Arc<dyn Database>>;
}

/// A database view under a snapshot.
#[async_trait]
pub trait Database: Send + Sync {
    /// Creates a table from definition items.
    async fn create_table(
        &self,
        ts: Timestamp,
        name: &str,
        defs: Vec<TableDef>,
        snapshot: SnapshotId,
    ) -> StratoResult<()>;

    /// Drops a table.
    async fn delete_table(&self, ts: Timestamp, name: &str, snapshot: SnapshotId)
        -> StratoResult<()>;

    /// Opens a relation view under a snapshot.
    async fn relation(&self, name: &str, snapshot: SnapshotId) -> StratoResult<Arc<dyn Relation>>;
}

/// A relation view that can be split into disjoint shard readers.
pub trait Relation: Send + Sync {
    /// The relation's schema.
    fn schema(&self) -> Arc<Schema>;

    /// Acquires `n` readers over disjoint partitions of the relation.
    /// Readers are consumed once; the list may be shorter than `n` when
    /// the relation has fewer partitions than requested.
    fn new_readers(&self, n: usize, snapshot: SnapshotId) -> StratoResult<Vec<Box<dyn Reader>>>;
}

/// A single-consumer cursor over one partition of a relation.
#[async_trait]
pub trait Reader: Send {
    /// Pulls the next batch; `None` at end of stream. Closing is
    /// implicit at EOF.
    async fn read(&mut self) -> StratoResult<Option<Batch>>;
}
