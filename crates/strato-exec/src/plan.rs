//! Plan-layer DDL descriptors.
//!
//! These mirror the wire-format descriptors produced by the logical
//! planner. The execution layer translates them to engine descriptors
//! in [`crate::ddl`]; nothing here touches storage directly.

/// Column compression tag carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    /// No compression.
    #[default]
    None,
    /// LZ4 block compression.
    Lz4,
}

/// Wire-format column type: a numeric tag plus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanType {
    /// Type tag (see `DataType::from_tag`).
    pub id: u32,
    /// Display width.
    pub width: i32,
    /// Numeric precision.
    pub precision: i32,
    /// Numeric scale.
    pub scale: i32,
    /// Element size in bytes.
    pub size: i32,
}

/// Tri-state default expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanDefault {
    /// Whether a default exists.
    pub exist: bool,
    /// The default literal.
    pub value: String,
    /// Whether the default is NULL.
    pub is_null: bool,
}

/// Wire-format column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColDef {
    /// Column name.
    pub name: String,
    /// Compression algorithm.
    pub alg: CompressType,
    /// Column type.
    pub typ: PlanType,
    /// Default expression.
    pub default: PlanDefault,
    /// Whether the column is part of the primary key.
    pub primary: bool,
}

/// A key/value property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanProperty {
    /// Property key.
    pub key: String,
    /// Property value.
    pub value: String,
}

/// A wire-format table-level definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableDefItem {
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
        properties: Vec<PlanProperty>,
    },
}

/// A wire-format table definition: columns plus table-level items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefPlan {
    /// Table name.
    pub name: String,
    /// Column definitions.
    pub cols: Vec<ColDef>,
    /// Table-level definitions.
    pub defs: Vec<TableDefItem>,
}

/// A DDL statement descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlPlan {
    /// CREATE DATABASE.
    CreateDatabase {
        /// Database name.
        database: String,
    },
    /// DROP DATABASE.
    DropDatabase {
        /// Database name.
        database: String,
    },
    /// CREATE TABLE.
    CreateTable {
        /// Database name; empty means the session default.
        database: String,
        /// The table definition.
        table: TableDefPlan,
    },
    /// DROP TABLE.
    DropTable {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
    },
    /// CREATE INDEX.
    CreateIndex {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
        /// Index name.
        index: String,
        /// Indexed column names.
        col_names: Vec<String>,
    },
    /// DROP INDEX.
    DropIndex {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },
}
