//! In-memory storage engine, used as a test fixture and for constant
//! relations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use strato_common::{Batch, Field, Schema, SnapshotId, StratoError, StratoResult, Timestamp};

use super::{Database, Engine, Reader, Relation, TableDef};

/// An in-memory engine: databases of relations of resident batches.
#[derive(Default)]
pub struct MemEngine {
    databases: RwLock<HashMap<String, Arc<MemDatabase>>>,
}

impl MemEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor: one database holding one relation with
    /// the given resident batches.
    pub fn with_table(
        database: &str,
        table: &str,
        schema: Schema,
        batches: Vec<Batch>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self::new());
        let db = Arc::new(MemDatabase::default());
        db.tables.write().insert(
            table.to_string(),
            Arc::new(MemRelation {
                schema: Arc::new(schema),
                data: RwLock::new(batches),
            }),
        );
        engine
            .databases
            .write()
            .insert(database.to_string(), db);
        engine
    }
}

#[async_trait]
impl Engine for MemEngine {
    async fn create_database(
        &self,
        _ts: Timestamp,
        name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(StratoError::execution(format!(
                "database '{}' already exists",
                name
            )));
        }
        databases.insert(name.to_string(), Arc::new(MemDatabase::default()));
        Ok(())
    }

    async fn delete_database(
        &self,
        _ts: Timestamp,
        name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        self.databases
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StratoError::execution(format!("database '{}' not found", name)))
    }

    async fn database(&self, name: &str, _snapshot: SnapshotId) -> StratoResult<Arc<dyn Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .map(|db| db as Arc<dyn Database>)
            .ok_or_else(|| StratoError::execution(format!("database '{}' not found", name)))
    }
}

/// One in-memory database.
#[derive(Default)]
pub struct MemDatabase {
    tables: RwLock<HashMap<String, Arc<MemRelation>>>,
}

#[async_trait]
impl Database for MemDatabase {
    async fn create_table(
        &self,
        _ts: Timestamp,
        name: &str,
        defs: Vec<TableDef>,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(StratoError::execution(format!(
                "table '{}' already exists",
                name
            )));
        }
        let fields: Vec<Field> = defs
            .iter()
            .filter_map(|def| match def {
                TableDef::Attribute(attr) => Some(Field {
                    name: attr.name.clone(),
                    column_type: attr.column_type,
                    nullable: !attr.primary,
                }),
                _ => None,
            })
            .collect();
        if fields.is_empty() {
            return Err(StratoError::plan(format!(
                "table '{}' defines no columns",
                name
            )));
        }
        tables.insert(
            name.to_string(),
            Arc::new(MemRelation {
                schema: Arc::new(Schema::new(fields)),
                data: RwLock::new(Vec::new()),
            }),
        );
        Ok(())
    }

    async fn delete_table(
        &self,
        _ts: Timestamp,
        name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        self.tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StratoError::execution(format!("table '{}' not found", name)))
    }

    async fn relation(&self, name: &str, _snapshot: SnapshotId) -> StratoResult<Arc<dyn Relation>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .map(|rel| rel as Arc<dyn Relation>)
            .ok_or_else(|| StratoError::execution(format!("table '{}' not found", name)))
    }
}

/// One in-memory relation.
pub struct MemRelation {
    schema: Arc<Schema>,
    data: RwLock<Vec<Batch>>,
}

impl Relation for MemRelation {
    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn new_readers(&self, n: usize, _snapshot: SnapshotId) -> StratoResult<Vec<Box<dyn Reader>>> {
        if n == 0 {
            return Err(StratoError::execution("requested zero readers"));
        }
        let data = self.data.read();
        let mut partitions: Vec<VecDeque<Batch>> = (0..n).map(|_| VecDeque::new()).collect();
        for (i, batch) in data.iter().enumerate() {
            partitions[i % n].push_back(batch.clone());
        }
        Ok(partitions
            .into_iter()
            .map(|batches| Box::new(BatchReader { batches }) as Box<dyn Reader>)
            .collect())
    }
}

/// A reader over resident batches.
pub struct BatchReader {
    batches: VecDeque<Batch>,
}

impl BatchReader {
    /// Creates a reader over the given batches.
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

#[async_trait]
impl Reader for BatchReader {
    async fn read(&mut self) -> StratoResult<Option<Batch>> {
        Ok(self.batches.pop_front())
    }
}
