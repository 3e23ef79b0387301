//! Engine adapter over the replayed on-disk catalog.
//!
//! Replay produces a [`CatalogStore`]; this adapter exposes its tables
//! as relations whose readers stream batches from block and segment
//! files. The adapter is a read-only snapshot view - DDL goes through a
//! catalog writer, not here.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use strato_catalog::{CatalogStore, MetaHandle};
use strato_common::{
    Batch, Schema, SnapshotId, StratoError, StratoResult, TableId, Timestamp,
};

use super::{Database, Engine, Reader, Relation, TableDef};

/// A read-only engine backed by a replayed catalog store.
pub struct DiskEngine {
    store: Arc<CatalogStore>,
}

impl DiskEngine {
    /// Replays the working directory, cleans up stale artifacts, and
    /// opens the surviving state.
    pub fn open(work_dir: impl AsRef<std::path::Path>) -> StratoResult<Self> {
        let mut handle = MetaHandle::new(&work_dir).map_err(StratoError::from)?;
        let info = handle.rebuild_info();
        let store = handle.build_store(info);
        handle.cleanup();
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Wraps an already-built store.
    pub fn from_store(store: CatalogStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<CatalogStore> {
        &self.store
    }
}

#[async_trait]
impl Engine for DiskEngine {
    async fn create_database(
        &self,
        _ts: Timestamp,
        _name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        Err(StratoError::not_supported("DDL on a read-only snapshot"))
    }

    async fn delete_database(
        &self,
        _ts: Timestamp,
        _name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        Err(StratoError::not_supported("DDL on a read-only snapshot"))
    }

    /// The replayed catalog is a single namespace; any database name
    /// resolves to it.
    async fn database(
        &self,
        _name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<Arc<dyn Database>> {
        Ok(Arc::new(DiskDatabase {
            store: Arc::clone(&self.store),
        }))
    }
}

struct DiskDatabase {
    store: Arc<CatalogStore>,
}

#[async_trait]
impl Database for DiskDatabase {
    async fn create_table(
        &self,
        _ts: Timestamp,
        _name: &str,
        _defs: Vec<TableDef>,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        Err(StratoError::not_supported("DDL on a read-only snapshot"))
    }

    async fn delete_table(
        &self,
        _ts: Timestamp,
        _name: &str,
        _snapshot: SnapshotId,
    ) -> StratoResult<()> {
        Err(StratoError::not_supported("DDL on a read-only snapshot"))
    }

    async fn relation(&self, name: &str, _snapshot: SnapshotId) -> StratoResult<Arc<dyn Relation>> {
        let table = self
            .store
            .table_by_name(name)
            .ok_or_else(|| StratoError::execution(format!("table '{}' not found", name)))?;
        Ok(Arc::new(DiskRelation {
            table_id: table.id,
            schema: Arc::new(table.schema.clone()),
            store: Arc::clone(&self.store),
        }))
    }
}

struct DiskRelation {
    table_id: TableId,
    schema: Arc<Schema>,
    store: Arc<CatalogStore>,
}

impl Relation for DiskRelation {
    fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn new_readers(&self, n: usize, _snapshot: SnapshotId) -> StratoResult<Vec<Box<dyn Reader>>> {
        if n == 0 {
            return Err(StratoError::execution("requested zero readers"));
        }
        Ok(self
            .store
            .partition(self.table_id, n)
            .into_iter()
            .map(|paths| {
                Box::new(FileReader {
                    paths: paths.into(),
                }) as Box<dyn Reader>
            })
            .collect())
    }
}

/// Streams batches from a list of block/segment files.
struct FileReader {
    paths: VecDeque<PathBuf>,
}

#[async_trait]
impl Reader for FileReader {
    async fn read(&mut self) -> StratoResult<Option<Batch>> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;
        let batch: Batch = bincode::deserialize(&bytes)
            .map_err(|e| StratoError::parse(format!("block {}: {}", path.display(), e)))?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use strato_catalog::{write_batch_file, CatalogInfo, SegmentMeta, TableMeta};
    use strato_common::{Column, DataType, Field, SegmentId};
    use tempfile::TempDir;

    fn seed_store(tmp: &TempDir) {
        let meta = tmp.path().join("meta");
        let data = tmp.path().join("data");
        fs::create_dir_all(&meta).unwrap();
        fs::create_dir_all(&data).unwrap();

        let schema = Schema::new(vec![Field::not_null("a", DataType::Int64)]);
        let mut table = TableMeta::new(TableId::new(1), "t", schema.clone());
        table
            .segments
            .push(SegmentMeta::unsorted(SegmentId::new(1), 2));

        let path = meta.join("tbl_00000001_0000000000000001.tckp");
        table.write_to(fs::File::create(path).unwrap()).unwrap();

        let mut info = CatalogInfo::new();
        info.tables.insert(1, table);
        let path = meta.join("info_0000000000000001.ickp");
        info.write_to(fs::File::create(path).unwrap()).unwrap();

        let schema = Arc::new(schema);
        for b in 1..=2u64 {
            let batch = Batch::new(
                schema.clone(),
                vec![Column::int64(vec![b as i64, b as i64 + 10])],
            )
            .unwrap();
            let name = format!("blk_{:08x}_{:08x}_{:08x}.blk", 1, 1, b);
            write_batch_file(data.join(name), &batch).unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_and_read() {
        let tmp = TempDir::new().unwrap();
        seed_store(&tmp);

        let engine = DiskEngine::open(tmp.path()).unwrap();
        let db = engine
            .database("default", SnapshotId::default())
            .await
            .unwrap();
        let rel = db.relation("t", SnapshotId::default()).await.unwrap();
        assert_eq!(rel.schema().len(), 1);

        let readers = rel.new_readers(2, SnapshotId::default()).unwrap();
        let mut total = 0;
        for mut reader in readers {
            while let Some(batch) = reader.read().await.unwrap() {
                total += batch.num_rows();
            }
        }
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let tmp = TempDir::new().unwrap();
        seed_store(&tmp);

        let engine = DiskEngine::open(tmp.path()).unwrap();
        let db = engine
            .database("default", SnapshotId::default())
            .await
            .unwrap();
        assert!(db.relation("missing", SnapshotId::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_ddl_not_supported() {
        let tmp = TempDir::new().unwrap();
        seed_store(&tmp);

        let engine = DiskEngine::open(tmp.path()).unwrap();
        let result = engine
            .create_database(Timestamp::now(), "x", SnapshotId::default())
            .await;
        assert!(matches!(result, Err(StratoError::NotSupported { .. })));
    }
}
