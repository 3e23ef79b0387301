//! The relation-to-reader view the catalog supplies after replay.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use strato_common::{Batch, TableId};

use crate::error::CatalogResult;
use crate::meta::{CatalogInfo, TableMeta};

/// Writes a batch payload to a block or segment file.
pub fn write_batch_file(path: impl AsRef<Path>, batch: &Batch) -> CatalogResult<()> {
    let file = fs::File::create(path)?;
    Ok(bincode::serialize_into(file, batch)?)
}

/// Reads a batch payload back from a block or segment file.
pub fn read_batch_file(path: impl AsRef<Path>) -> CatalogResult<Batch> {
    let file = fs::File::open(path)?;
    Ok(bincode::deserialize_from(file)?)
}

/// Snapshot of the replayed catalog plus the data files backing each
/// kept table, in read order (sorted segments first, then unsorted
/// blocks).
#[derive(Debug, Clone)]
pub struct CatalogStore {
    info: CatalogInfo,
    data: HashMap<u64, Vec<PathBuf>>,
}

impl CatalogStore {
    pub(crate) fn new(info: CatalogInfo, data: HashMap<u64, Vec<PathBuf>>) -> Self {
        Self { info, data }
    }

    /// Returns the replayed catalog.
    pub fn info(&self) -> &CatalogInfo {
        &self.info
    }

    /// Returns the table descriptor with the given name.
    pub fn table_by_name(&self, name: &str) -> Option<&TableMeta> {
        self.info.table_by_name(name)
    }

    /// Returns the data files of a table in read order.
    pub fn data_files(&self, table: TableId) -> &[PathBuf] {
        self.data
            .get(&table.as_u64())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Splits a table's data files into `n` disjoint partitions,
    /// round-robin. Partitions may be empty when files are scarce.
    pub fn partition(&self, table: TableId, n: usize) -> Vec<Vec<PathBuf>> {
        let mut parts: Vec<Vec<PathBuf>> = vec![Vec::new(); n];
        if n == 0 {
            return parts;
        }
        for (i, path) in self.data_files(table).iter().enumerate() {
            parts[i % n].push(path.clone());
        }
        parts
    }
}
