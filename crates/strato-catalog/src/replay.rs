//! Startup replay: scan, index, reconstruct, and collect garbage.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use strato_common::{SegmentId, TableId, Timestamp};

use crate::error::CatalogResult;
use crate::meta::{CatalogInfo, TableMeta};
use crate::names::{self, FileKind};
use crate::store::CatalogStore;
use crate::version::VersionList;

/// On-disk files backing one sorted segment.
#[derive(Debug, Clone)]
pub(crate) struct SortedSegmentFile {
    pub(crate) path: PathBuf,
}

/// On-disk block files backing one unsorted segment.
#[derive(Debug, Clone)]
pub(crate) struct UnsortedSegmentFile {
    pub(crate) blocks: Vec<(u64, PathBuf)>,
}

impl UnsortedSegmentFile {
    fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    fn add_block(&mut self, block: u64, path: PathBuf) {
        self.blocks.push((block, path));
    }
}

/// Data files of one table, bucketed by segment.
#[derive(Debug, Clone, Default)]
pub(crate) struct TableDataFiles {
    pub(crate) sorted: HashMap<u64, SortedSegmentFile>,
    pub(crate) unsorted: HashMap<u64, UnsortedSegmentFile>,
}

impl TableDataFiles {
    fn clean(&self) {
        for file in self.sorted.values() {
            remove_file(&file.path);
        }
        for file in self.unsorted.values() {
            for (_, path) in &file.blocks {
                remove_file(path);
            }
        }
    }
}

/// Replay handle over a working directory.
///
/// Construction scans `W/meta` and `W/data` and indexes every persisted
/// artifact by kind and version. [`MetaHandle::rebuild_info`] then
/// reconstructs the in-memory catalog from the newest checkpoints, and
/// [`MetaHandle::cleanup`] deletes everything stale.
///
/// The handle is single-threaded by design: constructed, consulted, and
/// cleaned up on the startup task, never shared.
pub struct MetaHandle {
    #[allow(dead_code)]
    work_dir: PathBuf,
    meta_dir: PathBuf,
    data_dir: PathBuf,
    tables: HashMap<u64, VersionList<PathBuf>>,
    infos: VersionList<PathBuf>,
    files: HashMap<u64, TableDataFiles>,
    others: Vec<PathBuf>,
    kept: HashSet<u64>,
    cleanables: Vec<TableDataFiles>,
}

impl MetaHandle {
    /// Scans the working directory and indexes every artifact.
    ///
    /// `W/meta` and `W/data` are created if absent; a freshly-created
    /// `W/meta` declares the store empty and skips the scan.
    ///
    /// # Panics
    ///
    /// Panics on duplicate checkpoint versions or duplicate sorted
    /// segment files - these are logic errors indicating corruption.
    pub fn new(work_dir: impl AsRef<Path>) -> CatalogResult<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();
        let meta_dir = work_dir.join("meta");
        let data_dir = work_dir.join("data");

        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        let empty = !meta_dir.exists();
        if empty {
            fs::create_dir_all(&meta_dir)?;
        }

        let mut handle = Self {
            work_dir,
            meta_dir,
            data_dir,
            tables: HashMap::new(),
            infos: VersionList::new(),
            files: HashMap::new(),
            others: Vec::new(),
            kept: HashSet::new(),
            cleanables: Vec::new(),
        };

        if empty {
            return Ok(handle);
        }

        for entry in fs::read_dir(&handle.meta_dir)? {
            let path = entry?.path();
            handle.add_meta_file(path);
        }
        for entry in fs::read_dir(&handle.data_dir)? {
            let path = entry?.path();
            handle.add_data_file(path);
        }

        Ok(handle)
    }

    fn add_meta_file(&mut self, path: PathBuf) {
        match names::classify(&path) {
            FileKind::TableCkp(table, version) => {
                self.tables
                    .entry(table.as_u64())
                    .or_default()
                    .insert(version, path);
            }
            FileKind::InfoCkp(version) => {
                self.infos.insert(version, path);
            }
            _ => self.others.push(path),
        }
    }

    fn add_data_file(&mut self, path: PathBuf) {
        match names::classify(&path) {
            FileKind::Block(table, segment, block) => {
                self.files
                    .entry(table.as_u64())
                    .or_default()
                    .unsorted
                    .entry(segment.as_u64())
                    .or_insert_with(UnsortedSegmentFile::new)
                    .add_block(block.as_u64(), path);
            }
            FileKind::Segment(table, segment) => {
                let bucket = self.files.entry(table.as_u64()).or_default();
                if bucket
                    .sorted
                    .insert(segment.as_u64(), SortedSegmentFile { path })
                    .is_some()
                {
                    panic!(
                        "logic error: duplicate sorted segment {}/{}",
                        table, segment
                    );
                }
            }
            _ => self.others.push(path),
        }
    }

    /// Reconstructs the catalog from the newest checkpoints.
    ///
    /// For each still-undeleted table in the newest info checkpoint, the
    /// newest table checkpoint is read once, replayed, reconciled against
    /// the on-disk data files, and marked kept. Tables deleted at replay
    /// time defer their data files for cleanup.
    ///
    /// # Panics
    ///
    /// Panics if a checkpoint payload cannot be decoded.
    pub fn rebuild_info(&mut self) -> CatalogInfo {
        let Some((_, newest)) = self.infos.newest() else {
            return CatalogInfo::new();
        };

        let file = fs::File::open(newest)
            .unwrap_or_else(|e| panic!("logic error: open {}: {}", newest.display(), e));
        let mut info = CatalogInfo::read_from(file)
            .unwrap_or_else(|e| panic!("logic error: read info checkpoint: {}", e));

        let ts = Timestamp::now();
        let mut tables = HashMap::new();
        for (idx, table) in std::mem::take(&mut info.tables) {
            if table.is_deleted(ts) {
                if let Some(files) = self.files.remove(&table.id.as_u64()) {
                    self.cleanables.push(files);
                }
                continue;
            }
            if let Some(rebuilt) = self.rebuild_table(&table) {
                tables.insert(idx, rebuilt);
            }
        }
        info.tables = tables;
        info!(
            tables = info.tables.len(),
            version = info.version.as_u64(),
            "catalog rebuilt"
        );
        info
    }

    /// Reads and reconciles the newest checkpoint of one table.
    fn rebuild_table(&mut self, table: &TableMeta) -> Option<TableMeta> {
        let list = self.tables.get(&table.id.as_u64())?;
        let (_, path) = list.newest()?;

        let file = fs::File::open(path)
            .unwrap_or_else(|e| panic!("logic error: open {}: {}", path.display(), e));
        let mut rebuilt = TableMeta::read_from(file)
            .unwrap_or_else(|e| panic!("logic error: read table checkpoint: {}", e));

        self.kept.insert(table.id.as_u64());
        rebuilt.replay();
        self.correct_table(&mut rebuilt);
        Some(rebuilt)
    }

    /// Reconciles a table's catalog state with the on-disk data files.
    ///
    /// Segments are walked newest to oldest, stopping at the first one
    /// already marked sorted. A segment still tagged unsorted in the
    /// catalog but backed by a sorted file on disk is promoted. Unsorted
    /// segments backed only by block files need no correction; the blocks
    /// already indexed are the source of truth.
    fn correct_table(&mut self, meta: &mut TableMeta) {
        let Some(files) = self.files.get(&meta.id.as_u64()) else {
            return;
        };
        for segment in meta.segments.iter_mut().rev() {
            if segment.is_sorted() {
                break;
            }
            if files.sorted.contains_key(&segment.id.as_u64()) {
                segment.try_sorted();
            }
        }
    }

    /// Post-replay housekeeping.
    ///
    /// Deletes the newest checkpoint of every table not kept, every
    /// non-newest checkpoint unconditionally, every non-newest info
    /// checkpoint, every deferred cleanable, and every unclassified file.
    pub fn cleanup(&mut self) {
        for (tid, mut list) in std::mem::take(&mut self.tables) {
            if !self.kept.contains(&tid) {
                for (_, path) in list.drain() {
                    remove_file(&path);
                }
                continue;
            }
            for (_, path) in list.split_off_stale() {
                remove_file(&path);
            }
        }

        for (_, path) in self.infos.split_off_stale() {
            remove_file(&path);
        }

        for cleanable in std::mem::take(&mut self.cleanables) {
            cleanable.clean();
        }

        for path in std::mem::take(&mut self.others) {
            remove_file(&path);
        }

        self.files.clear();
    }

    /// Retention variant of cleanup: keeps the newest `max_ver` entries
    /// of every version list and deletes the tail.
    ///
    /// # Panics
    ///
    /// Panics if `max_ver <= 1`.
    pub fn cleanup_with_retention(&mut self, max_ver: usize) {
        if max_ver <= 1 {
            panic!("logic error: retention must keep more than one version");
        }
        for list in self.tables.values_mut() {
            for (_, path) in list.split_off_tail(max_ver) {
                remove_file(&path);
            }
        }
        for (_, path) in self.infos.split_off_tail(max_ver) {
            remove_file(&path);
        }
    }

    /// Snapshots the relation-to-reader view for the kept tables.
    pub fn build_store(&self, info: CatalogInfo) -> CatalogStore {
        let mut data = HashMap::new();
        for tid in &self.kept {
            let Some(files) = self.files.get(tid) else {
                data.insert(*tid, Vec::new());
                continue;
            };
            let mut paths = Vec::new();

            let mut sorted_segments: Vec<_> = files.sorted.iter().collect();
            sorted_segments.sort_by_key(|(seg, _)| **seg);
            for (_, file) in sorted_segments {
                paths.push(file.path.clone());
            }

            let mut unsorted_segments: Vec<_> = files.unsorted.iter().collect();
            unsorted_segments.sort_by_key(|(seg, _)| **seg);
            for (_, file) in unsorted_segments {
                let mut blocks = file.blocks.clone();
                blocks.sort_by_key(|(block, _)| *block);
                for (_, path) in blocks {
                    paths.push(path);
                }
            }
            data.insert(*tid, paths);
        }
        CatalogStore::new(info, data)
    }

    /// Returns the meta directory.
    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    /// Returns the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Versions indexed for a table, newest first.
    pub fn table_versions(&self, table: TableId) -> Vec<strato_common::Version> {
        self.tables
            .get(&table.as_u64())
            .map(|l| l.versions())
            .unwrap_or_default()
    }

    /// Info checkpoint versions, newest first.
    pub fn info_versions(&self) -> Vec<strato_common::Version> {
        self.infos.versions()
    }

    /// Unclassified files awaiting deletion.
    pub fn others(&self) -> &[PathBuf] {
        &self.others
    }

    /// Table ids whose newest checkpoint was reloaded.
    pub fn kept(&self) -> &HashSet<u64> {
        &self.kept
    }

    /// Block paths indexed for an unsorted segment, in scan order.
    pub fn unsorted_blocks(&self, table: TableId, segment: SegmentId) -> Vec<PathBuf> {
        self.files
            .get(&table.as_u64())
            .and_then(|f| f.unsorted.get(&segment.as_u64()))
            .map(|u| u.blocks.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(file = %path.display(), "removed"),
        Err(e) => info!(file = %path.display(), error = %e, "remove failed"),
    }
}
