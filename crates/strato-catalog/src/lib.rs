//! # strato-catalog
//!
//! Startup replay and garbage collection for StratoDB's on-disk catalog.
//!
//! On construction, [`MetaHandle`] scans a working directory, indexes
//! every persisted artifact by kind and version, reconstructs the
//! in-memory catalog state from the newest checkpoints, and deletes
//! stale files. The surviving state is exposed as a [`CatalogStore`],
//! which supplies the relation-to-reader view the execution engine
//! consumes.
//!
//! Replay logic errors (duplicate versions, impossible states) are fatal
//! panics: they indicate on-disk corruption that the reader cannot
//! repair.

#![warn(clippy::all)]

mod error;
mod meta;
pub mod names;
mod replay;
mod store;
mod version;

pub use error::{CatalogError, CatalogResult};
pub use meta::{CatalogInfo, DataState, SegmentMeta, TableMeta};
pub use names::FileKind;
pub use replay::MetaHandle;
pub use store::{read_batch_file, write_batch_file, CatalogStore};
pub use version::VersionList;
