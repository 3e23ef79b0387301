//! # strato-common
//!
//! Common types, errors, and constants for StratoDB.
//!
//! This crate provides the foundational pieces shared across all StratoDB
//! components:
//!
//! - **Types**: identifiers (`TableId`, `SegmentId`, `Version`, ...), the
//!   columnar [`types::Batch`] / [`types::Column`] / [`types::Value`] model,
//!   and schema descriptors
//! - **Errors**: the unified [`StratoError`] with the [`StratoResult`] alias
//! - **Constants**: system-wide sizing constants

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod types;

pub use error::{StratoError, StratoResult};
pub use types::{
    Batch, BlockId, Column, ColumnType, DataType, Field, NodeId, Schema, SegmentId, SnapshotId,
    TableId, Timestamp, Value, Version,
};
