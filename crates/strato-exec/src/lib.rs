//! # strato-exec
//!
//! The parallel planner-runtime and vectorized pipelines of StratoDB.
//!
//! A [`Scope`] is a composable execution unit: a data source, a linear
//! [`Pipeline`] of column-batch operators, and optional child scopes.
//! [`Scope::parallel_run`] rewrites a scope's pipeline into a two-phase
//! per-shard + merge form, fans the shards out across worker tasks, and
//! wires their outputs to the parent through bounded wait registers.
//!
//! The engine contracts consumed by scopes live in [`engine`], with an
//! in-memory implementation and a thin adapter over the replayed
//! on-disk catalog.

#![warn(clippy::all)]

pub mod aggregate;
pub mod ddl;
pub mod engine;
pub mod instruction;
pub mod operators;
pub mod pipeline;
pub mod plan;
pub mod process;
pub mod scope;

pub use instruction::{AggFunc, AggSpec, BatchSink, Instruction, OpArg, OpCode, SortField};
pub use pipeline::Pipeline;
pub use process::{CancelToken, MemTracker, Proc, WaitRegister};
pub use scope::{DataSource, Magic, NodeInfo, Scope};
