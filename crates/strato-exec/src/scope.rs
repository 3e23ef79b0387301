//! Scopes: composable execution units and the parallel rewrite.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use strato_common::{Batch, NodeId, StratoError, StratoResult};

use crate::engine::{Engine, Reader};
use crate::instruction::{Instruction, OpArg, OpCode};
use crate::pipeline::Pipeline;
use crate::plan::DdlPlan;
use crate::process::{CancelToken, Proc, WaitRegister};

/// Execution mode of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// A leaf: one reader or one constant batch through a pipeline.
    Normal,
    /// A parent: children feed a local merge pipeline.
    Merge,
    /// Dispatched to the node named by `NodeInfo`.
    Remote,
    /// Rewritten and fanned out across shards before running.
    Parallel,
}

/// Locality hint for remote dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Target node.
    pub id: NodeId,
    /// Target address; empty means local.
    pub addr: String,
}

impl NodeInfo {
    /// The local node.
    pub fn local() -> Self {
        Self {
            id: NodeId::LOCAL,
            addr: String::new(),
        }
    }
}

/// Where a scope's pipeline pulls its input from.
pub enum DataSource {
    /// An in-memory constant batch.
    Const(Batch),
    /// A relation, optionally with a shard reader already acquired.
    Table {
        /// Database name.
        schema_name: String,
        /// Relation name.
        relation_name: String,
        /// Input attribute list.
        attributes: Vec<String>,
        /// The shard cursor; present on leaves, absent before the
        /// parallel rewrite acquires shards.
        reader: Option<Box<dyn Reader>>,
    },
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Const(batch) => f
                .debug_struct("Const")
                .field("rows", &batch.num_rows())
                .finish(),
            DataSource::Table {
                schema_name,
                relation_name,
                reader,
                ..
            } => f
                .debug_struct("Table")
                .field("schema", schema_name)
                .field("relation", relation_name)
                .field("has_reader", &reader.is_some())
                .finish(),
        }
    }
}

/// A composable execution unit: a data source, a pipeline, and optional
/// child scopes.
pub struct Scope {
    /// Execution mode.
    pub magic: Magic,
    /// Input source; `None` for pure merge or DDL scopes.
    pub data_source: Option<DataSource>,
    /// The pipeline, in execution order.
    pub instructions: Vec<Instruction>,
    /// Child scopes whose outputs feed this one.
    pub pre_scopes: Vec<Scope>,
    /// Per-scope process context.
    pub proc: Proc,
    /// Locality hint for remote dispatch.
    pub node_info: NodeInfo,
    /// DDL descriptor, for DDL scopes.
    pub plan: Option<DdlPlan>,
}

impl Scope {
    /// Creates a scope with no source, pipeline, or children.
    pub fn new(magic: Magic, proc: Proc) -> Self {
        Self {
            magic,
            data_source: None,
            instructions: Vec::new(),
            pre_scopes: Vec::new(),
            proc,
            node_info: NodeInfo::local(),
            plan: None,
        }
    }

    /// The shard count used by the parallel rewrite.
    pub fn num_cpu(&self) -> usize {
        self.proc.parallelism
    }

    /// Dispatches on the scope's magic.
    pub fn execute(self, engine: Arc<dyn Engine>) -> BoxFuture<'static, StratoResult<u64>> {
        Box::pin(async move {
            match self.magic {
                Magic::Normal => self.run(engine).await,
                Magic::Merge => self.merge_run(engine).await,
                Magic::Remote => self.remote_run(engine).await,
                Magic::Parallel => self.parallel_run(engine).await,
            }
        })
    }

    /// Executes a leaf scope: a constant batch or a single reader
    /// through the pipeline. Returns once the pipeline drains or fails.
    pub async fn run(mut self, _engine: Arc<dyn Engine>) -> StratoResult<u64> {
        let instructions = std::mem::take(&mut self.instructions);
        match self.data_source.take() {
            Some(DataSource::Const(batch)) => {
                let mut pipeline = Pipeline::new(Vec::new(), instructions)?;
                pipeline.const_run(batch, &self.proc).await
            }
            Some(DataSource::Table {
                attributes,
                reader: Some(reader),
                ..
            }) => {
                let mut pipeline = Pipeline::new(attributes, instructions)?;
                pipeline.run(reader, &self.proc).await
            }
            _ => Err(StratoError::plan("scope has no runnable data source")),
        }
    }

    /// Spawns each child on a worker task, runs the local merge
    /// pipeline, then joins the workers.
    ///
    /// Worker results land in a completion channel whose capacity equals
    /// the worker count, so completion sends never block. The first
    /// non-nil error wins; cancellation is a clean shutdown for workers.
    /// A parent pipeline failure cancels the shared token so workers
    /// observe closed inboxes and unwind.
    pub async fn merge_run(mut self, engine: Arc<dyn Engine>) -> StratoResult<u64> {
        let children = std::mem::take(&mut self.pre_scopes);
        let worker_count = children.len();
        let (done_tx, mut done_rx) = mpsc::channel::<StratoResult<u64>>(worker_count.max(1));

        for child in children {
            let done_tx = done_tx.clone();
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let result = match child.execute(engine).await {
                    Err(e) if e.is_cancelled() => Ok(0),
                    other => other,
                };
                if let Err(ref e) = result {
                    debug!(error = %e, "scope worker failed");
                }
                let _ = done_tx.send(result).await;
            });
        }
        drop(done_tx);

        let instructions = std::mem::take(&mut self.instructions);
        let run_result = match Pipeline::new_merge(instructions) {
            Ok(mut pipeline) => pipeline.run_merge(&mut self.proc).await,
            Err(e) => Err(e),
        };
        if run_result.is_err() {
            self.proc.cancel.cancel();
        }

        // Drain every worker; keep the first real error.
        let mut worker_err = None;
        while let Some(result) = done_rx.recv().await {
            if let Err(e) = result {
                if worker_err.is_none() {
                    worker_err = Some(e);
                }
            }
        }

        match run_result {
            Err(e) => Err(e),
            Ok(rows) => match worker_err {
                Some(e) => Err(e),
                None => Ok(rows),
            },
        }
    }

    /// Runs the scope on the node named by its locality hint. A local
    /// target degenerates to [`Scope::parallel_run`]; shipping to
    /// another node needs the RPC layer, which this build does not
    /// carry.
    pub async fn remote_run(self, engine: Arc<dyn Engine>) -> StratoResult<u64> {
        if self.node_info.addr.is_empty() || self.node_info.id == engine.node_id() {
            return self.parallel_run(engine).await;
        }
        Err(StratoError::not_supported(format!(
            "remote scope dispatch to {}",
            self.node_info.addr
        )))
    }

    /// Rewrite-then-fan-out: acquires one reader per shard, splits the
    /// pipeline into per-shard and merge phases, wires sibling outputs
    /// to this scope's inboxes, and delegates to [`Scope::merge_run`].
    pub async fn parallel_run(mut self, engine: Arc<dyn Engine>) -> StratoResult<u64> {
        if self.instructions.is_empty() {
            return Err(StratoError::plan("cannot rewrite an empty pipeline"));
        }
        let mcpu = self.num_cpu();
        if mcpu == 0 {
            return Err(StratoError::execution("no shards: zero parallelism"));
        }
        let (schema_name, relation_name, attributes) = match &self.data_source {
            Some(DataSource::Table {
                schema_name,
                relation_name,
                attributes,
                ..
            }) => (
                schema_name.clone(),
                relation_name.clone(),
                attributes.clone(),
            ),
            _ => {
                return Err(StratoError::plan(
                    "parallel run requires a relation data source",
                ))
            }
        };

        let snapshot = self.proc.snapshot;
        let db = engine.database(&schema_name, snapshot).await?;
        let relation = db.relation(&relation_name, snapshot).await?;
        let readers = relation.new_readers(mcpu, snapshot)?;
        if readers.is_empty() {
            return Err(StratoError::execution("relation produced no readers"));
        }

        let mut siblings: Vec<Scope> = readers
            .into_iter()
            .map(|reader| {
                let mut sibling = Scope::new(Magic::Normal, self.proc.derive());
                sibling.data_source = Some(DataSource::Table {
                    schema_name: schema_name.clone(),
                    relation_name: relation_name.clone(),
                    attributes: attributes.clone(),
                    reader: Some(reader),
                });
                sibling
            })
            .collect();

        self.rewrite_for_merge(&mut siblings)?;
        self.wire_connectors(&mut siblings);
        debug!(
            shards = siblings.len(),
            relation = %relation_name,
            "parallel rewrite complete"
        );

        self.magic = Magic::Merge;
        self.pre_scopes = siblings;
        self.merge_run(engine).await
    }

    /// Splits the pipeline at the first order-sensitive instruction.
    ///
    /// Instructions before the split move to every sibling,
    /// deep-duplicated. At the split, each sibling gets the same opcode
    /// with the same arguments while the parent's prefix collapses into
    /// the equivalent merge operator. The remainder stays in the parent.
    /// With no split point, siblings drop the duplicated trailing sink
    /// and the parent becomes a two-instruction concatenate-and-forward
    /// pipeline.
    fn rewrite_for_merge(&mut self, siblings: &mut [Scope]) -> StratoResult<()> {
        let mut split: Option<(usize, Instruction)> = None;
        for (i, ins) in self.instructions.iter().enumerate() {
            if ins.op.is_order_sensitive() {
                split = Some((i, merge_form(ins)?));
                break;
            }
            for sibling in siblings.iter_mut() {
                sibling.instructions.push(ins.dup());
            }
        }

        match split {
            Some((i, merge_ins)) => {
                for sibling in siblings.iter_mut() {
                    sibling.instructions.push(self.instructions[i].dup());
                }
                let tail = self.instructions.split_off(i + 1);
                self.instructions.clear();
                self.instructions.push(merge_ins);
                self.instructions.extend(tail);
            }
            None => {
                // The sink ran in the parent; every sibling duplicated it
                // above and drops it again here.
                for sibling in siblings.iter_mut() {
                    sibling.instructions.pop();
                }
                let sink = self
                    .instructions
                    .pop()
                    .expect("pipeline verified non-empty");
                self.instructions.clear();
                self.instructions
                    .push(Instruction::new(OpCode::Merge, OpArg::Merge));
                self.instructions.push(sink);
            }
        }
        Ok(())
    }

    /// Allocates the tree's cancellation token and one wait register per
    /// sibling, appending the paired connector as each sibling's last
    /// instruction.
    fn wire_connectors(&mut self, siblings: &mut [Scope]) {
        let cancel = CancelToken::new();
        self.proc.cancel = cancel.clone();
        self.proc.merge_receivers.clear();

        for sibling in siblings.iter_mut() {
            let (tx, register) = WaitRegister::new(cancel.clone());
            self.proc.merge_receivers.push(register);
            sibling.proc.cancel = cancel.clone();
            sibling.instructions.push(Instruction::new(
                OpCode::Connector,
                OpArg::Connector {
                    tx,
                    cancel: cancel.clone(),
                },
            ));
        }
    }
}

/// The merge operator equivalent to an order-sensitive instruction,
/// configured from its arguments.
fn merge_form(ins: &Instruction) -> StratoResult<Instruction> {
    let mismatch = || StratoError::plan(format!("malformed argument for {:?}", ins.op));
    Ok(match (&ins.op, &ins.arg) {
        (OpCode::Top, OpArg::Top { fields, limit }) => Instruction::new(
            OpCode::MergeTop,
            OpArg::Top {
                fields: fields.clone(),
                limit: *limit,
            },
        ),
        (OpCode::Order, OpArg::Order { fields }) => Instruction::new(
            OpCode::MergeOrder,
            OpArg::Order {
                fields: fields.clone(),
            },
        ),
        (OpCode::Limit, OpArg::Limit { limit }) => {
            Instruction::new(OpCode::MergeLimit, OpArg::Limit { limit: *limit })
        }
        (OpCode::Offset, OpArg::Offset { offset }) => {
            Instruction::new(OpCode::MergeOffset, OpArg::Offset { offset: *offset })
        }
        (OpCode::Group, OpArg::Group { exprs, aggs }) => Instruction::new(
            OpCode::MergeGroup,
            OpArg::MergeGroup {
                exprs: exprs.clone(),
                aggs: aggs.clone(),
                need_eval: false,
            },
        ),
        _ => return Err(mismatch()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{BatchSink, SortField};

    fn top_ins(limit: usize) -> Instruction {
        Instruction::new(
            OpCode::Top,
            OpArg::Top {
                fields: vec![SortField::desc("a")],
                limit,
            },
        )
    }

    fn projection_ins() -> Instruction {
        Instruction::new(
            OpCode::Projection,
            OpArg::Projection {
                columns: vec!["a".into()],
            },
        )
    }

    fn output_ins() -> Instruction {
        Instruction::new(
            OpCode::Output,
            OpArg::Output {
                sink: BatchSink::new(),
            },
        )
    }

    fn scope_with(instructions: Vec<Instruction>) -> Scope {
        let mut scope = Scope::new(Magic::Normal, Proc::new().with_parallelism(4));
        scope.instructions = instructions;
        scope
    }

    fn siblings(n: usize, parent: &Scope) -> Vec<Scope> {
        (0..n)
            .map(|_| Scope::new(Magic::Normal, parent.proc.derive()))
            .collect()
    }

    #[test]
    fn test_rewrite_splits_at_first_order_sensitive_op() {
        let mut parent = scope_with(vec![projection_ins(), top_ins(3), output_ins()]);
        let mut shards = siblings(4, &parent);

        parent.rewrite_for_merge(&mut shards).unwrap();

        // Parent: merge form at position 0, remainder unchanged.
        assert_eq!(parent.instructions.len(), 2);
        assert_eq!(parent.instructions[0].op, OpCode::MergeTop);
        assert_eq!(parent.instructions[1].op, OpCode::Output);

        // Siblings: the pre-split prefix plus the same opcode with the
        // same arguments.
        for shard in &shards {
            assert_eq!(shard.instructions.len(), 2);
            assert_eq!(shard.instructions[0].op, OpCode::Projection);
            assert_eq!(shard.instructions[1].op, OpCode::Top);
            match &shard.instructions[1].arg {
                OpArg::Top { limit, fields } => {
                    assert_eq!(*limit, 3);
                    assert!(fields[0].descending);
                }
                other => panic!("unexpected arg {:?}", other),
            }
        }
    }

    #[test]
    fn test_rewrite_performs_exactly_one_split() {
        // Two order-sensitive ops: only the first is rewritten, the
        // second stays in the parent.
        let mut parent = scope_with(vec![
            top_ins(5),
            Instruction::new(OpCode::Limit, OpArg::Limit { limit: 2 }),
            output_ins(),
        ]);
        let mut shards = siblings(2, &parent);

        parent.rewrite_for_merge(&mut shards).unwrap();

        assert_eq!(parent.instructions[0].op, OpCode::MergeTop);
        assert_eq!(parent.instructions[1].op, OpCode::Limit);
        assert_eq!(parent.instructions[2].op, OpCode::Output);
        for shard in &shards {
            assert_eq!(shard.instructions.len(), 1);
            assert_eq!(shard.instructions[0].op, OpCode::Top);
        }
    }

    #[test]
    fn test_rewrite_without_split_point() {
        let mut parent = scope_with(vec![projection_ins(), output_ins()]);
        let mut shards = siblings(3, &parent);

        parent.rewrite_for_merge(&mut shards).unwrap();

        // Parent collapses to {Merge, sink}.
        assert_eq!(parent.instructions.len(), 2);
        assert_eq!(parent.instructions[0].op, OpCode::Merge);
        assert_eq!(parent.instructions[1].op, OpCode::Output);

        // Siblings lost the duplicated trailing sink.
        for shard in &shards {
            assert_eq!(shard.instructions.len(), 1);
            assert_eq!(shard.instructions[0].op, OpCode::Projection);
        }
    }

    #[test]
    fn test_wiring_invariants() {
        let mut parent = scope_with(vec![top_ins(3), output_ins()]);
        let mut shards = siblings(4, &parent);
        parent.rewrite_for_merge(&mut shards).unwrap();
        parent.wire_connectors(&mut shards);

        // One inbox per sibling.
        assert_eq!(parent.proc.merge_receivers.len(), shards.len());

        // Every sibling ends in a connector.
        for shard in &shards {
            let last = shard.instructions.last().unwrap();
            assert_eq!(last.op, OpCode::Connector);
        }
    }

    #[tokio::test]
    async fn test_connector_receiver_bijection() {
        use strato_common::{Column, DataType, Field, Schema};

        let mut parent = scope_with(vec![projection_ins(), output_ins()]);
        let mut shards = siblings(3, &parent);
        parent.rewrite_for_merge(&mut shards).unwrap();
        parent.wire_connectors(&mut shards);

        let schema =
            std::sync::Arc::new(Schema::new(vec![Field::not_null("i", DataType::Int64)]));

        // Send a distinct marker through each sibling's connector; each
        // parent inbox must yield exactly its sibling's marker.
        for (i, shard) in shards.iter().enumerate() {
            match &shard.instructions.last().unwrap().arg {
                OpArg::Connector { tx, .. } => {
                    let batch =
                        Batch::new(schema.clone(), vec![Column::int64(vec![i as i64])]).unwrap();
                    tx.send(batch).await.unwrap();
                }
                other => panic!("unexpected arg {:?}", other),
            }
        }
        for (i, register) in parent.proc.merge_receivers.iter_mut().enumerate() {
            let batch = register.recv().await.unwrap();
            assert_eq!(
                batch.column(0).unwrap().get(0).to_i64(),
                Some(i as i64)
            );
        }
    }

    #[test]
    fn test_merge_form_of_each_split_op() {
        let cases = vec![
            (top_ins(1), OpCode::MergeTop),
            (
                Instruction::new(
                    OpCode::Order,
                    OpArg::Order {
                        fields: vec![SortField::asc("a")],
                    },
                ),
                OpCode::MergeOrder,
            ),
            (
                Instruction::new(OpCode::Limit, OpArg::Limit { limit: 1 }),
                OpCode::MergeLimit,
            ),
            (
                Instruction::new(OpCode::Offset, OpArg::Offset { offset: 1 }),
                OpCode::MergeOffset,
            ),
            (
                Instruction::new(
                    OpCode::Group,
                    OpArg::Group {
                        exprs: vec!["a".into()],
                        aggs: vec![],
                    },
                ),
                OpCode::MergeGroup,
            ),
        ];
        for (ins, want) in cases {
            assert_eq!(merge_form(&ins).unwrap().op, want);
        }
    }

    #[test]
    fn test_merge_form_arg_mismatch() {
        let ins = Instruction::new(OpCode::Top, OpArg::Limit { limit: 1 });
        assert!(matches!(merge_form(&ins), Err(StratoError::Plan { .. })));

        // MergeGroup of a rewrite always combines partials.
        let ins = Instruction::new(
            OpCode::Group,
            OpArg::Group {
                exprs: vec![],
                aggs: vec![],
            },
        );
        match merge_form(&ins).unwrap().arg {
            OpArg::MergeGroup { need_eval, .. } => assert!(!need_eval),
            other => panic!("unexpected arg {:?}", other),
        }
    }
}
