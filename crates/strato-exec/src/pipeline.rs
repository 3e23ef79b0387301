//! Linear chains of column-batch operators.

use futures::stream::SelectAll;
use futures::StreamExt;

use strato_common::{Batch, StratoError, StratoResult};

use crate::engine::Reader;
use crate::instruction::{Instruction, OpArg, OpCode};
use crate::operators::{
    ConnectorOp, GroupOp, LimitOp, MergeGroupOp, MergeOp, MergeOrderOp, OffsetOp, Operator,
    OrderOp, OutputOp, ProjectionOp, TopOp,
};
use crate::process::Proc;

/// A linear chain of operators over an input attribute list.
pub struct Pipeline {
    #[allow(dead_code)]
    attrs: Vec<String>,
    ops: Vec<Box<dyn Operator>>,
}

fn arg_mismatch(op: OpCode) -> StratoError {
    StratoError::plan(format!("malformed argument for {:?}", op))
}

fn build_op(ins: Instruction) -> StratoResult<Box<dyn Operator>> {
    let Instruction { op, arg } = ins;
    Ok(match (op, arg) {
        (OpCode::Top, OpArg::Top { fields, limit }) => Box::new(TopOp::new(fields, limit)),
        (OpCode::MergeTop, OpArg::Top { fields, limit }) => Box::new(TopOp::merge(fields, limit)),
        (OpCode::Order, OpArg::Order { fields }) => Box::new(OrderOp::new(fields)),
        (OpCode::MergeOrder, OpArg::Order { fields }) => Box::new(MergeOrderOp::new(fields)),
        (OpCode::Limit, OpArg::Limit { limit }) => Box::new(LimitOp::new(limit)),
        (OpCode::MergeLimit, OpArg::Limit { limit }) => Box::new(LimitOp::merge(limit)),
        (OpCode::Offset, OpArg::Offset { offset }) => Box::new(OffsetOp::new(offset)),
        (OpCode::MergeOffset, OpArg::Offset { offset }) => Box::new(OffsetOp::merge(offset)),
        (OpCode::Group, OpArg::Group { exprs, aggs }) => Box::new(GroupOp::new(exprs, aggs)),
        (
            OpCode::MergeGroup,
            OpArg::MergeGroup {
                exprs,
                aggs,
                need_eval,
            },
        ) => Box::new(MergeGroupOp::new(exprs, aggs, need_eval)),
        (OpCode::Projection, OpArg::Projection { columns }) => Box::new(ProjectionOp::new(columns)),
        (OpCode::Merge, OpArg::Merge) => Box::new(MergeOp),
        (OpCode::Connector, OpArg::Connector { tx, cancel }) => {
            Box::new(ConnectorOp::new(tx, cancel))
        }
        (OpCode::Output, OpArg::Output { sink }) => Box::new(OutputOp::new(sink)),
        (op @ (OpCode::Join | OpCode::Left | OpCode::Complement), _) => {
            return Err(StratoError::plan(format!(
                "{:?} has no lowering at this layer",
                op
            )))
        }
        (op, _) => return Err(arg_mismatch(op)),
    })
}

impl Pipeline {
    /// Builds a pipeline over an attribute list.
    pub fn new(attrs: Vec<String>, instructions: Vec<Instruction>) -> StratoResult<Pipeline> {
        if instructions.is_empty() {
            return Err(StratoError::plan("empty pipeline"));
        }
        let ops = instructions
            .into_iter()
            .map(build_op)
            .collect::<StratoResult<Vec<_>>>()?;
        Ok(Pipeline { attrs, ops })
    }

    /// Builds a merge pipeline; its input comes from the process inboxes
    /// rather than a reader.
    pub fn new_merge(instructions: Vec<Instruction>) -> StratoResult<Pipeline> {
        Pipeline::new(Vec::new(), instructions)
    }

    /// Runs the pipeline over a reader until end-of-stream or halt.
    /// Returns the number of rows delivered to the terminal operator.
    pub async fn run(&mut self, mut reader: Box<dyn Reader>, proc: &Proc) -> StratoResult<u64> {
        self.open(proc)?;
        let mut sink_rows = 0u64;
        loop {
            if proc.cancel.is_cancelled() {
                return Err(StratoError::Cancelled);
            }
            let Some(batch) = reader.read().await? else {
                break;
            };
            if batch.is_empty() {
                continue;
            }
            let (rows, halted) = self.dispatch(batch, proc).await?;
            sink_rows += rows;
            if halted {
                break;
            }
        }
        sink_rows += self.finish(proc).await?;
        Ok(sink_rows)
    }

    /// Single-shot variant: pushes exactly one batch.
    pub async fn const_run(&mut self, batch: Batch, proc: &Proc) -> StratoResult<u64> {
        self.open(proc)?;
        let mut sink_rows = 0u64;
        if !batch.is_empty() {
            let (rows, _) = self.dispatch(batch, proc).await?;
            sink_rows += rows;
        }
        sink_rows += self.finish(proc).await?;
        Ok(sink_rows)
    }

    /// Runs a merge pipeline over the process inboxes until every inbox
    /// closes, the head operator halts, or the tree cancels.
    ///
    /// Batches from siblings are consumed in arrival order; any total
    /// order is imposed by the head merge operator.
    pub async fn run_merge(&mut self, proc: &mut Proc) -> StratoResult<u64> {
        self.open(proc)?;
        let receivers = std::mem::take(&mut proc.merge_receivers);
        let mut inboxes: SelectAll<_> = receivers.into_iter().collect();
        let proc = &*proc;

        let mut sink_rows = 0u64;
        loop {
            let Some(batch) = inboxes.next().await else {
                break;
            };
            if batch.is_empty() {
                continue;
            }
            let (rows, halted) = self.dispatch(batch, proc).await?;
            sink_rows += rows;
            if halted {
                break;
            }
        }
        // Dropping the inboxes closes them; blocked producers unwind.
        drop(inboxes);
        sink_rows += self.finish(proc).await?;
        Ok(sink_rows)
    }

    fn open(&mut self, proc: &Proc) -> StratoResult<()> {
        for op in &mut self.ops {
            op.open(proc)?;
        }
        Ok(())
    }

    /// Pushes one batch through the chain. Returns the rows delivered to
    /// the terminal operator and whether any operator halted.
    async fn dispatch(&mut self, batch: Batch, proc: &Proc) -> StratoResult<(u64, bool)> {
        self.feed(0, batch, proc).await
    }

    /// Feeds a batch into the chain starting at operator `start`.
    async fn feed(&mut self, start: usize, batch: Batch, proc: &Proc) -> StratoResult<(u64, bool)> {
        let mut current = vec![batch];
        let mut sink_rows = 0u64;
        let mut halted = false;
        let last = self.ops.len() - 1;

        for i in start..self.ops.len() {
            if current.is_empty() {
                break;
            }
            let mut produced = Vec::new();
            for batch in current {
                if batch.is_empty() {
                    continue;
                }
                if i == last {
                    sink_rows += batch.num_rows() as u64;
                }
                let out = self.ops[i].push(batch, proc).await?;
                produced.extend(out.batches);
                halted |= out.halt;
            }
            current = produced;
        }
        Ok((sink_rows, halted))
    }

    /// Flushes every operator in order, feeding each one's output
    /// through the rest of the chain.
    async fn finish(&mut self, proc: &Proc) -> StratoResult<u64> {
        let mut sink_rows = 0u64;
        let last = self.ops.len() - 1;
        for i in 0..self.ops.len() {
            let out = self.ops[i].flush(proc).await?;
            for batch in out.batches {
                if batch.is_empty() {
                    continue;
                }
                if i == last {
                    sink_rows += batch.num_rows() as u64;
                    continue;
                }
                let (rows, _) = self.feed(i + 1, batch, proc).await?;
                sink_rows += rows;
            }
        }
        Ok(sink_rows)
    }
}
