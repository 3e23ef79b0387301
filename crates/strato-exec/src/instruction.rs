//! Operator instructions: the opcode set and their tagged arguments.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use strato_common::Batch;

use crate::process::CancelToken;

/// The closed set of operator opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Per-shard top-k under an ordering.
    Top,
    /// Full sort under an ordering.
    Order,
    /// Row-count cap.
    Limit,
    /// Row-count skip.
    Offset,
    /// Hash aggregation over grouping expressions.
    Group,
    /// Inner join. Lowering is not implemented at this layer.
    Join,
    /// Left outer join. Lowering is not implemented at this layer.
    Left,
    /// Anti join. Lowering is not implemented at this layer.
    Complement,
    /// Column selection by name.
    Projection,
    /// Arrival-order concatenation of shard outputs.
    Merge,
    /// Second phase of a rewritten `Top`.
    MergeTop,
    /// Second phase of a rewritten `Order` - a k-way merge of per-shard
    /// sorted streams.
    MergeOrder,
    /// Second phase of a rewritten `Limit`; cancels the scope tree once
    /// satisfied.
    MergeLimit,
    /// Second phase of a rewritten `Offset`.
    MergeOffset,
    /// Second phase of a rewritten `Group` - combines partial aggregate
    /// states.
    MergeGroup,
    /// Terminal sibling operator forwarding batches to a parent inbox.
    Connector,
    /// Terminal sink.
    Output,
}

impl OpCode {
    /// Returns true for opcodes whose semantics are order-sensitive
    /// across shards - the split points of the parallel rewrite.
    pub fn is_order_sensitive(self) -> bool {
        matches!(
            self,
            OpCode::Top | OpCode::Order | OpCode::Limit | OpCode::Offset | OpCode::Group
        )
    }
}

/// One ordering expression: a column and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Column name.
    pub column: String,
    /// True for descending order.
    pub descending: bool,
}

impl SortField {
    /// Ascending sort on a column.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Descending sort on a column.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Aggregation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    /// Row count.
    Count,
    /// Sum of non-null values.
    Sum,
    /// Minimum non-null value.
    Min,
    /// Maximum non-null value.
    Max,
    /// Mean of non-null values.
    Avg,
}

/// One aggregate in a grouping instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggSpec {
    /// The function.
    pub func: AggFunc,
    /// Input column; `None` counts rows (`COUNT(*)`).
    pub input: Option<String>,
    /// Output column name.
    pub output: String,
}

impl AggSpec {
    /// Creates an aggregate spec.
    pub fn new(func: AggFunc, input: Option<&str>, output: impl Into<String>) -> Self {
        Self {
            func,
            input: input.map(|s| s.to_string()),
            output: output.into(),
        }
    }
}

/// A shared collector for terminal output batches.
///
/// The sink is cheap to clone; the caller keeps one clone and drains it
/// after the scope tree completes.
#[derive(Clone, Default)]
pub struct BatchSink {
    inner: Arc<Mutex<Vec<Batch>>>,
}

impl BatchSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch.
    pub fn push(&self, batch: Batch) {
        self.inner.lock().push(batch);
    }

    /// Drains the collected batches.
    pub fn take(&self) -> Vec<Batch> {
        std::mem::take(&mut self.inner.lock())
    }

    /// Total rows collected so far.
    pub fn total_rows(&self) -> usize {
        self.inner.lock().iter().map(Batch::num_rows).sum()
    }
}

impl std::fmt::Debug for BatchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSink")
            .field("batches", &self.inner.lock().len())
            .finish()
    }
}

/// The tagged argument of an instruction; the case is determined by the
/// opcode. A mismatch between opcode and argument surfaces as a `Plan`
/// error when the pipeline is built.
#[derive(Debug, Clone)]
pub enum OpArg {
    /// `Top` / `MergeTop` argument.
    Top {
        /// Ordering expressions.
        fields: Vec<SortField>,
        /// Row cap.
        limit: usize,
    },
    /// `Order` / `MergeOrder` argument.
    Order {
        /// Ordering expressions.
        fields: Vec<SortField>,
    },
    /// `Limit` / `MergeLimit` argument.
    Limit {
        /// Row cap.
        limit: usize,
    },
    /// `Offset` / `MergeOffset` argument.
    Offset {
        /// Rows to discard.
        offset: usize,
    },
    /// `Group` argument.
    Group {
        /// Grouping columns.
        exprs: Vec<String>,
        /// Aggregates.
        aggs: Vec<AggSpec>,
    },
    /// `MergeGroup` argument. `need_eval` is false when the inputs are
    /// pre-aggregated partial states from per-shard groups.
    MergeGroup {
        /// Grouping columns.
        exprs: Vec<String>,
        /// Aggregates.
        aggs: Vec<AggSpec>,
        /// Whether raw rows must still be aggregated.
        need_eval: bool,
    },
    /// `Projection` argument.
    Projection {
        /// Columns to keep, in order.
        columns: Vec<String>,
    },
    /// `Merge` argument.
    Merge,
    /// `Connector` argument: the producer half of a parent inbox.
    Connector {
        /// Batch sender with capacity 1.
        tx: mpsc::Sender<Batch>,
        /// The scope tree's cancellation token.
        cancel: CancelToken,
    },
    /// `Output` argument.
    Output {
        /// Destination sink.
        sink: BatchSink,
    },
    /// Placeholder for opcodes without a lowering at this layer.
    None,
}

/// A single operator instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The opcode.
    pub op: OpCode,
    /// The opcode's argument.
    pub arg: OpArg,
}

impl Instruction {
    /// Creates an instruction.
    pub fn new(op: OpCode, arg: OpArg) -> Self {
        Self { op, arg }
    }

    /// Deep-duplicates the instruction so each sibling owns independent
    /// mutable argument state. Channel ends and sinks stay shared by
    /// handle - they are the wiring, not operator state.
    pub fn dup(&self) -> Instruction {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_sensitive_set() {
        for op in [
            OpCode::Top,
            OpCode::Order,
            OpCode::Limit,
            OpCode::Offset,
            OpCode::Group,
        ] {
            assert!(op.is_order_sensitive());
        }
        for op in [
            OpCode::Projection,
            OpCode::Merge,
            OpCode::MergeTop,
            OpCode::Connector,
            OpCode::Output,
        ] {
            assert!(!op.is_order_sensitive());
        }
    }

    #[test]
    fn test_dup_is_independent() {
        let ins = Instruction::new(
            OpCode::Top,
            OpArg::Top {
                fields: vec![SortField::desc("a")],
                limit: 3,
            },
        );
        let mut copy = ins.dup();
        if let OpArg::Top { limit, .. } = &mut copy.arg {
            *limit = 99;
        }
        match ins.arg {
            OpArg::Top { limit, .. } => assert_eq!(limit, 3),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_batch_sink() {
        use std::sync::Arc;
        let sink = BatchSink::new();
        let schema = Arc::new(strato_common::Schema::default());
        sink.push(Batch::empty(schema.clone()));
        sink.push(Batch::empty(schema));
        assert_eq!(sink.take().len(), 2);
        assert!(sink.take().is_empty());
    }
}
