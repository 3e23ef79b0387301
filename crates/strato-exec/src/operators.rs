//! Operator implementations.
//!
//! Operators consume and produce column batches in a push model: each
//! batch flows through [`Operator::push`], and buffering operators emit
//! their output from [`Operator::flush`] once the input drains. A halt
//! signal short-circuits the pipeline (limits).

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use strato_common::{Batch, Column, Field, Schema, StratoError, StratoResult, Value};

use crate::aggregate::{new_aggregate, Aggregate};
use crate::instruction::{AggSpec, BatchSink, SortField};
use crate::process::{CancelToken, Proc};

/// What an operator produced for one push or flush.
#[derive(Debug, Default)]
pub struct OpOutput {
    /// Batches to feed downstream.
    pub batches: Vec<Batch>,
    /// True once the operator will never accept more input; the
    /// pipeline stops pulling.
    pub halt: bool,
}

impl OpOutput {
    /// Nothing produced.
    pub fn none() -> Self {
        Self::default()
    }

    /// One batch produced.
    pub fn batch(batch: Batch) -> Self {
        Self {
            batches: vec![batch],
            halt: false,
        }
    }

    /// Batches produced with an optional halt.
    pub fn with_halt(batches: Vec<Batch>, halt: bool) -> Self {
        Self { batches, halt }
    }
}

/// A column-batch operator.
#[async_trait]
pub trait Operator: Send {
    /// Operator name for diagnostics.
    fn name(&self) -> &'static str;

    /// Called once before the first push.
    fn open(&mut self, _proc: &Proc) -> StratoResult<()> {
        Ok(())
    }

    /// Accepts one input batch.
    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput>;

    /// Drains buffered state once the input is exhausted.
    async fn flush(&mut self, proc: &Proc) -> StratoResult<OpOutput>;
}

// ============================================================================
// Sort machinery shared by Top / Order / their merge forms
// ============================================================================

/// A materialized sort key with per-field directions baked into its
/// ordering.
#[derive(Debug, Clone)]
struct OrdKey {
    values: Vec<Value>,
    dirs: Arc<[bool]>,
}

impl OrdKey {
    fn extract(batch: &Batch, row: usize, fields: &[usize], dirs: &Arc<[bool]>) -> OrdKey {
        let values = fields
            .iter()
            .map(|&col| batch.column(col).map(|c| c.get(row).clone()).unwrap_or(Value::Null))
            .collect();
        OrdKey {
            values,
            dirs: Arc::clone(dirs),
        }
    }
}

impl PartialEq for OrdKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for OrdKey {}

impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        for (i, (a, b)) in self.values.iter().zip(other.values.iter()).enumerate() {
            let ord = a.cmp(b);
            let ord = if self.dirs.get(i).copied().unwrap_or(false) {
                ord.reverse()
            } else {
                ord
            };
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        CmpOrdering::Equal
    }
}

fn resolve_sort_fields(
    schema: &Schema,
    fields: &[SortField],
) -> StratoResult<(Vec<usize>, Arc<[bool]>)> {
    let mut indices = Vec::with_capacity(fields.len());
    let mut dirs = Vec::with_capacity(fields.len());
    for field in fields {
        let idx = schema.index_of(&field.column).ok_or_else(|| {
            StratoError::plan(format!("sort column '{}' not found", field.column))
        })?;
        indices.push(idx);
        dirs.push(field.descending);
    }
    Ok((indices, dirs.into()))
}

fn rows_to_batch(schema: Arc<Schema>, rows: &[Vec<Value>]) -> StratoResult<Batch> {
    let mut columns: Vec<Column> = schema
        .fields()
        .iter()
        .map(|f| Column::empty(f.column_type))
        .collect();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            columns[i].push(value.clone());
        }
    }
    Batch::new(schema, columns)
}

// ============================================================================
// Projection
// ============================================================================

/// Selects columns by name, in order.
pub struct ProjectionOp {
    columns: Vec<String>,
}

impl ProjectionOp {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

#[async_trait]
impl Operator for ProjectionOp {
    fn name(&self) -> &'static str {
        "projection"
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        let indices = self
            .columns
            .iter()
            .map(|name| {
                batch
                    .schema()
                    .index_of(name)
                    .ok_or_else(|| StratoError::plan(format!("column '{}' not found", name)))
            })
            .collect::<StratoResult<Vec<_>>>()?;
        Ok(OpOutput::batch(batch.project(&indices)?))
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

// ============================================================================
// Top / MergeTop
// ============================================================================

struct HeapRow {
    key: OrdKey,
    seq: usize,
    row: Vec<Value>,
}

impl PartialEq for HeapRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapRow {}

impl PartialOrd for HeapRow {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapRow {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Ties break by arrival so the heap stays stable.
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

/// Keeps the first `limit` rows under the ordering; the heap root is the
/// worst row kept.
pub struct TopOp {
    name: &'static str,
    fields: Vec<SortField>,
    limit: usize,
    schema: Option<Arc<Schema>>,
    heap: BinaryHeap<HeapRow>,
    seq: usize,
}

impl TopOp {
    pub fn new(fields: Vec<SortField>, limit: usize) -> Self {
        Self::named("top", fields, limit)
    }

    pub fn merge(fields: Vec<SortField>, limit: usize) -> Self {
        Self::named("merge_top", fields, limit)
    }

    fn named(name: &'static str, fields: Vec<SortField>, limit: usize) -> Self {
        Self {
            name,
            fields,
            limit,
            schema: None,
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

#[async_trait]
impl Operator for TopOp {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        if self.limit == 0 {
            return Ok(OpOutput::none());
        }
        let (indices, dirs) = resolve_sort_fields(batch.schema(), &self.fields)?;
        self.schema.get_or_insert_with(|| batch.schema().clone());

        for row in 0..batch.num_rows() {
            let key = OrdKey::extract(&batch, row, &indices, &dirs);
            if self.heap.len() < self.limit {
                self.heap.push(HeapRow {
                    key,
                    seq: self.seq,
                    row: batch.row(row),
                });
                self.seq += 1;
                continue;
            }
            let beats_worst = self.heap.peek().is_some_and(|worst| key < worst.key);
            if beats_worst {
                self.heap.pop();
                self.heap.push(HeapRow {
                    key,
                    seq: self.seq,
                    row: batch.row(row),
                });
                self.seq += 1;
            }
        }
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        let Some(schema) = self.schema.take() else {
            return Ok(OpOutput::none());
        };
        let rows: Vec<Vec<Value>> = std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .map(|r| r.row)
            .collect();
        Ok(OpOutput::batch(rows_to_batch(schema, &rows)?))
    }
}

// ============================================================================
// Order
// ============================================================================

/// Buffers the full input, then emits one batch sorted under the
/// ordering. Buffered bytes are accounted against the scope's memory
/// budget.
pub struct OrderOp {
    fields: Vec<SortField>,
    buffered: Vec<Batch>,
    reserved: u64,
}

impl OrderOp {
    pub fn new(fields: Vec<SortField>) -> Self {
        Self {
            fields,
            buffered: Vec::new(),
            reserved: 0,
        }
    }
}

#[async_trait]
impl Operator for OrderOp {
    fn name(&self) -> &'static str {
        "order"
    }

    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput> {
        let bytes = batch.approx_bytes() as u64;
        proc.mem.try_reserve(bytes)?;
        self.reserved += bytes;
        self.buffered.push(batch);
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, proc: &Proc) -> StratoResult<OpOutput> {
        if self.buffered.is_empty() {
            return Ok(OpOutput::none());
        }
        let all = Batch::concat(&std::mem::take(&mut self.buffered))?;
        proc.mem.release(self.reserved);
        self.reserved = 0;

        let (fields, dirs) = resolve_sort_fields(all.schema(), &self.fields)?;
        let mut indices: Vec<usize> = (0..all.num_rows()).collect();
        indices.sort_by_cached_key(|&row| OrdKey::extract(&all, row, &fields, &dirs));
        Ok(OpOutput::batch(all.take(&indices)))
    }
}

// ============================================================================
// MergeOrder
// ============================================================================

/// K-way merge of per-shard sorted streams: every received batch is a
/// sorted run, and a min-heap over run cursors produces the total order.
pub struct MergeOrderOp {
    fields: Vec<SortField>,
    runs: Vec<Batch>,
    reserved: u64,
}

impl MergeOrderOp {
    pub fn new(fields: Vec<SortField>) -> Self {
        Self {
            fields,
            runs: Vec::new(),
            reserved: 0,
        }
    }
}

struct RunCursor {
    key: OrdKey,
    run: usize,
    row: usize,
}

impl PartialEq for RunCursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for RunCursor {}

impl PartialOrd for RunCursor {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunCursor {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, the merge needs the min.
        other
            .key
            .cmp(&self.key)
            .then(other.run.cmp(&self.run))
            .then(other.row.cmp(&self.row))
    }
}

#[async_trait]
impl Operator for MergeOrderOp {
    fn name(&self) -> &'static str {
        "merge_order"
    }

    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput> {
        let bytes = batch.approx_bytes() as u64;
        proc.mem.try_reserve(bytes)?;
        self.reserved += bytes;
        self.runs.push(batch);
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, proc: &Proc) -> StratoResult<OpOutput> {
        if self.runs.is_empty() {
            return Ok(OpOutput::none());
        }
        let runs = std::mem::take(&mut self.runs);
        let schema = runs[0].schema().clone();
        let (fields, dirs) = resolve_sort_fields(&schema, &self.fields)?;

        let mut heap = BinaryHeap::new();
        for (i, run) in runs.iter().enumerate() {
            if run.num_rows() > 0 {
                heap.push(RunCursor {
                    key: OrdKey::extract(run, 0, &fields, &dirs),
                    run: i,
                    row: 0,
                });
            }
        }

        let mut rows = Vec::new();
        while let Some(cursor) = heap.pop() {
            let run = &runs[cursor.run];
            rows.push(run.row(cursor.row));
            let next = cursor.row + 1;
            if next < run.num_rows() {
                heap.push(RunCursor {
                    key: OrdKey::extract(run, next, &fields, &dirs),
                    run: cursor.run,
                    row: next,
                });
            }
        }
        proc.mem.release(self.reserved);
        self.reserved = 0;
        Ok(OpOutput::batch(rows_to_batch(schema, &rows)?))
    }
}

// ============================================================================
// Limit / MergeLimit
// ============================================================================

/// Emits the first `limit` rows, then halts the pipeline.
pub struct LimitOp {
    name: &'static str,
    limit: usize,
    emitted: usize,
    /// Cancelled once the limit is reached; only the merge form carries
    /// a token.
    cancel_on_done: bool,
}

impl LimitOp {
    pub fn new(limit: usize) -> Self {
        Self {
            name: "limit",
            limit,
            emitted: 0,
            cancel_on_done: false,
        }
    }

    /// The merge form cancels the shared token once satisfied, so the
    /// shards stop producing.
    pub fn merge(limit: usize) -> Self {
        Self {
            name: "merge_limit",
            limit,
            emitted: 0,
            cancel_on_done: true,
        }
    }

    fn done(&self, proc: &Proc) {
        if self.cancel_on_done {
            proc.cancel.cancel();
        }
    }
}

#[async_trait]
impl Operator for LimitOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&mut self, proc: &Proc) -> StratoResult<()> {
        if self.limit == 0 {
            self.done(proc);
        }
        Ok(())
    }

    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput> {
        if self.emitted >= self.limit {
            self.done(proc);
            return Ok(OpOutput::with_halt(Vec::new(), true));
        }
        let remaining = self.limit - self.emitted;
        let take = batch.num_rows().min(remaining);
        let out = batch.slice(0, take)?;
        self.emitted += out.num_rows();
        let halt = self.emitted >= self.limit;
        if halt {
            self.done(proc);
        }
        Ok(OpOutput::with_halt(vec![out], halt))
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

// ============================================================================
// Offset / MergeOffset
// ============================================================================

/// Discards the first `offset` rows in arrival order.
pub struct OffsetOp {
    name: &'static str,
    offset: usize,
    skipped: usize,
}

impl OffsetOp {
    pub fn new(offset: usize) -> Self {
        Self {
            name: "offset",
            offset,
            skipped: 0,
        }
    }

    pub fn merge(offset: usize) -> Self {
        Self {
            name: "merge_offset",
            offset,
            skipped: 0,
        }
    }
}

#[async_trait]
impl Operator for OffsetOp {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        let to_skip = (self.offset - self.skipped).min(batch.num_rows());
        self.skipped += to_skip;
        if to_skip >= batch.num_rows() {
            return Ok(OpOutput::none());
        }
        let out = batch.slice(to_skip, batch.num_rows() - to_skip)?;
        Ok(OpOutput::batch(out))
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Forwards shard outputs in arrival order.
pub struct MergeOp;

#[async_trait]
impl Operator for MergeOp {
    fn name(&self) -> &'static str {
        "merge"
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::batch(batch))
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

// ============================================================================
// Group / MergeGroup
// ============================================================================

struct GroupState {
    aggs: Vec<Box<dyn Aggregate>>,
}

/// Hash aggregation producing partial states.
///
/// The output layout is positional: the grouping columns in expression
/// order, then each aggregate's partial state columns in spec order.
/// [`MergeGroupOp`] relies on this layout to combine shard outputs.
pub struct GroupOp {
    exprs: Vec<String>,
    specs: Vec<AggSpec>,
    groups: HashMap<Vec<Value>, GroupState>,
    group_order: Vec<Vec<Value>>,
    key_fields: Option<Vec<Field>>,
    protos: Option<Vec<Box<dyn Aggregate>>>,
    reserved: u64,
}

impl GroupOp {
    pub fn new(exprs: Vec<String>, specs: Vec<AggSpec>) -> Self {
        Self {
            exprs,
            specs,
            groups: HashMap::new(),
            group_order: Vec::new(),
            key_fields: None,
            protos: None,
            reserved: 0,
        }
    }

    fn init_protos(&mut self, batch: &Batch) -> StratoResult<Vec<usize>> {
        let schema = batch.schema();
        let mut input_cols = Vec::with_capacity(self.specs.len());
        let mut protos = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let col = match &spec.input {
                Some(name) => schema.index_of(name).ok_or_else(|| {
                    StratoError::plan(format!("aggregate input column '{}' not found", name))
                })?,
                // COUNT(*) reads no values; any column gives the row count.
                None => 0,
            };
            let input_type = schema
                .field(col)
                .map(|f| f.data_type())
                .unwrap_or(strato_common::DataType::Int64);
            input_cols.push(col);
            protos.push(new_aggregate(spec, input_type));
        }
        if self.key_fields.is_none() {
            let mut key_fields = Vec::with_capacity(self.exprs.len());
            for expr in &self.exprs {
                let idx = schema.index_of(expr).ok_or_else(|| {
                    StratoError::plan(format!("grouping column '{}' not found", expr))
                })?;
                key_fields.push(schema.fields()[idx].clone());
            }
            self.key_fields = Some(key_fields);
        }
        self.protos = Some(protos);
        Ok(input_cols)
    }

    fn partial_schema(&self) -> StratoResult<Arc<Schema>> {
        let mut fields = self.key_fields.clone().unwrap_or_default();
        let protos = self
            .protos
            .as_ref()
            .ok_or_else(|| StratoError::internal("group flushed before any input"))?;
        for (proto, spec) in protos.iter().zip(&self.specs) {
            fields.extend(proto.partial_fields(&spec.output));
        }
        Ok(Arc::new(Schema::new(fields)))
    }
}

#[async_trait]
impl Operator for GroupOp {
    fn name(&self) -> &'static str {
        "group"
    }

    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput> {
        let input_cols = self.init_protos(&batch)?;
        let schema = batch.schema();

        let key_cols: Vec<usize> = self
            .exprs
            .iter()
            .map(|e| {
                schema
                    .index_of(e)
                    .ok_or_else(|| StratoError::plan(format!("grouping column '{}' not found", e)))
            })
            .collect::<StratoResult<Vec<_>>>()?;

        // Selection lists per key, then one vectorized fill per group.
        let mut sels: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for row in 0..batch.num_rows() {
            let key: Vec<Value> = key_cols
                .iter()
                .map(|&c| batch.column(c).map(|col| col.get(row).clone()).unwrap_or(Value::Null))
                .collect();
            sels.entry(key).or_default().push(row);
        }

        for (key, rows) in sels {
            if !self.groups.contains_key(&key) {
                let protos = self.protos.as_ref().expect("protos initialized");
                let aggs = protos.iter().map(|p| p.dup()).collect();
                let key_bytes = key.iter().map(Value::approx_bytes).sum::<usize>() as u64;
                proc.mem.try_reserve(key_bytes)?;
                self.reserved += key_bytes;
                self.group_order.push(key.clone());
                self.groups.insert(key.clone(), GroupState { aggs });
            }
            let state = self.groups.get_mut(&key).expect("group exists");
            for (i, agg) in state.aggs.iter_mut().enumerate() {
                let col = batch.column(input_cols[i]).ok_or_else(|| {
                    StratoError::plan("aggregate input column index out of range")
                })?;
                agg.fill(Some(&rows), col)?;
            }
        }
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, proc: &Proc) -> StratoResult<OpOutput> {
        if self.groups.is_empty() {
            return Ok(OpOutput::none());
        }
        let schema = self.partial_schema()?;
        let mut rows = Vec::with_capacity(self.group_order.len());
        for key in std::mem::take(&mut self.group_order) {
            let state = self.groups.remove(&key).expect("group exists");
            let mut row = key;
            for agg in &state.aggs {
                row.extend(agg.partial_values());
            }
            rows.push(row);
        }
        proc.mem.release(self.reserved);
        self.reserved = 0;
        Ok(OpOutput::batch(rows_to_batch(schema, &rows)?))
    }
}

/// Second-phase combine of partial aggregates keyed by the grouping
/// tuple.
///
/// With `need_eval == false` the inputs are the positional partial
/// layout produced by [`GroupOp`]; with `need_eval == true` the inputs
/// are raw rows and the operator aggregates them itself.
pub struct MergeGroupOp {
    exprs: Vec<String>,
    specs: Vec<AggSpec>,
    need_eval: bool,
    groups: HashMap<Vec<Value>, GroupState>,
    group_order: Vec<Vec<Value>>,
    key_fields: Option<Vec<Field>>,
    protos: Option<Vec<Box<dyn Aggregate>>>,
    raw: Option<GroupOp>,
}

impl MergeGroupOp {
    pub fn new(exprs: Vec<String>, specs: Vec<AggSpec>, need_eval: bool) -> Self {
        let raw = need_eval.then(|| GroupOp::new(exprs.clone(), specs.clone()));
        Self {
            exprs,
            specs,
            need_eval,
            groups: HashMap::new(),
            group_order: Vec::new(),
            key_fields: None,
            protos: None,
            raw,
        }
    }

    fn final_schema(&self) -> StratoResult<Arc<Schema>> {
        let mut fields = self.key_fields.clone().unwrap_or_default();
        let protos = self
            .protos
            .as_ref()
            .ok_or_else(|| StratoError::internal("merge group flushed before any input"))?;
        for (proto, spec) in protos.iter().zip(&self.specs) {
            fields.push(Field::nullable(spec.output.clone(), proto.output_type()));
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    fn combine_partials(&mut self, batch: &Batch) -> StratoResult<()> {
        let nkeys = self.exprs.len();
        let schema = batch.schema();
        if schema.len() < nkeys {
            return Err(StratoError::plan(format!(
                "partial input has {} columns but {} grouping keys",
                schema.len(),
                nkeys
            )));
        }
        if self.key_fields.is_none() {
            self.key_fields = Some(schema.fields()[..nkeys].to_vec());
        }
        if self.protos.is_none() {
            // Input types for final protos come from the partial layout;
            // the aggregate only needs them for its output type.
            let mut protos = Vec::with_capacity(self.specs.len());
            let mut col = nkeys;
            for spec in &self.specs {
                let input_type = schema
                    .field(col)
                    .map(|f| f.data_type())
                    .unwrap_or(strato_common::DataType::Int64);
                let proto = new_aggregate(spec, input_type);
                col += proto.partial_fields(&spec.output).len();
                protos.push(proto);
            }
            protos_arity_check(&protos, &self.specs, schema.len(), nkeys)?;
            self.protos = Some(protos);
        }

        for row in 0..batch.num_rows() {
            let values = batch.row(row);
            let key = values[..nkeys].to_vec();
            if !self.groups.contains_key(&key) {
                let protos = self.protos.as_ref().expect("protos initialized");
                let aggs = protos.iter().map(|p| p.dup()).collect();
                self.group_order.push(key.clone());
                self.groups.insert(key.clone(), GroupState { aggs });
            }
            let state = self.groups.get_mut(&key).expect("group exists");
            let mut cursor = nkeys;
            for (agg, spec) in state.aggs.iter_mut().zip(&self.specs) {
                let arity = agg.partial_fields(&spec.output).len();
                agg.merge(&values[cursor..cursor + arity])?;
                cursor += arity;
            }
        }
        Ok(())
    }
}

fn protos_arity_check(
    protos: &[Box<dyn Aggregate>],
    specs: &[AggSpec],
    schema_len: usize,
    nkeys: usize,
) -> StratoResult<()> {
    let want: usize = protos
        .iter()
        .zip(specs)
        .map(|(p, s)| p.partial_fields(&s.output).len())
        .sum();
    if nkeys + want != schema_len {
        return Err(StratoError::plan(format!(
            "partial layout mismatch: {} keys + {} state columns != {} input columns",
            nkeys, want, schema_len
        )));
    }
    Ok(())
}

#[async_trait]
impl Operator for MergeGroupOp {
    fn name(&self) -> &'static str {
        "merge_group"
    }

    async fn push(&mut self, batch: Batch, proc: &Proc) -> StratoResult<OpOutput> {
        if self.need_eval {
            let raw = self.raw.as_mut().expect("raw group present");
            return raw.push(batch, proc).await;
        }
        self.combine_partials(&batch)?;
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, proc: &Proc) -> StratoResult<OpOutput> {
        if self.need_eval {
            // Route the raw group's partial output back through the
            // combiner, then fall through to finalize.
            let raw = self.raw.as_mut().expect("raw group present");
            let out = raw.flush(proc).await?;
            for batch in &out.batches {
                self.combine_partials(batch)?;
            }
        }
        if self.groups.is_empty() {
            return Ok(OpOutput::none());
        }
        let schema = self.final_schema()?;
        let mut rows = Vec::with_capacity(self.group_order.len());
        for key in std::mem::take(&mut self.group_order) {
            let state = self.groups.remove(&key).expect("group exists");
            let mut row = key;
            for agg in &state.aggs {
                row.push(agg.eval());
            }
            rows.push(row);
        }
        Ok(OpOutput::batch(rows_to_batch(schema, &rows)?))
    }
}

// ============================================================================
// Connector / Output
// ============================================================================

/// Terminal sibling operator: forwards batches into the paired parent
/// inbox, blocking while the bounded channel is full.
pub struct ConnectorOp {
    tx: tokio::sync::mpsc::Sender<Batch>,
    cancel: CancelToken,
}

impl ConnectorOp {
    pub fn new(tx: tokio::sync::mpsc::Sender<Batch>, cancel: CancelToken) -> Self {
        Self { tx, cancel }
    }
}

#[async_trait]
impl Operator for ConnectorOp {
    fn name(&self) -> &'static str {
        "connector"
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StratoError::Cancelled),
            sent = self.tx.send(batch) => {
                sent.map_err(|_| StratoError::Cancelled)?;
                Ok(OpOutput::none())
            }
        }
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

/// Terminal sink: collects batches for the caller.
pub struct OutputOp {
    sink: BatchSink,
}

impl OutputOp {
    pub fn new(sink: BatchSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Operator for OutputOp {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn push(&mut self, batch: Batch, _proc: &Proc) -> StratoResult<OpOutput> {
        self.sink.push(batch);
        Ok(OpOutput::none())
    }

    async fn flush(&mut self, _proc: &Proc) -> StratoResult<OpOutput> {
        Ok(OpOutput::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::AggFunc;
    use strato_common::DataType;

    fn schema2() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::not_null("a", DataType::Int64),
            Field::not_null("g", DataType::Int64),
        ]))
    }

    fn batch2(a: Vec<i64>, g: Vec<i64>) -> Batch {
        Batch::new(schema2(), vec![Column::int64(a), Column::int64(g)]).unwrap()
    }

    fn proc() -> Proc {
        Proc::new()
    }

    #[tokio::test]
    async fn test_projection() {
        let mut op = ProjectionOp::new(vec!["g".into()]);
        let out = op.push(batch2(vec![1, 2], vec![10, 20]), &proc()).await.unwrap();
        assert_eq!(out.batches[0].num_columns(), 1);
        assert_eq!(out.batches[0].column(0).unwrap().get(1), &Value::Int64(20));
    }

    #[tokio::test]
    async fn test_projection_unknown_column() {
        let mut op = ProjectionOp::new(vec!["missing".into()]);
        let err = op.push(batch2(vec![1], vec![1]), &proc()).await.unwrap_err();
        assert!(matches!(err, StratoError::Plan { .. }));
    }

    #[tokio::test]
    async fn test_top_desc() {
        let p = proc();
        let mut op = TopOp::new(vec![SortField::desc("a")], 3);
        op.push(batch2(vec![1, 5, 3], vec![0, 0, 0]), &p).await.unwrap();
        op.push(batch2(vec![8, 2, 7], vec![0, 0, 0]), &p).await.unwrap();

        let out = op.flush(&p).await.unwrap();
        let col = out.batches[0].column(0).unwrap();
        let got: Vec<i64> = (0..3).map(|i| col.get(i).to_i64().unwrap()).collect();
        assert_eq!(got, vec![8, 7, 5]);
    }

    #[tokio::test]
    async fn test_top_zero_limit() {
        let p = proc();
        let mut op = TopOp::new(vec![SortField::asc("a")], 0);
        op.push(batch2(vec![1], vec![0]), &p).await.unwrap();
        let out = op.flush(&p).await.unwrap();
        assert!(out.batches.is_empty());
    }

    #[tokio::test]
    async fn test_order_asc() {
        let p = proc();
        let mut op = OrderOp::new(vec![SortField::asc("a")]);
        op.push(batch2(vec![3, 1], vec![0, 0]), &p).await.unwrap();
        op.push(batch2(vec![2], vec![0]), &p).await.unwrap();

        let out = op.flush(&p).await.unwrap();
        let col = out.batches[0].column(0).unwrap();
        let got: Vec<i64> = (0..3).map(|i| col.get(i).to_i64().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
        // Buffered bytes were returned to the budget.
        assert_eq!(p.mem.used(), 0);
    }

    #[tokio::test]
    async fn test_merge_order_kway() {
        let p = proc();
        let mut op = MergeOrderOp::new(vec![SortField::asc("a")]);
        // Two sorted runs, interleaved values.
        op.push(batch2(vec![1, 4, 9], vec![0, 0, 0]), &p).await.unwrap();
        op.push(batch2(vec![2, 3, 8], vec![0, 0, 0]), &p).await.unwrap();

        let out = op.flush(&p).await.unwrap();
        let col = out.batches[0].column(0).unwrap();
        let got: Vec<i64> = (0..6).map(|i| col.get(i).to_i64().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 8, 9]);
    }

    #[tokio::test]
    async fn test_limit_halts() {
        let p = proc();
        let mut op = LimitOp::new(3);
        let out = op.push(batch2(vec![1, 2], vec![0, 0]), &p).await.unwrap();
        assert!(!out.halt);
        assert_eq!(out.batches[0].num_rows(), 2);

        let out = op.push(batch2(vec![3, 4], vec![0, 0]), &p).await.unwrap();
        assert!(out.halt);
        assert_eq!(out.batches[0].num_rows(), 1);
    }

    #[tokio::test]
    async fn test_merge_limit_zero_cancels_on_open() {
        let p = proc();
        let mut op = LimitOp::merge(0);
        op.open(&p).unwrap();
        assert!(p.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_merge_limit_cancels_when_satisfied() {
        let p = proc();
        let mut op = LimitOp::merge(1);
        op.open(&p).unwrap();
        assert!(!p.cancel.is_cancelled());
        let out = op.push(batch2(vec![1, 2], vec![0, 0]), &p).await.unwrap();
        assert!(out.halt);
        assert!(p.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_offset_skips_across_batches() {
        let p = proc();
        let mut op = OffsetOp::new(3);
        let out = op.push(batch2(vec![1, 2], vec![0, 0]), &p).await.unwrap();
        assert!(out.batches.is_empty());

        let out = op.push(batch2(vec![3, 4, 5], vec![0, 0, 0]), &p).await.unwrap();
        let col = out.batches[0].column(0).unwrap();
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(0), &Value::Int64(4));
    }

    #[tokio::test]
    async fn test_group_then_merge_group() {
        let p = proc();
        let specs = vec![
            AggSpec::new(AggFunc::Count, None, "cnt"),
            AggSpec::new(AggFunc::Sum, Some("a"), "total"),
        ];

        // Two shards, each producing partial states.
        let mut shard1 = GroupOp::new(vec!["g".into()], specs.clone());
        shard1
            .push(batch2(vec![1, 2, 3], vec![1, 0, 1]), &p)
            .await
            .unwrap();
        let part1 = shard1.flush(&p).await.unwrap();

        let mut shard2 = GroupOp::new(vec!["g".into()], specs.clone());
        shard2
            .push(batch2(vec![4, 5], vec![0, 1]), &p)
            .await
            .unwrap();
        let part2 = shard2.flush(&p).await.unwrap();

        let mut merge = MergeGroupOp::new(vec!["g".into()], specs, false);
        for out in [part1, part2] {
            for batch in out.batches {
                merge.push(batch, &p).await.unwrap();
            }
        }
        let out = merge.flush(&p).await.unwrap();
        let batch = &out.batches[0];
        assert_eq!(batch.num_rows(), 2);

        let mut by_key: HashMap<i64, (i64, i64)> = HashMap::new();
        for row in 0..batch.num_rows() {
            let g = batch.column(0).unwrap().get(row).to_i64().unwrap();
            let cnt = batch.column(1).unwrap().get(row).to_i64().unwrap();
            let total = batch.column(2).unwrap().get(row).to_i64().unwrap();
            by_key.insert(g, (cnt, total));
        }
        assert_eq!(by_key[&1], (3, 9));
        assert_eq!(by_key[&0], (2, 6));
    }

    #[tokio::test]
    async fn test_merge_group_need_eval_accepts_raw_rows() {
        let p = proc();
        let specs = vec![AggSpec::new(AggFunc::Avg, Some("a"), "mean")];
        let mut op = MergeGroupOp::new(vec!["g".into()], specs, true);
        op.push(batch2(vec![2, 4, 9], vec![0, 0, 1]), &p).await.unwrap();

        let out = op.flush(&p).await.unwrap();
        let batch = &out.batches[0];
        let mut by_key: HashMap<i64, f64> = HashMap::new();
        for row in 0..batch.num_rows() {
            let g = batch.column(0).unwrap().get(row).to_i64().unwrap();
            let mean = batch.column(1).unwrap().get(row).to_f64().unwrap();
            by_key.insert(g, mean);
        }
        assert_eq!(by_key[&0], 3.0);
        assert_eq!(by_key[&1], 9.0);
    }

    #[tokio::test]
    async fn test_connector_observes_cancel() {
        let p = proc();
        let cancel = CancelToken::new();
        let (tx, _reg) = crate::process::WaitRegister::new(cancel.clone());
        let mut op = ConnectorOp::new(tx, cancel.clone());

        // First send fills the capacity-1 channel.
        op.push(batch2(vec![1], vec![0]), &p).await.unwrap();

        // Second send blocks until the token cancels.
        cancel.cancel();
        let err = op.push(batch2(vec![2], vec![0]), &p).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_connector_receiver_dropped() {
        let p = proc();
        let cancel = CancelToken::new();
        let (tx, reg) = crate::process::WaitRegister::new(cancel.clone());
        drop(reg);
        let mut op = ConnectorOp::new(tx, cancel);
        let err = op.push(batch2(vec![1], vec![0]), &p).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_output_collects() {
        let p = proc();
        let sink = BatchSink::new();
        let mut op = OutputOp::new(sink.clone());
        op.push(batch2(vec![1, 2], vec![0, 0]), &p).await.unwrap();
        assert_eq!(sink.total_rows(), 2);
    }
}
