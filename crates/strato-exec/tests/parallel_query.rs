//! End-to-end parallel query scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use strato_common::{
    Batch, Column, DataType, Field, Schema, StratoError, StratoResult,
};
use strato_exec::engine::{Engine, MemEngine, Reader};
use strato_exec::{
    AggFunc, AggSpec, BatchSink, CancelToken, DataSource, Instruction, Magic, OpArg, OpCode, Proc,
    Scope, SortField, WaitRegister,
};

fn schema_a() -> Schema {
    Schema::new(vec![Field::not_null("a", DataType::Int64)])
}

fn schema_ag() -> Schema {
    Schema::new(vec![
        Field::not_null("a", DataType::Int64),
        Field::not_null("g", DataType::Int64),
    ])
}

fn batch_a(values: Vec<i64>) -> Batch {
    Batch::new(Arc::new(schema_a()), vec![Column::int64(values)]).unwrap()
}

fn batch_ag(a: Vec<i64>) -> Batch {
    let g: Vec<i64> = a.iter().map(|v| v % 2).collect();
    Batch::new(
        Arc::new(schema_ag()),
        vec![Column::int64(a), Column::int64(g)],
    )
    .unwrap()
}

/// The eight-row fixture table, two rows per shard on a 4-way host.
fn engine_with_rows() -> Arc<MemEngine> {
    MemEngine::with_table(
        "db",
        "t",
        schema_a(),
        vec![
            batch_a(vec![1, 2]),
            batch_a(vec![3, 4]),
            batch_a(vec![5, 6]),
            batch_a(vec![7, 8]),
        ],
    )
}

fn table_scope(parallelism: usize, instructions: Vec<Instruction>) -> Scope {
    let mut scope = Scope::new(Magic::Normal, Proc::new().with_parallelism(parallelism));
    scope.data_source = Some(DataSource::Table {
        schema_name: "db".into(),
        relation_name: "t".into(),
        attributes: vec!["a".into()],
        reader: None,
    });
    scope.instructions = instructions;
    scope
}

fn output(sink: &BatchSink) -> Instruction {
    Instruction::new(OpCode::Output, OpArg::Output { sink: sink.clone() })
}

fn collect_i64(sink: &BatchSink, col: usize) -> Vec<i64> {
    sink.take()
        .iter()
        .flat_map(|b| {
            let c = b.column(col).unwrap();
            (0..b.num_rows())
                .map(|i| c.get(i).to_i64().unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn top_k_descending_over_four_shards() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(
                OpCode::Top,
                OpArg::Top {
                    fields: vec![SortField::desc("a")],
                    limit: 3,
                },
            ),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 3);
    assert_eq!(collect_i64(&sink, 0), vec![8, 7, 6]);
}

#[tokio::test]
async fn group_by_parity_over_four_shards() {
    let engine = MemEngine::with_table(
        "db",
        "t",
        schema_ag(),
        vec![
            batch_ag(vec![1, 2]),
            batch_ag(vec![3, 4]),
            batch_ag(vec![5, 6]),
            batch_ag(vec![7, 8]),
        ],
    );
    let sink = BatchSink::new();

    let mut scope = table_scope(
        4,
        vec![
            Instruction::new(
                OpCode::Group,
                OpArg::Group {
                    exprs: vec!["g".into()],
                    aggs: vec![
                        AggSpec::new(AggFunc::Count, None, "cnt"),
                        AggSpec::new(AggFunc::Sum, Some("a"), "total"),
                    ],
                },
            ),
            output(&sink),
        ],
    );
    scope.data_source = Some(DataSource::Table {
        schema_name: "db".into(),
        relation_name: "t".into(),
        attributes: vec!["a".into(), "g".into()],
        reader: None,
    });

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 2);

    let batches = sink.take();
    let mut groups: HashMap<i64, (i64, i64)> = HashMap::new();
    for batch in &batches {
        for row in 0..batch.num_rows() {
            let g = batch.column(0).unwrap().get(row).to_i64().unwrap();
            let cnt = batch.column(1).unwrap().get(row).to_i64().unwrap();
            let total = batch.column(2).unwrap().get(row).to_i64().unwrap();
            groups.insert(g, (cnt, total));
        }
    }
    assert_eq!(groups[&0], (4, 20));
    assert_eq!(groups[&1], (4, 16));
}

#[tokio::test]
async fn projection_only_pipeline_concatenates_shards() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(
                OpCode::Projection,
                OpArg::Projection {
                    columns: vec!["a".into()],
                },
            ),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 8);

    // Order across shards is undefined without a merge ordering.
    let mut got = collect_i64(&sink, 0);
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn order_by_imposes_total_order_across_shards() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(
                OpCode::Order,
                OpArg::Order {
                    fields: vec![SortField::asc("a")],
                },
            ),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 8);
    assert_eq!(collect_i64(&sink, 0), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn merge_limit_cancels_shards_once_satisfied() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(OpCode::Limit, OpArg::Limit { limit: 2 }),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 2);
    assert_eq!(collect_i64(&sink, 0).len(), 2);
}

#[tokio::test]
async fn merge_limit_zero_emits_nothing() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(OpCode::Limit, OpArg::Limit { limit: 0 }),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 0);
    assert!(sink.take().is_empty());
}

#[tokio::test]
async fn zero_parallelism_is_an_error() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();
    let scope = table_scope(0, vec![output(&sink)]);

    let err = scope.parallel_run(engine).await.unwrap_err();
    assert!(matches!(err, StratoError::Execution { .. }));
}

#[tokio::test]
async fn empty_pipeline_is_a_plan_error() {
    let engine = engine_with_rows();
    let scope = table_scope(4, vec![]);
    let err = scope.parallel_run(engine).await.unwrap_err();
    assert!(matches!(err, StratoError::Plan { .. }));
}

#[tokio::test]
async fn zero_row_relation_terminates_cleanly() {
    let engine = MemEngine::with_table("db", "t", schema_a(), vec![]);
    let sink = BatchSink::new();

    let scope = table_scope(
        4,
        vec![
            Instruction::new(
                OpCode::Order,
                OpArg::Order {
                    fields: vec![SortField::asc("a")],
                },
            ),
            output(&sink),
        ],
    );

    let rows = scope.parallel_run(engine).await.unwrap();
    assert_eq!(rows, 0);
    assert!(sink.take().is_empty());
}

#[tokio::test]
async fn remote_run_with_local_target_degenerates_to_parallel() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let mut scope = table_scope(
        2,
        vec![
            Instruction::new(OpCode::Limit, OpArg::Limit { limit: 4 }),
            output(&sink),
        ],
    );
    scope.magic = Magic::Remote;

    let rows = scope.execute(engine).await.unwrap();
    assert_eq!(rows, 4);
}

#[tokio::test]
async fn remote_run_with_foreign_target_is_not_supported() {
    let engine = engine_with_rows();
    let sink = BatchSink::new();

    let mut scope = table_scope(2, vec![output(&sink)]);
    scope.node_info.addr = "10.0.0.9:7100".into();
    scope.node_info.id = strato_common::NodeId::new(9);

    let err = scope.remote_run(engine).await.unwrap_err();
    assert!(matches!(err, StratoError::NotSupported { .. }));
}

#[tokio::test]
async fn const_scope_runs_single_shot() {
    let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
    let sink = BatchSink::new();

    let mut scope = Scope::new(Magic::Normal, Proc::new());
    scope.data_source = Some(DataSource::Const(batch_a(vec![4, 2, 9])));
    scope.instructions = vec![
        Instruction::new(
            OpCode::Order,
            OpArg::Order {
                fields: vec![SortField::asc("a")],
            },
        ),
        output(&sink),
    ];

    let rows = scope.run(engine).await.unwrap();
    assert_eq!(rows, 3);
    assert_eq!(collect_i64(&sink, 0), vec![2, 4, 9]);
}

/// A reader whose first pull fails.
struct FailReader;

#[async_trait]
impl Reader for FailReader {
    async fn read(&mut self) -> StratoResult<Option<Batch>> {
        Err(StratoError::execution("shard read failed"))
    }
}

#[tokio::test]
async fn merge_run_propagates_the_first_worker_error() {
    let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
    let sink = BatchSink::new();

    let cancel = CancelToken::new();
    let mut parent = Scope::new(Magic::Merge, Proc::new());
    parent.proc.cancel = cancel.clone();
    parent.instructions = vec![
        Instruction::new(OpCode::Merge, OpArg::Merge),
        output(&sink),
    ];

    let mut children = Vec::new();
    for i in 0..2 {
        let (tx, register) = WaitRegister::new(cancel.clone());
        parent.proc.merge_receivers.push(register);

        let mut child = Scope::new(Magic::Normal, parent.proc.derive());
        let reader: Box<dyn Reader> = if i == 0 {
            Box::new(FailReader)
        } else {
            Box::new(strato_exec::engine::BatchReader::new(vec![batch_a(vec![1])]))
        };
        child.data_source = Some(DataSource::Table {
            schema_name: "db".into(),
            relation_name: "t".into(),
            attributes: vec!["a".into()],
            reader: Some(reader),
        });
        child.instructions = vec![Instruction::new(
            OpCode::Connector,
            OpArg::Connector {
                tx,
                cancel: cancel.clone(),
            },
        )];
        children.push(child);
    }
    parent.pre_scopes = children;

    let err = parent.merge_run(engine).await.unwrap_err();
    match err {
        StratoError::Execution { message } => assert!(message.contains("shard read failed")),
        other => panic!("unexpected error {:?}", other),
    }
}
