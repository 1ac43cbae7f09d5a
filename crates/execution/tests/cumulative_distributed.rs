mod support;

use std::sync::Arc;

use arrow::array::{AsArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{EngineConfig, MetricsSink};
use tessera_execution::{AggFunc, CumulativeOperator, FunctionSpec, OperatorOptions};

use support::{RecordingMetrics, drive, i64_column, run_workers, test_config};

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, true),
        Field::new("v", DataType::Int64, true),
        Field::new("f", DataType::Float64, true),
    ]))
}

fn batch(schema: &SchemaRef, k: Vec<Option<&str>>, v: Vec<Option<i64>>) -> RecordBatch {
    let f = v.iter().map(|v| v.map(|v| v as f64)).collect::<Float64Array>();
    RecordBatch::try_new(
        Arc::clone(schema),
        vec![Arc::new(StringArray::from(k)), Arc::new(Int64Array::from(v)), Arc::new(f)],
    )
    .expect("batch")
}

fn functions() -> Vec<FunctionSpec> {
    vec![
        FunctionSpec::new(AggFunc::Cumsum, Some(1), "cs"),
        FunctionSpec::new(AggFunc::Cummax, Some(1), "cm"),
        FunctionSpec::new(AggFunc::Cumprod, Some(2), "cp"),
    ]
}

fn input(schema: &SchemaRef, rank: usize) -> Vec<RecordBatch> {
    match rank {
        0 => vec![batch(
            schema,
            vec![Some("a"), Some("b"), Some("a")],
            vec![Some(1), Some(2), Some(3)],
        )],
        1 => vec![
            batch(schema, vec![Some("a")], vec![Some(4)]),
            batch(schema, vec![Some("b"), None], vec![Some(5), Some(9)]),
        ],
        _ => vec![batch(schema, vec![Some("b"), Some("a")], vec![Some(1), Some(2)])],
    }
}

/// Run on three workers; returns per-worker output and whether the prefix
/// scan path was used on rank 0.
fn run(config: EngineConfig, options: OperatorOptions) -> (Vec<Vec<RecordBatch>>, Option<String>) {
    let schema = schema();
    let metrics = Arc::new(RecordingMetrics::default());
    let results = run_workers(3, config, |rank, collaborators| {
        let collaborators = if rank == 0 {
            collaborators.with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>)
        } else {
            collaborators
        };
        let mut op = CumulativeOperator::try_new(
            Arc::clone(&schema),
            functions(),
            1,
            options.clone(),
            collaborators,
        )
        .expect("cumulative");
        drive(&mut op, &schema, &input(&schema, rank)).expect("drive")
    });
    (results, metrics.blob("strategy"))
}

#[test]
fn running_values_continue_across_workers() {
    let (results, strategy) = run(test_config(), OperatorOptions::default());
    assert_eq!(strategy.as_deref(), Some("prefix_scan"));
    // input columns come back unchanged, in input order
    assert_eq!(i64_column(&results[1], 1), vec![Some(4), Some(5), Some(9)]);
    assert_eq!(i64_column(&results[0], 3), vec![Some(1), Some(2), Some(4)]);
    assert_eq!(i64_column(&results[1], 3), vec![Some(8), Some(7), None]);
    assert_eq!(i64_column(&results[2], 3), vec![Some(8), Some(10)]);
    assert_eq!(i64_column(&results[2], 4), vec![Some(5), Some(4)]);
    let cp = results[2][0].column(5).as_primitive::<Float64Type>();
    assert_eq!(cp.values().to_vec(), vec![10.0, 24.0]);
}

#[test]
fn shuffle_path_matches_prefix_scan() {
    let (scan, scan_strategy) = run(test_config(), OperatorOptions::default());
    let (shuffled, shuffle_strategy) = run(
        EngineConfig {
            exscan_max_groups: 0,
            ..test_config()
        },
        OperatorOptions::default(),
    );
    assert_eq!(scan_strategy.as_deref(), Some("prefix_scan"));
    assert_eq!(shuffle_strategy.as_deref(), Some("shuffle"));
    for (a, b) in scan.iter().zip(&shuffled) {
        for col in [1, 3, 4] {
            assert_eq!(i64_column(a, col), i64_column(b, col));
        }
    }
}

#[test]
fn nulls_propagate_without_skipna() {
    let schema = schema();
    let options = OperatorOptions {
        skipna: false,
        ..OperatorOptions::default()
    };
    let results = run_workers(2, test_config(), |rank, collaborators| {
        let input = if rank == 0 {
            vec![batch(&schema, vec![Some("a"), Some("a")], vec![Some(1), None])]
        } else {
            vec![batch(&schema, vec![Some("a"), Some("b")], vec![Some(2), Some(3)])]
        };
        let mut op = CumulativeOperator::try_new(
            Arc::clone(&schema),
            vec![FunctionSpec::new(AggFunc::Cumsum, Some(1), "cs")],
            1,
            options.clone(),
            collaborators,
        )
        .expect("cumulative");
        drive(&mut op, &schema, &input).expect("drive")
    });
    assert_eq!(i64_column(&results[0], 3), vec![Some(1), None]);
    assert_eq!(i64_column(&results[1], 3), vec![None, Some(3)]);
}

#[test]
fn null_keys_are_left_out_with_dropna() {
    let (results, _) = run(test_config(), OperatorOptions::default());
    // rank 1, row 2 has a NULL key
    assert_eq!(i64_column(&results[1], 3)[1..], [Some(7), None]);

    let (results, _) = run(
        test_config(),
        OperatorOptions {
            dropna: false,
            ..OperatorOptions::default()
        },
    );
    assert_eq!(i64_column(&results[1], 3)[2], Some(9));
}

#[test]
fn integer_cumprod_wraps_identically_on_both_paths() {
    let schema = schema();
    let run_prod = |config: EngineConfig| {
        run_workers(2, config, |rank, collaborators| {
            let rows = if rank == 0 { 12 } else { 13 };
            let input = vec![batch(&schema, vec![Some("a"); rows], vec![Some(10); rows])];
            let mut op = CumulativeOperator::try_new(
                Arc::clone(&schema),
                vec![FunctionSpec::new(AggFunc::Cumprod, Some(1), "cp")],
                1,
                OperatorOptions::default(),
                collaborators,
            )
            .expect("cumulative");
            drive(&mut op, &schema, &input).expect("drive")
        })
    };
    let scan = run_prod(test_config());
    let shuffled = run_prod(EngineConfig {
        exscan_max_groups: 0,
        ..test_config()
    });
    let expected = (1..=25u32)
        .map(|n| Some(10i64.wrapping_pow(n)))
        .collect::<Vec<_>>();
    let scanned = [i64_column(&scan[0], 3), i64_column(&scan[1], 3)].concat();
    let reshuffled = [i64_column(&shuffled[0], 3), i64_column(&shuffled[1], 3)].concat();
    assert_eq!(scanned, expected);
    assert_eq!(reshuffled, expected);
}

#[test]
fn keys_are_not_gathered_once_one_worker_exceeds_the_ceiling() {
    let schema = schema();
    let run_many = |config: EngineConfig| {
        let metrics = Arc::new(RecordingMetrics::default());
        let results = run_workers(2, config, |rank, collaborators| {
            let collaborators = if rank == 0 {
                collaborators.with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>)
            } else {
                collaborators
            };
            let n_keys = if rank == 0 { 50 } else { 3 };
            let keys = (0..100).map(|i| format!("k{}", i % n_keys)).collect::<Vec<_>>();
            let input = vec![batch(
                &schema,
                keys.iter().map(|k| Some(k.as_str())).collect(),
                (0..100).map(Some).collect(),
            )];
            let mut op = CumulativeOperator::try_new(
                Arc::clone(&schema),
                vec![FunctionSpec::new(AggFunc::Cumsum, Some(1), "cs")],
                1,
                OperatorOptions::default(),
                collaborators,
            )
            .expect("cumulative");
            drive(&mut op, &schema, &input).expect("drive")
        });
        (
            results,
            metrics.blob("strategy"),
            metrics.stat("gathered_keys"),
        )
    };
    let (scanned, strategy, gathered) = run_many(test_config());
    assert_eq!(strategy.as_deref(), Some("prefix_scan"));
    assert_eq!(gathered, Some(53));

    let (shuffled, strategy, gathered) = run_many(EngineConfig {
        exscan_max_groups: 10,
        ..test_config()
    });
    assert_eq!(strategy.as_deref(), Some("shuffle"));
    assert_eq!(gathered, Some(0));
    for (a, b) in scanned.iter().zip(&shuffled) {
        assert_eq!(i64_column(a, 3), i64_column(b, 3));
    }
}
