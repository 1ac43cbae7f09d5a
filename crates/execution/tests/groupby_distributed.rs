mod support;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, AsArray, BooleanArray, DictionaryArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Int32Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{EngineConfig, MetricsSink, OperatorId, TesseraError};
use tessera_execution::{
    AggFunc, BatchOperator, Collaborators, FunctionSpec, GroupbyOperator, OperatorOptions,
};

use support::{RecordingMetrics, drive, i64_column, run_workers, string_column, test_config};

fn utf8_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, true),
        Field::new("v", DataType::Int64, true),
    ]))
}

fn utf8_batch(schema: &SchemaRef, keys: Vec<Option<&str>>, vals: Vec<Option<i64>>) -> RecordBatch {
    RecordBatch::try_new(
        Arc::clone(schema),
        vec![Arc::new(StringArray::from(keys)), Arc::new(Int64Array::from(vals))],
    )
    .expect("batch")
}

fn sum_spec() -> Vec<FunctionSpec> {
    vec![FunctionSpec::new(AggFunc::Sum, Some(1), "total")]
}

/// Union of every worker's `(key, value)` output rows.
fn collect(results: Vec<Vec<RecordBatch>>) -> HashMap<Option<String>, Option<i64>> {
    let mut out = HashMap::new();
    for batches in results {
        let keys = string_column(&batches, 0);
        let vals = i64_column(&batches, 1);
        for (k, v) in keys.into_iter().zip(vals) {
            assert!(out.insert(k.clone(), v).is_none(), "group {k:?} produced twice");
        }
    }
    out
}

#[test]
fn two_workers_sum_by_key() {
    let schema = utf8_schema();
    let results = run_workers(2, test_config(), |rank, collaborators| {
        let input = if rank == 0 {
            vec![utf8_batch(
                &schema,
                vec![Some("A"), Some("B"), Some("A")],
                vec![Some(1), Some(2), Some(3)],
            )]
        } else {
            vec![utf8_batch(&schema, vec![Some("B"), Some("A")], vec![Some(6), Some(3)])]
        };
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            sum_spec(),
            1,
            OperatorOptions::default(),
            collaborators,
        )
        .expect("groupby");
        drive(&mut op, &schema, &input).expect("drive")
    });
    let groups = collect(results);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[&Some("A".to_string())], Some(7));
    assert_eq!(groups[&Some("B".to_string())], Some(8));
}

#[test]
fn uneven_batch_counts_still_complete() {
    let schema = utf8_schema();
    let config = EngineConfig {
        sync_iter: 3,
        ..test_config()
    };
    let results = run_workers(3, config, |rank, collaborators| {
        let input = (0..rank * 4)
            .map(|i| utf8_batch(&schema, vec![Some("k")], vec![Some(i as i64)]))
            .collect::<Vec<_>>();
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            vec![
                FunctionSpec::new(AggFunc::Sum, Some(1), "total"),
                FunctionSpec::new(AggFunc::Count, Some(1), "n"),
            ],
            1,
            OperatorOptions::default(),
            collaborators,
        )
        .expect("groupby");
        drive(&mut op, &schema, &input).expect("drive")
    });
    let all = results.into_iter().flatten().collect::<Vec<_>>();
    assert_eq!(string_column(&all, 0), vec![Some("k".to_string())]);
    // rank 1 sends 0..4, rank 2 sends 0..8
    assert_eq!(i64_column(&all, 1), vec![Some(6 + 28)]);
    assert_eq!(i64_column(&all, 2), vec![Some(12)]);
}

#[test]
fn spilling_does_not_change_results() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
    ]));
    let input_for = |rank: usize| {
        (0..4)
            .map(|b| {
                let keys = Int64Array::from_iter_values((0..3000).map(|i| (i * 7 + b) % 5000));
                let vals = Int64Array::from_iter_values((0..3000).map(|_| rank as i64 + 1));
                RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(keys), Arc::new(vals)])
                    .expect("batch")
            })
            .collect::<Vec<_>>()
    };
    let run = |config: EngineConfig, metrics: Arc<RecordingMetrics>| {
        let results = run_workers(2, config, |rank, collaborators| {
            let collaborators = if rank == 0 {
                collaborators.with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>)
            } else {
                collaborators
            };
            let mut op = GroupbyOperator::try_new(
                Arc::clone(&schema),
                sum_spec(),
                1,
                OperatorOptions::default(),
                collaborators,
            )
            .expect("groupby");
            drive(&mut op, &schema, &input_for(rank)).expect("drive")
        });
        let mut out = HashMap::new();
        for batches in results {
            for (k, v) in i64_column(&batches, 0).into_iter().zip(i64_column(&batches, 1)) {
                assert!(out.insert(k, v).is_none());
            }
        }
        out
    };

    let roomy = run(test_config(), Arc::new(RecordingMetrics::default()));
    let tight_metrics = Arc::new(RecordingMetrics::default());
    let tight = run(
        EngineConfig {
            operator_budget_bytes: Some(24 * 1024),
            operator_error_threshold_pct: 100_000,
            shuffle_threshold_bytes: 4 * 1024,
            max_partition_depth: 16,
            ..test_config()
        },
        Arc::clone(&tight_metrics),
    );
    assert_eq!(roomy.len(), tight.len());
    assert_eq!(roomy, tight);
    assert!(tight_metrics.stat("partition_splits").unwrap_or(0) > 0);
}

#[test]
fn dictionary_keys_unify_across_workers() {
    let schema = Arc::new(Schema::new(vec![
        Field::new(
            "k",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            true,
        ),
        Field::new("v", DataType::Int64, true),
    ]));
    let results = run_workers(2, test_config(), |rank, collaborators| {
        let (keys, vals): (Vec<&str>, Vec<i64>) = if rank == 0 {
            (vec!["x", "y", "x"], vec![1, 2, 3])
        } else {
            (vec!["z", "y", "z"], vec![10, 20, 30])
        };
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(keys.into_iter().collect::<DictionaryArray<Int32Type>>()),
                Arc::new(Int64Array::from(vals)),
            ],
        )
        .expect("batch");
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            sum_spec(),
            1,
            OperatorOptions::default(),
            collaborators,
        )
        .expect("groupby");
        drive(&mut op, &schema, &[batch]).expect("drive")
    });
    let groups = collect(results);
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[&Some("x".to_string())], Some(4));
    assert_eq!(groups[&Some("y".to_string())], Some(22));
    assert_eq!(groups[&Some("z".to_string())], Some(40));
}

#[test]
fn null_keys_group_together_only_when_equal() {
    let schema = utf8_schema();
    for null_equal in [true, false] {
        let results = run_workers(2, test_config(), |rank, collaborators| {
            let input = if rank == 0 {
                vec![utf8_batch(&schema, vec![None, Some("a")], vec![Some(1), Some(2)])]
            } else {
                vec![utf8_batch(&schema, vec![None], vec![Some(3)])]
            };
            let mut op = GroupbyOperator::try_new(
                Arc::clone(&schema),
                sum_spec(),
                1,
                OperatorOptions {
                    null_equal,
                    ..OperatorOptions::default()
                },
                collaborators,
            )
            .expect("groupby");
            drive(&mut op, &schema, &input).expect("drive")
        });
        let all = results.into_iter().flatten().collect::<Vec<_>>();
        let mut rows = string_column(&all, 0)
            .into_iter()
            .zip(i64_column(&all, 1))
            .collect::<Vec<_>>();
        rows.sort();
        if null_equal {
            assert_eq!(rows, vec![(None, Some(4)), (Some("a".to_string()), Some(2))]);
        } else {
            assert_eq!(
                rows,
                vec![(None, Some(1)), (None, Some(3)), (Some("a".to_string()), Some(2))]
            );
        }
    }
}

#[test]
fn non_parallel_operator_sees_only_local_rows() {
    let schema = utf8_schema();
    let results = run_workers(2, test_config(), |rank, collaborators| {
        let input = vec![utf8_batch(&schema, vec![Some("A")], vec![Some(rank as i64 + 1)])];
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            sum_spec(),
            1,
            OperatorOptions {
                parallel: false,
                ..OperatorOptions::default()
            },
            collaborators,
        )
        .expect("groupby");
        drive(&mut op, &schema, &input).expect("drive")
    });
    assert_eq!(i64_column(&results[0], 1), vec![Some(1)]);
    assert_eq!(i64_column(&results[1], 1), vec![Some(2)]);
}

#[test]
fn rejects_non_reduce_functions() {
    let schema = utf8_schema();
    let err = GroupbyOperator::try_new(
        Arc::clone(&schema),
        vec![FunctionSpec::new(AggFunc::Cumsum, Some(1), "c")],
        1,
        OperatorOptions::default(),
        Collaborators::single_process(test_config()),
    )
    .expect_err("cumsum is not a reduction");
    assert!(matches!(err, TesseraError::InvalidConfig(_)));
}

#[test]
fn lost_worker_fails_the_build() {
    let schema = utf8_schema();
    let results = run_workers(2, test_config(), |rank, collaborators| {
        if rank == 1 {
            return None;
        }
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            sum_spec(),
            1,
            OperatorOptions {
                operator_id: OperatorId(7),
                ..OperatorOptions::default()
            },
            collaborators,
        )
        .expect("groupby");
        let batch = utf8_batch(&schema, vec![Some("A")], vec![Some(1)]);
        Some(op.build_consume_batch(&batch, true))
    });
    let err = results
        .into_iter()
        .next()
        .flatten()
        .expect("rank 0 ran")
        .expect_err("peer is gone");
    assert!(matches!(err, TesseraError::Collective(_)), "{err}");
}

#[test]
fn spill_quota_exhaustion_is_reported() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
    ]));
    let mut config = EngineConfig {
        operator_budget_bytes: Some(8 * 1024),
        operator_error_threshold_pct: 100_000,
        ..test_config()
    };
    config.spill_tiers[0].quota_bytes = Some(1);
    let results = run_workers(1, config, |_, collaborators| {
        let input = (0..10)
            .map(|b| {
                let keys = Int64Array::from_iter_values(b * 2000..(b + 1) * 2000);
                let vals = Int64Array::from_iter_values(0..2000);
                RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(keys), Arc::new(vals)])
                    .expect("batch")
            })
            .collect::<Vec<_>>();
        let mut op = GroupbyOperator::try_new(
            Arc::clone(&schema),
            sum_spec(),
            1,
            OperatorOptions::default(),
            collaborators,
        )
        .expect("groupby");
        drive(&mut op, &schema, &input).map(|_| ())
    });
    let err = results
        .into_iter()
        .next()
        .expect("one worker")
        .expect_err("spill tier is full");
    assert!(matches!(err, TesseraError::ResourceExhausted(_)), "{err}");
}

/// Rows of every worker keyed by the Int64 key in column 0, every other
/// column cast to Float64.
fn numeric_rows(results: Vec<Vec<RecordBatch>>) -> HashMap<i64, Vec<Option<f64>>> {
    let mut out = HashMap::new();
    for batch in results.into_iter().flatten() {
        let keys = i64_column(std::slice::from_ref(&batch), 0);
        let columns = (1..batch.num_columns())
            .map(|c| {
                let cast = arrow::compute::cast(batch.column(c), &DataType::Float64).expect("cast");
                let cast = cast.as_primitive::<Float64Type>();
                (0..cast.len())
                    .map(|i| (!cast.is_null(i)).then(|| cast.value(i)))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        for (row, key) in keys.into_iter().enumerate() {
            let values = columns.iter().map(|c| c[row]).collect();
            let key = key.expect("non-null key");
            assert!(out.insert(key, values).is_none(), "group {key} produced twice");
        }
    }
    out
}

#[test]
fn reductions_match_a_single_worker_reference() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("v", DataType::Int64, true),
        Field::new("b", DataType::Boolean, true),
    ]));
    let batches_for = |rank: usize| {
        (0..2i64)
            .map(|b| {
                let rows = 0..40i64;
                let keys = Int64Array::from_iter_values(rows.clone().map(|i| (i * 3 + b) % 20));
                let vals = rows
                    .clone()
                    .map(|i| (i % 7 != 3).then_some(rank as i64 * 1000 + b * 100 + i))
                    .collect::<Int64Array>();
                let flags = rows
                    .map(|i| Some((rank as i64 * 1000 + b * 100 + i) % 13 == 0))
                    .collect::<BooleanArray>();
                RecordBatch::try_new(
                    Arc::clone(&schema),
                    vec![Arc::new(keys), Arc::new(vals), Arc::new(flags)],
                )
                .expect("batch")
            })
            .collect::<Vec<_>>()
    };
    let functions = vec![
        FunctionSpec::new(AggFunc::Min, Some(1), "min"),
        FunctionSpec::new(AggFunc::Max, Some(1), "max"),
        FunctionSpec::new(AggFunc::Mean, Some(1), "mean"),
        FunctionSpec::new(AggFunc::First, Some(1), "first"),
        FunctionSpec::new(AggFunc::Last, Some(1), "last"),
        FunctionSpec::new(AggFunc::Var, Some(1), "var"),
        FunctionSpec::new(AggFunc::Std, Some(1), "std"),
        FunctionSpec::new(AggFunc::Prod, Some(1), "prod"),
        FunctionSpec::new(AggFunc::Median, Some(1), "median"),
        FunctionSpec::new(AggFunc::NUnique, Some(1), "nunique"),
        FunctionSpec::new(AggFunc::BoolOr, Some(2), "any"),
    ];
    let run = |workers: usize| {
        numeric_rows(run_workers(workers, test_config(), |rank, collaborators| {
            // the single worker sees every rank's rows in rank order
            let input = match workers {
                1 => (0..2).flat_map(batches_for).collect::<Vec<_>>(),
                _ => batches_for(rank),
            };
            let mut op = GroupbyOperator::try_new(
                Arc::clone(&schema),
                functions.clone(),
                1,
                OperatorOptions::default(),
                collaborators,
            )
            .expect("groupby");
            drive(&mut op, &schema, &input).expect("drive")
        }))
    };
    let reference = run(1);
    let distributed = run(2);
    assert_eq!(reference.len(), 20);
    assert_eq!(distributed.len(), 20);
    for (key, expected) in &reference {
        let got = &distributed[key];
        for ((f, e), g) in functions.iter().zip(expected).zip(got) {
            let same = match (e, g) {
                (Some(e), Some(g)) if e.is_nan() => g.is_nan(),
                (Some(e), Some(g)) => (e - g).abs() <= 1e-9 * e.abs().max(1.0),
                (None, None) => true,
                _ => false,
            };
            assert!(same, "{} of key {key}: expected {e:?}, got {g:?}", f.name);
        }
    }
}
