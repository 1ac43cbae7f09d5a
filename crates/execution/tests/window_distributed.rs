mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{AsArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::EngineConfig;
use tessera_execution::{
    AggFunc, BatchOperator, Collaborators, FunctionSpec, OperatorOptions, SortKey, WindowOperator,
};

use support::{drive, i64_column, run_workers, string_column, test_config};

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("p", DataType::Utf8, true),
        Field::new("o", DataType::Int64, true),
    ]))
}

fn batch(schema: &SchemaRef, p: Vec<&str>, o: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(
        Arc::clone(schema),
        vec![Arc::new(StringArray::from(p)), Arc::new(Int64Array::from(o))],
    )
    .expect("batch")
}

fn functions() -> Vec<FunctionSpec> {
    vec![
        FunctionSpec::new(AggFunc::RowNumber, None, "rn"),
        FunctionSpec::new(AggFunc::Rank, None, "rk"),
        FunctionSpec::new(AggFunc::DenseRank, None, "drk"),
    ]
}

#[test]
fn row_number_restarts_per_partition() {
    let schema = schema();
    let mut op = WindowOperator::try_new(
        Arc::clone(&schema),
        vec![FunctionSpec::new(AggFunc::RowNumber, None, "rn")],
        vec![0],
        vec![SortKey::asc(1)],
        OperatorOptions::default(),
        Collaborators::single_process(test_config()),
    )
    .expect("window");
    assert_eq!(op.output_schema().fields().len(), 3);
    let out = drive(&mut op, &schema, &[batch(&schema, vec!["b", "a", "a"], vec![1, 2, 1])])
        .expect("drive");
    assert_eq!(
        string_column(&out, 0),
        vec![Some("a".to_string()), Some("a".to_string()), Some("b".to_string())]
    );
    assert_eq!(i64_column(&out, 1), vec![Some(1), Some(2), Some(1)]);
    assert_eq!(i64_column(&out, 2), vec![Some(1), Some(2), Some(1)]);
}

#[test]
fn partitions_spread_over_workers_rank_as_one() {
    let schema = schema();
    let results = run_workers(3, test_config(), |rank, collaborators| {
        let input = match rank {
            0 => vec![batch(&schema, vec!["a", "b", "a"], vec![3, 10, 1])],
            1 => vec![
                batch(&schema, vec!["a", "c"], vec![2, 5]),
                batch(&schema, vec!["b"], vec![10]),
            ],
            _ => vec![batch(&schema, vec!["a", "b"], vec![2, 7])],
        };
        let mut op = WindowOperator::try_new(
            Arc::clone(&schema),
            functions(),
            vec![0],
            vec![SortKey::asc(1)],
            OperatorOptions::default(),
            collaborators,
        )
        .expect("window");
        drive(&mut op, &schema, &input).expect("drive")
    });

    // every partition must be complete on exactly one worker
    let mut seen: BTreeMap<String, Vec<(i64, i64, i64, i64)>> = BTreeMap::new();
    for batches in &results {
        let mut local: BTreeMap<String, Vec<(i64, i64, i64, i64)>> = BTreeMap::new();
        let p = string_column(batches, 0);
        let o = i64_column(batches, 1);
        let rn = i64_column(batches, 2);
        let rk = i64_column(batches, 3);
        let drk = i64_column(batches, 4);
        for i in 0..p.len() {
            local.entry(p[i].clone().expect("partition")).or_default().push((
                o[i].expect("o"),
                rn[i].expect("rn"),
                rk[i].expect("rk"),
                drk[i].expect("drk"),
            ));
        }
        for (k, rows) in local {
            assert!(seen.insert(k.clone(), rows).is_none(), "partition {k} split across workers");
        }
    }
    assert_eq!(seen["a"], vec![(1, 1, 1, 1), (2, 2, 2, 2), (2, 3, 2, 2), (3, 4, 4, 3)]);
    assert_eq!(seen["b"], vec![(7, 1, 1, 1), (10, 2, 2, 2), (10, 3, 2, 2)]);
    assert_eq!(seen["c"], vec![(5, 1, 1, 1)]);
}

#[test]
fn distribution_functions_over_ties() {
    let schema = schema();
    let mut op = WindowOperator::try_new(
        Arc::clone(&schema),
        vec![
            FunctionSpec::new(AggFunc::PercentRank, None, "pr"),
            FunctionSpec::new(AggFunc::CumeDist, None, "cd"),
        ],
        vec![0],
        vec![SortKey::asc(1)],
        OperatorOptions::default(),
        Collaborators::single_process(test_config()),
    )
    .expect("window");
    let out = drive(&mut op, &schema, &[batch(&schema, vec!["a"; 4], vec![1, 2, 2, 3])])
        .expect("drive");
    let pr = out[0].column(2).as_primitive::<Float64Type>().values().to_vec();
    let cd = out[0].column(3).as_primitive::<Float64Type>().values().to_vec();
    assert_eq!(pr, vec![0.0, 1.0 / 3.0, 1.0 / 3.0, 1.0]);
    assert_eq!(cd, vec![0.25, 0.75, 0.75, 1.0]);
}

#[test]
fn rejects_reduce_function() {
    let schema = schema();
    let err = WindowOperator::try_new(
        Arc::clone(&schema),
        vec![FunctionSpec::new(AggFunc::Sum, Some(1), "s")],
        vec![0],
        vec![SortKey::asc(1)],
        OperatorOptions::default(),
        Collaborators::single_process(test_config()),
    )
    .expect_err("sum is not a window function");
    assert!(matches!(err, tessera_common::TesseraError::InvalidConfig(_)));
}

#[test]
fn skewed_output_is_rebalanced() {
    let schema = schema();
    let config = EngineConfig {
        output_work_stealing: true,
        ..test_config()
    };
    let results = run_workers(2, config, |rank, collaborators| {
        let input = if rank == 0 {
            vec![batch(&schema, vec!["only"; 200], (0..200).collect())]
        } else {
            Vec::new()
        };
        let mut op = WindowOperator::try_new(
            Arc::clone(&schema),
            vec![FunctionSpec::new(AggFunc::RowNumber, None, "rn")],
            vec![0],
            vec![SortKey::asc(1)],
            OperatorOptions::default(),
            collaborators,
        )
        .expect("window");
        drive(&mut op, &schema, &input).expect("drive")
    });
    assert_eq!(support::total_rows(&results[0]), 100);
    assert_eq!(support::total_rows(&results[1]), 100);
    let mut rn = results
        .iter()
        .flat_map(|b| i64_column(b, 2))
        .map(|v| v.expect("row number"))
        .collect::<Vec<_>>();
    rn.sort_unstable();
    assert_eq!(rn, (1..=200).collect::<Vec<_>>());
}
