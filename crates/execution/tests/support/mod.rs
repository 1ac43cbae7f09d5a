#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use arrow::array::{Array, AsArray};
use arrow::datatypes::{Int64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{
    EngineConfig, MetricsSink, OperatorId, OperatorMetric, Result, SpillLocation, SpillTier,
    StageId,
};
use tessera_exchange::LocalCollectiveGroup;
use tessera_execution::{BatchOperator, Collaborators, HashJoinOperator, SampleSort};

static TRACING: Once = Once::new();

/// Route operator logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config for test workers: small output batches, sync every call, output
/// stays on the worker that produced it.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        sync_iter: 1,
        output_batch_size: 64,
        output_work_stealing: false,
        ..EngineConfig::default()
    }
}

/// Run `worker(rank, collaborators)` on `n` threads connected by an
/// in-process collective. Every worker spills into its own temp directory.
pub fn run_workers<T, F>(n: usize, config: EngineConfig, worker: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, Collaborators) -> T + Sync,
{
    init_tracing();
    let dirs = (0..n)
        .map(|_| tempfile::tempdir().expect("tempdir"))
        .collect::<Vec<_>>();
    let endpoints = LocalCollectiveGroup::create(n);
    std::thread::scope(|scope| {
        let handles = endpoints
            .into_iter()
            .zip(&dirs)
            .enumerate()
            .map(|(rank, (endpoint, dir))| {
                let mut config = config.clone();
                config.spill_tiers = vec![SpillTier {
                    location: SpillLocation::Local(dir.path().to_path_buf()),
                    quota_bytes: config.spill_tiers.first().and_then(|t| t.quota_bytes),
                }];
                let worker = &worker;
                scope.spawn(move || {
                    let collaborators = Collaborators::single_process(config)
                        .with_collective(Arc::new(endpoint))
                        .with_sort(Arc::new(SampleSort::default()));
                    worker(rank, collaborators)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    })
}

/// Push `input` through the operator in lock-step with the other workers and
/// drain its output.
pub fn drive<O: BatchOperator>(
    op: &mut O,
    schema: &SchemaRef,
    input: &[RecordBatch],
) -> Result<Vec<RecordBatch>> {
    let empty = RecordBatch::new_empty(Arc::clone(schema));
    let mut i = 0;
    loop {
        let batch = input.get(i).unwrap_or(&empty);
        let is_last = i + 1 >= input.len();
        i += 1;
        if op.build_consume_batch(batch, is_last)? {
            break;
        }
    }
    drain(op)
}

/// Build side first, then the probe side, then drain.
pub fn drive_join(
    op: &mut HashJoinOperator,
    build_schema: &SchemaRef,
    build: &[RecordBatch],
    probe_schema: &SchemaRef,
    probe: &[RecordBatch],
) -> Result<Vec<RecordBatch>> {
    let empty = RecordBatch::new_empty(Arc::clone(build_schema));
    let mut i = 0;
    loop {
        let batch = build.get(i).unwrap_or(&empty);
        let is_last = i + 1 >= build.len();
        i += 1;
        if op.build_consume_batch(batch, is_last)? {
            break;
        }
    }
    let empty = RecordBatch::new_empty(Arc::clone(probe_schema));
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let batch = probe.get(i).unwrap_or(&empty);
        let is_last = i + 1 >= probe.len();
        i += 1;
        let done = op.probe_consume_batch(batch, is_last)?;
        let (ready, _) = op.produce_output_batch(true)?;
        if ready.num_rows() > 0 {
            out.push(ready);
        }
        if done {
            break;
        }
    }
    out.extend(drain(op)?);
    Ok(out)
}

pub fn drain<O: BatchOperator>(op: &mut O) -> Result<Vec<RecordBatch>> {
    let mut out = Vec::new();
    loop {
        let (batch, done) = op.produce_output_batch(true)?;
        if batch.num_rows() > 0 {
            out.push(batch);
        }
        if done {
            return Ok(out);
        }
    }
}

pub fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

/// Int64 column `col` of every row, NULL as `None`.
pub fn i64_column(batches: &[RecordBatch], col: usize) -> Vec<Option<i64>> {
    batches
        .iter()
        .flat_map(|b| {
            let a = b.column(col).as_primitive::<Int64Type>();
            (0..a.len())
                .map(|i| (!a.is_null(i)).then(|| a.value(i)))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Column `col` rendered as strings (dictionary columns by value).
pub fn string_column(batches: &[RecordBatch], col: usize) -> Vec<Option<String>> {
    batches
        .iter()
        .flat_map(|b| {
            let a = arrow::compute::cast(b.column(col), &arrow::datatypes::DataType::Utf8)
                .expect("cast to utf8");
            let a = a.as_string::<i32>();
            (0..a.len())
                .map(|i| (!a.is_null(i)).then(|| a.value(i).to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Metrics sink that keeps every report for inspection.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    reports: Mutex<Vec<(OperatorId, StageId, Vec<OperatorMetric>)>>,
}

impl RecordingMetrics {
    /// Last reported value of the named statistic.
    pub fn stat(&self, name: &str) -> Option<i64> {
        let reports = self.reports.lock().expect("metrics lock");
        reports
            .iter()
            .flat_map(|(_, _, metrics)| metrics.iter())
            .filter_map(|m| match m {
                OperatorMetric::Stat { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .last()
    }

    pub fn blob(&self, name: &str) -> Option<String> {
        let reports = self.reports.lock().expect("metrics lock");
        reports
            .iter()
            .flat_map(|(_, _, metrics)| metrics.iter())
            .filter_map(|m| match m {
                OperatorMetric::Blob { name: n, value } if n == name => Some(value.clone()),
                _ => None,
            })
            .last()
    }

    pub fn stages(&self) -> Vec<StageId> {
        let reports = self.reports.lock().expect("metrics lock");
        reports.iter().map(|(_, stage, _)| *stage).collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn register_operator_stage_metrics(
        &self,
        operator_id: OperatorId,
        stage_id: StageId,
        metrics: Vec<OperatorMetric>,
    ) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((operator_id, stage_id, metrics));
        }
    }
}
