//! Host-facing operators.
//!
//! Every operator follows the same protocol: the host calls
//! `build_consume_batch(batch, is_last)` until it returns `true` (global
//! completion, which may lag the local `is_last`), then
//! `produce_output_batch(true)` until the returned flag is `true`. With
//! `parallel` set, every worker must drive its operator in lock-step since
//! builds, exchanges and output rebalancing are collective. Dropping an
//! operator releases its memory and deletes its spill blocks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tessera_common::{
    BufferPool, EngineConfig, MetricsSink, NoopMetrics, OperatorBufferPool, OperatorId,
    OperatorMetric, Result, StageId, TesseraError,
};
use tessera_exchange::{Collective, SingleProcess};
use tessera_spill::{SharedSpillManager, SpillManager, SpillableChunks};
use tracing::{debug, info, info_span, warn};

use crate::colset::{AggFunc, ColSet, FuncKind};
use crate::column::supported_key_type;
use crate::cumulative::CumulativeEngine;
use crate::groupby::{AggLayout, GroupbyEngine};
use crate::join::{HashJoinEngine, JoinLayout, JoinType, NestedLoopJoinEngine, RowPredicate};
use crate::output::ChunkedOutputBuffer;
use crate::sort::{GlobalSort, LocalSort, SortKey};
use crate::sync::{IsLastSync, should_shuffle};
use crate::window::WindowEngine;

/// One requested function: `func` over input column `input`, producing the
/// output column `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub func: AggFunc,
    pub input: Option<usize>,
    pub name: String,
}

impl FunctionSpec {
    pub fn new(func: AggFunc, input: Option<usize>, name: impl Into<String>) -> Self {
        Self {
            func,
            input,
            name: name.into(),
        }
    }
}

/// Push protocol shared by every operator.
pub trait BatchOperator {
    fn output_schema(&self) -> &SchemaRef;

    /// Consume one input batch (the build side for joins); returns whether
    /// every worker has seen its last batch.
    fn build_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool>;

    /// Next output batch (empty when `want_output` is false or nothing is
    /// ready) and whether this worker's output is exhausted.
    fn produce_output_batch(&mut self, want_output: bool) -> Result<(RecordBatch, bool)>;
}

/// Per-operator options; unset values fall back to [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorOptions {
    pub operator_id: OperatorId,
    /// Coordinate with the other workers. When false the operator only sees
    /// this worker's rows.
    pub parallel: bool,
    pub output_batch_size: Option<usize>,
    pub memory_budget_bytes: Option<usize>,
    pub sync_iter: Option<usize>,
    /// Whether NULL keys are equal to each other when grouping.
    pub null_equal: bool,
    /// Cumulative functions skip NULL inputs instead of propagating them.
    pub skipna: bool,
    /// Cumulative functions leave rows with a NULL key ungrouped.
    pub dropna: bool,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            operator_id: OperatorId(0),
            parallel: true,
            output_batch_size: None,
            memory_budget_bytes: None,
            sync_iter: None,
            null_equal: true,
            skipna: true,
            dropna: true,
        }
    }
}

/// Services an operator calls out to. Passed explicitly; nothing is global.
#[derive(Clone)]
pub struct Collaborators {
    pub collective: Arc<dyn Collective>,
    pub sort: Arc<dyn GlobalSort>,
    pub metrics: Arc<dyn MetricsSink>,
    pub pool: Arc<BufferPool>,
    pub config: EngineConfig,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("rank", &self.collective.rank())
            .field("size", &self.collective.size())
            .field("pool_bytes", &self.pool.total_bytes())
            .field("config", &self.config)
            .finish()
    }
}

impl Collaborators {
    /// One worker, local sort, no metrics.
    pub fn single_process(config: EngineConfig) -> Self {
        Self {
            collective: Arc::new(SingleProcess),
            sort: Arc::new(LocalSort),
            metrics: Arc::new(NoopMetrics),
            pool: BufferPool::new(config.memory_budget_bytes),
            config,
        }
    }

    #[must_use]
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: Arc<dyn GlobalSort>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }
}

/// State every operator shares: budget, spill tiers, is-last sync and
/// output staging.
struct OperatorCore {
    kind: &'static str,
    options: OperatorOptions,
    collaborators: Collaborators,
    collective: Arc<dyn Collective>,
    pool: Arc<OperatorBufferPool>,
    spill: SharedSpillManager,
    sync: IsLastSync,
    output: ChunkedOutputBuffer,
    complete: bool,
    output_started: bool,
    output_reported: bool,
    build_time: Duration,
    output_rows: u64,
}

impl OperatorCore {
    fn try_new(
        kind: &'static str,
        options: OperatorOptions,
        collaborators: Collaborators,
        output_schema: SchemaRef,
    ) -> Result<Self> {
        let config = &collaborators.config;
        let collective: Arc<dyn Collective> = if options.parallel {
            Arc::clone(&collaborators.collective)
        } else {
            Arc::new(SingleProcess)
        };
        let budget = options
            .memory_budget_bytes
            .unwrap_or_else(|| config.operator_budget());
        let pool = collaborators
            .pool
            .operator_pool(budget, config.operator_error_threshold_pct);
        let spill = Arc::new(Mutex::new(SpillManager::try_new(
            &config.spill_tiers,
            collective.rank(),
        )?));
        let sync = IsLastSync::new(options.sync_iter.unwrap_or(config.sync_iter));
        let output = ChunkedOutputBuffer::new(
            output_schema,
            options.output_batch_size.unwrap_or(config.output_batch_size),
        );
        info!(
            operator_id = %options.operator_id,
            operator = kind,
            rank = collective.rank(),
            workers = collective.size(),
            budget_bytes = budget,
            parallel = options.parallel,
            "operator initialized"
        );
        Ok(Self {
            kind,
            options,
            collaborators,
            collective,
            pool,
            spill,
            sync,
            output,
            complete: false,
            output_started: false,
            output_reported: false,
            build_time: Duration::ZERO,
            output_rows: 0,
        })
    }

    fn rank(&self) -> usize {
        self.collective.rank()
    }

    fn sync_iter(&self) -> usize {
        self.options
            .sync_iter
            .unwrap_or(self.collaborators.config.sync_iter)
    }

    /// Engines that append result columns only know their output schema
    /// once built.
    fn set_output_schema(&mut self, schema: SchemaRef) {
        let batch_size = self
            .options
            .output_batch_size
            .unwrap_or(self.collaborators.config.output_batch_size);
        self.output = ChunkedOutputBuffer::new(schema, batch_size);
    }

    fn parallel(&self) -> bool {
        self.collective.size() > 1
    }

    fn config(&self) -> &EngineConfig {
        &self.collaborators.config
    }

    fn chunks(&self, schema: SchemaRef) -> SpillableChunks {
        SpillableChunks::new(schema, self.pool.reservation(), Arc::clone(&self.spill))
    }

    fn ensure_building(&self) -> Result<()> {
        if self.complete {
            return Err(TesseraError::Execution(format!(
                "{} received input after its build completed",
                self.kind
            )));
        }
        Ok(())
    }

    fn emit(&mut self, batch: RecordBatch) {
        self.output_rows += batch.num_rows() as u64;
        self.output.append(batch);
    }

    /// Common tail of every operator's metrics.
    fn stage_metrics(&self, mut metrics: Vec<OperatorMetric>) -> Vec<OperatorMetric> {
        metrics.push(OperatorMetric::timer(
            "build_time",
            self.build_time.as_micros() as u64,
        ));
        metrics.push(OperatorMetric::stat("peak_bytes", self.pool.peak_bytes() as i64));
        match self.spill.lock() {
            Ok(spill) => {
                let stats = spill.stats();
                metrics.extend([
                    OperatorMetric::stat("spill_blocks_written", stats.blocks_written as i64),
                    OperatorMetric::stat("spill_bytes_written", stats.bytes_written as i64),
                    OperatorMetric::stat("spill_bytes_read", stats.bytes_read as i64),
                ]);
            }
            Err(_) => warn!(operator = self.kind, "spill manager lock poisoned"),
        }
        metrics
    }

    fn report(&self, stage: StageId, metrics: Vec<OperatorMetric>) {
        self.collaborators
            .metrics
            .register_operator_stage_metrics(self.options.operator_id, stage, metrics);
    }

    fn produce(&mut self, want_output: bool) -> Result<(RecordBatch, bool)> {
        if self.complete && !self.output_started {
            self.output_started = true;
            if self.parallel() && self.config().output_work_stealing {
                let moved = self.output.rebalance(self.collective.as_ref())?;
                debug!(
                    operator_id = %self.options.operator_id,
                    rank = self.rank(),
                    rows_received = moved,
                    "output work stealing"
                );
            }
        }
        let schema = Arc::clone(self.output.schema());
        let batch = match want_output {
            true => self.output.pop()?,
            false => None,
        }
        .unwrap_or_else(|| RecordBatch::new_empty(schema));
        let done = self.complete && self.output.is_empty();
        if done && !self.output_reported {
            self.output_reported = true;
            self.report(
                StageId::OUTPUT,
                vec![OperatorMetric::stat("output_rows", self.output_rows as i64)],
            );
        }
        Ok((batch, done))
    }
}

fn check_input(schema: &SchemaRef, spec: &FunctionSpec) -> Result<()> {
    match spec.input {
        Some(i) if i >= schema.fields().len() => Err(TesseraError::InvalidConfig(format!(
            "{} input column {i} out of range for {} columns",
            spec.func,
            schema.fields().len()
        ))),
        _ => Ok(()),
    }
}

fn check_keys(schema: &SchemaRef, keys: impl IntoIterator<Item = usize>) -> Result<()> {
    for k in keys {
        let field = schema.fields().get(k).ok_or_else(|| {
            TesseraError::InvalidConfig(format!("key column {k} out of range"))
        })?;
        if !supported_key_type(field.data_type()) {
            return Err(TesseraError::InvalidConfig(format!(
                "key column {} has unsupported type {}",
                field.name(),
                field.data_type()
            )));
        }
    }
    Ok(())
}

/// Grouped aggregation with reduce functions.
pub struct GroupbyOperator {
    core: OperatorCore,
    engine: GroupbyEngine,
}

impl std::fmt::Debug for GroupbyOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupbyOperator").finish_non_exhaustive()
    }
}

impl GroupbyOperator {
    /// `schema` lists the `key_count` key columns first.
    pub fn try_new(
        schema: SchemaRef,
        functions: Vec<FunctionSpec>,
        key_count: usize,
        options: OperatorOptions,
        collaborators: Collaborators,
    ) -> Result<Self> {
        if key_count > schema.fields().len() {
            return Err(TesseraError::InvalidConfig(format!(
                "{key_count} key columns requested over a {}-column input",
                schema.fields().len()
            )));
        }
        check_keys(&schema, 0..key_count)?;
        let mut colsets = Vec::with_capacity(functions.len());
        for spec in &functions {
            check_input(&schema, spec)?;
            if spec.func.kind() != FuncKind::Reduce {
                return Err(TesseraError::InvalidConfig(format!(
                    "{} is not a reduce function",
                    spec.func
                )));
            }
            let input_type = spec.input.map(|i| schema.field(i).data_type());
            colsets.push(ColSet::try_new(spec.func, spec.input, input_type)?);
        }
        let names = functions.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        let layout = AggLayout::try_new(&schema, key_count, colsets, &names)?;
        let output_schema = Arc::clone(&layout.output_schema);
        let core = OperatorCore::try_new("groupby", options, collaborators, output_schema)?;
        let engine = GroupbyEngine::try_new(
            layout,
            core.options.null_equal,
            core.rank(),
            core.collective.size(),
            Arc::clone(&core.pool),
            Arc::clone(&core.spill),
            core.config().max_partition_depth,
        )?;
        Ok(Self { core, engine })
    }
}

impl BatchOperator for GroupbyOperator {
    fn output_schema(&self) -> &SchemaRef {
        &self.engine.layout().output_schema
    }

    fn build_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool> {
        self.core.ensure_building()?;
        let started = Instant::now();
        let _span = info_span!(
            "groupby_build",
            operator_id = %self.core.options.operator_id,
            rank = self.core.rank()
        )
        .entered();
        self.engine.consume(batch)?;
        let collective = Arc::clone(&self.core.collective);
        let global_last = match self.core.sync.step(collective.as_ref(), is_last)? {
            Some(global_last) => {
                let over = self.engine.wants_exchange()
                    || self.engine.shuffle_bytes() > self.core.config().shuffle_threshold_bytes;
                if self.core.parallel() && should_shuffle(collective.as_ref(), over, global_last)? {
                    self.engine.exchange(collective.as_ref())?;
                }
                global_last
            }
            None => false,
        };
        if global_last {
            for batch in self.engine.finalize()? {
                self.core.emit(batch);
            }
            self.core.complete = true;
        }
        self.core.build_time += started.elapsed();
        if global_last {
            let stats = self.engine.stats();
            info!(
                operator_id = %self.core.options.operator_id,
                rank = self.core.rank(),
                input_rows = stats.input_rows,
                groups = stats.output_rows,
                shuffles = stats.shuffles,
                partitions = self.engine.partition_count(),
                "groupby build finished"
            );
            let metrics = self.core.stage_metrics(vec![
                OperatorMetric::stat("input_rows", stats.input_rows as i64),
                OperatorMetric::stat("update_rows", stats.update_rows as i64),
                OperatorMetric::stat("groups", stats.output_rows as i64),
                OperatorMetric::stat("shuffles", stats.shuffles as i64),
                OperatorMetric::stat("rows_shuffled_out", stats.rows_shuffled_out as i64),
                OperatorMetric::stat("rows_shuffled_in", stats.rows_shuffled_in as i64),
                OperatorMetric::stat("partition_splits", stats.partition_splits as i64),
                OperatorMetric::stat("max_partition_depth", i64::from(stats.max_partition_depth)),
            ]);
            self.core.report(StageId::BUILD, metrics);
        }
        Ok(global_last)
    }

    fn produce_output_batch(&mut self, want_output: bool) -> Result<(RecordBatch, bool)> {
        self.core.produce(want_output)
    }
}

impl Drop for GroupbyOperator {
    fn drop(&mut self) {
        if let Err(e) = self.engine.release() {
            warn!(
                operator_id = %self.core.options.operator_id,
                error = %e,
                "groupby release failed"
            );
        }
    }
}

/// Keys and strategy of a join.
#[derive(Clone)]
pub enum JoinSpec {
    Hash {
        probe_keys: Vec<usize>,
        build_keys: Vec<usize>,
        join_type: JoinType,
        /// NULL keys match each other.
        null_equal: bool,
        /// Replicate the build side on every worker instead of partitioning
        /// both sides by key.
        broadcast_build: bool,
    },
    NestedLoop {
        join_type: JoinType,
        predicate: RowPredicate,
    },
}

impl std::fmt::Debug for JoinSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hash {
                probe_keys,
                build_keys,
                join_type,
                null_equal,
                broadcast_build,
            } => f
                .debug_struct("Hash")
                .field("probe_keys", probe_keys)
                .field("build_keys", build_keys)
                .field("join_type", join_type)
                .field("null_equal", null_equal)
                .field("broadcast_build", broadcast_build)
                .finish(),
            Self::NestedLoop { join_type, .. } => f
                .debug_struct("NestedLoop")
                .field("join_type", join_type)
                .finish(),
        }
    }
}

#[derive(Debug)]
enum JoinEngine {
    Hash(HashJoinEngine),
    NestedLoop(NestedLoopJoinEngine),
}

/// Join of a probe stream against a build side consumed first.
///
/// After `build_consume_batch` returns `true`, the host streams the probe
/// side through `probe_consume_batch` until it returns `true`; output can be
/// drained at any point and is complete once the probe side is.
pub struct HashJoinOperator {
    core: OperatorCore,
    engine: JoinEngine,
    probe_sync: IsLastSync,
    build_complete: bool,
    probe_time: Duration,
}

impl std::fmt::Debug for HashJoinOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJoinOperator").finish_non_exhaustive()
    }
}

impl HashJoinOperator {
    pub fn try_new(
        probe_schema: SchemaRef,
        build_schema: SchemaRef,
        spec: JoinSpec,
        options: OperatorOptions,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let (layout, hash) = match &spec {
            JoinSpec::Hash {
                probe_keys,
                build_keys,
                join_type,
                null_equal,
                broadcast_build,
            } => {
                check_keys(&probe_schema, probe_keys.iter().copied())?;
                check_keys(&build_schema, build_keys.iter().copied())?;
                (
                    JoinLayout::try_new(
                        probe_schema,
                        build_schema,
                        probe_keys.clone(),
                        build_keys.clone(),
                        *join_type,
                    )?,
                    Some((*null_equal, *broadcast_build)),
                )
            }
            JoinSpec::NestedLoop { join_type, .. } => {
                let layout = JoinLayout::try_new(
                    probe_schema,
                    build_schema,
                    Vec::new(),
                    Vec::new(),
                    *join_type,
                )?;
                (layout, None)
            }
        };
        let core = OperatorCore::try_new(
            "join",
            options,
            collaborators,
            Arc::clone(&layout.output_schema),
        )?;
        let engine = match (spec, hash) {
            (_, Some((null_equal, broadcast_build))) => JoinEngine::Hash(HashJoinEngine::try_new(
                layout,
                null_equal,
                broadcast_build,
                core.rank(),
                core.collective.size(),
                Arc::clone(&core.pool),
                Arc::clone(&core.spill),
                core.config().max_partition_depth,
            )?),
            (JoinSpec::NestedLoop { predicate, .. }, None) => {
                JoinEngine::NestedLoop(NestedLoopJoinEngine::try_new(
                    layout,
                    predicate,
                    &core.pool,
                    Arc::clone(&core.spill),
                )?)
            }
            (JoinSpec::Hash { .. }, None) => {
                return Err(TesseraError::InvalidConfig("inconsistent join spec".to_string()))
            }
        };
        let probe_sync = IsLastSync::new(core.sync_iter());
        Ok(Self {
            core,
            engine,
            probe_sync,
            build_complete: false,
            probe_time: Duration::ZERO,
        })
    }

    /// Join one probe batch; returns whether every worker has finished the
    /// probe side.
    pub fn probe_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool> {
        if !self.build_complete {
            return Err(TesseraError::Execution(
                "join received probe input before its build completed".to_string(),
            ));
        }
        self.core.ensure_building()?;
        let started = Instant::now();
        let collective = Arc::clone(&self.core.collective);
        let out = match &mut self.engine {
            JoinEngine::Hash(engine) => engine.probe(collective.as_ref(), batch)?,
            JoinEngine::NestedLoop(engine) => engine.probe(collective.as_ref(), batch)?,
        };
        self.core.emit(out);
        let global_last = self.probe_sync.step(collective.as_ref(), is_last)? == Some(true);
        if global_last {
            let rest = match &mut self.engine {
                JoinEngine::Hash(engine) => engine.finish_probe(collective.as_ref())?,
                JoinEngine::NestedLoop(engine) => engine.finish_probe()?,
            };
            for batch in rest {
                self.core.emit(batch);
            }
            self.core.complete = true;
        }
        self.probe_time += started.elapsed();
        if global_last {
            let stats = self.stats();
            info!(
                operator_id = %self.core.options.operator_id,
                rank = self.core.rank(),
                probe_rows = stats.probe_rows,
                output_rows = stats.output_rows,
                "join probe finished"
            );
            self.core.report(
                StageId::PROBE,
                vec![
                    OperatorMetric::timer("probe_time", self.probe_time.as_micros() as u64),
                    OperatorMetric::stat("probe_rows", stats.probe_rows as i64),
                    OperatorMetric::stat("output_rows", stats.output_rows as i64),
                ],
            );
        }
        Ok(global_last)
    }

    fn stats(&self) -> crate::join::JoinStats {
        match &self.engine {
            JoinEngine::Hash(e) => e.stats(),
            JoinEngine::NestedLoop(e) => e.stats(),
        }
    }
}

impl BatchOperator for HashJoinOperator {
    fn output_schema(&self) -> &SchemaRef {
        self.core.output.schema()
    }

    fn build_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool> {
        if self.build_complete {
            return Err(TesseraError::Execution(
                "join received build input after its build completed".to_string(),
            ));
        }
        let started = Instant::now();
        let collective = Arc::clone(&self.core.collective);
        let global_last = match &mut self.engine {
            JoinEngine::Hash(engine) => {
                engine.consume_build(batch)?;
                match self.core.sync.step(collective.as_ref(), is_last)? {
                    Some(global_last) => {
                        let threshold = self.core.config().shuffle_threshold_bytes;
                        let over = engine.wants_exchange() || engine.shuffle_bytes() > threshold;
                        if !global_last
                            && collective.size() > 1
                            && should_shuffle(collective.as_ref(), over, global_last)?
                        {
                            engine.exchange_build(collective.as_ref())?;
                        }
                        if global_last {
                            engine.finish_build(collective.as_ref())?;
                        }
                        global_last
                    }
                    None => false,
                }
            }
            JoinEngine::NestedLoop(engine) => {
                engine.consume_build(batch)?;
                let global_last = self.core.sync.step(collective.as_ref(), is_last)? == Some(true);
                if global_last {
                    engine.finish_build()?;
                }
                global_last
            }
        };
        self.core.build_time += started.elapsed();
        if global_last {
            self.build_complete = true;
            let stats = self.stats();
            info!(
                operator_id = %self.core.options.operator_id,
                rank = self.core.rank(),
                build_rows = stats.build_rows,
                "join build finished"
            );
            let metrics = self.core.stage_metrics(vec![
                OperatorMetric::stat("build_rows", stats.build_rows as i64),
                OperatorMetric::stat("build_shuffles", stats.build_shuffles as i64),
                OperatorMetric::stat("rows_shuffled_out", stats.rows_shuffled_out as i64),
                OperatorMetric::stat("build_partitions", stats.build_partitions as i64),
            ]);
            self.core.report(StageId::BUILD, metrics);
        }
        Ok(global_last)
    }

    fn produce_output_batch(&mut self, want_output: bool) -> Result<(RecordBatch, bool)> {
        self.core.produce(want_output)
    }
}

impl Drop for HashJoinOperator {
    fn drop(&mut self) {
        let released = match &mut self.engine {
            JoinEngine::Hash(e) => e.release(),
            JoinEngine::NestedLoop(e) => e.release(),
        };
        if let Err(e) = released {
            warn!(
                operator_id = %self.core.options.operator_id,
                error = %e,
                "join release failed"
            );
        }
    }
}

/// Window functions over partitions ordered by sort keys.
pub struct WindowOperator {
    core: OperatorCore,
    engine: WindowEngine,
}

impl std::fmt::Debug for WindowOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowOperator").finish_non_exhaustive()
    }
}

impl WindowOperator {
    pub fn try_new(
        schema: SchemaRef,
        functions: Vec<FunctionSpec>,
        partition_keys: Vec<usize>,
        order_keys: Vec<SortKey>,
        options: OperatorOptions,
        collaborators: Collaborators,
    ) -> Result<Self> {
        check_keys(&schema, partition_keys.iter().copied())?;
        let sort = Arc::clone(&collaborators.sort);
        let mut core =
            OperatorCore::try_new("window", options, collaborators, Arc::clone(&schema))?;
        let engine = WindowEngine::try_new(
            Arc::clone(&schema),
            partition_keys,
            order_keys,
            &functions,
            sort,
            core.chunks(schema),
            core.pool.reservation(),
        )?;
        core.set_output_schema(Arc::clone(engine.output_schema()));
        Ok(Self { core, engine })
    }
}

impl BatchOperator for WindowOperator {
    fn output_schema(&self) -> &SchemaRef {
        self.engine.output_schema()
    }

    fn build_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool> {
        self.core.ensure_building()?;
        let started = Instant::now();
        self.engine.consume(batch)?;
        let collective = Arc::clone(&self.core.collective);
        let global_last = self.core.sync.step(collective.as_ref(), is_last)? == Some(true);
        if global_last {
            let out = self.engine.finalize(collective.as_ref())?;
            self.core.emit(out);
            self.core.complete = true;
        }
        self.core.build_time += started.elapsed();
        if global_last {
            info!(
                operator_id = %self.core.options.operator_id,
                rank = self.core.rank(),
                input_rows = self.engine.input_rows(),
                output_rows = self.core.output_rows,
                "window build finished"
            );
            let metrics = self.core.stage_metrics(vec![
                OperatorMetric::stat("input_rows", self.engine.input_rows() as i64),
                OperatorMetric::stat("sorted_rows", self.core.output_rows as i64),
            ]);
            self.core.report(StageId::BUILD, metrics);
        }
        Ok(global_last)
    }

    fn produce_output_batch(&mut self, want_output: bool) -> Result<(RecordBatch, bool)> {
        self.core.produce(want_output)
    }
}

impl Drop for WindowOperator {
    fn drop(&mut self) {
        if let Err(e) = self.engine.release() {
            warn!(
                operator_id = %self.core.options.operator_id,
                error = %e,
                "window release failed"
            );
        }
    }
}

/// Cumulative group transforms; output rows keep the input order of each
/// worker.
pub struct CumulativeOperator {
    core: OperatorCore,
    engine: CumulativeEngine,
}

impl std::fmt::Debug for CumulativeOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CumulativeOperator").finish_non_exhaustive()
    }
}

impl CumulativeOperator {
    pub fn try_new(
        schema: SchemaRef,
        functions: Vec<FunctionSpec>,
        key_count: usize,
        options: OperatorOptions,
        collaborators: Collaborators,
    ) -> Result<Self> {
        check_keys(&schema, 0..key_count)?;
        for spec in &functions {
            check_input(&schema, spec)?;
        }
        let max_groups = collaborators.config.exscan_max_groups;
        let mut core =
            OperatorCore::try_new("cumulative", options, collaborators, Arc::clone(&schema))?;
        let engine = CumulativeEngine::try_new(
            Arc::clone(&schema),
            key_count,
            &functions,
            core.options.skipna,
            core.options.dropna,
            max_groups,
            core.chunks(schema),
            core.pool.reservation(),
        )?;
        core.set_output_schema(Arc::clone(engine.output_schema()));
        Ok(Self { core, engine })
    }

    /// Whether the prefix-scan path was taken (known after the build).
    pub fn used_prefix_scan(&self) -> bool {
        self.engine.stats().used_prefix_scan
    }
}

impl BatchOperator for CumulativeOperator {
    fn output_schema(&self) -> &SchemaRef {
        self.engine.output_schema()
    }

    fn build_consume_batch(&mut self, batch: &RecordBatch, is_last: bool) -> Result<bool> {
        self.core.ensure_building()?;
        let started = Instant::now();
        self.engine.consume(batch)?;
        let collective = Arc::clone(&self.core.collective);
        let global_last = self.core.sync.step(collective.as_ref(), is_last)? == Some(true);
        if global_last {
            let out = self.engine.finalize(collective.as_ref())?;
            self.core.emit(out);
            self.core.complete = true;
        }
        self.core.build_time += started.elapsed();
        if global_last {
            let stats = self.engine.stats();
            let strategy = if stats.used_prefix_scan { "prefix_scan" } else { "shuffle" };
            info!(
                operator_id = %self.core.options.operator_id,
                rank = self.core.rank(),
                input_rows = stats.input_rows,
                strategy,
                "cumulative build finished"
            );
            let metrics = self.core.stage_metrics(vec![
                OperatorMetric::stat("input_rows", stats.input_rows as i64),
                OperatorMetric::stat("global_groups", stats.global_groups as i64),
                OperatorMetric::stat("gathered_keys", stats.gathered_keys as i64),
                OperatorMetric::blob("strategy", strategy),
            ]);
            self.core.report(StageId::BUILD, metrics);
        }
        Ok(global_last)
    }

    fn produce_output_batch(&mut self, want_output: bool) -> Result<(RecordBatch, bool)> {
        self.core.produce(want_output)
    }
}
