//! Cumulative group transforms (`cumsum`, `cummin`, `cummax`, `cumprod`).
//!
//! Two evaluation paths produce identical results:
//!
//! - prefix scan: when the global number of distinct keys is small, workers
//!   agree on a dense key index, compute local running values and fix them up
//!   with one exclusive scan per function. No input row moves.
//! - shuffle: rows are tagged with their origin, shuffled by key, accumulated
//!   in origin order and shuffled back.
//!
//! In both, the processing order within a key is rank first, then row.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use tessera_common::{MemoryReservation, Result, TesseraError};
use tessera_exchange::{
    Collective, CollectiveExt, ReduceOp, ScanValue, all_gather_batches, shuffle_batch,
    shuffle_by_key,
};
use tessera_spill::SpillableChunks;
use tracing::{debug, warn};

use crate::colset::{AggFunc, FuncKind, NumKind, NumericView};
use crate::column::{ArrayView, plain_keys};
use crate::group_index::GroupIndex;
use crate::groupby::hash_keys;
use crate::operator::FunctionSpec;

#[derive(Debug, Clone)]
struct CumFunc {
    input: usize,
    kind: NumKind,
    op: ReduceOp,
}

impl CumFunc {
    fn try_new(spec: &FunctionSpec, schema: &SchemaRef) -> Result<Self> {
        if spec.func.kind() != FuncKind::Cumulative {
            return Err(TesseraError::InvalidConfig(format!(
                "{} is not a cumulative function",
                spec.func
            )));
        }
        let input = spec.input.ok_or_else(|| {
            TesseraError::InvalidConfig(format!("{} requires an input column", spec.func))
        })?;
        let field = schema.fields().get(input).ok_or_else(|| {
            TesseraError::InvalidConfig(format!("input column {input} out of range"))
        })?;
        let kind = NumKind::of(field.data_type()).ok_or_else(|| {
            TesseraError::InvalidConfig(format!(
                "{} is not supported on {} columns",
                spec.func,
                field.data_type()
            ))
        })?;
        let op = match spec.func {
            AggFunc::Cumsum => ReduceOp::Sum,
            AggFunc::Cumprod => ReduceOp::Prod,
            AggFunc::Cummin => ReduceOp::Min,
            _ => ReduceOp::Max,
        };
        Ok(Self { input, kind, op })
    }
}

/// Running values of one function over rows in processing order.
struct Running<T> {
    out: Vec<Option<T>>,
    totals: Vec<T>,
    saw_null: Vec<u8>,
}

impl<T: ScanValue> Running<T> {
    fn compute(
        op: ReduceOp,
        value: impl Fn(usize) -> Option<T>,
        groups: &[Option<u32>],
        n_groups: usize,
        skipna: bool,
    ) -> Self {
        let mut totals = vec![T::identity(op); n_groups];
        let mut saw_null = vec![0u8; n_groups];
        let out = groups
            .iter()
            .enumerate()
            .map(|(row, g)| {
                let g = (*g)? as usize;
                match value(row) {
                    None => {
                        if !skipna {
                            saw_null[g] = 1;
                        }
                        None
                    }
                    Some(v) => {
                        totals[g] = T::reduce(op, totals[g], v);
                        (saw_null[g] == 0).then_some(totals[g])
                    }
                }
            })
            .collect();
        Self {
            out,
            totals,
            saw_null,
        }
    }

    /// Fold in what lower ranks accumulated per group.
    fn finish(
        self,
        op: ReduceOp,
        groups: &[Option<u32>],
        prefix: &[T],
        prefix_null: &[u8],
    ) -> Vec<Option<T>> {
        self.out
            .into_iter()
            .zip(groups)
            .map(|(v, g)| {
                let g = (*g)? as usize;
                if prefix_null[g] != 0 {
                    return None;
                }
                v.map(|v| T::reduce(op, prefix[g], v))
            })
            .collect()
    }
}

/// Dense per-row key ids in first-appearance order; rows with a NULL key get
/// no id when `dropna` is set.
fn dense_groups(
    keys: &[ArrayRef],
    n_rows: usize,
    dropna: bool,
) -> Result<(Vec<Option<u32>>, Vec<u32>)> {
    let hashes = hash_keys(keys, n_rows)?;
    let views = ArrayView::views(keys)?;
    let mut index = GroupIndex::with_capacity(n_rows.min(1 << 16));
    let mut reps: Vec<u32> = Vec::new();
    let mut groups = Vec::with_capacity(n_rows);
    for (row, &h) in hashes.iter().enumerate() {
        if dropna && views.iter().any(|v| v.is_null(row)) {
            groups.push(None);
            continue;
        }
        let (g, inserted) = index.find_or_insert(h, |g| {
            let rep = reps[g as usize] as usize;
            views.iter().all(|v| v.rows_equal(rep, v, row, true))
        });
        if inserted {
            reps.push(row as u32);
        }
        groups.push(Some(g));
    }
    Ok((groups, reps))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CumulativeStats {
    pub input_rows: u64,
    pub global_groups: u64,
    /// Distinct keys received from all workers to build the global index.
    pub gathered_keys: u64,
    pub used_prefix_scan: bool,
}

/// Accumulates one worker's input and evaluates the cumulative functions on
/// finalize.
#[derive(Debug)]
pub struct CumulativeEngine {
    key_count: usize,
    funcs: Vec<CumFunc>,
    output_schema: SchemaRef,
    input_schema: SchemaRef,
    skipna: bool,
    dropna: bool,
    max_groups: usize,
    chunks: SpillableChunks,
    input_bytes: usize,
    /// Input and results held in memory by `finalize`.
    reservation: MemoryReservation,
    stats: CumulativeStats,
}

impl CumulativeEngine {
    pub fn try_new(
        schema: SchemaRef,
        key_count: usize,
        functions: &[FunctionSpec],
        skipna: bool,
        dropna: bool,
        max_groups: usize,
        chunks: SpillableChunks,
        reservation: MemoryReservation,
    ) -> Result<Self> {
        if key_count > schema.fields().len() {
            return Err(TesseraError::InvalidConfig(format!(
                "{key_count} key columns requested over a {}-column input",
                schema.fields().len()
            )));
        }
        if functions.is_empty() {
            return Err(TesseraError::InvalidConfig(
                "cumulative operator needs at least one function".to_string(),
            ));
        }
        let funcs = functions
            .iter()
            .map(|f| CumFunc::try_new(f, &schema))
            .collect::<Result<Vec<_>>>()?;
        let mut fields = schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        for (spec, f) in functions.iter().zip(&funcs) {
            fields.push(Field::new(&spec.name, f.kind.output_type(), true));
        }
        Ok(Self {
            key_count,
            funcs,
            output_schema: Arc::new(Schema::new(fields)),
            input_schema: schema,
            skipna,
            dropna,
            max_groups,
            chunks,
            input_bytes: 0,
            reservation,
            stats: CumulativeStats::default(),
        })
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn stats(&self) -> CumulativeStats {
        self.stats
    }

    pub fn consume(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.stats.input_rows += batch.num_rows() as u64;
        self.input_bytes += batch.get_array_memory_size();
        self.chunks.append(batch.clone())?;
        Ok(())
    }

    /// Charge `bytes` of materialized input; fails once above the hard limit.
    fn charge(&mut self, bytes: usize) -> Result<()> {
        if !self.reservation.resize(bytes)? {
            warn!(bytes, "cumulative input over the operator budget");
        }
        Ok(())
    }

    /// Input rows followed by one result column per function, in input
    /// order. Collective.
    pub fn finalize(&mut self, collective: &dyn Collective) -> Result<RecordBatch> {
        let loading = self.input_bytes.saturating_sub(self.chunks.resident_bytes());
        self.charge(loading)?;
        let parts = self.chunks.drain()?;
        self.charge(self.input_bytes)?;
        let input = concat_batches(&self.input_schema, &parts)?;
        drop(parts);
        self.charge(input.get_array_memory_size())?;
        let keys = plain_keys(&input.columns()[..self.key_count])?;
        let (groups, reps) = dense_groups(&keys, input.num_rows(), self.dropna)?;
        let results = match self.global_groups(collective, &keys, &groups, &reps)? {
            Some((global, n_global)) => {
                self.stats.used_prefix_scan = true;
                self.stats.global_groups = n_global as u64;
                self.prefix_scan(collective, &input, &global, n_global)?
            }
            None => self.shuffle_path(collective, &input)?,
        };
        let mut columns = input.columns().to_vec();
        columns.extend(results);
        let out = RecordBatch::try_new_with_options(
            Arc::clone(&self.output_schema),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(input.num_rows())),
        )?;
        self.charge(out.get_array_memory_size())?;
        Ok(out)
    }

    /// Agree on a global dense key index. `None` when there are more distinct
    /// keys than the prefix-scan path handles; every worker sees the same
    /// count, so all of them fall back together. Keys are only gathered once
    /// no worker alone holds more than the ceiling.
    fn global_groups(
        &mut self,
        collective: &dyn Collective,
        keys: &[ArrayRef],
        groups: &[Option<u32>],
        reps: &[u32],
    ) -> Result<Option<(Vec<Option<u32>>, usize)>> {
        if self.key_count == 0 {
            let any = collective.any_or(!reps.is_empty())?;
            return Ok((self.max_groups >= 1).then(|| (groups.to_vec(), usize::from(any))));
        }
        let most_local = collective.allreduce(&[reps.len() as i64], ReduceOp::Max)?[0];
        if most_local as usize > self.max_groups {
            debug!(
                rank = collective.rank(),
                local_groups = reps.len(),
                most_local,
                ceiling = self.max_groups,
                "cumulative keys over the prefix-scan ceiling on one worker"
            );
            return Ok(None);
        }
        let key_fields = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Field::new(format!("k{i}"), k.data_type().clone(), true))
            .collect::<Vec<_>>();
        let key_schema = Arc::new(Schema::new(key_fields));
        let rep_idx = UInt32Array::from(reps.to_vec());
        let local_keys = RecordBatch::try_new(
            Arc::clone(&key_schema),
            keys.iter()
                .map(|k| take(k.as_ref(), &rep_idx, None))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )?;
        let gathered = if collective.size() > 1 {
            all_gather_batches(collective, &local_keys)?
        } else {
            vec![local_keys]
        };
        let offset: usize = gathered[..collective.rank()]
            .iter()
            .map(RecordBatch::num_rows)
            .sum();
        let all = concat_batches(&key_schema, &gathered)?;
        self.stats.gathered_keys += all.num_rows() as u64;
        let (global_ids, global_reps) = dense_groups(all.columns(), all.num_rows(), false)?;
        let n_global = global_reps.len();
        debug!(
            rank = collective.rank(),
            local_groups = reps.len(),
            global_groups = n_global,
            ceiling = self.max_groups,
            "cumulative key dedup"
        );
        if n_global > self.max_groups {
            return Ok(None);
        }
        let mapped = groups
            .iter()
            .map(|g| g.and_then(|g| global_ids[offset + g as usize]))
            .collect();
        Ok(Some((mapped, n_global)))
    }

    fn prefix_scan(
        &self,
        collective: &dyn Collective,
        input: &RecordBatch,
        groups: &[Option<u32>],
        n_groups: usize,
    ) -> Result<Vec<ArrayRef>> {
        self.funcs
            .iter()
            .map(|f| {
                let values = NumericView::try_new(input.column(f.input))?;
                match f.kind {
                    NumKind::Int => {
                        let run = Running::<i64>::compute(
                            f.op,
                            |r| (!values.is_null(r)).then(|| values.i64(r)),
                            groups,
                            n_groups,
                            self.skipna,
                        );
                        let prefix = collective.exscan(&run.totals, f.op)?;
                        let nulls = self.null_prefix(collective, &run.saw_null)?;
                        Ok(int_array(run.finish(f.op, groups, &prefix, &nulls)))
                    }
                    NumKind::Float => {
                        let run = Running::<f64>::compute(
                            f.op,
                            |r| float_value(&values, r),
                            groups,
                            n_groups,
                            self.skipna,
                        );
                        let prefix = collective.exscan(&run.totals, f.op)?;
                        let nulls = self.null_prefix(collective, &run.saw_null)?;
                        Ok(float_array(run.finish(f.op, groups, &prefix, &nulls)))
                    }
                }
            })
            .collect()
    }

    /// Groups for which some lower rank already saw a NULL input.
    fn null_prefix(&self, collective: &dyn Collective, saw_null: &[u8]) -> Result<Vec<u8>> {
        if self.skipna {
            return Ok(vec![0; saw_null.len()]);
        }
        collective.exscan(saw_null, ReduceOp::Max)
    }

    fn shuffle_path(
        &self,
        collective: &dyn Collective,
        input: &RecordBatch,
    ) -> Result<Vec<ArrayRef>> {
        let rank = collective.rank() as i64;
        let n_rows = input.num_rows();
        let mut fields = self
            .input_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        fields.push(Field::new("__origin_rank", DataType::Int64, false));
        fields.push(Field::new("__origin_row", DataType::Int64, false));
        let mut columns = input.columns().to_vec();
        columns.push(Arc::new(Int64Array::from(vec![rank; n_rows])));
        columns.push(Arc::new(Int64Array::from_iter_values(0..n_rows as i64)));
        let tagged = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        let key_columns = (0..self.key_count).collect::<Vec<_>>();
        let received = shuffle_by_key(collective, &tagged, &key_columns)?;

        let keys = plain_keys(&received.columns()[..self.key_count])?;
        let (groups, reps) = dense_groups(&keys, received.num_rows(), self.dropna)?;
        let n_groups = reps.len();
        let origin_rank_col = received.num_columns() - 2;
        let origin_row_col = received.num_columns() - 1;
        let mut back_fields = vec![Field::new("__origin_row", DataType::Int64, false)];
        let mut back_columns: Vec<ArrayRef> = vec![Arc::clone(received.column(origin_row_col))];
        for (i, f) in self.funcs.iter().enumerate() {
            let values = NumericView::try_new(received.column(f.input))?;
            let no_prefix = vec![0u8; n_groups];
            let array = match f.kind {
                NumKind::Int => {
                    let run = Running::<i64>::compute(
                        f.op,
                        |r| (!values.is_null(r)).then(|| values.i64(r)),
                        &groups,
                        n_groups,
                        self.skipna,
                    );
                    let identity = vec![i64::identity(f.op); n_groups];
                    int_array(run.finish(f.op, &groups, &identity, &no_prefix))
                }
                NumKind::Float => {
                    let run = Running::<f64>::compute(
                        f.op,
                        |r| float_value(&values, r),
                        &groups,
                        n_groups,
                        self.skipna,
                    );
                    let identity = vec![f64::identity(f.op); n_groups];
                    float_array(run.finish(f.op, &groups, &identity, &no_prefix))
                }
            };
            back_fields.push(Field::new(format!("__r{i}"), array.data_type().clone(), true));
            back_columns.push(array);
        }
        let targets = received
            .column(origin_rank_col)
            .as_primitive::<Int64Type>()
            .values()
            .iter()
            .map(|&r| r as usize)
            .collect::<Vec<_>>();
        let back = RecordBatch::try_new_with_options(
            Arc::new(Schema::new(back_fields)),
            back_columns,
            &RecordBatchOptions::new().with_row_count(Some(received.num_rows())),
        )?;
        let returned = shuffle_batch(collective, &back, &targets)?;
        if returned.num_rows() != n_rows {
            return Err(TesseraError::Execution(format!(
                "{} cumulative rows returned for {n_rows} input rows",
                returned.num_rows()
            )));
        }
        let mut order = vec![0u32; n_rows];
        for (i, &row) in returned
            .column(0)
            .as_primitive::<Int64Type>()
            .values()
            .iter()
            .enumerate()
        {
            order[row as usize] = i as u32;
        }
        let order = UInt32Array::from(order);
        returned.columns()[1..]
            .iter()
            .map(|c| Ok(take(c.as_ref(), &order, None)?))
            .collect()
    }
}

fn float_value(values: &NumericView<'_>, row: usize) -> Option<f64> {
    if values.is_null(row) {
        return None;
    }
    let v = values.f64(row);
    (!v.is_nan()).then_some(v)
}

fn int_array(values: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

/// Missing float results are NaN rather than NULL.
fn float_array(values: Vec<Option<f64>>) -> ArrayRef {
    Arc::new(
        values
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect::<Float64Array>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use arrow::array::StringArray;
    use tessera_common::{BufferPool, OperatorBufferPool, SpillLocation, SpillTier};
    use tessera_exchange::SingleProcess;
    use tessera_spill::SpillManager;

    fn engine(
        pool: &Arc<OperatorBufferPool>,
        dir: &std::path::Path,
    ) -> (CumulativeEngine, SchemaRef) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let tier = SpillTier {
            location: SpillLocation::Local(dir.to_path_buf()),
            quota_bytes: None,
        };
        let spill = Arc::new(Mutex::new(SpillManager::try_new(&[tier], 0).expect("spill")));
        let chunks = SpillableChunks::new(Arc::clone(&schema), pool.reservation(), spill);
        let engine = CumulativeEngine::try_new(
            Arc::clone(&schema),
            1,
            &[FunctionSpec::new(AggFunc::Cumsum, Some(1), "cs")],
            true,
            true,
            1000,
            chunks,
            pool.reservation(),
        )
        .expect("engine");
        (engine, schema)
    }

    fn input(schema: &SchemaRef, start: i64) -> RecordBatch {
        let keys = (start..start + 250).map(|i| format!("k{}", i % 7)).collect::<Vec<_>>();
        RecordBatch::try_new(
            Arc::clone(schema),
            vec![
                Arc::new(StringArray::from_iter_values(keys)),
                Arc::new(Int64Array::from_iter_values(start..start + 250)),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn finalize_charges_the_materialized_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = BufferPool::new(1 << 30).operator_pool(1 << 20, 200);
        let (mut engine, schema) = engine(&pool, dir.path());
        for start in (0..1000).step_by(250) {
            engine.consume(&input(&schema, start)).expect("consume");
        }
        let out = engine.finalize(&SingleProcess).expect("finalize");
        assert_eq!(out.num_rows(), 1000);
        assert!(pool.used_bytes() >= out.get_array_memory_size());
        drop(engine);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn finalize_fails_when_the_input_cannot_fit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = BufferPool::new(1 << 30).operator_pool(8 * 1024, 100);
        let (mut engine, schema) = engine(&pool, dir.path());
        for start in (0..2000).step_by(250) {
            engine.consume(&input(&schema, start)).expect("chunks spill while consuming");
        }
        let err = engine.finalize(&SingleProcess).expect_err("input above the hard limit");
        assert!(matches!(err, TesseraError::ResourceExhausted(_)));
    }

    #[test]
    fn running_values_restart_per_group() {
        let groups = vec![Some(0), Some(1), Some(0), None, Some(0)];
        let vals = [Some(1i64), Some(10), Some(2), Some(7), Some(3)];
        let run = Running::<i64>::compute(ReduceOp::Sum, |r| vals[r], &groups, 2, true);
        assert_eq!(run.totals, vec![6, 10]);
        let out = run.finish(ReduceOp::Sum, &groups, &[100, 0], &[0, 0]);
        assert_eq!(out, vec![Some(101), Some(10), Some(103), None, Some(106)]);
    }

    #[test]
    fn null_poisons_later_rows_without_skipna() {
        let groups = vec![Some(0); 4];
        let vals = [Some(1.0f64), None, Some(2.0), Some(3.0)];
        let skip = Running::<f64>::compute(ReduceOp::Max, |r| vals[r], &groups, 1, true)
            .finish(ReduceOp::Max, &groups, &[f64::NEG_INFINITY], &[0]);
        assert_eq!(skip, vec![Some(1.0), None, Some(2.0), Some(3.0)]);
        let keep = Running::<f64>::compute(ReduceOp::Max, |r| vals[r], &groups, 1, false)
            .finish(ReduceOp::Max, &groups, &[f64::NEG_INFINITY], &[0]);
        assert_eq!(keep, vec![Some(1.0), None, None, None]);
    }

    #[test]
    fn dropna_leaves_null_keys_ungrouped() {
        let keys: Vec<ArrayRef> = vec![Arc::new(arrow::array::StringArray::from(vec![
            Some("a"),
            None,
            Some("a"),
            None,
        ]))];
        let (groups, reps) = dense_groups(&keys, 4, true).expect("groups");
        assert_eq!(groups, vec![Some(0), None, Some(0), None]);
        assert_eq!(reps, vec![0]);
        let (groups, _) = dense_groups(&keys, 4, false).expect("groups");
        assert_eq!(groups, vec![Some(0), Some(1), Some(0), Some(1)]);
    }
}
