//! Sort-based window functions.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{MemoryReservation, Result, TesseraError};
use tessera_exchange::Collective;
use tessera_spill::SpillableChunks;
use tracing::{debug, warn};

use crate::colset::{ColSet, FuncKind};
use crate::column::{ArrayView, plain_keys};
use crate::operator::FunctionSpec;
use crate::sort::{GlobalSort, SortKey};

/// Half-open row ranges of equal partition keys, and for every row whether
/// it starts a new peer group (a partition start or a change in order keys).
pub fn boundaries(
    batch: &RecordBatch,
    partition_keys: &[usize],
    order_keys: &[usize],
) -> Result<(Vec<(usize, usize)>, Vec<bool>)> {
    let n = batch.num_rows();
    let pick = |cols: &[usize]| {
        cols.iter()
            .map(|&c| Arc::clone(batch.column(c)))
            .collect::<Vec<ArrayRef>>()
    };
    let part = plain_keys(&pick(partition_keys))?;
    let order = plain_keys(&pick(order_keys))?;
    let part_views = ArrayView::views(&part)?;
    let order_views = ArrayView::views(&order)?;
    let same = |views: &[ArrayView<'_>], a: usize, b: usize| {
        views.iter().all(|v| v.rows_equal(a, v, b, true))
    };

    let mut partitions = Vec::new();
    let mut peer_start = vec![false; n];
    let mut start = 0;
    for i in 0..n {
        let new_partition = i == 0 || !same(&part_views, i - 1, i);
        if new_partition && i > 0 {
            partitions.push((start, i));
            start = i;
        }
        peer_start[i] = new_partition || !same(&order_views, i - 1, i);
    }
    if n > 0 {
        partitions.push((start, n));
    }
    Ok((partitions, peer_start))
}

/// Buffers one worker's input; on finalize sorts globally by partition then
/// order keys and evaluates each window function in one pass.
pub struct WindowEngine {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    partition_keys: Vec<usize>,
    order_keys: Vec<SortKey>,
    colsets: Vec<ColSet>,
    sort: Arc<dyn GlobalSort>,
    chunks: SpillableChunks,
    input_rows: u64,
    input_bytes: usize,
    reservation: MemoryReservation,
}

impl std::fmt::Debug for WindowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEngine")
            .field("partition_keys", &self.partition_keys)
            .field("order_keys", &self.order_keys)
            .field("functions", &self.colsets.len())
            .field("input_rows", &self.input_rows)
            .finish()
    }
}

impl WindowEngine {
    pub fn try_new(
        schema: SchemaRef,
        partition_keys: Vec<usize>,
        order_keys: Vec<SortKey>,
        functions: &[FunctionSpec],
        sort: Arc<dyn GlobalSort>,
        chunks: SpillableChunks,
        reservation: MemoryReservation,
    ) -> Result<Self> {
        let width = schema.fields().len();
        if let Some(bad) = partition_keys
            .iter()
            .copied()
            .chain(order_keys.iter().map(|k| k.column))
            .find(|&c| c >= width)
        {
            return Err(TesseraError::InvalidConfig(format!(
                "window key column {bad} out of range for {width} columns"
            )));
        }
        if functions.is_empty() {
            return Err(TesseraError::InvalidConfig(
                "window operator needs at least one function".to_string(),
            ));
        }
        let mut fields = schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        let mut colsets = Vec::with_capacity(functions.len());
        for spec in functions {
            if spec.func.kind() != FuncKind::Window {
                return Err(TesseraError::InvalidConfig(format!(
                    "{} is not a window function",
                    spec.func
                )));
            }
            let cs = ColSet::try_new(spec.func, None, None)?;
            fields.push(cs.output_field(&spec.name));
            colsets.push(cs);
        }
        Ok(Self {
            input_schema: schema,
            output_schema: Arc::new(Schema::new(fields)),
            partition_keys,
            order_keys,
            colsets,
            sort,
            chunks,
            input_rows: 0,
            input_bytes: 0,
            reservation,
        })
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn input_rows(&self) -> u64 {
        self.input_rows
    }

    pub fn consume(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.input_rows += batch.num_rows() as u64;
        self.input_bytes += batch.get_array_memory_size();
        self.chunks.append(batch.clone())?;
        Ok(())
    }

    fn charge(&mut self, bytes: usize) -> Result<()> {
        if !self.reservation.resize(bytes)? {
            warn!(bytes, "window input over the operator budget");
        }
        Ok(())
    }

    /// Sorted rows of the partitions this worker owns, followed by one
    /// result column per function. Collective through the global sort.
    pub fn finalize(&mut self, collective: &dyn Collective) -> Result<RecordBatch> {
        let loading = self.input_bytes.saturating_sub(self.chunks.resident_bytes());
        self.charge(loading)?;
        let parts = self.chunks.drain()?;
        self.charge(self.input_bytes)?;
        let input = concat_batches(&self.input_schema, &parts)?;
        drop(parts);
        self.charge(input.get_array_memory_size())?;
        let mut keys = self
            .partition_keys
            .iter()
            .map(|&c| SortKey::asc(c))
            .collect::<Vec<_>>();
        keys.extend(self.order_keys.iter().copied());
        let sorted = self
            .sort
            .sort(collective, input, &keys, self.partition_keys.len())?;
        // rows owned after the sort replace the local input
        self.charge(sorted.get_array_memory_size())?;
        let order_cols = self.order_keys.iter().map(|k| k.column).collect::<Vec<_>>();
        let (partitions, peer_start) = boundaries(&sorted, &self.partition_keys, &order_cols)?;
        debug!(
            rank = collective.rank(),
            rows = sorted.num_rows(),
            partitions = partitions.len(),
            "window input sorted"
        );
        let mut columns = sorted.columns().to_vec();
        for cs in &self.colsets {
            columns.push(cs.window_compute(&partitions, &peer_start)?);
        }
        let out = RecordBatch::try_new_with_options(
            Arc::clone(&self.output_schema),
            columns,
            &arrow::record_batch::RecordBatchOptions::new()
                .with_row_count(Some(sorted.num_rows())),
        )?;
        self.charge(out.get_array_memory_size())?;
        Ok(out)
    }

    pub fn release(&mut self) -> Result<()> {
        self.reservation.free();
        self.chunks.release()
    }
}
