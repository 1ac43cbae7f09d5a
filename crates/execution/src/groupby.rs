//! Partitioned hash aggregation.
//!
//! Every input batch is first grouped on its own (`update`), producing one
//! intermediate row per distinct key. Intermediate rows owned by this worker
//! are folded into the local table; the rest go to the shuffle table and are
//! exchanged when the operator decides to. The local table is split by the
//! top bits of the grouping hash into spill partitions: only one partition is
//! resident, the others buffer their intermediate rows in spillable chunks
//! until finalization.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{MemoryReservation, OperatorBufferPool, Result, TesseraError};
use tessera_exchange::{
    Collective, DictionaryUnifier, GROUPING_HASH_SEED, PARTITION_HASH_SEED, hash_rows,
    partition_for, shuffle_batch, top_bits,
};
use tessera_spill::{SharedSpillManager, SpillableChunks};
use tracing::{debug, warn};

use crate::colset::ColSet;
use crate::column::{ArrayView, TableBuildBuffer};
use crate::group_index::GroupIndex;

/// Per-batch grouping: `row_to_group[r]` is the group of row `r` and
/// `representatives[g]` the first row of group `g`.
#[derive(Debug, Default)]
pub struct BatchGroups {
    pub row_to_group: Vec<u32>,
    pub representatives: Vec<u32>,
}

/// Group the rows of one batch by `keys`.
pub fn group_batch(keys: &[ArrayRef], hashes: &[u64], null_equal: bool) -> Result<BatchGroups> {
    let views = ArrayView::views(keys)?;
    let n_rows = hashes.len();
    let mut index = GroupIndex::with_capacity(n_rows.min(1 << 16));
    let mut out = BatchGroups {
        row_to_group: Vec::with_capacity(n_rows),
        representatives: Vec::new(),
    };
    for (row, &h) in hashes.iter().enumerate() {
        let id = if !null_equal && views.iter().any(|v| v.is_null(row)) {
            index.insert_distinct(h)
        } else {
            let reps = &out.representatives;
            let (id, _) = index.find_or_insert(h, |g| {
                let rep = reps[g as usize] as usize;
                views.iter().all(|v| v.rows_equal(rep, v, row, null_equal))
            });
            id
        };
        if id as usize == out.representatives.len() {
            out.representatives.push(row as u32);
        }
        out.row_to_group.push(id);
    }
    Ok(out)
}

/// Layout shared by the local table, the shuffle table and spilled chunks:
/// the key columns followed by every function's intermediate columns.
#[derive(Debug)]
pub struct AggLayout {
    pub key_count: usize,
    pub key_schema: SchemaRef,
    pub update_schema: SchemaRef,
    pub output_schema: SchemaRef,
    pub colsets: Vec<ColSet>,
}

impl AggLayout {
    /// `outputs[i]` names the result column of `colsets[i]`.
    pub fn try_new(
        input: &SchemaRef,
        key_count: usize,
        colsets: Vec<ColSet>,
        outputs: &[String],
    ) -> Result<Self> {
        if key_count > input.fields().len() {
            return Err(TesseraError::InvalidConfig(format!(
                "{key_count} key columns requested over a {}-column input",
                input.fields().len()
            )));
        }
        if outputs.len() != colsets.len() {
            return Err(TesseraError::InvalidConfig(format!(
                "{} output names for {} functions",
                outputs.len(),
                colsets.len()
            )));
        }
        let key_fields = input.fields()[..key_count]
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<Field>>();
        let mut update = key_fields.clone();
        let mut output = key_fields.clone();
        for (i, (cs, name)) in colsets.iter().zip(outputs).enumerate() {
            update.extend(cs.intermediate_fields(&format!("__agg{i}")));
            output.push(cs.output_field(name));
        }
        Ok(Self {
            key_count,
            key_schema: Arc::new(Schema::new(key_fields)),
            update_schema: Arc::new(Schema::new(update)),
            output_schema: Arc::new(Schema::new(output)),
            colsets,
        })
    }

    /// Group one input batch and turn it into intermediate rows, returning
    /// the rows and their grouping hashes. `ordinal_base` is the input
    /// ordinal of the batch's first row (see [`input_ordinal`]).
    pub fn update(
        &self,
        batch: &RecordBatch,
        null_equal: bool,
        ordinal_base: i64,
    ) -> Result<(RecordBatch, Vec<u64>)> {
        let keys = &batch.columns()[..self.key_count];
        let hashes = hash_keys(keys, batch.num_rows())?;
        let groups = group_batch(keys, &hashes, null_equal)?;
        let n_groups = groups.representatives.len();
        let reps = UInt32Array::from(groups.representatives.clone());
        let mut columns = keys
            .iter()
            .map(|k| take(k.as_ref(), &reps, None))
            .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
        for cs in &self.colsets {
            columns.extend(cs.update(
                batch.columns(),
                &groups.row_to_group,
                n_groups,
                ordinal_base,
            )?);
        }
        let rows = RecordBatch::try_new_with_options(
            Arc::clone(&self.update_schema),
            columns,
            &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(n_groups)),
        )?;
        let rep_hashes = groups
            .representatives
            .iter()
            .map(|&r| hashes[r as usize])
            .collect();
        Ok((rows, rep_hashes))
    }
}

const ORDINAL_ROW_BITS: u32 = 40;

/// Position of a row in the logical input: rank-major, then local arrival
/// order. Rows before it on the same rank number `rows_before`.
pub fn input_ordinal(rank: usize, rows_before: u64) -> i64 {
    ((rank as i64) << ORDINAL_ROW_BITS) | (rows_before & ((1 << ORDINAL_ROW_BITS) - 1)) as i64
}

/// Grouping hashes, with the all-rows-one-group case for zero keys.
pub(crate) fn hash_keys(keys: &[ArrayRef], n_rows: usize) -> Result<Vec<u64>> {
    if keys.is_empty() {
        return Ok(vec![0; n_rows]);
    }
    hash_rows(keys, GROUPING_HASH_SEED)
}

/// Hash table of groups with their accumulators.
#[derive(Debug)]
pub struct AggTable {
    index: GroupIndex,
    keys: TableBuildBuffer,
    colsets: Vec<ColSet>,
}

impl AggTable {
    pub fn try_new(layout: &AggLayout) -> Result<Self> {
        Ok(Self {
            index: GroupIndex::default(),
            keys: TableBuildBuffer::try_new(Arc::clone(&layout.key_schema))?,
            colsets: layout.colsets.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn memory_size(&self) -> usize {
        self.index.memory_size()
            + self.keys.memory_size()
            + self.colsets.iter().map(ColSet::memory_size).sum::<usize>()
    }

    pub fn group_hashes(&self) -> Vec<u64> {
        (0..self.len() as u32).map(|g| self.index.group_hash(g)).collect()
    }

    /// Combine intermediate rows into the table, skipping rows whose
    /// `selection` entry is false.
    pub fn fold(
        &mut self,
        rows: &RecordBatch,
        hashes: &[u64],
        selection: Option<&[bool]>,
        null_equal: bool,
    ) -> Result<()> {
        let key_count = self.keys.schema().fields().len();
        let views = ArrayView::views(&rows.columns()[..key_count])?;
        let init_start = self.index.len();
        let mut row_to_group = vec![-1i64; rows.num_rows()];
        for (row, slot) in row_to_group.iter_mut().enumerate() {
            if selection.is_some_and(|s| !s[row]) {
                continue;
            }
            let h = hashes[row];
            let id = if !null_equal && views.iter().any(|v| v.is_null(row)) {
                self.keys.append_row(&views, row)?;
                self.index.insert_distinct(h)
            } else {
                let keys = &self.keys;
                let (id, inserted) = self
                    .index
                    .find_or_insert(h, |g| keys.row_equals(g as usize, &views, row, null_equal));
                if inserted {
                    self.keys.append_row(&views, row)?;
                }
                id
            };
            *slot = id as i64;
        }
        let n_groups = self.index.len();
        let mut offset = key_count;
        for cs in &mut self.colsets {
            let width = cs.intermediate_width();
            cs.combine(
                &rows.columns()[offset..offset + width],
                init_start,
                n_groups,
                &row_to_group,
            )?;
            offset += width;
        }
        Ok(())
    }

    /// Export groups in the intermediate layout.
    pub fn to_update_batch(&self, layout: &AggLayout) -> Result<RecordBatch> {
        let mut columns = self.keys.to_batch()?.columns().to_vec();
        for cs in &self.colsets {
            columns.extend(cs.state_arrays());
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&layout.update_schema),
            columns,
            &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(self.len())),
        )?)
    }

    /// Final result rows.
    pub fn eval(&self, layout: &AggLayout) -> Result<RecordBatch> {
        let mut columns = self.keys.to_batch()?.columns().to_vec();
        for cs in &self.colsets {
            columns.push(cs.eval()?);
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&layout.output_schema),
            columns,
            &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(self.len())),
        )?)
    }

    pub fn remap_dictionaries(
        &mut self,
        remaps: &[Option<Vec<i32>>],
        unifier: &mut DictionaryUnifier,
    ) {
        self.keys.remap_dictionaries(remaps, unifier);
    }

    pub fn reset(&mut self) {
        self.index.clear();
        self.keys.reset();
        for cs in &mut self.colsets {
            cs.reset();
        }
    }
}

#[derive(Debug)]
enum PartitionState {
    Active(AggTable),
    Buffered,
    Done,
}

/// Slice of the local key space: groups whose top `depth` hash bits equal
/// `bits`.
#[derive(Debug)]
struct SpillPartition {
    depth: u32,
    bits: u64,
    state: PartitionState,
    chunks: SpillableChunks,
}

impl SpillPartition {
    fn owns(&self, hash: u64) -> bool {
        top_bits(hash, self.depth) == self.bits
    }
}

/// Counters reported as operator metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupbyStats {
    pub input_rows: u64,
    pub update_rows: u64,
    pub shuffles: u64,
    pub rows_shuffled_out: u64,
    pub rows_shuffled_in: u64,
    pub partition_splits: u64,
    pub max_partition_depth: u32,
    pub output_rows: u64,
}

/// Aggregation state of one worker.
#[derive(Debug)]
pub struct GroupbyEngine {
    layout: AggLayout,
    null_equal: bool,
    rank: usize,
    n_workers: usize,
    unifier: DictionaryUnifier,
    partitions: Vec<SpillPartition>,
    active: usize,
    shuffle_table: Option<AggTable>,
    reservation: MemoryReservation,
    pool: Arc<OperatorBufferPool>,
    spill: SharedSpillManager,
    max_depth: u32,
    flush_requested: bool,
    stats: GroupbyStats,
}

impl GroupbyEngine {
    pub fn try_new(
        layout: AggLayout,
        null_equal: bool,
        rank: usize,
        n_workers: usize,
        pool: Arc<OperatorBufferPool>,
        spill: SharedSpillManager,
        max_depth: u32,
    ) -> Result<Self> {
        let unifier = DictionaryUnifier::new(&layout.key_schema);
        let root = SpillPartition {
            depth: 0,
            bits: 0,
            state: PartitionState::Active(AggTable::try_new(&layout)?),
            chunks: SpillableChunks::new(
                Arc::clone(&layout.update_schema),
                pool.reservation(),
                Arc::clone(&spill),
            ),
        };
        let shuffle_table = if n_workers > 1 {
            Some(AggTable::try_new(&layout)?)
        } else {
            None
        };
        Ok(Self {
            layout,
            null_equal,
            rank,
            n_workers,
            unifier,
            partitions: vec![root],
            active: 0,
            shuffle_table,
            reservation: pool.reservation(),
            pool,
            spill,
            max_depth,
            flush_requested: false,
            stats: GroupbyStats::default(),
        })
    }

    pub fn layout(&self) -> &AggLayout {
        &self.layout
    }

    pub fn stats(&self) -> GroupbyStats {
        self.stats
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Bytes held by the shuffle table.
    pub fn shuffle_bytes(&self) -> usize {
        self.shuffle_table.as_ref().map_or(0, AggTable::memory_size)
    }

    /// Whether the engine is over budget with most of its state in the
    /// shuffle table, which only an exchange can release.
    pub fn wants_exchange(&self) -> bool {
        self.flush_requested
    }

    /// Update one input batch and route its groups.
    pub fn consume(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let batch = self.unifier.unify_batch(batch)?;
        let base = input_ordinal(self.rank, self.stats.input_rows);
        let (rows, hashes) = self.layout.update(&batch, self.null_equal, base)?;
        self.stats.input_rows += batch.num_rows() as u64;
        self.stats.update_rows += rows.num_rows() as u64;
        if self.n_workers == 1 {
            return self.route_local(&rows, &hashes, None);
        }
        let owners = self.owners(&rows)?;
        let local = owners.iter().map(|&o| o == self.rank).collect::<Vec<_>>();
        let remote = local.iter().map(|l| !l).collect::<Vec<_>>();
        if remote.iter().any(|r| *r) {
            if let Some(table) = self.shuffle_table.as_mut() {
                table.fold(&rows, &hashes, Some(&remote), self.null_equal)?;
            }
        }
        self.route_local(&rows, &hashes, Some(&local))
    }

    fn owners(&self, rows: &RecordBatch) -> Result<Vec<usize>> {
        let keys = &rows.columns()[..self.layout.key_count];
        if keys.is_empty() {
            return Ok(vec![0; rows.num_rows()]);
        }
        Ok(hash_rows(keys, PARTITION_HASH_SEED)?
            .into_iter()
            .map(|h| partition_for(h, self.n_workers))
            .collect())
    }

    /// Send shuffle-table groups to their owners and fold what arrives.
    ///
    /// Collective: every worker must call this in the same iteration.
    pub fn exchange(&mut self, collective: &dyn Collective) -> Result<()> {
        if self.unifier.has_dictionaries() {
            let remaps = self.unifier.make_global(collective)?;
            if let Some(table) = self.shuffle_table.as_mut() {
                table.remap_dictionaries(&remaps, &mut self.unifier);
            }
            if let PartitionState::Active(table) = &mut self.partitions[self.active].state {
                table.remap_dictionaries(&remaps, &mut self.unifier);
            }
        }
        let Some(table) = self.shuffle_table.as_mut() else {
            return Ok(());
        };
        let outgoing = table.to_update_batch(&self.layout)?;
        table.reset();
        self.flush_requested = false;
        let owners = self.owners(&outgoing)?;
        let received = shuffle_batch(collective, &outgoing, &owners)?;
        self.stats.shuffles += 1;
        self.stats.rows_shuffled_out += outgoing.num_rows() as u64;
        self.stats.rows_shuffled_in += received.num_rows() as u64;
        debug!(
            rank = self.rank,
            sent = outgoing.num_rows(),
            received = received.num_rows(),
            "groupby shuffle"
        );
        let received = self.unifier.unify_batch(&received)?;
        let hashes = hash_keys(&received.columns()[..self.layout.key_count], received.num_rows())?;
        self.route_local(&received, &hashes, None)
    }

    fn route_local(
        &mut self,
        rows: &RecordBatch,
        hashes: &[u64],
        selection: Option<&[bool]>,
    ) -> Result<()> {
        self.route_rows(rows, hashes, selection)?;
        self.relieve_pressure()
    }

    /// Fold owned rows into the active partition and buffer the rest in
    /// their partitions' chunks.
    fn route_rows(
        &mut self,
        rows: &RecordBatch,
        hashes: &[u64],
        selection: Option<&[bool]>,
    ) -> Result<()> {
        let active = self.active;
        let mut to_active = vec![false; rows.num_rows()];
        let mut buffered: Vec<Vec<u32>> = vec![Vec::new(); self.partitions.len()];
        for (row, &h) in hashes.iter().enumerate() {
            if selection.is_some_and(|s| !s[row]) {
                continue;
            }
            let Some(p) = self.partitions.iter().position(|p| p.owns(h)) else {
                return Err(TesseraError::Execution(format!(
                    "no spill partition owns hash {h:#x}"
                )));
            };
            if p == active {
                to_active[row] = true;
            } else {
                buffered[p].push(row as u32);
            }
        }
        for (p, idx) in buffered.into_iter().enumerate() {
            if idx.is_empty() {
                continue;
            }
            let part = arrow::compute::take_record_batch(rows, &UInt32Array::from(idx))?;
            self.partitions[p].chunks.append(part)?;
        }
        if let PartitionState::Active(table) = &mut self.partitions[active].state {
            table.fold(rows, hashes, Some(&to_active), self.null_equal)?;
        }
        Ok(())
    }

    fn resize_reservation(&mut self) -> Result<bool> {
        let active = match &self.partitions[self.active].state {
            PartitionState::Active(t) => t.memory_size(),
            _ => 0,
        };
        self.reservation.resize(active + self.shuffle_bytes())
    }

    fn relieve_pressure(&mut self) -> Result<()> {
        loop {
            if self.resize_reservation()? {
                return Ok(());
            }
            for (i, p) in self.partitions.iter_mut().enumerate() {
                if i != self.active {
                    p.chunks.spill_all()?;
                }
            }
            if !self.pool.is_over_budget() {
                return Ok(());
            }
            let p = &self.partitions[self.active];
            let (table_len, table_bytes) = match &p.state {
                PartitionState::Active(t) => (t.len(), t.memory_size()),
                _ => (0, 0),
            };
            let shuffle_bytes = self.shuffle_bytes();
            if table_len <= 1 || table_bytes <= shuffle_bytes {
                debug!(
                    rank = self.rank,
                    table_groups = table_len,
                    table_bytes,
                    shuffle_bytes,
                    "over budget with a small local table, flushing the shuffle table"
                );
                self.flush_requested = shuffle_bytes > 0;
                return Ok(());
            }
            if p.depth >= self.max_depth {
                return Err(TesseraError::ResourceExhausted(format!(
                    "groupby partition with {table_len} groups exceeds the operator budget \
                     at depth {}",
                    p.depth
                )));
            }
            self.split_active()?;
        }
    }

    /// Halve the active partition by one more hash bit. The first half stays
    /// active, the second half becomes a buffered partition.
    fn split_active(&mut self) -> Result<()> {
        let idx = self.active;
        let fresh = AggTable::try_new(&self.layout)?;
        let state = &mut self.partitions[idx].state;
        let old = match std::mem::replace(state, PartitionState::Active(fresh)) {
            PartitionState::Active(t) => t,
            other => {
                self.partitions[idx].state = other;
                return Ok(());
            }
        };
        let (depth, bits) = {
            let p = &mut self.partitions[idx];
            p.depth += 1;
            p.bits <<= 1;
            (p.depth, p.bits | 1)
        };
        self.partitions.push(SpillPartition {
            depth,
            bits,
            state: PartitionState::Buffered,
            chunks: SpillableChunks::new(
                Arc::clone(&self.layout.update_schema),
                self.pool.reservation(),
                Arc::clone(&self.spill),
            ),
        });
        self.stats.partition_splits += 1;
        self.stats.max_partition_depth = self.stats.max_partition_depth.max(depth);
        warn!(
            rank = self.rank,
            depth,
            groups = old.len(),
            partitions = self.partitions.len(),
            "groupby partition split"
        );
        let rows = old.to_update_batch(&self.layout)?;
        let hashes = old.group_hashes();
        drop(old);
        self.route_rows(&rows, &hashes, None)
    }

    /// Evaluate every partition, one resident at a time.
    pub fn finalize(&mut self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        let first = self.active;
        out.push(self.finish_active()?);
        let mut i = 0;
        while i < self.partitions.len() {
            if i != first && matches!(self.partitions[i].state, PartitionState::Buffered) {
                self.activate(i)?;
                out.push(self.finish_active()?);
            }
            i += 1;
        }
        out.retain(|b| b.num_rows() > 0);
        self.stats.output_rows = out.iter().map(|b| b.num_rows() as u64).sum();
        Ok(out)
    }

    fn activate(&mut self, idx: usize) -> Result<()> {
        self.active = idx;
        let table = AggTable::try_new(&self.layout)?;
        self.partitions[idx].state = PartitionState::Active(table);
        let fresh = SpillableChunks::new(
            Arc::clone(&self.layout.update_schema),
            self.pool.reservation(),
            Arc::clone(&self.spill),
        );
        let mut chunks = std::mem::replace(&mut self.partitions[idx].chunks, fresh);
        for handle in chunks.handles() {
            let rows = chunks.take(handle)?;
            let rows = self.unifier.unify_batch(&rows)?;
            let hashes = hash_keys(&rows.columns()[..self.layout.key_count], rows.num_rows())?;
            self.route_local(&rows, &hashes, None)?;
        }
        chunks.release()
    }

    fn finish_active(&mut self) -> Result<RecordBatch> {
        let idx = self.active;
        let state = &mut self.partitions[idx].state;
        let result = match std::mem::replace(state, PartitionState::Done) {
            PartitionState::Active(table) => table.eval(&self.layout)?,
            _ => RecordBatch::new_empty(Arc::clone(&self.layout.output_schema)),
        };
        self.reservation.resize(self.shuffle_bytes())?;
        Ok(result)
    }

    /// Drop all state and spilled chunks.
    pub fn release(&mut self) -> Result<()> {
        for p in &mut self.partitions {
            p.state = PartitionState::Done;
            p.chunks.release()?;
        }
        if let Some(t) = self.shuffle_table.as_mut() {
            t.reset();
        }
        self.reservation.free();
        Ok(())
    }
}
