//! Hash join and nested-loop join.
//!
//! The hash join keeps its build rows in spillable chunks. Once the build side
//! is complete it is split by the top bits of the key hash into as many
//! partitions as the operator budget calls for; partition 0 is indexed right
//! away and joined while the probe side streams, the others buffer their
//! probe rows and are joined one at a time after the last probe batch.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, UInt32Array, new_null_array};
use arrow::compute::{concat_batches, filter_record_batch, take, take_record_batch};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use tessera_common::{MemoryReservation, OperatorBufferPool, Result, TesseraError};
use tessera_exchange::{
    Collective, CollectiveExt, DictionaryUnifier, ReduceOp, all_gather_batches, broadcast_batch,
    shuffle_by_key, target_ranks, top_bits,
};
use tessera_spill::{ChunkHandle, SharedSpillManager, SpillableChunks};
use tracing::{debug, warn};

use crate::column::{ArrayView, TableBuildBuffer, supported_key_type};
use crate::group_index::GroupIndex;
use crate::groupby::hash_keys;

const END: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    /// Every probe row appears at least once.
    Left,
    /// Every build row appears at least once.
    Right,
    Full,
}

impl JoinType {
    pub fn probe_outer(self) -> bool {
        matches!(self, Self::Left | Self::Full)
    }

    pub fn build_outer(self) -> bool {
        matches!(self, Self::Right | Self::Full)
    }
}

/// Row predicate of a nested-loop join: `(probe, probe_row, build, build_row)`.
pub type RowPredicate =
    Arc<dyn Fn(&RecordBatch, usize, &RecordBatch, usize) -> bool + Send + Sync>;

/// Input and output schemas of a join. Output rows are the probe columns
/// followed by the build columns.
#[derive(Debug, Clone)]
pub struct JoinLayout {
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
    pub probe_keys: Vec<usize>,
    pub build_keys: Vec<usize>,
    pub join_type: JoinType,
    pub output_schema: SchemaRef,
}

impl JoinLayout {
    pub fn try_new(
        probe_schema: SchemaRef,
        build_schema: SchemaRef,
        probe_keys: Vec<usize>,
        build_keys: Vec<usize>,
        join_type: JoinType,
    ) -> Result<Self> {
        if probe_keys.len() != build_keys.len() {
            return Err(TesseraError::InvalidConfig(format!(
                "{} probe keys against {} build keys",
                probe_keys.len(),
                build_keys.len()
            )));
        }
        for (&p, &b) in probe_keys.iter().zip(&build_keys) {
            let (Some(pf), Some(bf)) = (probe_schema.fields().get(p), build_schema.fields().get(b))
            else {
                return Err(TesseraError::InvalidConfig(format!(
                    "join key ({p}, {b}) out of range"
                )));
            };
            if !supported_key_type(pf.data_type()) {
                return Err(TesseraError::InvalidConfig(format!(
                    "join key {} has unsupported type {}",
                    pf.name(),
                    pf.data_type()
                )));
            }
            if pf.data_type() != bf.data_type() {
                return Err(TesseraError::InvalidConfig(format!(
                    "join key {} is {} on the probe side but {} on the build side",
                    pf.name(),
                    pf.data_type(),
                    bf.data_type()
                )));
            }
        }
        let side = |schema: &SchemaRef, nullable: bool| {
            schema
                .fields()
                .iter()
                .map(|f| f.as_ref().clone().with_nullable(f.is_nullable() || nullable))
                .collect::<Vec<Field>>()
        };
        let mut fields = side(&probe_schema, join_type.build_outer());
        fields.extend(side(&build_schema, join_type.probe_outer()));
        Ok(Self {
            probe_schema,
            build_schema,
            probe_keys,
            build_keys,
            join_type,
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    /// Gather output rows; a null index yields an all-null side. A side
    /// given as `None` is all null.
    fn assemble(
        &self,
        probe: Option<&RecordBatch>,
        probe_idx: &UInt32Array,
        build: Option<&RecordBatch>,
        build_idx: &UInt32Array,
    ) -> Result<RecordBatch> {
        let n = build_idx.len();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.output_schema.fields().len());
        match probe {
            Some(p) => {
                for c in p.columns() {
                    columns.push(take(c.as_ref(), probe_idx, None)?);
                }
            }
            None => {
                for f in self.probe_schema.fields() {
                    columns.push(new_null_array(f.data_type(), n));
                }
            }
        }
        match build {
            Some(b) => {
                for c in b.columns() {
                    columns.push(take(c.as_ref(), build_idx, None)?);
                }
            }
            None => {
                for f in self.build_schema.fields() {
                    columns.push(new_null_array(f.data_type(), n));
                }
            }
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.output_schema),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(n)),
        )?)
    }
}

/// Canonical dictionaries of both join inputs.
///
/// A probe key column is unified through the builder of the build key it is
/// compared with, so codes of the two sides are equal exactly when the strings
/// are. Every other dictionary column has a builder of its own.
#[derive(Debug, Clone)]
struct JoinDictionaries {
    build: DictionaryUnifier,
    probe: DictionaryUnifier,
    /// Build column each probe key column is compared with.
    probe_to_build: Vec<Option<usize>>,
}

impl JoinDictionaries {
    fn new(layout: &JoinLayout) -> Self {
        let mut probe_to_build = vec![None; layout.probe_schema.fields().len()];
        for (&p, &b) in layout.probe_keys.iter().zip(&layout.build_keys) {
            probe_to_build[p] = Some(b);
        }
        Self {
            build: DictionaryUnifier::new(&layout.build_schema),
            probe: DictionaryUnifier::new(&layout.probe_schema),
            probe_to_build,
        }
    }

    fn unify_build(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        self.build.unify_batch(batch)
    }

    fn unify_probe(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        if !self.probe.has_dictionaries() {
            return Ok(batch.clone());
        }
        let mut columns = batch.columns().to_vec();
        for (i, column) in columns.iter_mut().enumerate() {
            let builder = match self.probe_to_build[i] {
                Some(b) => self.build.builder_mut(b),
                None => self.probe.builder_mut(i),
            };
            if let Some(builder) = builder {
                *column = builder.unify(column)?;
            }
        }
        Ok(RecordBatch::try_new(batch.schema(), columns)?)
    }
}

fn key_columns(batch: &RecordBatch, keys: &[usize]) -> Vec<ArrayRef> {
    keys.iter().map(|&k| Arc::clone(batch.column(k))).collect()
}

/// Build rows indexed by key, each key group chaining its rows in arrival
/// order.
#[derive(Debug)]
pub struct HashJoinTable {
    batch: RecordBatch,
    keys: Vec<ArrayRef>,
    index: GroupIndex,
    heads: Vec<u32>,
    tails: Vec<u32>,
    next: Vec<u32>,
    matched: Vec<bool>,
}

impl HashJoinTable {
    pub fn try_new(batch: RecordBatch, build_keys: &[usize], null_equal: bool) -> Result<Self> {
        let keys = key_columns(&batch, build_keys);
        let hashes = hash_keys(&keys, batch.num_rows())?;
        let views = ArrayView::views(&keys)?;
        let mut index = GroupIndex::with_capacity(batch.num_rows());
        let mut heads = Vec::new();
        let mut tails: Vec<u32> = Vec::new();
        let mut next = vec![END; batch.num_rows()];
        for (row, &h) in hashes.iter().enumerate() {
            if !null_equal && views.iter().any(|v| v.is_null(row)) {
                continue;
            }
            let (g, inserted) = index.find_or_insert(h, |g| {
                let head = heads[g as usize] as usize;
                views.iter().all(|v| v.rows_equal(head, v, row, null_equal))
            });
            if inserted {
                heads.push(row as u32);
                tails.push(row as u32);
            } else {
                next[tails[g as usize] as usize] = row as u32;
                tails[g as usize] = row as u32;
            }
        }
        let n = batch.num_rows();
        Ok(Self {
            batch,
            keys,
            index,
            heads,
            tails,
            next,
            matched: vec![false; n],
        })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn memory_size(&self) -> usize {
        self.batch.get_array_memory_size()
            + self.index.memory_size()
            + (self.heads.len() + self.tails.len() + self.next.len()) * 4
            + self.matched.len()
    }

    /// Matching `(probe_row, build_row)` pairs, plus unmatched probe rows
    /// paired with a null build index for probe-outer joins.
    pub fn probe(
        &mut self,
        layout: &JoinLayout,
        probe: &RecordBatch,
        null_equal: bool,
    ) -> Result<RecordBatch> {
        let keys = key_columns(probe, &layout.probe_keys);
        let hashes = hash_keys(&keys, probe.num_rows())?;
        let probe_views = ArrayView::views(&keys)?;
        let build_views = ArrayView::views(&self.keys)?;
        let mut probe_idx = Vec::new();
        let mut build_idx: Vec<Option<u32>> = Vec::new();
        for (row, &h) in hashes.iter().enumerate() {
            let found = if !null_equal && probe_views.iter().any(|v| v.is_null(row)) {
                None
            } else {
                let heads = &self.heads;
                self.index.find(h, |g| {
                    let head = heads[g as usize] as usize;
                    probe_views
                        .iter()
                        .zip(&build_views)
                        .all(|(p, b)| p.rows_equal(row, b, head, null_equal))
                })
            };
            match found {
                Some(g) => {
                    let mut r = self.heads[g as usize];
                    while r != END {
                        probe_idx.push(row as u32);
                        build_idx.push(Some(r));
                        self.matched[r as usize] = true;
                        r = self.next[r as usize];
                    }
                }
                None if layout.join_type.probe_outer() => {
                    probe_idx.push(row as u32);
                    build_idx.push(None);
                }
                None => {}
            }
        }
        layout.assemble(
            Some(probe),
            &UInt32Array::from(probe_idx),
            Some(&self.batch),
            &UInt32Array::from(build_idx),
        )
    }

    /// Combine match flags of replicated build tables.
    pub fn merge_matched(&mut self, collective: &dyn Collective) -> Result<()> {
        let flags = self.matched.iter().map(|&m| u8::from(m)).collect::<Vec<_>>();
        let merged = collective.allreduce(&flags, ReduceOp::Max)?;
        for (m, f) in self.matched.iter_mut().zip(merged) {
            *m = f == 1;
        }
        Ok(())
    }

    /// Build rows no probe row matched.
    pub fn unmatched(&self, layout: &JoinLayout) -> Result<RecordBatch> {
        let rows = self
            .matched
            .iter()
            .enumerate()
            .filter(|(_, m)| !**m)
            .map(|(i, _)| i as u32)
            .collect::<Vec<_>>();
        let probe_idx = UInt32Array::from(vec![None::<u32>; rows.len()]);
        layout.assemble(None, &probe_idx, Some(&self.batch), &UInt32Array::from(rows))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JoinStats {
    pub build_rows: u64,
    pub probe_rows: u64,
    pub output_rows: u64,
    pub build_shuffles: u64,
    pub rows_shuffled_out: u64,
    /// Hash partitions of the build side; 1 when it fit the budget.
    pub build_partitions: u64,
}

/// Estimated index overhead per build row on top of its data.
const TABLE_ROW_OVERHEAD: usize = 40;

/// Deepest split of the build side regardless of configuration.
const MAX_BUILD_PARTITION_BITS: u32 = 16;

/// Build and probe rows of one hash partition.
#[derive(Debug)]
struct JoinPartition {
    build: SpillableChunks,
    probe: SpillableChunks,
}

/// Build and probe state of one worker's hash join.
///
/// In a parallel join without broadcast build, build rows live on the owner
/// of their key; rows owned elsewhere sit in the shuffle buffer until the next
/// exchange. With a broadcast build every worker ends up holding all build
/// rows.
#[derive(Debug)]
pub struct HashJoinEngine {
    layout: JoinLayout,
    null_equal: bool,
    broadcast_build: bool,
    rank: usize,
    n_workers: usize,
    dictionaries: JoinDictionaries,
    /// Build rows this worker owns, before partitioning.
    build: SpillableChunks,
    build_bytes: usize,
    shuffle: TableBuildBuffer,
    flush_requested: bool,
    depth: u32,
    max_depth: u32,
    partitions: Vec<JoinPartition>,
    /// Index of the partition being joined.
    table: Option<HashJoinTable>,
    reservation: MemoryReservation,
    pool: Arc<OperatorBufferPool>,
    spill: SharedSpillManager,
    stats: JoinStats,
}

impl HashJoinEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        layout: JoinLayout,
        null_equal: bool,
        broadcast_build: bool,
        rank: usize,
        n_workers: usize,
        pool: Arc<OperatorBufferPool>,
        spill: SharedSpillManager,
        max_depth: u32,
    ) -> Result<Self> {
        if layout.build_keys.is_empty() {
            return Err(TesseraError::InvalidConfig(
                "hash join requires at least one key".to_string(),
            ));
        }
        Ok(Self {
            dictionaries: JoinDictionaries::new(&layout),
            build: SpillableChunks::new(
                Arc::clone(&layout.build_schema),
                pool.reservation(),
                Arc::clone(&spill),
            ),
            build_bytes: 0,
            shuffle: TableBuildBuffer::try_new(Arc::clone(&layout.build_schema))?,
            flush_requested: false,
            depth: 0,
            max_depth: max_depth.min(MAX_BUILD_PARTITION_BITS),
            partitions: Vec::new(),
            layout,
            null_equal,
            broadcast_build,
            rank,
            n_workers,
            table: None,
            reservation: pool.reservation(),
            pool,
            spill,
            stats: JoinStats::default(),
        })
    }

    pub fn layout(&self) -> &JoinLayout {
        &self.layout
    }

    pub fn stats(&self) -> JoinStats {
        self.stats
    }

    fn partitioned(&self) -> bool {
        self.n_workers > 1 && !self.broadcast_build
    }

    fn replicated(&self) -> bool {
        self.n_workers > 1 && self.broadcast_build
    }

    pub fn shuffle_bytes(&self) -> usize {
        self.shuffle.memory_size()
    }

    /// Whether memory pressure asks for the shuffle buffer to be sent early.
    pub fn wants_exchange(&self) -> bool {
        self.flush_requested
    }

    fn chunks(&self, schema: &SchemaRef) -> SpillableChunks {
        SpillableChunks::new(Arc::clone(schema), self.pool.reservation(), Arc::clone(&self.spill))
    }

    pub fn consume_build(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let batch = self.dictionaries.unify_build(batch)?;
        self.stats.build_rows += batch.num_rows() as u64;
        if !self.partitioned() {
            return self.append_build(batch);
        }
        let owners = target_ranks(&batch, &self.layout.build_keys, self.n_workers)?;
        let local = owners.iter().map(|&o| o == self.rank).collect::<Vec<bool>>();
        let local = BooleanArray::from(local);
        let remote = owners.iter().map(|&o| o != self.rank).collect::<Vec<bool>>();
        let remote = BooleanArray::from(remote);
        self.shuffle.append_filtered(&batch, &remote)?;
        self.append_build(filter_record_batch(&batch, &local)?)?;
        self.relieve_pressure()
    }

    fn append_build(&mut self, batch: RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.build_bytes += batch.get_array_memory_size();
        self.build.append(batch)?;
        Ok(())
    }

    /// Charge the shuffle buffer. Over budget, owned build rows go to storage
    /// first; if the pool is still over, the next sync point should exchange.
    fn relieve_pressure(&mut self) -> Result<()> {
        let shuffle_bytes = self.shuffle.memory_size();
        if self.reservation.resize(shuffle_bytes)? {
            return Ok(());
        }
        let spilled = self.build.spill_all()?;
        if self.pool.is_over_budget() && shuffle_bytes > 0 {
            debug!(
                rank = self.rank,
                shuffle_bytes, spilled, "join build over budget, flushing the shuffle buffer"
            );
            self.flush_requested = true;
        }
        Ok(())
    }

    /// Send buffered build rows to their owners.
    pub fn exchange_build(&mut self, collective: &dyn Collective) -> Result<()> {
        if !self.partitioned() {
            return Ok(());
        }
        let outgoing = self.shuffle.to_batch()?;
        self.shuffle.reset();
        self.flush_requested = false;
        let received = shuffle_by_key(collective, &outgoing, &self.layout.build_keys)?;
        self.stats.build_shuffles += 1;
        self.stats.rows_shuffled_out += outgoing.num_rows() as u64;
        drop(outgoing);
        let received = self.dictionaries.unify_build(&received)?;
        self.append_build(received)?;
        self.relieve_pressure()
    }

    /// Partition the build rows and index partition 0. Collective.
    pub fn finish_build(&mut self, collective: &dyn Collective) -> Result<()> {
        self.exchange_build(collective)?;
        let (bytes, rows) = if self.replicated() {
            let totals = collective.allreduce(
                &[self.build_bytes as i64, self.build.num_rows() as i64],
                ReduceOp::Sum,
            )?;
            (totals[0] as usize, totals[1] as usize)
        } else {
            (self.build_bytes, self.build.num_rows())
        };
        self.depth = self.partition_depth(bytes, rows);
        let partitions = (0..1usize << self.depth)
            .map(|_| JoinPartition {
                build: self.chunks(&self.layout.build_schema),
                probe: self.chunks(&self.layout.probe_schema),
            })
            .collect::<Vec<_>>();
        self.partitions = partitions;
        let fresh = self.chunks(&self.layout.build_schema);
        let mut local = std::mem::replace(&mut self.build, fresh);
        if self.replicated() {
            self.gather_build(collective, &mut local)?;
        } else if self.depth == 0 {
            std::mem::swap(&mut self.partitions[0].build, &mut local);
        } else {
            for handle in local.handles() {
                let chunk = local.take(handle)?;
                self.route_build(&chunk)?;
            }
        }
        local.release()?;
        self.build_bytes = 0;
        self.stats.build_partitions = self.partitions.len() as u64;
        if self.depth > 0 {
            warn!(
                rank = self.rank,
                build_rows = rows,
                build_bytes = bytes,
                partitions = self.partitions.len(),
                "join build side exceeds the operator budget, partitioning"
            );
        }
        self.load_partition(0)?;
        debug!(rank = self.rank, build_rows = rows, "join build finished");
        Ok(())
    }

    /// Smallest hash-partition depth whose partitions each index within half
    /// the operator budget.
    fn partition_depth(&self, bytes: usize, rows: usize) -> u32 {
        let estimate = bytes + rows * TABLE_ROW_OVERHEAD;
        let target = (self.pool.budget_bytes() / 2).max(1);
        let mut depth = 0;
        while depth < self.max_depth && estimate >> depth > target {
            depth += 1;
        }
        depth
    }

    /// Replicate every worker's build rows, one chunk per worker per round.
    fn gather_build(
        &mut self,
        collective: &dyn Collective,
        local: &mut SpillableChunks,
    ) -> Result<()> {
        let handles = local.handles();
        let rounds = collective.allreduce(&[handles.len() as i64], ReduceOp::Max)?[0];
        let empty = RecordBatch::new_empty(Arc::clone(&self.layout.build_schema));
        for round in 0..rounds.max(0) as usize {
            let batch = match handles.get(round) {
                Some(&h) => local.take(h)?,
                None => empty.clone(),
            };
            for received in all_gather_batches(collective, &batch)? {
                if received.num_rows() > 0 {
                    let received = self.dictionaries.unify_build(&received)?;
                    self.route_build(&received)?;
                }
            }
        }
        Ok(())
    }

    fn route_build(&mut self, batch: &RecordBatch) -> Result<()> {
        for (p, part) in self.split(batch, &self.layout.build_keys)?.into_iter().enumerate() {
            if part.num_rows() > 0 {
                self.partitions[p].build.append(part)?;
            }
        }
        Ok(())
    }

    /// Split rows by the top bits of their key hash.
    fn split(&self, batch: &RecordBatch, keys: &[usize]) -> Result<Vec<RecordBatch>> {
        if self.partitions.len() <= 1 {
            return Ok(vec![batch.clone()]);
        }
        let hashes = hash_keys(&key_columns(batch, keys), batch.num_rows())?;
        let mut rows = vec![Vec::new(); self.partitions.len()];
        for (row, &h) in hashes.iter().enumerate() {
            rows[top_bits(h, self.depth) as usize].push(row as u32);
        }
        rows.into_iter()
            .map(|idx| Ok(take_record_batch(batch, &UInt32Array::from(idx))?))
            .collect()
    }

    /// Index the build rows of partition `p`.
    fn load_partition(&mut self, p: usize) -> Result<()> {
        let chunks = self.partitions[p].build.drain()?;
        self.partitions[p].build.release()?;
        let batch = concat_batches(&self.layout.build_schema, &chunks)?;
        drop(chunks);
        // concatenation may re-encode dictionaries
        let batch = self.dictionaries.unify_build(&batch)?;
        let table = HashJoinTable::try_new(batch, &self.layout.build_keys, self.null_equal)?;
        let table_bytes = table.memory_size();
        if !self.reservation.resize(table_bytes)? {
            let mut spilled = 0;
            for part in &mut self.partitions {
                spilled += part.build.spill_all()? + part.probe.spill_all()?;
            }
            debug!(
                rank = self.rank,
                partition = p,
                table_bytes,
                spilled,
                "join partition over budget, buffered rows spilled"
            );
        }
        self.table = Some(table);
        Ok(())
    }

    /// Join one probe batch. Collective (one shuffle) in a partitioned join,
    /// so every worker must call it the same number of times.
    pub fn probe(
        &mut self,
        collective: &dyn Collective,
        batch: &RecordBatch,
    ) -> Result<RecordBatch> {
        let batch = if self.partitioned() {
            shuffle_by_key(collective, batch, &self.layout.probe_keys)?
        } else {
            batch.clone()
        };
        let batch = self.dictionaries.unify_probe(&batch)?;
        self.stats.probe_rows += batch.num_rows() as u64;
        let mut parts = self.split(&batch, &self.layout.probe_keys)?.into_iter();
        let resident = parts.next().unwrap_or(batch);
        for (i, part) in parts.enumerate() {
            if part.num_rows() > 0 {
                self.partitions[i + 1].probe.append(part)?;
            }
        }
        self.probe_resident(&resident)
    }

    fn probe_resident(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        let table = self
            .table
            .as_mut()
            .ok_or_else(|| TesseraError::Execution("probe before build finished".to_string()))?;
        let out = table.probe(&self.layout, batch, self.null_equal)?;
        self.stats.output_rows += out.num_rows() as u64;
        Ok(out)
    }

    /// Join the remaining partitions, after the last probe batch. Collective
    /// when the build is broadcast and the join is build-outer.
    pub fn finish_probe(&mut self, collective: &dyn Collective) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        self.finish_partition(collective, &mut out)?;
        for p in 1..self.partitions.len() {
            self.load_partition(p)?;
            let mut rows = self.chunks(&self.layout.probe_schema);
            std::mem::swap(&mut rows, &mut self.partitions[p].probe);
            for handle in rows.handles() {
                let batch = rows.take(handle)?;
                let joined = self.probe_resident(&batch)?;
                if joined.num_rows() > 0 {
                    out.push(joined);
                }
            }
            rows.release()?;
            self.finish_partition(collective, &mut out)?;
        }
        Ok(out)
    }

    /// Emit the unmatched build rows of the indexed partition and drop it.
    fn finish_partition(
        &mut self,
        collective: &dyn Collective,
        out: &mut Vec<RecordBatch>,
    ) -> Result<()> {
        let mut table = self
            .table
            .take()
            .ok_or_else(|| TesseraError::Execution("probe before build finished".to_string()))?;
        if self.layout.join_type.build_outer() {
            if self.replicated() {
                table.merge_matched(collective)?;
            }
            if !self.replicated() || self.rank == 0 {
                let rows = table.unmatched(&self.layout)?;
                self.stats.output_rows += rows.num_rows() as u64;
                if rows.num_rows() > 0 {
                    out.push(rows);
                }
            }
        }
        drop(table);
        self.reservation.resize(0)?;
        Ok(())
    }

    /// Drop all state and spilled chunks.
    pub fn release(&mut self) -> Result<()> {
        self.table = None;
        self.shuffle.reset();
        self.build.release()?;
        for part in &mut self.partitions {
            part.build.release()?;
            part.probe.release()?;
        }
        self.partitions.clear();
        self.reservation.free();
        Ok(())
    }
}

/// Nested-loop join: build rows stay where they were consumed and every
/// probe batch is broadcast to all workers. Build chunks are pinned one at a
/// time while a probe batch runs against them.
pub struct NestedLoopJoinEngine {
    layout: JoinLayout,
    predicate: RowPredicate,
    build: SpillableChunks,
    handles: Vec<ChunkHandle>,
    matched: Vec<Vec<bool>>,
    built: bool,
    stats: JoinStats,
}

impl std::fmt::Debug for NestedLoopJoinEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedLoopJoinEngine")
            .field("join_type", &self.layout.join_type)
            .field("build_rows", &self.build.num_rows())
            .field("stats", &self.stats)
            .finish()
    }
}

impl NestedLoopJoinEngine {
    pub fn try_new(
        layout: JoinLayout,
        predicate: RowPredicate,
        pool: &Arc<OperatorBufferPool>,
        spill: SharedSpillManager,
    ) -> Result<Self> {
        Ok(Self {
            build: SpillableChunks::new(
                Arc::clone(&layout.build_schema),
                pool.reservation(),
                spill,
            ),
            layout,
            predicate,
            handles: Vec::new(),
            matched: Vec::new(),
            built: false,
            stats: JoinStats {
                build_partitions: 1,
                ..JoinStats::default()
            },
        })
    }

    pub fn layout(&self) -> &JoinLayout {
        &self.layout
    }

    pub fn stats(&self) -> JoinStats {
        self.stats
    }

    pub fn consume_build(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.stats.build_rows += batch.num_rows() as u64;
        self.matched.push(vec![false; batch.num_rows()]);
        self.handles.push(self.build.append(batch.clone())?);
        Ok(())
    }

    pub fn finish_build(&mut self) -> Result<()> {
        self.built = true;
        debug!(
            build_rows = self.build.num_rows(),
            spilled_chunks = self.build.spilled_chunks(),
            "nested-loop build finished"
        );
        Ok(())
    }

    /// Join this worker's probe batch and every other worker's. Collective.
    pub fn probe(
        &mut self,
        collective: &dyn Collective,
        batch: &RecordBatch,
    ) -> Result<RecordBatch> {
        if !self.built {
            return Err(TesseraError::Execution("probe before build finished".to_string()));
        }
        let n = collective.size();
        let mut outputs = Vec::new();
        for root in 0..n {
            let probe = if n == 1 {
                batch.clone()
            } else {
                broadcast_batch(collective, root, batch)?
            };
            let mut probe_matched = vec![0u8; probe.num_rows()];
            for (c, &handle) in self.handles.iter().enumerate() {
                let build = self.build.pin(handle)?;
                let mut probe_idx = Vec::new();
                let mut build_idx = Vec::new();
                for (i, hit) in probe_matched.iter_mut().enumerate() {
                    for j in 0..build.num_rows() {
                        if (self.predicate)(&probe, i, &build, j) {
                            probe_idx.push(i as u32);
                            build_idx.push(j as u32);
                            self.matched[c][j] = true;
                            *hit = 1;
                        }
                    }
                }
                if !probe_idx.is_empty() {
                    outputs.push(self.layout.assemble(
                        Some(&probe),
                        &UInt32Array::from(probe_idx),
                        Some(&build),
                        &UInt32Array::from(build_idx),
                    )?);
                }
                self.build.unpin(handle)?;
            }
            if self.layout.join_type.probe_outer() {
                let global = if n == 1 {
                    probe_matched
                } else {
                    collective.allreduce(&probe_matched, ReduceOp::Max)?
                };
                if collective.rank() == root {
                    let rows = global
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| **m == 0)
                        .map(|(i, _)| Some(i as u32))
                        .collect::<Vec<_>>();
                    let build_idx = UInt32Array::from(vec![None::<u32>; rows.len()]);
                    outputs.push(self.layout.assemble(
                        Some(&probe),
                        &UInt32Array::from(rows),
                        None,
                        &build_idx,
                    )?);
                }
            }
            if root == collective.rank() {
                self.stats.probe_rows += probe.num_rows() as u64;
            }
        }
        let out = concat_batches(&self.layout.output_schema, &outputs)?;
        self.stats.output_rows += out.num_rows() as u64;
        Ok(out)
    }

    /// Build rows no probe row on any worker matched.
    pub fn finish_probe(&mut self) -> Result<Vec<RecordBatch>> {
        if !self.layout.join_type.build_outer() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (c, &handle) in self.handles.iter().enumerate() {
            let build = self.build.take(handle)?;
            let rows = self.matched[c]
                .iter()
                .enumerate()
                .filter(|(_, m)| !**m)
                .map(|(i, _)| i as u32)
                .collect::<Vec<_>>();
            if rows.is_empty() {
                continue;
            }
            let probe_idx = UInt32Array::from(vec![None::<u32>; rows.len()]);
            let rows = self
                .layout
                .assemble(None, &probe_idx, Some(&build), &UInt32Array::from(rows))?;
            self.stats.output_rows += rows.num_rows() as u64;
            out.push(rows);
        }
        self.handles.clear();
        Ok(out)
    }

    pub fn release(&mut self) -> Result<()> {
        self.handles.clear();
        self.matched.clear();
        self.build.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use arrow::array::{Array, AsArray, DictionaryArray, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Int32Type, Int64Type};
    use tessera_common::{BufferPool, SpillLocation, SpillTier};
    use tessera_exchange::SingleProcess;
    use tessera_spill::SpillManager;

    fn side(name: &str, keys: Vec<Option<&str>>, vals: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(format!("{name}_k"), DataType::Utf8, true),
            Field::new(format!("{name}_v"), DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(keys)), Arc::new(Int64Array::from(vals))],
        )
        .expect("batch")
    }

    fn layout(join_type: JoinType) -> JoinLayout {
        JoinLayout::try_new(
            side("p", vec![], vec![]).schema(),
            side("b", vec![], vec![]).schema(),
            vec![0],
            vec![0],
            join_type,
        )
        .expect("layout")
    }

    fn pairs(out: &RecordBatch) -> Vec<(Option<i64>, Option<i64>)> {
        let p = out.column(1).as_primitive::<Int64Type>();
        let b = out.column(3).as_primitive::<Int64Type>();
        (0..out.num_rows())
            .map(|i| {
                (
                    p.is_valid(i).then(|| p.value(i)),
                    b.is_valid(i).then(|| b.value(i)),
                )
            })
            .collect()
    }

    fn spill(dir: &std::path::Path) -> SharedSpillManager {
        let tier = SpillTier {
            location: SpillLocation::Local(dir.to_path_buf()),
            quota_bytes: None,
        };
        Arc::new(Mutex::new(SpillManager::try_new(&[tier], 0).expect("spill")))
    }

    fn engine(
        layout: JoinLayout,
        pool: &Arc<OperatorBufferPool>,
        dir: &std::path::Path,
    ) -> HashJoinEngine {
        HashJoinEngine::try_new(layout, false, false, 0, 1, Arc::clone(pool), spill(dir), 6)
            .expect("engine")
    }

    fn dict_side(name: &str, keys: Vec<i64>, vals: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(format!("{name}_k"), DataType::Int64, false),
            Field::new(
                format!("{name}_v"),
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
                false,
            ),
        ]));
        let vals = vals.into_iter().collect::<DictionaryArray<Int32Type>>();
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(keys)), Arc::new(vals)])
            .expect("batch")
    }

    fn strings(column: &ArrayRef) -> Vec<String> {
        let dict = column.as_dictionary::<Int32Type>();
        let values = dict.values().as_string::<i32>();
        dict.keys()
            .values()
            .iter()
            .map(|&k| values.value(k as usize).to_string())
            .collect()
    }

    #[test]
    fn dictionary_columns_keep_their_strings_across_build_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = BufferPool::new(1 << 30).operator_pool(1 << 20, 200);
        let probe = dict_side("p", vec![1, 3], vec!["left", "right"]);
        let layout = JoinLayout::try_new(
            probe.schema(),
            dict_side("b", vec![], vec![]).schema(),
            vec![0],
            vec![0],
            JoinType::Inner,
        )
        .expect("layout");
        let mut join = engine(layout, &pool, dir.path());
        join.consume_build(&dict_side("b", vec![1], vec!["apple"])).expect("build");
        join.consume_build(&dict_side("b", vec![2, 3], vec!["x", "y"])).expect("build");
        join.finish_build(&SingleProcess).expect("finish build");
        let out = join.probe(&SingleProcess, &probe).expect("join");
        assert_eq!(strings(out.column(1)), vec!["left", "right"]);
        assert_eq!(strings(out.column(3)), vec!["apple", "y"]);
        assert!(join.finish_probe(&SingleProcess).expect("finish").is_empty());
        join.release().expect("release");
    }

    #[test]
    fn dictionary_keys_match_by_string_not_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = BufferPool::new(1 << 30).operator_pool(1 << 20, 200);
        let dict_key = |name: &str, keys: Vec<&str>, vals: Vec<i64>| {
            let schema = Arc::new(Schema::new(vec![
                Field::new(
                    format!("{name}_k"),
                    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
                    false,
                ),
                Field::new(format!("{name}_v"), DataType::Int64, false),
            ]));
            let keys = keys.into_iter().collect::<DictionaryArray<Int32Type>>();
            RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(Int64Array::from(vals))])
                .expect("batch")
        };
        let probe = dict_key("p", vec!["a", "c"], vec![10, 30]);
        let build = dict_key("b", vec!["b", "a"], vec![2, 1]);
        let layout =
            JoinLayout::try_new(probe.schema(), build.schema(), vec![0], vec![0], JoinType::Left)
                .expect("layout");
        let mut join = engine(layout, &pool, dir.path());
        join.consume_build(&build).expect("build");
        join.finish_build(&SingleProcess).expect("finish build");
        let out = join.probe(&SingleProcess, &probe).expect("join");
        assert_eq!(pairs(&out), vec![(Some(10), Some(1)), (Some(30), None)]);
    }

    fn int_side(name: &str, keys: std::ops::Range<i64>, scale: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new(format!("{name}_k"), DataType::Int64, false),
            Field::new(format!("{name}_v"), DataType::Int64, false),
        ]));
        let vals = keys.clone().map(|k| k * scale).collect::<Int64Array>();
        let keys = Int64Array::from_iter_values(keys);
        RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(vals)]).expect("batch")
    }

    fn full_join(pool: &Arc<OperatorBufferPool>) -> (Vec<(Option<i64>, Option<i64>)>, JoinStats) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = JoinLayout::try_new(
            int_side("p", 0..0, 1).schema(),
            int_side("b", 0..0, 1).schema(),
            vec![0],
            vec![0],
            JoinType::Full,
        )
        .expect("layout");
        let mut join = engine(layout, pool, dir.path());
        for start in (0..4000).step_by(500) {
            join.consume_build(&int_side("b", start..start + 500, 10)).expect("build");
        }
        join.finish_build(&SingleProcess).expect("finish build");
        let mut rows = Vec::new();
        for start in (2000..6000).step_by(500) {
            let batch = int_side("p", start..start + 500, 1);
            let out = join.probe(&SingleProcess, &batch).expect("join");
            rows.extend(pairs(&out));
        }
        for out in join.finish_probe(&SingleProcess).expect("finish") {
            rows.extend(pairs(&out));
        }
        let stats = join.stats();
        join.release().expect("release");
        rows.sort();
        (rows, stats)
    }

    #[test]
    fn build_side_is_partitioned_under_a_small_budget() {
        let roomy = BufferPool::new(1 << 30).operator_pool(64 << 20, 200);
        let (expected, stats) = full_join(&roomy);
        assert_eq!(stats.build_partitions, 1);
        assert_eq!(expected.len(), 6000);
        assert_eq!(expected.iter().filter(|(p, b)| p.is_some() && b.is_some()).count(), 2000);

        let tight = BufferPool::new(1 << 30).operator_pool(24 * 1024, 200);
        let (rows, stats) = full_join(&tight);
        assert!(stats.build_partitions > 1);
        assert_eq!(rows, expected);
        assert!(tight.peak_bytes() <= 2 * 24 * 1024);
        assert_eq!(tight.used_bytes(), 0);
    }

    #[test]
    fn probe_emits_every_build_row_of_a_key_in_order() {
        let build = side("b", vec![Some("x"), Some("y"), Some("x"), None], vec![1, 2, 3, 4]);
        let mut table = HashJoinTable::try_new(build, &[0], false).expect("table");
        let probe = side("p", vec![Some("x"), None, Some("z")], vec![10, 20, 30]);
        let l = layout(JoinType::Full);
        let out = table.probe(&l, &probe, false).expect("probe");
        assert_eq!(
            pairs(&out),
            vec![(Some(10), Some(1)), (Some(10), Some(3)), (Some(20), None), (Some(30), None)]
        );
        let rest = table.unmatched(&l).expect("unmatched");
        let v = rest.column(3).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(v, vec![2, 4]);
        assert_eq!(rest.column(1).null_count(), 2);
    }

    #[test]
    fn null_keys_match_only_when_configured() {
        let build = side("b", vec![None], vec![1]);
        let probe = side("p", vec![None], vec![10]);
        let mut strict = HashJoinTable::try_new(build.clone(), &[0], false).expect("table");
        let out = strict.probe(&layout(JoinType::Inner), &probe, false).expect("probe");
        assert_eq!(out.num_rows(), 0);
        let mut loose = HashJoinTable::try_new(build, &[0], true).expect("table");
        let out = loose.probe(&layout(JoinType::Inner), &probe, true).expect("probe");
        assert_eq!(pairs(&out), vec![(Some(10), Some(1))]);
    }

    #[test]
    fn mismatched_key_types_are_rejected() {
        let probe = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let build = Arc::new(Schema::new(vec![Field::new("k", DataType::Utf8, true)]));
        let err = JoinLayout::try_new(probe, build, vec![0], vec![0], JoinType::Inner)
            .expect_err("types differ");
        assert!(matches!(err, TesseraError::InvalidConfig(_)));
    }
}
