//! Operator output staging and optional cross-worker rebalancing.

use std::collections::VecDeque;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tessera_common::ipc::{decode_batches, encode_batches};
use tessera_common::Result;
use tessera_exchange::{Collective, CollectiveExt};
use tracing::debug;

/// Workers holding more than this multiple of the mean row count give away
/// their excess when output work stealing is enabled.
const IMBALANCE_RATIO: f64 = 1.5;

/// Accumulates finalized rows and hands them out `batch_size` rows at a time.
#[derive(Debug)]
pub struct ChunkedOutputBuffer {
    schema: SchemaRef,
    batch_size: usize,
    pending: VecDeque<RecordBatch>,
    rows: usize,
}

impl ChunkedOutputBuffer {
    pub fn new(schema: SchemaRef, batch_size: usize) -> Self {
        Self {
            schema,
            batch_size: batch_size.max(1),
            pending: VecDeque::new(),
            rows: 0,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn append(&mut self, batch: RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        self.rows += batch.num_rows();
        self.pending.push_back(batch);
    }

    /// Next output batch of at most `batch_size` rows.
    pub fn pop(&mut self) -> Result<Option<RecordBatch>> {
        if self.rows == 0 {
            return Ok(None);
        }
        let mut parts = Vec::new();
        let mut need = self.batch_size;
        while need > 0 {
            let Some(front) = self.pending.pop_front() else {
                break;
            };
            if front.num_rows() <= need {
                need -= front.num_rows();
                parts.push(front);
            } else {
                parts.push(front.slice(0, need));
                self.pending
                    .push_front(front.slice(need, front.num_rows() - need));
                need = 0;
            }
        }
        let out = if parts.len() == 1 {
            parts.remove(0)
        } else {
            concat_batches(&self.schema, &parts)?
        };
        self.rows -= out.num_rows();
        Ok(Some(out))
    }

    /// Remove up to `n` rows from the back.
    fn take_back(&mut self, mut n: usize) -> Vec<RecordBatch> {
        let mut out = Vec::new();
        while n > 0 {
            let Some(back) = self.pending.pop_back() else {
                break;
            };
            let len = back.num_rows();
            if len <= n {
                n -= len;
                self.rows -= len;
                out.push(back);
            } else {
                out.push(back.slice(len - n, n));
                self.pending.push_back(back.slice(0, len - n));
                self.rows -= n;
                n = 0;
            }
        }
        out
    }

    /// Even out row counts across workers with one all-to-all.
    ///
    /// Every worker computes the same transfer plan from the all-gathered
    /// counts, so no further coordination is needed.
    pub fn rebalance(&mut self, collective: &dyn Collective) -> Result<usize> {
        let n = collective.size();
        if n <= 1 {
            return Ok(0);
        }
        let counts = collective
            .all_gather((self.rows as u64).to_le_bytes().to_vec())?
            .iter()
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b[..8.min(b.len())]);
                u64::from_le_bytes(arr) as usize
            })
            .collect::<Vec<_>>();
        let plan = plan_transfers(&counts);
        let rank = collective.rank();
        let mut outgoing = vec![Vec::new(); n];
        let mut sent = 0;
        for &(from, to, rows) in &plan {
            if from == rank {
                let batches = self.take_back(rows);
                outgoing[to] = encode_batches(&self.schema, &batches)?;
                sent += rows;
            }
        }
        let incoming = collective.all_to_all(outgoing)?;
        let mut received = 0;
        for bytes in incoming.iter().filter(|b| !b.is_empty()) {
            let (_, batches) = decode_batches(bytes)?;
            for b in batches {
                received += b.num_rows();
                self.append(b);
            }
        }
        debug!(rank, rows_sent = sent, rows_received = received, "output rebalanced");
        Ok(received)
    }
}

/// `(from, to, rows)` transfers bringing every worker down to about the mean,
/// computed only when some worker exceeds the mean by [`IMBALANCE_RATIO`].
pub fn plan_transfers(counts: &[usize]) -> Vec<(usize, usize, usize)> {
    let n = counts.len();
    let total: usize = counts.iter().sum();
    if n <= 1 || total == 0 {
        return Vec::new();
    }
    let mean = total as f64 / n as f64;
    if counts.iter().all(|&c| (c as f64) <= mean * IMBALANCE_RATIO) {
        return Vec::new();
    }
    let target = total.div_ceil(n);
    let mut excess = counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > target)
        .map(|(r, &c)| (r, c - target))
        .collect::<Vec<_>>();
    let mut deficit = counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c < target)
        .map(|(r, &c)| (r, target - c))
        .collect::<Vec<_>>();
    let mut plan = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < excess.len() && j < deficit.len() {
        let rows = excess[i].1.min(deficit[j].1);
        if rows > 0 {
            plan.push((excess[i].0, deficit[j].0, rows));
        }
        excess[i].1 -= rows;
        deficit[j].1 -= rows;
        if excess[i].1 == 0 {
            i += 1;
        }
        if deficit[j].1 == 0 {
            j += 1;
        }
    }
    plan
}
