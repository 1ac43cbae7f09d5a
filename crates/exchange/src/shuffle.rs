//! Hash-partitioned all-to-all redistribution of record batches.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::record_batch::RecordBatch;
use tessera_common::ipc::{decode_batches, encode_batches};
use tessera_common::Result;
use tracing::debug;

use crate::collective::{Collective, CollectiveExt};
use crate::hash::{PARTITION_HASH_SEED, hash_rows, partition_for};

/// Owning rank of every row keyed by `key_columns`.
pub fn target_ranks(
    batch: &RecordBatch,
    key_columns: &[usize],
    n_workers: usize,
) -> Result<Vec<usize>> {
    let keys = key_columns
        .iter()
        .map(|&i| Arc::clone(batch.column(i)))
        .collect::<Vec<ArrayRef>>();
    if keys.is_empty() {
        return Ok(vec![0; batch.num_rows()]);
    }
    Ok(hash_rows(&keys, PARTITION_HASH_SEED)?
        .into_iter()
        .map(|h| partition_for(h, n_workers))
        .collect())
}

/// Row indices per target rank, preserving input order within each target.
pub fn group_by_target(targets: &[usize], n_workers: usize) -> Vec<Vec<u32>> {
    let mut out = vec![Vec::new(); n_workers];
    for (row, &t) in targets.iter().enumerate() {
        out[t].push(row as u32);
    }
    out
}

/// Send row `i` of `batch` to rank `targets[i]`; returns every row received,
/// concatenated in source-rank order (each source's order preserved).
pub fn shuffle_batch(
    collective: &dyn Collective,
    batch: &RecordBatch,
    targets: &[usize],
) -> Result<RecordBatch> {
    let schema = batch.schema();
    let n = collective.size();
    let mut outgoing = Vec::with_capacity(n);
    for rows in group_by_target(targets, n) {
        if rows.is_empty() {
            outgoing.push(Vec::new());
            continue;
        }
        let part = take_record_batch(batch, &UInt32Array::from(rows))?;
        outgoing.push(encode_batches(&schema, &[part])?);
    }
    let incoming = collective.all_to_all(outgoing)?;
    let mut received = Vec::new();
    for bytes in incoming.iter().filter(|b| !b.is_empty()) {
        let (_, batches) = decode_batches(bytes)?;
        received.extend(batches);
    }
    let out = concat_batches(&schema, &received)?;
    debug!(
        rank = collective.rank(),
        rows_sent = batch.num_rows(),
        rows_received = out.num_rows(),
        "shuffled batch"
    );
    Ok(out)
}

/// Shuffle `batch` so every row lands on the owner of its key.
pub fn shuffle_by_key(
    collective: &dyn Collective,
    batch: &RecordBatch,
    key_columns: &[usize],
) -> Result<RecordBatch> {
    let targets = target_ranks(batch, key_columns, collective.size())?;
    shuffle_batch(collective, batch, &targets)
}

/// Every rank receives `root`'s batch.
pub fn broadcast_batch(
    collective: &dyn Collective,
    root: usize,
    batch: &RecordBatch,
) -> Result<RecordBatch> {
    let schema = batch.schema();
    let payload = if collective.rank() == root {
        encode_batches(&schema, std::slice::from_ref(batch))?
    } else {
        Vec::new()
    };
    let bytes = collective.broadcast(root, payload)?;
    let (_, batches) = decode_batches(&bytes)?;
    Ok(concat_batches(&schema, &batches)?)
}

/// Every rank's batch, indexed by rank.
pub fn all_gather_batches(
    collective: &dyn Collective,
    batch: &RecordBatch,
) -> Result<Vec<RecordBatch>> {
    let schema = batch.schema();
    let payload = encode_batches(&schema, std::slice::from_ref(batch))?;
    collective
        .all_gather(payload)?
        .iter()
        .map(|bytes| {
            let (_, batches) = decode_batches(bytes)?;
            Ok(concat_batches(&schema, &batches)?)
        })
        .collect()
}
