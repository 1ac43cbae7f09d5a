//! Global sort collaborator used by the window engine.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::{SortColumn, SortOptions, lexsort_to_indices, take_record_batch};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use tessera_common::{Result, TesseraError};
use tessera_exchange::{Collective, CollectiveExt, shuffle_batch};
use tracing::debug;

/// One sort key over a column of the input batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    fn options(&self) -> SortOptions {
        SortOptions {
            descending: self.descending,
            nulls_first: self.nulls_first,
        }
    }
}

/// Sorts the rows of all workers.
///
/// After the call each worker holds a locally sorted batch, workers are
/// ordered by rank, and rows that agree on the first `range_keys` keys are on
/// the same worker.
pub trait GlobalSort: Send + Sync {
    fn sort(
        &self,
        collective: &dyn Collective,
        batch: RecordBatch,
        keys: &[SortKey],
        range_keys: usize,
    ) -> Result<RecordBatch>;
}

/// Stable lexicographic sort of one batch.
pub fn sort_batch(batch: &RecordBatch, keys: &[SortKey]) -> Result<RecordBatch> {
    if keys.is_empty() || batch.num_rows() <= 1 {
        return Ok(batch.clone());
    }
    let columns = keys
        .iter()
        .map(|k| SortColumn {
            values: Arc::clone(batch.column(k.column)),
            options: Some(k.options()),
        })
        .collect::<Vec<_>>();
    let indices = lexsort_to_indices(&columns, None)?;
    Ok(take_record_batch(batch, &indices)?)
}

/// Single-worker sort.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSort;

impl GlobalSort for LocalSort {
    fn sort(
        &self,
        collective: &dyn Collective,
        batch: RecordBatch,
        keys: &[SortKey],
        _range_keys: usize,
    ) -> Result<RecordBatch> {
        if collective.size() > 1 {
            return Err(TesseraError::InvalidConfig(format!(
                "LocalSort cannot order rows across {} workers",
                collective.size()
            )));
        }
        sort_batch(&batch, keys)
    }
}

/// Distributed sample sort: local sort, all-gather samples of the range
/// keys, pick `size - 1` splitters, route rows through one all-to-all and sort
/// again locally.
#[derive(Debug, Clone, Copy)]
pub struct SampleSort {
    pub samples_per_worker: usize,
}

impl Default for SampleSort {
    fn default() -> Self {
        Self {
            samples_per_worker: 128,
        }
    }
}

impl SampleSort {
    fn route(
        &self,
        collective: &dyn Collective,
        sorted: &RecordBatch,
        keys: &[SortKey],
    ) -> Result<Vec<usize>> {
        let n = collective.size();
        if keys.is_empty() {
            return Ok(vec![0; sorted.num_rows()]);
        }
        let fields = keys
            .iter()
            .map(|k| {
                SortField::new_with_options(
                    sorted.schema().field(k.column).data_type().clone(),
                    k.options(),
                )
            })
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)?;
        let columns = keys
            .iter()
            .map(|k| Arc::clone(sorted.column(k.column)))
            .collect::<Vec<ArrayRef>>();
        let rows = converter.convert_columns(&columns)?;

        let local = rows.num_rows();
        let take = self.samples_per_worker.min(local);
        let mut payload = Vec::new();
        for s in 0..take {
            let row = rows.row(s * local / take);
            let bytes: &[u8] = row.as_ref();
            payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }
        let mut samples = Vec::new();
        for buf in collective.all_gather(payload)? {
            let mut rest = buf.as_slice();
            while rest.len() >= 4 {
                let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                let sample = rest.get(4..4 + len).ok_or_else(|| {
                    TesseraError::Collective("truncated sort sample".to_string())
                })?;
                samples.push(sample.to_vec());
                rest = &rest[4 + len..];
            }
        }
        samples.sort();
        let splitters = (1..n)
            .filter_map(|i| samples.get(i * samples.len() / n).cloned())
            .collect::<Vec<_>>();
        debug!(
            rank = collective.rank(),
            samples = samples.len(),
            splitters = splitters.len(),
            "sample sort splitters chosen"
        );
        Ok((0..local)
            .map(|i| {
                let row = rows.row(i);
                let key: &[u8] = row.as_ref();
                splitters.partition_point(|s| s.as_slice() <= key)
            })
            .collect())
    }
}

impl GlobalSort for SampleSort {
    fn sort(
        &self,
        collective: &dyn Collective,
        batch: RecordBatch,
        keys: &[SortKey],
        range_keys: usize,
    ) -> Result<RecordBatch> {
        let sorted = sort_batch(&batch, keys)?;
        if collective.size() == 1 {
            return Ok(sorted);
        }
        let targets = self.route(collective, &sorted, &keys[..range_keys.min(keys.len())])?;
        let received = shuffle_batch(collective, &sorted, &targets)?;
        sort_batch(&received, keys)
    }
}
