//! Dictionary unification.
//!
//! Every dictionary-encoded column seen by an operator is rewritten against
//! one canonical dictionary before rows move anywhere (build buffers, an
//! exchange, output). The canonical dictionary only grows, so codes handed out
//! stay valid until [`DictionaryBuilder::make_global`] renumbers the strings
//! that were added locally since the previous synchronization.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, DictionaryArray, Int32Array, StringArray};
use arrow::datatypes::{DataType, Int32Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use tessera_common::{Result, TesseraError};
use tracing::debug;

use crate::collective::{Collective, CollectiveExt};

pub fn is_dictionary_type(dt: &DataType) -> bool {
    matches!(dt, DataType::Dictionary(k, v) if **k == DataType::Int32 && **v == DataType::Utf8)
}

/// Canonical dictionary of one column.
#[derive(Debug, Clone, Default)]
pub struct DictionaryBuilder {
    values: Vec<String>,
    index: HashMap<String, i32, ahash::RandomState>,
    synced_len: usize,
    cached: Option<ArrayRef>,
}

impl DictionaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of leading entries known to agree across all workers.
    pub fn global_len(&self) -> usize {
        self.synced_len
    }

    pub fn intern(&mut self, s: &str) -> Result<i32> {
        if let Some(&code) = self.index.get(s) {
            return Ok(code);
        }
        let code = i32::try_from(self.values.len())
            .map_err(|_| TesseraError::Execution("dictionary exceeds i32 codes".to_string()))?;
        self.values.push(s.to_string());
        self.index.insert(s.to_string(), code);
        self.cached = None;
        Ok(code)
    }

    /// Canonical values as an Arrow string array.
    pub fn values_array(&mut self) -> ArrayRef {
        if let Some(a) = &self.cached {
            return Arc::clone(a);
        }
        let arr: ArrayRef = Arc::new(StringArray::from_iter_values(self.values.iter()));
        self.cached = Some(Arc::clone(&arr));
        arr
    }

    /// Rewrite a `Utf8` or `Dictionary(Int32, Utf8)` array against the
    /// canonical dictionary.
    pub fn unify(&mut self, array: &ArrayRef) -> Result<ArrayRef> {
        let codes = match array.data_type() {
            DataType::Utf8 => {
                let strings = array.as_string::<i32>();
                let mut codes = Vec::with_capacity(strings.len());
                for i in 0..strings.len() {
                    codes.push(if strings.is_null(i) {
                        None
                    } else {
                        Some(self.intern(strings.value(i))?)
                    });
                }
                Int32Array::from(codes)
            }
            dt if is_dictionary_type(dt) => {
                let dict: &DictionaryArray<Int32Type> = array.as_dictionary();
                let values = dict.values().as_string::<i32>();
                let mut mapping = Vec::with_capacity(values.len());
                for i in 0..values.len() {
                    mapping.push(if values.is_null(i) {
                        None
                    } else {
                        Some(self.intern(values.value(i))?)
                    });
                }
                dict.keys()
                    .iter()
                    .map(|k| k.and_then(|k| mapping.get(k as usize).copied().flatten()))
                    .collect::<Int32Array>()
            }
            other => {
                return Err(TesseraError::Execution(format!(
                    "cannot dictionary-encode a {other} column"
                )))
            }
        };
        let values = self.values_array();
        Ok(Arc::new(DictionaryArray::<Int32Type>::try_new(codes, values)?))
    }

    /// Agree on one dictionary with every other worker.
    ///
    /// Strings added since the previous call are all-gathered and appended in
    /// rank order, skipping duplicates, so every worker ends with the same
    /// list. Returns the old-code to new-code mapping for the local codes.
    pub fn make_global(&mut self, collective: &dyn Collective) -> Result<Vec<i32>> {
        let local_new = encode_strings(&self.values[self.synced_len..]);
        let gathered = collective.all_gather(local_new)?;

        let old_values = std::mem::take(&mut self.values);
        self.values = old_values[..self.synced_len].to_vec();
        self.index.retain(|_, code| (*code as usize) < self.synced_len);
        self.cached = None;
        for bytes in &gathered {
            for s in decode_strings(bytes)? {
                self.intern(&s)?;
            }
        }
        let mut remap = Vec::with_capacity(old_values.len());
        for s in &old_values {
            remap.push(self.intern(s)?);
        }
        debug!(
            rank = collective.rank(),
            local_entries = old_values.len(),
            global_entries = self.values.len(),
            "dictionary made global"
        );
        self.synced_len = self.values.len();
        Ok(remap)
    }
}

/// Apply a [`DictionaryBuilder::make_global`] mapping to stored codes.
pub fn remap_codes(codes: &mut [i32], remap: &[i32]) {
    for c in codes.iter_mut() {
        if let Some(&n) = remap.get(*c as usize) {
            *c = n;
        }
    }
}

/// One builder per dictionary-encoded column of a schema.
#[derive(Debug, Clone)]
pub struct DictionaryUnifier {
    builders: Vec<Option<DictionaryBuilder>>,
}

impl DictionaryUnifier {
    pub fn new(schema: &SchemaRef) -> Self {
        Self {
            builders: schema
                .fields()
                .iter()
                .map(|f| is_dictionary_type(f.data_type()).then(DictionaryBuilder::new))
                .collect(),
        }
    }

    pub fn has_dictionaries(&self) -> bool {
        self.builders.iter().any(Option::is_some)
    }

    pub fn builder_mut(&mut self, column: usize) -> Option<&mut DictionaryBuilder> {
        self.builders.get_mut(column).and_then(Option::as_mut)
    }

    /// Rewrite every dictionary column of `batch` (whose schema has the same
    /// column layout as the one given to [`Self::new`]) against its builder.
    pub fn unify_batch(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        if !self.has_dictionaries() {
            return Ok(batch.clone());
        }
        let mut columns = batch.columns().to_vec();
        for (i, builder) in self.builders.iter_mut().enumerate() {
            if let (Some(b), Some(col)) = (builder.as_mut(), columns.get_mut(i)) {
                *col = b.unify(col)?;
            }
        }
        Ok(RecordBatch::try_new(batch.schema(), columns)?)
    }

    /// Make every column dictionary global; returns the per-column remaps.
    pub fn make_global(&mut self, collective: &dyn Collective) -> Result<Vec<Option<Vec<i32>>>> {
        self.builders
            .iter_mut()
            .map(|b| b.as_mut().map(|b| b.make_global(collective)).transpose())
            .collect()
    }
}

fn encode_strings(values: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    out
}

fn decode_strings(mut bytes: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(TesseraError::Collective("truncated dictionary payload".to_string()));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let end = 4 + len;
        let s = bytes
            .get(4..end)
            .ok_or_else(|| TesseraError::Collective("truncated dictionary payload".to_string()))?;
        out.push(
            String::from_utf8(s.to_vec())
                .map_err(|e| TesseraError::Collective(format!("invalid dictionary entry: {e}")))?,
        );
        bytes = &bytes[end..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCollectiveGroup;
    use std::thread;

    fn dict(values: &[Option<&str>]) -> ArrayRef {
        Arc::new(values.iter().copied().collect::<DictionaryArray<Int32Type>>())
    }

    fn decoded(array: &ArrayRef) -> Vec<Option<String>> {
        let d: &DictionaryArray<Int32Type> = array.as_dictionary();
        let v = d.values().as_string::<i32>();
        d.keys()
            .iter()
            .map(|k| k.map(|k| v.value(k as usize).to_string()))
            .collect()
    }

    #[test]
    fn unify_rewrites_codes_against_canonical_values() {
        let mut b = DictionaryBuilder::new();
        let first = b.unify(&dict(&[Some("x"), Some("y")])).expect("first");
        let second = b.unify(&dict(&[Some("y"), None, Some("z"), Some("x")])).expect("second");
        assert_eq!(b.len(), 3);
        assert_eq!(decoded(&first), vec![Some("x".into()), Some("y".into())]);
        assert_eq!(
            decoded(&second),
            vec![Some("y".into()), None, Some("z".into()), Some("x".into())]
        );
        let codes = second.as_dictionary::<Int32Type>().keys().clone();
        assert_eq!(codes.value(0), 1);
        assert_eq!(codes.value(3), 0);
    }

    #[test]
    fn make_global_agrees_across_workers() {
        let inputs = [vec!["b", "a"], vec!["c", "a"]];
        let handles = LocalCollectiveGroup::create(2)
            .into_iter()
            .zip(inputs)
            .map(|(c, words)| {
                thread::spawn(move || {
                    let mut b = DictionaryBuilder::new();
                    let plain: ArrayRef = Arc::new(StringArray::from(words));
                    let unified = b.unify(&plain).expect("unify");
                    let mut codes = unified
                        .as_dictionary::<Int32Type>()
                        .keys()
                        .values()
                        .to_vec();
                    let remap = b.make_global(&c).expect("global");
                    remap_codes(&mut codes, &remap);
                    let values = b.values.clone();
                    let words = codes
                        .iter()
                        .map(|&c| values[c as usize].clone())
                        .collect::<Vec<_>>();
                    (values, words, b.global_len())
                })
            })
            .collect::<Vec<_>>();
        let outs = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect::<Vec<_>>();
        assert_eq!(outs[0].0, vec!["b", "a", "c"]);
        assert_eq!(outs[0].0, outs[1].0);
        assert_eq!(outs[0].1, vec!["b", "a"]);
        assert_eq!(outs[1].1, vec!["c", "a"]);
        assert_eq!(outs[1].2, 3);
    }

    #[test]
    fn unifier_only_touches_dictionary_columns() {
        use arrow::array::Int64Array;
        use arrow::datatypes::{Field, Schema};
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "k",
                DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
                true,
            ),
            Field::new("v", DataType::Int64, false),
        ]));
        let mut u = DictionaryUnifier::new(&schema);
        assert!(u.has_dictionaries());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![dict(&[Some("q"), Some("p")]), Arc::new(Int64Array::from(vec![1, 2]))],
        )
        .expect("batch");
        let out = u.unify_batch(&batch).expect("unify");
        assert_eq!(decoded(out.column(0)), vec![Some("q".into()), Some("p".into())]);
        assert_eq!(u.builder_mut(0).expect("builder").len(), 2);
        assert!(u.builder_mut(1).is_none());
    }
}
