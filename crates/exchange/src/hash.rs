//! Row hashing over key columns.
//!
//! Two independent seeds are used: the grouping hash drives hash tables and
//! spill partitioning, the partition hash selects the owning worker. Strings
//! hash by value, so plain and dictionary-encoded columns agree.

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, DictionaryArray, Float32Array, Float64Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Int32Type};
use tessera_common::{Result, TesseraError};

pub const GROUPING_HASH_SEED: u64 = 0x5157_0b1e_d3a1_77c3;
pub const PARTITION_HASH_SEED: u64 = 0x8f2a_64c9_1e07_b5d1;

const NULL_HASH: u64 = 0x2d35_8dcc_aa6c_78a5;

fn random_state(seed: u64) -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        seed,
        seed.rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15,
        seed.rotate_left(31) ^ 0xc2b2_ae3d_27d4_eb4f,
        seed.rotate_left(47) ^ 0x1656_67b1_9e37_79f9,
    )
}

#[inline]
fn combine(acc: u64, h: u64) -> u64 {
    acc ^ h
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

#[inline]
fn canonical_f64_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0_f64.to_bits()
    } else {
        v.to_bits()
    }
}

/// Hash every row of `columns` with `seed`. All columns must have equal length.
pub fn hash_rows(columns: &[ArrayRef], seed: u64) -> Result<Vec<u64>> {
    let n = columns.first().map(|c| c.len()).unwrap_or(0);
    let state = random_state(seed);
    let mut out = vec![seed; n];
    for col in columns {
        if col.len() != n {
            return Err(TesseraError::Execution(format!(
                "key column length mismatch: {} vs {n}",
                col.len()
            )));
        }
        hash_column(col, &state, &mut out)?;
    }
    Ok(out)
}

fn hash_column(col: &ArrayRef, state: &ahash::RandomState, out: &mut [u64]) -> Result<()> {
    macro_rules! fold {
        ($arr:expr, $f:expr) => {{
            let arr = $arr;
            for (i, slot) in out.iter_mut().enumerate() {
                let h = if arr.is_null(i) {
                    NULL_HASH
                } else {
                    $f(arr, i)
                };
                *slot = combine(*slot, h);
            }
        }};
    }
    match col.data_type() {
        DataType::Boolean => fold!(
            col.as_boolean(),
            |a: &BooleanArray, i| state.hash_one(a.value(i))
        ),
        DataType::Int32 => fold!(
            col.as_primitive::<Int32Type>(),
            |a: &Int32Array, i| state.hash_one(a.value(i) as i64)
        ),
        DataType::Int64 => fold!(
            col.as_primitive::<arrow::datatypes::Int64Type>(),
            |a: &Int64Array, i| state.hash_one(a.value(i))
        ),
        DataType::Float32 => fold!(
            col.as_primitive::<arrow::datatypes::Float32Type>(),
            |a: &Float32Array, i| state.hash_one(canonical_f64_bits(a.value(i) as f64))
        ),
        DataType::Float64 => fold!(
            col.as_primitive::<arrow::datatypes::Float64Type>(),
            |a: &Float64Array, i| state.hash_one(canonical_f64_bits(a.value(i)))
        ),
        DataType::Utf8 => fold!(
            col.as_string::<i32>(),
            |a: &StringArray, i| state.hash_one(a.value(i))
        ),
        DataType::Dictionary(k, v) if **k == DataType::Int32 && **v == DataType::Utf8 => {
            let dict: &DictionaryArray<Int32Type> = col.as_dictionary();
            let values = dict.values().as_string::<i32>();
            let value_hashes = (0..values.len())
                .map(|i| {
                    if values.is_null(i) {
                        NULL_HASH
                    } else {
                        state.hash_one(values.value(i))
                    }
                })
                .collect::<Vec<_>>();
            let keys = dict.keys();
            for (i, slot) in out.iter_mut().enumerate() {
                let h = if keys.is_null(i) {
                    NULL_HASH
                } else {
                    value_hashes[keys.value(i) as usize]
                };
                *slot = combine(*slot, h);
            }
        }
        other => {
            return Err(TesseraError::Unsupported(format!(
                "hashing of {other} key columns"
            )))
        }
    }
    Ok(())
}

/// Owning worker of a row with partition hash `hash`.
#[inline]
pub fn partition_for(hash: u64, n_workers: usize) -> usize {
    (hash % n_workers.max(1) as u64) as usize
}

/// Top `depth` bits of a grouping hash; selects a spill partition.
#[inline]
pub fn top_bits(hash: u64, depth: u32) -> u64 {
    if depth == 0 {
        0
    } else {
        hash >> (64 - depth.min(63))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn dictionary_and_plain_strings_hash_alike() {
        let plain: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None, Some("b")]));
        let dict: ArrayRef = Arc::new(
            vec![Some("a"), None, Some("b")]
                .into_iter()
                .collect::<DictionaryArray<Int32Type>>(),
        );
        let a = hash_rows(&[plain], PARTITION_HASH_SEED).expect("plain");
        let b = hash_rows(&[dict], PARTITION_HASH_SEED).expect("dict");
        assert_eq!(a, b);
    }

    #[test]
    fn seeds_are_independent_and_stable() {
        let col: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 1]));
        let g = hash_rows(&[col.clone()], GROUPING_HASH_SEED).expect("g");
        let p = hash_rows(&[col.clone()], PARTITION_HASH_SEED).expect("p");
        assert_eq!(g[0], g[2]);
        assert_ne!(g[0], g[1]);
        assert_ne!(g, p);
        assert_eq!(p, hash_rows(&[col], PARTITION_HASH_SEED).expect("again"));
    }

    #[test]
    fn float_zero_and_nan_are_canonical() {
        let col: ArrayRef = Arc::new(Float64Array::from(vec![0.0, -0.0, f64::NAN, -f64::NAN]));
        let h = hash_rows(&[col], GROUPING_HASH_SEED).expect("hash");
        assert_eq!(h[0], h[1]);
        assert_eq!(h[2], h[3]);
    }

    #[test]
    fn top_bits_select_partition() {
        assert_eq!(top_bits(u64::MAX, 0), 0);
        assert_eq!(top_bits(1 << 63, 1), 1);
        assert_eq!(top_bits(0b11 << 62, 2), 3);
        assert_eq!(partition_for(7, 2), 1);
        assert_eq!(partition_for(7, 0), 0);
    }
}
