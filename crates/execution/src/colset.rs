//! Per-function accumulator columns.
//!
//! A [`ColSet`] owns the running state of one requested function over the
//! groups of an operator. State is exported and re-imported through a fixed
//! intermediate layout (see [`ColSet::intermediate_fields`]) so that update
//! output, shuffled partials and spilled partials all fold through the same
//! [`ColSet::combine`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, ListArray};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Field, Float32Type, Float64Type, Int32Type, Int64Type};
use serde::{Deserialize, Serialize};
use tessera_common::{Result, TesseraError};

/// Every function an operator can be asked to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    Count,
    Size,
    Min,
    Max,
    Mean,
    First,
    Last,
    Prod,
    Var,
    Std,
    BoolOr,
    NUnique,
    Median,
    Cumsum,
    Cummin,
    Cummax,
    Cumprod,
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Reduce,
    Cumulative,
    Window,
}

impl AggFunc {
    pub fn kind(self) -> FuncKind {
        match self {
            Self::Sum
            | Self::Count
            | Self::Size
            | Self::Min
            | Self::Max
            | Self::Mean
            | Self::First
            | Self::Last
            | Self::Prod
            | Self::Var
            | Self::Std
            | Self::BoolOr
            | Self::NUnique
            | Self::Median => FuncKind::Reduce,
            Self::Cumsum | Self::Cummin | Self::Cummax | Self::Cumprod => FuncKind::Cumulative,
            Self::RowNumber | Self::Rank | Self::DenseRank | Self::PercentRank | Self::CumeDist => {
                FuncKind::Window
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Size => "size",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::First => "first",
            Self::Last => "last",
            Self::Prod => "prod",
            Self::Var => "var",
            Self::Std => "std",
            Self::BoolOr => "boolor_agg",
            Self::NUnique => "nunique",
            Self::Median => "median",
            Self::Cumsum => "cumsum",
            Self::Cummin => "cummin",
            Self::Cummax => "cummax",
            Self::Cumprod => "cumprod",
            Self::RowNumber => "row_number",
            Self::Rank => "rank",
            Self::DenseRank => "dense_rank",
            Self::PercentRank => "percent_rank",
            Self::CumeDist => "cume_dist",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggFunc {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sum" => Self::Sum,
            "count" => Self::Count,
            "size" => Self::Size,
            "min" => Self::Min,
            "max" => Self::Max,
            "mean" | "avg" => Self::Mean,
            "first" => Self::First,
            "last" => Self::Last,
            "prod" | "product" => Self::Prod,
            "var" | "variance" => Self::Var,
            "std" | "stddev" => Self::Std,
            "boolor_agg" | "bool_or" => Self::BoolOr,
            "nunique" => Self::NUnique,
            "median" => Self::Median,
            "cumsum" => Self::Cumsum,
            "cummin" => Self::Cummin,
            "cummax" => Self::Cummax,
            "cumprod" => Self::Cumprod,
            "row_number" => Self::RowNumber,
            "rank" => Self::Rank,
            "dense_rank" => Self::DenseRank,
            "percent_rank" => Self::PercentRank,
            "cume_dist" => Self::CumeDist,
            other => {
                return Err(TesseraError::InvalidConfig(format!(
                    "unknown function '{other}'"
                )))
            }
        })
    }
}

/// Numeric domain of a value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    Int,
    Float,
}

impl NumKind {
    pub fn of(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Int32 | DataType::Int64 => Some(Self::Int),
            DataType::Float32 | DataType::Float64 => Some(Self::Float),
            _ => None,
        }
    }

    pub fn output_type(self) -> DataType {
        match self {
            Self::Int => DataType::Int64,
            Self::Float => DataType::Float64,
        }
    }
}

/// Read access to a numeric column widened to `i64` / `f64`.
#[derive(Debug, Clone, Copy)]
pub enum NumericView<'a> {
    Int32(&'a arrow::array::Int32Array),
    Int64(&'a Int64Array),
    Float32(&'a arrow::array::Float32Array),
    Float64(&'a Float64Array),
}

impl<'a> NumericView<'a> {
    pub fn try_new(array: &'a ArrayRef) -> Result<Self> {
        Ok(match array.data_type() {
            DataType::Int32 => Self::Int32(array.as_primitive::<Int32Type>()),
            DataType::Int64 => Self::Int64(array.as_primitive::<Int64Type>()),
            DataType::Float32 => Self::Float32(array.as_primitive::<Float32Type>()),
            DataType::Float64 => Self::Float64(array.as_primitive::<Float64Type>()),
            other => {
                return Err(TesseraError::InvalidConfig(format!(
                    "expected a numeric column, got {other}"
                )))
            }
        })
    }

    pub fn is_null(&self, i: usize) -> bool {
        match self {
            Self::Int32(a) => a.is_null(i),
            Self::Int64(a) => a.is_null(i),
            Self::Float32(a) => a.is_null(i),
            Self::Float64(a) => a.is_null(i),
        }
    }

    pub fn i64(&self, i: usize) -> i64 {
        match self {
            Self::Int32(a) => a.value(i) as i64,
            Self::Int64(a) => a.value(i),
            Self::Float32(a) => a.value(i) as i64,
            Self::Float64(a) => a.value(i) as i64,
        }
    }

    pub fn f64(&self, i: usize) -> f64 {
        match self {
            Self::Int32(a) => a.value(i) as f64,
            Self::Int64(a) => a.value(i) as f64,
            Self::Float32(a) => a.value(i) as f64,
            Self::Float64(a) => a.value(i),
        }
    }
}

/// Physical state vector of an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ints,
    Floats,
    Counts,
    Set,
    /// Input position of the selected value; see [`ColSet::update`].
    Ordinals,
    M2,
    Flags,
    Samples,
    Distinct,
}

#[derive(Debug, Clone, Default)]
struct AccState {
    ints: Vec<i64>,
    floats: Vec<f64>,
    counts: Vec<i64>,
    set: Vec<bool>,
    ordinals: Vec<i64>,
    m2: Vec<f64>,
    flags: Vec<bool>,
    samples: Vec<Vec<f64>>,
    distinct: Vec<Vec<i64>>,
}

impl AccState {
    fn resize(&mut self, func: AggFunc, slots: &[Slot], n: usize) {
        let (int_init, float_init) = match func {
            AggFunc::Prod => (1, 1.0),
            _ => (0, 0.0),
        };
        for s in slots {
            match s {
                Slot::Ints => self.ints.resize(n, int_init),
                Slot::Floats => self.floats.resize(n, float_init),
                Slot::Counts => self.counts.resize(n, 0),
                Slot::Set => self.set.resize(n, false),
                Slot::Ordinals => self.ordinals.resize(n, 0),
                Slot::M2 => self.m2.resize(n, 0.0),
                Slot::Flags => self.flags.resize(n, false),
                Slot::Samples => self.samples.resize_with(n, Vec::new),
                Slot::Distinct => self.distinct.resize_with(n, Vec::new),
            }
        }
    }

    fn memory_size(&self) -> usize {
        let lists = self.samples.iter().map(Vec::capacity).sum::<usize>()
            + self.distinct.iter().map(Vec::capacity).sum::<usize>()
            + (self.samples.capacity() + self.distinct.capacity()) * 3;
        (self.ints.capacity()
            + self.floats.capacity()
            + self.counts.capacity()
            + self.ordinals.capacity()
            + self.m2.capacity()
            + lists)
            * 8
            + self.set.capacity()
            + self.flags.capacity()
    }

    /// Chan et al. merge of a (count, mean, m2) partial into group `g`.
    fn merge_moments(&mut self, g: usize, n: i64, mean: f64, m2: f64) {
        if n == 0 {
            return;
        }
        let na = self.counts[g];
        let total = na + n;
        let delta = mean - self.floats[g];
        self.floats[g] += delta * n as f64 / total as f64;
        self.m2[g] += m2 + delta * delta * (na as f64) * (n as f64) / total as f64;
        self.counts[g] = total;
    }
}

/// Accumulator for one function over one input column.
#[derive(Debug, Clone)]
pub struct ColSet {
    func: AggFunc,
    input: Option<usize>,
    kind: NumKind,
    slots: &'static [Slot],
    state: AccState,
    len: usize,
}

impl ColSet {
    /// Validate `func` over a column of `input_type` and build an empty set.
    pub fn try_new(
        func: AggFunc,
        input: Option<usize>,
        input_type: Option<&DataType>,
    ) -> Result<Self> {
        let kind = match (func.kind(), func, input_type) {
            (FuncKind::Cumulative, ..) => {
                return Err(TesseraError::InvalidConfig(format!(
                    "{func} is computed by the cumulative operator"
                )))
            }
            (FuncKind::Window, ..) => NumKind::Int,
            (_, AggFunc::Count | AggFunc::Size, _) => NumKind::Int,
            (_, AggFunc::BoolOr, Some(DataType::Boolean)) => NumKind::Int,
            (_, _, Some(dt)) => NumKind::of(dt).ok_or_else(|| {
                TesseraError::InvalidConfig(format!("{func} is not supported on {dt} columns"))
            })?,
            (_, _, None) => {
                return Err(TesseraError::InvalidConfig(format!(
                    "{func} requires an input column"
                )))
            }
        };
        if func.kind() == FuncKind::Reduce && func != AggFunc::Size && input.is_none() {
            return Err(TesseraError::InvalidConfig(format!(
                "{func} requires an input column"
            )));
        }
        let slots: &'static [Slot] = match (func, kind) {
            (AggFunc::Sum | AggFunc::Prod, NumKind::Int) => &[Slot::Ints],
            (AggFunc::Sum | AggFunc::Prod, NumKind::Float) => &[Slot::Floats],
            (AggFunc::Count | AggFunc::Size, _) => &[Slot::Counts],
            (AggFunc::Min | AggFunc::Max, NumKind::Int) => &[Slot::Ints, Slot::Set],
            (AggFunc::Min | AggFunc::Max, NumKind::Float) => &[Slot::Floats, Slot::Set],
            (AggFunc::First | AggFunc::Last, NumKind::Int) => {
                &[Slot::Ints, Slot::Set, Slot::Ordinals]
            }
            (AggFunc::First | AggFunc::Last, NumKind::Float) => {
                &[Slot::Floats, Slot::Set, Slot::Ordinals]
            }
            (AggFunc::Mean, _) => &[Slot::Floats, Slot::Counts],
            (AggFunc::Var | AggFunc::Std, _) => &[Slot::Counts, Slot::Floats, Slot::M2],
            (AggFunc::BoolOr, _) => &[Slot::Flags, Slot::Set],
            (AggFunc::NUnique, _) => &[Slot::Distinct],
            (AggFunc::Median, _) => &[Slot::Samples],
            _ => &[],
        };
        Ok(Self {
            func,
            input,
            kind,
            slots,
            state: AccState::default(),
            len: 0,
        })
    }

    pub fn func(&self) -> AggFunc {
        self.func
    }

    pub fn input(&self) -> Option<usize> {
        self.input
    }

    /// Number of groups holding state.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory_size(&self) -> usize {
        self.state.memory_size()
    }

    pub fn reset(&mut self) {
        self.state = AccState::default();
        self.len = 0;
    }

    pub fn intermediate_width(&self) -> usize {
        self.slots.len()
    }

    pub fn intermediate_fields(&self, prefix: &str) -> Vec<Field> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let dt = match s {
                    Slot::Ints | Slot::Counts | Slot::Ordinals => DataType::Int64,
                    Slot::Floats | Slot::M2 => DataType::Float64,
                    Slot::Set | Slot::Flags => DataType::Boolean,
                    Slot::Samples => list_of(DataType::Float64),
                    Slot::Distinct => list_of(DataType::Int64),
                };
                Field::new(format!("{prefix}.{}.{i}", self.func), dt, false)
            })
            .collect()
    }

    pub fn output_field(&self, name: &str) -> Field {
        let dt = match self.func {
            AggFunc::Count | AggFunc::Size | AggFunc::NUnique => DataType::Int64,
            AggFunc::Mean
            | AggFunc::Var
            | AggFunc::Std
            | AggFunc::Median
            | AggFunc::PercentRank
            | AggFunc::CumeDist => DataType::Float64,
            AggFunc::BoolOr => DataType::Boolean,
            AggFunc::RowNumber | AggFunc::Rank | AggFunc::DenseRank => DataType::Int64,
            _ => self.kind.output_type(),
        };
        Field::new(name, dt, true)
    }

    fn fold_input(&mut self, values: Option<&NumericView<'_>>, row: usize, g: usize, ordinal: i64) {
        let st = &mut self.state;
        if self.func == AggFunc::Size {
            st.counts[g] += 1;
            return;
        }
        let Some(v) = values else {
            return;
        };
        if v.is_null(row) {
            return;
        }
        match (self.func, self.kind) {
            (AggFunc::Count, _) => st.counts[g] += 1,
            (AggFunc::Sum, NumKind::Int) => st.ints[g] = st.ints[g].wrapping_add(v.i64(row)),
            (AggFunc::Sum, NumKind::Float) => st.floats[g] += v.f64(row),
            (AggFunc::Prod, NumKind::Int) => st.ints[g] = st.ints[g].wrapping_mul(v.i64(row)),
            (AggFunc::Prod, NumKind::Float) => st.floats[g] *= v.f64(row),
            (AggFunc::Mean, _) => {
                st.floats[g] += v.f64(row);
                st.counts[g] += 1;
            }
            (AggFunc::Var | AggFunc::Std, _) => st.merge_moments(g, 1, v.f64(row), 0.0),
            (AggFunc::Median, _) => {
                let x = v.f64(row);
                if !x.is_nan() {
                    st.samples[g].push(x);
                }
            }
            (AggFunc::NUnique, NumKind::Int) => st.distinct[g].push(v.i64(row)),
            (AggFunc::NUnique, NumKind::Float) => {
                if let Some(bits) = float_key(v.f64(row)) {
                    st.distinct[g].push(bits);
                }
            }
            (_, NumKind::Int) => {
                Self::apply_selection(self.func, st, g, Num::I(v.i64(row)), ordinal)
            }
            (_, NumKind::Float) => {
                Self::apply_selection(self.func, st, g, Num::F(v.f64(row)), ordinal)
            }
        }
    }

    /// Min/max compare values; first/last compare input ordinals so the
    /// result does not depend on the order partials are combined in.
    fn apply_selection(func: AggFunc, st: &mut AccState, g: usize, v: Num, ordinal: i64) {
        let set = st.set[g];
        let take = match func {
            AggFunc::First => !set || ordinal < st.ordinals[g],
            AggFunc::Last => !set || ordinal > st.ordinals[g],
            AggFunc::Min => !set || v.lt(&st.current(g, v)),
            AggFunc::Max => !set || st.current(g, v).lt(&v),
            _ => false,
        };
        if take {
            match v {
                Num::I(x) => st.ints[g] = x,
                Num::F(x) => st.floats[g] = x,
            }
            if matches!(func, AggFunc::First | AggFunc::Last) {
                st.ordinals[g] = ordinal;
            }
            st.set[g] = true;
        }
    }

    /// Per-batch grouped intermediate: one output row per group id in
    /// `0..n_groups`, where `row_to_group[r]` is the group of input row `r`.
    ///
    /// Row `r` of the batch has input ordinal `ordinal_base + r`; callers
    /// hand out bases that increase with input order across workers.
    pub fn update(
        &self,
        batch_columns: &[ArrayRef],
        row_to_group: &[u32],
        n_groups: usize,
        ordinal_base: i64,
    ) -> Result<Vec<ArrayRef>> {
        let mut fresh = Self {
            func: self.func,
            input: self.input,
            kind: self.kind,
            slots: self.slots,
            state: AccState::default(),
            len: 0,
        };
        fresh.state.resize(self.func, self.slots, n_groups);
        fresh.len = n_groups;
        let column = self.input.map(|i| &batch_columns[i]);
        match (self.func, column) {
            (AggFunc::Count, Some(c)) => {
                for (row, &g) in row_to_group.iter().enumerate() {
                    if c.is_valid(row) {
                        fresh.state.counts[g as usize] += 1;
                    }
                }
                return Ok(fresh.state_arrays());
            }
            (AggFunc::BoolOr, Some(c)) => {
                let truth = truth_values(c)?;
                for (row, &g) in row_to_group.iter().enumerate() {
                    if let Some(t) = truth[row] {
                        fresh.state.flags[g as usize] |= t;
                        fresh.state.set[g as usize] = true;
                    }
                }
                return Ok(fresh.state_arrays());
            }
            _ => {}
        }
        let view = match (self.func, column) {
            (AggFunc::Count | AggFunc::Size, _) | (_, None) => None,
            (_, Some(c)) => Some(NumericView::try_new(c)?),
        };
        for (row, &g) in row_to_group.iter().enumerate() {
            fresh.fold_input(view.as_ref(), row, g as usize, ordinal_base + row as i64);
        }
        if self.func == AggFunc::NUnique {
            for values in &mut fresh.state.distinct {
                values.sort_unstable();
                values.dedup();
            }
        }
        Ok(fresh.state_arrays())
    }

    /// Fold intermediate rows into the permanent state.
    ///
    /// Groups `init_start..n_groups` are new and get initialized first; rows
    /// whose `row_to_group` entry is negative are skipped.
    pub fn combine(
        &mut self,
        intermediates: &[ArrayRef],
        init_start: usize,
        n_groups: usize,
        row_to_group: &[i64],
    ) -> Result<()> {
        if init_start != self.len {
            return Err(TesseraError::Execution(format!(
                "{} combine initializes from {init_start} but holds {} groups",
                self.func, self.len
            )));
        }
        if n_groups > self.len {
            self.state.resize(self.func, self.slots, n_groups);
            self.len = n_groups;
        }
        if intermediates.len() != self.slots.len() {
            return Err(TesseraError::Execution(format!(
                "{} expects {} intermediate columns, got {}",
                self.func,
                self.slots.len(),
                intermediates.len()
            )));
        }
        let col = |slot: Slot| {
            self.slots
                .iter()
                .position(|s| *s == slot)
                .map(|i| &intermediates[i])
        };
        let ints = col(Slot::Ints).map(|a| a.as_primitive::<Int64Type>().clone());
        let floats = col(Slot::Floats).map(|a| a.as_primitive::<Float64Type>().clone());
        let counts = col(Slot::Counts).map(|a| a.as_primitive::<Int64Type>().clone());
        let set = col(Slot::Set).map(|a| a.as_boolean().clone());
        let ordinals = col(Slot::Ordinals).map(|a| a.as_primitive::<Int64Type>().clone());
        let m2 = col(Slot::M2).map(|a| a.as_primitive::<Float64Type>().clone());
        let flags = col(Slot::Flags).map(|a| a.as_boolean().clone());
        let samples = col(Slot::Samples).map(|a| a.as_list::<i32>().clone());
        let distinct = col(Slot::Distinct).map(|a| a.as_list::<i32>().clone());
        let st = &mut self.state;
        for (r, &g) in row_to_group.iter().enumerate() {
            if g < 0 {
                continue;
            }
            let g = g as usize;
            match self.func {
                AggFunc::Sum | AggFunc::Prod => {
                    let prod = self.func == AggFunc::Prod;
                    match (&ints, &floats) {
                        (Some(i), _) if prod => {
                            st.ints[g] = st.ints[g].wrapping_mul(i.value(r));
                        }
                        (Some(i), _) => st.ints[g] = st.ints[g].wrapping_add(i.value(r)),
                        (_, Some(f)) if prod => st.floats[g] *= f.value(r),
                        (_, Some(f)) => st.floats[g] += f.value(r),
                        _ => {}
                    }
                }
                AggFunc::Count | AggFunc::Size => {
                    if let Some(c) = &counts {
                        st.counts[g] += c.value(r);
                    }
                }
                AggFunc::Mean => {
                    if let (Some(f), Some(c)) = (&floats, &counts) {
                        st.floats[g] += f.value(r);
                        st.counts[g] += c.value(r);
                    }
                }
                AggFunc::Var | AggFunc::Std => {
                    if let (Some(c), Some(f), Some(m)) = (&counts, &floats, &m2) {
                        st.merge_moments(g, c.value(r), f.value(r), m.value(r));
                    }
                }
                AggFunc::BoolOr => {
                    if let (Some(f), Some(s)) = (&flags, &set) {
                        if s.value(r) {
                            st.flags[g] |= f.value(r);
                            st.set[g] = true;
                        }
                    }
                }
                AggFunc::Median => {
                    if let Some(l) = &samples {
                        let values = l.value(r);
                        let values = values.as_primitive::<Float64Type>();
                        st.samples[g].extend_from_slice(values.values());
                    }
                }
                AggFunc::NUnique => {
                    if let Some(l) = &distinct {
                        let values = l.value(r);
                        let merged = &mut st.distinct[g];
                        merged.extend_from_slice(values.as_primitive::<Int64Type>().values());
                        merged.sort_unstable();
                        merged.dedup();
                    }
                }
                AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last => {
                    let Some(s) = &set else { continue };
                    if !s.value(r) {
                        continue;
                    }
                    let v = match (&ints, &floats) {
                        (Some(i), _) => Num::I(i.value(r)),
                        (_, Some(f)) => Num::F(f.value(r)),
                        _ => continue,
                    };
                    let ordinal = ordinals.as_ref().map_or(0, |o| o.value(r));
                    Self::apply_selection(self.func, st, g, v, ordinal);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Export the state in intermediate layout.
    pub fn state_arrays(&self) -> Vec<ArrayRef> {
        let st = &self.state;
        self.slots
            .iter()
            .map(|s| -> ArrayRef {
                match s {
                    Slot::Ints => Arc::new(Int64Array::from(st.ints.clone())),
                    Slot::Floats => Arc::new(Float64Array::from(st.floats.clone())),
                    Slot::Counts => Arc::new(Int64Array::from(st.counts.clone())),
                    Slot::Set => Arc::new(BooleanArray::from(st.set.clone())),
                    Slot::Ordinals => Arc::new(Int64Array::from(st.ordinals.clone())),
                    Slot::M2 => Arc::new(Float64Array::from(st.m2.clone())),
                    Slot::Flags => Arc::new(BooleanArray::from(st.flags.clone())),
                    Slot::Samples => Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(
                        st.samples.iter().map(|v| Some(v.iter().copied().map(Some))),
                    )),
                    Slot::Distinct => Arc::new(ListArray::from_iter_primitive::<Int64Type, _, _>(
                        st.distinct.iter().map(|v| Some(v.iter().copied().map(Some))),
                    )),
                }
            })
            .collect()
    }

    /// Final values, one per group.
    pub fn eval(&self) -> Result<ArrayRef> {
        let st = &self.state;
        Ok(match (self.func, self.kind) {
            (AggFunc::Sum | AggFunc::Prod, NumKind::Int) => {
                Arc::new(Int64Array::from(st.ints.clone()))
            }
            (AggFunc::Sum | AggFunc::Prod, NumKind::Float) => {
                Arc::new(Float64Array::from(st.floats.clone()))
            }
            (AggFunc::Count | AggFunc::Size, _) => Arc::new(Int64Array::from(st.counts.clone())),
            (AggFunc::Mean, _) => Arc::new(
                st.floats
                    .iter()
                    .zip(&st.counts)
                    .map(|(s, c)| if *c == 0 { f64::NAN } else { s / *c as f64 })
                    .collect::<Float64Array>(),
            ),
            (AggFunc::Var | AggFunc::Std, _) => {
                let std = self.func == AggFunc::Std;
                Arc::new(
                    st.m2
                        .iter()
                        .zip(&st.counts)
                        .map(|(m2, n)| {
                            if *n < 2 {
                                return f64::NAN;
                            }
                            let var = m2 / (*n - 1) as f64;
                            if std { var.sqrt() } else { var }
                        })
                        .collect::<Float64Array>(),
                )
            }
            (AggFunc::BoolOr, _) => Arc::new(
                st.flags
                    .iter()
                    .zip(&st.set)
                    .map(|(f, set)| set.then_some(*f))
                    .collect::<BooleanArray>(),
            ),
            (AggFunc::NUnique, _) => Arc::new(
                st.distinct
                    .iter()
                    .map(|v| v.len() as i64)
                    .collect::<Int64Array>(),
            ),
            (AggFunc::Median, _) => Arc::new(
                st.samples
                    .iter()
                    .map(|v| median(v))
                    .collect::<Float64Array>(),
            ),
            (AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last, NumKind::Int) => {
                Arc::new(Int64Array::new(
                    st.ints.clone().into(),
                    Some(NullBuffer::from(st.set.clone())),
                ))
            }
            (AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last, NumKind::Float) => {
                Arc::new(
                    st.floats
                        .iter()
                        .zip(&st.set)
                        .map(|(v, set)| if *set { *v } else { f64::NAN })
                        .collect::<Float64Array>(),
                )
            }
            (func, _) => {
                return Err(TesseraError::Execution(format!(
                    "{func} has no grouped result"
                )))
            }
        })
    }

    /// Window result over a table sorted by partition then order keys.
    ///
    /// `partitions` are half-open row ranges; `peer_start[i]` is true when row
    /// `i` differs from row `i - 1` on the order keys.
    pub fn window_compute(
        &self,
        partitions: &[(usize, usize)],
        peer_start: &[bool],
    ) -> Result<ArrayRef> {
        let n_rows = peer_start.len();
        match self.func {
            AggFunc::RowNumber => {
                let mut out = vec![0i64; n_rows];
                for &(s, e) in partitions {
                    for (i, slot) in out[s..e].iter_mut().enumerate() {
                        *slot = i as i64 + 1;
                    }
                }
                Ok(Arc::new(Int64Array::from(out)))
            }
            AggFunc::Rank | AggFunc::DenseRank => {
                let dense = self.func == AggFunc::DenseRank;
                let mut out = vec![0i64; n_rows];
                for &(s, e) in partitions {
                    let mut rank = 1i64;
                    for i in s..e {
                        if i > s && peer_start[i] {
                            rank = if dense { rank + 1 } else { (i - s) as i64 + 1 };
                        }
                        out[i] = rank;
                    }
                }
                Ok(Arc::new(Int64Array::from(out)))
            }
            AggFunc::PercentRank => {
                let mut out = vec![0f64; n_rows];
                for &(s, e) in partitions {
                    let n = e - s;
                    if n <= 1 {
                        continue;
                    }
                    let mut rank = 1usize;
                    for i in s..e {
                        if i > s && peer_start[i] {
                            rank = i - s + 1;
                        }
                        out[i] = (rank - 1) as f64 / (n as f64 - 1.0);
                    }
                }
                Ok(Arc::new(Float64Array::from(out)))
            }
            AggFunc::CumeDist => {
                let mut out = vec![0f64; n_rows];
                for &(s, e) in partitions {
                    let n = (e - s) as f64;
                    let mut i = s;
                    while i < e {
                        let tie_start = i;
                        i += 1;
                        while i < e && !peer_start[i] {
                            i += 1;
                        }
                        let cume = (i - s) as f64 / n;
                        out[tie_start..i].fill(cume);
                    }
                }
                Ok(Arc::new(Float64Array::from(out)))
            }
            other => Err(TesseraError::Execution(format!(
                "{other} is not a window function"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn lt(&self, other: &Num) -> bool {
        match (self, other) {
            (Num::I(a), Num::I(b)) => a < b,
            (Num::F(a), Num::F(b)) => a < b,
            (Num::I(a), Num::F(b)) => (*a as f64) < *b,
            (Num::F(a), Num::I(b)) => *a < *b as f64,
        }
    }
}

impl AccState {
    fn current(&self, g: usize, like: Num) -> Num {
        match like {
            Num::I(_) => Num::I(self.ints[g]),
            Num::F(_) => Num::F(self.floats[g]),
        }
    }
}

fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", item, true)))
}

/// Distinct-value key of a float; NaN is skipped and both zeros are one key.
fn float_key(v: f64) -> Option<i64> {
    if v.is_nan() {
        return None;
    }
    let v = if v == 0.0 { 0.0 } else { v };
    Some(v.to_bits() as i64)
}

/// Truth value per row for `boolor_agg`: booleans as is, numbers when
/// non-zero. NULL and NaN rows have none.
fn truth_values(column: &ArrayRef) -> Result<Vec<Option<bool>>> {
    if let Some(b) = column.as_boolean_opt() {
        return Ok(b.iter().collect());
    }
    let view = NumericView::try_new(column)?;
    Ok((0..column.len())
        .map(|r| {
            if view.is_null(r) {
                return None;
            }
            let v = view.f64(r);
            (!v.is_nan()).then_some(v != 0.0)
        })
        .collect())
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
