//! Growable columnar build buffers.
//!
//! [`ColumnBuffer`] is a closed set of column encodings; every operation is a
//! match over the variants. [`ArrayView`] is the matching typed borrow of an
//! Arrow array so per-row appends and key comparisons do not re-downcast.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, DictionaryArray, Float32Array, Float64Array,
    Int32Array, Int64Array, PrimitiveArray, StringArray,
};
use arrow::buffer::{Buffer, NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::compute::cast;
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, Float32Type, Float64Type, Int32Type, Int64Type, SchemaRef,
};
use arrow::record_batch::RecordBatch;
use tessera_common::{Result, TesseraError};
use tessera_exchange::{DictionaryUnifier, is_dictionary_type, remap_codes};

/// Typed borrow of one Arrow column.
#[derive(Debug, Clone, Copy)]
pub enum ArrayView<'a> {
    Boolean(&'a BooleanArray),
    Int32(&'a Int32Array),
    Int64(&'a Int64Array),
    Float32(&'a Float32Array),
    Float64(&'a Float64Array),
    Utf8(&'a StringArray),
    Dictionary {
        keys: &'a Int32Array,
        values: &'a ArrayRef,
    },
}

impl<'a> ArrayView<'a> {
    pub fn try_new(array: &'a ArrayRef) -> Result<Self> {
        Ok(match array.data_type() {
            DataType::Boolean => Self::Boolean(array.as_boolean()),
            DataType::Int32 => Self::Int32(array.as_primitive::<Int32Type>()),
            DataType::Int64 => Self::Int64(array.as_primitive::<Int64Type>()),
            DataType::Float32 => Self::Float32(array.as_primitive::<Float32Type>()),
            DataType::Float64 => Self::Float64(array.as_primitive::<Float64Type>()),
            DataType::Utf8 => Self::Utf8(array.as_string::<i32>()),
            dt if is_dictionary_type(dt) => {
                let dict: &DictionaryArray<Int32Type> = array.as_dictionary();
                Self::Dictionary {
                    keys: dict.keys(),
                    values: dict.values(),
                }
            }
            other => {
                return Err(TesseraError::Unsupported(format!(
                    "column encoding for {other}"
                )))
            }
        })
    }

    pub fn views(columns: &'a [ArrayRef]) -> Result<Vec<Self>> {
        columns.iter().map(Self::try_new).collect()
    }

    pub fn is_null(&self, row: usize) -> bool {
        match self {
            Self::Boolean(a) => a.is_null(row),
            Self::Int32(a) => a.is_null(row),
            Self::Int64(a) => a.is_null(row),
            Self::Float32(a) => a.is_null(row),
            Self::Float64(a) => a.is_null(row),
            Self::Utf8(a) => a.is_null(row),
            Self::Dictionary { keys, .. } => keys.is_null(row),
        }
    }

    /// Row equality between two views of the same encoding.
    pub fn rows_equal(&self, a: usize, other: &ArrayView<'_>, b: usize, null_equal: bool) -> bool {
        match (self.is_null(a), other.is_null(b)) {
            (true, true) => return null_equal,
            (true, false) | (false, true) => return false,
            _ => {}
        }
        match (self, other) {
            (Self::Boolean(x), ArrayView::Boolean(y)) => x.value(a) == y.value(b),
            (Self::Int32(x), ArrayView::Int32(y)) => x.value(a) == y.value(b),
            (Self::Int64(x), ArrayView::Int64(y)) => x.value(a) == y.value(b),
            (Self::Float32(x), ArrayView::Float32(y)) => {
                float_eq(x.value(a) as f64, y.value(b) as f64)
            }
            (Self::Float64(x), ArrayView::Float64(y)) => float_eq(x.value(a), y.value(b)),
            (Self::Utf8(x), ArrayView::Utf8(y)) => x.value(a) == y.value(b),
            (Self::Dictionary { keys: x, .. }, ArrayView::Dictionary { keys: y, .. }) => {
                x.value(a) == y.value(b)
            }
            _ => false,
        }
    }
}

/// Types usable as grouping or join keys.
pub fn supported_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
    ) || is_dictionary_type(data_type)
}

/// Key columns with dictionaries decoded, so equal strings compare equal
/// whichever dictionary they came from.
pub fn plain_keys(keys: &[ArrayRef]) -> Result<Vec<ArrayRef>> {
    keys.iter()
        .map(|k| {
            if is_dictionary_type(k.data_type()) {
                Ok(cast(k.as_ref(), &DataType::Utf8)?)
            } else {
                Ok(Arc::clone(k))
            }
        })
        .collect()
}

#[inline]
fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

#[derive(Debug, Clone, Default)]
pub struct PrimitiveColumn<T> {
    values: Vec<T>,
    validity: Vec<bool>,
}

impl<T: Copy + Default> PrimitiveColumn<T> {
    fn push(&mut self, v: Option<T>) {
        self.values.push(v.unwrap_or_default());
        self.validity.push(v.is_some());
    }

    fn reserve(&mut self, additional: usize) {
        self.values.reserve(additional);
        self.validity.reserve(additional);
    }

    fn clear(&mut self) {
        self.values.clear();
        self.validity.clear();
    }

    fn is_valid(&self, i: usize) -> bool {
        self.validity[i]
    }

    fn memory_size(&self) -> usize {
        self.values.capacity() * std::mem::size_of::<T>() + self.validity.capacity()
    }
}

fn null_buffer(validity: &[bool]) -> Option<NullBuffer> {
    if validity.iter().all(|v| *v) {
        None
    } else {
        Some(NullBuffer::from(validity.to_vec()))
    }
}

fn primitive_array<P: ArrowPrimitiveType>(col: &PrimitiveColumn<P::Native>) -> ArrayRef
where
    P::Native: Copy + Default,
{
    Arc::new(PrimitiveArray::<P>::new(
        ScalarBuffer::from(col.values.clone()),
        null_buffer(&col.validity),
    ))
}

/// One growable column.
#[derive(Debug, Clone)]
pub enum ColumnBuffer {
    Boolean(PrimitiveColumn<bool>),
    Int32(PrimitiveColumn<i32>),
    Int64(PrimitiveColumn<i64>),
    Float32(PrimitiveColumn<f32>),
    Float64(PrimitiveColumn<f64>),
    Utf8 {
        offsets: Vec<i32>,
        data: Vec<u8>,
        validity: Vec<bool>,
    },
    Dictionary {
        codes: PrimitiveColumn<i32>,
        values: ArrayRef,
    },
}

macro_rules! each_primitive {
    ($self:expr, $col:ident => $body:expr, $other:pat => $fallback:expr) => {
        match $self {
            ColumnBuffer::Boolean($col) => $body,
            ColumnBuffer::Int32($col) => $body,
            ColumnBuffer::Int64($col) => $body,
            ColumnBuffer::Float32($col) => $body,
            ColumnBuffer::Float64($col) => $body,
            $other => $fallback,
        }
    };
}

impl ColumnBuffer {
    pub fn try_new(data_type: &DataType) -> Result<Self> {
        Ok(match data_type {
            DataType::Boolean => Self::Boolean(PrimitiveColumn::default()),
            DataType::Int32 => Self::Int32(PrimitiveColumn::default()),
            DataType::Int64 => Self::Int64(PrimitiveColumn::default()),
            DataType::Float32 => Self::Float32(PrimitiveColumn::default()),
            DataType::Float64 => Self::Float64(PrimitiveColumn::default()),
            DataType::Utf8 => Self::Utf8 {
                offsets: vec![0],
                data: Vec::new(),
                validity: Vec::new(),
            },
            dt if is_dictionary_type(dt) => Self::Dictionary {
                codes: PrimitiveColumn::default(),
                values: Arc::new(StringArray::from(Vec::<&str>::new())),
            },
            other => {
                return Err(TesseraError::Unsupported(format!(
                    "column encoding for {other}"
                )))
            }
        })
    }

    pub fn len(&self) -> usize {
        each_primitive!(self, c => c.values.len(), other => match other {
            Self::Utf8 { validity, .. } => validity.len(),
            Self::Dictionary { codes, .. } => codes.values.len(),
            _ => 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        each_primitive!(self, c => c.values.capacity(), other => match other {
            Self::Utf8 { validity, .. } => validity.capacity(),
            Self::Dictionary { codes, .. } => codes.values.capacity(),
            _ => 0,
        })
    }

    pub fn reserve(&mut self, additional: usize) {
        each_primitive!(self, c => c.reserve(additional), other => match other {
            Self::Utf8 { offsets, validity, .. } => {
                offsets.reserve(additional);
                validity.reserve(additional);
            }
            Self::Dictionary { codes, .. } => codes.reserve(additional),
            _ => {}
        })
    }

    pub fn is_valid(&self, i: usize) -> bool {
        each_primitive!(self, c => c.is_valid(i), other => match other {
            Self::Utf8 { validity, .. } => validity[i],
            Self::Dictionary { codes, .. } => codes.is_valid(i),
            _ => false,
        })
    }

    pub fn memory_size(&self) -> usize {
        each_primitive!(self, c => c.memory_size(), other => match other {
            Self::Utf8 { offsets, data, validity } => {
                offsets.capacity() * 4 + data.capacity() + validity.capacity()
            }
            Self::Dictionary { codes, .. } => codes.memory_size(),
            _ => 0,
        })
    }

    pub fn reset(&mut self) {
        each_primitive!(self, c => c.clear(), other => match other {
            Self::Utf8 { offsets, data, validity } => {
                offsets.clear();
                offsets.push(0);
                data.clear();
                validity.clear();
            }
            Self::Dictionary { codes, .. } => codes.clear(),
            _ => {}
        })
    }

    /// Copy row `row` of `view`; the view must have this buffer's encoding.
    pub fn append_row(&mut self, view: &ArrayView<'_>, row: usize) -> Result<()> {
        let valid = !view.is_null(row);
        match (self, view) {
            (Self::Boolean(c), ArrayView::Boolean(a)) => c.push(valid.then(|| a.value(row))),
            (Self::Int32(c), ArrayView::Int32(a)) => c.push(valid.then(|| a.value(row))),
            (Self::Int64(c), ArrayView::Int64(a)) => c.push(valid.then(|| a.value(row))),
            (Self::Float32(c), ArrayView::Float32(a)) => c.push(valid.then(|| a.value(row))),
            (Self::Float64(c), ArrayView::Float64(a)) => c.push(valid.then(|| a.value(row))),
            (Self::Utf8 { offsets, data, validity }, ArrayView::Utf8(a)) => {
                if valid {
                    data.extend_from_slice(a.value(row).as_bytes());
                }
                let end = i32::try_from(data.len()).map_err(|_| {
                    TesseraError::ResourceExhausted("utf8 build buffer exceeds 2 GiB".to_string())
                })?;
                offsets.push(end);
                validity.push(valid);
            }
            (Self::Dictionary { codes, values }, ArrayView::Dictionary { keys, values: v }) => {
                if v.len() > values.len() {
                    *values = Arc::clone(v);
                }
                codes.push(valid.then(|| keys.value(row)));
            }
            (buf, view) => {
                return Err(TesseraError::Execution(format!(
                    "cannot append {view:?} to {} buffer",
                    buf.kind()
                )))
            }
        }
        Ok(())
    }

    /// Append every row of `array`, or only rows where `selection` is true.
    pub fn append_array(
        &mut self,
        array: &ArrayRef,
        selection: Option<&BooleanArray>,
    ) -> Result<()> {
        let view = ArrayView::try_new(array)?;
        match selection {
            None => {
                self.reserve(array.len());
                for row in 0..array.len() {
                    self.append_row(&view, row)?;
                }
            }
            Some(mask) => {
                self.reserve(mask.true_count());
                for row in 0..array.len() {
                    if mask.is_valid(row) && mask.value(row) {
                        self.append_row(&view, row)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Compare stored row `i` with row `row` of `view`.
    pub fn equals_row(&self, i: usize, view: &ArrayView<'_>, row: usize, null_equal: bool) -> bool {
        let mine_null = !self.is_valid(i);
        match (mine_null, view.is_null(row)) {
            (true, true) => return null_equal,
            (true, false) | (false, true) => return false,
            _ => {}
        }
        match (self, view) {
            (Self::Boolean(c), ArrayView::Boolean(a)) => c.values[i] == a.value(row),
            (Self::Int32(c), ArrayView::Int32(a)) => c.values[i] == a.value(row),
            (Self::Int64(c), ArrayView::Int64(a)) => c.values[i] == a.value(row),
            (Self::Float32(c), ArrayView::Float32(a)) => {
                float_eq(c.values[i] as f64, a.value(row) as f64)
            }
            (Self::Float64(c), ArrayView::Float64(a)) => float_eq(c.values[i], a.value(row)),
            (Self::Utf8 { offsets, data, .. }, ArrayView::Utf8(a)) => {
                let s = &data[offsets[i] as usize..offsets[i + 1] as usize];
                s == a.value(row).as_bytes()
            }
            (Self::Dictionary { codes, .. }, ArrayView::Dictionary { keys, .. }) => {
                codes.values[i] == keys.value(row)
            }
            _ => false,
        }
    }

    pub fn to_array(&self) -> Result<ArrayRef> {
        Ok(match self {
            Self::Boolean(c) => Arc::new(BooleanArray::new(
                c.values.iter().copied().collect(),
                null_buffer(&c.validity),
            )),
            Self::Int32(c) => primitive_array::<Int32Type>(c),
            Self::Int64(c) => primitive_array::<Int64Type>(c),
            Self::Float32(c) => primitive_array::<Float32Type>(c),
            Self::Float64(c) => primitive_array::<Float64Type>(c),
            Self::Utf8 { offsets, data, validity } => Arc::new(StringArray::try_new(
                OffsetBuffer::new(ScalarBuffer::from(offsets.clone())),
                Buffer::from_vec(data.clone()),
                null_buffer(validity),
            )?),
            Self::Dictionary { codes, values } => {
                let keys = Int32Array::new(
                    ScalarBuffer::from(codes.values.clone()),
                    null_buffer(&codes.validity),
                );
                Arc::new(DictionaryArray::<Int32Type>::try_new(keys, Arc::clone(values))?)
            }
        })
    }

    /// Rewrite stored dictionary codes after the dictionary went global.
    pub fn remap_dictionary(&mut self, remap: &[i32], new_values: ArrayRef) {
        if let Self::Dictionary { codes, values } = self {
            remap_codes(&mut codes.values, remap);
            *values = new_values;
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Utf8 { .. } => "utf8",
            Self::Dictionary { .. } => "dictionary",
        }
    }
}

/// Column-oriented growable table.
#[derive(Debug, Clone)]
pub struct TableBuildBuffer {
    schema: SchemaRef,
    columns: Vec<ColumnBuffer>,
    len: usize,
}

impl TableBuildBuffer {
    pub fn try_new(schema: SchemaRef) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| ColumnBuffer::try_new(f.data_type()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema,
            columns,
            len: 0,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, i: usize) -> &ColumnBuffer {
        &self.columns[i]
    }

    pub fn reserve(&mut self, additional: usize) {
        for c in &mut self.columns {
            c.reserve(additional);
        }
    }

    pub fn memory_size(&self) -> usize {
        self.columns.iter().map(ColumnBuffer::memory_size).sum()
    }

    pub fn append_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        self.check_width(batch.num_columns())?;
        for (c, a) in self.columns.iter_mut().zip(batch.columns()) {
            c.append_array(a, None)?;
        }
        self.len += batch.num_rows();
        Ok(())
    }

    pub fn append_filtered(&mut self, batch: &RecordBatch, selection: &BooleanArray) -> Result<()> {
        self.check_width(batch.num_columns())?;
        for (c, a) in self.columns.iter_mut().zip(batch.columns()) {
            c.append_array(a, Some(selection))?;
        }
        self.len += selection.true_count();
        Ok(())
    }

    pub fn append_row(&mut self, views: &[ArrayView<'_>], row: usize) -> Result<()> {
        self.check_width(views.len())?;
        for (c, v) in self.columns.iter_mut().zip(views) {
            c.append_row(v, row)?;
        }
        self.len += 1;
        Ok(())
    }

    /// Whether stored row `i` equals row `row` of `views` on every column.
    pub fn row_equals(
        &self,
        i: usize,
        views: &[ArrayView<'_>],
        row: usize,
        null_equal: bool,
    ) -> bool {
        self.columns
            .iter()
            .zip(views)
            .all(|(c, v)| c.equals_row(i, v, row, null_equal))
    }

    pub fn to_batch(&self) -> Result<RecordBatch> {
        let arrays = self
            .columns
            .iter()
            .map(ColumnBuffer::to_array)
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.schema),
            arrays,
            &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(self.len)),
        )?)
    }

    pub fn reset(&mut self) {
        for c in &mut self.columns {
            c.reset();
        }
        self.len = 0;
    }

    /// Apply per-column dictionary remaps (indexed like this buffer's columns).
    pub fn remap_dictionaries(
        &mut self,
        remaps: &[Option<Vec<i32>>],
        unifier: &mut DictionaryUnifier,
    ) {
        for (i, (col, remap)) in self.columns.iter_mut().zip(remaps).enumerate() {
            if let (Some(remap), Some(builder)) = (remap, unifier.builder_mut(i)) {
                col.remap_dictionary(remap, builder.values_array());
            }
        }
    }

    fn check_width(&self, n: usize) -> Result<()> {
        if n != self.columns.len() {
            return Err(TesseraError::Execution(format!(
                "build buffer has {} columns, input has {n}",
                self.columns.len()
            )));
        }
        Ok(())
    }
}
