//! Columnar in-memory cells exchanged between Arrow batches, readers and
//! the global-order writer.

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, PrimitiveArray, RecordBatch,
    cast::AsArray,
    types::{
        Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, UInt8Type, UInt16Type,
        UInt32Type, UInt64Type,
    },
};

use super::FragmentError;
use crate::schema::{ArraySchema, CellValue, Datatype, FieldId, GlobalOrder, TIMESTAMPS_FIELD, decode_column};

/// Packed fixed-width columns for every dimension and attribute, plus optional
/// per-cell timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct CellColumns {
    datatypes: Vec<Datatype>,
    dim_num: usize,
    columns: Vec<Vec<u8>>,
    timestamps: Option<Vec<u64>>,
    len: usize,
}

fn column_bytes(datatype: Datatype, array: &ArrayRef, name: &str) -> Result<Vec<u8>, FragmentError> {
    if array.null_count() > 0 {
        return Err(FragmentError::SchemaMismatch(format!("column `{name}` contains nulls")));
    }
    macro_rules! pack {
        ($arrow:ty) => {{
            let values = array.as_primitive_opt::<$arrow>().ok_or_else(|| {
                FragmentError::SchemaMismatch(format!(
                    "column `{name}` has type {}, expected {:?}",
                    array.data_type(),
                    datatype
                ))
            })?;
            let mut out = Vec::with_capacity(values.len() * datatype.size());
            for value in values.values().iter() {
                value.write_le(&mut out);
            }
            out
        }};
    }
    Ok(match datatype {
        Datatype::Int8 => pack!(Int8Type),
        Datatype::Int16 => pack!(Int16Type),
        Datatype::Int32 => pack!(Int32Type),
        Datatype::Int64 => pack!(Int64Type),
        Datatype::UInt8 => pack!(UInt8Type),
        Datatype::UInt16 => pack!(UInt16Type),
        Datatype::UInt32 => pack!(UInt32Type),
        Datatype::UInt64 => pack!(UInt64Type),
        Datatype::Float32 => pack!(Float32Type),
        Datatype::Float64 => pack!(Float64Type),
    })
}

pub(crate) fn column_array(datatype: Datatype, bytes: &[u8]) -> ArrayRef {
    macro_rules! unpack {
        ($arrow:ty, $native:ty) => {
            Arc::new(PrimitiveArray::<$arrow>::from_iter_values(decode_column::<$native>(bytes)))
                as ArrayRef
        };
    }
    match datatype {
        Datatype::Int8 => unpack!(Int8Type, i8),
        Datatype::Int16 => unpack!(Int16Type, i16),
        Datatype::Int32 => unpack!(Int32Type, i32),
        Datatype::Int64 => unpack!(Int64Type, i64),
        Datatype::UInt8 => unpack!(UInt8Type, u8),
        Datatype::UInt16 => unpack!(UInt16Type, u16),
        Datatype::UInt32 => unpack!(UInt32Type, u32),
        Datatype::UInt64 => unpack!(UInt64Type, u64),
        Datatype::Float32 => unpack!(Float32Type, f32),
        Datatype::Float64 => unpack!(Float64Type, f64),
    }
}

impl CellColumns {
    /// Empty columns shaped after `schema`.
    pub fn new(schema: &ArraySchema, with_timestamps: bool) -> Self {
        Self {
            datatypes: schema.fields().map(|f| schema.datatype(f)).collect(),
            dim_num: schema.dim_num(),
            columns: vec![Vec::new(); schema.dimensions.len() + schema.attributes.len()],
            timestamps: with_timestamps.then(Vec::new),
            len: 0,
        }
    }

    /// Build from packed columns in schema field order.
    pub fn from_columns(
        schema: &ArraySchema,
        columns: Vec<Vec<u8>>,
        timestamps: Option<Vec<u64>>,
    ) -> Result<Self, FragmentError> {
        let mut cells = Self::new(schema, timestamps.is_some());
        if columns.len() != cells.columns.len() {
            return Err(FragmentError::SchemaMismatch(format!(
                "expected {} columns, got {}",
                cells.columns.len(),
                columns.len()
            )));
        }
        let len = match columns.first() {
            Some(first) => first.len() / cells.datatypes[0].size(),
            None => 0,
        };
        for (idx, column) in columns.iter().enumerate() {
            if column.len() != len * cells.datatypes[idx].size() {
                return Err(FragmentError::SchemaMismatch(format!(
                    "column {idx} holds {} bytes, expected {}",
                    column.len(),
                    len * cells.datatypes[idx].size()
                )));
            }
        }
        if let Some(ts) = &timestamps {
            if ts.len() != len {
                return Err(FragmentError::SchemaMismatch(format!(
                    "{} timestamps for {len} cells",
                    ts.len()
                )));
            }
        }
        cells.columns = columns;
        cells.timestamps = timestamps;
        cells.len = len;
        Ok(cells)
    }

    /// Convert an Arrow batch whose columns are named after the schema's
    /// dimensions and attributes. An optional [`TIMESTAMPS_FIELD`] column is
    /// carried as per-cell timestamps.
    pub fn from_record_batch(schema: &ArraySchema, batch: &RecordBatch) -> Result<Self, FragmentError> {
        let mut columns = Vec::with_capacity(schema.dimensions.len() + schema.attributes.len());
        for field in schema.fields() {
            let name = schema.field_name(field);
            let array = batch
                .column_by_name(name)
                .ok_or_else(|| FragmentError::SchemaMismatch(format!("missing column `{name}`")))?;
            columns.push(column_bytes(schema.datatype(field), array, name)?);
        }
        let timestamps = match batch.column_by_name(TIMESTAMPS_FIELD) {
            Some(array) => Some(decode_column::<u64>(&column_bytes(
                Datatype::UInt64,
                array,
                TIMESTAMPS_FIELD,
            )?)),
            None => None,
        };
        Self::from_columns(schema, columns, timestamps)
    }

    /// Render as an Arrow batch, timestamps last when present.
    pub fn to_record_batch(&self, schema: &ArraySchema) -> Result<RecordBatch, FragmentError> {
        let arrow = schema.arrow_schema(self.timestamps.is_some());
        let mut arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .zip(&self.datatypes)
            .map(|(bytes, datatype)| column_array(*datatype, bytes))
            .collect();
        if let Some(ts) = &self.timestamps {
            arrays.push(Arc::new(PrimitiveArray::<UInt64Type>::from_iter_values(ts.iter().copied())));
        }
        RecordBatch::try_new(arrow, arrays).map_err(|err| FragmentError::SchemaMismatch(err.to_string()))
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when no cells are held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Per-cell timestamps, when carried.
    pub fn timestamps(&self) -> Option<&[u64]> {
        self.timestamps.as_deref()
    }

    /// Packed bytes of a dimension or attribute column.
    pub fn column(&self, field: FieldId) -> Option<&[u8]> {
        let idx = self.index(field)?;
        self.columns.get(idx).map(Vec::as_slice)
    }

    /// Values of one column decoded as `T`.
    pub fn values<T: CellValue>(&self, field: FieldId) -> Option<Vec<T>> {
        let idx = self.index(field)?;
        (self.datatypes[idx] == T::DATATYPE).then(|| decode_column::<T>(&self.columns[idx]))
    }

    fn index(&self, field: FieldId) -> Option<usize> {
        match field {
            FieldId::Dimension(idx) if idx < self.dim_num => Some(idx),
            FieldId::Attribute(idx) if self.dim_num + idx < self.columns.len() => Some(self.dim_num + idx),
            _ => None,
        }
    }

    /// Coordinates of cell `row`, widened for ordering.
    pub(crate) fn coords(&self, row: usize) -> Vec<i128> {
        (0..self.dim_num)
            .map(|dim| {
                let size = self.datatypes[dim].size();
                self.datatypes[dim]
                    .decode_int(&self.columns[dim][row * size..(row + 1) * size])
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Append cell `row` of `other`. `ts` fills the timestamp when `other`
    /// carries none.
    pub(crate) fn push_from(&mut self, other: &CellColumns, row: usize, ts: u64) {
        for (idx, column) in self.columns.iter_mut().enumerate() {
            let size = self.datatypes[idx].size();
            column.extend_from_slice(&other.columns[idx][row * size..(row + 1) * size]);
        }
        if let Some(own) = &mut self.timestamps {
            own.push(other.timestamps.as_ref().map_or(ts, |t| t[row]));
        }
        self.len += 1;
    }

    /// Remove and return the first `n` cells.
    pub(crate) fn split_front(&mut self, n: usize) -> CellColumns {
        let n = n.min(self.len);
        let mut front = CellColumns {
            datatypes: self.datatypes.clone(),
            dim_num: self.dim_num,
            columns: Vec::with_capacity(self.columns.len()),
            timestamps: None,
            len: n,
        };
        for (idx, column) in self.columns.iter_mut().enumerate() {
            let rest = column.split_off(n * self.datatypes[idx].size());
            front.columns.push(std::mem::replace(column, rest));
        }
        if let Some(ts) = &mut self.timestamps {
            let rest = ts.split_off(n);
            front.timestamps = Some(std::mem::replace(ts, rest));
        }
        self.len -= n;
        front
    }

    /// Stable-sort cells into global order. Returns the sort keys in the new
    /// order.
    pub(crate) fn sort_global(&mut self, order: &GlobalOrder) -> Vec<Vec<i128>> {
        let mut keyed: Vec<(Vec<i128>, usize)> = (0..self.len)
            .map(|row| (order.key(&self.coords(row)), row))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut sorted = CellColumns {
            datatypes: self.datatypes.clone(),
            dim_num: self.dim_num,
            columns: vec![Vec::new(); self.columns.len()],
            timestamps: self.timestamps.as_ref().map(|_| Vec::with_capacity(self.len)),
            len: 0,
        };
        for (_, row) in &keyed {
            sorted.push_from(self, *row, 0);
        }
        *self = sorted;
        keyed.into_iter().map(|(key, _)| key).collect()
    }
}
