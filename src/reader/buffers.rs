//! Caller-owned output buffers.

use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{Field, Schema};

use super::ReadError;
use crate::{
    fragment::{CellColumns, FragmentError, column_array},
    schema::{ArraySchema, CellValue, FieldId, decode_column},
};

/// A fixed-capacity byte buffer for one field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl FieldBuffer {
    /// Empty buffer that accepts up to `capacity` bytes per submit.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes written by the last submit.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn has_room(&self, bytes: usize) -> bool {
        self.data.len() + bytes <= self.capacity
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

/// Named output buffers, one per requested field. A buffer named
/// [`TIMESTAMPS_FIELD`](crate::schema::TIMESTAMPS_FIELD) receives per-cell
/// write timestamps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryBuffers {
    fields: Vec<(String, FieldBuffer)>,
    cell_num: usize,
}

impl QueryBuffers {
    /// No buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the buffer of one field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.set_buffer(name, capacity);
        self
    }

    /// Add or replace the buffer of one field.
    pub fn set_buffer(&mut self, name: impl Into<String>, capacity: usize) {
        let name = name.into();
        let buffer = FieldBuffer::new(capacity);
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = buffer,
            None => self.fields.push((name, buffer)),
        }
    }

    /// Buffers sized to hold `cells` cells of every dimension and attribute,
    /// plus timestamps when asked.
    pub fn for_schema(schema: &ArraySchema, cells: usize, timestamps: bool) -> Self {
        let mut buffers = Self::new();
        for field in schema.fields() {
            buffers.set_buffer(schema.field_name(field), cells * schema.cell_size(field));
        }
        if timestamps {
            buffers.set_buffer(
                schema.field_name(FieldId::Timestamps),
                cells * schema.cell_size(FieldId::Timestamps),
            );
        }
        buffers
    }

    /// Field names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Buffer of one field.
    pub fn buffer(&self, name: &str) -> Option<&FieldBuffer> {
        self.fields.iter().find(|(n, _)| n.as_str() == name).map(|(_, b)| b)
    }

    /// Raw bytes returned for one field by the last submit.
    pub fn data(&self, name: &str) -> Option<&[u8]> {
        self.buffer(name).map(FieldBuffer::data)
    }

    /// Values returned for one field by the last submit.
    pub fn column<T: CellValue>(&self, name: &str) -> Option<Vec<T>> {
        self.data(name).map(decode_column::<T>)
    }

    /// Cells returned by the last submit.
    pub fn cell_num(&self) -> usize {
        self.cell_num
    }

    /// Drop returned data, keeping capacities.
    pub fn clear(&mut self) {
        for (_, buffer) in &mut self.fields {
            buffer.data.clear();
        }
        self.cell_num = 0;
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = (&str, &mut FieldBuffer)> {
        self.fields.iter_mut().map(|(name, buffer)| (name.as_str(), buffer))
    }

    pub(crate) fn add_cell(&mut self) {
        self.cell_num += 1;
    }

    /// Arrow view of the last submit's cells, columns in buffer order.
    pub fn to_record_batch(&self, schema: &ArraySchema) -> Result<RecordBatch, ReadError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.fields.len());
        for (name, buffer) in &self.fields {
            let field = schema
                .field(name)
                .ok_or_else(|| ReadError::UnknownField(name.clone()))?;
            let datatype = schema.datatype(field);
            fields.push(Field::new(name.as_str(), datatype.arrow(), false));
            arrays.push(column_array(datatype, &buffer.data));
        }
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(|err| ReadError::Fragment(FragmentError::SchemaMismatch(err.to_string())))
    }

    /// Move the last submit's cells out as columns in schema field order.
    /// Every dimension and attribute must have a buffer.
    pub(crate) fn take_cells(&mut self, schema: &ArraySchema) -> Result<CellColumns, ReadError> {
        let mut columns = Vec::with_capacity(schema.dimensions.len() + schema.attributes.len());
        for field in schema.fields() {
            let name = schema.field_name(field);
            let (_, buffer) = self
                .fields
                .iter_mut()
                .find(|(n, _)| n.as_str() == name)
                .ok_or_else(|| ReadError::UnknownField(name.to_string()))?;
            columns.push(std::mem::take(&mut buffer.data));
        }
        let ts_name = schema.field_name(FieldId::Timestamps);
        let timestamps = self
            .fields
            .iter_mut()
            .find(|(n, _)| n.as_str() == ts_name)
            .map(|(_, buffer)| decode_column::<u64>(&std::mem::take(&mut buffer.data)));
        self.cell_num = 0;
        Ok(CellColumns::from_columns(schema, columns, timestamps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Datatype, Dimension, TIMESTAMPS_FIELD};

    #[test]
    fn buffers_replace_and_convert() {
        let schema = ArraySchema::builder()
            .dimension(Dimension::new("d", Datatype::Int64, [0, 9], 5))
            .attribute(Attribute::new("a", Datatype::Float64))
            .build()
            .expect("schema");
        let mut buffers = QueryBuffers::new().with_field("a", 8).with_field("a", 16);
        assert_eq!(buffers.buffer("a").map(FieldBuffer::capacity), Some(16));

        for (_, buffer) in buffers.fields_mut() {
            assert!(buffer.has_room(16));
            buffer.push(&1.5f64.to_le_bytes());
        }
        buffers.add_cell();
        assert_eq!(buffers.column::<f64>("a"), Some(vec![1.5]));
        let batch = buffers.to_record_batch(&schema).expect("batch");
        assert_eq!(batch.num_rows(), 1);

        let full = QueryBuffers::for_schema(&schema, 4, true);
        assert_eq!(full.names().collect::<Vec<_>>(), vec!["d", "a", TIMESTAMPS_FIELD]);
        assert_eq!(full.buffer(TIMESTAMPS_FIELD).map(FieldBuffer::capacity), Some(32));

        buffers.clear();
        assert_eq!(buffers.cell_num(), 0);
        assert_eq!(buffers.data("a"), Some(&[][..]));
    }
}
