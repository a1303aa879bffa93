//! Sparse array schemas.
//!
//! A schema is a static input to every other component: it names dimensions
//! and attributes, fixes their datatypes, and declares the tile/cell order
//! that defines the global order of cells.

mod datatype;
mod order;

use std::{collections::HashSet, sync::Arc};

use arrow_schema::{Field as ArrowField, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::datatype::{CellValue, Datatype, decode_column, encode_column};
pub use self::order::Subarray;
pub(crate) use self::order::GlobalOrder;
use crate::{fragment::FORMAT_VERSION, tile::FilterType};

/// Reserved field name of the per-cell write timestamps.
pub const TIMESTAMPS_FIELD: &str = "__timestamps";

/// Errors raised while building or decoding a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No dimensions were declared.
    #[error("schema must declare at least one dimension")]
    NoDimensions,
    /// Two fields share a name, or a field uses a reserved name.
    #[error("duplicate or reserved field name `{0}`")]
    DuplicateName(String),
    /// Dimensions must be integers.
    #[error("dimension `{name}` has unsupported datatype {datatype:?}")]
    UnsupportedDimensionType {
        /// Dimension name.
        name: String,
        /// Declared datatype.
        datatype: Datatype,
    },
    /// Empty domain or zero tile extent.
    #[error("dimension `{0}` has an invalid domain or tile extent")]
    InvalidDomain(String),
    /// Tile capacity must be positive.
    #[error("tile capacity must be positive")]
    ZeroCapacity,
    /// An array schema already exists at the root.
    #[error("array already exists at `{0}`")]
    AlreadyExists(String),
    /// JSON decode failure.
    #[error("malformed schema document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Order of tiles within the domain, or of cells within a tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// First dimension most significant.
    #[default]
    RowMajor,
    /// Last dimension most significant.
    ColMajor,
}

/// One integer dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name.
    pub name: String,
    /// Integer datatype.
    pub datatype: Datatype,
    /// Inclusive domain.
    pub domain: [i64; 2],
    /// Space tile extent.
    pub tile_extent: u64,
}

impl Dimension {
    /// Declare a dimension.
    pub fn new(name: impl Into<String>, datatype: Datatype, domain: [i64; 2], tile_extent: u64) -> Self {
        Self {
            name: name.into(),
            datatype,
            domain,
            tile_extent,
        }
    }
}

/// One fixed-size attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Datatype.
    pub datatype: Datatype,
    /// Tile filters applied to this attribute.
    #[serde(default)]
    pub filters: Vec<FilterType>,
}

impl Attribute {
    /// Declare an attribute without filters.
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            filters: Vec::new(),
        }
    }

    /// Attach a filter pipeline.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<FilterType>) -> Self {
        self.filters = filters;
        self
    }
}

/// A stored column of a fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    /// Dimension by index.
    Dimension(usize),
    /// Attribute by index.
    Attribute(usize),
    /// The per-cell timestamps column.
    Timestamps,
}

impl FieldId {
    /// File holding this field's tiles inside a fragment directory.
    pub fn file_name(self) -> String {
        match self {
            Self::Dimension(idx) => format!("d{idx}.tdb"),
            Self::Attribute(idx) => format!("a{idx}.tdb"),
            Self::Timestamps => "t.tdb".to_string(),
        }
    }

    /// Stable key used in fragment metadata offset tables.
    pub(crate) fn encode(self) -> u32 {
        match self {
            Self::Dimension(idx) => idx as u32,
            Self::Attribute(idx) => (1 << 16) | idx as u32,
            Self::Timestamps => 2 << 16,
        }
    }

    pub(crate) fn decode(raw: u32) -> Option<Self> {
        let idx = (raw & 0xffff) as usize;
        match raw >> 16 {
            0 => Some(Self::Dimension(idx)),
            1 => Some(Self::Attribute(idx)),
            2 if idx == 0 => Some(Self::Timestamps),
            _ => None,
        }
    }
}

/// Sparse array schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    /// Format version the schema was written with.
    pub version: u32,
    /// Dimensions, most significant first for row-major order.
    pub dimensions: Vec<Dimension>,
    /// Attributes.
    pub attributes: Vec<Attribute>,
    /// Cell order within a space tile.
    pub cell_order: Layout,
    /// Order of space tiles.
    pub tile_order: Layout,
    /// Cells per data tile.
    pub capacity: u64,
    /// Whether cells may share coordinates.
    pub allows_dups: bool,
    /// Filters applied to coordinate tiles.
    #[serde(default)]
    pub coords_filters: Vec<FilterType>,
    /// Filters applied to timestamp tiles.
    #[serde(default)]
    pub timestamps_filters: Vec<FilterType>,
}

impl ArraySchema {
    /// Start building a schema.
    pub fn builder() -> ArraySchemaBuilder {
        ArraySchemaBuilder::default()
    }

    /// Check naming, datatype and domain constraints.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.dimensions.is_empty() {
            return Err(SchemaError::NoDimensions);
        }
        if self.capacity == 0 {
            return Err(SchemaError::ZeroCapacity);
        }
        let mut names = HashSet::new();
        for name in self
            .dimensions
            .iter()
            .map(|d| &d.name)
            .chain(self.attributes.iter().map(|a| &a.name))
        {
            if name == TIMESTAMPS_FIELD || !names.insert(name.as_str()) {
                return Err(SchemaError::DuplicateName(name.clone()));
            }
        }
        for dim in &self.dimensions {
            if !dim.datatype.is_integer() {
                return Err(SchemaError::UnsupportedDimensionType {
                    name: dim.name.clone(),
                    datatype: dim.datatype,
                });
            }
            if dim.domain[0] > dim.domain[1] || dim.tile_extent == 0 {
                return Err(SchemaError::InvalidDomain(dim.name.clone()));
            }
        }
        Ok(())
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// Dimension and attribute fields, in storage order.
    pub fn fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        (0..self.dimensions.len())
            .map(FieldId::Dimension)
            .chain((0..self.attributes.len()).map(FieldId::Attribute))
    }

    /// Resolve a field by name, including [`TIMESTAMPS_FIELD`].
    pub fn field(&self, name: &str) -> Option<FieldId> {
        if name == TIMESTAMPS_FIELD {
            return Some(FieldId::Timestamps);
        }
        if let Some(idx) = self.dimensions.iter().position(|d| d.name == name) {
            return Some(FieldId::Dimension(idx));
        }
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .map(FieldId::Attribute)
    }

    /// Field name.
    pub fn field_name(&self, field: FieldId) -> &str {
        match field {
            FieldId::Dimension(idx) => &self.dimensions[idx].name,
            FieldId::Attribute(idx) => &self.attributes[idx].name,
            FieldId::Timestamps => TIMESTAMPS_FIELD,
        }
    }

    /// Field datatype.
    pub fn datatype(&self, field: FieldId) -> Datatype {
        match field {
            FieldId::Dimension(idx) => self.dimensions[idx].datatype,
            FieldId::Attribute(idx) => self.attributes[idx].datatype,
            FieldId::Timestamps => Datatype::UInt64,
        }
    }

    /// Bytes per cell of a field.
    pub fn cell_size(&self, field: FieldId) -> usize {
        self.datatype(field).size()
    }

    /// Filter pipeline declared for a field.
    pub fn filters(&self, field: FieldId) -> &[FilterType] {
        match field {
            FieldId::Dimension(_) => &self.coords_filters,
            FieldId::Attribute(idx) => &self.attributes[idx].filters,
            FieldId::Timestamps => &self.timestamps_filters,
        }
    }

    /// Arrow schema of dimensions then attributes, with an optional trailing
    /// timestamps column.
    pub fn arrow_schema(&self, with_timestamps: bool) -> SchemaRef {
        let mut fields: Vec<ArrowField> = self
            .fields()
            .map(|field| ArrowField::new(self.field_name(field), self.datatype(field).arrow(), false))
            .collect();
        if with_timestamps {
            fields.push(ArrowField::new(
                TIMESTAMPS_FIELD,
                Datatype::UInt64.arrow(),
                false,
            ));
        }
        Arc::new(Schema::new(fields))
    }

    /// Serialize to the JSON document stored under `__schema`.
    pub fn to_json(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode and validate a stored schema document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_slice(bytes)?;
        schema.validate()?;
        Ok(schema)
    }

    pub(crate) fn global_order(&self) -> GlobalOrder {
        GlobalOrder::new(self)
    }
}

/// Builder for [`ArraySchema`].
#[derive(Clone, Debug)]
pub struct ArraySchemaBuilder {
    schema: ArraySchema,
}

impl Default for ArraySchemaBuilder {
    fn default() -> Self {
        Self {
            schema: ArraySchema {
                version: FORMAT_VERSION,
                dimensions: Vec::new(),
                attributes: Vec::new(),
                cell_order: Layout::RowMajor,
                tile_order: Layout::RowMajor,
                capacity: 10_000,
                allows_dups: false,
                coords_filters: Vec::new(),
                timestamps_filters: Vec::new(),
            },
        }
    }
}

impl ArraySchemaBuilder {
    /// Append a dimension.
    #[must_use]
    pub fn dimension(mut self, dimension: Dimension) -> Self {
        self.schema.dimensions.push(dimension);
        self
    }

    /// Append an attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.schema.attributes.push(attribute);
        self
    }

    /// Cells per data tile.
    #[must_use]
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.schema.capacity = capacity;
        self
    }

    /// Allow duplicate coordinates.
    #[must_use]
    pub fn allows_dups(mut self, allows_dups: bool) -> Self {
        self.schema.allows_dups = allows_dups;
        self
    }

    /// Cell and tile order.
    #[must_use]
    pub fn order(mut self, tile_order: Layout, cell_order: Layout) -> Self {
        self.schema.tile_order = tile_order;
        self.schema.cell_order = cell_order;
        self
    }

    /// Filters for coordinate tiles.
    #[must_use]
    pub fn coords_filters(mut self, filters: Vec<FilterType>) -> Self {
        self.schema.coords_filters = filters;
        self
    }

    /// Filters for timestamp tiles.
    #[must_use]
    pub fn timestamps_filters(mut self, filters: Vec<FilterType>) -> Self {
        self.schema.timestamps_filters = filters;
        self
    }

    /// Validate and return the schema.
    pub fn build(self) -> Result<ArraySchema, SchemaError> {
        self.schema.validate()?;
        Ok(self.schema)
    }
}
