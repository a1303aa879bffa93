//! Fixed-width cell datatypes and their little-endian encodings.

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// Physical type of a dimension or attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    /// `i8`
    Int8,
    /// `i16`
    Int16,
    /// `i32`
    Int32,
    /// `i64`
    Int64,
    /// `u8`
    UInt8,
    /// `u16`
    UInt16,
    /// `u32`
    UInt32,
    /// `u64`
    UInt64,
    /// `f32`
    Float32,
    /// `f64`
    Float64,
}

impl Datatype {
    /// Bytes per cell.
    pub const fn size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Integer types may back dimensions.
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    /// Matching Arrow type.
    pub fn arrow(self) -> DataType {
        match self {
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::UInt32 => DataType::UInt32,
            Self::UInt64 => DataType::UInt64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
        }
    }

    /// Decode one integer cell as `i128`. `None` for floats or short input.
    pub(crate) fn decode_int(self, bytes: &[u8]) -> Option<i128> {
        let value = match self {
            Self::Int8 => i8::from_le_slice(bytes.get(..1)?) as i128,
            Self::Int16 => i16::from_le_slice(bytes.get(..2)?) as i128,
            Self::Int32 => i32::from_le_slice(bytes.get(..4)?) as i128,
            Self::Int64 => i64::from_le_slice(bytes.get(..8)?) as i128,
            Self::UInt8 => u8::from_le_slice(bytes.get(..1)?) as i128,
            Self::UInt16 => u16::from_le_slice(bytes.get(..2)?) as i128,
            Self::UInt32 => u32::from_le_slice(bytes.get(..4)?) as i128,
            Self::UInt64 => u64::from_le_slice(bytes.get(..8)?) as i128,
            Self::Float32 | Self::Float64 => return None,
        };
        Some(value)
    }
}

/// Rust scalar that maps onto a [`Datatype`].
pub trait CellValue: Copy + Send + Sync + 'static {
    /// Datatype this scalar is stored as.
    const DATATYPE: Datatype;

    /// Decode from exactly `DATATYPE.size()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding to `out`.
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_cell_value {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl CellValue for $ty {
                const DATATYPE: Datatype = Datatype::$dt;

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_cell_value!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
);

/// Decode a packed column of `T`.
pub fn decode_column<T: CellValue>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DATATYPE.size())
        .map(T::from_le_slice)
        .collect()
}

/// Encode values into a packed column.
pub fn encode_column<T: CellValue>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::DATATYPE.size());
    for value in values {
        value.write_le(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_int_widens_every_integer_type() {
        assert_eq!(Datatype::Int8.decode_int(&[0xff]), Some(-1));
        assert_eq!(Datatype::UInt8.decode_int(&[0xff]), Some(255));
        assert_eq!(
            Datatype::UInt64.decode_int(&u64::MAX.to_le_bytes()),
            Some(u64::MAX as i128)
        );
        assert_eq!(Datatype::Float32.decode_int(&[0, 0, 0, 0]), None);
        assert_eq!(Datatype::Int32.decode_int(&[1, 2]), None);
    }

    #[test]
    fn columns_round_trip() {
        let values = [1.5f64, -2.25, 0.0];
        assert_eq!(decode_column::<f64>(&encode_column(&values)), values);
    }
}
