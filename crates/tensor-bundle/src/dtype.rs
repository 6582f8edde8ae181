//! Element types stored in a bundle
//!
//! Every [`DataType`] belongs to exactly one [`ElementKind`], which decides
//! how a value of that type is laid out on disk:
//!
//! - **Fixed**: raw element bytes, checksummed as one run
//! - **String**: varint lengths, a masked checksum of the lengths, then bytes
//! - **Variant**: self-describing `[varint len][bytes][masked crc]` per element

use std::fmt;

use crate::{BundleError, Result};

/// Element type of a stored tensor.
///
/// Discriminants are the wire codes stored in catalog entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    /// 32-bit IEEE float
    Float = 1,
    /// 64-bit IEEE float
    Double = 2,
    /// Signed 32-bit integer
    Int32 = 3,
    /// Unsigned 8-bit integer
    UInt8 = 4,
    /// Signed 16-bit integer
    Int16 = 5,
    /// Signed 8-bit integer
    Int8 = 6,
    /// Variable-length byte string
    String = 7,
    /// Pair of 32-bit floats
    Complex64 = 8,
    /// Signed 64-bit integer
    Int64 = 9,
    /// One byte boolean
    Bool = 10,
    /// Quantized signed 8-bit integer
    QInt8 = 11,
    /// Quantized unsigned 8-bit integer
    QUInt8 = 12,
    /// Quantized signed 32-bit integer
    QInt32 = 13,
    /// Brain floating point (16 bits)
    BFloat16 = 14,
    /// Unsigned 16-bit integer
    UInt16 = 17,
    /// Pair of 64-bit floats
    Complex128 = 18,
    /// IEEE half precision float
    Half = 19,
    /// Opaque serialized value
    Variant = 21,
    /// Unsigned 32-bit integer
    UInt32 = 22,
    /// Unsigned 64-bit integer
    UInt64 = 23,
}

/// On-disk encoding family of a [`DataType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Fixed-width elements that can be copied as raw bytes
    Fixed {
        /// Bytes per element
        width: usize,
        /// Bytes per independently byte-swapped component
        swap_unit: usize,
    },
    /// Length-prefixed byte strings
    String,
    /// Opaque values with interleaved per-element checksums
    Variant,
}

impl DataType {
    /// Parse a wire code
    pub fn from_code(code: u32) -> Result<Self> {
        let dtype = match code {
            1 => Self::Float,
            2 => Self::Double,
            3 => Self::Int32,
            4 => Self::UInt8,
            5 => Self::Int16,
            6 => Self::Int8,
            7 => Self::String,
            8 => Self::Complex64,
            9 => Self::Int64,
            10 => Self::Bool,
            11 => Self::QInt8,
            12 => Self::QUInt8,
            13 => Self::QInt32,
            14 => Self::BFloat16,
            17 => Self::UInt16,
            18 => Self::Complex128,
            19 => Self::Half,
            21 => Self::Variant,
            22 => Self::UInt32,
            23 => Self::UInt64,
            other => {
                return Err(BundleError::CorruptBundle(format!(
                    "unknown element type code {other}"
                )));
            }
        };
        Ok(dtype)
    }

    /// Wire code of this type
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Encoding family of this type
    pub const fn kind(self) -> ElementKind {
        match self {
            Self::String => ElementKind::String,
            Self::Variant => ElementKind::Variant,
            Self::Complex64 => ElementKind::Fixed {
                width: 8,
                swap_unit: 4,
            },
            Self::Complex128 => ElementKind::Fixed {
                width: 16,
                swap_unit: 8,
            },
            other => {
                let width = match other {
                    Self::UInt8 | Self::Int8 | Self::Bool | Self::QInt8 | Self::QUInt8 => 1,
                    Self::Int16 | Self::UInt16 | Self::BFloat16 | Self::Half => 2,
                    Self::Float | Self::Int32 | Self::UInt32 | Self::QInt32 => 4,
                    _ => 8,
                };
                ElementKind::Fixed {
                    width,
                    swap_unit: width,
                }
            }
        }
    }

    /// Bytes per element for fixed-width types
    pub const fn size(self) -> Option<usize> {
        match self.kind() {
            ElementKind::Fixed { width, .. } => Some(width),
            ElementKind::String | ElementKind::Variant => None,
        }
    }

    /// Whether values of this type can be read and written as raw bytes
    pub const fn is_fixed_width(self) -> bool {
        matches!(self.kind(), ElementKind::Fixed { .. })
    }

    /// Lower-case name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Double => "double",
            Self::Int32 => "int32",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::String => "string",
            Self::Complex64 => "complex64",
            Self::Int64 => "int64",
            Self::Bool => "bool",
            Self::QInt8 => "qint8",
            Self::QUInt8 => "quint8",
            Self::QInt32 => "qint32",
            Self::BFloat16 => "bfloat16",
            Self::UInt16 => "uint16",
            Self::Complex128 => "complex128",
            Self::Half => "half",
            Self::Variant => "variant",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
        }
    }

    /// All supported types
    pub const ALL: [Self; 20] = [
        Self::Float,
        Self::Double,
        Self::Int32,
        Self::UInt8,
        Self::Int16,
        Self::Int8,
        Self::String,
        Self::Complex64,
        Self::Int64,
        Self::Bool,
        Self::QInt8,
        Self::QUInt8,
        Self::QInt32,
        Self::BFloat16,
        Self::UInt16,
        Self::Complex128,
        Self::Half,
        Self::Variant,
        Self::UInt32,
        Self::UInt64,
    ];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reverse the byte order of every `unit`-sized group in `data`.
///
/// Units of one byte are left untouched.
pub fn swap_bytes_in_place(data: &mut [u8], unit: usize) {
    if unit <= 1 {
        return;
    }
    for chunk in data.chunks_exact_mut(unit) {
        chunk.reverse();
    }
}
