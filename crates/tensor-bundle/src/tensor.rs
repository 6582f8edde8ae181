//! In-memory tensor values
//!
//! Fixed-width values are held as raw host-order bytes. String and variant
//! values are held as one byte vector per element.

use crate::dtype::{DataType, ElementKind};
use crate::{BundleError, Result};

/// Storage of a tensor's elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorData {
    /// Raw bytes of fixed-width elements in host byte order
    Bytes(Vec<u8>),
    /// One byte string per element
    Strings(Vec<Vec<u8>>),
    /// One serialized opaque value per element
    Variants(Vec<Vec<u8>>),
}

/// A typed, shaped value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<u64>,
    data: TensorData,
}

/// Number of elements described by `shape`; a rank-0 shape holds one
pub fn num_elements(shape: &[u64]) -> Result<u64> {
    shape.iter().try_fold(1u64, |acc, &dim| {
        acc.checked_mul(dim)
            .ok_or_else(|| BundleError::InvalidShape(format!("{shape:?} overflows")))
    })
}

/// Element types with a fixed byte representation
pub trait Element: Copy {
    /// Stored element type
    const DTYPE: DataType;

    /// Append the host-order bytes of `self`
    fn put(self, out: &mut Vec<u8>);

    /// Decode from exactly `size_of::<Self>()` host-order bytes
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $d:path) => {
        impl Element for $t {
            const DTYPE: DataType = $d;

            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn get(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }
        }
    };
}

impl_element!(f32, DataType::Float);
impl_element!(f64, DataType::Double);
impl_element!(i8, DataType::Int8);
impl_element!(i16, DataType::Int16);
impl_element!(i32, DataType::Int32);
impl_element!(i64, DataType::Int64);
impl_element!(u8, DataType::UInt8);
impl_element!(u16, DataType::UInt16);
impl_element!(u32, DataType::UInt32);
impl_element!(u64, DataType::UInt64);

impl Element for bool {
    const DTYPE: DataType = DataType::Bool;

    fn put(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn get(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Tensor {
    /// Zero-initialized tensor (empty strings for string/variant types)
    pub fn zeros(dtype: DataType, shape: &[u64]) -> Result<Self> {
        let count = usize::try_from(num_elements(shape)?)
            .map_err(|_| BundleError::InvalidShape(format!("{shape:?} too large")))?;
        let data = match dtype.kind() {
            ElementKind::Fixed { width, .. } => {
                let len = count.checked_mul(width).ok_or_else(|| {
                    BundleError::InvalidShape(format!("{shape:?} too large for {dtype}"))
                })?;
                TensorData::Bytes(vec![0u8; len])
            }
            ElementKind::String => TensorData::Strings(vec![Vec::new(); count]),
            ElementKind::Variant => TensorData::Variants(vec![Vec::new(); count]),
        };
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            data,
        })
    }

    /// Wrap host-order bytes of a fixed-width type
    pub fn from_bytes(dtype: DataType, shape: &[u64], bytes: Vec<u8>) -> Result<Self> {
        let width = dtype.size().ok_or_else(|| {
            BundleError::InvalidArgument(format!("{dtype} values cannot be built from raw bytes"))
        })?;
        let expected = num_elements(shape)?.saturating_mul(width as u64);
        if bytes.len() as u64 != expected {
            return Err(BundleError::InvalidArgument(format!(
                "{} bytes do not match shape {shape:?} of {dtype} ({expected} bytes)",
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            data: TensorData::Bytes(bytes),
        })
    }

    /// Build from typed elements
    pub fn from_values<T: Element>(shape: &[u64], values: &[T]) -> Result<Self> {
        let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
        for &value in values {
            value.put(&mut bytes);
        }
        Self::from_bytes(T::DTYPE, shape, bytes)
    }

    /// Build a string tensor
    pub fn from_strings(shape: &[u64], strings: Vec<Vec<u8>>) -> Result<Self> {
        Self::check_count(shape, strings.len())?;
        Ok(Self {
            dtype: DataType::String,
            shape: shape.to_vec(),
            data: TensorData::Strings(strings),
        })
    }

    /// Build a variant tensor from already-serialized elements
    pub fn from_variants(shape: &[u64], values: Vec<Vec<u8>>) -> Result<Self> {
        Self::check_count(shape, values.len())?;
        Ok(Self {
            dtype: DataType::Variant,
            shape: shape.to_vec(),
            data: TensorData::Variants(values),
        })
    }

    fn check_count(shape: &[u64], count: usize) -> Result<()> {
        let expected = num_elements(shape)?;
        if count as u64 == expected {
            Ok(())
        } else {
            Err(BundleError::InvalidArgument(format!(
                "{count} elements do not match shape {shape:?} ({expected} elements)"
            )))
        }
    }

    /// Element type
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Dimension sizes
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Element storage
    pub const fn data(&self) -> &TensorData {
        &self.data
    }

    /// Number of elements
    pub fn num_elements(&self) -> u64 {
        match &self.data {
            TensorData::Bytes(bytes) => {
                bytes.len() as u64 / self.dtype.size().map_or(1, |w| w.max(1) as u64)
            }
            TensorData::Strings(items) | TensorData::Variants(items) => items.len() as u64,
        }
    }

    /// Raw bytes of a fixed-width tensor
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Mutable raw bytes of a fixed-width tensor
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.data {
            TensorData::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Elements of a string or variant tensor
    pub fn items(&self) -> Option<&[Vec<u8>]> {
        match &self.data {
            TensorData::Strings(items) | TensorData::Variants(items) => Some(items),
            TensorData::Bytes(_) => None,
        }
    }

    /// Consume into raw bytes of a fixed-width tensor
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.data {
            TensorData::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Decode elements as `T`
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(BundleError::InvalidArgument(format!(
                "tensor holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let bytes = self.as_bytes().ok_or_else(|| {
            BundleError::InvalidArgument(format!("{} tensor has no raw bytes", self.dtype))
        })?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(T::get)
            .collect())
    }

    /// Bytes per row of the first dimension for fixed-width tensors
    pub fn row_bytes(&self) -> Result<usize> {
        row_bytes(self.dtype, &self.shape)
    }
}

/// Bytes per row of the first dimension of a fixed-width `shape`
pub fn row_bytes(dtype: DataType, shape: &[u64]) -> Result<usize> {
    let width = dtype
        .size()
        .ok_or_else(|| BundleError::Unimplemented(format!("row access on {dtype} values")))?;
    let (_, rest) = shape
        .split_first()
        .ok_or_else(|| BundleError::InvalidShape("row access on a scalar".to_string()))?;
    let per_row = num_elements(rest)?
        .checked_mul(width as u64)
        .ok_or_else(|| BundleError::InvalidShape(format!("{shape:?} overflows")))?;
    usize::try_from(per_row).map_err(|_| BundleError::InvalidShape(format!("{shape:?} too large")))
}
