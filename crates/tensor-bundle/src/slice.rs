//! Rectangular tensor slices and slice-key encoding
//!
//! A slice holds one [`Extent`] per dimension. An extent is either full
//! (covers the whole dimension whatever its size) or a `start, length`
//! range. The text form joins extents with `:`, writing `-` for a full
//! extent, so `0,50:-` is the first fifty rows of a matrix.
//!
//! Stored partitions of a tensor live under a derived key built by
//! [`slice_key`] from the tensor's key and the partition's slice.

use std::fmt;
use std::str::FromStr;

use crate::{BundleError, Result};

/// Separator between a tensor key and the slice text in a slice key
pub const SLICE_KEY_SEPARATOR: char = '\0';

/// One dimension of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// First index covered
    pub start: u64,
    /// Number of indices covered; `None` covers the whole dimension
    pub length: Option<u64>,
}

impl Extent {
    /// Extent covering the whole dimension
    pub const FULL: Self = Self {
        start: 0,
        length: None,
    };

    /// Extent covering `[start, start + length)`
    pub const fn range(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    /// Whether this extent is the literal full extent
    pub const fn is_full(&self) -> bool {
        self.length.is_none()
    }

    /// `(start, length)` against a dimension of size `dim`
    pub fn resolve(&self, dim: u64) -> Option<(u64, u64)> {
        match self.length {
            None => Some((0, dim)),
            Some(length) => {
                let end = self.start.checked_add(length)?;
                (end <= dim).then_some((self.start, length))
            }
        }
    }
}

/// Row range of a hash-table slice over an unbounded first dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashRange {
    /// First hash row written by the producing worker
    pub begin: u64,
    /// Number of hash rows
    pub length: u64,
}

/// Rectangular sub-range of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSlice {
    extents: Vec<Extent>,
    hash_range: Option<HashRange>,
}

impl TensorSlice {
    /// Slice of the given rank with every extent full
    pub fn full(rank: usize) -> Self {
        Self {
            extents: vec![Extent::FULL; rank],
            hash_range: None,
        }
    }

    /// Slice from explicit extents
    pub const fn new(extents: Vec<Extent>) -> Self {
        Self {
            extents,
            hash_range: None,
        }
    }

    /// Slice from `(start, length)` pairs
    pub fn from_ranges(ranges: &[(u64, u64)]) -> Self {
        Self::new(
            ranges
                .iter()
                .map(|&(start, length)| Extent::range(start, length))
                .collect(),
        )
    }

    /// Attach a hash-table row range
    #[must_use]
    pub const fn with_hash_range(mut self, range: HashRange) -> Self {
        self.hash_range = Some(range);
        self
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    /// Per-dimension extents
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Mutable access to one extent
    pub fn extent_mut(&mut self, dim: usize) -> Option<&mut Extent> {
        self.extents.get_mut(dim)
    }

    /// Hash-table row range, if any
    pub const fn hash_range(&self) -> Option<HashRange> {
        self.hash_range
    }

    /// Whether every extent is the literal full extent
    pub fn is_full(&self) -> bool {
        self.extents.iter().all(Extent::is_full)
    }

    /// Whether this slice covers all of `shape`
    pub fn is_full_for(&self, shape: &[u64]) -> bool {
        if self.is_full() && self.rank() == shape.len() {
            return true;
        }
        self.resolve(shape)
            .is_ok_and(|ranges| ranges.iter().zip(shape).all(|(r, &dim)| *r == (0, dim)))
    }

    /// Whether both slices cover the same region, ignoring hash metadata
    pub fn same_region(&self, other: &Self) -> bool {
        self.extents == other.extents
    }

    /// Resolve every extent against `shape`
    pub fn resolve(&self, shape: &[u64]) -> Result<Vec<(u64, u64)>> {
        if self.rank() != shape.len() {
            return Err(BundleError::InvalidShape(format!(
                "slice {self} has rank {}, tensor shape {shape:?} has rank {}",
                self.rank(),
                shape.len()
            )));
        }
        self.extents
            .iter()
            .zip(shape)
            .map(|(extent, &dim)| {
                extent.resolve(dim).ok_or_else(|| {
                    BundleError::InvalidShape(format!(
                        "slice {self} is out of bounds for shape {shape:?}"
                    ))
                })
            })
            .collect()
    }

    /// Shape of the region this slice selects from `shape`
    pub fn slice_shape(&self, shape: &[u64]) -> Result<Vec<u64>> {
        Ok(self
            .resolve(shape)?
            .into_iter()
            .map(|(_, length)| length)
            .collect())
    }

    /// Overlap of two slices in global coordinates, `None` if disjoint
    pub fn intersect(&self, other: &Self, shape: &[u64]) -> Result<Option<Vec<(u64, u64)>>> {
        let a = self.resolve(shape)?;
        let b = other.resolve(shape)?;
        let mut out = Vec::with_capacity(a.len());
        for ((a_start, a_len), (b_start, b_len)) in a.into_iter().zip(b) {
            let start = a_start.max(b_start);
            let end = (a_start + a_len).min(b_start + b_len);
            if end <= start {
                return Ok(None);
            }
            out.push((start, end - start));
        }
        Ok(Some(out))
    }
}

impl fmt::Display for TensorSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, extent) in self.extents.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            match extent.length {
                None => f.write_str("-")?,
                Some(length) => write!(f, "{},{length}", extent.start)?,
            }
        }
        Ok(())
    }
}

impl FromStr for TensorSlice {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::new(Vec::new()));
        }
        let invalid = || BundleError::InvalidArgument(format!("malformed slice spec '{s}'"));
        let extents = s
            .split(':')
            .map(|part| {
                if part == "-" {
                    return Ok(Extent::FULL);
                }
                let (start, length) = part.split_once(',').ok_or_else(invalid)?;
                Ok(Extent::range(
                    start.parse().map_err(|_| invalid())?,
                    length.parse().map_err(|_| invalid())?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(extents))
    }
}

/// Catalog key under which the partition `slice` of `full_key` is stored
pub fn slice_key(full_key: &str, slice: &TensorSlice) -> String {
    format!("{full_key}{SLICE_KEY_SEPARATOR}{slice}")
}

/// Split a slice key into its tensor key and slice
pub fn parse_slice_key(key: &str) -> Option<(&str, TensorSlice)> {
    let (full_key, spec) = key.split_once(SLICE_KEY_SEPARATOR)?;
    let slice = spec.parse().ok()?;
    Some((full_key, slice))
}

/// Whether `key` names a stored partition rather than a logical tensor
pub fn is_slice_key(key: &str) -> bool {
    parse_slice_key(key).is_some()
}
