//! Registered partitions of one tensor and slice reconstruction
//!
//! A [`SliceSet`] holds the non-overlapping slices stored for a tensor and
//! answers which of them cover a requested slice. Because registered slices
//! never overlap, a request is covered exactly when the volumes of its
//! intersections with the stored slices add up to its own volume.

use crate::dtype::DataType;
use crate::slice::TensorSlice;
use crate::{BundleError, Result};

fn volume(ranges: &[(u64, u64)]) -> u64 {
    ranges
        .iter()
        .fold(1u64, |acc, &(_, length)| acc.saturating_mul(length))
}

/// Stored slices of one tensor
#[derive(Debug, Clone)]
pub struct SliceSet {
    dtype: DataType,
    shape: Vec<u64>,
    slices: Vec<TensorSlice>,
}

impl SliceSet {
    /// Empty set for a tensor of `dtype` and `shape`
    pub fn new(dtype: DataType, shape: &[u64]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            slices: Vec::new(),
        }
    }

    /// Element type of the tensor
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Shape of the full tensor
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Registered slices in registration order
    pub fn slices(&self) -> &[TensorSlice] {
        &self.slices
    }

    /// Register a stored slice; it must lie within the shape and overlap no
    /// slice already registered
    pub fn register(&mut self, slice: TensorSlice) -> Result<()> {
        slice.resolve(&self.shape)?;
        for existing in &self.slices {
            if existing.intersect(&slice, &self.shape)?.is_some() {
                return Err(BundleError::InvalidArgument(format!(
                    "slice {slice} overlaps registered slice {existing}"
                )));
            }
        }
        self.slices.push(slice);
        Ok(())
    }

    /// Registered slices intersecting `request`, which together cover it.
    ///
    /// Fails with [`BundleError::InsufficientSlices`] when any part of the
    /// request is not stored.
    pub fn query(&self, request: &TensorSlice) -> Result<Vec<TensorSlice>> {
        let wanted = volume(&request.resolve(&self.shape)?);
        let mut covered = 0u64;
        let mut covering = Vec::new();
        for stored in &self.slices {
            if let Some(overlap) = stored.intersect(request, &self.shape)? {
                covered = covered.saturating_add(volume(&overlap));
                covering.push(stored.clone());
            }
        }
        if covered == wanted {
            Ok(covering)
        } else {
            Err(BundleError::InsufficientSlices(format!(
                "stored slices cover {covered} of {wanted} elements of {request}"
            )))
        }
    }
}

/// Copy the elements shared by `src_slice` and `dst_slice` of a tensor of
/// `full_shape`.
///
/// `src` and `dst` hold the row-major elements of their slices, `width`
/// bytes each. Runs along the innermost dimension are copied whole.
pub fn copy_intersection(
    full_shape: &[u64],
    src_slice: &TensorSlice,
    src: &[u8],
    dst_slice: &TensorSlice,
    dst: &mut [u8],
    width: usize,
) -> Result<()> {
    let Some(overlap) = src_slice.intersect(dst_slice, full_shape)? else {
        return Ok(());
    };
    let src_ranges = src_slice.resolve(full_shape)?;
    let dst_ranges = dst_slice.resolve(full_shape)?;
    check_len(src, &src_ranges, width, "source")?;
    check_len(dst, &dst_ranges, width, "destination")?;

    let Some(&(_, run)) = overlap.last() else {
        // Rank zero: a single element
        dst[..width].copy_from_slice(&src[..width]);
        return Ok(());
    };
    if volume(&overlap) == 0 {
        return Ok(());
    }

    let src_strides = strides(&src_ranges);
    let dst_strides = strides(&dst_ranges);
    let run_bytes = run as usize * width;
    let outer = overlap.len() - 1;

    // Odometer over every dimension but the innermost
    let mut index: Vec<u64> = overlap.iter().map(|&(start, _)| start).collect();
    loop {
        let src_at = element_offset(&index, &src_ranges, &src_strides) * width;
        let dst_at = element_offset(&index, &dst_ranges, &dst_strides) * width;
        dst[dst_at..dst_at + run_bytes].copy_from_slice(&src[src_at..src_at + run_bytes]);

        let mut dim = outer;
        loop {
            if dim == 0 {
                return Ok(());
            }
            dim -= 1;
            index[dim] += 1;
            let (start, length) = overlap[dim];
            if index[dim] < start + length {
                break;
            }
            index[dim] = start;
        }
    }
}

fn check_len(bytes: &[u8], ranges: &[(u64, u64)], width: usize, what: &str) -> Result<()> {
    let expected = volume(ranges).saturating_mul(width as u64);
    if bytes.len() as u64 == expected {
        Ok(())
    } else {
        Err(BundleError::InvalidShape(format!(
            "{what} holds {} bytes, its slice needs {expected}",
            bytes.len()
        )))
    }
}

fn strides(ranges: &[(u64, u64)]) -> Vec<usize> {
    let mut strides = vec![1usize; ranges.len()];
    for dim in (0..ranges.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * ranges[dim + 1].1 as usize;
    }
    strides
}

fn element_offset(index: &[u64], ranges: &[(u64, u64)], strides: &[usize]) -> usize {
    index
        .iter()
        .zip(ranges)
        .zip(strides)
        .map(|((&i, &(start, _)), &stride)| (i - start) as usize * stride)
        .sum()
}
