//! Streaming adapters for values too large to hold in memory
//!
//! [`SegmentWriter`] gathers arbitrary-size writes into fixed windows and
//! hands each full window to the bundle writer as one flushed unit.
//! [`SegmentReader`] reads a range of rows of a stored value through its own
//! buffered handle on the shard file.

use crate::codec::InputBuffer;
use crate::dtype::{DataType, ElementKind, swap_bytes_in_place};
use crate::reader::BundleReader;
use crate::tensor::{num_elements, row_bytes};
use crate::writer::BundleWriter;
use crate::{BundleError, Result};

/// Writes one fixed-width value window by window
pub struct SegmentWriter<'a> {
    writer: &'a mut BundleWriter,
    key: String,
    dtype: DataType,
    shape: Vec<u64>,
    buffer: Vec<u8>,
    capacity: usize,
    windows: u64,
}

impl<'a> SegmentWriter<'a> {
    /// Prepare to write `key` through windows of about `buffer_size` bytes,
    /// or the writer's configured segment window when `None`.
    ///
    /// The window is rounded down to whole elements.
    pub fn new(
        writer: &'a mut BundleWriter,
        key: &str,
        dtype: DataType,
        shape: &[u64],
        buffer_size: Option<usize>,
    ) -> Self {
        let buffer_size = buffer_size.unwrap_or(writer.config().segment_buffer_size);
        let width = dtype.size().unwrap_or(1);
        let capacity = (buffer_size / width).max(1) * width;
        Self {
            writer,
            key: key.to_string(),
            dtype,
            shape: shape.to_vec(),
            buffer: Vec::with_capacity(capacity),
            capacity,
            windows: 0,
        }
    }

    /// Open the value in the bundle
    pub fn begin(&mut self) -> Result<()> {
        self.writer.begin_segment(&self.key, self.dtype, &self.shape)
    }

    /// Append `data`, emitting every window that fills up
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = data.len().min(self.capacity - self.buffer.len());
            let (head, rest) = data.split_at(take);
            self.buffer.extend_from_slice(head);
            data = rest;
            if self.buffer.len() == self.capacity {
                self.writer.append_segment(&self.buffer)?;
                self.buffer.clear();
                self.windows += 1;
            }
        }
        Ok(())
    }

    /// Close the value; exactly the bytes its shape needs must have been
    /// written
    pub fn end(&mut self) -> Result<()> {
        let width = self.dtype.size().ok_or_else(|| {
            BundleError::Unimplemented(format!("segment writes of {} values", self.dtype))
        })?;
        let expected = num_elements(&self.shape)?.saturating_mul(width as u64);
        let written = self.windows * self.capacity as u64 + self.buffer.len() as u64;
        if written != expected {
            return Err(BundleError::InvalidArgument(format!(
                "'{}' of shape {:?} needs {expected} bytes, {written} were written",
                self.key, self.shape
            )));
        }

        if self.windows == 0 {
            self.writer.add_complete_data(&self.buffer)?;
        } else {
            if !self.buffer.is_empty() {
                self.writer.append_segment(&self.buffer)?;
            }
            self.writer.end_segment(written)?;
        }
        self.buffer.clear();
        Ok(())
    }
}

/// Reads rows of one fixed-width value in caller-sized pieces
pub struct SegmentReader {
    input: InputBuffer,
    dtype: DataType,
    shape: Vec<u64>,
    remaining: u64,
    swap_unit: Option<usize>,
}

impl SegmentReader {
    /// Position a reader at row `offset` of `key`, covering `size` rows or
    /// every row to the end when `size` is `None`.
    ///
    /// `buffer_size` defaults to the reader's configured segment window.
    pub fn begin(
        reader: &mut BundleReader,
        key: &str,
        offset: u64,
        size: Option<u64>,
        buffer_size: Option<usize>,
    ) -> Result<Self> {
        let buffer_size = buffer_size.unwrap_or(reader.config().segment_buffer_size);
        let (dtype, shape) = reader.lookup_dtype_and_shape(key)?;
        let rows = shape.first().copied().ok_or_else(|| {
            BundleError::InvalidShape(format!("'{key}' is a scalar and has no rows"))
        })?;
        let size = size.unwrap_or(rows);
        if offset.checked_add(size).is_none_or(|end| end > rows) {
            return Err(BundleError::InvalidArgument(format!(
                "rows {offset}+{size} out of range for '{key}' with {rows} rows"
            )));
        }

        let row = row_bytes(dtype, &shape)? as u64;
        let total = row * size;
        let capacity = usize::try_from(total)
            .unwrap_or(usize::MAX)
            .min(buffer_size)
            .max(1);

        let (entry, file) = reader.tensor_file(key)?;
        if entry.is_sliced() {
            return Err(BundleError::Unimplemented(format!(
                "segment reads of partitioned tensor '{key}'"
            )));
        }
        let mut input = InputBuffer::new(file, capacity);
        input.seek(entry.offset + row * offset);

        let swap_unit = match dtype.kind() {
            ElementKind::Fixed { swap_unit, .. } if reader.needs_swap() && swap_unit > 1 => {
                Some(swap_unit)
            }
            _ => None,
        };
        Ok(Self {
            input,
            dtype,
            shape,
            remaining: total,
            swap_unit,
        })
    }

    /// Shape of the whole stored value
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Element type
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Bytes left in the requested rows
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Fill `out` with the next bytes of the requested rows
    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let len = out.len() as u64;
        self.check_request(len)?;
        self.input.read_exact(out)?;
        if let Some(unit) = self.swap_unit {
            swap_bytes_in_place(out, unit);
        }
        self.remaining -= len;
        Ok(())
    }

    /// Skip the next `bytes` bytes of the requested rows
    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        self.check_request(bytes)?;
        self.input.skip(bytes);
        self.remaining -= bytes;
        Ok(())
    }

    fn check_request(&self, bytes: u64) -> Result<()> {
        if bytes > self.remaining {
            return Err(BundleError::InvalidArgument(format!(
                "requested {bytes} bytes but only {} remain",
                self.remaining
            )));
        }
        if let Some(unit) = self.swap_unit
            && bytes % unit as u64 != 0
        {
            return Err(BundleError::InvalidArgument(format!(
                "request of {bytes} bytes splits {unit}-byte elements"
            )));
        }
        Ok(())
    }
}
