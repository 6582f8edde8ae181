//! Buffered, checksum-accumulating append-only writer
//!
//! The running CRC32C is always computed over the bytes after they have been
//! copied into the internal buffer, never over the caller's slice. Callers
//! may reuse or mutate their source buffers as soon as an append returns.

use crate::checksum;
use crate::fs::WritableFile;
use crate::{BundleError, Result};

/// Append-only writer over one destination file
pub struct ChecksumBuffer {
    file: Option<Box<dyn WritableFile>>,
    buffer: Vec<u8>,
    capacity: usize,
    flushed: u64,
    crc: u32,
}

impl ChecksumBuffer {
    /// Wrap `file` with a buffer of `capacity` bytes
    pub fn new(file: Box<dyn WritableFile>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            file: Some(file),
            buffer: Vec::with_capacity(capacity),
            capacity,
            flushed: 0,
            crc: 0,
        }
    }

    /// Append `data`, coalescing with neighbouring appends
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        while !data.is_empty() {
            if self.buffer.len() == self.capacity {
                self.flush_buffer()?;
            }
            let take = data.len().min(self.capacity - self.buffer.len());
            let (head, rest) = data.split_at(take);
            self.copy_in(head);
            data = rest;
        }
        Ok(())
    }

    /// Append `data` as its own flushed unit, separate from earlier writes
    pub fn append_segment(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.flush_buffer()?;
        for unit in data.chunks(self.capacity) {
            self.copy_in(unit);
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Append one chunk of a value that arrives over several calls
    pub fn append_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.append_segment(data)
    }

    /// Zero the running checksum
    pub fn reset_checksum(&mut self) {
        self.crc = 0;
    }

    /// Unmasked CRC32C of every byte appended since the last reset
    pub const fn crc(&self) -> u32 {
        self.crc
    }

    /// Offset in the destination file at which the next byte will land
    pub fn position(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    /// Whether [`close`](Self::close) has been called
    pub const fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Flush buffered bytes and close the destination file
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_buffer()?;
        if let Some(mut file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_some() {
            Ok(())
        } else {
            Err(BundleError::BufferClosed)
        }
    }

    fn copy_in(&mut self, data: &[u8]) {
        let start = self.buffer.len();
        self.buffer.extend_from_slice(data);
        self.crc = checksum::extend(self.crc, &self.buffer[start..]);
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(BundleError::BufferClosed)?;
        file.append(&self.buffer)?;
        file.flush()?;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }
}
