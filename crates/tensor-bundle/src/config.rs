//! Configuration for bundle writers and readers

use serde::{Deserialize, Serialize};

use crate::entry::Endianness;

/// Tunables passed explicitly to [`BundleWriter`](crate::BundleWriter) and
/// [`BundleReader`](crate::BundleReader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Alignment (in bytes) of each value's start offset in a shard file
    pub data_alignment: u64,

    /// Capacity of the writer's checksum buffer (in bytes)
    pub write_buffer_size: usize,

    /// Capacity of the reader's per-shard input buffer (in bytes)
    pub read_buffer_size: usize,

    /// Read-ahead window for row-indexed lookups (in bytes)
    pub indexed_read_window: usize,

    /// Default window of segment writers and readers (in bytes)
    pub segment_buffer_size: usize,

    /// Byte order in which payload bytes are written
    pub byte_order: Endianness,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            data_alignment: 1,
            write_buffer_size: 8 << 20,    // 8 MB
            read_buffer_size: 1 << 20,     // 1 MB
            indexed_read_window: 16 << 20, // 16 MB
            segment_buffer_size: 256 << 10,
            byte_order: Endianness::host(),
        }
    }
}

impl BundleConfig {
    /// Set the data alignment; zero is treated as one
    #[must_use]
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.data_alignment = alignment.max(1);
        self
    }

    /// Set the write buffer size
    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size.max(1);
        self
    }

    /// Set the read buffer size
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the read-ahead window for row-indexed lookups
    #[must_use]
    pub fn with_indexed_read_window(mut self, size: usize) -> Self {
        self.indexed_read_window = size.max(1);
        self
    }

    /// Set the segment lookup buffer size
    #[must_use]
    pub fn with_segment_buffer_size(mut self, size: usize) -> Self {
        self.segment_buffer_size = size.max(1);
        self
    }

    /// Set the byte order of written payloads
    #[must_use]
    pub const fn with_byte_order(mut self, order: Endianness) -> Self {
        self.byte_order = order;
        self
    }
}
