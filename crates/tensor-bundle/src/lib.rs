//! Sharded, checksummed checkpoint bundles for large tensors.
//!
//! A bundle is a set of named tensors persisted under one path prefix as a
//! sorted metadata table plus one or more shard data files:
//!
//! - **Metadata table** (`<prefix>.index`): key-sorted catalog of entries,
//!   preceded by a header record stored under the empty key
//! - **Shard files** (`<prefix>.data-NNNNN-of-MMMMM`): concatenated payload
//!   bytes referenced by `(shard_id, offset, size)` in each entry
//!
//! Writers produce a single shard and commit atomically through temp-file
//! renames. Bundles written by independent workers are combined with
//! [`merge_bundles`]. Readers resolve keys to full values, row subsets,
//! streamed windows, or arbitrary rectangular slices reconstructed from the
//! partitions that were stored.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tensor_bundle::{BundleConfig, BundleReader, BundleWriter, LocalFileSystem, Tensor};
//!
//! # fn example() -> tensor_bundle::Result<()> {
//! let fs = Arc::new(LocalFileSystem::new());
//! let config = BundleConfig::default();
//!
//! let mut writer = BundleWriter::new(fs.clone(), "/tmp/ckpt/model", config.clone());
//! writer.add("weights", &Tensor::from_values(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?)?;
//! writer.finish()?;
//!
//! let mut reader = BundleReader::open(fs, "/tmp/ckpt/model", config)?;
//! let weights = reader.lookup("weights")?;
//! assert_eq!(weights.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::sync::Arc;

use thiserror::Error;

// Leaf utilities
pub mod checksum;
pub mod varint;

// Configuration
pub mod config;

// Value model
pub mod dtype;
pub mod slice;
pub mod tensor;

// Storage capabilities
pub mod fs;
pub mod table;

// Catalog records
pub mod entry;

// Payload writing and encoding
pub mod buffer;
pub mod codec;

// Bundle operations
pub mod merge;
pub mod reader;
pub mod segment;
pub mod slice_set;
pub mod writer;

pub use config::BundleConfig;
pub use dtype::{DataType, ElementKind};
pub use entry::{BundleEntry, BundleHeader, Endianness, FormatVersion};
pub use fs::{FileSystem, LocalFileSystem};
pub use merge::merge_bundles;
pub use reader::BundleReader;
pub use segment::{SegmentReader, SegmentWriter};
pub use slice::{Extent, HashRange, TensorSlice};
pub use tensor::{Element, Tensor, TensorData};
pub use writer::BundleWriter;

/// Result type for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;

/// Errors that can occur while writing, reading, or merging bundles.
///
/// The type is `Clone` so that a writer or reader can keep its first failure
/// and return it again on every later call.
#[derive(Debug, Clone, Error)]
pub enum BundleError {
    /// Malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A key was written twice.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The empty key is reserved for the bundle header.
    #[error("The empty key is reserved for the bundle header")]
    ReservedKey,

    /// Key is not present in the bundle.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Metadata table or entry record could not be parsed.
    #[error("Corrupt bundle: {0}")]
    CorruptBundle(String),

    /// Header record is missing or unparseable.
    #[error("Corrupt bundle header: {0}")]
    CorruptHeader(String),

    /// Payload bytes fail validation.
    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    /// An embedded per-element checksum disagrees with the bytes read so far.
    #[error("Checksum mismatch in {context}: expected {expected:08x}, actual {actual:08x}")]
    ChecksumMismatch {
        /// Where the mismatch was found
        context: String,
        /// Unmasked checksum stored in the file
        expected: u32,
        /// Checksum computed over the bytes read
        actual: u32,
    },

    /// Bundle format version is outside the supported range.
    #[error("Unsupported bundle version: {0}")]
    UnsupportedVersion(String),

    /// Bundles with conflicting byte order or version were merged.
    #[error("Incompatible bundles: {0}")]
    IncompatibleBundles(String),

    /// Two catalog entries for the same key cannot be combined.
    #[error("Incompatible entry: {0}")]
    IncompatibleEntry(String),

    /// Stored slices do not cover the requested slice.
    #[error("Insufficient slices: {0}")]
    InsufficientSlices(String),

    /// Tensor shape is invalid or inconsistent.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Operation is not supported for this value kind.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// I/O error from the file capability.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Writer has already committed.
    #[error("Bundle writer is already closed")]
    WriterAlreadyClosed,

    /// Append after the checksum buffer was closed.
    #[error("Checksum buffer is closed")]
    BufferClosed,

    /// A chunked write is already open or none is open.
    #[error("Chunked write state error: {0}")]
    ConcurrentChunkWrite(String),

    /// Hash-table slice renumbering produced a name collision.
    #[error("Merge fix-up conflict: {0}")]
    MergeFixupConflict(String),
}

impl From<std::io::Error> for BundleError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl BundleError {
    /// Check if the error indicates stored bytes are damaged
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            Self::DataCorruption(_)
                | Self::ChecksumMismatch { .. }
                | Self::CorruptBundle(_)
                | Self::CorruptHeader(_)
        )
    }

    /// Check if the error is a missing key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }

    /// Check if retrying the same call can never succeed
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Key of the header record. Always sorts before every other key.
pub const HEADER_ENTRY_KEY: &str = "";

/// Suffix inserted before the random component of temporary file names.
pub const TEMP_SUFFIX: &str = ".tempstate";

/// Path of the metadata table for `prefix`.
pub fn metadata_filename(prefix: &str) -> String {
    format!("{prefix}.index")
}

/// Path of shard `shard_id` out of `shard_count` for `prefix`.
pub fn data_filename(prefix: &str, shard_id: u32, shard_count: u32) -> String {
    format!("{prefix}.data-{shard_id:05}-of-{shard_count:05}")
}

/// Temporary name for `path` while it is being written.
pub(crate) fn temp_filename(path: &str) -> String {
    format!("{path}{TEMP_SUFFIX}{}", rand::random::<u64>())
}
