//! Single-shard bundle writer
//!
//! Values are appended to a temporary shard file while their catalog entries
//! accumulate in memory. [`BundleWriter::finish`] renames the shard into
//! place, writes the metadata table to a temporary file and renames it last,
//! so a bundle becomes visible only once both files are complete.
//!
//! A writer that fails keeps the failure and returns it from every later
//! call. After a successful finish every call returns
//! [`BundleError::WriterAlreadyClosed`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer::ChecksumBuffer;
use crate::checksum;
use crate::codec;
use crate::config::BundleConfig;
use crate::dtype::{DataType, ElementKind, swap_bytes_in_place};
use crate::entry::{BundleEntry, BundleHeader, EntryCatalog};
use crate::fs::{self, FileSystem};
use crate::slice::{TensorSlice, slice_key};
use crate::table::TableBuilder;
use crate::tensor::{Tensor, num_elements};
use crate::{
    BundleError, HEADER_ENTRY_KEY, Result, data_filename, metadata_filename, temp_filename,
};

#[derive(Debug)]
enum WriterState {
    Open,
    Failed(BundleError),
    Finished,
}

/// Value whose bytes arrive over several calls
#[derive(Debug)]
struct PendingValue {
    key: String,
    dtype: DataType,
    shape: Vec<u64>,
    swap_unit: usize,
    offset: u64,
    written: u64,
    last_write: u64,
}

#[derive(Debug, Clone, Copy)]
enum AppendMode {
    Coalesced,
    Unit,
}

/// Writes one shard of a bundle under a path prefix
pub struct BundleWriter {
    fs: Arc<dyn FileSystem>,
    prefix: String,
    config: BundleConfig,
    data_path: String,
    metadata_path: String,
    out: Option<ChecksumBuffer>,
    catalog: EntryCatalog,
    pending: Option<PendingValue>,
    state: WriterState,
}

impl BundleWriter {
    /// Start writing a bundle under `prefix`.
    ///
    /// Creates the prefix's parent directory and a temporary shard file. A
    /// failure here is returned by the first call on the writer.
    pub fn new(fs: Arc<dyn FileSystem>, prefix: &str, config: BundleConfig) -> Self {
        let data_path = temp_filename(&data_filename(prefix, 0, 1));
        let metadata_path = temp_filename(&metadata_filename(prefix));

        let (out, state) = match Self::open_data(fs.as_ref(), prefix, &data_path, &config) {
            Ok(out) => (Some(out), WriterState::Open),
            Err(e) => (None, WriterState::Failed(e)),
        };

        Self {
            fs,
            prefix: prefix.to_string(),
            config,
            data_path,
            metadata_path,
            out,
            catalog: EntryCatalog::new(),
            pending: None,
            state,
        }
    }

    fn open_data(
        fs: &dyn FileSystem,
        prefix: &str,
        data_path: &str,
        config: &BundleConfig,
    ) -> Result<ChecksumBuffer> {
        if let Some(dir) = fs::dirname(prefix) {
            fs.create_dir(dir)?;
        }
        let file = fs.open_writable(data_path)?;
        debug!("Writing bundle {prefix} through {data_path}");
        Ok(ChecksumBuffer::new(file, config.write_buffer_size))
    }

    /// Path prefix of the bundle being written
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Configuration the writer was created with
    pub const fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// The stored failure, if any
    pub fn status(&self) -> Result<()> {
        self.check()
    }

    /// Add a whole value under `key`
    pub fn add(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        self.check()?;
        let result = self.add_value(key, tensor);
        self.latch(result)
    }

    /// Add a string value from its elements
    pub fn add_strings(&mut self, key: &str, shape: &[u64], strings: Vec<Vec<u8>>) -> Result<()> {
        self.check()?;
        let result = Tensor::from_strings(shape, strings);
        let tensor = self.latch(result)?;
        self.add(key, &tensor)
    }

    /// Add one partition of the tensor `full_key`.
    ///
    /// A slice covering the whole of `full_shape` is stored as a plain value.
    pub fn add_slice(
        &mut self,
        full_key: &str,
        full_shape: &[u64],
        slice: &TensorSlice,
        tensor: &Tensor,
    ) -> Result<()> {
        self.check()?;
        let result = self.add_slice_value(full_key, full_shape, slice, tensor);
        self.latch(result)
    }

    fn add_slice_value(
        &mut self,
        full_key: &str,
        full_shape: &[u64],
        slice: &TensorSlice,
        tensor: &Tensor,
    ) -> Result<()> {
        if full_key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        if slice.is_full_for(full_shape) {
            return self.add_value(full_key, tensor);
        }

        let expected = slice.slice_shape(full_shape)?;
        if expected != tensor.shape() {
            return Err(BundleError::InvalidShape(format!(
                "slice {slice} of '{full_key}' has shape {expected:?}, value has {:?}",
                tensor.shape()
            )));
        }

        let payload_key = slice_key(full_key, slice);
        self.validate_new_key(&payload_key)?;
        self.register_slice(full_key, full_shape, tensor.dtype(), slice.clone(), false)?;
        self.add_value(&payload_key, tensor)
    }

    /// Add one worker's rows of a hash table.
    ///
    /// `slice` must carry a [`HashRange`](crate::HashRange) whose length is the
    /// number of rows in `tensor`. The rows are stored under the key of the
    /// one-dimensional hash range until a merge renumbers them.
    pub fn add_hash_slice(
        &mut self,
        full_key: &str,
        full_shape: &[u64],
        slice: &TensorSlice,
        tensor: &Tensor,
    ) -> Result<()> {
        self.check()?;
        let result = self.add_hash_slice_value(full_key, full_shape, slice, tensor);
        self.latch(result)
    }

    fn add_hash_slice_value(
        &mut self,
        full_key: &str,
        full_shape: &[u64],
        slice: &TensorSlice,
        tensor: &Tensor,
    ) -> Result<()> {
        if full_key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        let range = slice.hash_range().ok_or_else(|| {
            BundleError::InvalidArgument(format!(
                "hash-table slice {slice} of '{full_key}' has no hash range"
            ))
        })?;
        if slice.rank() != full_shape.len() || tensor.shape().len() != full_shape.len() {
            return Err(BundleError::InvalidShape(format!(
                "hash-table slice {slice} does not match rank of {full_shape:?}"
            )));
        }
        let rows = slice.extents().first().and_then(|extent| extent.length);
        if tensor.shape().first() != Some(&range.length) || rows != Some(range.length) {
            return Err(BundleError::InvalidShape(format!(
                "hash-table slice {slice} of '{full_key}' covers {} rows, value has shape {:?}",
                range.length,
                tensor.shape()
            )));
        }

        let payload_key = slice_key(
            full_key,
            &TensorSlice::from_ranges(&[(range.begin, range.length)]),
        );
        self.validate_new_key(&payload_key)?;
        self.register_slice(full_key, full_shape, tensor.dtype(), slice.clone(), true)?;
        self.add_value(&payload_key, tensor)
    }

    /// Open a value whose bytes arrive through [`write_chunk`](Self::write_chunk)
    pub fn begin_write_chunk(&mut self, key: &str, dtype: DataType, shape: &[u64]) -> Result<()> {
        self.check()?;
        let result = self.begin_pending(key, dtype, shape);
        self.latch(result)
    }

    /// Append one chunk of the open value as its own flushed unit
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.check()?;
        let result = self.append_pending(bytes, AppendMode::Unit);
        self.latch(result)
    }

    /// Complete the open value whose bytes all fit in `bytes`
    pub fn write_one_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        self.check()?;
        let result = self.complete_pending(bytes);
        self.latch(result)
    }

    /// Close the open value after `total_bytes`, the last chunk holding
    /// `last_chunk_bytes`
    pub fn end_write_chunk(&mut self, total_bytes: u64, last_chunk_bytes: u64) -> Result<()> {
        self.check()?;
        let result = self.end_pending(total_bytes, Some(last_chunk_bytes));
        self.latch(result)
    }

    /// Open a value written segment by segment
    pub fn begin_segment(&mut self, key: &str, dtype: DataType, shape: &[u64]) -> Result<()> {
        self.begin_write_chunk(key, dtype, shape)
    }

    /// Append one full segment of the open value
    pub fn append_segment(&mut self, bytes: &[u8]) -> Result<()> {
        self.check()?;
        let result = self.append_pending(bytes, AppendMode::Unit);
        self.latch(result)
    }

    /// Complete the open value in a single write
    pub fn add_complete_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_one_buffer(bytes)
    }

    /// Close the open value after `total_bytes`
    pub fn end_segment(&mut self, total_bytes: u64) -> Result<()> {
        self.check()?;
        let result = self.end_pending(total_bytes, None);
        self.latch(result)
    }

    /// Commit the bundle.
    ///
    /// On failure the temporary file in progress is deleted and the writer
    /// keeps the failure.
    pub fn finish(&mut self) -> Result<()> {
        match &self.state {
            WriterState::Finished => return Err(BundleError::WriterAlreadyClosed),
            WriterState::Failed(e) => {
                let e = e.clone();
                self.discard_data();
                return Err(e);
            }
            WriterState::Open => {}
        }

        match self.commit() {
            Ok(()) => {
                self.state = WriterState::Finished;
                info!(
                    "Committed bundle {} with {} entries",
                    self.prefix,
                    self.catalog.len()
                );
                Ok(())
            }
            Err(e) => {
                self.discard_data();
                self.state = WriterState::Failed(e.clone());
                Err(e)
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(pending) = &self.pending {
            return Err(BundleError::ConcurrentChunkWrite(format!(
                "chunked write of '{}' was never ended",
                pending.key
            )));
        }

        let mut out = self.out.take().ok_or(BundleError::WriterAlreadyClosed)?;
        let data_path = data_filename(&self.prefix, 0, 1);
        if let Err(e) = out
            .close()
            .and_then(|()| self.fs.rename(&self.data_path, &data_path))
        {
            self.delete_quietly(&self.data_path);
            return Err(e);
        }
        debug!("Renamed {} to {data_path}", self.data_path);

        let header = BundleHeader::single_shard(self.config.byte_order);
        let metadata_path = metadata_filename(&self.prefix);
        let written = self
            .fs
            .open_writable(&self.metadata_path)
            .and_then(|file| self.catalog.write_table(TableBuilder::new(file), &header))
            .and_then(|_| self.fs.rename(&self.metadata_path, &metadata_path));
        if let Err(e) = written {
            self.delete_quietly(&self.metadata_path);
            return Err(e);
        }
        debug!("Renamed {} to {metadata_path}", self.metadata_path);
        Ok(())
    }

    fn discard_data(&mut self) {
        if let Some(mut out) = self.out.take() {
            if let Err(e) = out.close() {
                debug!("Closing abandoned {} failed: {e}", self.data_path);
            }
            self.delete_quietly(&self.data_path);
        }
    }

    fn delete_quietly(&self, path: &str) {
        if self.fs.exists(path)
            && let Err(e) = self.fs.delete_file(path)
        {
            warn!("Failed to delete temporary file {path}: {e}");
        }
    }

    fn check(&self) -> Result<()> {
        match &self.state {
            WriterState::Open => Ok(()),
            WriterState::Failed(e) => Err(e.clone()),
            WriterState::Finished => Err(BundleError::WriterAlreadyClosed),
        }
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.state = WriterState::Failed(e.clone());
        }
        result
    }

    fn out(&mut self) -> Result<&mut ChecksumBuffer> {
        self.out.as_mut().ok_or(BundleError::WriterAlreadyClosed)
    }

    fn validate_new_key(&self, key: &str) -> Result<()> {
        if key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        if let Some(pending) = &self.pending {
            return Err(BundleError::ConcurrentChunkWrite(format!(
                "cannot add '{key}' while the chunked write of '{}' is open",
                pending.key
            )));
        }
        if self.catalog.contains(key) {
            return Err(BundleError::DuplicateKey(key.to_string()));
        }
        Ok(())
    }

    fn register_slice(
        &mut self,
        full_key: &str,
        full_shape: &[u64],
        dtype: DataType,
        slice: TensorSlice,
        is_hash_table: bool,
    ) -> Result<()> {
        if self.catalog.get(full_key).is_some_and(|e| !e.is_sliced()) {
            return Err(BundleError::DuplicateKey(full_key.to_string()));
        }
        let entry = self.catalog.sliced_entry(full_key, dtype, full_shape)?;
        entry.is_hash_table |= is_hash_table;
        entry.slices.push(slice);
        Ok(())
    }

    fn add_value(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        self.validate_new_key(key)?;
        let order = self.config.byte_order;
        let out = self.out()?;
        out.reset_checksum();
        let offset = out.position();
        let crc = codec::encode(tensor, order, out)?;
        let size = out.position() - offset;

        let mut entry = BundleEntry::new(tensor.dtype(), tensor.shape());
        entry.offset = offset;
        entry.size = size;
        entry.crc32c = checksum::mask(crc);
        self.catalog.insert_new(key, entry)?;
        self.pad_alignment()
    }

    fn pad_alignment(&mut self) -> Result<()> {
        let alignment = self.config.data_alignment.max(1);
        let out = self.out()?;
        let remainder = out.position() % alignment;
        if remainder != 0 {
            out.append(&vec![0u8; (alignment - remainder) as usize])?;
        }
        Ok(())
    }

    fn begin_pending(&mut self, key: &str, dtype: DataType, shape: &[u64]) -> Result<()> {
        self.validate_new_key(key)?;
        let ElementKind::Fixed { swap_unit, .. } = dtype.kind() else {
            return Err(BundleError::Unimplemented(format!(
                "chunked writes of {dtype} values"
            )));
        };
        let out = self.out()?;
        out.reset_checksum();
        let offset = out.position();
        self.pending = Some(PendingValue {
            key: key.to_string(),
            dtype,
            shape: shape.to_vec(),
            swap_unit,
            offset,
            written: 0,
            last_write: 0,
        });
        Ok(())
    }

    fn append_pending(&mut self, bytes: &[u8], mode: AppendMode) -> Result<()> {
        let order = self.config.byte_order;
        let pending = self.pending.as_mut().ok_or_else(|| {
            BundleError::ConcurrentChunkWrite("no chunked write is open".to_string())
        })?;
        let swap_unit = pending.swap_unit;
        pending.written += bytes.len() as u64;
        pending.last_write = bytes.len() as u64;

        let out = self.out.as_mut().ok_or(BundleError::WriterAlreadyClosed)?;
        if order.needs_swap() && swap_unit > 1 {
            if bytes.len() % swap_unit != 0 {
                return Err(BundleError::InvalidArgument(format!(
                    "chunk of {} bytes splits an element of {swap_unit} bytes",
                    bytes.len()
                )));
            }
            let mut swapped = bytes.to_vec();
            swap_bytes_in_place(&mut swapped, swap_unit);
            return match mode {
                AppendMode::Coalesced => out.append(&swapped),
                AppendMode::Unit => out.append_chunk(&swapped),
            };
        }
        match mode {
            AppendMode::Coalesced => out.append(bytes),
            AppendMode::Unit => out.append_chunk(bytes),
        }
    }

    fn complete_pending(&mut self, bytes: &[u8]) -> Result<()> {
        if self.pending.as_ref().is_some_and(|p| p.written > 0) {
            return Err(BundleError::InvalidArgument(
                "single-buffer completion after chunks were written".to_string(),
            ));
        }
        self.append_pending(bytes, AppendMode::Coalesced)?;
        self.end_pending(bytes.len() as u64, None)
    }

    fn end_pending(&mut self, total_bytes: u64, last_chunk_bytes: Option<u64>) -> Result<()> {
        let pending = self.pending.take().ok_or_else(|| {
            BundleError::ConcurrentChunkWrite("no chunked write is open".to_string())
        })?;
        if total_bytes != pending.written {
            return Err(BundleError::InvalidArgument(format!(
                "'{}' declared {total_bytes} bytes but {} were written",
                pending.key, pending.written
            )));
        }
        if let Some(last) = last_chunk_bytes
            && last != pending.last_write
        {
            return Err(BundleError::InvalidArgument(format!(
                "'{}' declared a last chunk of {last} bytes but it held {}",
                pending.key, pending.last_write
            )));
        }
        let width = pending.dtype.size().unwrap_or(1) as u64;
        let expected = num_elements(&pending.shape)?.saturating_mul(width);
        if expected != total_bytes {
            return Err(BundleError::InvalidArgument(format!(
                "'{}' of shape {:?} needs {expected} bytes, {total_bytes} were written",
                pending.key, pending.shape
            )));
        }

        let crc = self.out()?.crc();
        let mut entry = BundleEntry::new(pending.dtype, &pending.shape);
        entry.offset = pending.offset;
        entry.size = total_bytes;
        entry.crc32c = checksum::mask(crc);
        self.catalog.insert_new(&pending.key, entry)?;
        self.pad_alignment()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::slice::Extent;
    use tempfile::tempdir;

    fn writer_at(dir: &std::path::Path, config: BundleConfig) -> (BundleWriter, String) {
        let prefix = dir.join("ckpt/model").to_str().unwrap().to_string();
        let writer = BundleWriter::new(Arc::new(LocalFileSystem::new()), &prefix, config);
        (writer, prefix)
    }

    #[test]
    fn test_finish_commits_both_files() {
        let dir = tempdir().unwrap();
        let (mut writer, prefix) = writer_at(dir.path(), BundleConfig::default());
        writer
            .add("a", &Tensor::from_values(&[2], &[1i64, 2]).unwrap())
            .unwrap();
        writer.finish().unwrap();

        let fs = LocalFileSystem::new();
        assert!(fs.exists(&metadata_filename(&prefix)));
        assert_eq!(fs.file_size(&data_filename(&prefix, 0, 1)).unwrap(), 16);
        assert!(matches!(
            writer.add("b", &Tensor::from_values(&[1], &[1u8]).unwrap()),
            Err(BundleError::WriterAlreadyClosed)
        ));
        assert!(matches!(
            writer.finish(),
            Err(BundleError::WriterAlreadyClosed)
        ));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("ckpt"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.contains(crate::TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_duplicate_key_latches_failure() {
        let dir = tempdir().unwrap();
        let (mut writer, prefix) = writer_at(dir.path(), BundleConfig::default());
        let value = Tensor::from_values(&[1], &[1.0f32]).unwrap();
        writer.add("w", &value).unwrap();
        assert!(matches!(
            writer.add("w", &value),
            Err(BundleError::DuplicateKey(_))
        ));
        assert!(matches!(
            writer.add("other", &value),
            Err(BundleError::DuplicateKey(_))
        ));
        assert!(writer.finish().is_err());
        assert!(!LocalFileSystem::new().exists(&metadata_filename(&prefix)));
    }

    #[test]
    fn test_reserved_key_rejected() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        let value = Tensor::from_values(&[1], &[1u8]).unwrap();
        assert!(matches!(
            writer.add("", &value),
            Err(BundleError::ReservedKey)
        ));
    }

    #[test]
    fn test_alignment_padding() {
        let dir = tempdir().unwrap();
        let (mut writer, prefix) =
            writer_at(dir.path(), BundleConfig::default().with_alignment(8));
        writer
            .add("a", &Tensor::from_values(&[3], &[1u8, 2, 3]).unwrap())
            .unwrap();
        writer
            .add("b", &Tensor::from_values(&[1], &[9u8]).unwrap())
            .unwrap();
        writer.finish().unwrap();
        let data = std::fs::read(data_filename(&prefix, 0, 1)).unwrap();
        assert_eq!(data, vec![1, 2, 3, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_chunk_slot_is_exclusive() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        writer.begin_write_chunk("c", DataType::Int32, &[4]).unwrap();
        assert!(matches!(
            writer.begin_write_chunk("d", DataType::Int32, &[4]),
            Err(BundleError::ConcurrentChunkWrite(_))
        ));
    }

    #[test]
    fn test_chunked_write_sizes_checked() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        writer.begin_write_chunk("c", DataType::UInt8, &[4]).unwrap();
        writer.write_chunk(&[1, 2]).unwrap();
        writer.write_chunk(&[3, 4]).unwrap();
        writer.end_write_chunk(4, 2).unwrap();

        writer.begin_write_chunk("d", DataType::UInt8, &[4]).unwrap();
        writer.write_chunk(&[1, 2]).unwrap();
        assert!(matches!(
            writer.end_write_chunk(2, 2),
            Err(BundleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_chunk_without_begin() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        assert!(matches!(
            writer.write_chunk(&[1]),
            Err(BundleError::ConcurrentChunkWrite(_))
        ));
    }

    #[test]
    fn test_slice_shape_validated() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        let slice = TensorSlice::new(vec![Extent::range(0, 2), Extent::FULL]);
        let wrong = Tensor::from_values(&[3, 2], &[0f32; 6]).unwrap();
        assert!(matches!(
            writer.add_slice("t", &[4, 2], &slice, &wrong),
            Err(BundleError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_whole_then_slice_is_duplicate() {
        let dir = tempdir().unwrap();
        let (mut writer, _) = writer_at(dir.path(), BundleConfig::default());
        writer
            .add("t", &Tensor::from_values(&[4], &[0i32; 4]).unwrap())
            .unwrap();
        let part = Tensor::from_values(&[2], &[0i32; 2]).unwrap();
        assert!(matches!(
            writer.add_slice("t", &[4], &TensorSlice::from_ranges(&[(0, 2)]), &part),
            Err(BundleError::DuplicateKey(_))
        ));
    }
}
