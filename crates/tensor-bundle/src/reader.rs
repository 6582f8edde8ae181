//! Bundle reader
//!
//! The metadata table is loaded once at open; entries are decoded on demand.
//! Shard files are opened on first use and stay open for the reader's
//! lifetime. A reader that hits damaged data keeps that failure and returns
//! it from every later read.

use std::collections::HashMap;
use std::collections::hash_map;
use std::sync::Arc;

use tracing::debug;

use crate::checksum;
use crate::codec::{self, InputBuffer};
use crate::config::BundleConfig;
use crate::dtype::{DataType, ElementKind, swap_bytes_in_place};
use crate::entry::{BundleEntry, BundleHeader};
use crate::fs::{FileSystem, RandomAccessFile, read_full};
use crate::slice::{TensorSlice, is_slice_key, slice_key};
use crate::slice_set::{SliceSet, copy_intersection};
use crate::table::{Table, TableIterator};
use crate::tensor::{Tensor, num_elements, row_bytes};
use crate::{BundleError, HEADER_ENTRY_KEY, Result, data_filename, metadata_filename};

/// Upper bound of part ids probed by [`BundleReader::count_parts`]
const MAX_PARTS: usize = 1024;

/// Cursor of a streamed lookup
#[derive(Debug, Clone)]
struct SegmentCursor {
    entry: BundleEntry,
    consumed: u64,
    remaining: u64,
}

/// Reads values from a committed bundle
pub struct BundleReader {
    fs: Arc<dyn FileSystem>,
    prefix: String,
    config: BundleConfig,
    header: BundleHeader,
    iter: TableIterator,
    data: HashMap<u32, InputBuffer>,
    slice_sets: HashMap<String, SliceSet>,
    segments: HashMap<String, SegmentCursor>,
    status: Option<BundleError>,
}

impl BundleReader {
    /// Open the bundle under `prefix`.
    ///
    /// Fails with [`BundleError::CorruptHeader`] when the header record is
    /// missing or unparseable and with [`BundleError::UnsupportedVersion`]
    /// when the bundle's version is outside the supported range.
    pub fn open(fs: Arc<dyn FileSystem>, prefix: &str, config: BundleConfig) -> Result<Self> {
        let path = metadata_filename(prefix);
        let size = fs.file_size(&path)?;
        let mut file = fs.open_random_access(&path)?;
        let table = Table::open(file.as_mut(), size)?;

        let mut iter = table.iter();
        iter.seek(HEADER_ENTRY_KEY);
        if !iter.valid() || iter.key() != HEADER_ENTRY_KEY {
            return Err(BundleError::CorruptHeader(format!(
                "{path}: failed to seek to header entry"
            )));
        }
        let header = BundleHeader::decode(iter.value())
            .map_err(|e| BundleError::CorruptHeader(format!("{path}: {e}")))?;
        if header.shard_count == 0 {
            return Err(BundleError::CorruptHeader(format!(
                "{path}: header declares zero shards"
            )));
        }
        header.version.check_supported()?;

        debug!(
            "Opened bundle {prefix}: {} shard(s), {:?} byte order, {} records",
            header.shard_count,
            header.endianness,
            iter.table().len()
        );

        Ok(Self {
            fs,
            prefix: prefix.to_string(),
            config,
            header,
            iter,
            data: HashMap::new(),
            slice_sets: HashMap::new(),
            segments: HashMap::new(),
            status: None,
        })
    }

    /// Path prefix of the bundle
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Configuration the reader was opened with
    pub const fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Header record
    pub const fn header(&self) -> &BundleHeader {
        &self.header
    }

    /// Number of shard files
    pub const fn shard_count(&self) -> u32 {
        self.header.shard_count
    }

    /// Whether payloads are stored in the opposite byte order to this machine
    pub fn needs_swap(&self) -> bool {
        self.header.endianness.needs_swap()
    }

    /// The stored failure, if any
    pub fn status(&self) -> Result<()> {
        self.check()
    }

    fn check(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_data_loss()
        {
            self.status = Some(e.clone());
        }
        result
    }

    /// Whether `key` is present
    pub fn contains(&mut self, key: &str) -> bool {
        self.iter.seek(key);
        self.iter.valid() && self.iter.key() == key
    }

    /// Decoded catalog entry for `key`
    pub fn entry(&mut self, key: &str) -> Result<BundleEntry> {
        if key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        if !self.contains(key) {
            return Err(BundleError::KeyNotFound(key.to_string()));
        }
        let entry = BundleEntry::decode(key, self.iter.value())?;
        num_elements(&entry.shape).map_err(|_| {
            BundleError::DataCorruption(format!(
                "invalid tensor shape for '{key}': {:?}",
                entry.shape
            ))
        })?;
        Ok(entry)
    }

    /// Element type and shape of `key`
    pub fn lookup_dtype_and_shape(&mut self, key: &str) -> Result<(DataType, Vec<u64>)> {
        let entry = self.entry(key)?;
        Ok((entry.dtype, entry.shape))
    }

    /// Shape of `key`
    pub fn lookup_tensor_shape(&mut self, key: &str) -> Result<Vec<u64>> {
        Ok(self.lookup_dtype_and_shape(key)?.1)
    }

    /// Partitions registered for `key`; empty for values stored whole
    pub fn lookup_tensor_slices(&mut self, key: &str) -> Result<Vec<TensorSlice>> {
        Ok(self.entry(key)?.slices)
    }

    /// Shard path, offset and size of the stored value of `key`
    pub fn tensor_location(&mut self, key: &str) -> Result<(String, u64, u64)> {
        let entry = self.entry(key)?;
        Ok((self.shard_path(entry.shard_id)?, entry.offset, entry.size))
    }

    /// Entry of `key` and a fresh handle on its shard file
    pub fn tensor_file(&mut self, key: &str) -> Result<(BundleEntry, Box<dyn RandomAccessFile>)> {
        let entry = self.entry(key)?;
        let file = self.fs.open_random_access(&self.shard_path(entry.shard_id)?)?;
        Ok((entry, file))
    }

    /// Full value of `key`, reconstructed from its partitions if it has any
    pub fn lookup(&mut self, key: &str) -> Result<Tensor> {
        self.check()?;
        let entry = self.entry(key)?;
        if entry.is_sliced() {
            let full = TensorSlice::full(entry.shape.len());
            self.get_slice_value(key, &entry, &full)
        } else {
            self.get_value(&entry)
        }
    }

    /// Read and verify the value an entry points at
    pub fn get_value(&mut self, entry: &BundleEntry) -> Result<Tensor> {
        self.check()?;
        let result = self.read_value(entry);
        self.latch(result)
    }

    fn read_value(&mut self, entry: &BundleEntry) -> Result<Tensor> {
        let order = self.header.endianness;
        let swap = self.needs_swap();
        let count = usize::try_from(num_elements(&entry.shape)?).map_err(|_| {
            BundleError::InvalidShape(format!("{:?} too large to read", entry.shape))
        })?;
        let location = format!("shard {} offset {}", entry.shard_id, entry.offset);

        let (tensor, actual) = match entry.dtype.kind() {
            ElementKind::Fixed { width, swap_unit } => {
                let expected = count as u64 * width as u64;
                if entry.size != expected {
                    return Err(BundleError::DataCorruption(format!(
                        "invalid size at {location}: stored {}, expected {expected}",
                        entry.size
                    )));
                }
                let input = self.shard(entry.shard_id)?;
                input.seek(entry.offset);
                let mut bytes = vec![0u8; expected as usize];
                input.read_exact(&mut bytes)?;
                // Checksum the bytes as stored, before any swap
                let actual = checksum::value(&bytes);
                if swap {
                    swap_bytes_in_place(&mut bytes, swap_unit);
                }
                (Tensor::from_bytes(entry.dtype, &entry.shape, bytes)?, actual)
            }
            ElementKind::String => {
                // One varint byte per element at least; the exact overhead is
                // only known after decoding
                if entry.size < count as u64 {
                    return Err(BundleError::DataCorruption(format!(
                        "invalid size at {location}: stored {}, expected at least {count}",
                        entry.size
                    )));
                }
                let input = self.shard(entry.shard_id)?;
                input.seek(entry.offset);
                let (items, actual) = codec::decode_strings(input, count, order, entry.size)?;
                (Tensor::from_strings(&entry.shape, items)?, actual)
            }
            ElementKind::Variant => {
                let input = self.shard(entry.shard_id)?;
                input.seek(entry.offset);
                let (items, actual) =
                    codec::decode_variants(input, count, order, entry.size, &location)?;
                (Tensor::from_variants(&entry.shape, items)?, actual)
            }
        };

        let stored = checksum::unmask(entry.crc32c);
        if stored != actual {
            return Err(BundleError::DataCorruption(format!(
                "checksum does not match at {location}: stored {stored:08x}, computed {actual:08x}"
            )));
        }
        Ok(tensor)
    }

    /// Rows `indices` of the first dimension of `key`, in the order given.
    ///
    /// Reads go through a read-ahead window anchored at the first row that
    /// misses it, so nearby rows share one read. Row reads are not checksummed.
    pub fn lookup_with_indices(&mut self, key: &str, indices: &[u64]) -> Result<Tensor> {
        self.check()?;
        let entry = self.entry(key)?;
        if entry.is_sliced() {
            return Err(BundleError::Unimplemented(format!(
                "row-indexed lookup of partitioned tensor '{key}'"
            )));
        }
        let ElementKind::Fixed { swap_unit, .. } = entry.dtype.kind() else {
            return Err(BundleError::Unimplemented(format!(
                "row-indexed lookup of {} values",
                entry.dtype
            )));
        };

        let row = row_bytes(entry.dtype, &entry.shape)?;
        let rows = entry.shape[0];
        if entry.size != rows.saturating_mul(row as u64) {
            return Err(BundleError::DataCorruption(format!(
                "invalid size for '{key}': stored {}, expected {} rows of {row} bytes",
                entry.size, rows
            )));
        }

        let window_capacity = self.config.indexed_read_window.max(row) as u64;
        let swap = self.needs_swap();
        let input = self.shard(entry.shard_id)?;

        let mut out = Vec::with_capacity(indices.len() * row);
        let mut window: Vec<u8> = Vec::new();
        let (mut head, mut tail) = (0u64, 0u64);
        for &index in indices {
            if index >= rows {
                return Err(BundleError::InvalidArgument(format!(
                    "row {index} out of range for '{key}' with {rows} rows"
                )));
            }
            let row_head = index * row as u64;
            let row_tail = row_head + row as u64;
            if row_head < head || row_tail > tail {
                let next = (entry.size - row_head).min(window_capacity);
                window.resize(next as usize, 0);
                read_full(input.file_mut(), entry.offset + row_head, &mut window)?;
                head = row_head;
                tail = row_head + next;
            }
            let at = (row_head - head) as usize;
            out.extend_from_slice(&window[at..at + row]);
        }
        if swap {
            swap_bytes_in_place(&mut out, swap_unit);
        }

        let mut shape = entry.shape.clone();
        shape[0] = indices.len() as u64;
        Tensor::from_bytes(entry.dtype, &shape, out)
    }

    /// Start a streamed lookup of `key`, whose stored size must be
    /// `total_bytes`
    pub fn lookup_header(&mut self, key: &str, total_bytes: u64) -> Result<()> {
        self.check()?;
        let entry = self.entry(key)?;
        if entry.size != total_bytes {
            return Err(BundleError::DataCorruption(format!(
                "invalid size for '{key}': stored {}, expected {total_bytes}",
                entry.size
            )));
        }
        if !entry.dtype.is_fixed_width() {
            return Err(BundleError::Unimplemented(format!(
                "segment lookup of {} value '{key}'",
                entry.dtype
            )));
        }
        self.shard(entry.shard_id)?;
        self.segments.insert(
            key.to_string(),
            SegmentCursor {
                remaining: entry.size,
                entry,
                consumed: 0,
            },
        );
        Ok(())
    }

    /// Read the next window of a streamed lookup into `destination`.
    ///
    /// Returns the number of bytes read. Zero means the value is exhausted and
    /// ends the streamed lookup.
    pub fn lookup_segment(&mut self, key: &str, destination: &mut [u8]) -> Result<usize> {
        let consumed = self.cursor(key)?.consumed;
        self.read_segment(key, consumed, destination)
    }

    /// Read a window starting `offset` bytes into the value of a streamed
    /// lookup
    pub fn lookup_segment_at(
        &mut self,
        key: &str,
        offset: u64,
        destination: &mut [u8],
    ) -> Result<usize> {
        self.read_segment(key, offset, destination)
    }

    fn cursor(&self, key: &str) -> Result<&SegmentCursor> {
        self.segments.get(key).ok_or_else(|| {
            BundleError::InvalidArgument(format!("no streamed lookup of '{key}' in progress"))
        })
    }

    fn read_segment(&mut self, key: &str, offset: u64, destination: &mut [u8]) -> Result<usize> {
        self.check()?;
        let cursor = self.cursor(key)?.clone();
        let available = cursor.entry.size.saturating_sub(offset);
        let desired = (destination.len() as u64)
            .min(cursor.remaining)
            .min(available) as usize;
        if desired == 0 {
            // The streamed lookup is complete
            self.segments.remove(key);
            return Ok(0);
        }

        let swap_unit = match cursor.entry.dtype.kind() {
            ElementKind::Fixed { swap_unit, .. } => swap_unit,
            ElementKind::String | ElementKind::Variant => 1,
        };
        let swap = self.needs_swap() && swap_unit > 1;
        if swap && (offset % swap_unit as u64 != 0 || desired % swap_unit != 0) {
            return Err(BundleError::InvalidArgument(format!(
                "segment of '{key}' at {offset}+{desired} splits {swap_unit}-byte elements"
            )));
        }

        let input = self.shard(cursor.entry.shard_id)?;
        let result = read_full(
            input.file_mut(),
            cursor.entry.offset + offset,
            &mut destination[..desired],
        );
        self.latch(result)?;
        if swap {
            swap_bytes_in_place(&mut destination[..desired], swap_unit);
        }

        if let Some(cursor) = self.segments.get_mut(key) {
            cursor.consumed += desired as u64;
            cursor.remaining -= desired as u64;
        }
        Ok(desired)
    }

    /// Slice `request` of the tensor `full_key`
    pub fn lookup_slice(&mut self, full_key: &str, request: &TensorSlice) -> Result<Tensor> {
        self.check()?;
        let entry = self.entry(full_key)?;
        self.get_slice_value(full_key, &entry, request)
    }

    /// Reconstruct `request` from the partitions of `full_entry`.
    ///
    /// Fails with [`BundleError::InsufficientSlices`] unless the stored
    /// partitions cover the whole request.
    pub fn get_slice_value(
        &mut self,
        full_key: &str,
        full_entry: &BundleEntry,
        request: &TensorSlice,
    ) -> Result<Tensor> {
        self.check()?;
        let result = self.reconstruct(full_key, full_entry, request);
        self.latch(result)
    }

    fn reconstruct(
        &mut self,
        full_key: &str,
        full_entry: &BundleEntry,
        request: &TensorSlice,
    ) -> Result<Tensor> {
        let dtype = full_entry.dtype;
        let full_shape = full_entry.shape.clone();

        let set = match self.slice_sets.entry(full_key.to_string()) {
            hash_map::Entry::Occupied(slot) => slot.into_mut(),
            hash_map::Entry::Vacant(slot) => {
                let mut set = SliceSet::new(dtype, &full_shape);
                if full_entry.slices.is_empty() {
                    // Stored whole but read by slice
                    set.register(TensorSlice::full(full_shape.len()))?;
                }
                for slice in &full_entry.slices {
                    set.register(slice.clone())?;
                }
                slot.insert(set)
            }
        };
        let covering = set.query(request)?;
        let out_shape = request.slice_shape(&full_shape)?;

        let mut out: Option<Tensor> = None;
        for stored in covering {
            let stored_entry = if stored.is_full() {
                full_entry.clone()
            } else {
                self.entry(&slice_key(full_key, &stored))?
            };
            if stored_entry.dtype != dtype {
                return Err(BundleError::CorruptBundle(format!(
                    "slice {stored} of '{full_key}' holds {}, tensor is {dtype}",
                    stored_entry.dtype
                )));
            }

            if stored.same_region(request)
                || (stored_entry.shape == out_shape
                    && stored.is_full_for(&stored_entry.shape)
                    && request.is_full_for(&stored_entry.shape))
            {
                debug!("Copying stored slice {stored} of '{full_key}' directly");
                return self.read_value(&stored_entry);
            }

            let width = dtype.size().ok_or_else(|| {
                BundleError::Unimplemented(format!("slice reconstruction of {dtype} values"))
            })?;
            let scratch = self.read_value(&stored_entry)?;
            if out.is_none() {
                out = Some(Tensor::zeros(dtype, &out_shape)?);
            }
            if let (Some(src), Some(dst)) = (
                scratch.as_bytes(),
                out.as_mut().and_then(Tensor::as_bytes_mut),
            ) {
                copy_intersection(&full_shape, &stored, src, request, dst, width)?;
            }
        }

        match out {
            Some(tensor) => Ok(tensor),
            None => Tensor::zeros(dtype, &out_shape),
        }
    }

    /// Position the iterator at the header record
    pub fn seek_to_header(&mut self) {
        self.iter.seek(HEADER_ENTRY_KEY);
    }

    /// Position the iterator at the first key `>= key`
    pub fn seek(&mut self, key: &str) {
        self.iter.seek(key);
    }

    /// Advance the iterator
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Whether the iterator points at a record
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Key at the iterator
    pub fn key(&self) -> &str {
        self.iter.key()
    }

    /// Raw record at the iterator
    pub fn value(&self) -> &[u8] {
        self.iter.value()
    }

    /// Decoded entry at the iterator
    pub fn current_entry(&self) -> Result<BundleEntry> {
        if !self.iter.valid() {
            return Err(BundleError::InvalidArgument(
                "iterator is not positioned at a record".to_string(),
            ));
        }
        BundleEntry::decode(self.iter.key(), self.iter.value())
    }

    /// Value of the entry at the iterator
    pub fn read_current(&mut self) -> Result<Tensor> {
        self.check()?;
        let key = self.iter.key().to_string();
        let entry = self.current_entry()?;
        if entry.is_sliced() {
            let full = TensorSlice::full(entry.shape.len());
            self.get_slice_value(&key, &entry, &full)
        } else {
            self.get_value(&entry)
        }
    }

    /// One line per logical tensor: `key (dtype) [dims]`.
    ///
    /// Stored partitions are summarized through their tensor.
    pub fn debug_string(&mut self) -> Result<String> {
        let mut out = String::new();
        self.seek_to_header();
        self.next();
        while self.valid() {
            if !is_slice_key(self.key()) {
                let entry = self.current_entry()?;
                let dims: Vec<String> = entry.shape.iter().map(u64::to_string).collect();
                out.push_str(&format!(
                    "{} ({}) [{}]\n",
                    self.key(),
                    entry.dtype,
                    dims.join(",")
                ));
            }
            self.next();
        }
        Ok(out)
    }

    /// Number of consecutive `{prefix}/part_{N}{suffix}` keys starting at
    /// part zero
    pub fn count_parts(&mut self, prefix: &str, suffix: &str) -> usize {
        let (mut left, mut right) = (0usize, MAX_PARTS - 1);
        while left < right {
            let mid = (left + right).div_ceil(2);
            if self.part_exists(mid, prefix, suffix) {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        if self.part_exists(left, prefix, suffix) {
            left + 1
        } else {
            0
        }
    }

    fn part_exists(&mut self, part: usize, prefix: &str, suffix: &str) -> bool {
        self.contains(&format!("{prefix}/part_{part}{suffix}"))
    }

    fn shard_path(&self, shard_id: u32) -> Result<String> {
        if shard_id >= self.header.shard_count {
            return Err(BundleError::CorruptBundle(format!(
                "shard id {shard_id} out of range for {} shards",
                self.header.shard_count
            )));
        }
        Ok(data_filename(&self.prefix, shard_id, self.header.shard_count))
    }

    fn shard(&mut self, shard_id: u32) -> Result<&mut InputBuffer> {
        let path = self.shard_path(shard_id)?;
        match self.data.entry(shard_id) {
            hash_map::Entry::Occupied(slot) => Ok(slot.into_mut()),
            hash_map::Entry::Vacant(slot) => {
                let file = self.fs.open_random_access(&path)?;
                debug!("Opened shard {path}");
                Ok(slot.insert(InputBuffer::new(file, self.config.read_buffer_size)))
            }
        }
    }
}
