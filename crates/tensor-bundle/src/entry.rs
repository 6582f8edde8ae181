//! Catalog records: the bundle header and per-key entries
//!
//! Both records are stored as values of the metadata table and always use
//! little-endian encoding. The header sits under the empty key, so it sorts
//! before every entry.
//!
//! Entry layout:
//!
//! ```text
//! dtype u32 | rank u32 | dims u64* | shard_id u32 | offset u64 | size u64
//! crc32c u32 | slice_count u32 | slices* | is_hash_table u8
//! slice = rank u32 | (start u64, length u64)* | has_hash u8 | begin u64 | length u64
//! ```
//!
//! A full extent is stored with length `u64::MAX`.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use serde::{Deserialize, Serialize};

use crate::HEADER_ENTRY_KEY;
use crate::dtype::DataType;
use crate::slice::{Extent, HashRange, TensorSlice};
use crate::table::TableBuilder;
use crate::{BundleError, Result};

/// Current producer version of the format
pub const BUNDLE_VERSION: i32 = 1;

/// Oldest reader able to consume bundles written by this crate
pub const BUNDLE_MIN_CONSUMER: i32 = 0;

/// Oldest producer whose bundles this crate can read
pub const BUNDLE_MIN_PRODUCER: i32 = 0;

const FULL_EXTENT_LENGTH: u64 = u64::MAX;

/// Byte order of payload bytes in shard files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endianness {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl Endianness {
    /// Byte order of this machine
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Whether bytes in this order must be swapped on this machine
    pub fn needs_swap(self) -> bool {
        self != Self::host()
    }

    /// Encode a `u32` in this byte order
    pub const fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Encode a `u64` in this byte order
    pub const fn u64_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Decode a `u32` stored in this byte order
    pub const fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    const fn code(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Little),
            1 => Ok(Self::Big),
            other => Err(BundleError::CorruptHeader(format!(
                "unknown endianness tag {other}"
            ))),
        }
    }
}

/// Format version carried by the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatVersion {
    /// Version of the writer that produced the bundle
    pub producer: i32,
    /// Oldest reader version allowed to read the bundle
    pub min_consumer: i32,
    /// Reader versions explicitly refused
    pub bad_consumers: Vec<i32>,
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self {
            producer: BUNDLE_VERSION,
            min_consumer: BUNDLE_MIN_CONSUMER,
            bad_consumers: Vec::new(),
        }
    }
}

impl FormatVersion {
    /// Check that this crate may read a bundle of this version
    pub fn check_supported(&self) -> Result<()> {
        if self.producer < BUNDLE_MIN_PRODUCER {
            return Err(BundleError::UnsupportedVersion(format!(
                "bundle producer version {} is older than the minimum supported {BUNDLE_MIN_PRODUCER}",
                self.producer
            )));
        }
        if self.min_consumer > BUNDLE_VERSION {
            return Err(BundleError::UnsupportedVersion(format!(
                "bundle requires reader version {} or newer, this reader is {BUNDLE_VERSION}",
                self.min_consumer
            )));
        }
        if self.bad_consumers.contains(&BUNDLE_VERSION) {
            return Err(BundleError::UnsupportedVersion(format!(
                "reader version {BUNDLE_VERSION} is disallowed by this bundle"
            )));
        }
        Ok(())
    }
}

/// Bundle-wide metadata stored under the empty key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    /// Number of shard files
    pub shard_count: u32,
    /// Byte order of the payloads
    pub endianness: Endianness,
    /// Format version
    pub version: FormatVersion,
}

impl BundleHeader {
    /// Header of a freshly written single-shard bundle
    pub fn single_shard(endianness: Endianness) -> Self {
        Self {
            shard_count: 1,
            endianness,
            version: FormatVersion::default(),
        }
    }

    /// Serialize for the metadata table
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = RawHeader {
            shard_count: self.shard_count,
            endianness: self.endianness.code(),
            producer: self.version.producer,
            min_consumer: self.version.min_consumer,
            bad_consumers: self.version.bad_consumers.clone(),
        };
        let mut bytes = Vec::new();
        raw.write(&mut Cursor::new(&mut bytes))
            .map_err(|e| BundleError::CorruptHeader(format!("failed to encode header: {e}")))?;
        Ok(bytes)
    }

    /// Parse a metadata table value
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let raw = RawHeader::read(&mut cursor)
            .map_err(|e| BundleError::CorruptHeader(format!("unable to parse header: {e}")))?;
        if cursor.position() as usize != bytes.len() {
            return Err(BundleError::CorruptHeader(
                "trailing bytes after header".to_string(),
            ));
        }
        Ok(Self {
            shard_count: raw.shard_count,
            endianness: Endianness::from_code(raw.endianness)?,
            version: FormatVersion {
                producer: raw.producer,
                min_consumer: raw.min_consumer,
                bad_consumers: raw.bad_consumers,
            },
        })
    }
}

/// Catalog record describing one stored value or one partitioned tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    /// Element type
    pub dtype: DataType,
    /// Dimension sizes
    pub shape: Vec<u64>,
    /// Shard file holding the payload
    pub shard_id: u32,
    /// Byte offset of the payload within the shard
    pub offset: u64,
    /// Payload size in bytes
    pub size: u64,
    /// Masked CRC32C of the payload as stored
    pub crc32c: u32,
    /// Stored partitions; empty for values stored whole
    pub slices: Vec<TensorSlice>,
    /// Whether the partitions are hash-table row ranges
    pub is_hash_table: bool,
}

impl BundleEntry {
    /// Entry with no location yet
    pub fn new(dtype: DataType, shape: &[u64]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            shard_id: 0,
            offset: 0,
            size: 0,
            crc32c: 0,
            slices: Vec::new(),
            is_hash_table: false,
        }
    }

    /// Whether this entry describes a partitioned tensor
    pub fn is_sliced(&self) -> bool {
        !self.slices.is_empty()
    }

    /// Serialize for the metadata table
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = RawEntry {
            dtype: self.dtype.code(),
            shape: self.shape.clone(),
            shard_id: self.shard_id,
            offset: self.offset,
            size: self.size,
            crc32c: self.crc32c,
            slices: self.slices.iter().map(RawSlice::from_slice).collect(),
            is_hash_table: u8::from(self.is_hash_table),
        };
        let mut bytes = Vec::new();
        raw.write(&mut Cursor::new(&mut bytes))
            .map_err(|e| BundleError::InvalidArgument(format!("failed to encode entry: {e}")))?;
        Ok(bytes)
    }

    /// Parse a metadata table value stored under `key`
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| {
            BundleError::CorruptBundle(format!(
                "entry for key '{}' not parseable: {detail}",
                key.escape_default()
            ))
        };

        let mut cursor = Cursor::new(bytes);
        let raw = RawEntry::read(&mut cursor).map_err(|e| corrupt(e.to_string()))?;
        if cursor.position() as usize != bytes.len() {
            return Err(corrupt("trailing bytes".to_string()));
        }

        Ok(Self {
            dtype: DataType::from_code(raw.dtype).map_err(|e| corrupt(e.to_string()))?,
            shape: raw.shape,
            shard_id: raw.shard_id,
            offset: raw.offset,
            size: raw.size,
            crc32c: raw.crc32c,
            slices: raw.slices.into_iter().map(RawSlice::into_slice).collect(),
            is_hash_table: raw.is_hash_table != 0,
        })
    }
}

#[binrw]
#[derive(Debug)]
#[brw(little, magic = b"TBHD")]
struct RawHeader {
    shard_count: u32,
    endianness: u8,
    producer: i32,
    min_consumer: i32,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(bad_consumers.len()))]
    bad_count: u32,
    #[br(count = bad_count)]
    bad_consumers: Vec<i32>,
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little)]
struct RawExtent {
    start: u64,
    length: u64,
}

#[binrw]
#[derive(Debug)]
#[brw(little)]
struct RawSlice {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(extents.len()))]
    rank: u32,
    #[br(count = rank)]
    extents: Vec<RawExtent>,
    has_hash: u8,
    hash_begin: u64,
    hash_length: u64,
}

impl RawSlice {
    fn from_slice(slice: &TensorSlice) -> Self {
        let hash = slice.hash_range();
        Self {
            extents: slice
                .extents()
                .iter()
                .map(|extent| RawExtent {
                    start: extent.start,
                    length: extent.length.unwrap_or(FULL_EXTENT_LENGTH),
                })
                .collect(),
            has_hash: u8::from(hash.is_some()),
            hash_begin: hash.map_or(0, |h| h.begin),
            hash_length: hash.map_or(0, |h| h.length),
        }
    }

    fn into_slice(self) -> TensorSlice {
        let slice = TensorSlice::new(
            self.extents
                .into_iter()
                .map(|raw| {
                    if raw.length == FULL_EXTENT_LENGTH {
                        Extent::FULL
                    } else {
                        Extent::range(raw.start, raw.length)
                    }
                })
                .collect(),
        );
        if self.has_hash != 0 {
            slice.with_hash_range(HashRange {
                begin: self.hash_begin,
                length: self.hash_length,
            })
        } else {
            slice
        }
    }
}

#[binrw]
#[derive(Debug)]
#[brw(little)]
struct RawEntry {
    dtype: u32,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(shape.len()))]
    rank: u32,
    #[br(count = rank)]
    shape: Vec<u64>,
    shard_id: u32,
    offset: u64,
    size: u64,
    crc32c: u32,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(slices.len()))]
    slice_count: u32,
    #[br(count = slice_count)]
    slices: Vec<RawSlice>,
    is_hash_table: u8,
}

/// Ordered key to entry table built while writing or merging
#[derive(Debug, Clone, Default)]
pub struct EntryCatalog {
    entries: BTreeMap<String, BundleEntry>,
}

impl EntryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` has an entry
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entry for `key`
    pub fn get(&self, key: &str) -> Option<&BundleEntry> {
        self.entries.get(key)
    }

    /// Mutable entry for `key`
    pub fn get_mut(&mut self, key: &str) -> Option<&mut BundleEntry> {
        self.entries.get_mut(key)
    }

    /// Insert an entry under a key not yet present
    pub fn insert_new(&mut self, key: &str, entry: BundleEntry) -> Result<&mut BundleEntry> {
        if key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        match self.entries.entry(key.to_string()) {
            btree_map::Entry::Occupied(_) => Err(BundleError::DuplicateKey(key.to_string())),
            btree_map::Entry::Vacant(slot) => Ok(slot.insert(entry)),
        }
    }

    /// Insert or replace without checks
    pub fn insert(&mut self, key: String, entry: BundleEntry) {
        self.entries.insert(key, entry);
    }

    /// Remove and return the entry for `key`
    pub fn remove(&mut self, key: &str) -> Option<BundleEntry> {
        self.entries.remove(key)
    }

    /// Entry of a partitioned tensor, created on first use.
    ///
    /// Repeat calls must agree on `dtype` and `shape`.
    pub fn sliced_entry(
        &mut self,
        key: &str,
        dtype: DataType,
        shape: &[u64],
    ) -> Result<&mut BundleEntry> {
        if key == HEADER_ENTRY_KEY {
            return Err(BundleError::ReservedKey);
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| BundleEntry::new(dtype, shape));
        if entry.dtype != dtype {
            return Err(BundleError::InvalidArgument(format!(
                "slice of '{key}' has type {dtype}, tensor has {}",
                entry.dtype
            )));
        }
        if entry.shape != shape {
            return Err(BundleError::InvalidArgument(format!(
                "slice of '{key}' declares shape {shape:?}, tensor has {:?}",
                entry.shape
            )));
        }
        Ok(entry)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BundleEntry)> {
        self.entries.iter()
    }

    /// Write the header and every entry, in key order, then close the table
    pub fn write_table(&self, mut builder: TableBuilder, header: &BundleHeader) -> Result<u64> {
        builder.add(HEADER_ENTRY_KEY, &header.encode()?)?;
        for (key, entry) in &self.entries {
            builder.add(key, &entry.encode()?)?;
        }
        builder.finish()
    }
}

impl IntoIterator for EntryCatalog {
    type Item = (String, BundleEntry);
    type IntoIter = btree_map::IntoIter<String, BundleEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
