//! Immutable sorted key/value table
//!
//! Holds the bundle's metadata. The file is a run of length-prefixed
//! records in strictly ascending key order followed by a fixed footer:
//!
//! ```text
//! [u32 key_len][key][u32 value_len][value] ... [footer]
//! footer = magic(8) + record_count(8) + records_len(8) + masked crc32c(4)
//! ```
//!
//! The table is written once by [`TableBuilder`] and read back whole by
//! [`Table::open`]; metadata tables are small next to shard data.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};

use crate::checksum;
use crate::fs::{RandomAccessFile, WritableFile, read_full};
use crate::{BundleError, Result};

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 28;

/// Trailing table footer
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"TBTABLE\x01")]
struct TableFooter {
    record_count: u64,
    records_len: u64,
    records_crc: u32,
}

/// One key/value record
#[binrw]
#[derive(Debug)]
#[brw(little)]
struct Record {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(key.len()))]
    key_len: u32,
    #[br(count = key_len)]
    key: Vec<u8>,
    #[br(temp)]
    #[bw(try_calc = u32::try_from(value.len()))]
    value_len: u32,
    #[br(count = value_len)]
    value: Vec<u8>,
}

/// Writes a table; keys must arrive in strictly ascending order
pub struct TableBuilder {
    file: Box<dyn WritableFile>,
    last_key: Option<String>,
    record_count: u64,
    records_len: u64,
    crc: u32,
}

impl TableBuilder {
    /// Start a table on an empty file
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            last_key: None,
            record_count: 0,
            records_len: 0,
            crc: 0,
        }
    }

    /// Append a record
    pub fn add(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key
            && key <= last.as_str()
        {
            return Err(BundleError::InvalidArgument(format!(
                "table keys out of order: '{}' after '{}'",
                key.escape_default(),
                last.escape_default()
            )));
        }

        let record = Record {
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
        };
        let mut bytes = Vec::with_capacity(8 + key.len() + value.len());
        record
            .write(&mut Cursor::new(&mut bytes))
            .map_err(|e| BundleError::InvalidArgument(format!("record too large: {e}")))?;

        self.file.append(&bytes)?;
        self.crc = checksum::extend(self.crc, &bytes);
        self.records_len += bytes.len() as u64;
        self.record_count += 1;
        self.last_key = Some(key.to_string());
        Ok(())
    }

    /// Number of records added so far
    pub const fn len(&self) -> u64 {
        self.record_count
    }

    /// Whether no records were added
    pub const fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Write the footer and close the file
    pub fn finish(mut self) -> Result<u64> {
        let footer = TableFooter {
            record_count: self.record_count,
            records_len: self.records_len,
            records_crc: checksum::mask(self.crc),
        };
        let mut bytes = Vec::with_capacity(FOOTER_SIZE);
        footer
            .write(&mut Cursor::new(&mut bytes))
            .map_err(|e| BundleError::CorruptBundle(format!("failed to encode footer: {e}")))?;
        self.file.append(&bytes)?;
        self.file.close()?;
        Ok(self.records_len + FOOTER_SIZE as u64)
    }
}

/// A parsed table
#[derive(Debug, Clone, Default)]
pub struct Table {
    records: Vec<(String, Vec<u8>)>,
}

impl Table {
    /// Read and validate a table of `size` bytes
    pub fn open(file: &mut dyn RandomAccessFile, size: u64) -> Result<Self> {
        let size = usize::try_from(size)
            .map_err(|_| BundleError::CorruptBundle(format!("table size {size} too large")))?;
        if size < FOOTER_SIZE {
            return Err(BundleError::CorruptBundle(format!(
                "table of {size} bytes is shorter than its footer"
            )));
        }

        let mut data = vec![0u8; size];
        read_full(file, 0, &mut data)?;

        let (records, footer_bytes) = data.split_at(size - FOOTER_SIZE);
        let footer = TableFooter::read(&mut Cursor::new(footer_bytes))
            .map_err(|e| BundleError::CorruptBundle(format!("invalid table footer: {e}")))?;

        if footer.records_len != records.len() as u64 {
            return Err(BundleError::CorruptBundle(format!(
                "footer records {} bytes, table holds {}",
                footer.records_len,
                records.len()
            )));
        }
        let actual = checksum::value(records);
        if checksum::unmask(footer.records_crc) != actual {
            return Err(BundleError::CorruptBundle(format!(
                "table checksum mismatch: stored {:08x}, computed {actual:08x}",
                checksum::unmask(footer.records_crc)
            )));
        }

        let mut cursor = Cursor::new(records);
        let mut parsed: Vec<(String, Vec<u8>)> = Vec::new();
        while (cursor.position() as usize) < records.len() {
            let record = Record::read(&mut cursor)
                .map_err(|e| BundleError::CorruptBundle(format!("invalid table record: {e}")))?;
            let key = String::from_utf8(record.key)
                .map_err(|_| BundleError::CorruptBundle("table key is not UTF-8".to_string()))?;
            if let Some((last, _)) = parsed.last()
                && key <= *last
            {
                return Err(BundleError::CorruptBundle(format!(
                    "table keys out of order at '{}'",
                    key.escape_default()
                )));
            }
            parsed.push((key, record.value));
        }

        if parsed.len() as u64 != footer.record_count {
            return Err(BundleError::CorruptBundle(format!(
                "footer records {} entries, table holds {}",
                footer.record_count,
                parsed.len()
            )));
        }

        Ok(Self { records: parsed })
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index of the first record whose key is `>= key`
    pub fn lower_bound(&self, key: &str) -> usize {
        self.records.partition_point(|(k, _)| k.as_str() < key)
    }

    /// Iterator positioned before the first record
    pub const fn iter(self) -> TableIterator {
        TableIterator {
            table: self,
            pos: 0,
        }
    }
}

/// Cursor over a table's records in key order
#[derive(Debug, Clone)]
pub struct TableIterator {
    table: Table,
    pos: usize,
}

impl TableIterator {
    /// Position at the first record whose key is `>= key`
    pub fn seek(&mut self, key: &str) {
        self.pos = self.table.lower_bound(key);
    }

    /// Advance to the next record
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    /// Whether the iterator points at a record
    pub fn valid(&self) -> bool {
        self.pos < self.table.len()
    }

    /// Key of the current record; empty when not valid
    pub fn key(&self) -> &str {
        self.table
            .records
            .get(self.pos)
            .map_or("", |(key, _)| key.as_str())
    }

    /// Value of the current record; empty when not valid
    pub fn value(&self) -> &[u8] {
        self.table
            .records
            .get(self.pos)
            .map(|(_, value)| value.as_slice())
            .unwrap_or_default()
    }

    /// Underlying table
    pub const fn table(&self) -> &Table {
        &self.table
    }
}
