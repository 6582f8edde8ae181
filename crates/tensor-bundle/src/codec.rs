//! Payload encoding per element kind
//!
//! Each [`ElementKind`] supplies its own encode and decode routine:
//!
//! - **Fixed**: raw element bytes; the checksum covers them as stored
//! - **String**: `varint len*`, then a masked checksum of the lengths, then
//!   every string's bytes. The running checksum is extended over each length
//!   as a `u32` (or a `u64` when it does not fit), not over the varint bytes
//! - **Variant**: per element `varint len | bytes | masked running crc`; the
//!   checksum is extended over the length as a `u64`
//!
//! Fixed-width integers embedded in string and variant payloads use the
//! writer's byte order.

use crate::buffer::ChecksumBuffer;
use crate::checksum;
use crate::dtype::{ElementKind, swap_bytes_in_place};
use crate::entry::Endianness;
use crate::fs::{RandomAccessFile, read_full};
use crate::tensor::{Tensor, TensorData};
use crate::varint::{self, MAX_VARINT64_LEN};
use crate::{BundleError, Result};

/// Append `tensor`'s payload to `out` and return its unmasked checksum.
///
/// The caller resets the buffer checksum before calling.
pub fn encode(tensor: &Tensor, order: Endianness, out: &mut ChecksumBuffer) -> Result<u32> {
    match (tensor.dtype().kind(), tensor.data()) {
        (ElementKind::Fixed { swap_unit, .. }, TensorData::Bytes(bytes)) => {
            encode_fixed(bytes, swap_unit, order, out)?;
            Ok(out.crc())
        }
        (ElementKind::String, TensorData::Strings(items)) => encode_strings(items, order, out),
        (ElementKind::Variant, TensorData::Variants(items)) => encode_variants(items, order, out),
        (kind, _) => Err(BundleError::InvalidArgument(format!(
            "{} tensor does not hold {kind:?} storage",
            tensor.dtype()
        ))),
    }
}

/// Append host-order fixed-width bytes in `order`
pub fn encode_fixed(
    bytes: &[u8],
    swap_unit: usize,
    order: Endianness,
    out: &mut ChecksumBuffer,
) -> Result<()> {
    if order.needs_swap() && swap_unit > 1 {
        let mut swapped = bytes.to_vec();
        swap_bytes_in_place(&mut swapped, swap_unit);
        out.append(&swapped)
    } else {
        out.append(bytes)
    }
}

fn length_bytes(len: u64, order: Endianness) -> Vec<u8> {
    match u32::try_from(len) {
        Ok(len32) => order.u32_bytes(len32).to_vec(),
        Err(_) => order.u64_bytes(len).to_vec(),
    }
}

fn encode_strings(items: &[Vec<u8>], order: Endianness, out: &mut ChecksumBuffer) -> Result<u32> {
    let mut crc = 0u32;
    let mut lengths = Vec::with_capacity(items.len());
    for item in items {
        let len = item.len() as u64;
        varint::write_varint64(len, &mut lengths);
        crc = checksum::extend(crc, &length_bytes(len, order));
    }
    out.append(&lengths)?;

    let length_crc = order.u32_bytes(checksum::mask(crc));
    out.append(&length_crc)?;
    crc = checksum::extend(crc, &length_crc);

    for item in items {
        out.append(item)?;
        crc = checksum::extend(crc, item);
    }
    Ok(crc)
}

fn encode_variants(items: &[Vec<u8>], order: Endianness, out: &mut ChecksumBuffer) -> Result<u32> {
    let mut crc = 0u32;
    let mut len_buf = Vec::with_capacity(MAX_VARINT64_LEN);
    for item in items {
        let len = item.len() as u64;
        len_buf.clear();
        varint::write_varint64(len, &mut len_buf);
        out.append(&len_buf)?;
        crc = checksum::extend(crc, &order.u64_bytes(len));

        out.append(item)?;
        crc = checksum::extend(crc, item);

        let element_crc = order.u32_bytes(checksum::mask(crc));
        out.append(&element_crc)?;
        crc = checksum::extend(crc, &element_crc);
    }
    Ok(crc)
}

/// Decode `count` strings; returns the strings and the running checksum.
///
/// `limit` bounds the total payload bytes consumed.
pub fn decode_strings(
    input: &mut InputBuffer,
    count: usize,
    order: Endianness,
    limit: u64,
) -> Result<(Vec<Vec<u8>>, u32)> {
    let mut crc = 0u32;
    let mut lengths = Vec::with_capacity(count);
    let mut total = 0u64;
    for _ in 0..count {
        let len = input.read_varint64()?;
        crc = checksum::extend(crc, &length_bytes(len, order));
        total = total.saturating_add(len);
        lengths.push(len);
    }
    if total > limit {
        return Err(BundleError::DataCorruption(format!(
            "string lengths sum to {total} bytes, payload holds {limit}"
        )));
    }

    let mut stored = [0u8; 4];
    input.read_exact(&mut stored)?;
    let expected = checksum::unmask(order.read_u32(stored));
    if expected != crc {
        return Err(BundleError::DataCorruption(format!(
            "checksum of string lengths mismatch: stored {expected:08x}, computed {crc:08x}"
        )));
    }
    crc = checksum::extend(crc, &stored);

    let mut items = Vec::with_capacity(count);
    for len in lengths {
        // `total <= limit` bounds every length, so the cast cannot truncate
        let mut item = vec![0u8; len as usize];
        input.read_exact(&mut item)?;
        crc = checksum::extend(crc, &item);
        items.push(item);
    }
    Ok((items, crc))
}

/// Decode `count` variant elements, verifying each embedded checksum
pub fn decode_variants(
    input: &mut InputBuffer,
    count: usize,
    order: Endianness,
    limit: u64,
    key: &str,
) -> Result<(Vec<Vec<u8>>, u32)> {
    if order.needs_swap() {
        return Err(BundleError::Unimplemented(format!(
            "byte swapping variant value '{key}'"
        )));
    }

    let mut crc = 0u32;
    let mut consumed = 0u64;
    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        let len = input.read_varint64()?;
        consumed = consumed.saturating_add(len);
        if consumed > limit {
            return Err(BundleError::DataCorruption(format!(
                "variant element {index} of '{key}' runs past its payload"
            )));
        }
        crc = checksum::extend(crc, &order.u64_bytes(len));

        let mut item = vec![0u8; len as usize];
        input.read_exact(&mut item)?;
        crc = checksum::extend(crc, &item);

        let mut stored = [0u8; 4];
        input.read_exact(&mut stored)?;
        let expected = checksum::unmask(order.read_u32(stored));
        if expected != crc {
            return Err(BundleError::ChecksumMismatch {
                context: format!("variant element {index} of '{key}'"),
                expected,
                actual: crc,
            });
        }
        crc = checksum::extend(crc, &stored);
        items.push(item);
    }
    Ok((items, crc))
}

/// Buffered sequential reader over a random-access file
pub struct InputBuffer {
    file: Box<dyn RandomAccessFile>,
    capacity: usize,
    buf: Vec<u8>,
    buf_start: u64,
    pos: usize,
}

impl InputBuffer {
    /// Wrap `file` with a read buffer of `capacity` bytes
    pub fn new(file: Box<dyn RandomAccessFile>, capacity: usize) -> Self {
        Self {
            file,
            capacity: capacity.max(1),
            buf: Vec::new(),
            buf_start: 0,
            pos: 0,
        }
    }

    /// File offset of the next byte returned
    pub fn tell(&self) -> u64 {
        self.buf_start + self.pos as u64
    }

    /// Move to `offset`, keeping buffered bytes when they still apply
    pub fn seek(&mut self, offset: u64) {
        let end = self.buf_start + self.buf.len() as u64;
        if (self.buf_start..=end).contains(&offset) {
            self.pos = (offset - self.buf_start) as usize;
        } else {
            self.buf.clear();
            self.buf_start = offset;
            self.pos = 0;
        }
    }

    /// Advance by `bytes`
    pub fn skip(&mut self, bytes: u64) {
        self.seek(self.tell() + bytes);
    }

    /// Fill `out` completely or fail with a data-loss error
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let available = self.buf.len() - self.pos;
            if available == 0 {
                let remaining = out.len() - filled;
                if remaining >= self.capacity {
                    // Large reads bypass the buffer, one capacity-sized piece at a time
                    let take = remaining - remaining % self.capacity;
                    let offset = self.tell();
                    let mut piece_offset = offset;
                    for piece in out[filled..filled + take].chunks_mut(self.capacity) {
                        read_full(self.file.as_mut(), piece_offset, piece)?;
                        piece_offset += piece.len() as u64;
                    }
                    filled += take;
                    self.buf.clear();
                    self.buf_start = offset + take as u64;
                    self.pos = 0;
                    continue;
                }
                self.fill()?;
                continue;
            }
            let take = available.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }

    /// Read one varint64
    pub fn read_varint64(&mut self) -> Result<u64> {
        if let Some((value, used)) = varint::read_varint64(&self.buf[self.pos..]) {
            self.pos += used;
            return Ok(value);
        }

        let mut encoded = Vec::with_capacity(MAX_VARINT64_LEN);
        let mut byte = [0u8; 1];
        while encoded.len() < MAX_VARINT64_LEN {
            self.read_exact(&mut byte)?;
            encoded.push(byte[0]);
            if byte[0] & 0x80 == 0 {
                break;
            }
        }
        varint::read_varint64(&encoded)
            .map(|(value, _)| value)
            .ok_or_else(|| {
                BundleError::DataCorruption(format!("malformed varint at offset {}", self.tell()))
            })
    }

    /// Direct access to the file for reads that bypass the buffer
    pub fn file_mut(&mut self) -> &mut dyn RandomAccessFile {
        self.file.as_mut()
    }

    fn fill(&mut self) -> Result<()> {
        let offset = self.tell();
        self.buf.resize(self.capacity, 0);
        let read = self.file.read_at(offset, &mut self.buf)?;
        self.buf.truncate(read);
        self.buf_start = offset;
        self.pos = 0;
        if read == 0 {
            return Err(BundleError::DataCorruption(format!(
                "unexpected end of file at offset {offset}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dtype::DataType;
    use crate::fs::{FileSystem, LocalFileSystem};
    use tempfile::tempdir;

    fn write_payload(path: &str, tensor: &Tensor, order: Endianness) -> (u64, u32) {
        let fs = LocalFileSystem::new();
        let mut out = ChecksumBuffer::new(fs.open_writable(path).unwrap(), 7);
        let crc = encode(tensor, order, &mut out).unwrap();
        let size = out.position();
        out.close().unwrap();
        (size, crc)
    }

    fn input(path: &str, capacity: usize) -> InputBuffer {
        let fs = LocalFileSystem::new();
        InputBuffer::new(fs.open_random_access(path).unwrap(), capacity)
    }

    #[test]
    fn test_fixed_checksum_covers_stored_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f").to_str().unwrap().to_string();
        let tensor = Tensor::from_values(&[2], &[1u32, 2]).unwrap();

        let other = match Endianness::host() {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        };
        let (size, crc) = write_payload(&path, &tensor, other);
        assert_eq!(size, 8);

        let stored = std::fs::read(&path).unwrap();
        assert_eq!(crc, checksum::value(&stored));
        let mut host = stored.clone();
        swap_bytes_in_place(&mut host, 4);
        assert_eq!(host, tensor.as_bytes().unwrap());
    }

    #[test]
    fn test_strings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s").to_str().unwrap().to_string();
        let strings = vec![b"".to_vec(), b"hello".to_vec(), vec![7u8; 300]];
        let tensor = Tensor::from_strings(&[3], strings.clone()).unwrap();
        let (size, crc) = write_payload(&path, &tensor, Endianness::host());

        let mut reader = input(&path, 16);
        let (decoded, actual) = decode_strings(&mut reader, 3, Endianness::host(), size).unwrap();
        assert_eq!(decoded, strings);
        assert_eq!(actual, crc);
        assert_eq!(reader.tell(), size);
    }

    #[test]
    fn test_variants_detect_element_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v").to_str().unwrap().to_string();
        let items = vec![b"first".to_vec(), b"second".to_vec()];
        let tensor = Tensor::from_variants(&[2], items.clone()).unwrap();
        let (size, crc) = write_payload(&path, &tensor, Endianness::host());

        let mut reader = input(&path, 4);
        let (decoded, actual) =
            decode_variants(&mut reader, 2, Endianness::host(), size, "v").unwrap();
        assert_eq!(decoded, items);
        assert_eq!(actual, crc);

        // Flip a byte of the second element's data
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();
        let mut reader = input(&path, 4);
        let err = decode_variants(&mut reader, 2, Endianness::host(), size, "v").unwrap_err();
        assert!(matches!(err, BundleError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_variants_refuse_swap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v").to_str().unwrap().to_string();
        std::fs::write(&path, b"").unwrap();
        let other = match Endianness::host() {
            Endianness::Little => Endianness::Big,
            Endianness::Big => Endianness::Little,
        };
        let mut reader = input(&path, 4);
        assert!(matches!(
            decode_variants(&mut reader, 1, other, 10, "v"),
            Err(BundleError::Unimplemented(_))
        ));
    }

    #[test]
    fn test_input_buffer_seek_and_large_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b").to_str().unwrap().to_string();
        let data: Vec<u8> = (0..=255u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut reader = input(&path, 10);
        let mut small = [0u8; 3];
        reader.read_exact(&mut small).unwrap();
        assert_eq!(small, [0, 1, 2]);

        let mut large = vec![0u8; 100];
        reader.read_exact(&mut large).unwrap();
        assert_eq!(large, data[3..103]);

        reader.seek(250);
        let mut tail = [0u8; 6];
        reader.read_exact(&mut tail).unwrap();
        assert_eq!(tail, [250, 251, 252, 253, 254, 255]);
        assert!(reader.read_exact(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn test_empty_string_payload_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x").to_str().unwrap().to_string();
        let tensor = Tensor::zeros(DataType::String, &[2]).unwrap();
        let (size, _) = write_payload(&path, &tensor, Endianness::host());
        // Two one-byte varints plus the length checksum
        assert_eq!(size, 6);
    }
}
