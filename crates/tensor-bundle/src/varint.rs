//! Variable-length 64-bit integers (7 bits per byte, little-endian groups)

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT64_LEN: usize = 10;

/// Append the varint encoding of `value` to `data`
pub fn write_varint64(value: u64, data: &mut Vec<u8>) {
    let mut value = value;

    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Continuation bit
        }

        data.push(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// encoding is truncated or longer than ten bytes.
pub fn read_varint64(data: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    for (i, &byte) in data.iter().take(MAX_VARINT64_LEN).enumerate() {
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Number of bytes needed to encode `value`
pub fn varint64_size(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros()).div_ceil(7) as usize
    }
}
