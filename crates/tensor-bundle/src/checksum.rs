//! Masked CRC32C helpers
//!
//! Checksums stored in the bundle are masked so that a zeroed field is
//! distinguishable from a real zero checksum, and so that computing the CRC
//! of a string that embeds CRCs does not degenerate.

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC32C of `data`.
pub fn value(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Extend a running CRC32C with `data`.
pub fn extend(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Mask a CRC for storage.
pub const fn mask(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Recover the CRC from a masked value.
pub const fn unmask(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}
