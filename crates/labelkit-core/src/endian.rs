//! Little-endian field access over raw sector bytes
//!
//! On-disk structures are never cast from byte buffers; every field goes through
//! these helpers, which work on unaligned offsets and are independent of host
//! byte order. Callers are expected to have checked the slice length.

/// Read a little-endian u16 at `offset`
#[inline]
pub fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Read a little-endian u32 at `offset`
#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Read a little-endian u64 at `offset`
#[inline]
pub fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Read a big-endian u16 at `offset`
#[inline]
pub fn read_u16_be(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a big-endian u32 at `offset`
#[inline]
pub fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

/// Write a little-endian u16 at `offset`
#[inline]
pub fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u32 at `offset`
#[inline]
pub fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u64 at `offset`
#[inline]
pub fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_reads() {
        let buf = [0xFF, 0x78, 0x56, 0x34, 0x12, 0x00];
        assert_eq!(read_u32_le(&buf, 1), 0x1234_5678);
        assert_eq!(read_u16_le(&buf, 1), 0x5678);
        assert_eq!(read_u16_be(&buf, 1), 0x7856);
    }

    #[test]
    fn test_write_then_read_u64() {
        let mut buf = [0u8; 11];
        write_u64_le(&mut buf, 3, 0x0102_0304_0506_0708);
        assert_eq!(buf[3], 0x08);
        assert_eq!(buf[10], 0x01);
        assert_eq!(read_u64_le(&buf, 3), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_write_u32_is_little_endian() {
        let mut buf = [0u8; 4];
        write_u32_le(&mut buf, 0, 0xAABB_CCDD);
        assert_eq!(buf, [0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(read_u32_be(&buf, 0), 0xDDCC_BBAA);
    }
}
