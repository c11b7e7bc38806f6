//! Variable-length integer encoding utilities.
//!
//! This module provides the 7-bits-per-byte variable-length integer
//! encoding used throughout the index file formats: the low seven bits of
//! each byte carry data, the high bit flags a continuation, and the least
//! significant group comes first.

use crate::error::{KontosError, Result};
use byteorder::ReadBytesExt;
use std::io::{Read, Write};

/// Encode a u32 value using variable-length encoding.
pub fn encode_u32(value: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Write a variable-length encoded u32 to a writer.
///
/// Returns the number of bytes written.
pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<usize> {
    let bytes = encode_u32(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 32 {
            return Err(KontosError::invalid_file_format("VInt overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Write a variable-length encoded u64 to a writer.
///
/// Returns the number of bytes written.
pub fn write_u64<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(KontosError::invalid_file_format("VLong overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_u32() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let encoded = encode_u32(value);
            let mut cursor = Cursor::new(encoded.clone());
            let decoded = read_u32(&mut cursor).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len() as u64, cursor.position());
        }
    }

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let encoded = encode_u64(value);
            let mut cursor = Cursor::new(encoded.clone());
            let decoded = read_u64(&mut cursor).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len() as u64, cursor.position());
        }
    }

    #[test]
    fn test_boundary_values() {
        // Boundary values plus the reserved format markers stored as VInts.
        for value in [
            0u32,
            127,
            128,
            16383,
            0x7FFF_FFFF,
            0xFFFF_FFFD,
            0xFFFF_FFFE,
            0xFFFF_FFFF,
        ] {
            let mut buffer = Vec::new();
            write_u32(&mut buffer, value).unwrap();
            let decoded = read_u32(&mut Cursor::new(buffer)).unwrap();
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_minus_one_as_vint() {
        // -1 written as an unsigned 32-bit VInt is four 0xFF bytes and a 0x0F.
        let encoded = encode_u32(0xFFFF_FFFF);
        assert_eq!(encoded, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u32(0).len(), 1);
        assert_eq!(encode_u32(127).len(), 1);
        assert_eq!(encode_u32(128).len(), 2);
        assert_eq!(encode_u32(16383).len(), 2);
        assert_eq!(encode_u32(16384).len(), 3);

        assert!(encode_u32(u32::MAX).len() <= 5);
        assert!(encode_u64(u64::MAX).len() <= 10);
    }

    #[test]
    fn test_incomplete_varint() {
        // Continuation bit set but no more data.
        let incomplete = vec![0x80];
        assert!(read_u32(&mut Cursor::new(incomplete.clone())).is_err());
        assert!(read_u64(&mut Cursor::new(incomplete)).is_err());
    }

    #[test]
    fn test_overflow() {
        // Too many continuation bytes for a u32.
        let overflow_data = vec![0xFF; 10];
        assert!(read_u32(&mut Cursor::new(overflow_data)).is_err());
    }
}
