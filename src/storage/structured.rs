//! Structured file I/O for the index binary formats.
//!
//! All index files share a small set of primitives: fixed 4-byte big-endian
//! ints, fixed 8-byte big-endian longs, 7-bit variable-length integers, and
//! strings prefixed by their character count. [`StructWriter`] and
//! [`StructReader`] wrap storage streams with these primitives.
//!
//! A [`StructReader`] can also be a *window* into a larger file: compound
//! segment files concatenate member files, and a window makes member
//! offsets behave like positions in a standalone file.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::SeekFrom;

use crate::error::{KontosError, Result};
use crate::storage::traits::{StorageInput, StorageOutput};
use crate::util::varint;

/// A structured writer over a storage output stream.
#[derive(Debug)]
pub struct StructWriter {
    output: Box<dyn StorageOutput>,
    position: u64,
}

impl StructWriter {
    /// Create a new structured writer positioned at the start of the file.
    pub fn new(output: Box<dyn StorageOutput>) -> Self {
        StructWriter {
            output,
            position: 0,
        }
    }

    /// Write a single byte.
    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.output.write_u8(value)?;
        self.position += 1;
        Ok(())
    }

    /// Write a 4-byte big-endian integer.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.output.write_u32::<BigEndian>(value)?;
        self.position += 4;
        Ok(())
    }

    /// Write an 8-byte big-endian integer.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.output.write_u64::<BigEndian>(value)?;
        self.position += 8;
        Ok(())
    }

    /// Write an 8-byte big-endian signed integer.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    /// Write a variable-length integer.
    pub fn write_vint(&mut self, value: u32) -> Result<()> {
        let written = varint::write_u32(&mut self.output, value)?;
        self.position += written as u64;
        Ok(())
    }

    /// Write a variable-length long.
    pub fn write_vlong(&mut self, value: u64) -> Result<()> {
        let written = varint::write_u64(&mut self.output, value)?;
        self.position += written as u64;
        Ok(())
    }

    /// Write a string: character count as a VInt, then the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_vint(value.chars().count() as u32)?;
        self.write_bytes(value.as_bytes())
    }

    /// Write a binary blob: byte length as a VInt, then the raw bytes.
    pub fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_vint(value.len() as u32)?;
        self.write_bytes(value)
    }

    /// Write raw bytes without a length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.output.write_all(value)?;
        self.position += value.len() as u64;
        Ok(())
    }

    /// Current position in the file.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Seek to an absolute position, e.g. to patch a previously written
    /// placeholder.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.output.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Flush buffered data to storage.
    pub fn flush(&mut self) -> Result<()> {
        use std::io::Write;
        self.output.flush()?;
        Ok(())
    }

    /// Flush and close the writer.
    pub fn close(mut self) -> Result<()> {
        self.output.close()
    }
}

/// A structured reader over a storage input stream, optionally windowed
/// into a region of a larger file.
#[derive(Debug)]
pub struct StructReader {
    input: Box<dyn StorageInput>,
    base: u64,
    length: u64,
    position: u64,
}

impl StructReader {
    /// Create a reader over a whole file.
    pub fn new(input: Box<dyn StorageInput>) -> Result<Self> {
        let length = input.size()?;
        let mut reader = StructReader {
            input,
            base: 0,
            length,
            position: 0,
        };
        reader.seek_to(0)?;
        Ok(reader)
    }

    /// Create a reader windowed into `[base, base + length)` of the file.
    pub fn window(input: Box<dyn StorageInput>, base: u64, length: u64) -> Result<Self> {
        let mut reader = StructReader {
            input,
            base,
            length,
            position: 0,
        };
        reader.seek_to(0)?;
        Ok(reader)
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        let value = self.input.read_u8()?;
        self.position += 1;
        Ok(value)
    }

    /// Read a 4-byte big-endian integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.input.read_u32::<BigEndian>()?;
        self.position += 4;
        Ok(value)
    }

    /// Read an 8-byte big-endian integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.input.read_u64::<BigEndian>()?;
        self.position += 8;
        Ok(value)
    }

    /// Read an 8-byte big-endian signed integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a variable-length integer.
    pub fn read_vint(&mut self) -> Result<u32> {
        let mut result = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.read_byte()?;

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

    /// Read a variable-length long.
    pub fn read_vlong(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;

        loop {
            let byte = self.read_byte()?;

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

    /// Read a string written by [`StructWriter::write_string`].
    ///
    /// The length prefix counts characters; multi-byte UTF-8 sequences are
    /// sized from their lead byte.
    pub fn read_string(&mut self) -> Result<String> {
        let char_count = self.read_vint()? as usize;
        let mut bytes = Vec::with_capacity(char_count);

        for _ in 0..char_count {
            let lead = self.read_byte()?;
            bytes.push(lead);

            let extra = if lead & 0x80 == 0 {
                0
            } else if lead & 0xE0 == 0xC0 {
                1
            } else if lead & 0xF0 == 0xE0 {
                2
            } else {
                3
            };

            for _ in 0..extra {
                bytes.push(self.read_byte()?);
            }
        }

        String::from_utf8(bytes)
            .map_err(|e| KontosError::invalid_file_format(format!("Invalid UTF-8 string: {e}")))
    }

    /// Read a binary blob written by [`StructWriter::write_binary`].
    pub fn read_binary(&mut self) -> Result<Vec<u8>> {
        let length = self.read_vint()? as usize;
        self.read_bytes(length)
    }

    /// Read exactly `length` raw bytes.
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.input.read_exact(&mut bytes)?;
        self.position += length as u64;
        Ok(bytes)
    }

    /// Current position relative to the window start.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Length of the window.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Seek to a position relative to the window start.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.input.seek(SeekFrom::Start(self.base + position))?;
        self.position = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::traits::Storage;

    fn round_trip(write: impl FnOnce(&mut StructWriter), read: impl FnOnce(&mut StructReader)) {
        let storage = MemoryStorage::new();

        let mut writer = StructWriter::new(storage.create_output("test.bin").unwrap());
        write(&mut writer);
        writer.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("test.bin").unwrap()).unwrap();
        read(&mut reader);
    }

    #[test]
    fn test_fixed_width_round_trip() {
        round_trip(
            |w| {
                w.write_byte(0xAB).unwrap();
                w.write_u32(0xFFFF_FFFD).unwrap();
                w.write_u64(0x0123_4567_89AB_CDEF).unwrap();
                w.write_i64(-1).unwrap();
            },
            |r| {
                assert_eq!(r.read_byte().unwrap(), 0xAB);
                assert_eq!(r.read_u32().unwrap(), 0xFFFF_FFFD);
                assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
                assert_eq!(r.read_i64().unwrap(), -1);
            },
        );
    }

    #[test]
    fn test_big_endian_layout() {
        let storage = MemoryStorage::new();

        let mut writer = StructWriter::new(storage.create_output("test.bin").unwrap());
        writer.write_u32(0x0102_0304).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("test.bin").unwrap()).unwrap();
        assert_eq!(reader.read_bytes(4).unwrap(), vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_string_round_trip() {
        round_trip(
            |w| {
                w.write_string("").unwrap();
                w.write_string("hello").unwrap();
                w.write_string("héllo wörld").unwrap();
                w.write_string("日本語テキスト").unwrap();
                w.write_string("mixed 混合 text 𝄞").unwrap();
            },
            |r| {
                assert_eq!(r.read_string().unwrap(), "");
                assert_eq!(r.read_string().unwrap(), "hello");
                assert_eq!(r.read_string().unwrap(), "héllo wörld");
                assert_eq!(r.read_string().unwrap(), "日本語テキスト");
                assert_eq!(r.read_string().unwrap(), "mixed 混合 text 𝄞");
            },
        );
    }

    #[test]
    fn test_binary_round_trip() {
        let blob: Vec<u8> = (0..=255).collect();
        let expected = blob.clone();
        round_trip(
            |w| {
                w.write_binary(&blob).unwrap();
                w.write_binary(&[]).unwrap();
            },
            |r| {
                assert_eq!(r.read_binary().unwrap(), expected);
                assert_eq!(r.read_binary().unwrap(), Vec::<u8>::new());
            },
        );
    }

    #[test]
    fn test_seek_and_patch() {
        let storage = MemoryStorage::new();

        let mut writer = StructWriter::new(storage.create_output("test.bin").unwrap());
        writer.write_u32(0).unwrap(); // placeholder
        writer.write_u32(42).unwrap();
        let end = writer.tell();
        writer.seek_to(0).unwrap();
        writer.write_u32(7).unwrap();
        writer.seek_to(end).unwrap();
        writer.write_u32(99).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("test.bin").unwrap()).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert_eq!(reader.read_u32().unwrap(), 99);
    }

    #[test]
    fn test_window() {
        let storage = MemoryStorage::new();

        let mut writer = StructWriter::new(storage.create_output("test.bin").unwrap());
        writer.write_bytes(b"junkjunk").unwrap();
        writer.write_u32(1234).unwrap();
        writer.write_string("abc").unwrap();
        writer.close().unwrap();

        let input = storage.open_input("test.bin").unwrap();
        let total = input.size().unwrap();
        let mut reader = StructReader::window(input, 8, total - 8).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 1234);
        assert_eq!(reader.read_string().unwrap(), "abc");
        assert_eq!(reader.tell(), 8);

        reader.seek_to(0).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 1234);
    }
}
