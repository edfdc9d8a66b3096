// citron-core - Binary serialization primitives
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Little-endian byte writer/reader used by the module and snapshot formats.

use std::fmt;

/// Error while reading a binary blob.
#[derive(Debug, Clone)]
pub struct ReadError {
    pub message: String,
}

impl ReadError {
    pub fn new(message: impl Into<String>) -> Self {
        ReadError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Read error: {}", self.message)
    }
}

impl std::error::Error for ReadError {}

pub type ReadResult<T> = Result<T, ReadError>;

/// Append-only little-endian writer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

macro_rules! write_fns {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.buffer.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    write_fns! {
        write_u8: u8,
        write_u16: u16,
        write_u32: u32,
        write_u64: u64,
        write_i64: i64,
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, text: &str) {
        self.write_u32(text.len() as u32);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Little-endian reader over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

macro_rules! read_fns {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> ReadResult<$ty> {
                const SIZE: usize = std::mem::size_of::<$ty>();
                let slice = self.take(SIZE)?;
                Ok(<$ty>::from_le_bytes(slice.try_into().unwrap()))
            }
        )*
    };
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, position: 0 }
    }

    fn take(&mut self, count: usize) -> ReadResult<&'a [u8]> {
        if self.position + count > self.bytes.len() {
            return Err(ReadError::new("unexpected end of data"));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    read_fns! {
        read_u8: u8,
        read_u16: u16,
        read_u32: u32,
        read_u64: u64,
        read_i64: i64,
    }

    pub fn read_str(&mut self) -> ReadResult<String> {
        let length = self.read_u32()? as usize;
        let slice = self.take(length)?;
        String::from_utf8(slice.to_vec())
            .map_err(|_| ReadError::new("invalid UTF-8 in string"))
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.write_u8(0xab);
        writer.write_u16(0x1234);
        writer.write_u32(0xdead_beef);
        writer.write_u64(0x0102_0304_0506_0708);
        writer.write_i64(-42);
        writer.write_str("hello");

        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0xab);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_str().unwrap(), "hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_fails() {
        let bytes = [1u8, 2];
        let mut reader = ByteReader::new(&bytes);
        assert!(reader.read_u32().is_err());
    }
}
