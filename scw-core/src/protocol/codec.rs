//! Primitive Byte Codec
//!
//! Encode/decode of fixed-width integers, length-prefixed ANSI and UTF-16
//! strings, and raw byte blobs.
//!
//! # Wire Conventions
//! - Integers are written raw in little-endian order.
//! - ANSI strings are `u32 lengthWithoutNul` followed by that many bytes.
//! - Unicode strings are `u32 byteLengthWithoutNul` followed by UTF-16LE code units.
//! - Blobs are `u32 length` followed by the bytes.
//!
//! Reads are bounds-checked against the buffer; running past the end is a
//! fatal protocol error. There is no partial-read recovery.

use crate::error::{Result, WorkerError};
use std::ffi::CString;

/// Fixed-width value that can be read from and written to the wire.
pub trait WireValue: Sized + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly `SIZE` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding to `out`.
    fn append_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_wire_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline(always)]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw: [u8; std::mem::size_of::<$ty>()] = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline(always)]
                fn append_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_wire_value!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Read cursor over a borrowed byte buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current read offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total buffer size.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Borrow the unread tail without moving the cursor.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Read `len` raw bytes.
    #[track_caller]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end: usize = match self.offset.checked_add(len) {
            Some(end) if end <= self.data.len() => end,
            _ => {
                return Err(WorkerError::protocol(format!(
                    "Read of {} bytes at offset {} runs past end of {} byte buffer",
                    len,
                    self.offset,
                    self.data.len()
                )))
            }
        };
        let bytes: &'a [u8] = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Read one fixed-width value.
    #[track_caller]
    #[inline]
    pub fn read_value<T: WireValue>(&mut self) -> Result<T> {
        let bytes: &[u8] = self.read_bytes(T::SIZE)?;
        Ok(T::from_le_slice(bytes))
    }

    /// Read a `u32` length prefix as a `usize`.
    #[track_caller]
    #[inline]
    pub fn read_length(&mut self) -> Result<usize> {
        let len: u32 = self.read_value()?;
        Ok(len as usize)
    }

    /// Read a length-prefixed ANSI string as raw bytes, without a terminator.
    #[track_caller]
    pub fn read_ansi_bytes(&mut self) -> Result<&'a [u8]> {
        let len: usize = self.read_length()?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed ANSI string.
    ///
    /// Bytes outside UTF-8 are replaced; use [`ByteReader::read_ansi_bytes`]
    /// where the exact bytes matter (shader sources, include bodies).
    #[track_caller]
    pub fn parse_ansi_string(&mut self) -> Result<String> {
        let bytes: &[u8] = self.read_ansi_bytes()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a length-prefixed ANSI string into an owned NUL-terminated buffer.
    ///
    /// `as_bytes_with_nul().len()` is the size including the terminator,
    /// which is what the C entry points of the compilers expect.
    #[track_caller]
    pub fn parse_ansi_cstring(&mut self) -> Result<CString> {
        let bytes: &[u8] = self.read_ansi_bytes()?;
        CString::new(bytes)
            .map_err(|e| WorkerError::protocol(format!("ANSI string has an embedded NUL at byte {}", e.nul_position())))
    }

    /// Read a length-prefixed UTF-16 string as code units.
    #[track_caller]
    pub fn parse_unicode_string(&mut self) -> Result<Vec<u16>> {
        let byte_len: usize = self.read_length()?;
        if byte_len % 2 != 0 {
            return Err(WorkerError::protocol(format!(
                "Unicode string byte length {} is not a multiple of two",
                byte_len
            )));
        }
        let bytes: &[u8] = self.read_bytes(byte_len)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Read a `u8` flag as a bool.
    #[track_caller]
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        let raw: u8 = self.read_value()?;
        Ok(raw != 0)
    }
}

/// Append one fixed-width value.
#[inline]
pub fn write_value<T: WireValue>(out: &mut Vec<u8>, value: T) {
    value.append_le(out);
}

/// Append raw bytes with no prefix.
#[inline]
pub fn write_array(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

/// Append a `u32` length prefix followed by the bytes.
#[inline]
pub fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    write_value(out, bytes.len() as u32);
    write_array(out, bytes);
}

/// Append a length-prefixed ANSI string.
#[inline]
pub fn write_ansi_string(out: &mut Vec<u8>, value: &[u8]) {
    write_blob(out, value);
}

/// Append a length-prefixed UTF-16LE string.
pub fn write_unicode_string(out: &mut Vec<u8>, value: &[u16]) {
    write_value(out, (value.len() * 2) as u32);
    out.reserve(value.len() * 2);
    for unit in value {
        write_value(out, *unit);
    }
}

/// Encode a Rust string as UTF-16 code units.
#[inline]
pub fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().collect()
}
