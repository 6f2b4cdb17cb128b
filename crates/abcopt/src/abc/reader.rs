//! Cursor over an ABC byte buffer.

use crate::error::AbcError;
use anyhow::Result;
use tracing::warn;

/// Little-endian reader with ABC's variable-length integer encodings.
///
/// Every read is bounds checked; running off the end of the buffer is a
/// format error.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pub pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(AbcError::format(format!(
                "unexpected end of input at offset {}",
                self.pos
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let lo = self.read_u8()? as u16;
        let hi = self.read_u8()? as u16;
        Ok(lo | hi << 8)
    }

    /// Signed 24-bit value: low 16 bits unsigned, high byte sign-extended.
    pub fn read_s24(&mut self) -> Result<i32> {
        let lo = self.read_u16()? as i32;
        let hi = self.read_u8()? as i8 as i32;
        Ok(lo | hi << 16)
    }

    /// Variable-length integer, 1–5 bytes, seven payload bits per byte.
    ///
    /// The fifth byte contributes its low four bits at position 28, so the
    /// full 32-bit range comes back (signed pool entries rely on this).
    pub fn read_u30(&mut self) -> Result<u32> {
        let mut result = self.read_u8()? as u32;
        if result & 0x80 == 0 {
            return Ok(result);
        }
        result = (result & 0x7f) | (self.read_u8()? as u32) << 7;
        if result & 0x4000 == 0 {
            return Ok(result);
        }
        result = (result & 0x3fff) | (self.read_u8()? as u32) << 14;
        if result & 0x20_0000 == 0 {
            return Ok(result);
        }
        result = (result & 0x1f_ffff) | (self.read_u8()? as u32) << 21;
        if result & 0x1000_0000 == 0 {
            return Ok(result);
        }
        Ok((result & 0x0fff_ffff) | (self.read_u8()? as u32) << 28)
    }

    /// A u30 used as a count or index.
    pub fn read_index(&mut self) -> Result<usize> {
        Ok(self.read_u30()? as usize)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let lo = self.read_u16()? as u32;
        let hi = self.read_u16()? as u32;
        Ok(lo | hi << 16)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let lo = self.read_u32()? as u64;
        let hi = self.read_u32()? as u64;
        Ok(f64::from_bits(lo | hi << 32))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                AbcError::format(format!(
                    "{} byte read at offset {} runs past end of input",
                    len, self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_index()?;
        let at = self.pos;
        let bytes = self.read_bytes(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(e) => {
                warn!(offset = at, error = %e, "string is not valid UTF-8, replacing bad bytes");
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, AbcError};

    #[test]
    fn u30_single_and_multi_byte() {
        let mut r = Reader::new(&[0x7f, 0x80, 0x01, 0xff, 0xff, 0x03]);
        assert_eq!(r.read_u30().unwrap(), 127);
        assert_eq!(r.read_u30().unwrap(), 128);
        assert_eq!(r.read_u30().unwrap(), 0xffff);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn u30_five_bytes_yields_full_word() {
        let mut r = Reader::new(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(r.read_u30().unwrap() as i32, -1);
    }

    #[test]
    fn s24_sign_extends() {
        let mut r = Reader::new(&[0xfe, 0xff, 0xff, 0x10, 0x00, 0x00]);
        assert_eq!(r.read_s24().unwrap(), -2);
        assert_eq!(r.read_s24().unwrap(), 16);
    }

    #[test]
    fn f64_is_little_endian() {
        let bytes = 1.5f64.to_le_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_f64().unwrap(), 1.5);
    }

    #[test]
    fn invalid_utf8_strings_are_replaced() {
        let mut r = Reader::new(&[3, b'a', 0xff, b'b']);
        assert_eq!(r.read_string().unwrap(), "a\u{fffd}b");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncation_is_a_format_error() {
        let mut r = Reader::new(&[0x80]);
        let err = r.read_u30().unwrap_err();
        assert!(matches!(classify(&err), Some(AbcError::Format(_))));
    }
}
