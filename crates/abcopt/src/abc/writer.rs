//! Growable output buffer for ABC serialization.

/// Byte sink mirroring [`Reader`](super::reader::Reader)'s encodings.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_s24(&mut self, v: i32) {
        let b = v.to_le_bytes();
        self.buf.extend_from_slice(&b[..3]);
    }

    pub fn write_u30(&mut self, v: u32) {
        if v < 0x80 {
            self.buf.push(v as u8);
        } else if v < 0x4000 {
            self.buf.push((v & 0x7f | 0x80) as u8);
            self.buf.push((v >> 7) as u8);
        } else if v < 0x20_0000 {
            self.buf.push((v & 0x7f | 0x80) as u8);
            self.buf.push((v >> 7 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 14) as u8);
        } else if v < 0x1000_0000 {
            self.buf.push((v & 0x7f | 0x80) as u8);
            self.buf.push((v >> 7 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 14 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 21) as u8);
        } else {
            self.buf.push((v & 0x7f | 0x80) as u8);
            self.buf.push((v >> 7 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 14 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 21 & 0x7f | 0x80) as u8);
            self.buf.push((v >> 28) as u8);
        }
    }

    /// Convenience for indices and counts.
    pub fn write_index(&mut self, v: usize) {
        self.write_u30(v as u32);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_index(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Encoded width of `v` as a u30.
pub fn size_of_u30(v: u32) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::reader::Reader;

    #[test]
    fn u30_widths_match_size_of() {
        for v in [0u32, 127, 128, 16383, 16384, 2_097_151, 2_097_152, 0x0fff_ffff, 0x1000_0000, u32::MAX] {
            let mut w = Writer::new();
            w.write_u30(v);
            assert_eq!(w.len(), size_of_u30(v), "width of {}", v);
            assert_eq!(Reader::new(w.as_bytes()).read_u30().unwrap(), v);
        }
    }

    #[test]
    fn negative_values_take_five_bytes() {
        let mut w = Writer::new();
        w.write_u30(-5i32 as u32);
        assert_eq!(w.len(), 5);
        assert_eq!(Reader::new(w.as_bytes()).read_u30().unwrap() as i32, -5);
    }

    #[test]
    fn s24_keeps_sign() {
        let mut w = Writer::new();
        w.write_s24(-300);
        assert_eq!(w.len(), 3);
        assert_eq!(Reader::new(w.as_bytes()).read_s24().unwrap(), -300);
    }

    #[test]
    fn strings_are_byte_length_prefixed() {
        let mut w = Writer::new();
        w.write_string("é");
        assert_eq!(w.as_bytes(), &[2, 0xc3, 0xa9]);
    }
}
