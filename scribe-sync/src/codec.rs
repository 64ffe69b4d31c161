//! lib0-compatible binary codec for the sync wire protocol.
//!
//! Wire primitives:
//! ```text
//! VarUint        := 7-bit groups, least significant first, 0x80 = continue
//! VarUint8Array  := VarUint(len) bytes[len]
//! VarString      := VarUint8Array(utf8 bytes)
//! ```
//!
//! The same encoding is used by every yjs peer, so messages produced here
//! are readable by any compliant client.

use thiserror::Error;

/// Codec errors. Decoding never silently truncates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,
    #[error("variable-length integer exceeds 64 bits")]
    VarIntOverflow,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
}

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Write an unsigned integer as a variable-length integer.
    pub fn write_var_uint(&mut self, mut n: u64) {
        while n >= 0x80 {
            self.buf.push((n as u8 & 0x7F) | 0x80);
            n >>= 7;
        }
        self.buf.push(n as u8);
    }

    /// Write a length-prefixed byte array.
    pub fn write_var_u8_array(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_u8_array(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn to_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an input buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether unread bytes remain.
    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEnd)?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEnd);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a variable-length unsigned integer.
    pub fn read_var_uint(&mut self) -> Result<u64, CodecError> {
        let mut n: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let group = (byte & 0x7F) as u64;
            if shift == 63 && group > 1 {
                return Err(CodecError::VarIntOverflow);
            }
            n |= group << shift;
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarIntOverflow);
            }
        }
    }

    /// Read a length-prefixed byte array, borrowing from the input.
    pub fn read_var_u8_array(&mut self) -> Result<&'a [u8], CodecError> {
        let len = usize::try_from(self.read_var_uint()?).map_err(|_| CodecError::UnexpectedEnd)?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_var_string(&mut self) -> Result<&'a str, CodecError> {
        let bytes = self.read_var_u8_array()?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_uint(n: u64) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_uint(n);
        enc.to_vec()
    }

    #[test]
    fn test_var_uint_known_encodings() {
        assert_eq!(encode_uint(0), vec![0x00]);
        assert_eq!(encode_uint(1), vec![0x01]);
        assert_eq!(encode_uint(127), vec![0x7F]);
        assert_eq!(encode_uint(128), vec![0x80, 0x01]);
        assert_eq!(encode_uint(300), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_var_uint_boundaries() {
        for n in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let bytes = encode_uint(n);
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.read_var_uint().unwrap(), n);
            assert!(!dec.has_content());
        }
    }

    #[test]
    fn test_var_uint_truncated() {
        let mut dec = Decoder::new(&[0x80, 0x80]);
        assert_eq!(dec.read_var_uint(), Err(CodecError::UnexpectedEnd));

        let mut empty = Decoder::new(&[]);
        assert_eq!(empty.read_var_uint(), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_var_uint_overflow() {
        let bytes = [0xFF; 11];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_uint(), Err(CodecError::VarIntOverflow));
    }

    #[test]
    fn test_var_u8_array_sequence() {
        let mut enc = Encoder::new();
        enc.write_var_u8_array(&[1, 2, 3]);
        enc.write_var_u8_array(&[]);
        enc.write_var_u8_array(&vec![9u8; 300]);
        let bytes = enc.to_vec();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_u8_array().unwrap(), &[1, 2, 3]);
        assert!(dec.read_var_u8_array().unwrap().is_empty());
        assert_eq!(dec.read_var_u8_array().unwrap().len(), 300);
        assert!(!dec.has_content());
    }

    #[test]
    fn test_var_u8_array_truncated_payload() {
        // Declares 5 bytes, carries 2
        let mut dec = Decoder::new(&[5, 1, 2]);
        assert_eq!(dec.read_var_u8_array(), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_var_string() {
        let mut enc = Encoder::new();
        enc.write_var_string("héllo");
        let bytes = enc.to_vec();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_string().unwrap(), "héllo");
    }

    #[test]
    fn test_read_bytes_tracks_remaining() {
        let mut dec = Decoder::new(&[1, 2, 3, 4]);
        assert_eq!(dec.remaining(), 4);
        assert_eq!(dec.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(dec.remaining(), 1);
        assert_eq!(dec.read_bytes(2), Err(CodecError::UnexpectedEnd));
        assert_eq!(dec.read_u8().unwrap(), 4);
        assert!(!dec.has_content());
    }

    #[test]
    fn test_var_string_invalid_utf8() {
        let mut enc = Encoder::new();
        enc.write_var_u8_array(&[0xC3, 0x28]);
        let bytes = enc.to_vec();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_string(), Err(CodecError::InvalidUtf8));
    }
}
