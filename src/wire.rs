//! Primitive marshalling for the VMGR wire protocol.
//!
//! Every message body is a flat sequence of fixed-width big-endian integers
//! and NUL-terminated strings. This layer only moves primitives through a
//! byte cursor; framing lives in `protocol`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated while reading {context}")]
    Truncated { context: &'static str },
    #[error("string field exceeds {max} bytes")]
    StringTooLong { max: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Append-only encoder. The buffer grows as needed; truncation only ever
/// happens at the protocol boundary, never here.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// NUL-terminated string.
    pub fn put_string(&mut self, value: &str) {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// Raw opaque range, used when a handler pre-serializes a reply body.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Decoding cursor over a received message body.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated { context });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8, "i64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    /// Reads a NUL-terminated string of at most `max - 1` bytes. A longer
    /// field is a protocol error, never a silent truncation.
    pub fn get_string(&mut self, max: usize) -> Result<String, WireError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::Truncated { context: "string" })?;
        if nul + 1 > max {
            return Err(WireError::StringTooLong { max });
        }
        let value = std::str::from_utf8(&rest[..nul]).map_err(|_| WireError::InvalidUtf8)?;
        self.pos += nul + 1;
        Ok(value.to_string())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n, "bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip() {
        let mut w = WireWriter::new();
        w.put_u16(0xBEEF);
        w.put_i32(-77);
        w.put_u32(u32::MAX);
        w.put_u64(1 << 40);
        w.put_i64(i64::MIN);
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_i32().unwrap(), -77);
        assert_eq!(r.get_u32().unwrap(), u32::MAX);
        assert_eq!(r.get_u64().unwrap(), 1 << 40);
        assert_eq!(r.get_i64().unwrap(), i64::MIN);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn strings_round_trip_at_max_length() {
        // 6 characters + NUL exactly fills a 7-byte receive buffer.
        let vid = "VID001";
        let mut w = WireWriter::new();
        w.put_string(vid);
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_string(vid.len() + 1).unwrap(), vid);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut w = WireWriter::new();
        w.put_string("TOOLONG");
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(
            r.get_string(4).unwrap_err(),
            WireError::StringTooLong { max: 4 }
        );
    }

    #[test]
    fn missing_terminator_is_truncation() {
        let mut r = WireReader::new(b"abc");
        assert!(matches!(
            r.get_string(16).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }

    #[test]
    fn short_buffer_reports_truncation() {
        let mut r = WireReader::new(&[0u8; 3]);
        assert!(matches!(
            r.get_u32().unwrap_err(),
            WireError::Truncated { .. }
        ));
    }

    #[test]
    fn empty_string_round_trips() {
        let mut w = WireWriter::new();
        w.put_string("");
        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.get_string(8).unwrap(), "");
    }
}
