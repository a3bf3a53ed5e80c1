//! Little-endian wire primitives shared by the graph codec.
//!
//! Scalars are fixed width, arrays carry a `u32` element count, and
//! sections are framed as a `u32` tag followed by a `u32` byte length
//! so unknown sections can be skipped.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of payload at byte {0}")]
    Truncated(usize),
    #[error("array of {0} elements exceeds the remaining payload")]
    OversizedArray(u32),
    #[error("unknown node kind tag {0}")]
    UnknownNodeKind(u8),
    #[error("bad graph magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported graph version {0}")]
    UnsupportedVersion(u32),
    #[error("duplicate node id {0}")]
    DuplicateNode(u64),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
    #[error("string is not valid UTF-8")]
    BadString,
}

#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32_array(&mut self, values: &[f32]) {
        self.put_u32(values.len() as u32);
        for v in values {
            self.put_f32(*v);
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Write a `tag` + byte-length framed section. The length is
    /// back-patched once the body closure returns.
    pub fn section(&mut self, tag: u32, body: impl FnOnce(&mut Self)) {
        self.put_u32(tag);
        let len_at = self.buf.len();
        self.put_u32(0);
        body(self);
        let len = (self.buf.len() - len_at - 4) as u32;
        self.buf[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
    }
}

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

    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.take(n).map(|_| ())
    }

    /// A sub-reader over the next `n` bytes, advancing past them.
    pub fn slice(&mut self, n: usize) -> Result<WireReader<'a>, WireError> {
        Ok(WireReader::new(self.take(n)?))
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_f32_array(&mut self) -> Result<Vec<f32>, WireError> {
        let count = self.get_u32()?;
        if count as usize * 4 > self.remaining() {
            return Err(WireError::OversizedArray(count));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.get_f32()?);
        }
        Ok(out)
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let len = self.get_u32()?;
        if len as usize > self.remaining() {
            return Err(WireError::OversizedArray(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadString)
    }
}
