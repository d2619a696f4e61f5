//! Little-endian encoder used by [`crate::Module::encode`] and the builder.

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    /// Empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consume the writer
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Append raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append one byte
    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    /// Append a u16
    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Append a u32
    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Append a u64
    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Append an i64
    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Append an f64 by bit pattern
    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    /// Append a `0`/`1` flag
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    /// Append a length-prefixed string
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Append a collection count
    pub fn write_count(&mut self, n: usize) {
        self.write_u32(n as u32);
    }

    /// Append a length-prefixed section whose body is produced by `body`
    pub fn write_section(&mut self, body: impl FnOnce(&mut ByteWriter)) {
        let mut inner = ByteWriter::new();
        body(&mut inner);
        self.write_u32(inner.len() as u32);
        self.write_bytes(&inner.bytes);
    }

    /// Overwrite four bytes at `at` with `v`
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}
