//! Little-endian cursor over module bytes.

use crate::error::LoadError;

/// Bounds-checked reader; every read past the end is a malformed-module error.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Reader positioned at the start of `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Whether all bytes were consumed
    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        if len > self.remaining() {
            return Err(LoadError::malformed(format!(
                "unexpected end of data at offset {} (need {} bytes, have {})",
                self.position,
                len,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], LoadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a little-endian u16
    pub fn read_u16(&mut self) -> Result<u16, LoadError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self) -> Result<u32, LoadError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u64
    pub fn read_u64(&mut self) -> Result<u64, LoadError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian i64
    pub fn read_i64(&mut self) -> Result<i64, LoadError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read an f64 from its bit pattern
    pub fn read_f64(&mut self) -> Result<f64, LoadError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a `0`/`1` flag byte
    pub fn read_bool(&mut self) -> Result<bool, LoadError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LoadError::malformed(format!(
                "invalid boolean byte {:#04x} at offset {}",
                other,
                self.position - 1
            ))),
        }
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_str(&mut self) -> Result<String, LoadError> {
        let len = self.read_u32()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LoadError::malformed(format!("invalid UTF-8 at offset {}: {}", start, e)))
    }

    /// Read a u32 element count, rejecting counts the remaining data cannot hold
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize, LoadError> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_size) > self.remaining() {
            return Err(LoadError::malformed(format!(
                "element count {} exceeds remaining data at offset {}",
                count, self.position
            )));
        }
        Ok(count)
    }

    /// Read a u32-length-prefixed section and return a reader over its body
    pub fn read_section(&mut self, name: &str) -> Result<ByteReader<'a>, LoadError> {
        let len = self.read_u32()? as usize;
        let body = self
            .read_bytes(len)
            .map_err(|_| LoadError::malformed(format!("{} section length {} overruns the module", name, len)))?;
        Ok(ByteReader::new(body))
    }

    /// Fail unless the reader consumed its whole input
    pub fn finish(&self, name: &str) -> Result<(), LoadError> {
        if self.is_at_end() {
            Ok(())
        } else {
            Err(LoadError::malformed(format!(
                "{} has {} trailing bytes",
                name,
                self.remaining()
            )))
        }
    }
}
