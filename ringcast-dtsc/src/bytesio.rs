//! Cursor-style big-endian readers and writers over [`bytes`] buffers.

use byteorder::ByteOrder;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum BytesReadErrorValue {
    #[error("not enough bytes to read")]
    NotEnoughBytes,
    #[error("index out of range")]
    IndexOutOfRange,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct BytesReadError {
    pub value: BytesReadErrorValue,
}

impl From<BytesReadErrorValue> for BytesReadError {
    fn from(value: BytesReadErrorValue) -> Self {
        Self { value }
    }
}

/// Consumes typed values from the front of a [`BytesMut`].
pub struct BytesReader {
    buffer: BytesMut,
}

impl BytesReader {
    #[must_use]
    pub fn new(buffer: BytesMut) -> Self {
        Self { buffer }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Looks at the next `n` bytes without consuming them.
    #[must_use]
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.buffer.len() >= n {
            Some(&self.buffer[..n])
        } else {
            None
        }
    }

    pub fn advance(&mut self, n: usize) -> Result<(), BytesReadError> {
        if self.buffer.len() < n {
            return Err(BytesReadErrorValue::NotEnoughBytes.into());
        }
        let _ = self.buffer.split_to(n);
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<BytesMut, BytesReadError> {
        if self.buffer.len() < n {
            return Err(BytesReadErrorValue::NotEnoughBytes.into());
        }
        Ok(self.buffer.split_to(n))
    }

    pub fn read_u8(&mut self) -> Result<u8, BytesReadError> {
        let b = self.read_bytes(1)?;
        Ok(b[0])
    }

    pub fn read_u16<T: ByteOrder>(&mut self) -> Result<u16, BytesReadError> {
        let b = self.read_bytes(2)?;
        Ok(T::read_u16(&b))
    }

    pub fn read_u32<T: ByteOrder>(&mut self) -> Result<u32, BytesReadError> {
        let b = self.read_bytes(4)?;
        Ok(T::read_u32(&b))
    }

    pub fn read_u64<T: ByteOrder>(&mut self) -> Result<u64, BytesReadError> {
        let b = self.read_bytes(8)?;
        Ok(T::read_u64(&b))
    }

    #[must_use]
    pub fn extract_remaining_bytes(&mut self) -> BytesMut {
        self.buffer.split_to(self.buffer.len())
    }
}

/// Appends typed values to a growable buffer.
#[derive(Default)]
pub struct BytesWriter {
    bytes: BytesMut,
}

impl BytesWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.bytes.put_slice(data);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.bytes.put_u8(v);
    }

    pub fn write_u16<T: ByteOrder>(&mut self, v: u16) {
        let mut b = [0u8; 2];
        T::write_u16(&mut b, v);
        self.bytes.put_slice(&b);
    }

    pub fn write_u32<T: ByteOrder>(&mut self, v: u32) {
        let mut b = [0u8; 4];
        T::write_u32(&mut b, v);
        self.bytes.put_slice(&b);
    }

    pub fn write_u64<T: ByteOrder>(&mut self, v: u64) {
        let mut b = [0u8; 8];
        T::write_u64(&mut b, v);
        self.bytes.put_slice(&b);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.bytes.freeze()
    }

    #[must_use]
    pub fn extract_current_bytes(&mut self) -> BytesMut {
        self.bytes.split_to(self.bytes.len())
    }
}
