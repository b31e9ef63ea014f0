//! Bytes wrapper to make sure we create payloads
//! with the correct length.

use bytes::{BufMut, Bytes, BytesMut};
use std::ops::{Deref, DerefMut};

/// Payload wrapper.
///
/// Accumulates the message body; the type tag and the
/// length-inclusive i32 prefix are added on `freeze`.
pub struct Payload {
    bytes: BytesMut,
    tag: char,
}

impl Payload {
    /// Create new tagged payload.
    pub fn named(tag: char) -> Self {
        Self {
            bytes: BytesMut::new(),
            tag,
        }
    }

    pub(crate) fn reserve(&mut self, capacity: usize) {
        self.bytes.reserve(capacity);
    }

    /// Add a C-style string to the payload. It will be NULL-terminated
    /// automatically.
    pub fn put_string(&mut self, string: &str) {
        self.bytes.reserve(string.len() + 1);
        self.bytes.put_slice(string.as_bytes());
        self.bytes.put_u8(0);
    }

    /// Finish assembly and return the final bytes array.
    pub fn freeze(self) -> Bytes {
        let len = self.bytes.len() as i32 + 4; // includes self

        let mut buf = BytesMut::with_capacity(self.bytes.len() + 5);
        buf.put_u8(self.tag as u8);
        buf.put_i32(len);
        buf.put_slice(&self.bytes);

        buf.freeze()
    }
}

impl Deref for Payload {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for Payload {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}
