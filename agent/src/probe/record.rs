//! Decoding of raw kernel records
//!
//! Records are fixed-width and little-endian. Each instrumentation declares
//! its record type by implementing [`RawEvent`].

use bytes::Buf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: need {need} bytes, got {got}")]
    Short { need: usize, got: usize },
}

/// A record type emitted by a kernel program
pub trait RawEvent: Sized + Send + 'static {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from a payload of at least [`SIZE`](Self::SIZE) bytes.
    /// Trailing bytes are ignored.
    fn decode(raw: &[u8]) -> Result<Self, DecodeError>;
}

/// Little-endian field reader over a payload whose length was checked up
/// front
pub struct LeReader<'a> {
    buf: &'a [u8],
}

impl<'a> LeReader<'a> {
    /// Wrap `raw`, failing unless it holds at least `need` bytes
    pub fn new(raw: &'a [u8], need: usize) -> Result<Self, DecodeError> {
        if raw.len() < need {
            return Err(DecodeError::Short {
                need,
                got: raw.len(),
            });
        }
        Ok(Self { buf: raw })
    }

    pub fn u64(&mut self) -> u64 {
        self.buf.get_u64_le()
    }

    pub fn u32(&mut self) -> u32 {
        self.buf.get_u32_le()
    }

    pub fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        out
    }
}

/// String from a NUL-padded byte array, lossily converted
pub fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
