//! Byte-level helpers and codec errors.
//!
//! All integers are big-endian. Strings and byte blocks are prefixed with
//! their length.

use dvmesh_core::{BaseSubscriptionInfo, TransmitterId};

/// Size of the telegram header: type code plus 16-bit length.
pub const HEADER_LEN: usize = 3;

/// Largest payload a telegram can declare.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Framing violations. Always fatal to the link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The declared payload length disagrees with the fields actually read
    #[error("declared payload length {declared} does not match computed length {computed}")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Length recomputed from the decoded fields
        computed: usize,
    },
    /// The buffer ends before the telegram does
    #[error("truncated telegram: need {needed} more bytes, {available} available")]
    Truncated {
        /// Bytes needed by the next read
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },
    /// The payload cannot be described by a 16-bit length
    #[error("payload of {len} bytes exceeds the 16-bit length field")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
    },
    /// A length-prefixed field is longer than its prefix allows
    #[error("field {field} of {len} bytes exceeds its limit of {max}")]
    FieldTooLarge {
        /// Field name
        field: &'static str,
        /// Actual length
        len: usize,
        /// Largest encodable length
        max: usize,
    },
}

/// Content violations. Fatal to the link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The type code is not in the registry
    #[error("unknown telegram type code {0}")]
    UnknownTypeCode(u8),
    /// A field holds a value outside its domain
    #[error("invalid value {value} for field {field}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },
    /// A string field is not UTF-8
    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field name
        field: &'static str,
    },
}

/// Any error produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Framing violation
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// Content violation
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than `n` bytes remain.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        if self.remaining() < n {
            return Err(FramingError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FramingError> {
        let slice = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Read a `u8`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn u16(&mut self) -> Result<u16, FramingError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `i16`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn i16(&mut self) -> Result<i16, FramingError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn u32(&mut self) -> Result<u32, FramingError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn i32(&mut self) -> Result<i32, FramingError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn u64(&mut self) -> Result<u64, FramingError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Read a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn i64(&mut self) -> Result<i64, FramingError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    /// Read a strict boolean byte.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted or the byte is not 0 or 1.
    pub fn bool(&mut self, field: &'static str) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidValue {
                field,
                value: u64::from(other),
            }
            .into()),
        }
    }

    /// Read a transmitter id.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn transmitter(&mut self) -> Result<TransmitterId, FramingError> {
        Ok(TransmitterId(self.u64()?))
    }

    /// Read an 18-byte channel identity.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn base(&mut self) -> Result<BaseSubscriptionInfo, FramingError> {
        let object_id = self.u64()?;
        let usage_id = self.u64()?;
        let simulation_variant = self.i16()?;
        Ok(BaseSubscriptionInfo::new(object_id, usage_id, simulation_variant))
    }

    /// Read a string with a 16-bit length prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted or the bytes are not UTF-8.
    pub fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = usize::from(self.u16()?);
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field }.into())
    }

    /// Read a byte block with a 16-bit length prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is exhausted.
    pub fn block(&mut self) -> Result<Vec<u8>, FramingError> {
        let len = usize::from(self.u16()?);
        Ok(self.bytes(len)?.to_vec())
    }
}

/// Growable payload buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create a writer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a `u8`.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a boolean as 0 or 1.
    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Append a big-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a big-endian `i16`.
    pub fn put_i16(&mut self, v: i16) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a big-endian `i32`.
    pub fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a big-endian `i64`.
    pub fn put_i64(&mut self, v: i64) {
        self.put_bytes(&v.to_be_bytes());
    }

    /// Append a transmitter id.
    pub fn put_transmitter(&mut self, id: TransmitterId) {
        self.put_u64(id.0);
    }

    /// Append an 18-byte channel identity.
    pub fn put_base(&mut self, base: &BaseSubscriptionInfo) {
        self.put_u64(base.object_id);
        self.put_u64(base.usage_id);
        self.put_i16(base.simulation_variant);
    }

    /// Append a 16-bit length prefix for a field.
    ///
    /// # Errors
    ///
    /// Returns error if `len` does not fit in 16 bits.
    pub fn put_len16(&mut self, field: &'static str, len: usize) -> Result<(), FramingError> {
        let len = u16::try_from(len).map_err(|_| FramingError::FieldTooLarge {
            field,
            len,
            max: usize::from(u16::MAX),
        })?;
        self.put_u16(len);
        Ok(())
    }

    /// Append a string with a 16-bit length prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the string is longer than 65535 bytes.
    pub fn put_string(&mut self, field: &'static str, s: &str) -> Result<(), FramingError> {
        self.put_len16(field, s.len())?;
        self.put_bytes(s.as_bytes());
        Ok(())
    }

    /// Append a byte block with a 16-bit length prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the block is longer than 65535 bytes.
    pub fn put_block(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), FramingError> {
        self.put_len16(field, bytes.len())?;
        self.put_bytes(bytes);
        Ok(())
    }
}

/// Encoded size of a string or byte block with its 16-bit prefix.
#[must_use]
pub const fn prefixed_len(len: usize) -> usize {
    2 + len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut w = WireWriter::default();
        w.put_u16(0x0102);
        w.put_u32(0x0304_0506);
        w.put_i16(-2);

        assert_eq!(w.into_inner(), vec![1, 2, 3, 4, 5, 6, 0xFF, 0xFE]);
    }

    #[test]
    fn base_is_eighteen_bytes() {
        let base = BaseSubscriptionInfo::new(7, 9, -1);
        let mut w = WireWriter::default();
        w.put_base(&base);
        let bytes = w.into_inner();

        assert_eq!(bytes.len(), BaseSubscriptionInfo::ENCODED_LEN);
        assert_eq!(WireReader::new(&bytes).base().unwrap(), base);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = WireReader::new(&[0, 1, 2]);

        assert_eq!(r.u16().unwrap(), 1);
        assert_eq!(
            r.u32(),
            Err(FramingError::Truncated {
                needed: 4,
                available: 1
            })
        );
    }

    #[test]
    fn strict_booleans_and_utf8() {
        assert_eq!(
            WireReader::new(&[2]).bool("flag"),
            Err(CodecError::Decode(DecodeError::InvalidValue {
                field: "flag",
                value: 2
            }))
        );
        assert_eq!(
            WireReader::new(&[0, 2, 0xC3, 0x28]).string("name"),
            Err(CodecError::Decode(DecodeError::InvalidUtf8 { field: "name" }))
        );
    }

    #[test]
    fn oversized_field_is_rejected() {
        let mut w = WireWriter::default();
        let big = vec![0u8; 70_000];

        assert!(matches!(
            w.put_block("chunk", &big),
            Err(FramingError::FieldTooLarge { len: 70_000, .. })
        ));
    }
}
