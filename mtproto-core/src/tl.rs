//! TL (Type Language) binary serialization.
//!
//! [`Reader`] and [`Writer`] are cursors with a sticky error: the first
//! failure is recorded, every later primitive becomes a no-op returning a
//! zero value, and the caller checks the outcome once after a multi-field
//! decode via [`Reader::finish`] or [`Reader::check`].
//!
//! Bare values are written field by field. Boxed values are prefixed with
//! a 32-bit constructor tag and decoded through a closed family enum
//! implementing [`TlFamily`].

use num_bigint::BigUint;

use crate::codec;
use crate::error::DecodeError;

/// Constructor tag of the boxed `Vector<T>`.
pub const VECTOR_TAG: u32 = 0x1cb5c415;

/// A type with a fixed constructor tag.
pub trait Identifiable {
    const CONSTRUCTOR_ID: u32;
}

/// Bare serialization: fields only, no tag.
pub trait Serializable {
    fn serialize(&self, w: &mut Writer);

    /// Serialize into a fresh buffer.
    fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let mut w = Writer::new();
        self.serialize(&mut w);
        w.finish()
    }
}

/// Bare deserialization: fields only, no tag.
///
/// Implementations read every field unconditionally; failures are recorded
/// on the reader.
pub trait Deserializable: Sized {
    fn deserialize(r: &mut Reader<'_>) -> Self;
}

/// A closed set of boxed constructors sharing one wire type.
pub trait TlFamily: Sized {
    /// Decode the bare body for `tag`, or `None` if no variant owns it.
    fn from_tag(tag: u32, r: &mut Reader<'_>) -> Option<Self>;

    /// Tag of this value's variant.
    fn tag(&self) -> u32;
}

/// Serialize `value` with its constructor tag.
pub fn to_boxed_bytes<T>(value: &T) -> Result<Vec<u8>, DecodeError>
where
    T: Identifiable + Serializable,
{
    let mut w = Writer::new();
    w.write_boxed(value);
    w.finish()
}

/// Decode a whole buffer as one boxed value of family `F`.
pub fn from_boxed_bytes<F: TlFamily>(buf: &[u8]) -> Result<F, DecodeError> {
    let mut r = Reader::new(buf);
    let value = r.read_boxed::<F>();
    r.finish()?;
    value.ok_or(DecodeError::UnknownConstructor(0))
}

/// Cursor over a byte slice with a sticky error.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    err: Option<DecodeError>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            err: None,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Everything consumed so far.
    pub fn consumed(&self) -> &'a [u8] {
        &self.buf[..self.pos]
    }

    /// Unread tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn has_failed(&self) -> bool {
        self.err.is_some()
    }

    /// Record `err` unless an earlier failure is already stored.
    pub fn fail(&mut self, err: DecodeError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// The recorded failure, if any.
    pub fn check(&self) -> Result<(), DecodeError> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Check the recorded failure and that every byte was consumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        self.check()?;
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.err.is_some() {
            return None;
        }
        if self.remaining() < n {
            self.fail(DecodeError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn take_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(bytes) = self.take(N) {
            out.copy_from_slice(bytes);
        }
        out
    }

    /// Read a `bits`-wide little-endian unsigned integer.
    pub fn read_uint(&mut self, bits: u32) -> u128 {
        if !matches!(bits, 24 | 32 | 64 | 128) {
            self.fail(DecodeError::InvalidValue(format!("unsupported width {bits}")));
            return 0;
        }
        let Some(bytes) = self.take((bits / 8) as usize) else {
            return 0;
        };
        match codec::decode_uint(bytes) {
            Ok(v) => v,
            Err(e) => {
                self.fail(e);
                0
            }
        }
    }

    pub fn read_u32(&mut self) -> u32 {
        self.read_uint(32) as u32
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    pub fn read_u64(&mut self) -> u64 {
        self.read_uint(64) as u64
    }

    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    pub fn read_int128(&mut self) -> [u8; 16] {
        self.take_array()
    }

    pub fn read_int256(&mut self) -> [u8; 32] {
        self.take_array()
    }

    /// Read `n` raw bytes with no length prefix.
    pub fn read_raw(&mut self, n: usize) -> &'a [u8] {
        self.take(n).unwrap_or(&[])
    }

    pub fn read_bool(&mut self) -> bool {
        match self.read_u32() {
            BOOL_TRUE => true,
            BOOL_FALSE => false,
            other => {
                if !self.has_failed() {
                    self.fail(DecodeError::UnknownConstructor(other));
                }
                false
            }
        }
    }

    /// Read a length-prefixed, padded blob.
    pub fn read_bytes(&mut self) -> Vec<u8> {
        if self.err.is_some() {
            return Vec::new();
        }
        match codec::decode_blob(self.rest()) {
            Ok((data, used)) => {
                self.pos += used;
                data.to_vec()
            }
            Err(e) => {
                self.fail(e);
                Vec::new()
            }
        }
    }

    pub fn read_string(&mut self) -> String {
        let bytes = self.read_bytes();
        String::from_utf8(bytes).unwrap_or_else(|e| {
            self.fail(DecodeError::InvalidValue(e.to_string()));
            String::new()
        })
    }

    /// Read a big-endian unsigned magnitude stored as a blob.
    pub fn read_bigint(&mut self) -> BigUint {
        BigUint::from_bytes_be(&self.read_bytes())
    }

    /// Read a boxed `Vector<T>` of bare elements.
    pub fn read_vector<T>(&mut self, mut item: impl FnMut(&mut Self) -> T) -> Vec<T> {
        let tag = self.read_u32();
        if self.has_failed() {
            return Vec::new();
        }
        if tag != VECTOR_TAG {
            self.fail(DecodeError::UnknownConstructor(tag));
            return Vec::new();
        }
        let count = self.read_u32() as usize;
        // Each element takes at least four bytes on the wire.
        if count > self.remaining() / 4 {
            self.fail(DecodeError::UnexpectedEof {
                needed: count.saturating_mul(4),
                remaining: self.remaining(),
            });
            return Vec::new();
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if self.has_failed() {
                break;
            }
            out.push(item(self));
        }
        out
    }

    /// Peek at the next constructor tag without consuming it.
    pub fn peek_tag(&self) -> Option<u32> {
        if self.err.is_some() {
            return None;
        }
        self.buf
            .get(self.pos..self.pos + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a tag and dispatch to the matching variant of `F`.
    pub fn read_boxed<F: TlFamily>(&mut self) -> Option<F> {
        let tag = self.read_u32();
        if self.has_failed() {
            return None;
        }
        let value = F::from_tag(tag, self);
        if value.is_none() {
            self.fail(DecodeError::UnknownConstructor(tag));
        }
        if self.has_failed() {
            None
        } else {
            value
        }
    }

    /// Read a boxed value of a single known constructor.
    pub fn read_exact_boxed<T: Identifiable + Deserializable>(&mut self) -> Option<T> {
        let tag = self.read_u32();
        if self.has_failed() {
            return None;
        }
        if tag != T::CONSTRUCTOR_ID {
            self.fail(DecodeError::UnknownConstructor(tag));
            return None;
        }
        let value = T::deserialize(self);
        if self.has_failed() {
            None
        } else {
            Some(value)
        }
    }
}

/// Tag of `boolTrue`.
pub const BOOL_TRUE: u32 = 0x997275b5;
/// Tag of `boolFalse`.
pub const BOOL_FALSE: u32 = 0xbc799737;

/// Growable output buffer with a sticky error.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
    err: Option<DecodeError>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            err: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn fail(&mut self, err: DecodeError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Return the buffer, or the first recorded failure.
    pub fn finish(self) -> Result<Vec<u8>, DecodeError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }

    /// Append `value` as a `bits`-wide little-endian integer. A value that
    /// does not fit fails the writer.
    pub fn write_uint(&mut self, value: u128, bits: u32) {
        if self.err.is_some() {
            return;
        }
        match codec::encode_uint(value, bits) {
            Ok(bytes) => self.buf.extend_from_slice(&bytes),
            Err(e) => self.fail(e),
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_uint(v.into(), 32);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_uint(v.into(), 64);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_int128(&mut self, v: &[u8; 16]) {
        self.write_raw(v);
    }

    pub fn write_int256(&mut self, v: &[u8; 32]) {
        self.write_raw(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(if v { BOOL_TRUE } else { BOOL_FALSE });
    }

    /// Append bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        if self.err.is_none() {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Append a length-prefixed, padded blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = codec::encode_blob(bytes, &mut self.buf) {
            self.fail(e);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Append a big-endian unsigned magnitude as a blob.
    pub fn write_bigint(&mut self, v: &BigUint) {
        let bytes = if v.bits() == 0 {
            Vec::new()
        } else {
            v.to_bytes_be()
        };
        self.write_bytes(&bytes);
    }

    /// Append a boxed `Vector<T>`.
    pub fn write_vector<T>(&mut self, items: &[T], mut item: impl FnMut(&mut Self, &T)) {
        self.write_u32(VECTOR_TAG);
        self.write_u32(items.len() as u32);
        for v in items {
            item(self, v);
        }
    }

    /// Append `value` with its constructor tag.
    pub fn write_boxed<T: Identifiable + Serializable>(&mut self, value: &T) {
        self.write_u32(T::CONSTRUCTOR_ID);
        value.serialize(self);
    }

    /// Zero-pad to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        if align == 0 {
            return;
        }
        let pad = codec::padding_for(self.buf.len(), align);
        if self.err.is_none() {
            self.buf.resize(self.buf.len() + pad, 0);
        }
    }
}
