//! Fixed-width little-endian integers and length-prefixed byte strings.
//!
//! Blob layout:
//! ```text
//! len < 254:  [len(1)] [bytes] [pad to 4]
//! len >= 254: [254] [len(3, LE)] [bytes] [pad to 4]
//! ```

use crate::error::DecodeError;

/// Prefix byte announcing a 3-byte length.
pub const BLOB_LONG_MARKER: u8 = 254;

/// Largest blob the 3-byte length can describe.
pub const MAX_BLOB_LEN: usize = 0xFF_FFFF;

/// Bytes needed to reach the next multiple of `align`.
pub fn padding_for(len: usize, align: usize) -> usize {
    (align - len % align) % align
}

/// Encode `value` as `bits / 8` little-endian bytes.
///
/// Fails if the value needs more than `bits` bits. Supported widths are
/// 24, 32, 64 and 128.
pub fn encode_uint(value: u128, bits: u32) -> Result<Vec<u8>, DecodeError> {
    if !matches!(bits, 24 | 32 | 64 | 128) {
        return Err(DecodeError::InvalidValue(format!("unsupported width {bits}")));
    }
    if bits < 128 && value >> bits != 0 {
        return Err(DecodeError::Overflow { value, bits });
    }
    Ok(value.to_le_bytes()[..(bits / 8) as usize].to_vec())
}

/// Decode up to 16 little-endian bytes.
pub fn decode_uint(bytes: &[u8]) -> Result<u128, DecodeError> {
    if bytes.len() > 16 {
        return Err(DecodeError::Overflow {
            value: u128::MAX,
            bits: 128,
        });
    }
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(u128::from_le_bytes(buf))
}

/// Encode a 24-bit length.
pub fn encode_u24(value: u32) -> Result<[u8; 3], DecodeError> {
    if value > 0xFF_FFFF {
        return Err(DecodeError::Overflow {
            value: value.into(),
            bits: 24,
        });
    }
    let b = value.to_le_bytes();
    Ok([b[0], b[1], b[2]])
}

/// Decode a 24-bit length.
pub fn decode_u24(bytes: [u8; 3]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// Total wire size of a blob holding `len` bytes, padding included.
pub fn blob_encoded_len(len: usize) -> usize {
    let header = if len < BLOB_LONG_MARKER as usize { 1 } else { 4 };
    let raw = header + len;
    raw + padding_for(raw, 4)
}

/// Append `data` to `out` as a padded blob.
pub fn encode_blob(data: &[u8], out: &mut Vec<u8>) -> Result<(), DecodeError> {
    let start = out.len();
    if data.len() < BLOB_LONG_MARKER as usize {
        out.push(data.len() as u8);
    } else {
        if data.len() > MAX_BLOB_LEN {
            return Err(DecodeError::Overflow {
                value: data.len() as u128,
                bits: 24,
            });
        }
        out.push(BLOB_LONG_MARKER);
        out.extend_from_slice(&encode_u24(data.len() as u32)?);
    }
    out.extend_from_slice(data);
    let written = out.len() - start;
    out.resize(out.len() + padding_for(written, 4), 0);
    Ok(())
}

/// Decode a blob from the front of `buf`.
///
/// Returns the content and the number of bytes consumed, padding included.
pub fn decode_blob(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::UnexpectedEof {
        needed: 1,
        remaining: 0,
    })?;

    let (header, len) = match first {
        255 => return Err(DecodeError::InvalidLengthPrefix(first)),
        BLOB_LONG_MARKER => {
            if buf.len() < 4 {
                return Err(DecodeError::UnexpectedEof {
                    needed: 4,
                    remaining: buf.len(),
                });
            }
            (4, decode_u24([buf[1], buf[2], buf[3]]) as usize)
        }
        short => (1, short as usize),
    };

    let total = header + len + padding_for(header + len, 4);
    if buf.len() < total {
        return Err(DecodeError::UnexpectedEof {
            needed: total,
            remaining: buf.len(),
        });
    }
    Ok((&buf[header..header + len], total))
}
