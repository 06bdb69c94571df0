//! Pinned server RSA keys.
//!
//! The key exchange only ever encrypts to a key the client already trusts,
//! identified by its fingerprint. Encryption is raw modular exponentiation;
//! the caller supplies a fully formed 255-byte block.

use base64::Engine;
use num_bigint::BigUint;

use crate::crypto;
use crate::error::{MtprotoError, MtprotoResult};
use crate::tl::Writer;

/// Ciphertext length for a 2048-bit modulus.
pub const RSA_BLOCK_LEN: usize = 256;

const DER_SEQUENCE: u8 = 0x30;
const DER_INTEGER: u8 = 0x02;
const DER_BIT_STRING: u8 = 0x03;

/// An RSA public key together with its MTProto fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    n: BigUint,
    e: BigUint,
    fingerprint: u64,
}

impl RsaPublicKey {
    pub fn new(n: BigUint, e: BigUint) -> Self {
        let fingerprint = fingerprint_of(&n, &e);
        Self { n, e, fingerprint }
    }

    /// Parse an `RSA PUBLIC KEY` (PKCS#1) or `PUBLIC KEY` (SPKI) PEM block.
    pub fn from_pem(pem: &str) -> MtprotoResult<Self> {
        let body: String = pem
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("-----"))
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| MtprotoError::Config(format!("invalid PEM base64: {e}")))?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> MtprotoResult<Self> {
        let (tag, outer, _) = der_item(der)?;
        if tag != DER_SEQUENCE {
            return Err(der_error("expected SEQUENCE"));
        }
        let (first_tag, first, rest) = der_item(outer)?;
        match first_tag {
            // PKCS#1: SEQUENCE { n INTEGER, e INTEGER }
            DER_INTEGER => {
                let (e_tag, e, _) = der_item(rest)?;
                if e_tag != DER_INTEGER {
                    return Err(der_error("expected exponent INTEGER"));
                }
                Ok(Self::new(
                    BigUint::from_bytes_be(first),
                    BigUint::from_bytes_be(e),
                ))
            }
            // SPKI: SEQUENCE { AlgorithmIdentifier, BIT STRING { PKCS#1 } }
            DER_SEQUENCE => {
                let (bits_tag, bits, _) = der_item(rest)?;
                if bits_tag != DER_BIT_STRING || bits.first() != Some(&0) {
                    return Err(der_error("expected BIT STRING"));
                }
                Self::from_der(&bits[1..])
            }
            _ => Err(der_error("unrecognised key structure")),
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    pub fn exponent(&self) -> &BigUint {
        &self.e
    }

    /// `data^e mod n`, left-padded to [`RSA_BLOCK_LEN`] bytes.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let m = BigUint::from_bytes_be(data);
        crypto::to_bytes_padded(&m.modpow(&self.e, &self.n), RSA_BLOCK_LEN)
    }
}

/// Low 64 bits of SHA1 over the TL-serialized modulus and exponent.
fn fingerprint_of(n: &BigUint, e: &BigUint) -> u64 {
    let mut w = Writer::new();
    w.write_bigint(n);
    w.write_bigint(e);
    // Both values are far below the blob size limit.
    let bytes = w.finish().unwrap_or_default();
    let digest = crypto::sha1(&[&bytes]);
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[12..20]);
    u64::from_le_bytes(low)
}

fn der_error(what: &str) -> MtprotoError {
    MtprotoError::Config(format!("invalid RSA key DER: {what}"))
}

/// Split one TLV off the front of `buf`: `(tag, content, rest)`.
fn der_item(buf: &[u8]) -> MtprotoResult<(u8, &[u8], &[u8])> {
    let (&tag, rest) = buf.split_first().ok_or_else(|| der_error("truncated"))?;
    let (&first, rest) = rest.split_first().ok_or_else(|| der_error("truncated"))?;

    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return Err(der_error("bad length"));
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[count..])
    };

    if rest.len() < len {
        return Err(der_error("truncated"));
    }
    Ok((tag, &rest[..len], &rest[len..]))
}
