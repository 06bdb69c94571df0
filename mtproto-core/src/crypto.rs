//! SHA1 key schedules and number-theory helpers used by the handshake and
//! the framer.

use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use rand::Rng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::schema::{Int128, Int256};

/// Miller-Rabin rounds applied to the server's DH prime.
pub const PRIME_TEST_ROUNDS: u32 = 32;

/// Which side produced a message; selects the auth-key window for the
/// per-message key schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn offset(self) -> usize {
        match self {
            Self::ClientToServer => 0,
            Self::ServerToClient => 8,
        }
    }
}

/// SHA1 over the concatenation of `parts`.
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Constant-time equality.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Temporary AES key/IV protecting the DH parameters, derived from the
/// handshake nonces.
pub fn tmp_aes_key_iv(server_nonce: &Int128, new_nonce: &Int256) -> ([u8; 32], [u8; 32]) {
    let ns = sha1(&[new_nonce, server_nonce]);
    let sn = sha1(&[server_nonce, new_nonce]);
    let nn = sha1(&[new_nonce, new_nonce]);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&ns);
    key[20..].copy_from_slice(&sn[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&sn[12..]);
    iv[8..28].copy_from_slice(&nn);
    iv[28..].copy_from_slice(&new_nonce[..4]);
    (key, iv)
}

/// Per-message AES key/IV from the auth key and msg_key.
pub fn message_key_iv(
    auth_key: &[u8; 256],
    msg_key: &[u8; 16],
    direction: Direction,
) -> ([u8; 32], [u8; 32]) {
    let x = direction.offset();
    let a = sha1(&[msg_key, &auth_key[x..x + 32]]);
    let b = sha1(&[&auth_key[32 + x..48 + x], msg_key, &auth_key[48 + x..64 + x]]);
    let c = sha1(&[&auth_key[64 + x..96 + x], msg_key]);
    let d = sha1(&[msg_key, &auth_key[96 + x..128 + x]]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&a[..8]);
    key[8..20].copy_from_slice(&b[8..20]);
    key[20..].copy_from_slice(&c[4..16]);

    let mut iv = [0u8; 32];
    iv[..12].copy_from_slice(&a[8..20]);
    iv[12..20].copy_from_slice(&b[..8]);
    iv[20..24].copy_from_slice(&c[16..20]);
    iv[24..].copy_from_slice(&d[..8]);
    (key, iv)
}

/// msg_key of a plaintext envelope (padding excluded).
pub fn msg_key_for(plaintext: &[u8]) -> [u8; 16] {
    let digest = sha1(&[plaintext]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[4..20]);
    out
}

/// `new_nonce_hash{n}` confirming the auth key in dh_gen_*.
pub fn new_nonce_hash(new_nonce: &Int256, n: u8, aux_hash: &[u8; 8]) -> Int128 {
    let digest = sha1(&[new_nonce, &[n], aux_hash]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[4..20]);
    out
}

/// Big-endian bytes of `n`, left-padded with zeros to `len`.
///
/// Values wider than `len` are returned unpadded.
pub fn to_bytes_padded(n: &BigUint, len: usize) -> Vec<u8> {
    let raw = n.to_bytes_be();
    if raw.len() >= len {
        return raw;
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

const SMALL_PRIMES: [u32; 15] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47];

/// Miller-Rabin probabilistic primality test with random bases.
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: u32, rng: &mut R) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);

    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).bits() == 0 {
            return false;
        }
    }
    if *n < two {
        return false;
    }

    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_1);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_1 {
            continue;
        }
        for _ in 1..s {
            x = &x * &x % n;
            if x == n_minus_1 {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}
