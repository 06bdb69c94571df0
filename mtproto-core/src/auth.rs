//! Authorization key material produced by the key exchange.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;

/// Length of an MTProto authorization key.
pub const AUTH_KEY_LEN: usize = 256;

/// The 2048-bit shared secret plus the values derived from it.
///
/// The key ID and auxiliary hash are computed on construction and cannot
/// be set independently.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey {
    data: [u8; AUTH_KEY_LEN],
    id: u64,
    aux_hash: [u8; 8],
}

impl AuthKey {
    pub fn from_bytes(data: [u8; AUTH_KEY_LEN]) -> Self {
        let digest = crypto::sha1(&[&data]);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&digest[..8]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[12..20]);
        Self {
            data,
            id: u64::from_le_bytes(id),
            aux_hash,
        }
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.data
    }

    /// Low 64 bits of SHA1(key), as sent in every encrypted envelope.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// High 64 bits of SHA1(key), mixed into new_nonce_hash.
    pub fn aux_hash(&self) -> &[u8; 8] {
        &self.aux_hash
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        crypto::ct_eq(&self.data, &other.data)
    }
}

impl Eq for AuthKey {}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKey")
            .field("id", &format_args!("{:#018x}", self.id))
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub key: AuthKey,
    pub server_salt: u64,
    pub session_id: u64,
    /// Server clock minus local clock, in seconds.
    pub time_offset: i64,
}

impl AuthResult {
    pub fn key_id(&self) -> u64 {
        self.key.id()
    }
}
