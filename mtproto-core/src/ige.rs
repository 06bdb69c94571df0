//! Infinite Garble Extension (IGE) block chaining.
//!
//! ```text
//! encrypt: c[i] = E(p[i] ^ c[i-1]) ^ p[i-1]
//! decrypt: p[i] = D(c[i] ^ p[i-1]) ^ c[i-1]
//! ```
//!
//! The IV is two blocks long: the first half seeds `c[-1]`, the second
//! half seeds `p[-1]`. Only whole blocks are accepted.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{MtprotoError, MtprotoResult};

/// Length of the SHA1 digest prepended by [`encrypt_with_hash`].
pub const HASH_LEN: usize = 20;

/// IGE mode over any block cipher. Chaining state carries across calls.
pub struct Ige<C> {
    cipher: C,
    prev_cipher: Vec<u8>,
    prev_plain: Vec<u8>,
}

impl<C> Ige<C>
where
    C: BlockEncrypt + BlockDecrypt,
{
    /// Wrap `cipher`; `iv` must be exactly two blocks.
    pub fn new(cipher: C, iv: &[u8]) -> MtprotoResult<Self> {
        let bs = C::block_size();
        if iv.len() != 2 * bs {
            return Err(MtprotoError::Crypto(format!(
                "IGE IV must be {} bytes, got {}",
                2 * bs,
                iv.len()
            )));
        }
        Ok(Self {
            cipher,
            prev_cipher: iv[..bs].to_vec(),
            prev_plain: iv[bs..].to_vec(),
        })
    }

    fn check_aligned(data: &[u8]) -> MtprotoResult<()> {
        let bs = C::block_size();
        if data.len() % bs != 0 {
            return Err(MtprotoError::Crypto(format!(
                "IGE input of {} bytes is not a multiple of {bs}",
                data.len()
            )));
        }
        Ok(())
    }

    pub fn encrypt(&mut self, data: &mut [u8]) -> MtprotoResult<()> {
        Self::check_aligned(data)?;
        for block in data.chunks_exact_mut(C::block_size()) {
            let plain = block.to_vec();
            xor_in_place(block, &self.prev_cipher);
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            xor_in_place(block, &self.prev_plain);
            self.prev_cipher.copy_from_slice(block);
            self.prev_plain = plain;
        }
        Ok(())
    }

    pub fn decrypt(&mut self, data: &mut [u8]) -> MtprotoResult<()> {
        Self::check_aligned(data)?;
        for block in data.chunks_exact_mut(C::block_size()) {
            let cipher = block.to_vec();
            xor_in_place(block, &self.prev_plain);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            xor_in_place(block, &self.prev_cipher);
            self.prev_plain.copy_from_slice(block);
            self.prev_cipher = cipher;
        }
        Ok(())
    }
}

fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn aes256_ige(key: &[u8], iv: &[u8]) -> MtprotoResult<Ige<Aes256>> {
    let cipher = Aes256::new_from_slice(key)
        .map_err(|_| MtprotoError::Crypto(format!("AES-256 key must be 32 bytes, got {}", key.len())))?;
    Ige::new(cipher, iv)
}

/// One-shot AES-256-IGE encryption in place.
pub fn aes256_ige_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> MtprotoResult<()> {
    aes256_ige(key, iv)?.encrypt(data)
}

/// One-shot AES-256-IGE decryption in place.
pub fn aes256_ige_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> MtprotoResult<()> {
    aes256_ige(key, iv)?.decrypt(data)
}

/// Encrypt `SHA1(plaintext) || plaintext || random padding` with AES-256-IGE.
pub fn encrypt_with_hash<R: RngCore + ?Sized>(
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    rng: &mut R,
) -> MtprotoResult<Vec<u8>> {
    let mut data = Vec::with_capacity(HASH_LEN + plaintext.len() + 16);
    data.extend_from_slice(&Sha1::digest(plaintext));
    data.extend_from_slice(plaintext);
    let pad = (16 - data.len() % 16) % 16;
    let start = data.len();
    data.resize(start + pad, 0);
    rng.fill_bytes(&mut data[start..]);
    aes256_ige_encrypt(key, iv, &mut data)?;
    Ok(data)
}

/// Inverse of [`encrypt_with_hash`].
///
/// Returns the plaintext (padding still attached) and the recovered
/// digest. The caller knows where the plaintext really ends, so checking
/// the digest is left to it.
pub fn decrypt_with_hash(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> MtprotoResult<(Vec<u8>, [u8; HASH_LEN])> {
    if ciphertext.len() < HASH_LEN {
        return Err(MtprotoError::Crypto(format!(
            "encrypted answer of {} bytes is shorter than its hash",
            ciphertext.len()
        )));
    }
    let mut data = ciphertext.to_vec();
    aes256_ige_decrypt(key, iv, &mut data)?;
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&data[..HASH_LEN]);
    Ok((data.split_off(HASH_LEN), hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::Aes128;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn seq(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn aes128_reference_vector() {
        let key = seq(0, 16);
        let iv = seq(0, 32);
        let mut data = vec![0u8; 32];
        let mut ige = Ige::new(Aes128::new_from_slice(&key).unwrap(), &iv).unwrap();
        ige.encrypt(&mut data).unwrap();
        assert_eq!(
            data,
            hex("1a8519a6557be652e9da8e43da4ef4453cf456b4ca488aa383c79c98b34797cb")
        );
    }

    #[test]
    fn aes256_known_answer() {
        let key = seq(0, 32);
        let iv = seq(32, 32);
        let mut data = seq(0, 64);
        aes256_ige_encrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(
            data,
            hex(concat!(
                "42e66e1a756cccf5b27acc47523ad074ee39bf54e3db37bbdf415df6b400fca9",
                "77f708327c9e9341cc3dc8efd31e76463daa65b1f0d0252f790d77f1824a662c"
            ))
        );
        aes256_ige_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, seq(0, 64));
    }

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let iv = [9u8; 32];
        let plain: Vec<u8> = (0..160u32).map(|i| (i * 31) as u8).collect();
        let mut data = plain.clone();
        aes256_ige_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data, plain);
        aes256_ige_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn differs_from_cbc() {
        let key = [3u8; 32];
        let iv = seq(1, 32);
        let plain = [0x42u8; 16];

        let mut ige = plain;
        aes256_ige_encrypt(&key, &iv, &mut ige).unwrap();

        let mut cbc = plain;
        xor_in_place(&mut cbc, &iv[..16]);
        Aes256::new_from_slice(&key)
            .unwrap()
            .encrypt_block(GenericArray::from_mut_slice(&mut cbc));

        assert_ne!(ige, cbc);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let key = [5u8; 32];
        let iv = [6u8; 32];
        let mut whole = seq(0, 64);
        aes256_ige_encrypt(&key, &iv, &mut whole).unwrap();

        let mut ige = aes256_ige(&key, &iv).unwrap();
        let mut parts = seq(0, 64);
        let (a, b) = parts.split_at_mut(32);
        ige.encrypt(a).unwrap();
        ige.encrypt(b).unwrap();
        assert_eq!(parts, whole);
    }

    #[test]
    fn unaligned_input_rejected() {
        let mut data = vec![0u8; 17];
        assert!(aes256_ige_encrypt(&[0u8; 32], &[0u8; 32], &mut data).is_err());
        assert_eq!(data, vec![0u8; 17]);
    }

    #[test]
    fn bad_iv_rejected() {
        let cipher = Aes256::new_from_slice(&[0u8; 32]).unwrap();
        assert!(Ige::new(cipher, &[0u8; 16]).is_err());
    }

    #[test]
    fn hash_helper_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let msg = b"server_DH_inner_data";
        let enc = encrypt_with_hash(&key, &iv, msg, &mut rng).unwrap();
        assert_eq!(enc.len() % 16, 0);

        let (plain, hash) = decrypt_with_hash(&key, &iv, &enc).unwrap();
        assert_eq!(&plain[..msg.len()], msg);
        assert_eq!(hash.as_slice(), Sha1::digest(msg).as_slice());
    }
}
