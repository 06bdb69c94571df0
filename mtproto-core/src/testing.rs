//! In-process server half of the protocol for tests.
//!
//! The fake server trusts a throwaway RSA key with public exponent 1, so
//! "encryption" to it is the identity and it can read `p_q_inner_data`
//! without a private key. Its DH group is the Mersenne prime 2^521 - 1 with
//! generator 3.

use std::io::Write;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use num_bigint::BigUint;
use num_traits::One;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::auth::{AuthKey, AUTH_KEY_LEN};
use crate::crypto::{self, Direction};
use crate::error::{MtprotoError, MtprotoResult};
use crate::framer::{self, Envelope};
use crate::ige;
use crate::msgid::MessageIdGenerator;
use crate::rsa::RsaPublicKey;
use crate::schema::{
    ClientDhInnerData, DhGenAnswer, HandshakeRequest, HandshakeResponse, Int128, Int256,
    PqInnerData, ResPq, ServerDhInnerData, ServerDhParamsFail, ServerDhParamsOk, GZIP_PACKED,
};
use crate::tl::{self, Reader};

/// Factors of the pq the fake server hands out.
pub const FAKE_P: u64 = 0x494C553B;
pub const FAKE_Q: u64 = 0x53911073;

const FAKE_G: i32 = 3;

/// Ways to make the fake server misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tamper {
    #[default]
    None,
    /// resPQ echoes a different nonce.
    ResPqNonce,
    /// resPQ offers only an unknown key fingerprint.
    Fingerprint,
    /// Answer req_DH_params with server_DH_params_fail.
    DhParamsFail,
    /// server_DH_inner_data carries a wrong server_nonce.
    InnerServerNonce,
    /// The hash in front of server_DH_inner_data is wrong.
    AnswerHash,
    /// DH modulus is composite.
    CompositePrime,
    /// dh_gen_ok carries a wrong new_nonce_hash1.
    NewNonceHash,
    /// Answer set_client_DH_params with dh_gen_retry.
    DhGenRetry,
    /// Answer set_client_DH_params with dh_gen_fail.
    DhGenFail,
}

/// The server RSA key that [`FakeServer`] can "decrypt".
pub fn fake_public_key() -> RsaPublicKey {
    let n = (BigUint::one() << 2047u32) + 1u32;
    RsaPublicKey::new(n, BigUint::one())
}

/// Wrap `data` in a gzip_packed object, as a server compresses large replies.
pub fn gzip_packed(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec does not fail.
    let _ = encoder.write_all(data);
    let packed = encoder.finish().unwrap_or_default();
    let mut w = tl::Writer::new();
    w.write_u32(GZIP_PACKED);
    w.write_bytes(&packed);
    w.finish().unwrap_or_default()
}

/// Deterministic server counterpart for handshake and session tests.
pub struct FakeServer {
    rng: StdRng,
    key: RsaPublicKey,
    tamper: Tamper,
    dh_prime: BigUint,
    nonce: Int128,
    server_nonce: Int128,
    new_nonce: Int256,
    a: BigUint,
    auth_key: Option<AuthKey>,
    msg_ids: MessageIdGenerator,
}

impl FakeServer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            key: fake_public_key(),
            tamper: Tamper::None,
            dh_prime: (BigUint::one() << 521u32) - 1u32,
            nonce: [0; 16],
            server_nonce: [0; 16],
            new_nonce: [0; 32],
            a: BigUint::one(),
            auth_key: None,
            msg_ids: MessageIdGenerator::new(),
        }
    }

    pub fn with_tamper(mut self, tamper: Tamper) -> Self {
        self.tamper = tamper;
        self
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }

    pub fn factors(&self) -> (u64, u64) {
        (FAKE_P, FAKE_Q)
    }

    /// The negotiated key, once set_client_DH_params has been processed.
    pub fn auth_key(&self) -> Option<&AuthKey> {
        self.auth_key.as_ref()
    }

    /// Initial salt both sides derive from the nonces.
    pub fn expected_salt(&self) -> u64 {
        let mut salt = [0u8; 8];
        for (i, s) in salt.iter_mut().enumerate() {
            *s = self.new_nonce[i] ^ self.server_nonce[i];
        }
        u64::from_le_bytes(salt)
    }

    /// Answer one bare handshake request.
    pub fn respond(&mut self, request: &[u8]) -> MtprotoResult<Vec<u8>> {
        let response = match tl::from_boxed_bytes::<HandshakeRequest>(request)? {
            HandshakeRequest::ReqPq(req) => self.on_req_pq(req.nonce),
            HandshakeRequest::ReqDhParams(req) => {
                self.check_nonces(&req.nonce, &req.server_nonce)?;
                self.on_req_dh_params(&req.encrypted_data)?
            }
            HandshakeRequest::SetClientDhParams(req) => {
                self.check_nonces(&req.nonce, &req.server_nonce)?;
                self.on_set_client_dh_params(&req.encrypted_data)?
            }
        };
        Ok(response.to_bytes()?)
    }

    /// Answer one unencrypted handshake envelope with another.
    pub fn respond_plain(&mut self, raw: &[u8]) -> MtprotoResult<Vec<u8>> {
        let (_, request) = framer::open_plain(raw)?;
        let response = self.respond(&request)?;
        let msg_id = self.next_msg_id();
        framer::seal_plain(msg_id, &response)
    }

    /// Decrypt a message the client sent after the handshake.
    pub fn open(&self, raw: &[u8]) -> MtprotoResult<Envelope> {
        let key = self.negotiated_key(raw)?;
        framer::open(key, Direction::ClientToServer, raw)
    }

    /// Encrypt a message for the client.
    pub fn seal(&mut self, session_id: u64, seq_no: u32, payload: &[u8]) -> MtprotoResult<Vec<u8>> {
        let envelope = Envelope {
            salt: self.expected_salt(),
            session_id,
            msg_id: self.next_msg_id(),
            seq_no,
            payload: payload.to_vec(),
        };
        let key = self.auth_key.as_ref().ok_or(MtprotoError::ExchangeNotFinished)?;
        framer::seal(key, Direction::ServerToClient, &envelope, &mut self.rng)
    }

    /// Server message IDs are odd multiples of 1 modulo 4.
    pub fn next_msg_id(&mut self) -> u64 {
        self.msg_ids.next() | 1
    }

    fn negotiated_key(&self, raw: &[u8]) -> MtprotoResult<&AuthKey> {
        self.auth_key
            .as_ref()
            .ok_or_else(|| MtprotoError::UnknownAuthKeyId(framer::auth_key_id(raw).unwrap_or(0)))
    }

    fn check_nonces(&self, nonce: &Int128, server_nonce: &Int128) -> MtprotoResult<()> {
        if nonce != &self.nonce {
            return Err(MtprotoError::BadNonce);
        }
        if server_nonce != &self.server_nonce {
            return Err(MtprotoError::BadServerNonce);
        }
        Ok(())
    }

    fn on_req_pq(&mut self, nonce: Int128) -> HandshakeResponse {
        self.nonce = nonce;
        self.rng.fill_bytes(&mut self.server_nonce);

        let mut echoed = nonce;
        if self.tamper == Tamper::ResPqNonce {
            echoed[0] ^= 0xFF;
        }
        let fingerprint = if self.tamper == Tamper::Fingerprint {
            !self.key.fingerprint()
        } else {
            self.key.fingerprint()
        };
        HandshakeResponse::ResPq(ResPq {
            nonce: echoed,
            server_nonce: self.server_nonce,
            pq: (FAKE_P * FAKE_Q).to_be_bytes().to_vec(),
            fingerprints: vec![fingerprint],
        })
    }

    fn on_req_dh_params(&mut self, encrypted: &[u8]) -> MtprotoResult<HandshakeResponse> {
        // Exponent 1: the block is the plaintext, left-padded to 256 bytes.
        let block = encrypted.get(1..).ok_or(MtprotoError::HashMismatch)?;
        let (hash, body) = block.split_at(ige::HASH_LEN.min(block.len()));
        let mut r = Reader::new(body);
        let inner = r.read_exact_boxed::<PqInnerData>();
        r.check()?;
        if crypto::sha1(&[r.consumed()]).as_slice() != hash {
            return Err(MtprotoError::HashMismatch);
        }
        let inner = inner.ok_or(MtprotoError::HashMismatch)?;
        if inner.p != FAKE_P.to_be_bytes()[4..] || inner.q != FAKE_Q.to_be_bytes()[4..] {
            return Err(MtprotoError::FactorizationFailed(FAKE_P * FAKE_Q));
        }
        self.new_nonce = inner.new_nonce;

        if self.tamper == Tamper::DhParamsFail {
            return Ok(HandshakeResponse::ServerDhParamsFail(ServerDhParamsFail {
                nonce: self.nonce,
                server_nonce: self.server_nonce,
                new_nonce_hash: [0; 16],
            }));
        }

        let dh_prime = if self.tamper == Tamper::CompositePrime {
            &self.dh_prime * ((BigUint::one() << 127u32) - 1u32)
        } else {
            self.dh_prime.clone()
        };
        let mut exponent = [0u8; AUTH_KEY_LEN];
        self.rng.fill_bytes(&mut exponent);
        self.a = BigUint::from_bytes_be(&exponent);
        let g_a = BigUint::from(FAKE_G as u32).modpow(&self.a, &dh_prime);

        let mut server_nonce = self.server_nonce;
        if self.tamper == Tamper::InnerServerNonce {
            server_nonce[15] ^= 1;
        }
        let inner = ServerDhInnerData {
            nonce: self.nonce,
            server_nonce,
            g: FAKE_G,
            dh_prime: dh_prime.to_bytes_be(),
            g_a: g_a.to_bytes_be(),
            server_time: Utc::now().timestamp() as i32,
        };
        let inner_bytes = tl::to_boxed_bytes(&inner)?;

        let mut hash = crypto::sha1(&[&inner_bytes]);
        if self.tamper == Tamper::AnswerHash {
            hash[0] ^= 1;
        }
        let mut answer = hash.to_vec();
        answer.extend_from_slice(&inner_bytes);
        let start = answer.len();
        answer.resize(start.div_ceil(16) * 16, 0);
        self.rng.fill_bytes(&mut answer[start..]);

        let (key, iv) = crypto::tmp_aes_key_iv(&self.server_nonce, &self.new_nonce);
        ige::aes256_ige_encrypt(&key, &iv, &mut answer)?;

        Ok(HandshakeResponse::ServerDhParamsOk(ServerDhParamsOk {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            encrypted_answer: answer,
        }))
    }

    fn on_set_client_dh_params(&mut self, encrypted: &[u8]) -> MtprotoResult<HandshakeResponse> {
        let (key, iv) = crypto::tmp_aes_key_iv(&self.server_nonce, &self.new_nonce);
        let (plain, hash) = ige::decrypt_with_hash(&key, &iv, encrypted)?;
        let mut r = Reader::new(&plain);
        let inner = r.read_exact_boxed::<ClientDhInnerData>();
        r.check()?;
        if crypto::sha1(&[r.consumed()]) != hash {
            return Err(MtprotoError::HashMismatch);
        }
        let inner = inner.ok_or(MtprotoError::HashMismatch)?;
        self.check_nonces(&inner.nonce, &inner.server_nonce)?;

        let g_b = BigUint::from_bytes_be(&inner.g_b);
        let shared = crypto::to_bytes_padded(&g_b.modpow(&self.a, &self.dh_prime), AUTH_KEY_LEN);
        let shared: [u8; AUTH_KEY_LEN] = shared.try_into().map_err(|_| MtprotoError::BadDhValue)?;
        let auth_key = AuthKey::from_bytes(shared);

        let mut new_nonce_hash = crypto::new_nonce_hash(&self.new_nonce, 1, auth_key.aux_hash());
        if self.tamper == Tamper::NewNonceHash {
            new_nonce_hash[0] ^= 1;
        }
        self.auth_key = Some(auth_key);

        let answer = DhGenAnswer {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            new_nonce_hash,
        };
        Ok(match self.tamper {
            Tamper::DhGenRetry => HandshakeResponse::DhGenRetry(answer),
            Tamper::DhGenFail => HandshakeResponse::DhGenFail(answer),
            _ => HandshakeResponse::DhGenOk(answer),
        })
    }
}
