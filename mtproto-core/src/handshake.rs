//! Diffie-Hellman key exchange producing the authorization key.
//!
//! ```text
//! Init --start--> ReqPq --resPQ--> ReqDhParams --server_DH_params_ok-->
//!     SetClientDhParams --dh_gen_ok--> Done
//! ```
//!
//! Any validation failure moves the exchange to `Failed` and is stored;
//! nothing is retried.

use chrono::Utc;
use num_bigint::BigUint;
use num_traits::One;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthKey, AuthResult, AUTH_KEY_LEN};
use crate::crypto::{self, ct_eq};
use crate::error::{DecodeError, MtprotoError, MtprotoResult};
use crate::ige;
use crate::pq;
use crate::rsa::RsaPublicKey;
use crate::schema::{
    ClientDhInnerData, DhGenAnswer, HandshakeResponse, Int128, Int256, PqInnerData, ReqDhParams,
    ReqPq, ResPq, ServerDhInnerData, ServerDhParamsOk, SetClientDhParams,
};
use crate::tl::{self, Reader};

/// Size of the block RSA-encrypted in req_DH_params.
const RSA_DATA_LEN: usize = 255;

/// Random bytes used for the client's DH exponent.
const DH_EXPONENT_LEN: usize = 256;

/// Key exchange states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    /// Nothing sent yet.
    Init,
    /// req_pq sent, awaiting resPQ.
    ReqPq,
    /// req_DH_params sent, awaiting server_DH_params_*.
    ReqDhParams,
    /// set_client_DH_params sent, awaiting dh_gen_*.
    SetClientDhParams,
    /// Terminal state - auth key established.
    Done,
    /// Terminal state - exchange aborted.
    Failed,
}

impl ExchangeState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn valid_transitions(&self) -> &'static [ExchangeState] {
        match self {
            Self::Init => &[Self::ReqPq, Self::Failed],
            Self::ReqPq => &[Self::ReqDhParams, Self::Failed],
            Self::ReqDhParams => &[Self::SetClientDhParams, Self::Failed],
            Self::SetClientDhParams => &[Self::Done, Self::Failed],
            Self::Done => &[],
            Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: ExchangeState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

/// Client side of the MTProto key exchange.
pub struct KeyExchange {
    state: ExchangeState,
    keys: Vec<RsaPublicKey>,
    nonce: Int128,
    server_nonce: Int128,
    new_nonce: Int256,
    pending: Option<AuthResult>,
    error: Option<MtprotoError>,
}

impl KeyExchange {
    /// Create an exchange that trusts only `keys`.
    pub fn new(keys: Vec<RsaPublicKey>) -> Self {
        Self {
            state: ExchangeState::Init,
            keys,
            nonce: [0; 16],
            server_nonce: [0; 16],
            new_nonce: [0; 32],
            pending: None,
            error: None,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ExchangeState::Done
    }

    /// Generate the client nonce and return the boxed `req_pq`.
    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> MtprotoResult<Vec<u8>> {
        if self.state != ExchangeState::Init {
            return Err(MtprotoError::UnexpectedCommand);
        }
        rng.fill_bytes(&mut self.nonce);
        let bytes = tl::to_boxed_bytes(&ReqPq { nonce: self.nonce })?;
        self.transition(ExchangeState::ReqPq)?;
        Ok(bytes)
    }

    /// Feed one server payload. Returns the next request to send, if any.
    ///
    /// On error the exchange is left in `Failed` with the error stored.
    pub fn handle<R: RngCore + CryptoRng>(
        &mut self,
        payload: &[u8],
        rng: &mut R,
    ) -> MtprotoResult<Option<Vec<u8>>> {
        if self.state.is_terminal() || self.state == ExchangeState::Init {
            return Err(MtprotoError::UnexpectedCommand);
        }
        match self.dispatch(payload, rng) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// The negotiated key in `Done`, the stored error in `Failed`.
    pub fn result(&self) -> MtprotoResult<AuthResult> {
        match self.state {
            ExchangeState::Done => self.pending.clone().ok_or(MtprotoError::ExchangeNotFinished),
            ExchangeState::Failed => Err(self
                .error
                .clone()
                .unwrap_or(MtprotoError::ExchangeNotFinished)),
            _ => Err(MtprotoError::ExchangeNotFinished),
        }
    }

    fn dispatch<R: RngCore + CryptoRng>(
        &mut self,
        payload: &[u8],
        rng: &mut R,
    ) -> MtprotoResult<Option<Vec<u8>>> {
        let command: HandshakeResponse = tl::from_boxed_bytes(payload)?;
        match (self.state, command) {
            (ExchangeState::ReqPq, HandshakeResponse::ResPq(res)) => {
                self.on_res_pq(res, rng).map(Some)
            }
            (ExchangeState::ReqDhParams, HandshakeResponse::ServerDhParamsOk(ok)) => {
                self.on_dh_params_ok(ok, rng).map(Some)
            }
            (ExchangeState::ReqDhParams, HandshakeResponse::ServerDhParamsFail(fail)) => {
                self.check_nonces(&fail.nonce, &fail.server_nonce)?;
                Err(MtprotoError::DhParamsFail)
            }
            (ExchangeState::SetClientDhParams, HandshakeResponse::DhGenOk(ok)) => {
                self.on_dh_gen_ok(ok)?;
                Ok(None)
            }
            (ExchangeState::SetClientDhParams, HandshakeResponse::DhGenRetry(answer)) => {
                self.check_nonces(&answer.nonce, &answer.server_nonce)?;
                Err(MtprotoError::DhGenRetry)
            }
            (ExchangeState::SetClientDhParams, HandshakeResponse::DhGenFail(answer)) => {
                self.check_nonces(&answer.nonce, &answer.server_nonce)?;
                Err(MtprotoError::DhGenFail)
            }
            _ => Err(MtprotoError::UnexpectedCommand),
        }
    }

    fn on_res_pq<R: RngCore + CryptoRng>(&mut self, res: ResPq, rng: &mut R) -> MtprotoResult<Vec<u8>> {
        if !ct_eq(&res.nonce, &self.nonce) {
            return Err(MtprotoError::BadNonce);
        }
        let key = self
            .keys
            .iter()
            .find(|k| res.fingerprints.contains(&k.fingerprint()))
            .cloned()
            .ok_or(MtprotoError::FingerprintMismatch)?;
        self.server_nonce = res.server_nonce;

        if res.pq.is_empty() || res.pq.len() > 8 {
            return Err(DecodeError::InvalidValue(format!("pq of {} bytes", res.pq.len())).into());
        }
        let pq_value = res.pq.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let (p, q) = pq::factorize(pq_value, rng);
        if p == 1 {
            return Err(MtprotoError::FactorizationFailed(pq_value));
        }

        rng.fill_bytes(&mut self.new_nonce);
        let inner = PqInnerData {
            pq: res.pq,
            p: be_bytes(p),
            q: be_bytes(q),
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            new_nonce: self.new_nonce,
        };
        let inner_bytes = tl::to_boxed_bytes(&inner)?;

        let mut data = [0u8; RSA_DATA_LEN];
        rng.fill_bytes(&mut data);
        let hash = crypto::sha1(&[&inner_bytes]);
        let body_len = hash.len() + inner_bytes.len();
        if body_len > RSA_DATA_LEN {
            return Err(DecodeError::Overflow {
                value: body_len as u128,
                bits: (RSA_DATA_LEN * 8) as u32,
            }
            .into());
        }
        data[..hash.len()].copy_from_slice(&hash);
        data[hash.len()..body_len].copy_from_slice(&inner_bytes);

        let request = ReqDhParams {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            p: inner.p,
            q: inner.q,
            public_key_fingerprint: key.fingerprint(),
            encrypted_data: key.encrypt(&data),
        };
        let bytes = tl::to_boxed_bytes(&request)?;
        self.transition(ExchangeState::ReqDhParams)?;
        Ok(bytes)
    }

    fn on_dh_params_ok<R: RngCore + CryptoRng>(
        &mut self,
        ok: ServerDhParamsOk,
        rng: &mut R,
    ) -> MtprotoResult<Vec<u8>> {
        self.check_nonces(&ok.nonce, &ok.server_nonce)?;

        let (tmp_key, tmp_iv) = crypto::tmp_aes_key_iv(&self.server_nonce, &self.new_nonce);
        let (answer, hash) = ige::decrypt_with_hash(&tmp_key, &tmp_iv, &ok.encrypted_answer)?;

        let mut reader = Reader::new(&answer);
        let inner = reader.read_exact_boxed::<ServerDhInnerData>();
        reader.check()?;
        if !ct_eq(&crypto::sha1(&[reader.consumed()]), &hash) {
            return Err(MtprotoError::HashMismatch);
        }
        if reader.remaining() >= 16 {
            return Err(DecodeError::TrailingBytes(reader.remaining()).into());
        }
        let inner = inner.ok_or(DecodeError::UnknownConstructor(0))?;
        self.check_nonces(&inner.nonce, &inner.server_nonce)?;

        let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
        if !crypto::is_probable_prime(&dh_prime, crypto::PRIME_TEST_ROUNDS, rng) {
            return Err(MtprotoError::DhPrimeNotPrime);
        }
        let g = BigUint::from(u32::try_from(inner.g).map_err(|_| MtprotoError::BadDhValue)?);
        let g_a = BigUint::from_bytes_be(&inner.g_a);
        check_dh_range(&g, &dh_prime)?;
        check_dh_range(&g_a, &dh_prime)?;

        let mut exponent = [0u8; DH_EXPONENT_LEN];
        rng.fill_bytes(&mut exponent);
        let b = BigUint::from_bytes_be(&exponent);
        let g_b = g.modpow(&b, &dh_prime);
        check_dh_range(&g_b, &dh_prime)?;

        let shared = crypto::to_bytes_padded(&g_a.modpow(&b, &dh_prime), AUTH_KEY_LEN);
        let key_bytes: [u8; AUTH_KEY_LEN] = shared
            .try_into()
            .map_err(|_| MtprotoError::BadDhValue)?;
        let key = AuthKey::from_bytes(key_bytes);

        let mut salt = [0u8; 8];
        for (i, s) in salt.iter_mut().enumerate() {
            *s = self.new_nonce[i] ^ self.server_nonce[i];
        }

        let time_offset = i64::from(inner.server_time) - Utc::now().timestamp();
        self.pending = Some(AuthResult {
            key,
            server_salt: u64::from_le_bytes(salt),
            session_id: rng.next_u64(),
            time_offset,
        });

        let client_inner = ClientDhInnerData {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            retry_id: 0,
            g_b: g_b.to_bytes_be(),
        };
        let inner_bytes = tl::to_boxed_bytes(&client_inner)?;
        let encrypted_data = ige::encrypt_with_hash(&tmp_key, &tmp_iv, &inner_bytes, rng)?;

        let request = SetClientDhParams {
            nonce: self.nonce,
            server_nonce: self.server_nonce,
            encrypted_data,
        };
        let bytes = tl::to_boxed_bytes(&request)?;
        self.transition(ExchangeState::SetClientDhParams)?;
        Ok(bytes)
    }

    fn on_dh_gen_ok(&mut self, ok: DhGenAnswer) -> MtprotoResult<()> {
        self.check_nonces(&ok.nonce, &ok.server_nonce)?;
        let auth = self.pending.as_ref().ok_or(MtprotoError::ExchangeNotFinished)?;
        let expected = crypto::new_nonce_hash(&self.new_nonce, 1, auth.key.aux_hash());
        if !ct_eq(&expected, &ok.new_nonce_hash) {
            return Err(MtprotoError::BadNewNonceHash);
        }
        self.transition(ExchangeState::Done)
    }

    fn check_nonces(&self, nonce: &Int128, server_nonce: &Int128) -> MtprotoResult<()> {
        if !ct_eq(nonce, &self.nonce) {
            return Err(MtprotoError::BadNonce);
        }
        if !ct_eq(server_nonce, &self.server_nonce) {
            return Err(MtprotoError::BadServerNonce);
        }
        Ok(())
    }

    fn fail(&mut self, error: MtprotoError) {
        tracing::debug!("key exchange: {:?} -> Failed ({})", self.state, error);
        self.state = ExchangeState::Failed;
        self.pending = None;
        self.error = Some(error);
    }

    fn transition(&mut self, next: ExchangeState) -> MtprotoResult<()> {
        if self.state.can_transition_to(next) {
            tracing::debug!("key exchange: {:?} -> {:?}", self.state, next);
            self.state = next;
            Ok(())
        } else {
            Err(MtprotoError::UnexpectedCommand)
        }
    }
}

/// Minimal big-endian bytes of a factor.
fn be_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

/// Require `1 < value < p - 1`.
fn check_dh_range(value: &BigUint, p: &BigUint) -> MtprotoResult<()> {
    let one = BigUint::one();
    if *value <= one || *value >= p - &one {
        return Err(MtprotoError::BadDhValue);
    }
    Ok(())
}
