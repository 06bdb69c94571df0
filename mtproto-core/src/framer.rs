//! Message envelopes.
//!
//! Unencrypted (key exchange only):
//!
//! ```text
//! auth_key_id = 0 (8) | msg_id (8) | length (4) | payload
//! ```
//!
//! Encrypted:
//!
//! ```text
//! auth_key_id (8) | msg_key (16) | AES-IGE(
//!     salt (8) | session_id (8) | msg_id (8) | seq_no (4) | length (4) | payload | padding)
//! ```
//!
//! All integers little-endian.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthKey, AuthResult};
use crate::codec::padding_for;
use crate::crypto::{self, ct_eq, Direction};
use crate::error::{DecodeError, MtprotoError, MtprotoResult};
use crate::ige;
use crate::msgid::MessageIdGenerator;
use crate::tl::{Reader, Writer};

/// Unencrypted header: key id, msg id, length.
const PLAIN_HEADER_LEN: usize = 20;
/// Encrypted outer header: key id, msg_key.
const OUTER_HEADER_LEN: usize = 24;
/// Encrypted inner header: salt, session id, msg id, seq no, length.
const INNER_HEADER_LEN: usize = 32;
const BLOCK: usize = 16;

/// How a message is framed and sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Content-related; advances the sequence counter.
    Content,
    /// Service message (acks, pings); reuses the counter.
    Service,
    /// Handshake traffic; sent unencrypted.
    KeyExchange,
}

/// One message on either side of the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub payload: Vec<u8>,
    pub kind: MsgKind,
    /// Assigned by [`Framer::format`] on send, read from the wire on receive.
    pub msg_id: u64,
}

impl Msg {
    pub fn new(kind: MsgKind, payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind,
            msg_id: 0,
        }
    }

    pub fn content(payload: Vec<u8>) -> Self {
        Self::new(MsgKind::Content, payload)
    }

    pub fn service(payload: Vec<u8>) -> Self {
        Self::new(MsgKind::Service, payload)
    }

    pub fn key_exchange(payload: Vec<u8>) -> Self {
        Self::new(MsgKind::KeyExchange, payload)
    }
}

/// Mutable framing state that must survive a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramerState {
    /// Twice the number of content messages sent so far.
    pub seq_no: u32,
}

/// Decrypted contents of an encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub salt: u64,
    pub session_id: u64,
    pub msg_id: u64,
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

/// Encrypt `envelope` under `key` for the given direction.
pub fn seal<R: RngCore + ?Sized>(
    key: &AuthKey,
    direction: Direction,
    envelope: &Envelope,
    rng: &mut R,
) -> MtprotoResult<Vec<u8>> {
    let mut w = Writer::with_capacity(INNER_HEADER_LEN + envelope.payload.len() + BLOCK);
    w.write_u64(envelope.salt);
    w.write_u64(envelope.session_id);
    w.write_u64(envelope.msg_id);
    w.write_u32(envelope.seq_no);
    w.write_u32(u32::try_from(envelope.payload.len()).map_err(|_| DecodeError::Overflow {
        value: envelope.payload.len() as u128,
        bits: 32,
    })?);
    w.write_raw(&envelope.payload);
    let mut plain = w.finish()?;

    let msg_key = crypto::msg_key_for(&plain);
    let pad = padding_for(plain.len(), BLOCK);
    let start = plain.len();
    plain.resize(start + pad, 0);
    rng.fill_bytes(&mut plain[start..]);

    let (aes_key, aes_iv) = crypto::message_key_iv(key.as_bytes(), &msg_key, direction);
    ige::aes256_ige_encrypt(&aes_key, &aes_iv, &mut plain)?;

    let mut out = Vec::with_capacity(OUTER_HEADER_LEN + plain.len());
    out.extend_from_slice(&key.id().to_le_bytes());
    out.extend_from_slice(&msg_key);
    out.extend_from_slice(&plain);
    Ok(out)
}

/// Decrypt and authenticate an encrypted envelope.
pub fn open(key: &AuthKey, direction: Direction, raw: &[u8]) -> MtprotoResult<Envelope> {
    if raw.len() < OUTER_HEADER_LEN + INNER_HEADER_LEN
        || (raw.len() - OUTER_HEADER_LEN) % BLOCK != 0
    {
        return Err(MtprotoError::Crypto(format!(
            "encrypted envelope of {} bytes is malformed",
            raw.len()
        )));
    }
    let key_id = read_u64(raw);
    if key_id != key.id() {
        return Err(MtprotoError::UnknownAuthKeyId(key_id));
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&raw[8..OUTER_HEADER_LEN]);

    let (aes_key, aes_iv) = crypto::message_key_iv(key.as_bytes(), &msg_key, direction);
    let mut plain = raw[OUTER_HEADER_LEN..].to_vec();
    ige::aes256_ige_decrypt(&aes_key, &aes_iv, &mut plain)?;

    let mut r = Reader::new(&plain);
    let salt = r.read_u64();
    let session_id = r.read_u64();
    let msg_id = r.read_u64();
    let seq_no = r.read_u32();
    let len = r.read_u32() as usize;
    r.check()?;
    // Padding is at most one block short of alignment.
    if len > r.remaining() || r.remaining() - len >= BLOCK {
        return Err(MtprotoError::BadMsgKey);
    }
    if !ct_eq(&crypto::msg_key_for(&plain[..INNER_HEADER_LEN + len]), &msg_key) {
        return Err(MtprotoError::BadMsgKey);
    }
    Ok(Envelope {
        salt,
        session_id,
        msg_id,
        seq_no,
        payload: r.read_raw(len).to_vec(),
    })
}

/// Wrap a handshake payload in an unencrypted envelope.
pub fn seal_plain(msg_id: u64, payload: &[u8]) -> MtprotoResult<Vec<u8>> {
    let mut w = Writer::with_capacity(PLAIN_HEADER_LEN + payload.len());
    w.write_u64(0);
    w.write_u64(msg_id);
    w.write_u32(u32::try_from(payload.len()).map_err(|_| DecodeError::Overflow {
        value: payload.len() as u128,
        bits: 32,
    })?);
    w.write_raw(payload);
    Ok(w.finish()?)
}

/// Unwrap an unencrypted envelope into `(msg_id, payload)`.
pub fn open_plain(raw: &[u8]) -> MtprotoResult<(u64, Vec<u8>)> {
    let mut r = Reader::new(raw);
    let key_id = r.read_u64();
    let msg_id = r.read_u64();
    let len = r.read_u32() as usize;
    let payload = r.read_raw(len).to_vec();
    r.finish()?;
    if key_id != 0 {
        return Err(MtprotoError::UnknownAuthKeyId(key_id));
    }
    Ok((msg_id, payload))
}

/// Leading auth key id of any envelope.
pub fn auth_key_id(raw: &[u8]) -> Option<u64> {
    (raw.len() >= 8).then(|| read_u64(raw))
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(b)
}

/// Client-side envelope formatting and parsing.
#[derive(Debug, Default)]
pub struct Framer {
    state: FramerState,
    msg_ids: MessageIdGenerator,
    auth: Option<AuthResult>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with a known key and saved counters.
    pub fn with_auth(auth: AuthResult, state: FramerState) -> Self {
        let mut framer = Self::new();
        framer.restore(Some(auth), state);
        framer
    }

    /// Install the key produced by the key exchange.
    pub fn set_auth(&mut self, auth: AuthResult) {
        self.msg_ids.set_time_offset(auth.time_offset);
        self.auth = Some(auth);
    }

    pub fn auth(&self) -> Option<&AuthResult> {
        self.auth.as_ref()
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    /// Reinstate a snapshot taken with [`Framer::state`] and [`Framer::auth`].
    pub fn restore(&mut self, auth: Option<AuthResult>, state: FramerState) {
        self.state = state;
        match auth {
            Some(auth) => self.set_auth(auth),
            None => self.auth = None,
        }
    }

    /// Replace the salt after the server announces a new one.
    pub fn set_server_salt(&mut self, salt: u64) {
        if let Some(auth) = self.auth.as_mut() {
            tracing::debug!("server salt updated to {:#018x}", salt);
            auth.server_salt = salt;
        }
    }

    /// Assign `msg.msg_id` and produce the wire bytes.
    ///
    /// # Panics
    ///
    /// Panics if a content or service message is formatted before a key is
    /// installed.
    pub fn format<R: RngCore + ?Sized>(&mut self, msg: &mut Msg, rng: &mut R) -> MtprotoResult<Vec<u8>> {
        msg.msg_id = self.msg_ids.next();

        if msg.kind == MsgKind::KeyExchange {
            return seal_plain(msg.msg_id, &msg.payload);
        }

        let auth = match self.auth.as_ref() {
            Some(auth) => auth,
            None => panic!("{:?} message formatted before key exchange completed", msg.kind),
        };
        let seq_no = match msg.kind {
            MsgKind::Content => {
                let seq = self.state.seq_no.wrapping_add(1);
                self.state.seq_no = self.state.seq_no.wrapping_add(2);
                seq
            }
            _ => self.state.seq_no,
        };
        let envelope = Envelope {
            salt: auth.server_salt,
            session_id: auth.session_id,
            msg_id: msg.msg_id,
            seq_no,
            payload: msg.payload.clone(),
        };
        seal(&auth.key, Direction::ClientToServer, &envelope, rng)
    }

    /// Decode one inbound envelope.
    pub fn parse(&self, raw: &[u8]) -> MtprotoResult<Msg> {
        let key_id = auth_key_id(raw).ok_or(DecodeError::UnexpectedEof {
            needed: 8,
            remaining: raw.len(),
        })?;

        if key_id == 0 {
            let (msg_id, payload) = open_plain(raw)?;
            return Ok(Msg {
                payload,
                kind: MsgKind::KeyExchange,
                msg_id,
            });
        }

        let auth = self
            .auth
            .as_ref()
            .ok_or(MtprotoError::UnknownAuthKeyId(key_id))?;
        let envelope = open(&auth.key, Direction::ServerToClient, raw)?;
        if envelope.session_id != auth.session_id {
            return Err(MtprotoError::SessionMismatch);
        }
        let kind = if envelope.seq_no % 2 == 1 {
            MsgKind::Content
        } else {
            MsgKind::Service
        };
        Ok(Msg {
            payload: envelope.payload,
            kind,
            msg_id: envelope.msg_id,
        })
    }
}
