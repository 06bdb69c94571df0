//! Constructor definitions for the key exchange and the service layer.
//!
//! Application messages stay opaque to the core; only the types the
//! handshake and session bookkeeping need are spelled out here, grouped into
//! closed families with exhaustive tag dispatch.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::DecodeError;
use crate::tl::{Deserializable, Identifiable, Reader, Serializable, TlFamily, Writer};

pub type Int128 = [u8; 16];
pub type Int256 = [u8; 32];

// ---------------------------------------------------------------------------
// Key exchange
// ---------------------------------------------------------------------------

/// `req_pq#60469778 nonce:int128 = ResPQ`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqPq {
    pub nonce: Int128,
}

impl Identifiable for ReqPq {
    const CONSTRUCTOR_ID: u32 = 0x60469778;
}

impl Serializable for ReqPq {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
    }
}

impl Deserializable for ReqPq {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
        }
    }
}

/// `resPQ#05162463 nonce:int128 server_nonce:int128 pq:string
/// server_public_key_fingerprints:Vector<long> = ResPQ`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResPq {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub pq: Vec<u8>,
    pub fingerprints: Vec<u64>,
}

impl Identifiable for ResPq {
    const CONSTRUCTOR_ID: u32 = 0x05162463;
}

impl Serializable for ResPq {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_bytes(&self.pq);
        w.write_vector(&self.fingerprints, |w, f| w.write_u64(*f));
    }
}

impl Deserializable for ResPq {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            pq: r.read_bytes(),
            fingerprints: r.read_vector(|r| r.read_u64()),
        }
    }
}

/// `p_q_inner_data#83c95aec pq:string p:string q:string nonce:int128
/// server_nonce:int128 new_nonce:int256 = P_Q_inner_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqInnerData {
    pub pq: Vec<u8>,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub new_nonce: Int256,
}

impl Identifiable for PqInnerData {
    const CONSTRUCTOR_ID: u32 = 0x83c95aec;
}

impl Serializable for PqInnerData {
    fn serialize(&self, w: &mut Writer) {
        w.write_bytes(&self.pq);
        w.write_bytes(&self.p);
        w.write_bytes(&self.q);
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_int256(&self.new_nonce);
    }
}

impl Deserializable for PqInnerData {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            pq: r.read_bytes(),
            p: r.read_bytes(),
            q: r.read_bytes(),
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            new_nonce: r.read_int256(),
        }
    }
}

/// `req_DH_params#d712e4be nonce:int128 server_nonce:int128 p:string
/// q:string public_key_fingerprint:long encrypted_data:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqDhParams {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub public_key_fingerprint: u64,
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for ReqDhParams {
    const CONSTRUCTOR_ID: u32 = 0xd712e4be;
}

impl Serializable for ReqDhParams {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_bytes(&self.p);
        w.write_bytes(&self.q);
        w.write_u64(self.public_key_fingerprint);
        w.write_bytes(&self.encrypted_data);
    }
}

impl Deserializable for ReqDhParams {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            p: r.read_bytes(),
            q: r.read_bytes(),
            public_key_fingerprint: r.read_u64(),
            encrypted_data: r.read_bytes(),
        }
    }
}

/// `server_DH_params_ok#d0e8075c nonce:int128 server_nonce:int128
/// encrypted_answer:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDhParamsOk {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub encrypted_answer: Vec<u8>,
}

impl Identifiable for ServerDhParamsOk {
    const CONSTRUCTOR_ID: u32 = 0xd0e8075c;
}

impl Serializable for ServerDhParamsOk {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_bytes(&self.encrypted_answer);
    }
}

impl Deserializable for ServerDhParamsOk {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            encrypted_answer: r.read_bytes(),
        }
    }
}

/// `server_DH_params_fail#79cb045d nonce:int128 server_nonce:int128
/// new_nonce_hash:int128`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDhParamsFail {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub new_nonce_hash: Int128,
}

impl Identifiable for ServerDhParamsFail {
    const CONSTRUCTOR_ID: u32 = 0x79cb045d;
}

impl Serializable for ServerDhParamsFail {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_int128(&self.new_nonce_hash);
    }
}

impl Deserializable for ServerDhParamsFail {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            new_nonce_hash: r.read_int128(),
        }
    }
}

/// `server_DH_inner_data#b5890dba nonce:int128 server_nonce:int128 g:int
/// dh_prime:string g_a:string server_time:int`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDhInnerData {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub g: i32,
    pub dh_prime: Vec<u8>,
    pub g_a: Vec<u8>,
    pub server_time: i32,
}

impl Identifiable for ServerDhInnerData {
    const CONSTRUCTOR_ID: u32 = 0xb5890dba;
}

impl Serializable for ServerDhInnerData {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_i32(self.g);
        w.write_bytes(&self.dh_prime);
        w.write_bytes(&self.g_a);
        w.write_i32(self.server_time);
    }
}

impl Deserializable for ServerDhInnerData {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            g: r.read_i32(),
            dh_prime: r.read_bytes(),
            g_a: r.read_bytes(),
            server_time: r.read_i32(),
        }
    }
}

/// `client_DH_inner_data#6643b654 nonce:int128 server_nonce:int128
/// retry_id:long g_b:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDhInnerData {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub retry_id: u64,
    pub g_b: Vec<u8>,
}

impl Identifiable for ClientDhInnerData {
    const CONSTRUCTOR_ID: u32 = 0x6643b654;
}

impl Serializable for ClientDhInnerData {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_u64(self.retry_id);
        w.write_bytes(&self.g_b);
    }
}

impl Deserializable for ClientDhInnerData {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            retry_id: r.read_u64(),
            g_b: r.read_bytes(),
        }
    }
}

/// `set_client_DH_params#f5045f1f nonce:int128 server_nonce:int128
/// encrypted_data:string`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetClientDhParams {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for SetClientDhParams {
    const CONSTRUCTOR_ID: u32 = 0xf5045f1f;
}

impl Serializable for SetClientDhParams {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_bytes(&self.encrypted_data);
    }
}

impl Deserializable for SetClientDhParams {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            encrypted_data: r.read_bytes(),
        }
    }
}

/// Body shared by `dh_gen_ok`, `dh_gen_retry` and `dh_gen_fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGenAnswer {
    pub nonce: Int128,
    pub server_nonce: Int128,
    pub new_nonce_hash: Int128,
}

impl Serializable for DhGenAnswer {
    fn serialize(&self, w: &mut Writer) {
        w.write_int128(&self.nonce);
        w.write_int128(&self.server_nonce);
        w.write_int128(&self.new_nonce_hash);
    }
}

impl Deserializable for DhGenAnswer {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            nonce: r.read_int128(),
            server_nonce: r.read_int128(),
            new_nonce_hash: r.read_int128(),
        }
    }
}

pub const DH_GEN_OK: u32 = 0x3bcbf734;
pub const DH_GEN_RETRY: u32 = 0x46dc1fb9;
pub const DH_GEN_FAIL: u32 = 0xa69dae02;

/// Everything the server may send during the key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResponse {
    ResPq(ResPq),
    ServerDhParamsOk(ServerDhParamsOk),
    ServerDhParamsFail(ServerDhParamsFail),
    DhGenOk(DhGenAnswer),
    DhGenRetry(DhGenAnswer),
    DhGenFail(DhGenAnswer),
}

impl TlFamily for HandshakeResponse {
    fn from_tag(tag: u32, r: &mut Reader<'_>) -> Option<Self> {
        Some(match tag {
            ResPq::CONSTRUCTOR_ID => Self::ResPq(ResPq::deserialize(r)),
            ServerDhParamsOk::CONSTRUCTOR_ID => {
                Self::ServerDhParamsOk(ServerDhParamsOk::deserialize(r))
            }
            ServerDhParamsFail::CONSTRUCTOR_ID => {
                Self::ServerDhParamsFail(ServerDhParamsFail::deserialize(r))
            }
            DH_GEN_OK => Self::DhGenOk(DhGenAnswer::deserialize(r)),
            DH_GEN_RETRY => Self::DhGenRetry(DhGenAnswer::deserialize(r)),
            DH_GEN_FAIL => Self::DhGenFail(DhGenAnswer::deserialize(r)),
            _ => return None,
        })
    }

    fn tag(&self) -> u32 {
        match self {
            Self::ResPq(_) => ResPq::CONSTRUCTOR_ID,
            Self::ServerDhParamsOk(_) => ServerDhParamsOk::CONSTRUCTOR_ID,
            Self::ServerDhParamsFail(_) => ServerDhParamsFail::CONSTRUCTOR_ID,
            Self::DhGenOk(_) => DH_GEN_OK,
            Self::DhGenRetry(_) => DH_GEN_RETRY,
            Self::DhGenFail(_) => DH_GEN_FAIL,
        }
    }
}

impl HandshakeResponse {
    /// Serialize with the variant's tag.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let mut w = Writer::new();
        w.write_u32(self.tag());
        match self {
            Self::ResPq(v) => v.serialize(&mut w),
            Self::ServerDhParamsOk(v) => v.serialize(&mut w),
            Self::ServerDhParamsFail(v) => v.serialize(&mut w),
            Self::DhGenOk(v) | Self::DhGenRetry(v) | Self::DhGenFail(v) => v.serialize(&mut w),
        }
        w.finish()
    }
}

/// Everything the client may send during the key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    ReqPq(ReqPq),
    ReqDhParams(ReqDhParams),
    SetClientDhParams(SetClientDhParams),
}

impl TlFamily for HandshakeRequest {
    fn from_tag(tag: u32, r: &mut Reader<'_>) -> Option<Self> {
        Some(match tag {
            ReqPq::CONSTRUCTOR_ID => Self::ReqPq(ReqPq::deserialize(r)),
            ReqDhParams::CONSTRUCTOR_ID => Self::ReqDhParams(ReqDhParams::deserialize(r)),
            SetClientDhParams::CONSTRUCTOR_ID => {
                Self::SetClientDhParams(SetClientDhParams::deserialize(r))
            }
            _ => return None,
        })
    }

    fn tag(&self) -> u32 {
        match self {
            Self::ReqPq(_) => ReqPq::CONSTRUCTOR_ID,
            Self::ReqDhParams(_) => ReqDhParams::CONSTRUCTOR_ID,
            Self::SetClientDhParams(_) => SetClientDhParams::CONSTRUCTOR_ID,
        }
    }
}

// ---------------------------------------------------------------------------
// Service messages
// ---------------------------------------------------------------------------

pub const MSG_CONTAINER: u32 = 0x73f1f8dc;
pub const RPC_RESULT: u32 = 0xf35c6d01;
pub const RPC_ERROR: u32 = 0x2144ca19;
pub const MSGS_ACK: u32 = 0x62d6b459;
pub const PING: u32 = 0x7abe77ec;
pub const PONG: u32 = 0x347773c5;
pub const NEW_SESSION_CREATED: u32 = 0x9ec20908;
pub const BAD_SERVER_SALT: u32 = 0xedab447b;
pub const BAD_MSG_NOTIFICATION: u32 = 0xa7eff811;
pub const GZIP_PACKED: u32 = 0x3072cfa1;

/// Largest payload a gzip_packed object may inflate to.
pub const MAX_UNPACKED_LEN: usize = 16 << 20;

/// Inflate the `packed_data` of a gzip_packed object, refusing output
/// longer than `limit`.
pub fn unpack_gzip(packed_data: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(packed_data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Compressed(e.to_string()))?;
    if out.len() > limit {
        return Err(DecodeError::InvalidValue(format!(
            "gzip_packed inflates past {limit} bytes"
        )));
    }
    Ok(out)
}

/// One message inside a `msg_container`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainedMessage {
    pub msg_id: u64,
    pub seq_no: u32,
    pub body: Vec<u8>,
}

/// `msgs_ack#62d6b459 msg_ids:Vector<long>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgsAck {
    pub msg_ids: Vec<u64>,
}

impl Identifiable for MsgsAck {
    const CONSTRUCTOR_ID: u32 = MSGS_ACK;
}

impl Serializable for MsgsAck {
    fn serialize(&self, w: &mut Writer) {
        w.write_vector(&self.msg_ids, |w, id| w.write_u64(*id));
    }
}

impl Deserializable for MsgsAck {
    fn deserialize(r: &mut Reader<'_>) -> Self {
        Self {
            msg_ids: r.read_vector(|r| r.read_u64()),
        }
    }
}

/// `pong#347773c5 msg_id:long ping_id:long`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub msg_id: u64,
    pub ping_id: u64,
}

impl Identifiable for Pong {
    const CONSTRUCTOR_ID: u32 = PONG;
}

impl Serializable for Pong {
    fn serialize(&self, w: &mut Writer) {
        w.write_u64(self.msg_id);
        w.write_u64(self.ping_id);
    }
}

/// `ping#7abe77ec ping_id:long`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub ping_id: u64,
}

impl Identifiable for Ping {
    const CONSTRUCTOR_ID: u32 = PING;
}

impl Serializable for Ping {
    fn serialize(&self, w: &mut Writer) {
        w.write_u64(self.ping_id);
    }
}

/// Decoded service-layer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    Container(Vec<ContainedMessage>),
    RpcResult { req_msg_id: u64, body: Vec<u8> },
    RpcError { error_code: i32, error_message: String },
    MsgsAck(MsgsAck),
    Ping(Ping),
    Pong(Pong),
    NewSessionCreated {
        first_msg_id: u64,
        unique_id: u64,
        server_salt: u64,
    },
    BadServerSalt {
        bad_msg_id: u64,
        bad_msg_seqno: u32,
        error_code: i32,
        new_server_salt: u64,
    },
    BadMsgNotification {
        bad_msg_id: u64,
        bad_msg_seqno: u32,
        error_code: i32,
    },
    /// `gzip_packed#3072cfa1 packed_data:bytes`, still compressed.
    GzipPacked(Vec<u8>),
}

impl TlFamily for ServiceMessage {
    fn from_tag(tag: u32, r: &mut Reader<'_>) -> Option<Self> {
        Some(match tag {
            MSG_CONTAINER => {
                let count = r.read_u32() as usize;
                // msg_id + seqno + length header per entry
                if count > r.remaining() / 16 {
                    r.fail(DecodeError::InvalidValue(format!(
                        "container claims {count} messages"
                    )));
                    return Some(Self::Container(Vec::new()));
                }
                let mut messages = Vec::with_capacity(count);
                for _ in 0..count {
                    let msg_id = r.read_u64();
                    let seq_no = r.read_u32();
                    let len = r.read_u32() as usize;
                    let body = r.read_raw(len).to_vec();
                    if r.has_failed() {
                        break;
                    }
                    messages.push(ContainedMessage {
                        msg_id,
                        seq_no,
                        body,
                    });
                }
                Self::Container(messages)
            }
            RPC_RESULT => {
                let req_msg_id = r.read_u64();
                let body = r.read_raw(r.remaining()).to_vec();
                Self::RpcResult { req_msg_id, body }
            }
            RPC_ERROR => Self::RpcError {
                error_code: r.read_i32(),
                error_message: r.read_string(),
            },
            MSGS_ACK => Self::MsgsAck(MsgsAck::deserialize(r)),
            PING => Self::Ping(Ping {
                ping_id: r.read_u64(),
            }),
            PONG => Self::Pong(Pong {
                msg_id: r.read_u64(),
                ping_id: r.read_u64(),
            }),
            NEW_SESSION_CREATED => Self::NewSessionCreated {
                first_msg_id: r.read_u64(),
                unique_id: r.read_u64(),
                server_salt: r.read_u64(),
            },
            BAD_SERVER_SALT => Self::BadServerSalt {
                bad_msg_id: r.read_u64(),
                bad_msg_seqno: r.read_u32(),
                error_code: r.read_i32(),
                new_server_salt: r.read_u64(),
            },
            BAD_MSG_NOTIFICATION => Self::BadMsgNotification {
                bad_msg_id: r.read_u64(),
                bad_msg_seqno: r.read_u32(),
                error_code: r.read_i32(),
            },
            GZIP_PACKED => Self::GzipPacked(r.read_bytes()),
            _ => return None,
        })
    }

    fn tag(&self) -> u32 {
        match self {
            Self::Container(_) => MSG_CONTAINER,
            Self::RpcResult { .. } => RPC_RESULT,
            Self::RpcError { .. } => RPC_ERROR,
            Self::MsgsAck(_) => MSGS_ACK,
            Self::Ping(_) => PING,
            Self::Pong(_) => PONG,
            Self::NewSessionCreated { .. } => NEW_SESSION_CREATED,
            Self::BadServerSalt { .. } => BAD_SERVER_SALT,
            Self::BadMsgNotification { .. } => BAD_MSG_NOTIFICATION,
            Self::GzipPacked(_) => GZIP_PACKED,
        }
    }
}

impl ServiceMessage {
    /// Decode `payload` if it is a service message.
    ///
    /// Returns `Ok(None)` for anything else, which the caller hands to the
    /// application untouched. A gzip_packed payload comes back as
    /// [`ServiceMessage::GzipPacked`] for the caller to inflate.
    pub fn classify(payload: &[u8]) -> Result<Option<Self>, DecodeError> {
        let reader = Reader::new(payload);
        match reader.peek_tag() {
            Some(
                MSG_CONTAINER | RPC_RESULT | RPC_ERROR | MSGS_ACK | PING | PONG
                | NEW_SESSION_CREATED | BAD_SERVER_SALT | BAD_MSG_NOTIFICATION | GZIP_PACKED,
            ) => crate::tl::from_boxed_bytes(payload).map(Some),
            _ => Ok(None),
        }
    }

    /// Serialize a container holding `messages`.
    pub fn container_bytes(messages: &[ContainedMessage]) -> Result<Vec<u8>, DecodeError> {
        let mut w = Writer::new();
        w.write_u32(MSG_CONTAINER);
        w.write_u32(messages.len() as u32);
        for m in messages {
            w.write_u64(m.msg_id);
            w.write_u32(m.seq_no);
            w.write_u32(m.body.len() as u32);
            w.write_raw(&m.body);
        }
        w.finish()
    }
}
