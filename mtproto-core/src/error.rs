//! Error types for the MTProto core.

use thiserror::Error;

/// Failure recorded by a sticky [`Reader`](crate::tl::Reader) or
/// [`Writer`](crate::tl::Writer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes remained than the value needs.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A blob length prefix used the reserved byte 255.
    #[error("invalid length prefix byte {0:#04x}")]
    InvalidLengthPrefix(u8),

    /// The decode finished with unread bytes left in the buffer.
    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),

    /// A boxed value carried a tag no constructor matches.
    #[error("unknown constructor {0:#010x}")]
    UnknownConstructor(u32),

    /// A value does not fit the target width.
    #[error("value {value} overflows {bits}-bit field")]
    Overflow { value: u128, bits: u32 },

    /// A gzip_packed payload did not inflate.
    #[error("malformed gzip_packed payload: {0}")]
    Compressed(String),

    /// A field decoded but holds a value the protocol forbids.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// MTProto core errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MtprotoError {
    /// Malformed wire data.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport error (connection, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Cryptographic primitive misuse (bad key/IV length, unaligned data).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An echoed nonce did not match the one we sent.
    #[error("bad nonce")]
    BadNonce,

    /// An echoed server nonce did not match the one from resPQ.
    #[error("bad server nonce")]
    BadServerNonce,

    /// A new_nonce confirmation hash did not match.
    #[error("bad new nonce hash")]
    BadNewNonceHash,

    /// None of the server's RSA fingerprints is pinned locally.
    #[error("fingerprint mismatch")]
    FingerprintMismatch,

    /// pq could not be split into two factors.
    #[error("failed to factorize pq {0}")]
    FactorizationFailed(u64),

    /// The server's DH modulus failed the primality test.
    #[error("DHPrime not prime")]
    DhPrimeNotPrime,

    /// g_a or g_b fell outside (1, p - 1).
    #[error("DH value out of range")]
    BadDhValue,

    /// A SHA1 digest carried inside an encrypted answer did not match.
    #[error("hash mismatch in encrypted answer")]
    HashMismatch,

    /// The server answered req_DH_params with server_DH_params_fail.
    #[error("server rejected DH params")]
    DhParamsFail,

    /// The server asked to retry set_client_DH_params.
    #[error("server requested DH generation retry")]
    DhGenRetry,

    /// The server answered set_client_DH_params with dh_gen_fail.
    #[error("DH generation failed")]
    DhGenFail,

    /// A handshake command arrived in a state that does not expect it.
    #[error("unexpected command")]
    UnexpectedCommand,

    /// The key exchange has not reached a terminal state.
    #[error("exchange not finished")]
    ExchangeNotFinished,

    /// An encrypted message names an auth key other than ours.
    #[error("unknown auth key ID {0:#018x}")]
    UnknownAuthKeyId(u64),

    /// The msg_key does not match the decrypted plaintext.
    #[error("msg_key mismatch")]
    BadMsgKey,

    /// A decrypted message belongs to another session.
    #[error("session ID mismatch")]
    SessionMismatch,

    /// The persisted state blob carries a version we do not read.
    #[error("unsupported state version {0:#010x}")]
    UnsupportedStateVersion(u32),

    /// The session has stopped and no longer accepts work.
    #[error("session closed")]
    SessionClosed,
}

impl From<std::io::Error> for MtprotoError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::Transport(e.to_string()),
        }
    }
}

/// Result type alias for MTProto operations.
pub type MtprotoResult<T> = Result<T, MtprotoError>;
