//! Snapshot of everything a client needs to resume without a new handshake.
//!
//! The blob is TL-encoded and starts with a version tag. Any other tag is
//! rejected outright; there is no migration.

use serde::{Deserialize, Serialize};

use crate::auth::{AuthKey, AuthResult, AUTH_KEY_LEN};
use crate::error::{DecodeError, MtprotoError, MtprotoResult};
use crate::framer::FramerState;
use crate::tl::{Reader, Writer};

/// Tag of the only blob layout this build understands.
pub const STATE_VERSION: u32 = 1;

/// A known datacenter address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcOption {
    pub id: i32,
    pub ip: String,
    pub port: u16,
}

impl DcOption {
    pub fn new(id: i32, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            ip: ip.into(),
            port,
        }
    }

    /// `ip:port`, suitable for a socket connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Resumable client state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub dcs: Vec<DcOption>,
    pub auth: Option<AuthResult>,
    pub framer: FramerState,
}

impl PersistedState {
    pub fn encode(&self) -> MtprotoResult<Vec<u8>> {
        let mut w = Writer::new();
        w.write_u32(STATE_VERSION);
        w.write_vector(&self.dcs, |w, dc| {
            w.write_i32(dc.id);
            w.write_string(&dc.ip);
            w.write_u32(u32::from(dc.port));
        });
        match &self.auth {
            Some(auth) => {
                w.write_bool(true);
                w.write_bytes(auth.key.as_bytes());
                w.write_u64(auth.server_salt);
                w.write_u64(auth.session_id);
                w.write_i64(auth.time_offset);
            }
            None => w.write_bool(false),
        }
        w.write_u32(self.framer.seq_no);
        Ok(w.finish()?)
    }

    pub fn decode(blob: &[u8]) -> MtprotoResult<Self> {
        let mut r = Reader::new(blob);
        let version = r.read_u32();
        r.check()?;
        if version != STATE_VERSION {
            return Err(MtprotoError::UnsupportedStateVersion(version));
        }

        let dcs = r.read_vector(|r| {
            let id = r.read_i32();
            let ip = r.read_string();
            let port = r.read_u32();
            let port = u16::try_from(port).unwrap_or_else(|_| {
                r.fail(DecodeError::InvalidValue(format!("port {port}")));
                0
            });
            DcOption { id, ip, port }
        });

        let auth = if r.read_bool() {
            let key = r.read_bytes();
            let server_salt = r.read_u64();
            let session_id = r.read_u64();
            let time_offset = r.read_i64();
            r.check()?;
            let key: [u8; AUTH_KEY_LEN] = key.try_into().map_err(|k: Vec<u8>| {
                DecodeError::InvalidValue(format!("auth key of {} bytes", k.len()))
            })?;
            Some(AuthResult {
                key: AuthKey::from_bytes(key),
                server_salt,
                session_id,
                time_offset,
            })
        } else {
            None
        };

        let seq_no = r.read_u32();
        r.finish()?;
        Ok(Self {
            dcs,
            auth,
            framer: FramerState { seq_no },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedState {
        PersistedState {
            dcs: vec![
                DcOption::new(2, "149.154.167.50", 443),
                DcOption::new(4, "149.154.167.91", 443),
            ],
            auth: Some(AuthResult {
                key: AuthKey::from_bytes([0x5A; AUTH_KEY_LEN]),
                server_salt: 0x0102030405060708,
                session_id: 99,
                time_offset: -3,
            }),
            framer: FramerState { seq_no: 14 },
        }
    }

    #[test]
    fn restores_what_was_saved() {
        let state = sample();
        let blob = state.encode().unwrap();
        assert_eq!(&blob[..4], &STATE_VERSION.to_le_bytes());
        let restored = PersistedState::decode(&blob).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.auth.unwrap().key_id(), state.auth.unwrap().key_id());
    }

    #[test]
    fn empty_state() {
        let blob = PersistedState::default().encode().unwrap();
        assert_eq!(PersistedState::decode(&blob).unwrap(), PersistedState::default());
    }

    #[test]
    fn unknown_version_fails_closed() {
        let mut blob = sample().encode().unwrap();
        blob[..4].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(
            PersistedState::decode(&blob),
            Err(MtprotoError::UnsupportedStateVersion(2))
        );
    }

    #[test]
    fn truncated_or_padded_blob_rejected() {
        let blob = sample().encode().unwrap();
        assert!(PersistedState::decode(&blob[..blob.len() - 1]).is_err());
        assert!(PersistedState::decode(&blob[..2]).is_err());

        let mut longer = blob.clone();
        longer.extend_from_slice(&[0; 4]);
        assert!(PersistedState::decode(&longer).is_err());
    }

    #[test]
    fn dc_option_json() {
        let dc = DcOption::new(2, "149.154.167.50", 443);
        let json = serde_json::to_string(&dc).unwrap();
        assert_eq!(json, r#"{"id":2,"ip":"149.154.167.50","port":443}"#);
        assert_eq!(dc.addr(), "149.154.167.50:443");
    }
}
