//! Session event loop.
//!
//! Each connection runs two tasks. The receive loop only reads frames and
//! forwards them. The dispatch loop is the sole owner of the framer, the key
//! exchange and the auth key; callers reach it through channels.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, oneshot};

use mtproto_core::schema::{self, MsgsAck, Pong, ServiceMessage, MAX_UNPACKED_LEN};
use mtproto_core::{
    tl, AuthResult, DcOption, DecodeError, Framer, FramerState, KeyExchange, Msg, MsgKind,
    MtprotoError, MtprotoResult, PersistedState, RsaPublicKey,
};

use crate::config::ClientConfig;
use crate::connection::{FrameReader, FrameWriter};

/// Handed to the caller once the session holds an auth key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub auth: AuthResult,
    pub framer: FramerState,
}

/// Server traffic the application gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Anything that is not a service message.
    Message { msg_id: u64, payload: Vec<u8> },
    /// Successful answer to request `req_msg_id`.
    RpcResult { req_msg_id: u64, body: Vec<u8> },
    /// Error answer to request `req_msg_id`.
    RpcError {
        req_msg_id: u64,
        code: i32,
        message: String,
    },
}

/// Requests from the client handle to the dispatch loop.
#[derive(Debug)]
pub enum Command {
    /// Send a content message; the reply carries its message ID.
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<MtprotoResult<u64>>,
    },
    /// Snapshot the resumable state.
    Snapshot(oneshot::Sender<PersistedState>),
    /// Stop the session.
    Close,
}

/// Limits applied to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_frame_size: usize,
    pub queue_capacity: usize,
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            queue_capacity: config.queue_capacity,
        }
    }
}

impl SessionOptions {
    /// Channel capacity; tokio channels need at least one slot.
    pub fn channel_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

type Reply = oneshot::Sender<MtprotoResult<u64>>;

/// Keeps the first error; later ones are only logged.
#[derive(Debug, Default)]
struct FailureSlot(Option<MtprotoError>);

impl FailureSlot {
    fn record(&mut self, error: MtprotoError) {
        if self.0.is_some() {
            tracing::debug!("ignoring error after failure: {}", error);
            return;
        }
        tracing::error!("session failed: {}", error);
        self.0 = Some(error);
    }

    fn into_result(self) -> MtprotoResult<()> {
        match self.0 {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Protocol state for one connection.
pub struct Session {
    framer: Framer,
    exchange: KeyExchange,
    rng: StdRng,
    dcs: Vec<DcOption>,
    options: SessionOptions,
    ready: Option<oneshot::Sender<Ready>>,
    /// Sends issued before the auth key existed.
    queued: VecDeque<(Vec<u8>, Reply)>,
    /// Content messages received and not yet acknowledged.
    acks: Vec<u64>,
    replies: Vec<Msg>,
    /// Messages waiting for room in the application's queue.
    deliveries: VecDeque<Incoming>,
}

impl Session {
    /// A fresh session that will run the key exchange against `keys`.
    pub fn new(keys: Vec<RsaPublicKey>, options: SessionOptions) -> Self {
        Self {
            framer: Framer::new(),
            exchange: KeyExchange::new(keys),
            rng: StdRng::from_entropy(),
            dcs: Vec::new(),
            options,
            ready: None,
            queued: VecDeque::new(),
            acks: Vec::new(),
            replies: Vec::new(),
            deliveries: VecDeque::new(),
        }
    }

    /// Replace the OS-seeded generator.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_dcs(mut self, dcs: Vec<DcOption>) -> Self {
        self.dcs = dcs;
        self
    }

    /// Resume from a snapshot. A snapshot with an auth key skips the
    /// key exchange entirely.
    pub fn restore(mut self, state: PersistedState) -> Self {
        self.framer.restore(state.auth, state.framer);
        self.dcs = state.dcs;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.framer.auth().is_some()
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            dcs: self.dcs.clone(),
            auth: self.framer.auth().cloned(),
            framer: self.framer.state(),
        }
    }

    /// Drive the session until the transport fails, the peer hangs up or
    /// [`Command::Close`] arrives. Returns the first error seen.
    ///
    /// Delivery to `events` never blocks the loop. While the application
    /// lags a full queue behind, no further frames are read, but commands
    /// are still served.
    pub async fn run<S>(
        mut self,
        stream: S,
        mut commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<Incoming>,
        ready: oneshot::Sender<Ready>,
    ) -> MtprotoResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(writer);
        let (frame_tx, mut frames) = mpsc::channel(self.options.channel_capacity());
        let receiver = tokio::spawn(receive_loop(
            FrameReader::new(reader, self.options.max_frame_size),
            frame_tx,
        ));
        self.ready = Some(ready);

        let mut failure = FailureSlot::default();
        match self.begin(&mut writer).await {
            Err(e) => failure.record(e),
            Ok(()) => loop {
                let reading = self.deliveries.len() < self.options.channel_capacity();
                let delivering = !self.deliveries.is_empty();
                tokio::select! {
                    // Hand over decoded messages before reading more, so a
                    // hang-up never overtakes them.
                    biased;

                    permit = events.reserve(), if delivering => match permit {
                        Ok(permit) => {
                            if let Some(incoming) = self.deliveries.pop_front() {
                                permit.send(incoming);
                            }
                        }
                        Err(_) => {
                            tracing::trace!(
                                "application stopped receiving; dropping {} messages",
                                self.deliveries.len()
                            );
                            self.deliveries.clear();
                        }
                    },
                    command = commands.recv() => match command {
                        Some(Command::Send { payload, reply }) => {
                            if let Err(e) = self.on_send(payload, reply, &mut writer).await {
                                failure.record(e);
                                break;
                            }
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Close) | None => {
                            tracing::debug!("session closed by client");
                            break;
                        }
                    },
                    frame = frames.recv(), if reading => match frame {
                        Some(Ok(raw)) => {
                            if let Err(e) = self.on_frame(&raw, &mut writer).await {
                                failure.record(e);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            failure.record(e);
                            break;
                        }
                        None => {
                            failure.record(MtprotoError::ConnectionClosed);
                            break;
                        }
                    },
                }
            },
        }

        receiver.abort();
        let _ = writer.shutdown().await;
        for (_, reply) in self.queued.drain(..) {
            let _ = reply.send(Err(MtprotoError::SessionClosed));
        }
        failure.into_result()
    }

    async fn begin<W>(&mut self, writer: &mut FrameWriter<W>) -> MtprotoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.is_ready() {
            tracing::debug!("resuming with a stored auth key");
            self.signal_ready();
            return Ok(());
        }
        let request = self.exchange.start(&mut self.rng)?;
        self.send_msg(writer, Msg::key_exchange(request)).await?;
        Ok(())
    }

    async fn on_frame<W>(&mut self, raw: &[u8], writer: &mut FrameWriter<W>) -> MtprotoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let msg = self.framer.parse(raw)?;
        tracing::trace!(
            "received {:?} message {:#x} ({} bytes)",
            msg.kind,
            msg.msg_id,
            msg.payload.len()
        );
        match msg.kind {
            MsgKind::KeyExchange => self.on_key_exchange(&msg.payload, writer).await,
            kind => {
                self.on_message(msg.msg_id, kind, &msg.payload, false)?;
                self.flush(writer).await
            }
        }
    }

    async fn on_key_exchange<W>(
        &mut self,
        payload: &[u8],
        writer: &mut FrameWriter<W>,
    ) -> MtprotoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(request) = self.exchange.handle(payload, &mut self.rng)? {
            self.send_msg(writer, Msg::key_exchange(request)).await?;
        }
        if !self.exchange.is_done() {
            return Ok(());
        }

        let auth = self.exchange.result()?;
        tracing::info!("auth key {:#018x} established", auth.key_id());
        self.framer.set_auth(auth);
        self.signal_ready();

        while let Some((payload, reply)) = self.queued.pop_front() {
            match self.send_msg(writer, Msg::content(payload)).await {
                Ok(msg_id) => {
                    let _ = reply.send(Ok(msg_id));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.clone()));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn on_send<W>(
        &mut self,
        payload: Vec<u8>,
        reply: Reply,
        writer: &mut FrameWriter<W>,
    ) -> MtprotoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.is_ready() {
            tracing::debug!("queueing send until the key exchange completes");
            self.queued.push_back((payload, reply));
            return Ok(());
        }
        match self.send_msg(writer, Msg::content(payload)).await {
            Ok(msg_id) => {
                let _ = reply.send(Ok(msg_id));
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Handle one decrypted message, unwrapping a container if needed.
    fn on_message(
        &mut self,
        msg_id: u64,
        kind: MsgKind,
        payload: &[u8],
        in_container: bool,
    ) -> MtprotoResult<()> {
        if kind == MsgKind::Content {
            self.acks.push(msg_id);
        }
        self.dispatch(msg_id, payload, in_container, false)
    }

    fn dispatch(
        &mut self,
        msg_id: u64,
        payload: &[u8],
        in_container: bool,
        unpacked: bool,
    ) -> MtprotoResult<()> {
        let service = match ServiceMessage::classify(payload)? {
            Some(service) => service,
            None => {
                self.deliveries.push_back(Incoming::Message {
                    msg_id,
                    payload: payload.to_vec(),
                });
                return Ok(());
            }
        };

        match service {
            ServiceMessage::GzipPacked(packed) => {
                if unpacked {
                    return Err(DecodeError::InvalidValue("nested gzip_packed".to_string()).into());
                }
                let inner = schema::unpack_gzip(&packed, MAX_UNPACKED_LEN)?;
                tracing::trace!("inflated {} bytes to {}", packed.len(), inner.len());
                return self.dispatch(msg_id, &inner, in_container, true);
            }
            ServiceMessage::Container(messages) => {
                if in_container {
                    return Err(DecodeError::InvalidValue("nested msg_container".to_string()).into());
                }
                for m in messages {
                    let kind = if m.seq_no % 2 == 1 {
                        MsgKind::Content
                    } else {
                        MsgKind::Service
                    };
                    self.on_message(m.msg_id, kind, &m.body, true)?;
                }
            }
            ServiceMessage::RpcResult { req_msg_id, body } => {
                let body = match ServiceMessage::classify(&body)? {
                    Some(ServiceMessage::GzipPacked(packed)) => {
                        schema::unpack_gzip(&packed, MAX_UNPACKED_LEN)?
                    }
                    _ => body,
                };
                match ServiceMessage::classify(&body)? {
                    Some(ServiceMessage::RpcError {
                        error_code,
                        error_message,
                    }) => self.deliveries.push_back(Incoming::RpcError {
                        req_msg_id,
                        code: error_code,
                        message: error_message,
                    }),
                    _ => self
                        .deliveries
                        .push_back(Incoming::RpcResult { req_msg_id, body }),
                }
            }
            ServiceMessage::RpcError {
                error_code,
                error_message,
            } => {
                tracing::warn!("rpc_error {} outside rpc_result: {}", error_code, error_message);
            }
            ServiceMessage::MsgsAck(ack) => {
                tracing::trace!("server acknowledged {} messages", ack.msg_ids.len());
            }
            ServiceMessage::Ping(ping) => {
                let pong = Pong {
                    msg_id,
                    ping_id: ping.ping_id,
                };
                self.replies.push(Msg::service(tl::to_boxed_bytes(&pong)?));
            }
            ServiceMessage::Pong(pong) => {
                tracing::trace!("pong for ping {:#x}", pong.ping_id);
            }
            ServiceMessage::NewSessionCreated { server_salt, .. } => {
                tracing::debug!("server created a new session");
                self.framer.set_server_salt(server_salt);
            }
            ServiceMessage::BadServerSalt {
                bad_msg_id,
                new_server_salt,
                ..
            } => {
                tracing::warn!("message {:#x} rejected for a stale salt", bad_msg_id);
                self.framer.set_server_salt(new_server_salt);
            }
            ServiceMessage::BadMsgNotification {
                bad_msg_id,
                error_code,
                ..
            } => {
                tracing::warn!("server rejected message {:#x} with code {}", bad_msg_id, error_code);
            }
        }
        Ok(())
    }

    /// Send pending acks and replies.
    async fn flush<W>(&mut self, writer: &mut FrameWriter<W>) -> MtprotoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.acks.is_empty() {
            let ack = MsgsAck {
                msg_ids: std::mem::take(&mut self.acks),
            };
            self.replies.push(Msg::service(tl::to_boxed_bytes(&ack)?));
        }
        for msg in std::mem::take(&mut self.replies) {
            self.send_msg(writer, msg).await?;
        }
        Ok(())
    }

    async fn send_msg<W>(&mut self, writer: &mut FrameWriter<W>, mut msg: Msg) -> MtprotoResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let raw = self.framer.format(&mut msg, &mut self.rng)?;
        writer.write_frame(&raw).await?;
        tracing::trace!("sent {:?} message {:#x}", msg.kind, msg.msg_id);
        Ok(msg.msg_id)
    }

    fn signal_ready(&mut self) {
        let Some(auth) = self.framer.auth().cloned() else {
            return;
        };
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Ready {
                auth,
                framer: self.framer.state(),
            });
        }
    }
}

/// Forward frames until EOF or the first error.
async fn receive_loop<S>(
    mut reader: FrameReader<ReadHalf<S>>,
    frames: mpsc::Sender<MtprotoResult<Vec<u8>>>,
) where
    S: AsyncRead,
{
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("transport closed by peer");
                return;
            }
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtproto_core::auth::{AuthKey, AUTH_KEY_LEN};
    use mtproto_core::schema::{
        ContainedMessage, Ping, GZIP_PACKED, NEW_SESSION_CREATED, PONG, RPC_ERROR, RPC_RESULT,
    };
    use mtproto_core::testing::{fake_public_key, gzip_packed};
    use mtproto_core::Writer;

    fn options() -> SessionOptions {
        SessionOptions {
            max_frame_size: 1 << 20,
            queue_capacity: 8,
        }
    }

    fn restored() -> Session {
        let state = PersistedState {
            dcs: vec![DcOption::new(2, "127.0.0.1", 443)],
            auth: Some(AuthResult {
                key: AuthKey::from_bytes([7; AUTH_KEY_LEN]),
                server_salt: 1,
                session_id: 2,
                time_offset: 0,
            }),
            framer: FramerState { seq_no: 10 },
        };
        Session::new(vec![fake_public_key()], options())
            .with_rng(StdRng::seed_from_u64(1))
            .restore(state)
    }

    #[test]
    fn first_failure_wins() {
        let mut slot = FailureSlot::default();
        slot.record(MtprotoError::ConnectionClosed);
        slot.record(MtprotoError::BadMsgKey);
        assert_eq!(slot.into_result(), Err(MtprotoError::ConnectionClosed));
        assert_eq!(FailureSlot::default().into_result(), Ok(()));
    }

    #[test]
    fn restore_round_trips_snapshot() {
        let session = restored();
        assert!(session.is_ready());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.framer.seq_no, 10);
        assert_eq!(snapshot.dcs.len(), 1);

        let fresh = Session::new(Vec::new(), options());
        assert!(!fresh.is_ready());
        assert_eq!(fresh.snapshot(), PersistedState::default());
    }

    #[test]
    fn content_is_acked_and_delivered() {
        let mut session = restored();
        session
            .on_message(0x101, MsgKind::Content, &[1, 2, 3, 4], false)
            .unwrap();
        session
            .on_message(0x105, MsgKind::Service, &[5, 6, 7, 8], false)
            .unwrap();
        assert_eq!(session.acks, vec![0x101]);
        assert_eq!(session.deliveries.len(), 2);
    }

    #[test]
    fn ping_queues_pong() {
        let mut session = restored();
        let ping = tl::to_boxed_bytes(&Ping { ping_id: 9 }).unwrap();
        session.on_message(0x201, MsgKind::Content, &ping, false).unwrap();
        assert_eq!(session.replies.len(), 1);
        assert_eq!(&session.replies[0].payload[..4], &PONG.to_le_bytes());
        assert!(session.deliveries.is_empty());
    }

    #[test]
    fn nested_container_rejected() {
        let inner = ServiceMessage::container_bytes(&[]).unwrap();
        let outer = ServiceMessage::container_bytes(&[ContainedMessage {
            msg_id: 0x301,
            seq_no: 0,
            body: inner,
        }])
        .unwrap();
        let mut session = restored();
        assert!(matches!(
            session.on_message(0x305, MsgKind::Service, &outer, false),
            Err(MtprotoError::Decode(DecodeError::InvalidValue(_)))
        ));
    }

    #[test]
    fn gzip_payload_is_unpacked() {
        let ping = tl::to_boxed_bytes(&Ping { ping_id: 3 }).unwrap();
        let mut session = restored();
        session
            .on_message(0x401, MsgKind::Content, &gzip_packed(&ping), false)
            .unwrap();
        assert_eq!(session.acks, vec![0x401]);
        assert_eq!(session.replies.len(), 1);
        assert_eq!(&session.replies[0].payload[..4], &PONG.to_le_bytes());
    }

    #[test]
    fn gzip_rpc_result_is_unpacked() {
        let mut result = Writer::new();
        result.write_u32(RPC_RESULT);
        result.write_u64(0x40);
        result.write_raw(&gzip_packed(&[0xAB; 300]));

        let mut error = Writer::new();
        error.write_u32(RPC_ERROR);
        error.write_i32(500);
        error.write_string("INTERNAL");
        let mut wrapped = Writer::new();
        wrapped.write_u32(RPC_RESULT);
        wrapped.write_u64(0x44);
        wrapped.write_raw(&gzip_packed(&error.finish().unwrap()));

        let mut session = restored();
        session
            .on_message(0x411, MsgKind::Content, &result.finish().unwrap(), false)
            .unwrap();
        session
            .on_message(0x415, MsgKind::Content, &wrapped.finish().unwrap(), false)
            .unwrap();
        assert_eq!(
            session.deliveries,
            [
                Incoming::RpcResult {
                    req_msg_id: 0x40,
                    body: vec![0xAB; 300]
                },
                Incoming::RpcError {
                    req_msg_id: 0x44,
                    code: 500,
                    message: "INTERNAL".to_string()
                },
            ]
        );
    }

    #[test]
    fn bad_gzip_is_rejected() {
        let mut session = restored();
        let twice = gzip_packed(&gzip_packed(&[1, 2, 3, 4]));
        assert!(matches!(
            session.on_message(0x421, MsgKind::Content, &twice, false),
            Err(MtprotoError::Decode(DecodeError::InvalidValue(_)))
        ));

        let mut w = Writer::new();
        w.write_u32(GZIP_PACKED);
        w.write_bytes(&[0x1f, 0x8b]);
        assert!(matches!(
            session.on_message(0x425, MsgKind::Content, &w.finish().unwrap(), false),
            Err(MtprotoError::Decode(DecodeError::Compressed(_)))
        ));
    }

    #[test]
    fn new_session_created_updates_salt() {
        let mut w = Writer::new();
        w.write_u32(NEW_SESSION_CREATED);
        w.write_u64(1);
        w.write_u64(2);
        w.write_u64(0xFEED);
        let mut session = restored();
        session
            .on_message(0x501, MsgKind::Service, &w.finish().unwrap(), false)
            .unwrap();
        assert_eq!(session.framer.auth().unwrap().server_salt, 0xFEED);
        assert!(session.acks.is_empty());
    }
}
