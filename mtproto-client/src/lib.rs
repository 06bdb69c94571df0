//! MTProto client - connection, session loop and a small client handle.
//!
//! # Example
//!
//! ```no_run
//! use mtproto_client::{ClientConfig, MtprotoClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::from_json(&std::fs::read_to_string("client.json")?)?;
//!     let mut client = MtprotoClient::connect(config).await?;
//!
//!     let ready = client.wait_ready().await?;
//!     println!("auth key {:#x}", ready.auth.key_id());
//!
//!     let msg_id = client.send(vec![0; 8]).await?;
//!     println!("sent {:#x}, got {:?}", msg_id, client.recv().await);
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod session;

pub use config::ClientConfig;
pub use connection::{FrameReader, FrameWriter};
pub use session::{Command, Incoming, Ready, Session, SessionOptions};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use mtproto_core::{MtprotoError, MtprotoResult, PersistedState};

/// Handle to a running session.
pub struct MtprotoClient {
    config: ClientConfig,
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Incoming>,
    ready: Option<oneshot::Receiver<Ready>>,
    task: Option<JoinHandle<MtprotoResult<()>>>,
    outcome: Option<MtprotoResult<()>>,
}

impl MtprotoClient {
    /// Connect over TCP and start a fresh key exchange.
    pub async fn connect(config: ClientConfig) -> MtprotoResult<Self> {
        config.validate()?;
        let stream = connection::connect(&config).await?;
        Self::start(stream, config, None)
    }

    /// Connect over TCP and resume from a stored snapshot.
    pub async fn resume(config: ClientConfig, state: PersistedState) -> MtprotoResult<Self> {
        config.validate()?;
        let stream = connection::connect(&config).await?;
        Self::start(stream, config, Some(state))
    }

    /// Run a session over an already-open stream.
    pub fn start<S>(
        stream: S,
        config: ClientConfig,
        state: Option<PersistedState>,
    ) -> MtprotoResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut session = Session::new(config.public_keys()?, SessionOptions::from(&config));
        session = match state {
            Some(state) => session.restore(state),
            None => session.with_dcs(config.dc_option().into_iter().collect()),
        };
        Ok(Self::spawn(stream, config, session))
    }

    /// Run a prepared session over `stream`.
    pub fn spawn<S>(stream: S, config: ClientConfig, session: Session) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let capacity = SessionOptions::from(&config).channel_capacity();
        let (commands, command_rx) = mpsc::channel(capacity);
        let (event_tx, events) = mpsc::channel(capacity);
        let (ready_tx, ready) = oneshot::channel();
        let task = tokio::spawn(session.run(stream, command_rx, event_tx, ready_tx));

        Self {
            config,
            commands,
            events,
            ready: Some(ready),
            task: Some(task),
            outcome: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Wait until the session holds an auth key.
    ///
    /// If the session dies first, its terminal error is returned.
    pub async fn wait_ready(&mut self) -> MtprotoResult<Ready> {
        let Some(ready) = self.ready.take() else {
            let state = self.snapshot().await?;
            let auth = state.auth.ok_or(MtprotoError::ExchangeNotFinished)?;
            return Ok(Ready {
                auth,
                framer: state.framer,
            });
        };
        match ready.await {
            Ok(ready) => Ok(ready),
            Err(_) => {
                self.finish().await?;
                Err(MtprotoError::SessionClosed)
            }
        }
    }

    /// Queue a content message. Resolves to its message ID once it is on
    /// the wire.
    pub async fn send(&self, payload: Vec<u8>) -> MtprotoResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| MtprotoError::SessionClosed)?;
        rx.await.map_err(|_| MtprotoError::SessionClosed)?
    }

    /// Next message for the application; `None` once the session ended.
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.events.recv().await
    }

    /// Snapshot the resumable state.
    pub async fn snapshot(&self) -> MtprotoResult<PersistedState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| MtprotoError::SessionClosed)?;
        rx.await.map_err(|_| MtprotoError::SessionClosed)
    }

    /// Stop the session and return how it ended.
    pub async fn shutdown(mut self) -> MtprotoResult<()> {
        self.events.close();
        let _ = self.commands.send(Command::Close).await;
        self.finish().await
    }

    /// Wait for the session to end on its own.
    pub async fn join(mut self) -> MtprotoResult<()> {
        self.finish().await
    }

    async fn finish(&mut self) -> MtprotoResult<()> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                Err(MtprotoError::Transport(format!("session task failed: {}", e)))
            }),
            None => Err(MtprotoError::SessionClosed),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtproto_core::crypto::Direction;
    use mtproto_core::framer::{self, Envelope};
    use mtproto_core::schema::{
        ContainedMessage, Ping, ServiceMessage, BAD_SERVER_SALT, MSGS_ACK, PONG, RPC_ERROR,
        RPC_RESULT,
    };
    use mtproto_core::testing::{fake_public_key, gzip_packed, FakeServer, Tamper};
    use mtproto_core::tl::{self, Writer};
    use mtproto_core::FramerState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn test_config() -> ClientConfig {
        ClientConfig::with_addr("127.0.0.1:443").with_queue_capacity(16)
    }

    fn client_over(stream: DuplexStream, seed: u64) -> MtprotoClient {
        let config = test_config();
        let session = Session::new(vec![fake_public_key()], SessionOptions::from(&config))
            .with_rng(StdRng::seed_from_u64(seed))
            .with_dcs(config.dc_option().into_iter().collect());
        MtprotoClient::spawn(stream, config, session)
    }

    /// Server end of the pipe.
    struct Peer {
        server: FakeServer,
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
        session_id: u64,
        seq_no: u32,
    }

    impl Peer {
        fn new(server: FakeServer, stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                server,
                reader: FrameReader::new(reader, 1 << 20),
                writer: FrameWriter::new(writer),
                session_id: 0,
                seq_no: 0,
            }
        }

        async fn handshake(&mut self) -> MtprotoResult<()> {
            for _ in 0..3 {
                let frame = self.reader.read_frame().await?.ok_or(MtprotoError::ConnectionClosed)?;
                let reply = self.server.respond_plain(&frame)?;
                self.writer.write_frame(&reply).await?;
            }
            Ok(())
        }

        async fn next_envelope(&mut self) -> Envelope {
            let frame = self.reader.read_frame().await.unwrap().unwrap();
            let envelope = self.server.open(&frame).unwrap();
            self.session_id = envelope.session_id;
            envelope
        }

        /// Next envelope that is not a bare acknowledgement.
        async fn next_non_ack(&mut self) -> Envelope {
            loop {
                let envelope = self.next_envelope().await;
                if envelope.payload[..4] != MSGS_ACK.to_le_bytes() {
                    return envelope;
                }
            }
        }

        async fn push(&mut self, content: bool, payload: &[u8]) -> u64 {
            let seq_no = if content {
                self.seq_no += 2;
                self.seq_no - 1
            } else {
                self.seq_no
            };
            let raw = self.server.seal(self.session_id, seq_no, payload).unwrap();
            let msg_id = framer::open(self.server.auth_key().unwrap(), Direction::ServerToClient, &raw)
                .unwrap()
                .msg_id;
            self.writer.write_frame(&raw).await.unwrap();
            msg_id
        }
    }

    /// Handshake and one content message so the peer learns the session ID.
    async fn established(seed: u64) -> (MtprotoClient, Peer) {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = client_over(a, seed);
        let mut peer = Peer::new(FakeServer::new(seed + 1), b);
        peer.handshake().await.unwrap();
        client.wait_ready().await.unwrap();
        client.send(vec![0xEE; 8]).await.unwrap();
        peer.next_envelope().await;
        (client, peer)
    }

    fn rpc_result(req_msg_id: u64, body: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(RPC_RESULT);
        w.write_u64(req_msg_id);
        w.write_raw(body);
        w.finish().unwrap()
    }

    fn rpc_error(code: i32, message: &str) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(RPC_ERROR);
        w.write_i32(code);
        w.write_string(message);
        w.finish().unwrap()
    }

    #[tokio::test]
    async fn handshake_makes_client_ready() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = client_over(a, 1);
        let mut peer = Peer::new(FakeServer::new(2), b);

        peer.handshake().await.unwrap();
        let ready = client.wait_ready().await.unwrap();
        assert_eq!(&ready.auth.key, peer.server.auth_key().unwrap());
        assert_eq!(ready.auth.server_salt, peer.server.expected_salt());
        assert_eq!(ready.framer, FramerState::default());

        // A second wait answers from a snapshot.
        assert_eq!(client.wait_ready().await.unwrap().auth, ready.auth);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sends_are_encrypted_and_sequenced() {
        let (client, mut peer) = established(3).await;
        let first = client.send(b"request1".to_vec()).await.unwrap();
        let second = client.send(b"request2".to_vec()).await.unwrap();
        assert!(second > first);

        let a = peer.next_non_ack().await;
        let b = peer.next_non_ack().await;
        assert_eq!((a.msg_id, a.seq_no, a.payload.as_slice()), (first, 3, &b"request1"[..]));
        assert_eq!((b.msg_id, b.seq_no, b.payload.as_slice()), (second, 5, &b"request2"[..]));
        assert_eq!(a.salt, peer.server.expected_salt());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_ready_is_queued() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let client = client_over(a, 5);
        let mut peer = Peer::new(FakeServer::new(6), b);

        let server = tokio::spawn(async move {
            peer.handshake().await.unwrap();
            let envelope = peer.next_envelope().await;
            (peer, envelope)
        });
        let msg_id = client.send(b"early!!!".to_vec()).await.unwrap();
        let (_peer, envelope) = server.await.unwrap();
        assert_eq!(envelope.msg_id, msg_id);
        assert_eq!(envelope.payload, b"early!!!");
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn content_is_delivered_and_acknowledged() {
        let (mut client, mut peer) = established(7).await;
        let payload = [0x11, 0x22, 0x33, 0x44, 1, 2, 3, 4];
        let msg_id = peer.push(true, &payload).await;

        assert_eq!(
            client.recv().await,
            Some(Incoming::Message {
                msg_id,
                payload: payload.to_vec()
            })
        );

        let ack = peer.next_envelope().await;
        assert_eq!(ack.seq_no % 2, 0);
        match ServiceMessage::classify(&ack.payload).unwrap() {
            Some(ServiceMessage::MsgsAck(ack)) => assert_eq!(ack.msg_ids, vec![msg_id]),
            other => panic!("expected msgs_ack, got {:?}", other),
        }
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn container_with_rpc_results() {
        let (mut client, mut peer) = established(9).await;
        let container = ServiceMessage::container_bytes(&[
            ContainedMessage {
                msg_id: 0x1001,
                seq_no: 1,
                body: rpc_result(40, &[9, 9, 9, 9]),
            },
            ContainedMessage {
                msg_id: 0x1005,
                seq_no: 3,
                body: rpc_result(44, &rpc_error(420, "FLOOD_WAIT_3")),
            },
        ])
        .unwrap();
        peer.push(false, &container).await;

        assert_eq!(
            client.recv().await,
            Some(Incoming::RpcResult {
                req_msg_id: 40,
                body: vec![9, 9, 9, 9]
            })
        );
        assert_eq!(
            client.recv().await,
            Some(Incoming::RpcError {
                req_msg_id: 44,
                code: 420,
                message: "FLOOD_WAIT_3".to_string()
            })
        );

        let ack = peer.next_envelope().await;
        match ServiceMessage::classify(&ack.payload).unwrap() {
            Some(ServiceMessage::MsgsAck(ack)) => assert_eq!(ack.msg_ids, vec![0x1001, 0x1005]),
            other => panic!("expected msgs_ack, got {:?}", other),
        }
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn gzip_rpc_result_is_inflated() {
        let (mut client, mut peer) = established(23).await;
        let body = b"compressed answer".repeat(40);
        let mut w = Writer::new();
        w.write_u32(RPC_RESULT);
        w.write_u64(0x77);
        w.write_raw(&gzip_packed(&body));
        peer.push(true, &gzip_packed(&w.finish().unwrap())).await;

        assert_eq!(
            client.recv().await,
            Some(Incoming::RpcResult {
                req_msg_id: 0x77,
                body
            })
        );
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn slow_reader_does_not_stall_session() {
        let (client, mut peer) = established(25).await;
        let capacity = client.config().queue_capacity;
        for i in 0..capacity as u8 + 4 {
            peer.push(true, &[i; 8]).await;
        }

        let deadline = std::time::Duration::from_secs(5);
        let sent = tokio::time::timeout(deadline, client.send(b"still ok".to_vec()))
            .await
            .expect("send stalled")
            .unwrap();
        let envelope = peer.next_non_ack().await;
        assert_eq!((envelope.msg_id, envelope.payload.as_slice()), (sent, &b"still ok"[..]));

        tokio::time::timeout(deadline, client.shutdown())
            .await
            .expect("shutdown stalled")
            .unwrap();
    }

    #[tokio::test]
    async fn zero_queue_capacity_still_runs() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let config = test_config().with_queue_capacity(0);
        let session = Session::new(vec![fake_public_key()], SessionOptions::from(&config))
            .with_rng(StdRng::seed_from_u64(27));
        let mut client = MtprotoClient::spawn(a, config, session);
        let mut peer = Peer::new(FakeServer::new(28), b);

        peer.handshake().await.unwrap();
        client.wait_ready().await.unwrap();
        client.send(vec![0x42; 8]).await.unwrap();
        assert_eq!(peer.next_envelope().await.payload, vec![0x42; 8]);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (client, mut peer) = established(11).await;
        let ping = tl::to_boxed_bytes(&Ping { ping_id: 0xABCD }).unwrap();
        let msg_id = peer.push(true, &ping).await;

        let pong = peer.next_non_ack().await;
        assert_eq!(&pong.payload[..4], &PONG.to_le_bytes());
        match ServiceMessage::classify(&pong.payload).unwrap() {
            Some(ServiceMessage::Pong(p)) => {
                assert_eq!(p.msg_id, msg_id);
                assert_eq!(p.ping_id, 0xABCD);
            }
            other => panic!("expected pong, got {:?}", other),
        }
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn bad_server_salt_updates_salt() {
        let (mut client, mut peer) = established(13).await;
        let mut w = Writer::new();
        w.write_u32(BAD_SERVER_SALT);
        w.write_u64(1);
        w.write_u32(1);
        w.write_i32(48);
        w.write_u64(0x5A17);
        peer.push(false, &w.finish().unwrap()).await;

        // Barrier: once this arrives the salt update has been applied.
        peer.push(true, &[0x55; 8]).await;
        assert!(matches!(client.recv().await, Some(Incoming::Message { .. })));

        client.send(b"after!!!".to_vec()).await.unwrap();
        let envelope = peer.next_non_ack().await;
        assert_eq!(envelope.payload, b"after!!!");
        assert_eq!(envelope.salt, 0x5A17);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn transport_error_surfaces_once() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = client_over(a, 15);
        let (_reader, mut writer) = tokio::io::split(b);

        // Larger than the configured frame limit.
        use tokio::io::AsyncWriteExt;
        writer.write_all(&[0x7f, 0xff, 0xff, 0xff]).await.unwrap();

        let err = client.wait_ready().await.unwrap_err();
        assert!(matches!(&err, MtprotoError::Transport(msg) if msg.contains("exceeds")));
        assert_eq!(client.join().await, Err(err));
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_closed() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = client_over(a, 17);
        let mut peer = Peer::new(FakeServer::new(18), b);

        // Read req_pq, then close our side.
        assert!(peer.reader.read_frame().await.unwrap().is_some());
        peer.writer.shutdown().await.unwrap();
        assert_eq!(client.wait_ready().await, Err(MtprotoError::ConnectionClosed));
    }

    #[tokio::test]
    async fn handshake_failure_is_terminal() {
        init_tracing();
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = client_over(a, 19);
        let mut peer = Peer::new(FakeServer::new(20).with_tamper(Tamper::NewNonceHash), b);

        tokio::spawn(async move {
            let _ = peer.handshake().await;
            // Keep the pipe open until the client gives up.
            let _ = peer.reader.read_frame().await;
        });
        assert_eq!(client.wait_ready().await, Err(MtprotoError::BadNewNonceHash));
        assert!(client.send(vec![0; 4]).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_and_resume() {
        let (client, peer) = established(21).await;
        let state = client.snapshot().await.unwrap();
        assert_eq!(state.framer.seq_no, 2);
        assert_eq!(state.dcs.len(), 1);
        let auth = state.auth.clone().unwrap();
        client.shutdown().await.unwrap();

        let blob = state.encode().unwrap();
        let restored = PersistedState::decode(&blob).unwrap();

        let (a, b) = tokio::io::duplex(1 << 16);
        let config = test_config();
        let session = Session::new(vec![fake_public_key()], SessionOptions::from(&config))
            .restore(restored);
        let mut resumed = MtprotoClient::spawn(a, config, session);
        assert_eq!(resumed.wait_ready().await.unwrap().auth, auth);

        resumed.send(b"resumed!".to_vec()).await.unwrap();
        let (mut reader, _writer) = tokio::io::split(b);
        let mut frames = FrameReader::new(&mut reader, 1 << 20);
        let raw = frames.read_frame().await.unwrap().unwrap();
        let envelope = framer::open(&auth.key, Direction::ClientToServer, &raw).unwrap();
        assert_eq!(envelope.seq_no, 3);
        assert_eq!(envelope.payload, b"resumed!");
        assert_eq!(envelope.session_id, peer.session_id);
        resumed.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_bad_keys() {
        let (a, _b) = tokio::io::duplex(64);
        let config = test_config().with_public_key("garbage");
        assert!(MtprotoClient::start(a, config, None).is_err());
    }
}
