//! Abridged TCP transport.
//!
//! ```text
//! len/4 < 0x7f:  [len/4 (1)] [frame]
//! otherwise:     [0x7f] [len/4 (3, LE)] [frame]
//! ```
//!
//! A client announces the abridged mode with a single `0xef` byte before
//! its first frame.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use mtproto_core::codec::{decode_u24, encode_u24};
use mtproto_core::{MtprotoError, MtprotoResult};

use crate::config::ClientConfig;

/// First byte a client sends to select the abridged transport.
pub const ABRIDGED_TAG: u8 = 0xef;

const LONG_LENGTH: u8 = 0x7f;

/// Server-side failures arrive as a bare little-endian error code.
const ERROR_FRAME_LEN: usize = 4;

/// Length prefix for a frame of `len` bytes.
pub fn encode_header(len: usize) -> MtprotoResult<Vec<u8>> {
    if len % 4 != 0 {
        return Err(MtprotoError::Transport(format!(
            "frame length {} is not a multiple of 4",
            len
        )));
    }
    let words = len / 4;
    if words < LONG_LENGTH as usize {
        return Ok(vec![words as u8]);
    }
    let words = u32::try_from(words)
        .map_err(|_| MtprotoError::Transport(format!("frame of {} bytes is too large", len)))?;
    let mut header = vec![LONG_LENGTH];
    header.extend_from_slice(&encode_u24(words)?);
    Ok(header)
}

/// Reads length-prefixed frames.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Next frame, or `None` if the peer closed between frames.
    pub async fn read_frame(&mut self) -> MtprotoResult<Option<Vec<u8>>> {
        let mut first = [0u8; 1];
        if self.inner.read(&mut first).await? == 0 {
            return Ok(None);
        }

        let words = match first[0] {
            LONG_LENGTH => {
                let mut len = [0u8; 3];
                self.inner.read_exact(&mut len).await?;
                decode_u24(len) as usize
            }
            b if b < LONG_LENGTH => b as usize,
            b => {
                return Err(MtprotoError::Transport(format!(
                    "unexpected length byte {:#04x}",
                    b
                )))
            }
        };

        let len = words * 4;
        if len > self.max_frame_size {
            return Err(MtprotoError::Transport(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_size
            )));
        }

        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await?;
        tracing::trace!("read frame of {} bytes", len);

        if len == ERROR_FRAME_LEN {
            let code = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            return Err(MtprotoError::Transport(format!("server error code {}", code)));
        }
        Ok(Some(frame))
    }
}

/// Writes length-prefixed frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> MtprotoResult<()> {
        let header = encode_header(frame.len())?;
        self.inner.write_all(&header).await?;
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        tracing::trace!("wrote frame of {} bytes", frame.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> MtprotoResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Open a TCP connection to the configured server and select the abridged
/// transport.
pub async fn connect(config: &ClientConfig) -> MtprotoResult<TcpStream> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&config.server_addr))
        .await
        .map_err(|_| {
            MtprotoError::Transport(format!(
                "connection to {} timed out after {:?}",
                config.server_addr, timeout
            ))
        })?
        .map_err(|e| MtprotoError::Transport(format!("Connection failed: {}", e)))?;

    stream.set_nodelay(true)?;
    stream.write_all(&[ABRIDGED_TAG]).await?;
    tracing::debug!("connected to {}", config.server_addr);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn short_header() {
        assert_eq!(encode_header(0).unwrap(), vec![0]);
        assert_eq!(encode_header(8).unwrap(), vec![2]);
        assert_eq!(encode_header(0x7e * 4).unwrap(), vec![0x7e]);
    }

    #[test]
    fn long_header() {
        assert_eq!(encode_header(0x7f * 4).unwrap(), vec![0x7f, 0x7f, 0, 0]);
        assert_eq!(encode_header(1000).unwrap(), vec![0x7f, 250, 0, 0]);
        assert_eq!(encode_header(0x10000 * 4).unwrap(), vec![0x7f, 0, 0, 1]);
    }

    #[test]
    fn unaligned_length_rejected() {
        assert!(encode_header(6).is_err());
    }

    #[tokio::test]
    async fn frames_cross_the_pipe() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b, 4096);

        let small = vec![7u8; 16];
        let large = vec![9u8; 1024];
        writer.write_frame(&small).await.unwrap();
        writer.write_frame(&large).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), Some(small));
        assert_eq!(reader.read_frame().await.unwrap(), Some(large));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b, 64);
        a.write_all(&[0x7f, 0xff, 0xff, 0xff]).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, MtprotoError::Transport(msg) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn truncated_frame_is_connection_closed() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b, 64);
        a.write_all(&[2, 1, 2, 3]).await.unwrap();
        drop(a);
        assert_eq!(
            reader.read_frame().await.unwrap_err(),
            MtprotoError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn error_code_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b, 64);
        a.write_all(&[1]).await.unwrap();
        a.write_all(&(-404i32).to_le_bytes()).await.unwrap();
        assert_eq!(
            reader.read_frame().await.unwrap_err(),
            MtprotoError::Transport("server error code -404".to_string())
        );
    }

    #[tokio::test]
    async fn connect_sends_abridged_tag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ClientConfig::with_addr(addr.to_string());

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut tag = [0u8; 1];
            socket.read_exact(&mut tag).await.unwrap();
            tag[0]
        });

        let _stream = connect(&config).await.unwrap();
        assert_eq!(accept.await.unwrap(), ABRIDGED_TAG);
    }
}
