//! Length-prefixed TCP framing.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! a MessagePack [`Message`] envelope. Framing is `LengthDelimitedCodec`;
//! this module adds the envelope codec, the frame cap and dialing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError};
use tracing::{debug, warn};

use crate::message::Message;

/// Largest frame accepted or sent.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,

    #[error("frame exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    TooLarge,

    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        let oversized = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if oversized {
            FrameError::TooLarge
        } else {
            FrameError::Io(e)
        }
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// One framed TCP connection to a peer node.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
            peer,
        })
    }

    /// Socket address of the other end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), FrameError> {
        let bytes = msg.to_bytes()?;
        let len = bytes.len();
        self.framed.send(Bytes::from(bytes)).await?;
        debug!(peer = %self.peer, topic = %msg.topic, bytes = len, "frame sent");
        Ok(())
    }

    /// Receive the next frame. A clean close between frames is [`FrameError::Closed`].
    pub async fn recv(&mut self) -> Result<Message, FrameError> {
        let buf = match self.framed.next().await {
            Some(frame) => frame?,
            None => return Err(FrameError::Closed),
        };
        let msg = Message::from_bytes(&buf)?;
        debug!(peer = %self.peer, topic = %msg.topic, bytes = buf.len(), "frame received");
        Ok(msg)
    }

    /// Best-effort orderly shutdown of the write half.
    pub async fn close(mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.framed).await;
    }
}

/// Dial `addr` up to `attempts` times, sleeping `backoff` between attempts.
///
/// Each attempt is bounded by `attempt_timeout`. Returns the last error once
/// every attempt has failed.
pub async fn connect_with_retry(
    addr: SocketAddr,
    attempts: u32,
    backoff: Duration,
    attempt_timeout: Duration,
) -> io::Result<Connection> {
    let attempts = attempts.max(1);
    let mut last_err = io::Error::new(io::ErrorKind::Other, "no connection attempt made");
    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(attempt_timeout, TcpStream::connect(addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {attempt_timeout:?}"),
            )),
        };
        match result.and_then(Connection::new) {
            Ok(conn) => {
                debug!(%addr, attempt, "connected");
                return Ok(conn);
            }
            Err(e) => {
                warn!(%addr, attempt, attempts, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(last_err)
}
