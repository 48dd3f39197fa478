use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::warn;

use super::message::BusMessage;

/// Largest frame accepted on the wire, in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One newline-delimited JSON record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub topic: String,
    pub message: BusMessage,
}

impl WireFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode wire frame")
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).context("Failed to decode wire frame")
    }
}

pub fn lines_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_BYTES)
}

/// Abstraction for sending/receiving bus frames between processes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &WireFrame) -> Result<()>;
    /// Next well-formed inbound frame; `None` once the peer has gone away.
    async fn receive(&self) -> Result<Option<WireFrame>>;
}

/// Transport over a TCP connection to a [`super::broker::Broker`].
pub struct TcpTransport {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    reader: Mutex<FramedRead<OwnedReadHalf, LinesCodec>>,
    peer: String,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to bus broker at {}", addr))?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        Ok(Self {
            writer: Mutex::new(FramedWrite::new(write, lines_codec())),
            reader: Mutex::new(FramedRead::new(read, lines_codec())),
            peer: addr.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: &WireFrame) -> Result<()> {
        let line = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(line)
            .await
            .with_context(|| format!("Wire send to {} failed", self.peer))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<WireFrame>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => return Ok(None),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => match WireFrame::decode(&line) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => warn!(peer = %self.peer, error = %e, "dropping malformed frame"),
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = %self.peer, max = MAX_FRAME_BYTES, "dropping oversized frame");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(e).with_context(|| format!("Wire receive from {} failed", self.peer));
                }
            }
        }
    }
}
