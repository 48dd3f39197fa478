//! Frame relay between bus processes.
//!
//! Every line a peer sends is forwarded to every *other* connected peer. The
//! sender never gets its own frame back, since it has already delivered the
//! message to its in-process subscribers.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};
use tracing::{debug, info, warn};

use super::transport::lines_codec;

const RELAY_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Relayed {
    origin: u64,
    line: Arc<str>,
}

pub struct Broker {
    listener: TcpListener,
    relay: broadcast::Sender<Relayed>,
}

impl Broker {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind bus broker on {}", addr))?;
        let (relay, _) = broadcast::channel(RELAY_CAPACITY);
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "bus broker listening");
        let mut next_peer = 0u64;
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "broker accept failed");
                    continue;
                }
            };
            next_peer += 1;
            debug!(peer = next_peer, %addr, "peer connected");
            let outbound = self.relay.subscribe();
            tokio::spawn(serve_peer(next_peer, stream, self.relay.clone(), outbound));
        }
    }
}

async fn serve_peer(
    id: u64,
    stream: TcpStream,
    relay: broadcast::Sender<Relayed>,
    mut outbound: broadcast::Receiver<Relayed>,
) {
    let (read, write) = stream.into_split();
    let mut inbound = FramedRead::new(read, lines_codec());
    let mut sink = FramedWrite::new(write, lines_codec());

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(line)) => {
                    // No other peers is not an error.
                    let _ = relay.send(Relayed { origin: id, line: Arc::from(line) });
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = id, "dropping oversized frame");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(peer = id, error = %e, "peer read failed");
                    break;
                }
                None => break,
            },
            relayed = outbound.recv() => match relayed {
                Ok(msg) if msg.origin == id => {}
                Ok(msg) => {
                    if let Err(e) = sink.send(msg.line.to_string()).await {
                        warn!(peer = id, error = %e, "peer write failed");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(peer = id, skipped, "peer lagging, frames dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!(peer = id, "peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::{BusMessage, Envelope, Payload, Urgency};
    use crate::bus::transport::{TcpTransport, Transport, WireFrame};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_relays_to_other_peers_only() -> Result<()> {
        let broker = Broker::bind("127.0.0.1:0").await?;
        let addr = broker.local_addr()?.to_string();
        tokio::spawn(broker.run());

        let sender = TcpTransport::connect(&addr).await?;
        let receiver = TcpTransport::connect(&addr).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frame = WireFrame {
            topic: "agent/intent".to_string(),
            message: BusMessage::new(
                Envelope::mint("plant"),
                Payload::Intent {
                    intent_type: "vent".to_string(),
                    urgency: Some(Urgency::Low),
                    context: json!({}),
                    source_event: None,
                },
            ),
        };
        sender.send(&frame).await?;

        let got = tokio::time::timeout(Duration::from_secs(2), receiver.receive()).await??;
        assert_eq!(got, Some(frame));

        let echoed = tokio::time::timeout(Duration::from_millis(200), sender.receive()).await;
        assert!(echoed.is_err(), "sender must not receive its own frame");
        Ok(())
    }
}
