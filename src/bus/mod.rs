//! Topic-addressed publish/subscribe bus.
//!
//! `publish` runs three independent best-effort steps in order: record a
//! trace entry, fan out to in-process subscribers whose prefix matches the
//! topic, then hand the frame to the wire transport. Only an invalid
//! envelope is reported back to the caller.

pub mod broker;
pub mod message;
pub mod transport;

pub use message::{
    BusMessage, CorrelationId, DssQuery, DssUpdate, Envelope, Payload, QueryKind, RawEvent,
    Urgency,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::trace::{NewTraceEntry, TraceLogger};
use transport::{Transport, WireFrame};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("message has no correlation id")]
    MissingCorrelationId,
    #[error("message has no project name")]
    MissingProjectName,
}

impl Envelope {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.correlation_id.is_blank() {
            return Err(BusError::MissingCorrelationId);
        }
        if self.project_name.trim().is_empty() {
            return Err(BusError::MissingProjectName);
        }
        Ok(())
    }
}

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, topic: &str, message: &BusMessage) -> Result<()>;
}

/// Adapts an async closure into a [`BusHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> BusHandler for FnHandler<F>
where
    F: Fn(String, BusMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, topic: &str, message: &BusMessage) -> Result<()> {
        (self.0)(topic.to_string(), message.clone()).await
    }
}

struct Subscriber {
    id: u64,
    prefix: String,
    handler: Arc<dyn BusHandler>,
}

type Registry = RwLock<Vec<Subscriber>>;

/// De-registration handle returned by [`MessageBus::subscribe`].
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Removes the handler. Returns `false` if it was already gone.
    pub async fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut subscribers = registry.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != self.id);
        subscribers.len() != before
    }
}

pub struct MessageBus {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
    tracer: Arc<TraceLogger>,
    transport: Option<Arc<dyn Transport>>,
}

impl MessageBus {
    pub fn new(tracer: Arc<TraceLogger>, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            tracer,
            transport,
        }
    }

    /// A bus with no wire transport; delivery stays in-process.
    pub fn local(tracer: Arc<TraceLogger>) -> Self {
        Self::new(tracer, None)
    }

    pub fn tracer(&self) -> &Arc<TraceLogger> {
        &self.tracer
    }

    pub async fn subscribe<H>(&self, prefix: &str, handler: H) -> Subscription
    where
        H: BusHandler + 'static,
    {
        self.subscribe_arc(prefix, Arc::new(handler)).await
    }

    pub async fn subscribe_arc(&self, prefix: &str, handler: Arc<dyn BusHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.push(Subscriber {
            id,
            prefix: prefix.to_string(),
            handler,
        });
        debug!(prefix, id, "subscriber registered");
        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub async fn subscribe_fn<F, Fut>(&self, prefix: &str, f: F) -> Subscription
    where
        F: Fn(String, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(prefix, FnHandler(f)).await
    }

    pub async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        message.envelope.validate()?;
        let topic = message.topic();

        self.record_trace(&topic, &message).await;
        self.dispatch(&topic, &message).await;
        self.send_wire(&topic, &message).await;
        Ok(())
    }

    /// Step one of `publish`: never fails.
    pub async fn record_trace(&self, topic: &str, message: &BusMessage) {
        self.tracer.log(NewTraceEntry::for_message(topic, message)).await;
    }

    /// Delivers to every matching subscriber in registration order. Returns
    /// how many handled the message successfully.
    pub async fn dispatch(&self, topic: &str, message: &BusMessage) -> usize {
        let targets: Vec<(u64, Arc<dyn BusHandler>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|s| topic.starts_with(&s.prefix))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        let mut delivered = 0;
        for (id, handler) in targets {
            match AssertUnwindSafe(handler.handle(topic, message)).catch_unwind().await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    subscriber = id,
                    topic,
                    correlation_id = %message.correlation_id(),
                    error = %e,
                    "subscriber failed"
                ),
                Err(_) => error!(
                    subscriber = id,
                    topic,
                    correlation_id = %message.correlation_id(),
                    "subscriber panicked"
                ),
            }
        }
        delivered
    }

    /// Step three of `publish`: never fails. Returns whether the frame left
    /// the process.
    pub async fn send_wire(&self, topic: &str, message: &BusMessage) -> bool {
        let Some(transport) = &self.transport else {
            debug!(topic, correlation_id = %message.correlation_id(), "wire send failed: no transport");
            return false;
        };
        let frame = WireFrame {
            topic: topic.to_string(),
            message: message.clone(),
        };
        match transport.send(&frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, correlation_id = %message.correlation_id(), error = %e, "publish failed");
                false
            }
        }
    }

    /// Starts the background loop feeding inbound wire frames to local
    /// subscribers. Each frame is dispatched on its own task so a slow
    /// subscriber never holds up receipt of the next frame.
    pub fn spawn_receiver(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let transport = self.transport.clone()?;
        let bus = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(Some(frame)) => {
                        let Some(bus) = bus.upgrade() else { break };
                        tokio::spawn(async move {
                            bus.dispatch(&frame.topic, &frame.message).await;
                        });
                    }
                    Ok(None) => {
                        warn!("wire connection closed, receive loop stopping");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "wire receive failed, receive loop stopping");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Service;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn raw(correlation: &str) -> BusMessage {
        BusMessage::new(
            Envelope::new("plant", CorrelationId::from(correlation)),
            Payload::RawEvent {
                channel: "email".to_string(),
                event: RawEvent::new("imap", json!({"subject": "pressure alarm"})),
            },
        )
    }

    fn intent(correlation: &str) -> BusMessage {
        BusMessage::new(
            Envelope::new("plant", CorrelationId::from(correlation)),
            Payload::Intent {
                intent_type: "inspect".to_string(),
                urgency: None,
                context: json!({}),
                source_event: None,
            },
        )
    }

    struct FailingHandler;

    #[async_trait]
    impl BusHandler for FailingHandler {
        async fn handle(&self, _topic: &str, _message: &BusMessage) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl BusHandler for PanickingHandler {
        async fn handle(&self, _topic: &str, _message: &BusMessage) -> Result<()> {
            panic!("subscriber bug")
        }
    }

    #[tokio::test]
    async fn test_prefix_routing_and_unsubscribe() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bus = MessageBus::local(Arc::new(TraceLogger::new(dir.path())));
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let sub = bus
            .subscribe_fn("events/raw", move |_topic, _msg| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        bus.publish(raw("c-1")).await?;
        bus.publish(intent("c-1")).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(sub.unsubscribe().await);
        bus.publish(raw("c-1")).await?;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_subscribers_do_not_block_others() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bus = MessageBus::local(Arc::new(TraceLogger::new(dir.path())));
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe("agent/", FailingHandler).await;
        bus.subscribe("agent/", PanickingHandler).await;
        bus.subscribe_fn("agent/intent", move |_topic, msg| {
            let tx = tx.clone();
            async move {
                tx.send(msg)?;
                Ok(())
            }
        })
        .await;

        let delivered = bus.dispatch("agent/intent", &intent("c-7")).await;
        assert_eq!(delivered, 1);
        let got = rx.recv().await.expect("healthy subscriber delivered");
        assert_eq!(got.correlation_id().as_str(), "c-7");
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_validates_envelope() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bus = MessageBus::local(Arc::new(TraceLogger::new(dir.path())));

        assert_eq!(bus.publish(raw("")).await, Err(BusError::MissingCorrelationId));

        let mut msg = raw("c-1");
        msg.envelope.project_name = " ".to_string();
        assert_eq!(bus.publish(msg).await, Err(BusError::MissingProjectName));
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_traces_by_correlation_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracer = Arc::new(TraceLogger::new(dir.path()));
        let bus = MessageBus::local(Arc::clone(&tracer));

        bus.publish(raw("c-1")).await?;
        bus.publish(intent("c-1")).await?;
        bus.publish(raw("c-2")).await?;

        let trace = tracer.get_trace("plant", "c-1").await;
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].service, Service::Perception);
        assert_eq!(trace[0].topic, "events/raw/email");
        assert_eq!(trace[0].action, "event_received");
        assert_eq!(trace[1].service, Service::Action);
        assert_eq!(trace[1].topic, "agent/intent");
        assert!(trace[0].timestamp <= trace[1].timestamp);
        Ok(())
    }

    #[tokio::test]
    async fn test_frames_cross_processes_via_broker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tracer = Arc::new(TraceLogger::new(dir.path()));

        let broker = broker::Broker::bind("127.0.0.1:0").await?;
        let addr = broker.local_addr()?.to_string();
        tokio::spawn(broker.run());

        let left_wire: Arc<dyn Transport> = Arc::new(transport::TcpTransport::connect(&addr).await?);
        let right_wire: Arc<dyn Transport> = Arc::new(transport::TcpTransport::connect(&addr).await?);
        let left = Arc::new(MessageBus::new(Arc::clone(&tracer), Some(left_wire)));
        let right = Arc::new(MessageBus::new(Arc::clone(&tracer), Some(right_wire)));
        right.spawn_receiver();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        right
            .subscribe_fn("events/", move |topic, msg| {
                let tx = tx.clone();
                async move {
                    tx.send((topic, msg))?;
                    Ok(())
                }
            })
            .await;

        left.publish(raw("c-wire")).await?;

        let (topic, msg) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("frame relayed");
        assert_eq!(topic, "events/raw/email");
        assert_eq!(msg.correlation_id().as_str(), "c-wire");
        Ok(())
    }
}
