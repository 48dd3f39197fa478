use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{IntentMapping, MappingCache};
use crate::bus::message::topics;
use crate::bus::{BusHandler, BusMessage, MessageBus, Payload, Subscription};
use crate::trace::{NewTraceEntry, Service, TraceLogger};
use crate::workflow::{WorkflowEngine, WorkflowEvent};

pub const ROUTER_SOURCE: &str = "intent-router";

/// Turns `agent/intent` messages into workflow triggers.
///
/// Holds the bus weakly: the bus owns the subscription that owns the router.
pub struct IntentRouter {
    bus: Weak<MessageBus>,
    mappings: Arc<MappingCache>,
    workflows: Arc<dyn WorkflowEngine>,
    tracer: Arc<TraceLogger>,
}

impl IntentRouter {
    pub fn new(
        bus: &Arc<MessageBus>,
        mappings: Arc<MappingCache>,
        workflows: Arc<dyn WorkflowEngine>,
    ) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            mappings,
            workflows,
            tracer: Arc::clone(bus.tracer()),
        }
    }

    /// Subscribes the router for the lifetime of the returned handle.
    pub async fn attach(self: &Arc<Self>) -> Option<Subscription> {
        let bus = self.bus.upgrade()?;
        let handler: Arc<dyn BusHandler> = Arc::clone(self) as Arc<dyn BusHandler>;
        Some(bus.subscribe_arc(topics::INTENT, handler).await)
    }

    pub fn mappings(&self) -> &Arc<MappingCache> {
        &self.mappings
    }

    /// Routes one intent. Returns how many mappings matched.
    pub async fn route(&self, message: &BusMessage) -> Result<usize> {
        let Payload::Intent {
            intent_type,
            urgency,
            context,
            ..
        } = &message.payload
        else {
            return Ok(0);
        };
        let project = message.project_name();

        let Some(mappings) = self.mappings.get_or_load(project).await? else {
            debug!(project, intent_type = %intent_type, "no intent mappings configured");
            return Ok(0);
        };

        let mut matched = 0;
        for mapping in mappings.iter().filter(|m| m.matches(intent_type, *urgency)) {
            matched += 1;
            self.apply(message, mapping, context).await;
        }

        if matched == 0 {
            debug!(
                project,
                intent_type = %intent_type,
                correlation_id = %message.correlation_id(),
                "intent matched no mapping"
            );
        }
        Ok(matched)
    }

    /// One mapping: republish as a trigger, then drive the workflow engine.
    /// Failures are logged here and never reach the other mappings.
    async fn apply(&self, message: &BusMessage, mapping: &IntentMapping, context: &Value) {
        let correlation_id = message.correlation_id().clone();
        let data = if mapping.forward_context {
            context.clone()
        } else {
            Value::Object(Map::new())
        };

        self.tracer
            .log(NewTraceEntry {
                correlation_id: correlation_id.to_string(),
                service: Service::Action,
                topic: topics::INTENT.to_string(),
                action: "intent_matched".to_string(),
                project_name: message.project_name().to_string(),
                data: match json!({
                    "workflowId": mapping.workflow_id,
                    "event": mapping.event,
                }) {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
            })
            .await;

        let trigger = message.derive(Payload::WorkflowTrigger {
            workflow_id: mapping.workflow_id.clone(),
            event: mapping.event.clone(),
            data: data.clone(),
            source: ROUTER_SOURCE.to_string(),
        });
        match self.bus.upgrade() {
            Some(bus) => {
                if let Err(e) = bus.publish(trigger).await {
                    warn!(correlation_id = %correlation_id, error = %e, "workflow trigger rejected");
                }
            }
            None => warn!(correlation_id = %correlation_id, "bus gone, trigger not published"),
        }

        let event = WorkflowEvent {
            project: message.project_name().to_string(),
            workflow_id: mapping.workflow_id.clone(),
            event: mapping.event.clone(),
            data,
            correlation_id: correlation_id.clone(),
            ignore_invalid: true,
        };
        match self.workflows.send_event(event).await {
            Ok(()) => info!(
                workflow_id = %mapping.workflow_id,
                event = %mapping.event,
                correlation_id = %correlation_id,
                "intent routed"
            ),
            Err(e) => warn!(
                workflow_id = %mapping.workflow_id,
                event = %mapping.event,
                correlation_id = %correlation_id,
                error = %e,
                "workflow event failed"
            ),
        }
    }
}

#[async_trait]
impl BusHandler for IntentRouter {
    async fn handle(&self, _topic: &str, message: &BusMessage) -> Result<()> {
        self.route(message).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CorrelationId, Envelope, Urgency};
    use crate::intent::{MappingLoader, IntentMapping};
    use tokio::sync::{mpsc, Mutex};

    struct StaticLoader(Option<Vec<IntentMapping>>);

    #[async_trait]
    impl MappingLoader for StaticLoader {
        async fn load(&self, _project: &str) -> Result<Option<Vec<IntentMapping>>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        events: Mutex<Vec<WorkflowEvent>>,
    }

    #[async_trait]
    impl WorkflowEngine for RecordingEngine {
        async fn send_event(&self, event: WorkflowEvent) -> Result<()> {
            let fail = event.workflow_id == "broken";
            self.events.lock().await.push(event);
            if fail {
                anyhow::bail!("no such workflow");
            }
            Ok(())
        }
    }

    fn mapping(workflow_id: &str, forward_context: bool, urgency: Option<Vec<Urgency>>) -> IntentMapping {
        IntentMapping {
            intent_type: "maintenance_required".to_string(),
            workflow_id: workflow_id.to_string(),
            event: "OPEN".to_string(),
            forward_context,
            urgency,
        }
    }

    fn intent(urgency: Option<Urgency>) -> BusMessage {
        BusMessage::new(
            Envelope::new("plant", CorrelationId::from("c-42")),
            Payload::Intent {
                intent_type: "maintenance_required".to_string(),
                urgency,
                context: json!({ "asset": "pump-1" }),
                source_event: None,
            },
        )
    }

    struct Fixture {
        bus: Arc<MessageBus>,
        engine: Arc<RecordingEngine>,
        triggers: mpsc::UnboundedReceiver<BusMessage>,
        _dir: tempfile::TempDir,
        _sub: Subscription,
    }

    async fn fixture(mappings: Option<Vec<IntentMapping>>) -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let bus = Arc::new(MessageBus::local(Arc::new(TraceLogger::new(dir.path()))));
        let engine = Arc::new(RecordingEngine::default());
        let cache = Arc::new(MappingCache::new(Arc::new(StaticLoader(mappings))));
        let router = Arc::new(IntentRouter::new(&bus, cache, engine.clone()));
        let sub = router.attach().await.expect("bus alive");

        let (tx, triggers) = mpsc::unbounded_channel();
        bus.subscribe_fn(topics::WORKFLOW_TRIGGER, move |_topic, msg| {
            let tx = tx.clone();
            async move {
                tx.send(msg)?;
                Ok(())
            }
        })
        .await;

        Ok(Fixture {
            bus,
            engine,
            triggers,
            _dir: dir,
            _sub: sub,
        })
    }

    #[tokio::test]
    async fn test_intent_becomes_trigger_with_same_correlation() -> Result<()> {
        let mut fx = fixture(Some(vec![
            mapping("maintenance", true, Some(vec![Urgency::High])),
            mapping("audit", false, None),
        ]))
        .await?;

        fx.bus.publish(intent(Some(Urgency::High))).await?;

        let first = fx.triggers.try_recv()?;
        let second = fx.triggers.try_recv()?;
        assert_eq!(first.correlation_id().as_str(), "c-42");
        assert_eq!(second.correlation_id().as_str(), "c-42");
        match (&first.payload, &second.payload) {
            (
                Payload::WorkflowTrigger { workflow_id: a, data: forwarded, source, .. },
                Payload::WorkflowTrigger { workflow_id: b, data: withheld, .. },
            ) => {
                assert_eq!(a, "maintenance");
                assert_eq!(b, "audit");
                assert_eq!(source, ROUTER_SOURCE);
                assert_eq!(forwarded["asset"], "pump-1");
                assert_eq!(withheld, &json!({}));
            }
            other => panic!("unexpected payloads {:?}", other),
        }

        let events = fx.engine.events.lock().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.ignore_invalid));

        let trace = fx.bus.tracer().get_trace("plant", "c-42").await;
        let actions: Vec<&str> = trace.iter().map(|e| e.action.as_str()).collect();
        assert!(actions.contains(&"intent_received"));
        assert!(actions.contains(&"intent_matched"));
        assert!(actions.contains(&"workflow_triggered"));
        Ok(())
    }

    #[tokio::test]
    async fn test_urgency_filter_skips_mapping() -> Result<()> {
        let mut fx = fixture(Some(vec![mapping("maintenance", true, Some(vec![Urgency::Critical]))])).await?;
        fx.bus.publish(intent(Some(Urgency::Low))).await?;
        assert!(fx.triggers.try_recv().is_err());
        assert!(fx.engine.events.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_mapping_does_not_block_others() -> Result<()> {
        let mut fx = fixture(Some(vec![mapping("broken", false, None), mapping("audit", false, None)])).await?;
        fx.bus.publish(intent(None)).await?;

        assert!(fx.triggers.try_recv().is_ok());
        assert!(fx.triggers.try_recv().is_ok());
        assert_eq!(fx.engine.events.lock().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_configuration_is_noop() -> Result<()> {
        let mut fx = fixture(None).await?;
        fx.bus.publish(intent(None)).await?;
        assert!(fx.triggers.try_recv().is_err());
        Ok(())
    }
}
