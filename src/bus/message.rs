//! Bus message envelope and the closed set of payload variants.
//!
//! Every message carries the same two-field [`Envelope`]; the payload is one
//! variant per topic family, so the topic a message travels on and the trace
//! data it leaves behind are both derived by exhaustive matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

pub mod topics {
    pub const RAW_EVENTS: &str = "events/raw/";
    pub const PROCESSED_EVENTS: &str = "events/processed/";
    pub const INTENT: &str = "agent/intent";
    pub const WORKFLOW_TRIGGER: &str = "workflow/trigger";
    pub const WORKFLOW_STATUS: &str = "workflow/status/";
    pub const DSS_QUERY: &str = "dss/query";
    pub const DSS_RESPONSE: &str = "dss/response";
    pub const DSS_UPDATE: &str = "dss/update";
}

/// Identifier of one causal chain. Minted once at ingestion and copied
/// verbatim into everything derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Keeps a caller-supplied id and only mints when none (or a blank one)
    /// was given.
    pub fn propagate(existing: Option<String>) -> Self {
        match existing {
            Some(id) if !id.trim().is_empty() => Self(id),
            _ => Self::mint(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub project_name: String,
}

impl Envelope {
    pub fn new(project_name: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            project_name: project_name.into(),
        }
    }

    /// Starts a new causal chain for `project_name`.
    pub fn mint(project_name: impl Into<String>) -> Self {
        Self::new(project_name, CorrelationId::mint())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

/// A perception event as handed over by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    EntityContext,
    DecisionGraph,
    OntologyContext,
    Sparql,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::EntityContext => "entity-context",
            QueryKind::DecisionGraph => "decision-graph",
            QueryKind::OntologyContext => "ontology-context",
            QueryKind::Sparql => "sparql",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "queryKind",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum DssQuery {
    EntityContext { entity_type: String, entity_id: String },
    DecisionGraph { graph_id: String },
    OntologyContext,
    Sparql { query: String },
}

impl DssQuery {
    pub fn kind(&self) -> QueryKind {
        match self {
            DssQuery::EntityContext { .. } => QueryKind::EntityContext,
            DssQuery::DecisionGraph { .. } => QueryKind::DecisionGraph,
            DssQuery::OntologyContext => QueryKind::OntologyContext,
            DssQuery::Sparql { .. } => QueryKind::Sparql,
        }
    }

    /// The kind-specific lookup key, if the query has one.
    pub fn key(&self) -> Option<String> {
        match self {
            DssQuery::EntityContext {
                entity_type,
                entity_id,
            } => Some(format!("{}/{}", entity_type, entity_id)),
            DssQuery::DecisionGraph { graph_id } => Some(graph_id.clone()),
            DssQuery::OntologyContext => None,
            DssQuery::Sparql { query } => Some(query.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "updateKind",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum DssUpdate {
    AddEntity {
        entity_type: String,
        entity_id: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    AddRelationship {
        subject: String,
        predicate: String,
        object: String,
    },
    UpdateEntity {
        entity_type: String,
        entity_id: String,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    UpdateActionStatus {
        graph_id: String,
        action_id: String,
        status: String,
    },
}

impl DssUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            DssUpdate::AddEntity { .. } => "add-entity",
            DssUpdate::AddRelationship { .. } => "add-relationship",
            DssUpdate::UpdateEntity { .. } => "update-entity",
            DssUpdate::UpdateActionStatus { .. } => "update-action-status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Payload {
    RawEvent {
        channel: String,
        event: RawEvent,
    },
    ProcessedEvent {
        channel: String,
        event: RawEvent,
        #[serde(default)]
        matched_rules: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    Intent {
        intent_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        urgency: Option<Urgency>,
        #[serde(default)]
        context: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_event: Option<Value>,
    },
    WorkflowTrigger {
        workflow_id: String,
        event: String,
        #[serde(default)]
        data: Value,
        source: String,
    },
    WorkflowStatus {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_name: Option<String>,
        previous_state: String,
        new_state: String,
        triggering_event: String,
        #[serde(default)]
        terminal: bool,
    },
    DssQuery {
        query: DssQuery,
    },
    DssResponse {
        query_kind: QueryKind,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DssUpdate {
        update: DssUpdate,
    },
}

impl Payload {
    pub fn topic(&self) -> String {
        match self {
            Payload::RawEvent { channel, .. } => format!("{}{}", topics::RAW_EVENTS, channel),
            Payload::ProcessedEvent { channel, .. } => {
                format!("{}{}", topics::PROCESSED_EVENTS, channel)
            }
            Payload::Intent { .. } => topics::INTENT.to_string(),
            Payload::WorkflowTrigger { .. } => topics::WORKFLOW_TRIGGER.to_string(),
            Payload::WorkflowStatus { workflow_id, .. } => {
                format!("{}{}", topics::WORKFLOW_STATUS, workflow_id)
            }
            Payload::DssQuery { .. } => topics::DSS_QUERY.to_string(),
            Payload::DssResponse { .. } => topics::DSS_RESPONSE.to_string(),
            Payload::DssUpdate { .. } => topics::DSS_UPDATE.to_string(),
        }
    }

    /// The small key/value subset recorded in the trace log. Never the full
    /// payload.
    pub fn trace_data(&self) -> Map<String, Value> {
        let data = match self {
            Payload::RawEvent { event, .. } => json!({
                "eventId": event.id,
                "source": event.source,
            }),
            Payload::ProcessedEvent {
                event,
                matched_rules,
                context,
                ..
            } => json!({
                "eventId": event.id,
                "matchedRules": matched_rules,
                "enriched": context.is_some(),
            }),
            Payload::Intent {
                intent_type,
                urgency,
                ..
            } => json!({
                "intentType": intent_type,
                "urgency": urgency.map(|u| u.as_str()),
            }),
            Payload::WorkflowTrigger {
                workflow_id,
                event,
                source,
                ..
            } => json!({
                "workflowId": workflow_id,
                "event": event,
                "source": source,
            }),
            Payload::WorkflowStatus {
                workflow_id,
                previous_state,
                new_state,
                terminal,
                ..
            } => json!({
                "workflowId": workflow_id,
                "from": previous_state,
                "to": new_state,
                "terminal": terminal,
            }),
            Payload::DssQuery { query } => json!({
                "queryKind": query.kind().as_str(),
                "key": query.key(),
            }),
            Payload::DssResponse {
                query_kind,
                success,
                error,
                ..
            } => json!({
                "queryKind": query_kind.as_str(),
                "success": success,
                "error": error,
            }),
            Payload::DssUpdate { update } => json!({
                "updateKind": update.kind(),
            }),
        };

        match data {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub payload: Payload,
}

impl BusMessage {
    pub fn new(envelope: Envelope, payload: Payload) -> Self {
        Self { envelope, payload }
    }

    /// A message caused by this one: same envelope, new payload.
    pub fn derive(&self, payload: Payload) -> Self {
        Self {
            envelope: self.envelope.clone(),
            payload,
        }
    }

    pub fn topic(&self) -> String {
        self.payload.topic()
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.envelope.correlation_id
    }

    pub fn project_name(&self) -> &str {
        &self.envelope.project_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propagate_keeps_supplied_id() {
        assert_eq!(
            CorrelationId::propagate(Some("c-1".to_string())).as_str(),
            "c-1"
        );
        assert!(!CorrelationId::propagate(None).is_blank());
        assert_ne!(CorrelationId::propagate(Some("  ".to_string())).as_str(), "  ");
    }

    #[test]
    fn test_wire_shape_is_flat_camel_case() {
        let msg = BusMessage::new(
            Envelope::new("plant", CorrelationId::from("c-9")),
            Payload::WorkflowTrigger {
                workflow_id: "wf-1".to_string(),
                event: "START".to_string(),
                data: json!({}),
                source: "intent-router".to_string(),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["correlationId"], "c-9");
        assert_eq!(value["projectName"], "plant");
        assert_eq!(value["type"], "workflow_trigger");
        assert_eq!(value["workflowId"], "wf-1");

        let back: BusMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_topics_follow_payload() {
        let env = Envelope::mint("p");
        let raw = BusMessage::new(
            env.clone(),
            Payload::RawEvent {
                channel: "email".to_string(),
                event: RawEvent::new("imap", json!({"subject": "hi"})),
            },
        );
        assert_eq!(raw.topic(), "events/raw/email");

        let query = raw.derive(Payload::DssQuery {
            query: DssQuery::OntologyContext,
        });
        assert_eq!(query.topic(), "dss/query");
        assert_eq!(query.correlation_id(), raw.correlation_id());
    }

    #[test]
    fn test_trace_data_is_a_subset() {
        let payload = Payload::Intent {
            intent_type: "shutdown_pump".to_string(),
            urgency: Some(Urgency::High),
            context: json!({"big": "blob"}),
            source_event: None,
        };
        let data = payload.trace_data();
        assert_eq!(data["intentType"], "shutdown_pump");
        assert_eq!(data["urgency"], "high");
        assert!(!data.contains_key("context"));
    }
}
