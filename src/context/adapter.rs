use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::formatter::{flatten_properties, format_entity_context};
use super::{DirectedRelationship, Direction, EntityContext, ONTOLOGY_ENTITY_TYPES};
use crate::bus::{BusMessage, CorrelationId, DssQuery, Envelope, MessageBus, Payload};
use crate::decision::repository::GraphRepository;
use crate::decision::types::DecisionGraph;
use crate::memory::{EntityKey, KnowledgeStore};

const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Every read publishes `dss/query` before it runs and `dss/response` after,
/// both under the same correlation id. A failed read yields an empty value;
/// the error text only travels in the response message.
pub struct ContextAdapter {
    bus: Arc<MessageBus>,
    store: Arc<dyn KnowledgeStore>,
    graphs: Arc<GraphRepository>,
}

impl ContextAdapter {
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<dyn KnowledgeStore>,
        graphs: Arc<GraphRepository>,
    ) -> Self {
        Self { bus, store, graphs }
    }

    async fn instrumented<T, Fut>(
        &self,
        project: &str,
        correlation_id: Option<CorrelationId>,
        query: DssQuery,
        read: Fut,
        empty: T,
    ) -> T
    where
        T: Serialize,
        Fut: Future<Output = Result<T>>,
    {
        let envelope = Envelope::new(
            project,
            correlation_id.unwrap_or_else(CorrelationId::mint),
        );
        let query_kind = query.kind();
        self.emit(BusMessage::new(envelope.clone(), Payload::DssQuery { query }))
            .await;

        let (value, payload) = match read.await {
            Ok(value) => {
                let result = serde_json::to_value(&value).unwrap_or(Value::Null);
                let payload = Payload::DssResponse {
                    query_kind,
                    success: true,
                    result,
                    error: None,
                };
                (value, payload)
            }
            Err(e) => {
                warn!(
                    project,
                    query_kind = query_kind.as_str(),
                    correlation_id = %envelope.correlation_id,
                    error = %e,
                    "context read failed"
                );
                let payload = Payload::DssResponse {
                    query_kind,
                    success: false,
                    result: Value::Null,
                    error: Some(e.to_string()),
                };
                (empty, payload)
            }
        };
        self.emit(BusMessage::new(envelope, payload)).await;
        value
    }

    async fn emit(&self, message: BusMessage) {
        if let Err(e) = self.bus.publish(message).await {
            warn!(error = %e, "context instrumentation not published");
        }
    }

    /// Properties and relationships of one entity; `None` if absent.
    pub async fn entity_context(
        &self,
        project: &str,
        entity_type: &str,
        entity_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Option<EntityContext> {
        let query = DssQuery::EntityContext {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        };
        let key = EntityKey::new(entity_type, entity_id);
        let read = async {
            let Some(entity) = self.store.get_entity(project, &key).await? else {
                return Ok(None);
            };
            let own = key.to_string();
            let relationships = self
                .store
                .relationships_of(project, &key)
                .await?
                .into_iter()
                .map(|r| {
                    if r.subject == own {
                        DirectedRelationship {
                            predicate: r.predicate,
                            direction: Direction::Outgoing,
                            other: r.object,
                        }
                    } else {
                        DirectedRelationship {
                            predicate: r.predicate,
                            direction: Direction::Incoming,
                            other: r.subject,
                        }
                    }
                })
                .collect();
            Ok::<_, anyhow::Error>(Some(EntityContext {
                entity,
                relationships,
            }))
        };
        self.instrumented(project, correlation_id, query, read, None)
            .await
    }

    pub async fn decision_graph(
        &self,
        project: &str,
        graph_id: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Option<DecisionGraph> {
        let query = DssQuery::DecisionGraph {
            graph_id: graph_id.to_string(),
        };
        let read = async { Ok::<_, anyhow::Error>(self.graphs.load(project, graph_id).await?) };
        self.instrumented(project, correlation_id, query, read, None)
            .await
    }

    /// Markdown summary of the ontology types and the saved graphs.
    pub async fn ontology_context(
        &self,
        project: &str,
        correlation_id: Option<CorrelationId>,
    ) -> String {
        let read = ontology_summary(self.store.as_ref(), &self.graphs, project, None);
        self.instrumented(
            project,
            correlation_id,
            DssQuery::OntologyContext,
            read,
            String::new(),
        )
        .await
    }

    /// Arbitrary read-only graph query, one JSON object per row.
    pub async fn graph_query(
        &self,
        project: &str,
        script: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Vec<Map<String, Value>> {
        let query = DssQuery::Sparql {
            query: script.to_string(),
        };
        let read = self.store.query(project, script);
        self.instrumented(project, correlation_id, query, read, Vec::new())
            .await
    }

    /// Prepends the entity's context block to `base_prompt`. Returns the
    /// prompt unchanged when there is no context.
    pub async fn enrich_prompt(
        &self,
        project: &str,
        entity_type: &str,
        entity_id: &str,
        base_prompt: &str,
        correlation_id: Option<CorrelationId>,
    ) -> String {
        match self
            .entity_context(project, entity_type, entity_id, correlation_id)
            .await
        {
            Some(context) => format!(
                "{}{}{}",
                format_entity_context(&context, true).trim_end(),
                PROMPT_SEPARATOR,
                base_prompt
            ),
            None => base_prompt.to_string(),
        }
    }
}

/// Up to `per_type` instances of each ontology type (all when `None`), then
/// the titles of the saved decision graphs.
pub async fn ontology_summary(
    store: &dyn KnowledgeStore,
    graphs: &GraphRepository,
    project: &str,
    per_type: Option<usize>,
) -> Result<String> {
    let mut out = format!("# Ontology: {}\n", project);
    for entity_type in ONTOLOGY_ENTITY_TYPES {
        let entities = store.list_entities(project, entity_type, per_type).await?;
        if entities.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {}\n", entity_type));
        for entity in entities {
            if entity.properties.is_empty() {
                out.push_str(&format!("- {}\n", entity.id));
            } else {
                out.push_str(&format!(
                    "- {}: {}\n",
                    entity.id,
                    flatten_properties(&entity.properties)
                ));
            }
        }
    }

    let summaries = graphs.list(project).await?;
    if !summaries.is_empty() {
        out.push_str("\n## Existing decision graphs\n");
        for graph in summaries {
            out.push_str(&format!("- {} ({})\n", graph.title, graph.id));
        }
    }
    Ok(out)
}
