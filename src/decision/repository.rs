//! Decision graphs as linked entities in the knowledge store.
//!
//! Layout for a graph `g`:
//! - `Decision/g`: title, description, timestamps, nodes, edges, commit state
//! - `Condition/g:<id>` and `Action/g:<id>`: one entity per item
//! - `Decision/g -hasCondition-> Condition/..`, `Decision/g -hasAction-> Action/..`
//! - `Action/.. -requiresCondition-> Condition/..`
//! - `Condition/..|Action/.. -targetsEntity-> <Type>/<id>`
//!
//! Saving is staged: the root is written `pending` first and flipped to
//! `committed` only after every item and edge is in place. Readers ignore
//! pending roots, so an interrupted save never surfaces as a half graph.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    Action, ActionStatus, Condition, DecisionGraph, Edge, GraphDraft, GraphSummary, GraphWarning,
    Node,
};
use super::{DecisionError, EventPublisher};
use crate::memory::{Entity, EntityKey, KnowledgeStore, Relationship};

pub const DECISION_TYPE: &str = "Decision";
pub const CONDITION_TYPE: &str = "Condition";
pub const ACTION_TYPE: &str = "Action";

pub const HAS_CONDITION: &str = "hasCondition";
pub const HAS_ACTION: &str = "hasAction";
pub const REQUIRES_CONDITION: &str = "requiresCondition";
pub const TARGETS_ENTITY: &str = "targetsEntity";

/// Predicates that only wire a graph together.
pub const BOOKKEEPING_PREDICATES: [&str; 4] =
    [HAS_CONDITION, HAS_ACTION, REQUIRES_CONDITION, TARGETS_ENTITY];

pub fn root_key(graph_id: &str) -> EntityKey {
    EntityKey::new(DECISION_TYPE, graph_id)
}

/// Item ids are only unique within a graph, so stored keys carry the graph id.
pub fn condition_key(graph_id: &str, condition_id: &str) -> EntityKey {
    EntityKey::new(CONDITION_TYPE, format!("{}:{}", graph_id, condition_id))
}

pub fn action_key(graph_id: &str, action_id: &str) -> EntityKey {
    EntityKey::new(ACTION_TYPE, format!("{}:{}", graph_id, action_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CommitState {
    Pending,
    #[default]
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootRecord {
    title: String,
    #[serde(default)]
    description: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat_context: Option<String>,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    commit_state: CommitState,
}

/// Item record: the item itself plus its owner and list position.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemRecord<T> {
    graph_id: String,
    position: usize,
    #[serde(flatten)]
    item: T,
}

fn to_properties<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected an object, got {}", other)),
    }
}

fn from_properties<T: DeserializeOwned>(entity: &Entity) -> Result<T> {
    serde_json::from_value(Value::Object(entity.properties.clone()))
        .map_err(|e| anyhow!("malformed {}: {}", entity.key(), e))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedGraph {
    pub id: String,
    pub warnings: Vec<GraphWarning>,
}

pub struct GraphRepository {
    store: Arc<dyn KnowledgeStore>,
    events: Arc<dyn EventPublisher>,
}

impl GraphRepository {
    pub fn new(store: Arc<dyn KnowledgeStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    async fn read_root(&self, project: &str, graph_id: &str) -> Result<Option<RootRecord>> {
        let Some(entity) = self.store.get_entity(project, &root_key(graph_id)).await? else {
            return Ok(None);
        };
        Ok(Some(from_properties(&entity)?))
    }

    async fn write_root(&self, project: &str, graph_id: &str, root: &RootRecord) -> Result<()> {
        let entity = Entity {
            entity_type: DECISION_TYPE.to_string(),
            id: graph_id.to_string(),
            properties: to_properties(root)?,
        };
        self.store.upsert_entity(project, &entity).await
    }

    /// Keys of the condition/action entities hanging off a root.
    async fn item_keys(&self, project: &str, graph_id: &str) -> Result<Vec<EntityKey>> {
        let root = root_key(graph_id).to_string();
        Ok(self
            .store
            .relationships_of(project, &root_key(graph_id))
            .await?
            .into_iter()
            .filter(|r| r.subject == root)
            .filter(|r| r.predicate == HAS_CONDITION || r.predicate == HAS_ACTION)
            .filter_map(|r| EntityKey::parse(&r.object))
            .collect())
    }

    async fn load_items<T: DeserializeOwned>(
        &self,
        project: &str,
        graph_id: &str,
        keys: &[EntityKey],
        entity_type: &str,
    ) -> Result<Vec<T>> {
        let mut records: Vec<ItemRecord<T>> = Vec::new();
        for key in keys.iter().filter(|k| k.entity_type == entity_type) {
            match self.store.get_entity(project, key).await? {
                Some(entity) => records.push(from_properties(&entity)?),
                None => warn!(project, graph_id, item = %key, "graph item missing from store"),
            }
        }
        records.sort_by_key(|r| r.position);
        Ok(records.into_iter().map(|r| r.item).collect())
    }

    pub async fn save(&self, project: &str, draft: GraphDraft) -> Result<SavedGraph, DecisionError> {
        let now = Utc::now();
        let graph_id = draft
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let created_at = match self.read_root(project, &graph_id).await {
            Ok(Some(existing)) => existing.created_at,
            Ok(None) => now,
            Err(e) => {
                warn!(project, graph_id = %graph_id, error = %e, "unreadable previous root, replacing");
                now
            }
        };

        let graph = DecisionGraph {
            id: graph_id.clone(),
            title: draft.body.title,
            description: draft.body.description,
            project: project.to_string(),
            created_at,
            updated_at: now,
            chat_context: draft.chat_context,
            nodes: draft.body.nodes,
            edges: draft.body.edges,
            conditions: draft.body.conditions,
            actions: draft.body.actions,
        };
        let warnings = graph.validate();
        for warning in &warnings {
            warn!(project, graph_id = %graph_id, "{}", warning);
        }

        self.persist(project, &graph).await?;
        info!(
            project,
            graph_id = %graph_id,
            conditions = graph.conditions.len(),
            actions = graph.actions.len(),
            "decision graph saved"
        );
        Ok(SavedGraph {
            id: graph_id,
            warnings,
        })
    }

    async fn persist(&self, project: &str, graph: &DecisionGraph) -> Result<()> {
        let mut root = RootRecord {
            title: graph.title.clone(),
            description: graph.description.clone(),
            created_at: graph.created_at,
            updated_at: graph.updated_at,
            chat_context: graph.chat_context.clone(),
            nodes: graph.nodes.clone(),
            edges: graph.edges.clone(),
            commit_state: CommitState::Pending,
        };
        self.write_root(project, &graph.id, &root).await?;

        // Replace, never merge: items dropped from the graph must disappear.
        for key in self.item_keys(project, &graph.id).await? {
            self.store.delete_entity(project, &key).await?;
        }

        let root_ref = root_key(&graph.id);
        for (position, condition) in graph.conditions.iter().enumerate() {
            let key = condition_key(&graph.id, &condition.id);
            self.write_item(project, &key, &graph.id, position, condition).await?;
            self.store
                .add_relationship(project, &Relationship::new(&root_ref, HAS_CONDITION, &key))
                .await?;
            if let Some(target) = &condition.target_entity_id {
                let target = EntityKey::new(&condition.target_entity_type, target);
                self.store
                    .add_relationship(project, &Relationship::new(&key, TARGETS_ENTITY, &target))
                    .await?;
            }
        }

        for (position, action) in graph.actions.iter().enumerate() {
            let key = action_key(&graph.id, &action.id);
            self.write_item(project, &key, &graph.id, position, action).await?;
            self.store
                .add_relationship(project, &Relationship::new(&root_ref, HAS_ACTION, &key))
                .await?;
            for pre in action.preconditions.iter().filter(|p| graph.condition(p).is_some()) {
                let condition = condition_key(&graph.id, pre);
                self.store
                    .add_relationship(
                        project,
                        &Relationship::new(&key, REQUIRES_CONDITION, &condition),
                    )
                    .await?;
            }
            if let Some(target) = &action.target_entity_id {
                let target = EntityKey::new(&action.target_entity_type, target);
                self.store
                    .add_relationship(project, &Relationship::new(&key, TARGETS_ENTITY, &target))
                    .await?;
            }
        }

        root.commit_state = CommitState::Committed;
        self.write_root(project, &graph.id, &root).await
    }

    async fn write_item<T: Serialize>(
        &self,
        project: &str,
        key: &EntityKey,
        graph_id: &str,
        position: usize,
        item: &T,
    ) -> Result<()> {
        let record = ItemRecord {
            graph_id: graph_id.to_string(),
            position,
            item,
        };
        let entity = Entity {
            entity_type: key.entity_type.clone(),
            id: key.id.clone(),
            properties: to_properties(&record)?,
        };
        self.store.upsert_entity(project, &entity).await
    }

    /// `None` when the graph does not exist or its last save never committed.
    pub async fn load(&self, project: &str, graph_id: &str) -> Result<Option<DecisionGraph>, DecisionError> {
        let Some(root) = self.read_root(project, graph_id).await? else {
            return Ok(None);
        };
        if root.commit_state == CommitState::Pending {
            warn!(project, graph_id, "decision graph has an uncommitted save, ignoring");
            return Ok(None);
        }

        let keys = self.item_keys(project, graph_id).await?;
        let conditions: Vec<Condition> = self.load_items(project, graph_id, &keys, CONDITION_TYPE).await?;
        let actions: Vec<Action> = self.load_items(project, graph_id, &keys, ACTION_TYPE).await?;

        Ok(Some(DecisionGraph {
            id: graph_id.to_string(),
            title: root.title,
            description: root.description,
            project: project.to_string(),
            created_at: root.created_at,
            updated_at: root.updated_at,
            chat_context: root.chat_context,
            nodes: root.nodes,
            edges: root.edges,
            conditions,
            actions,
        }))
    }

    /// Like [`GraphRepository::load`] but a missing graph is an error.
    pub async fn require(&self, project: &str, graph_id: &str) -> Result<DecisionGraph, DecisionError> {
        self.load(project, graph_id)
            .await?
            .ok_or_else(|| DecisionError::NotFound {
                graph_id: graph_id.to_string(),
            })
    }

    /// Root records only; items are not read. Newest first.
    pub async fn list(&self, project: &str) -> Result<Vec<GraphSummary>, DecisionError> {
        let mut summaries = Vec::new();
        for entity in self.store.list_entities(project, DECISION_TYPE, None).await? {
            let root: RootRecord = match from_properties(&entity) {
                Ok(root) => root,
                Err(e) => {
                    warn!(project, error = %e, "skipping unreadable decision graph");
                    continue;
                }
            };
            if root.commit_state == CommitState::Pending {
                warn!(project, graph_id = %entity.id, "skipping uncommitted decision graph");
                continue;
            }
            summaries.push(GraphSummary {
                id: entity.id,
                title: root.title,
                description: root.description,
                created_at: root.created_at,
                updated_at: root.updated_at,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// Removes items then root. Already-missing entities are skipped, and a
    /// graph that never existed is a no-op. Returns whether a root was removed.
    pub async fn delete(&self, project: &str, graph_id: &str) -> Result<bool, DecisionError> {
        for key in self.item_keys(project, graph_id).await? {
            match self.store.delete_entity(project, &key).await {
                Ok(true) => {}
                Ok(false) => debug!(project, item = %key, "graph item already gone"),
                Err(e) => warn!(project, item = %key, error = %e, "graph item delete failed"),
            }
        }
        let removed = self.store.delete_entity(project, &root_key(graph_id)).await?;
        if removed {
            info!(project, graph_id, "decision graph deleted");
        }
        Ok(removed)
    }

    /// Rewrites one action's status and announces the change.
    pub async fn update_action_status(
        &self,
        project: &str,
        graph_id: &str,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<Action, DecisionError> {
        let key = action_key(graph_id, action_id);
        let Some(mut entity) = self.store.get_entity(project, &key).await? else {
            return Err(DecisionError::ActionNotFound {
                graph_id: graph_id.to_string(),
                action_id: action_id.to_string(),
            });
        };

        entity
            .properties
            .insert("status".to_string(), Value::String(status.as_str().to_string()));
        let record: ItemRecord<Action> = from_properties(&entity)?;
        self.store.upsert_entity(project, &entity).await?;

        if let Err(e) = self
            .events
            .action_status_changed(project, graph_id, action_id, status)
            .await
        {
            warn!(project, graph_id, action_id, error = %e, "status event not published");
        }
        Ok(record.item)
    }
}
