//! Read-only joins of the ontology against every saved decision graph.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use super::repository::{
    GraphRepository, ACTION_TYPE, BOOKKEEPING_PREDICATES, CONDITION_TYPE, DECISION_TYPE,
};
use super::types::ItemRef;
use crate::context::ONTOLOGY_ENTITY_TYPES;
use crate::memory::{Entity, EntityKey, KnowledgeStore, Relationship};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphReference {
    pub graph_id: String,
    pub graph_title: String,
    #[serde(flatten)]
    pub item: ItemRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub properties: Map<String, Value>,
    pub referenced_by: Vec<GraphReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub referenced_by: Vec<GraphReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMap {
    pub entities: Vec<MappedEntity>,
    /// Referenced by some graph but absent from the store.
    pub missing: Vec<MissingEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewNode {
    pub key: String,
    pub entity_type: String,
    pub entity_id: String,
    pub label: String,
    pub missing: bool,
    pub reference_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphView {
    pub nodes: Vec<ViewNode>,
    pub edges: Vec<Relationship>,
}

fn is_graph_internal(key: &str) -> bool {
    EntityKey::parse(key)
        .map(|k| matches!(k.entity_type.as_str(), DECISION_TYPE | CONDITION_TYPE | ACTION_TYPE))
        .unwrap_or(false)
}

/// Every entity reference of every committed graph.
async fn collect_references(
    graphs: &GraphRepository,
    project: &str,
) -> Result<BTreeMap<EntityKey, BTreeSet<GraphReference>>> {
    let mut references: BTreeMap<EntityKey, BTreeSet<GraphReference>> = BTreeMap::new();
    for summary in graphs.list(project).await? {
        let Some(graph) = graphs.load(project, &summary.id).await? else {
            continue;
        };
        for (key, item) in graph.entity_references() {
            references.entry(key).or_default().insert(GraphReference {
                graph_id: graph.id.clone(),
                graph_title: graph.title.clone(),
                item,
            });
        }
    }
    Ok(references)
}

pub async fn entity_map(
    store: &dyn KnowledgeStore,
    graphs: &GraphRepository,
    project: &str,
) -> Result<EntityMap> {
    let mut references = collect_references(graphs, project).await?;

    let mut found: BTreeMap<EntityKey, Entity> = BTreeMap::new();
    for entity_type in ONTOLOGY_ENTITY_TYPES {
        for entity in store.list_entities(project, entity_type, None).await? {
            found.insert(entity.key(), entity);
        }
    }

    let mut missing = Vec::new();
    for key in references.keys() {
        if found.contains_key(key) {
            continue;
        }
        match store.get_entity(project, key).await? {
            Some(entity) => {
                found.insert(key.clone(), entity);
            }
            None => {
                warn!(project, entity = %key, "graph references a missing entity");
                missing.push(key.clone());
            }
        }
    }

    let entities = found
        .into_iter()
        .map(|(key, entity)| MappedEntity {
            entity_type: key.entity_type.clone(),
            entity_id: key.id.clone(),
            properties: entity.properties,
            referenced_by: references
                .remove(&key)
                .map(|refs| refs.into_iter().collect())
                .unwrap_or_default(),
        })
        .collect();

    let missing = missing
        .into_iter()
        .map(|key| MissingEntity {
            referenced_by: references
                .remove(&key)
                .map(|refs| refs.into_iter().collect())
                .unwrap_or_default(),
            entity_type: key.entity_type,
            entity_id: key.id,
        })
        .collect();

    Ok(EntityMap { entities, missing })
}

pub async fn graph_view(
    store: &dyn KnowledgeStore,
    graphs: &GraphRepository,
    project: &str,
) -> Result<GraphView> {
    let map = entity_map(store, graphs, project).await?;

    let mut nodes: Vec<ViewNode> = map
        .entities
        .iter()
        .map(|e| ViewNode {
            key: format!("{}/{}", e.entity_type, e.entity_id),
            entity_type: e.entity_type.clone(),
            entity_id: e.entity_id.clone(),
            label: e
                .properties
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&e.entity_id)
                .to_string(),
            missing: false,
            reference_count: e.referenced_by.len(),
        })
        .collect();
    nodes.extend(map.missing.iter().map(|m| ViewNode {
        key: format!("{}/{}", m.entity_type, m.entity_id),
        entity_type: m.entity_type.clone(),
        entity_id: m.entity_id.clone(),
        label: m.entity_id.clone(),
        missing: true,
        reference_count: m.referenced_by.len(),
    }));

    let mut edges: Vec<Relationship> = store
        .all_relationships(project)
        .await?
        .into_iter()
        .filter(|r| !BOOKKEEPING_PREDICATES.contains(&r.predicate.as_str()))
        .filter(|r| !is_graph_internal(&r.subject) && !is_graph_internal(&r.object))
        .collect();
    edges.sort();

    Ok(GraphView { nodes, edges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::fixtures::pressure_graph;
    use crate::decision::types::{GraphDraft, GraphSuggestion, ItemKind};
    use crate::decision::EventPublisher;
    use crate::decision::types::ActionStatus;
    use crate::memory::GraphStore;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Silent;

    #[async_trait]
    impl EventPublisher for Silent {
        async fn action_status_changed(&self, _: &str, _: &str, _: &str, _: ActionStatus) -> Result<()> {
            Ok(())
        }
    }

    async fn seeded() -> Result<(Arc<dyn KnowledgeStore>, GraphRepository)> {
        let store: Arc<dyn KnowledgeStore> = Arc::new(GraphStore::in_memory()?);
        let repo = GraphRepository::new(Arc::clone(&store), Arc::new(Silent));

        let sensor = Entity::new("Sensor", "pressure").with_property("name", "Line pressure");
        let pump = Entity::new("Asset", "pump-1");
        store.upsert_entity("plant", &sensor).await?;
        store.upsert_entity("plant", &pump).await?;
        store
            .add_relationship("plant", &Relationship::new(&sensor.key(), "monitors", &pump.key()))
            .await?;

        let graph = pressure_graph("plant", "g-1");
        repo.save(
            "plant",
            GraphDraft {
                id: Some(graph.id.clone()),
                body: GraphSuggestion {
                    title: graph.title,
                    description: graph.description,
                    nodes: graph.nodes,
                    edges: graph.edges,
                    conditions: graph.conditions,
                    actions: graph.actions,
                },
                chat_context: None,
            },
        )
        .await?;
        Ok((store, repo))
    }

    #[tokio::test]
    async fn test_entity_map_splits_found_and_missing() -> Result<()> {
        let (store, repo) = seeded().await?;
        let map = entity_map(store.as_ref(), &repo, "plant").await?;

        let sensor = map
            .entities
            .iter()
            .find(|e| e.entity_id == "pressure")
            .expect("sensor mapped");
        assert_eq!(sensor.referenced_by.len(), 1);
        assert_eq!(sensor.referenced_by[0].item.kind, ItemKind::Condition);
        assert!(map.entities.iter().any(|e| e.entity_id == "pump-1" && e.referenced_by.is_empty()));

        assert_eq!(map.missing.len(), 1);
        assert_eq!(map.missing[0].entity_type, "Valve");
        assert_eq!(map.missing[0].entity_id, "relief-1");
        assert_eq!(map.missing[0].referenced_by[0].graph_id, "g-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_graph_view_hides_bookkeeping() -> Result<()> {
        let (store, repo) = seeded().await?;
        let view = graph_view(store.as_ref(), &repo, "plant").await?;

        assert_eq!(view.edges.len(), 1);
        assert_eq!(view.edges[0].predicate, "monitors");
        let sensor = view.nodes.iter().find(|n| n.key == "Sensor/pressure").expect("node");
        assert_eq!(sensor.label, "Line pressure");
        assert!(view.nodes.iter().any(|n| n.key == "Valve/relief-1" && n.missing));
        Ok(())
    }
}
