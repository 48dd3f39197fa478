use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::decision::types::{DecisionGraph, ItemRef};
use crate::memory::{EntityKey, KnowledgeStore};

/// One entity a graph depends on, with the items that reference it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HydratedEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub properties: Map<String, Value>,
    pub exists: bool,
    pub referenced_by: Vec<ItemRef>,
}

/// Fetches every entity referenced by a condition or action, in first
/// reference order. Entities are distinct by `(type, id)`, matching the
/// store key. Absent or unreadable entities hydrate with empty properties.
pub async fn hydrate(
    store: &dyn KnowledgeStore,
    project: &str,
    graph: &DecisionGraph,
) -> Result<Vec<HydratedEntity>> {
    let mut order: Vec<EntityKey> = Vec::new();
    let mut refs: Vec<Vec<ItemRef>> = Vec::new();
    for (key, item) in graph.entity_references() {
        match order.iter().position(|k| *k == key) {
            Some(i) => refs[i].push(item),
            None => {
                order.push(key);
                refs.push(vec![item]);
            }
        }
    }

    let mut hydrated = Vec::with_capacity(order.len());
    for (key, referenced_by) in order.into_iter().zip(refs) {
        let entity = match store.get_entity(project, &key).await {
            Ok(Some(entity)) => Some(entity),
            Ok(None) => {
                warn!(project, graph_id = %graph.id, entity = %key, "referenced entity not in store");
                None
            }
            Err(e) => {
                warn!(project, graph_id = %graph.id, entity = %key, error = %e, "referenced entity could not be read");
                None
            }
        };
        hydrated.push(HydratedEntity {
            exists: entity.is_some(),
            properties: entity.map(|e| e.properties).unwrap_or_default(),
            entity_type: key.entity_type,
            entity_id: key.id,
            referenced_by,
        });
    }
    Ok(hydrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::fixtures::pressure_graph;
    use crate::memory::{Entity, GraphStore, Relationship};
    use async_trait::async_trait;

    /// Delegates to a real store but fails reads of one entity.
    struct FlakyStore {
        inner: GraphStore,
        broken: EntityKey,
    }

    #[async_trait]
    impl KnowledgeStore for FlakyStore {
        async fn upsert_entity(&self, project: &str, entity: &Entity) -> Result<()> {
            self.inner.upsert_entity(project, entity).await
        }
        async fn get_entity(&self, project: &str, key: &EntityKey) -> Result<Option<Entity>> {
            if *key == self.broken {
                anyhow::bail!("read timed out");
            }
            self.inner.get_entity(project, key).await
        }
        async fn delete_entity(&self, project: &str, key: &EntityKey) -> Result<bool> {
            self.inner.delete_entity(project, key).await
        }
        async fn list_entities(
            &self,
            project: &str,
            entity_type: &str,
            limit: Option<usize>,
        ) -> Result<Vec<Entity>> {
            self.inner.list_entities(project, entity_type, limit).await
        }
        async fn all_entities(&self, project: &str) -> Result<Vec<Entity>> {
            self.inner.all_entities(project).await
        }
        async fn add_relationship(&self, project: &str, relationship: &Relationship) -> Result<()> {
            self.inner.add_relationship(project, relationship).await
        }
        async fn remove_relationship(&self, project: &str, relationship: &Relationship) -> Result<()> {
            self.inner.remove_relationship(project, relationship).await
        }
        async fn relationships_of(&self, project: &str, key: &EntityKey) -> Result<Vec<Relationship>> {
            self.inner.relationships_of(project, key).await
        }
        async fn all_relationships(&self, project: &str) -> Result<Vec<Relationship>> {
            self.inner.all_relationships(project).await
        }
        async fn query(&self, project: &str, script: &str) -> Result<Vec<Map<String, Value>>> {
            self.inner.query(project, script).await
        }
    }

    #[tokio::test]
    async fn test_absent_entity_hydrates_empty() -> Result<()> {
        let store = GraphStore::in_memory()?;
        let mut graph = pressure_graph("plant", "g-1");
        graph.actions[0].target_entity_id = Some("X".to_string());
        store
            .upsert_entity("plant", &Entity::new("Sensor", "pressure").with_property("value", 120))
            .await?;

        let hydrated = hydrate(&store, "plant", &graph).await?;
        assert_eq!(hydrated.len(), 2);

        let x: Vec<_> = hydrated.iter().filter(|h| h.entity_id == "X").collect();
        assert_eq!(x.len(), 1);
        assert!(!x[0].exists);
        assert!(x[0].properties.is_empty());
        assert_eq!(x[0].referenced_by, vec![ItemRef::action("a-1")]);

        assert!(hydrated[0].exists);
        assert_eq!(hydrated[0].properties["value"], 120);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_entity_does_not_abort_hydration() -> Result<()> {
        let store = FlakyStore {
            inner: GraphStore::in_memory()?,
            broken: EntityKey::new("Valve", "vent-1"),
        };
        let mut graph = pressure_graph("plant", "g-1");
        graph.actions[0].target_entity_id = Some("vent-1".to_string());
        store
            .upsert_entity("plant", &Entity::new("Sensor", "pressure").with_property("value", 120))
            .await?;

        let hydrated = hydrate(&store, "plant", &graph).await?;
        assert_eq!(hydrated.len(), 2);
        assert!(hydrated[0].exists);
        assert_eq!(hydrated[0].properties["value"], 120);
        assert_eq!(hydrated[1].entity_id, "vent-1");
        assert!(!hydrated[1].exists);
        assert!(hydrated[1].properties.is_empty());
        assert_eq!(hydrated[1].referenced_by, vec![ItemRef::action("a-1")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_entity_is_fetched_once() -> Result<()> {
        let store = GraphStore::in_memory()?;
        let mut graph = pressure_graph("plant", "g-1");
        graph.actions[0].target_entity_type = "Sensor".to_string();
        graph.actions[0].target_entity_id = Some("pressure".to_string());

        let hydrated = hydrate(&store, "plant", &graph).await?;
        assert_eq!(hydrated.len(), 1);
        assert_eq!(
            hydrated[0].referenced_by,
            vec![ItemRef::condition("c-1"), ItemRef::action("a-1")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unreferenced_graph_hydrates_nothing() -> Result<()> {
        let store = GraphStore::in_memory()?;
        let mut graph = pressure_graph("plant", "g-1");
        graph.conditions[0].target_entity_id = None;
        graph.actions[0].target_entity_id = None;
        assert!(hydrate(&store, "plant", &graph).await?.is_empty());
        Ok(())
    }
}
