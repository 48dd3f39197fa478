pub mod backend_cozo;
pub mod store_graph;

pub use store_graph::GraphStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// `Type/id` address of an entity inside one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Splits `Type/id` at the first `/`.
    pub fn parse(key: &str) -> Option<Self> {
        let (entity_type, id) = key.split_once('/')?;
        if entity_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub entity_type: String,
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.id)
    }

    pub fn str_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }
}

/// Directed edge `subject --predicate--> object`, both ends as `Type/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Relationship {
    pub fn new(subject: &EntityKey, predicate: &str, object: &EntityKey) -> Self {
        Self {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object: object.to_string(),
        }
    }
}

/// Entity/relationship store backing decision graphs and entity context.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or overwrite by `(project, type, id)`.
    async fn upsert_entity(&self, project: &str, entity: &Entity) -> Result<()>;
    async fn get_entity(&self, project: &str, key: &EntityKey) -> Result<Option<Entity>>;
    /// Removes the entity and every relationship touching it. `false` when
    /// there was nothing to remove.
    async fn delete_entity(&self, project: &str, key: &EntityKey) -> Result<bool>;
    async fn list_entities(
        &self,
        project: &str,
        entity_type: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>>;
    async fn all_entities(&self, project: &str) -> Result<Vec<Entity>>;

    async fn add_relationship(&self, project: &str, relationship: &Relationship) -> Result<()>;
    async fn remove_relationship(&self, project: &str, relationship: &Relationship) -> Result<()>;
    /// Relationships in which `key` is subject or object.
    async fn relationships_of(&self, project: &str, key: &EntityKey) -> Result<Vec<Relationship>>;
    async fn all_relationships(&self, project: &str) -> Result<Vec<Relationship>>;

    /// Arbitrary read-only graph query with `$project` bound. One JSON
    /// object per row, keyed by column header.
    async fn query(&self, project: &str, script: &str) -> Result<Vec<Map<String, Value>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_round_trip() {
        let key = EntityKey::new("Sensor", "pressure-1");
        assert_eq!(key.to_string(), "Sensor/pressure-1");
        assert_eq!(EntityKey::parse("Sensor/pressure-1"), Some(key));
        assert_eq!(
            EntityKey::parse("Site/a/b"),
            Some(EntityKey::new("Site", "a/b"))
        );
        assert_eq!(EntityKey::parse("nokey"), None);
        assert_eq!(EntityKey::parse("/x"), None);
    }
}
