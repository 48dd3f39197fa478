use anyhow::{Context, Result};
use async_trait::async_trait;
use cozo::{DataValue, NamedRows, ScriptMutability};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

use super::backend_cozo::{datavalue_to_json, params, CozoBackend};
use super::{Entity, EntityKey, KnowledgeStore, Relationship};

/// [`KnowledgeStore`] over CozoDB.
pub struct GraphStore {
    backend: CozoBackend,
}

impl GraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            backend: CozoBackend::open(path)?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            backend: CozoBackend::in_memory()?,
        })
    }

    fn read(&self, script: &str, params: std::collections::BTreeMap<String, DataValue>) -> Result<NamedRows> {
        self.backend.run_script(script, params, ScriptMutability::Immutable)
    }

    fn write(&self, script: &str, params: std::collections::BTreeMap<String, DataValue>) -> Result<NamedRows> {
        self.backend.run_script(script, params, ScriptMutability::Mutable)
    }
}

fn decode_properties(raw: Option<&DataValue>) -> Map<String, Value> {
    match raw {
        Some(DataValue::Str(s)) => match serde_json::from_str(s) {
            Ok(properties) => properties,
            Err(e) => {
                warn!(error = %e, "stored entity properties are not a JSON object, treating as empty");
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

fn str_at(row: &[DataValue], index: usize) -> Option<String> {
    match row.get(index) {
        Some(DataValue::Str(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn relationships_from(rows: NamedRows) -> Vec<Relationship> {
    rows.rows
        .iter()
        .filter_map(|row| {
            Some(Relationship {
                subject: str_at(row, 0)?,
                predicate: str_at(row, 1)?,
                object: str_at(row, 2)?,
            })
        })
        .collect()
}

#[async_trait]
impl KnowledgeStore for GraphStore {
    async fn upsert_entity(&self, project: &str, entity: &Entity) -> Result<()> {
        let script = "
            ?[project, entity_type, id, properties] <- [[$project, $entity_type, $id, $properties]]
            :put entities { project, entity_type, id => properties }
        ";
        let properties = serde_json::to_string(&entity.properties)?;
        self.write(
            script,
            params([
                ("project", DataValue::from(project)),
                ("entity_type", DataValue::from(entity.entity_type.as_str())),
                ("id", DataValue::from(entity.id.as_str())),
                ("properties", DataValue::from(properties)),
            ]),
        )
        .with_context(|| format!("Failed to upsert {}", entity.key()))?;
        Ok(())
    }

    async fn get_entity(&self, project: &str, key: &EntityKey) -> Result<Option<Entity>> {
        let script = "
            ?[properties] := *entities{project: $project, entity_type: $entity_type, id: $id, properties}
        ";
        let res = self.read(
            script,
            params([
                ("project", DataValue::from(project)),
                ("entity_type", DataValue::from(key.entity_type.as_str())),
                ("id", DataValue::from(key.id.as_str())),
            ]),
        )?;

        Ok(res.rows.first().map(|row| Entity {
            entity_type: key.entity_type.clone(),
            id: key.id.clone(),
            properties: decode_properties(row.first()),
        }))
    }

    async fn delete_entity(&self, project: &str, key: &EntityKey) -> Result<bool> {
        if self.get_entity(project, key).await?.is_none() {
            return Ok(false);
        }

        let drop_edges = "
            ?[project, subject, predicate, object] := *relationships{project, subject, predicate, object},
                project == $project, subject == $key
            ?[project, subject, predicate, object] := *relationships{project, subject, predicate, object},
                project == $project, object == $key
            :rm relationships { project, subject, predicate, object }
        ";
        self.write(
            drop_edges,
            params([
                ("project", DataValue::from(project)),
                ("key", DataValue::from(key.to_string())),
            ]),
        )?;

        let drop_entity = "
            ?[project, entity_type, id] <- [[$project, $entity_type, $id]]
            :rm entities { project, entity_type, id }
        ";
        self.write(
            drop_entity,
            params([
                ("project", DataValue::from(project)),
                ("entity_type", DataValue::from(key.entity_type.as_str())),
                ("id", DataValue::from(key.id.as_str())),
            ]),
        )
        .with_context(|| format!("Failed to delete {}", key))?;
        Ok(true)
    }

    async fn list_entities(
        &self,
        project: &str,
        entity_type: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let mut script = String::from(
            "
            ?[id, properties] := *entities{project: $project, entity_type: $entity_type, id, properties}
            :sort id
        ",
        );
        if let Some(limit) = limit {
            script.push_str(&format!("            :limit {}\n", limit));
        }

        let res = self.read(
            &script,
            params([
                ("project", DataValue::from(project)),
                ("entity_type", DataValue::from(entity_type)),
            ]),
        )?;

        Ok(res
            .rows
            .iter()
            .filter_map(|row| {
                Some(Entity {
                    entity_type: entity_type.to_string(),
                    id: str_at(row, 0)?,
                    properties: decode_properties(row.get(1)),
                })
            })
            .collect())
    }

    async fn all_entities(&self, project: &str) -> Result<Vec<Entity>> {
        let script = "
            ?[entity_type, id, properties] := *entities{project: $project, entity_type, id, properties}
            :sort entity_type, id
        ";
        let res = self.read(script, params([("project", DataValue::from(project))]))?;

        Ok(res
            .rows
            .iter()
            .filter_map(|row| {
                Some(Entity {
                    entity_type: str_at(row, 0)?,
                    id: str_at(row, 1)?,
                    properties: decode_properties(row.get(2)),
                })
            })
            .collect())
    }

    async fn add_relationship(&self, project: &str, relationship: &Relationship) -> Result<()> {
        let script = "
            ?[project, subject, predicate, object] <- [[$project, $subject, $predicate, $object]]
            :put relationships { project, subject, predicate, object }
        ";
        self.write(
            script,
            params([
                ("project", DataValue::from(project)),
                ("subject", DataValue::from(relationship.subject.as_str())),
                ("predicate", DataValue::from(relationship.predicate.as_str())),
                ("object", DataValue::from(relationship.object.as_str())),
            ]),
        )?;
        Ok(())
    }

    async fn remove_relationship(&self, project: &str, relationship: &Relationship) -> Result<()> {
        let script = "
            ?[project, subject, predicate, object] <- [[$project, $subject, $predicate, $object]]
            :rm relationships { project, subject, predicate, object }
        ";
        self.write(
            script,
            params([
                ("project", DataValue::from(project)),
                ("subject", DataValue::from(relationship.subject.as_str())),
                ("predicate", DataValue::from(relationship.predicate.as_str())),
                ("object", DataValue::from(relationship.object.as_str())),
            ]),
        )?;
        Ok(())
    }

    async fn relationships_of(&self, project: &str, key: &EntityKey) -> Result<Vec<Relationship>> {
        let script = "
            ?[subject, predicate, object] := *relationships{project: $project, subject, predicate, object},
                subject == $key
            ?[subject, predicate, object] := *relationships{project: $project, subject, predicate, object},
                object == $key
        ";
        let res = self.read(
            script,
            params([
                ("project", DataValue::from(project)),
                ("key", DataValue::from(key.to_string())),
            ]),
        )?;
        Ok(relationships_from(res))
    }

    async fn all_relationships(&self, project: &str) -> Result<Vec<Relationship>> {
        let script = "
            ?[subject, predicate, object] := *relationships{project: $project, subject, predicate, object}
        ";
        let res = self.read(script, params([("project", DataValue::from(project))]))?;
        Ok(relationships_from(res))
    }

    async fn query(&self, project: &str, script: &str) -> Result<Vec<Map<String, Value>>> {
        let res = self.read(script, params([("project", DataValue::from(project))]))?;
        Ok(res
            .rows
            .iter()
            .map(|row| {
                res.headers
                    .iter()
                    .zip(row.iter())
                    .map(|(header, value)| (header.clone(), datavalue_to_json(value)))
                    .collect()
            })
            .collect())
    }
}
