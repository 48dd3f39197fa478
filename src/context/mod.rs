//! Read façade over the knowledge store, instrumented onto the bus.

pub mod adapter;
pub mod formatter;

pub use adapter::ContextAdapter;
pub use formatter::{flatten_properties, format_entity_context};

use serde::{Deserialize, Serialize};

use crate::memory::Entity;

/// Entity types the ontology views and the derive snapshot look at.
pub const ONTOLOGY_ENTITY_TYPES: [&str; 8] = [
    "Site",
    "Asset",
    "Equipment",
    "Sensor",
    "Valve",
    "Process",
    "Person",
    "Team",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A relationship seen from one entity: the predicate, which way it points,
/// and the `Type/id` at the other end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectedRelationship {
    pub predicate: String,
    pub direction: Direction,
    pub other: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub entity: Entity,
    pub relationships: Vec<DirectedRelationship>,
}
