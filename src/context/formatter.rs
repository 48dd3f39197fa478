use serde_json::{Map, Value};

use super::{Direction, EntityContext};

/// `key=value, ...` with strings unquoted. Keys in map order.
pub fn flatten_properties(properties: &Map<String, Value>) -> String {
    properties
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Prompt-ready block for one entity.
pub fn format_entity_context(context: &EntityContext, include_relationships: bool) -> String {
    let entity = &context.entity;
    let mut out = format!("### Entity: {}\nType: {}\n", entity.id, entity.entity_type);

    if entity.properties.is_empty() {
        out.push_str("Properties: (none)\n");
    } else {
        out.push_str(&format!("Properties: {}\n", flatten_properties(&entity.properties)));
    }

    if include_relationships && !context.relationships.is_empty() {
        out.push_str("Relationships:\n");
        for rel in &context.relationships {
            let arrow = match rel.direction {
                Direction::Outgoing => "→",
                Direction::Incoming => "←",
            };
            out.push_str(&format!("- {} {} {}\n", rel.predicate, arrow, rel.other));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DirectedRelationship;
    use crate::memory::Entity;
    use serde_json::json;

    fn context() -> EntityContext {
        EntityContext {
            entity: Entity::new("Sensor", "pressure")
                .with_property("unit", "bar")
                .with_property("value", json!(151.5)),
            relationships: vec![
                DirectedRelationship {
                    predicate: "monitors".to_string(),
                    direction: Direction::Outgoing,
                    other: "Asset/pump-1".to_string(),
                },
                DirectedRelationship {
                    predicate: "hosts".to_string(),
                    direction: Direction::Incoming,
                    other: "Site/north".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_full_block() {
        let text = format_entity_context(&context(), true);
        assert_eq!(
            text,
            "### Entity: pressure\nType: Sensor\nProperties: unit=bar, value=151.5\n\
             Relationships:\n- monitors → Asset/pump-1\n- hosts ← Site/north\n"
        );
    }

    #[test]
    fn test_relationships_optional() {
        let text = format_entity_context(&context(), false);
        assert!(!text.contains("Relationships"));
        assert!(text.starts_with("### Entity: pressure"));
    }
}
