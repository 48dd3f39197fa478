//! Compilation of a decision graph into rules.
//!
//! Both functions are pure: the same graph always yields the same output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::types::{Action, ActionStatus, Condition, DecisionGraph, Operator};
use crate::rules::{EngineRule, RuleAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub property: String,
    pub operator: Operator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub action_type: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnTrue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emit_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub update_entity: EntityUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub triggers: Vec<String>,
    pub conditions: Vec<RuleCondition>,
    pub on_true: OnTrue,
}

/// The action's preconditions that exist in the graph, in declared order.
fn preconditions<'a>(graph: &'a DecisionGraph, action: &'a Action) -> impl Iterator<Item = &'a Condition> {
    action.preconditions.iter().filter_map(|id| graph.condition(id))
}

/// Non-empty precondition event names, first occurrence wins.
fn trigger_events(graph: &DecisionGraph, action: &Action) -> Vec<String> {
    let mut triggers: Vec<String> = Vec::new();
    for condition in preconditions(graph, action) {
        if let Some(event) = condition.event_name.as_deref().map(str::trim) {
            if !event.is_empty() && !triggers.iter().any(|t| t == event) {
                triggers.push(event.to_string());
            }
        }
    }
    triggers
}

/// One descriptor per action.
pub fn export_rules(graph: &DecisionGraph) -> Vec<RuleDescriptor> {
    graph
        .actions
        .iter()
        .map(|action| RuleDescriptor {
            id: format!("{}:{}", graph.id, action.id),
            name: action.name.clone(),
            description: action.description.clone(),
            triggers: trigger_events(graph, action),
            conditions: preconditions(graph, action)
                .map(|c| RuleCondition {
                    entity_type: c.target_entity_type.clone(),
                    entity_id: c.target_entity_id.clone(),
                    property: c.property.clone(),
                    operator: c.operator,
                    value: c.value.clone(),
                })
                .collect(),
            on_true: OnTrue {
                emit_event: action.emit_event.clone(),
                prompt: action.prompt.clone(),
                update_entity: EntityUpdate {
                    entity_type: action.target_entity_type.clone(),
                    entity_id: action.target_entity_id.clone(),
                    action_type: action.action_type.clone(),
                    parameters: action.parameters.clone(),
                },
            },
        })
        .collect()
}

/// Stable across deploys, so redeploying replaces instead of appending.
pub fn rule_id(project: &str, graph_id: &str, action_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update([0]);
    hasher.update(graph_id.as_bytes());
    hasher.update([0]);
    hasher.update(action_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("rule-{}", &digest[..16])
}

pub fn engine_rules(graph: &DecisionGraph) -> Vec<EngineRule> {
    graph
        .actions
        .iter()
        .map(|action| {
            let trigger_event = trigger_events(graph, action)
                .into_iter()
                .next()
                .unwrap_or_else(|| action.name.clone());
            let prompt = action
                .prompt
                .clone()
                .unwrap_or_else(|| format!("{}: {}", action.name, action.description));

            EngineRule {
                id: rule_id(&graph.project, &graph.id, &action.id),
                name: action.name.clone(),
                description: action.description.clone(),
                trigger_event,
                actions: vec![RuleAction::Prompt { prompt }],
                enabled: action.status == ActionStatus::Approved,
                source: format!("decision-graph:{}", graph.id),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::fixtures::pressure_graph;

    #[test]
    fn test_export_shape() {
        let graph = pressure_graph("plant", "g-1");
        let rules = export_rules(&graph);
        assert_eq!(rules.len(), 1);

        let rule = &rules[0];
        assert_eq!(rule.id, "g-1:a-1");
        assert_eq!(rule.triggers, vec!["sensor.pressure"]);
        assert_eq!(rule.conditions[0].operator, Operator::Gt);
        assert_eq!(rule.on_true.emit_event.as_deref(), Some("valve.open"));
        assert_eq!(rule.on_true.update_entity.entity_id.as_deref(), Some("relief-1"));
        assert_eq!(rule.on_true.update_entity.parameters["percent"], "50");
    }

    #[test]
    fn test_export_is_byte_identical_across_calls() -> anyhow::Result<()> {
        let graph = pressure_graph("plant", "g-1");
        let first = serde_json::to_string(&export_rules(&graph))?;
        let second = serde_json::to_string(&export_rules(&graph))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_triggers_are_deduplicated_and_skip_blanks() {
        let mut graph = pressure_graph("plant", "g-1");
        let mut twin = graph.conditions[0].clone();
        twin.id = "c-2".to_string();
        let mut blank = twin.clone();
        blank.id = "c-3".to_string();
        blank.event_name = Some("  ".to_string());
        graph.conditions.extend([twin, blank]);
        graph.actions[0].preconditions = vec!["c-1".into(), "c-2".into(), "c-3".into(), "gone".into()];

        let rule = &export_rules(&graph)[0];
        assert_eq!(rule.triggers, vec!["sensor.pressure"]);
        assert_eq!(rule.conditions.len(), 3);
    }

    #[test]
    fn test_engine_rules_fall_back_and_mirror_approval() {
        let mut graph = pressure_graph("plant", "g-1");
        let rules = engine_rules(&graph);
        assert_eq!(rules[0].trigger_event, "sensor.pressure");
        assert!(!rules[0].enabled);

        graph.actions[0].preconditions.clear();
        graph.actions[0].status = ActionStatus::Approved;
        let rules = engine_rules(&graph);
        assert_eq!(rules[0].trigger_event, "Open relief valve");
        assert!(rules[0].enabled);
        assert_eq!(rules[0].id, rule_id("plant", "g-1", "a-1"));
        assert_ne!(rule_id("plant", "g-1", "a-1"), rule_id("plant", "g-2", "a-1"));
    }
}
