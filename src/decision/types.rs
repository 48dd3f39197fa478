use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::memory::EntityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Condition,
    Action,
    Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Branch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::Exists => "exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    pub target_entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity_id: Option<String>,
    pub property: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: String,
    /// External event whose arrival re-evaluates this condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Executing,
    Done,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Executing => "executing",
            ActionStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target_entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity_id: Option<String>,
    pub action_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emit_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A graph as the model proposes it: no id, project or timestamps yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSuggestion {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl GraphSuggestion {
    pub const PLACEHOLDER_TITLE: &'static str = "Untitled decision";

    pub fn empty() -> Self {
        Self {
            title: Self::PLACEHOLDER_TITLE.to_string(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }
}

/// What a client submits for saving. The id is optional: present means
/// "overwrite this graph", absent means "assign a new one".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: GraphSuggestion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionGraph {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_context: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl DecisionGraph {
    pub fn condition(&self, id: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    /// Store entities the graph points at, in graph order: conditions first,
    /// then actions. Items without a target id reference nothing.
    pub fn entity_references(&self) -> Vec<(EntityKey, ItemRef)> {
        let conditions = self.conditions.iter().filter_map(|c| {
            let id = c.target_entity_id.as_ref()?;
            Some((
                EntityKey::new(&c.target_entity_type, id),
                ItemRef::condition(&c.id),
            ))
        });
        let actions = self.actions.iter().filter_map(|a| {
            let id = a.target_entity_id.as_ref()?;
            Some((
                EntityKey::new(&a.target_entity_type, id),
                ItemRef::action(&a.id),
            ))
        });
        conditions.chain(actions).collect()
    }

    /// Every dangling reference inside the graph. Empty when consistent.
    pub fn validate(&self) -> Vec<GraphWarning> {
        let nodes: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let conditions: HashSet<&str> = self.conditions.iter().map(|c| c.id.as_str()).collect();
        let actions: HashSet<&str> = self.actions.iter().map(|a| a.id.as_str()).collect();
        let mut warnings = Vec::new();

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !nodes.contains(end.as_str()) {
                    warnings.push(GraphWarning::DanglingEdge {
                        edge_id: edge.id.clone(),
                        node_id: end.clone(),
                    });
                }
            }
        }
        for action in &self.actions {
            for pre in &action.preconditions {
                if !conditions.contains(pre.as_str()) {
                    warnings.push(GraphWarning::UnknownPrecondition {
                        action_id: action.id.clone(),
                        condition_id: pre.clone(),
                    });
                }
            }
        }
        for node in &self.nodes {
            if let Some(c) = &node.condition_id {
                if !conditions.contains(c.as_str()) {
                    warnings.push(GraphWarning::UnknownNodeLink {
                        node_id: node.id.clone(),
                        target_id: c.clone(),
                    });
                }
            }
            if let Some(a) = &node.action_id {
                if !actions.contains(a.as_str()) {
                    warnings.push(GraphWarning::UnknownNodeLink {
                        node_id: node.id.clone(),
                        target_id: a.clone(),
                    });
                }
            }
        }
        warnings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Condition,
    Action,
}

/// A condition or action inside one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: String,
}

impl ItemRef {
    pub fn condition(id: &str) -> Self {
        Self {
            kind: ItemKind::Condition,
            id: id.to_string(),
        }
    }

    pub fn action(id: &str) -> Self {
        Self {
            kind: ItemKind::Action,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GraphWarning {
    DanglingEdge { edge_id: String, node_id: String },
    UnknownPrecondition { action_id: String, condition_id: String },
    UnknownNodeLink { node_id: String, target_id: String },
}

impl std::fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphWarning::DanglingEdge { edge_id, node_id } => {
                write!(f, "edge {} points at missing node {}", edge_id, node_id)
            }
            GraphWarning::UnknownPrecondition {
                action_id,
                condition_id,
            } => write!(f, "action {} requires missing condition {}", action_id, condition_id),
            GraphWarning::UnknownNodeLink { node_id, target_id } => {
                write!(f, "node {} links missing item {}", node_id, target_id)
            }
        }
    }
}
