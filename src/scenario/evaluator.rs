use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

use super::hydrator::HydratedEntity;
use crate::decision::types::{Condition, DecisionGraph, Operator};

/// Operator-edited properties, keyed by entity id.
pub type Overrides = HashMap<String, Map<String, Value>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ScenarioEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        graph_id: String,
        conditions: usize,
        actions: usize,
    },
    #[serde(rename_all = "camelCase")]
    Condition {
        condition_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
        property: String,
        operator: Operator,
        expected: Option<Value>,
        actual: Option<Value>,
        passed: bool,
    },
    #[serde(rename_all = "camelCase")]
    Action {
        action_id: String,
        name: String,
        fired: bool,
        /// Preconditions that did not hold.
        unmet: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Complete { fired: Vec<String> },
    Error { message: String },
}

impl ScenarioEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ScenarioEvent::Started { .. } => "started",
            ScenarioEvent::Condition { .. } => "condition",
            ScenarioEvent::Action { .. } => "action",
            ScenarioEvent::Complete { .. } => "complete",
            ScenarioEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioEvent::Complete { .. } | ScenarioEvent::Error { .. })
    }
}

/// Streams evaluation steps into `events`. Returning early because the
/// receiver went away is not an error.
#[async_trait]
pub trait ScenarioEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        graph: &DecisionGraph,
        entities: &[HydratedEntity],
        overrides: &Overrides,
        events: &mpsc::Sender<ScenarioEvent>,
    ) -> Result<()>;
}

/// Conditions against hydrated properties with overrides on top; an action
/// fires when every precondition holds.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    fn lookup(
        condition: &Condition,
        entities: &[HydratedEntity],
        overrides: &Overrides,
    ) -> Option<Value> {
        let entity_id = condition.target_entity_id.as_deref()?;
        if let Some(v) = overrides
            .get(entity_id)
            .and_then(|props| props.get(&condition.property))
        {
            return Some(v.clone());
        }
        entities
            .iter()
            .find(|e| e.entity_type == condition.target_entity_type && e.entity_id == entity_id)
            .and_then(|e| e.properties.get(&condition.property))
            .cloned()
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a == b;
    }
    match (actual, expected) {
        (Value::String(a), Value::Bool(b)) | (Value::Bool(b), Value::String(a)) => {
            a.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => actual == expected,
    }
}

/// `false` whenever the actual value is absent, `neq` included.
pub fn compare(operator: Operator, actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let Some(actual) = actual.filter(|v| !v.is_null()) else {
        return false;
    };
    if operator == Operator::Exists {
        return true;
    }
    let Some(expected) = expected else {
        return false;
    };

    let ordered = |check: fn(f64, f64) -> bool| match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => check(a, b),
        _ => false,
    };

    match operator {
        Operator::Eq => loosely_equal(actual, expected),
        Operator::Neq => !loosely_equal(actual, expected),
        Operator::Gt => ordered(|a, b| a > b),
        Operator::Lt => ordered(|a, b| a < b),
        Operator::Gte => ordered(|a, b| a >= b),
        Operator::Lte => ordered(|a, b| a <= b),
        Operator::Contains => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| loosely_equal(i, needle)),
            _ => false,
        },
        Operator::Exists => true,
    }
}

#[async_trait]
impl ScenarioEvaluator for RuleEvaluator {
    async fn evaluate(
        &self,
        graph: &DecisionGraph,
        entities: &[HydratedEntity],
        overrides: &Overrides,
        events: &mpsc::Sender<ScenarioEvent>,
    ) -> Result<()> {
        macro_rules! emit {
            ($event:expr) => {
                if events.send($event).await.is_err() {
                    return Ok(());
                }
            };
        }

        emit!(ScenarioEvent::Started {
            graph_id: graph.id.clone(),
            conditions: graph.conditions.len(),
            actions: graph.actions.len(),
        });

        let mut passed = HashSet::new();
        for condition in &graph.conditions {
            let actual = Self::lookup(condition, entities, overrides);
            let ok = compare(condition.operator, actual.as_ref(), condition.value.as_ref());
            if ok {
                passed.insert(condition.id.as_str());
            }
            emit!(ScenarioEvent::Condition {
                condition_id: condition.id.clone(),
                entity_id: condition.target_entity_id.clone(),
                property: condition.property.clone(),
                operator: condition.operator,
                expected: condition.value.clone(),
                actual,
                passed: ok,
            });
        }

        let mut fired = Vec::new();
        for action in &graph.actions {
            let unmet: Vec<String> = action
                .preconditions
                .iter()
                .filter(|id| !passed.contains(id.as_str()))
                .cloned()
                .collect();
            let fires = unmet.is_empty();
            if fires {
                fired.push(action.id.clone());
            }
            emit!(ScenarioEvent::Action {
                action_id: action.id.clone(),
                name: action.name.clone(),
                fired: fires,
                unmet,
            });
        }

        emit!(ScenarioEvent::Complete { fired });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::fixtures::pressure_graph;
    use crate::decision::types::ItemRef;
    use serde_json::json;

    fn sensor(value: Value) -> HydratedEntity {
        let mut properties = Map::new();
        properties.insert("value".to_string(), value);
        HydratedEntity {
            entity_type: "Sensor".to_string(),
            entity_id: "pressure".to_string(),
            properties,
            exists: true,
            referenced_by: vec![ItemRef::condition("c-1")],
        }
    }

    async fn run(entities: &[HydratedEntity], overrides: &Overrides) -> Result<Vec<ScenarioEvent>> {
        let graph = pressure_graph("plant", "g-1");
        let (tx, mut rx) = mpsc::channel(16);
        RuleEvaluator.evaluate(&graph, entities, overrides, &tx).await?;
        drop(tx);
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        Ok(out)
    }

    #[test]
    fn test_compare_operators() {
        let v = |x: Value| Some(x);
        assert!(compare(Operator::Gt, v(json!(151)).as_ref(), v(json!(150)).as_ref()));
        assert!(compare(Operator::Gt, v(json!("151.5")).as_ref(), v(json!(150)).as_ref()));
        assert!(!compare(Operator::Gt, v(json!("high")).as_ref(), v(json!(150)).as_ref()));
        assert!(compare(Operator::Lte, v(json!(150)).as_ref(), v(json!("150")).as_ref()));
        assert!(compare(Operator::Eq, v(json!("open")).as_ref(), v(json!("open")).as_ref()));
        assert!(compare(Operator::Eq, v(json!("true")).as_ref(), v(json!(true)).as_ref()));
        assert!(compare(Operator::Neq, v(json!(1)).as_ref(), v(json!(2)).as_ref()));
        assert!(compare(Operator::Contains, v(json!("overheat alarm")).as_ref(), v(json!("alarm")).as_ref()));
        assert!(compare(Operator::Contains, v(json!(["a", "b"])).as_ref(), v(json!("b")).as_ref()));
        assert!(compare(Operator::Exists, v(json!(0)).as_ref(), None));
        assert!(!compare(Operator::Exists, v(Value::Null).as_ref(), None));
        assert!(!compare(Operator::Neq, None, v(json!(2)).as_ref()));
    }

    #[tokio::test]
    async fn test_events_follow_graph_order() -> Result<()> {
        let events = run(&[sensor(json!(160))], &Overrides::new()).await?;
        let names: Vec<_> = events.iter().map(ScenarioEvent::event_name).collect();
        assert_eq!(names, ["started", "condition", "action", "complete"]);
        assert_eq!(
            events[3],
            ScenarioEvent::Complete {
                fired: vec!["a-1".to_string()]
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_override_wins_over_store() -> Result<()> {
        let mut overrides = Overrides::new();
        overrides.insert(
            "pressure".to_string(),
            Map::from_iter([("value".to_string(), json!(100))]),
        );
        let events = run(&[sensor(json!(160))], &overrides).await?;
        match &events[2] {
            ScenarioEvent::Action { fired, unmet, .. } => {
                assert!(!fired);
                assert_eq!(unmet, &vec!["c-1".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_event_wire_shape() -> Result<()> {
        let event = ScenarioEvent::Error {
            message: "boom".to_string(),
        };
        assert_eq!(serde_json::to_value(&event)?, json!({"event": "error", "message": "boom"}));
        Ok(())
    }
}
