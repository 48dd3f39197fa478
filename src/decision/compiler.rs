use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::export::{engine_rules, export_rules, RuleDescriptor};
use super::ontology::{entity_map, graph_view, EntityMap, GraphView};
use super::parser::{parse_reply, END_MARKER, START_MARKER};
use super::repository::{GraphRepository, SavedGraph};
use super::types::{Action, ActionStatus, DecisionGraph, GraphDraft, GraphSuggestion, GraphSummary};
use super::DecisionError;
use crate::context::adapter::ontology_summary;
use crate::core::cortex::{ChatMessage, LanguageModel};
use crate::rules::RuleEngine;

/// Instances per ontology type included in the derive prompt.
pub const SNAPSHOT_PER_TYPE: usize = 10;

const DERIVE_INSTRUCTIONS: &str = r#"You help an operator turn a described situation into a decision graph.

Answer in two parts:
1. A short conversational reply (a few sentences) explaining the proposal.
2. Exactly one machine-readable block, delimited by the markers below, containing a JSON object with this shape:
   {"title": str, "description": str,
    "nodes": [{"id", "type": "trigger|condition|action|outcome", "label", "description", "entityType"?, "entityId"?, "conditionId"?, "actionId"?}],
    "edges": [{"id", "source", "target", "label"?, "condition"?: "true|false"}],
    "conditions": [{"id", "targetEntityType", "targetEntityId"?, "property", "operator": "eq|neq|gt|lt|gte|lte|contains|exists", "value"?, "description", "eventName"?}],
    "actions": [{"id", "name", "description", "targetEntityType", "targetEntityId"?, "actionType", "parameters": {str: str}, "preconditions": [conditionId], "status": "pending", "emitEvent"?, "prompt"?}]}

Rules:
- Only reference entities that appear in the ontology snapshot, unless the operator names a new one.
- Every edge endpoint must be a node id; every precondition must be a condition id.
- Emit nothing after the end marker."#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeriveRequest {
    pub project: String,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    pub user_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeriveResponse {
    pub suggestion: GraphSuggestion,
    pub assistant_reply: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub rule_count: usize,
    pub rule_ids: Vec<String>,
}

/// Derive, persist, compile and deploy decision graphs.
pub struct DecisionCompiler {
    graphs: Arc<GraphRepository>,
    model: Arc<dyn LanguageModel>,
    rules: Arc<dyn RuleEngine>,
    max_tokens: u32,
}

impl DecisionCompiler {
    pub fn new(
        graphs: Arc<GraphRepository>,
        model: Arc<dyn LanguageModel>,
        rules: Arc<dyn RuleEngine>,
        max_tokens: u32,
    ) -> Self {
        Self {
            graphs,
            model,
            rules,
            max_tokens,
        }
    }

    pub fn graphs(&self) -> &Arc<GraphRepository> {
        &self.graphs
    }

    fn system_prompt(snapshot: &str) -> String {
        format!(
            "{}\n\nStart marker: {}\nEnd marker: {}\n\n{}",
            DERIVE_INSTRUCTIONS, START_MARKER, END_MARKER, snapshot
        )
    }

    /// Asks the model for a graph. Malformed or missing structured output
    /// yields an empty suggestion and the raw reply, never an error.
    pub async fn derive(&self, request: DeriveRequest) -> Result<DeriveResponse, DecisionError> {
        let project = request.project.as_str();
        let snapshot = match ontology_summary(
            self.graphs.store().as_ref(),
            &self.graphs,
            project,
            Some(SNAPSHOT_PER_TYPE),
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(project, error = %e, "ontology snapshot unavailable");
                format!("# Ontology: {}\n(unavailable)\n", project)
            }
        };

        let mut messages = request.chat_history;
        messages.push(ChatMessage::user(request.user_message));

        let raw = self
            .model
            .complete(&Self::system_prompt(&snapshot), &messages, self.max_tokens)
            .await
            .map_err(DecisionError::Model)?;

        match parse_reply(&raw) {
            Ok(parsed) => {
                info!(
                    project,
                    conditions = parsed.suggestion.conditions.len(),
                    actions = parsed.suggestion.actions.len(),
                    "decision graph derived"
                );
                Ok(DeriveResponse {
                    suggestion: parsed.suggestion,
                    assistant_reply: parsed.reply,
                })
            }
            Err(failure) => {
                warn!(project, reason = %failure, "model reply had no usable graph");
                Ok(DeriveResponse {
                    suggestion: GraphSuggestion::empty(),
                    assistant_reply: raw,
                })
            }
        }
    }

    pub async fn save(&self, project: &str, draft: GraphDraft) -> Result<SavedGraph, DecisionError> {
        self.graphs.save(project, draft).await
    }

    pub async fn load(&self, project: &str, graph_id: &str) -> Result<Option<DecisionGraph>, DecisionError> {
        self.graphs.load(project, graph_id).await
    }

    pub async fn list(&self, project: &str) -> Result<Vec<GraphSummary>, DecisionError> {
        self.graphs.list(project).await
    }

    pub async fn delete(&self, project: &str, graph_id: &str) -> Result<bool, DecisionError> {
        self.graphs.delete(project, graph_id).await
    }

    pub async fn update_action_status(
        &self,
        project: &str,
        graph_id: &str,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<Action, DecisionError> {
        self.graphs
            .update_action_status(project, graph_id, action_id, status)
            .await
    }

    pub async fn export_rules(&self, project: &str, graph_id: &str) -> Result<Vec<RuleDescriptor>, DecisionError> {
        let graph = self.graphs.require(project, graph_id).await?;
        Ok(export_rules(&graph))
    }

    /// Registers one rule per action and flushes the rule set once. Only a
    /// saved graph can be deployed.
    pub async fn deploy_rules(&self, project: &str, graph_id: &str) -> Result<DeployOutcome, DecisionError> {
        let graph = self.graphs.require(project, graph_id).await?;

        let mut rule_ids = Vec::new();
        for rule in engine_rules(&graph) {
            let id = rule.id.clone();
            self.rules.register(rule).await.map_err(DecisionError::RuleEngine)?;
            rule_ids.push(id);
        }
        self.rules.save().await.map_err(DecisionError::RuleEngine)?;

        info!(project, graph_id, rules = rule_ids.len(), "decision graph deployed");
        Ok(DeployOutcome {
            rule_count: rule_ids.len(),
            rule_ids,
        })
    }

    pub async fn entity_map(&self, project: &str) -> Result<EntityMap, DecisionError> {
        Ok(entity_map(self.graphs.store().as_ref(), &self.graphs, project).await?)
    }

    pub async fn graph_view(&self, project: &str) -> Result<GraphView, DecisionError> {
        Ok(graph_view(self.graphs.store().as_ref(), &self.graphs, project).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::fixtures::pressure_graph;
    use crate::decision::EventPublisher;
    use crate::memory::{Entity, GraphStore, KnowledgeStore};
    use crate::rules::{EngineRule, FileRuleEngine};
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct ScriptedModel {
        reply: String,
        prompts: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    impl ScriptedModel {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, system: &str, messages: &[ChatMessage], _max_tokens: u32) -> Result<String> {
            self.prompts
                .lock()
                .await
                .push((system.to_string(), messages.to_vec()));
            Ok(self.reply.clone())
        }
    }

    struct DownModel;

    #[async_trait]
    impl LanguageModel for DownModel {
        async fn complete(&self, _: &str, _: &[ChatMessage], _: u32) -> Result<String> {
            anyhow::bail!("quota exceeded")
        }
    }

    struct Silent;

    #[async_trait]
    impl EventPublisher for Silent {
        async fn action_status_changed(&self, _: &str, _: &str, _: &str, _: ActionStatus) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        compiler: DecisionCompiler,
        rules: Arc<FileRuleEngine>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(model: Arc<dyn LanguageModel>) -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let store: Arc<dyn KnowledgeStore> = Arc::new(GraphStore::in_memory()?);
        let graphs = Arc::new(GraphRepository::new(store, Arc::new(Silent)));
        let rules = Arc::new(FileRuleEngine::open(&dir.path().join("rules.json")).await?);
        Ok(Fixture {
            compiler: DecisionCompiler::new(graphs, model, rules.clone(), 1024),
            rules,
            _dir: dir,
        })
    }

    fn draft(graph: &DecisionGraph) -> GraphDraft {
        GraphDraft {
            id: Some(graph.id.clone()),
            body: GraphSuggestion {
                title: graph.title.clone(),
                description: graph.description.clone(),
                nodes: graph.nodes.clone(),
                edges: graph.edges.clone(),
                conditions: graph.conditions.clone(),
                actions: graph.actions.clone(),
            },
            chat_context: None,
        }
    }

    #[tokio::test]
    async fn test_derive_without_marker_returns_empty_suggestion() -> Result<()> {
        let text = "I need more detail about the pump before proposing anything.";
        let fx = fixture(ScriptedModel::new(text)).await?;

        let out = fx
            .compiler
            .derive(DeriveRequest {
                project: "plant".to_string(),
                chat_history: Vec::new(),
                user_message: "What if pressure spikes?".to_string(),
            })
            .await?;
        assert!(out.suggestion.conditions.is_empty());
        assert!(out.suggestion.actions.is_empty());
        assert_eq!(out.suggestion.title, GraphSuggestion::PLACEHOLDER_TITLE);
        assert_eq!(out.assistant_reply, text);
        Ok(())
    }

    #[tokio::test]
    async fn test_derive_parses_block_and_sends_snapshot() -> Result<()> {
        let graph = pressure_graph("plant", "g-1");
        let body = serde_json::to_string(&draft(&graph).body)?;
        let reply = format!("Vent on high pressure.\n{}{}{}", START_MARKER, body, END_MARKER);
        let model = ScriptedModel::new(&reply);
        let fx = fixture(model.clone()).await?;

        fx.compiler
            .graphs()
            .store()
            .upsert_entity("plant", &Entity::new("Sensor", "pressure").with_property("unit", "bar"))
            .await?;
        fx.compiler.save("plant", draft(&graph)).await?;

        let out = fx
            .compiler
            .derive(DeriveRequest {
                project: "plant".to_string(),
                chat_history: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
                user_message: "Vent when pressure exceeds 150".to_string(),
            })
            .await?;
        assert_eq!(out.assistant_reply, "Vent on high pressure.\n");
        assert_eq!(out.suggestion.conditions, graph.conditions);

        let prompts = model.prompts.lock().await;
        let (system, messages) = &prompts[0];
        assert!(system.contains(START_MARKER));
        assert!(system.contains("- pressure: unit=bar"));
        assert!(system.contains("High pressure response"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "Vent when pressure exceeds 150");
        Ok(())
    }

    #[tokio::test]
    async fn test_derive_surfaces_model_failure() -> Result<()> {
        let fx = fixture(Arc::new(DownModel)).await?;
        let err = fx
            .compiler
            .derive(DeriveRequest {
                project: "plant".to_string(),
                chat_history: Vec::new(),
                user_message: "hello".to_string(),
            })
            .await;
        assert!(matches!(err, Err(DecisionError::Model(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_requires_saved_graph_and_is_idempotent() -> Result<()> {
        let fx = fixture(ScriptedModel::new("")).await?;
        assert!(matches!(
            fx.compiler.deploy_rules("plant", "g-1").await,
            Err(DecisionError::NotFound { .. })
        ));

        fx.compiler.save("plant", draft(&pressure_graph("plant", "g-1"))).await?;
        let first = fx.compiler.deploy_rules("plant", "g-1").await?;
        let second = fx.compiler.deploy_rules("plant", "g-1").await?;
        assert_eq!(first.rule_count, 1);
        assert_eq!(first, second);

        let rules: Vec<EngineRule> = fx.rules.rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].trigger_event, "sensor.pressure");
        assert_eq!(rules[0].source, "decision-graph:g-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_export_of_saved_graph_is_stable() -> Result<()> {
        let fx = fixture(ScriptedModel::new("")).await?;
        fx.compiler.save("plant", draft(&pressure_graph("plant", "g-1"))).await?;

        let first = serde_json::to_vec(&fx.compiler.export_rules("plant", "g-1").await?)?;
        let second = serde_json::to_vec(&fx.compiler.export_rules("plant", "g-1").await?)?;
        assert_eq!(first, second);
        Ok(())
    }
}
