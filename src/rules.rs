//! External event-processing rule engine.
//!
//! The engine only needs two operations from us: register a rule and flush
//! the rule set. [`FileRuleEngine`] keeps the set in memory and writes it to
//! a single JSON file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Prompt { prompt: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_event: String,
    pub actions: Vec<RuleAction>,
    pub enabled: bool,
    /// Where the rule came from, e.g. `decision-graph:<graphId>`.
    #[serde(default)]
    pub source: String,
}

#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Adds `rule`, replacing any rule with the same id.
    async fn register(&self, rule: EngineRule) -> Result<()>;
    async fn save(&self) -> Result<()>;
}

pub struct FileRuleEngine {
    path: PathBuf,
    rules: Mutex<Vec<EngineRule>>,
}

impl FileRuleEngine {
    /// Loads the existing rule set at `path`, if any.
    pub async fn open(path: &Path) -> Result<Self> {
        let rules = if fs::try_exists(path).await? {
            let raw = fs::read_to_string(path).await?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid rule set {}", path.display()))?
        } else {
            Vec::new()
        };
        info!(path = %path.display(), "rule set loaded");
        Ok(Self {
            path: path.to_path_buf(),
            rules: Mutex::new(rules),
        })
    }

    pub async fn rules(&self) -> Vec<EngineRule> {
        self.rules.lock().await.clone()
    }
}

#[async_trait]
impl RuleEngine for FileRuleEngine {
    async fn register(&self, rule: EngineRule) -> Result<()> {
        let mut rules = self.rules.lock().await;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                debug!(rule_id = %rule.id, "rule replaced");
                *existing = rule;
            }
            None => {
                debug!(rule_id = %rule.id, "rule added");
                rules.push(rule);
            }
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let json = {
            let rules = self.rules.lock().await;
            serde_json::to_string_pretty(&*rules)?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(id: &str, enabled: bool) -> EngineRule {
        EngineRule {
            id: id.to_string(),
            name: "vent".to_string(),
            description: String::new(),
            trigger_event: "pressure.high".to_string(),
            actions: vec![RuleAction::Prompt {
                prompt: "open the valve".to_string(),
            }],
            enabled,
            source: "decision-graph:g-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_upserts_and_save_persists() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("rules.json");

        let engine = FileRuleEngine::open(&path).await?;
        engine.register(rule("r-1", false)).await?;
        engine.register(rule("r-1", true)).await?;
        engine.register(rule("r-2", false)).await?;
        engine.save().await?;

        let reopened = FileRuleEngine::open(&path).await?;
        let rules = reopened.rules().await;
        assert_eq!(rules.len(), 2);
        assert!(rules[0].enabled);

        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.contains("\"triggerEvent\": \"pressure.high\""));
        assert!(raw.contains("\"type\": \"prompt\""));
        Ok(())
    }
}
