use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::bus::transport::Transport;
use crate::bus::MessageBus;
use crate::context::ContextAdapter;
use crate::core::cortex::LanguageModel;
use crate::decision::{DecisionCompiler, EventPublisher, GraphRepository};
use crate::intent::{FileMappingLoader, IntentRouter, MappingCache};
use crate::memory::KnowledgeStore;
use crate::rules::RuleEngine;
use crate::scenario::{RuleEvaluator, ScenarioService};
use crate::trace::TraceLogger;
use crate::workflow::WorkflowEngine;

pub const SYNAPSE_DIR: &str = ".synapse";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SynapseConfig {
    pub project_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub broker_addr: Option<String>,
    pub primary_model: String,
    pub fallback_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub workflow_url: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(SYNAPSE_DIR)
}

fn default_bind_addr() -> String {
    "127.0.0.1:3030".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            project_name: "default".to_string(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            broker_addr: None,
            primary_model: "gemini-3-flash-preview".to_string(),
            fallback_model: "gemini-2.5-flash".to_string(),
            max_tokens: default_max_tokens(),
            workflow_url: None,
            log_level: default_log_level(),
        }
    }
}

impl SynapseConfig {
    pub fn config_path(dir: &Path) -> PathBuf {
        dir.join("config.toml")
    }

    /// Reads `<dir>/config.toml` without applying overrides. `None` when the
    /// file is absent; a file that exists but does not parse is an error.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = Self::config_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config =
            toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(Some(config))
    }

    /// Defaults for a missing file, then `SYNAPSE_*` overrides from the
    /// process environment.
    pub fn resolve(found: Option<Self>) -> Self {
        found
            .unwrap_or_default()
            .with_env_overrides(|key| env::var(key).ok())
    }

    /// [`SynapseConfig::read`] plus [`SynapseConfig::resolve`], warning when
    /// the defaults are used. Needs a subscriber already installed.
    pub fn load(dir: &Path) -> Result<Self> {
        let found = Self::read(dir)?;
        if found.is_none() {
            warn!(path = %Self::config_path(dir).display(), "no config file, using defaults");
        }
        Ok(Self::resolve(found))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let toml = toml::to_string_pretty(self)?;
        fs::write(Self::config_path(dir), toml)?;
        Ok(())
    }

    /// Applies `SYNAPSE_*` overrides from `lookup`. Empty values are ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("SYNAPSE_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = get("SYNAPSE_BROKER") {
            self.broker_addr = Some(v);
        }
        if let Some(v) = get("SYNAPSE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SYNAPSE_WORKFLOW_URL") {
            self.workflow_url = Some(v);
        }
        if let Some(v) = get("SYNAPSE_LOG") {
            self.log_level = v;
        }
        self
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.data_dir.join("traces")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("cozo")
    }

    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join("rules.json")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }
}

/// Everything the HTTP layer needs, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SynapseConfig>,
    pub bus: Arc<MessageBus>,
    pub tracer: Arc<TraceLogger>,
    pub store: Arc<dyn KnowledgeStore>,
    pub context: Arc<ContextAdapter>,
    pub decisions: Arc<DecisionCompiler>,
    pub scenarios: Arc<ScenarioService>,
    pub mappings: Arc<MappingCache>,
    pub router: Arc<IntentRouter>,
}

/// The external systems the core talks to.
pub struct Collaborators {
    pub store: Arc<dyn KnowledgeStore>,
    pub model: Arc<dyn LanguageModel>,
    pub rules: Arc<dyn RuleEngine>,
    pub workflows: Arc<dyn WorkflowEngine>,
    pub transport: Option<Arc<dyn Transport>>,
}

impl AppState {
    pub fn assemble(config: SynapseConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            model,
            rules,
            workflows,
            transport,
        } = collaborators;
        let config = Arc::new(config);

        let tracer = Arc::new(TraceLogger::new(config.trace_dir()));
        let bus = Arc::new(MessageBus::new(Arc::clone(&tracer), transport));
        let events: Arc<dyn EventPublisher> = bus.clone();
        let graphs = Arc::new(GraphRepository::new(Arc::clone(&store), events));

        let context = Arc::new(ContextAdapter::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&graphs),
        ));
        let decisions = Arc::new(DecisionCompiler::new(
            Arc::clone(&graphs),
            model,
            rules,
            config.max_tokens,
        ));
        let scenarios = Arc::new(ScenarioService::new(graphs, Arc::new(RuleEvaluator)));
        let mappings = Arc::new(MappingCache::new(Arc::new(FileMappingLoader::new(
            config.projects_dir(),
        ))));
        let router = Arc::new(IntentRouter::new(&bus, Arc::clone(&mappings), workflows));

        Self {
            config,
            bus,
            tracer,
            store,
            context,
            decisions,
            scenarios,
            mappings,
            router,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_uses_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let config = SynapseConfig::load(dir.path())?;
        assert_eq!(config.bind_addr, default_bind_addr());
        assert_eq!(config.max_tokens, 8192);
        Ok(())
    }

    #[test]
    fn test_read_reports_missing_file() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(SynapseConfig::read(dir.path())?.is_none());

        SynapseConfig::default().save(dir.path())?;
        assert_eq!(SynapseConfig::read(dir.path())?, Some(SynapseConfig::default()));
        Ok(())
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let dir = TempDir::new()?;
        let config = SynapseConfig {
            project_name: "plant".to_string(),
            broker_addr: Some("127.0.0.1:7000".to_string()),
            ..SynapseConfig::default()
        };
        config.save(dir.path())?;

        let raw = fs::read_to_string(SynapseConfig::config_path(dir.path()))?;
        let loaded: SynapseConfig = toml::from_str(&raw)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_partial_file_fills_defaults() -> Result<()> {
        let raw = r#"
            project_name = "plant"
            primary_model = "m1"
            fallback_model = "m2"
        "#;
        let config: SynapseConfig = toml::from_str(raw)?;
        assert_eq!(config.project_name, "plant");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.data_dir, PathBuf::from(SYNAPSE_DIR));
        Ok(())
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SYNAPSE_BIND", "0.0.0.0:9000"),
            ("SYNAPSE_BROKER", "10.0.0.1:7000"),
            ("SYNAPSE_DATA_DIR", "/var/lib/synapse"),
            ("SYNAPSE_LOG", "  "),
        ]);
        let config = SynapseConfig::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.broker_addr.as_deref(), Some("10.0.0.1:7000"));
        assert_eq!(config.rules_path(), PathBuf::from("/var/lib/synapse/rules.json"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.projects_dir(), PathBuf::from("/var/lib/synapse/projects"));
    }
}
