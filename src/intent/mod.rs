//! Per-project mapping of intents onto workflow events.
//!
//! Mappings live in `<projects>/<project>/intents.toml`:
//!
//! ```toml
//! [[mapping]]
//! intent_type = "maintenance_required"
//! workflow_id = "maintenance"
//! event = "OPEN_TICKET"
//! forward_context = true
//! urgency = ["high", "critical"]
//! ```

pub mod router;

pub use router::IntentRouter;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::Urgency;
use crate::core::fs::project_dir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMapping {
    pub intent_type: String,
    pub workflow_id: String,
    pub event: String,
    #[serde(default)]
    pub forward_context: bool,
    /// Allow-list; absent means any urgency.
    #[serde(default)]
    pub urgency: Option<Vec<Urgency>>,
}

impl IntentMapping {
    /// An intent without urgency passes every filter.
    pub fn matches(&self, intent_type: &str, urgency: Option<Urgency>) -> bool {
        if self.intent_type != intent_type {
            return false;
        }
        match (&self.urgency, urgency) {
            (Some(allowed), Some(u)) => allowed.contains(&u),
            _ => true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub mapping: Vec<IntentMapping>,
}

#[async_trait]
pub trait MappingLoader: Send + Sync {
    /// `None` when the project has no mapping configuration at all.
    async fn load(&self, project: &str) -> Result<Option<Vec<IntentMapping>>>;
}

pub struct FileMappingLoader {
    root: PathBuf,
}

impl FileMappingLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, project: &str) -> PathBuf {
        project_dir(&self.root, project).join("intents.toml")
    }
}

#[async_trait]
impl MappingLoader for FileMappingLoader {
    async fn load(&self, project: &str) -> Result<Option<Vec<IntentMapping>>> {
        let path = self.path_for(project);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: MappingFile =
            toml::from_str(&raw).with_context(|| format!("Invalid mappings {}", path.display()))?;
        Ok(Some(file.mapping))
    }
}

/// `project -> parsed mappings`, filled on first use.
///
/// Missing configuration is not cached, so a file created later is picked up
/// without an explicit invalidation.
pub struct MappingCache {
    loader: Arc<dyn MappingLoader>,
    entries: RwLock<HashMap<String, Arc<Vec<IntentMapping>>>>,
}

impl MappingCache {
    pub fn new(loader: Arc<dyn MappingLoader>) -> Self {
        Self {
            loader,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_load(&self, project: &str) -> Result<Option<Arc<Vec<IntentMapping>>>> {
        if let Some(hit) = self.entries.read().await.get(project) {
            return Ok(Some(Arc::clone(hit)));
        }

        let Some(mappings) = self.loader.load(project).await? else {
            return Ok(None);
        };
        let mappings = Arc::new(mappings);
        debug!(project, count = mappings.len(), "intent mappings loaded");
        self.entries
            .write()
            .await
            .insert(project.to_string(), Arc::clone(&mappings));
        Ok(Some(mappings))
    }

    /// Returns whether an entry was dropped.
    pub async fn invalidate(&self, project: &str) -> bool {
        self.entries.write().await.remove(project).is_some()
    }

    pub async fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }
}
