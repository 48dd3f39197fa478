//! Client side of the external workflow state machine.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::bus::CorrelationId;
use crate::core::fs::path_segment;

/// A named event sent to one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub project: String,
    pub workflow_id: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub correlation_id: CorrelationId,
    /// Ask the engine to ignore the event if the current state has no
    /// transition for it, instead of failing.
    #[serde(default)]
    pub ignore_invalid: bool,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn send_event(&self, event: WorkflowEvent) -> Result<()>;
}

/// Posts events to `<base>/workflows/<project>/<workflowId>/events`.
pub struct HttpWorkflowEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkflowEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, project: &str, workflow_id: &str) -> String {
        format!(
            "{}/workflows/{}/{}/events",
            self.base_url,
            path_segment(project),
            path_segment(workflow_id)
        )
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn send_event(&self, event: WorkflowEvent) -> Result<()> {
        let url = self.endpoint(&event.project, &event.workflow_id);
        let res = self.client.post(&url).json(&event).send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!(
                "workflow {} rejected event {}: {} {}",
                event.workflow_id,
                event.event,
                status,
                body
            ));
        }
        debug!(
            workflow_id = %event.workflow_id,
            event = %event.event,
            correlation_id = %event.correlation_id,
            "workflow event delivered"
        );
        Ok(())
    }
}

/// Used when no workflow engine is configured.
pub struct NoopWorkflowEngine;

#[async_trait]
impl WorkflowEngine for NoopWorkflowEngine {
    async fn send_event(&self, event: WorkflowEvent) -> Result<()> {
        info!(
            workflow_id = %event.workflow_id,
            event = %event.event,
            correlation_id = %event.correlation_id,
            "no workflow engine configured, event dropped"
        );
        Ok(())
    }
}
