//! Decision graphs: derivation from chat, persistence, rule compilation.
//!
//! Lifecycle: derived (in memory) -> saved -> deployed -> deleted.

pub mod compiler;
pub mod export;
pub mod ontology;
pub mod parser;
pub mod repository;
pub mod types;

pub use compiler::{DecisionCompiler, DeployOutcome, DeriveRequest, DeriveResponse};
pub use repository::GraphRepository;

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::{BusMessage, DssUpdate, Envelope, MessageBus, Payload};
use types::ActionStatus;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("decision graph {graph_id} not found")]
    NotFound { graph_id: String },
    #[error("action {action_id} not found in decision graph {graph_id}")]
    ActionNotFound { graph_id: String, action_id: String },
    #[error("language model failed: {0}")]
    Model(#[source] anyhow::Error),
    #[error("knowledge store failed: {0}")]
    Store(#[from] anyhow::Error),
    #[error("rule engine failed: {0}")]
    RuleEngine(#[source] anyhow::Error),
}

/// Fire-and-forget notifications for operator-facing consumers.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn action_status_changed(
        &self,
        project: &str,
        graph_id: &str,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<()>;
}

#[async_trait]
impl EventPublisher for MessageBus {
    async fn action_status_changed(
        &self,
        project: &str,
        graph_id: &str,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<()> {
        let message = BusMessage::new(
            Envelope::mint(project),
            Payload::DssUpdate {
                update: DssUpdate::UpdateActionStatus {
                    graph_id: graph_id.to_string(),
                    action_id: action_id.to_string(),
                    status: status.as_str().to_string(),
                },
            },
        );
        self.publish(message).await?;
        Ok(())
    }
}
