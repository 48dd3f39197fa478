//! Scenario testing: hydrate a saved graph, then evaluate it against
//! operator-edited properties as a stream of events.

pub mod evaluator;
pub mod hydrator;

pub use evaluator::{Overrides, RuleEvaluator, ScenarioEvaluator, ScenarioEvent};
pub use hydrator::{hydrate, HydratedEntity};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::decision::{DecisionError, GraphRepository};

const EVENT_BUFFER: usize = 32;

pub struct ScenarioService {
    graphs: Arc<GraphRepository>,
    evaluator: Arc<dyn ScenarioEvaluator>,
}

impl ScenarioService {
    pub fn new(graphs: Arc<GraphRepository>, evaluator: Arc<dyn ScenarioEvaluator>) -> Self {
        Self { graphs, evaluator }
    }

    pub async fn hydrate(
        &self,
        project: &str,
        graph_id: &str,
    ) -> Result<Vec<HydratedEntity>, DecisionError> {
        let graph = self.graphs.require(project, graph_id).await?;
        Ok(hydrate(self.graphs.store().as_ref(), project, &graph).await?)
    }

    /// Runs the evaluation on its own task. The stream ends after a
    /// `complete` or `error` event; dropping the receiver stops the run.
    pub fn test_scenario(
        &self,
        project: &str,
        graph_id: &str,
        overrides: Overrides,
    ) -> mpsc::Receiver<ScenarioEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let graphs = Arc::clone(&self.graphs);
        let evaluator = Arc::clone(&self.evaluator);
        let project = project.to_string();
        let graph_id = graph_id.to_string();

        tokio::spawn(async move {
            let run = async {
                let graph = graphs.require(&project, &graph_id).await?;
                let entities = hydrate(graphs.store().as_ref(), &project, &graph).await?;
                evaluator.evaluate(&graph, &entities, &overrides, &tx).await
            };
            match run.await {
                Ok(()) => info!(project = %project, graph_id = %graph_id, "scenario evaluated"),
                Err(e) => {
                    warn!(project = %project, graph_id = %graph_id, error = %e, "scenario evaluation failed");
                    let _ = tx
                        .send(ScenarioEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
        rx
    }
}
