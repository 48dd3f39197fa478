//! REST + SSE surface for operators and the UI.
//!
//! `/decision-support/*` drives the graph lifecycle, `/agent-bus/*` exposes
//! ingestion and the trace log, `/context/*` the entity context reads.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::{BusError, BusMessage, CorrelationId, Envelope, Payload, RawEvent, Urgency};
use crate::context::format_entity_context;
use crate::core::state::AppState;
use crate::decision::types::{ActionStatus, GraphDraft};
use crate::decision::{DecisionError, DeriveRequest};
use crate::scenario::{Overrides, ScenarioEvent};
use crate::trace::Service;

const DEFAULT_LIMIT: usize = 50;

// --- Errors ---

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DecisionError> for ApiError {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::NotFound { .. } | DecisionError::ActionNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            DecisionError::Model(_) => ApiError::Upstream(e.to_string()),
            DecisionError::Store(_) | DecisionError::RuleEngine(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// --- Request/Response Types ---

#[derive(Debug, Deserialize)]
pub struct SaveGraphRequest {
    pub project: String,
    pub graph: GraphDraft,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: ActionStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRequest {
    #[serde(default)]
    pub edited_properties: Overrides,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub intent_type: String,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub source_event: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub correlation_id: CorrelationId,
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQuery {
    pub format: Option<String>,
    pub correlation_id: Option<String>,
}

// --- Decision support ---

async fn derive_graph(
    State(state): State<AppState>,
    Json(request): Json<DeriveRequest>,
) -> ApiResult<Value> {
    let outcome = state.decisions.derive(request).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))?))
}

async fn save_graph(
    State(state): State<AppState>,
    Json(request): Json<SaveGraphRequest>,
) -> ApiResult<Value> {
    let saved = state.decisions.save(&request.project, request.graph).await?;
    Ok(Json(json!({ "id": saved.id, "warnings": saved.warnings })))
}

async fn list_graphs(State(state): State<AppState>, Path(project): Path<String>) -> ApiResult<Value> {
    let graphs = state.decisions.list(&project).await?;
    Ok(Json(json!(graphs)))
}

async fn get_graph(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    match state.decisions.load(&project, &graph_id).await? {
        Some(graph) => Ok(Json(json!(graph))),
        None => Err(ApiError::NotFound(format!("decision graph {} not found", graph_id))),
    }
}

async fn delete_graph(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let deleted = state.decisions.delete(&project, &graph_id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn export_rules(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let rules = state.decisions.export_rules(&project, &graph_id).await?;
    Ok(Json(json!(rules)))
}

async fn deploy_rules(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let outcome = state.decisions.deploy_rules(&project, &graph_id).await?;
    Ok(Json(json!(outcome)))
}

async fn update_action_status(
    State(state): State<AppState>,
    Path((project, graph_id, action_id)): Path<(String, String, String)>,
    Json(request): Json<StatusRequest>,
) -> ApiResult<Value> {
    let action = state
        .decisions
        .update_action_status(&project, &graph_id, &action_id, request.status)
        .await?;
    Ok(Json(json!(action)))
}

async fn hydrate_graph(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let entities = state.scenarios.hydrate(&project, &graph_id).await?;
    Ok(Json(json!(entities)))
}

fn sse_frame(event: &ScenarioEvent) -> Event {
    match Event::default().event(event.event_name()).json_data(event) {
        Ok(frame) => frame,
        Err(e) => Event::default()
            .event("error")
            .data(json!({ "event": "error", "message": e.to_string() }).to_string()),
    }
}

async fn test_scenario(
    State(state): State<AppState>,
    Path((project, graph_id)): Path<(String, String)>,
    body: Option<Json<ScenarioRequest>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let overrides = body.map(|Json(r)| r.edited_properties).unwrap_or_default();
    let mut events = state.scenarios.test_scenario(&project, &graph_id, overrides);

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            yield Ok(sse_frame(&event));
            if terminal {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn entity_map(State(state): State<AppState>, Path(project): Path<String>) -> ApiResult<Value> {
    let map = state.decisions.entity_map(&project).await?;
    Ok(Json(json!(map)))
}

async fn graph_view(State(state): State<AppState>, Path(project): Path<String>) -> ApiResult<Value> {
    let view = state.decisions.graph_view(&project).await?;
    Ok(Json(json!(view)))
}

// --- Agent bus ---

async fn publish(state: &AppState, message: BusMessage) -> ApiResult<Accepted> {
    let accepted = Accepted {
        correlation_id: message.correlation_id().clone(),
        topic: message.topic(),
    };
    state.bus.publish(message).await?;
    Ok(Json(accepted))
}

async fn ingest_event(
    State(state): State<AppState>,
    Path((project, channel)): Path<(String, String)>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Accepted> {
    let envelope = Envelope::new(&project, CorrelationId::propagate(request.correlation_id));
    let source = request.source.unwrap_or_else(|| channel.clone());
    let message = BusMessage::new(
        envelope,
        Payload::RawEvent {
            channel,
            event: RawEvent::new(source, request.payload),
        },
    );
    publish(&state, message).await
}

async fn publish_intent(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(request): Json<IntentRequest>,
) -> ApiResult<Accepted> {
    let envelope = Envelope::new(&project, CorrelationId::propagate(request.correlation_id));
    let message = BusMessage::new(
        envelope,
        Payload::Intent {
            intent_type: request.intent_type,
            urgency: request.urgency,
            context: request.context,
            source_event: request.source_event,
        },
    );
    publish(&state, message).await
}

async fn invalidate_mappings(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Json<Value> {
    let invalidated = state.mappings.invalidate(&project).await;
    info!(project = %project, invalidated, "intent mappings invalidated");
    Json(json!({ "invalidated": invalidated }))
}

async fn invalidate_all_mappings(State(state): State<AppState>) -> Json<Value> {
    let count = state.mappings.invalidate_all().await;
    info!(count, "all intent mappings invalidated");
    Json(json!({ "invalidated": count }))
}

async fn get_trace(
    State(state): State<AppState>,
    Path((project, correlation_id)): Path<(String, String)>,
) -> Json<Value> {
    Json(json!(state.tracer.get_trace(&project, &correlation_id).await))
}

async fn recent_traces(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Json(json!(state.tracer.get_recent_traces(&project, limit).await))
}

async fn service_logs(
    State(state): State<AppState>,
    Path((project, service)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let Some(service) = Service::parse(&service) else {
        return Json(json!([]));
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Json(json!(state.tracer.get_recent_entries(&project, service, limit).await))
}

// --- Context ---

async fn entity_context(
    State(state): State<AppState>,
    Path((project, entity_type, entity_id)): Path<(String, String, String)>,
    Query(query): Query<ContextQuery>,
) -> Result<Response, ApiError> {
    let correlation_id = query.correlation_id.map(|id| CorrelationId::propagate(Some(id)));
    let Some(context) = state
        .context
        .entity_context(&project, &entity_type, &entity_id, correlation_id)
        .await
    else {
        return Err(ApiError::NotFound(format!("entity {}/{} not found", entity_type, entity_id)));
    };
    if query.format.as_deref() == Some("text") {
        return Ok(format_entity_context(&context, true).into_response());
    }
    Ok(Json(context).into_response())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "synapse",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let decision_support = Router::new()
        .route("/derive", post(derive_graph))
        .route("/graphs", post(save_graph))
        .route("/graphs/{project}", get(list_graphs))
        .route("/graphs/{project}/{graph_id}", get(get_graph).delete(delete_graph))
        .route("/graphs/{project}/{graph_id}/zmq-rules", get(export_rules))
        .route("/graphs/{project}/{graph_id}/deploy-rules", post(deploy_rules))
        .route(
            "/graphs/{project}/{graph_id}/actions/{action_id}/status",
            post(update_action_status),
        )
        .route("/graphs/{project}/{graph_id}/hydrate", get(hydrate_graph))
        .route("/graphs/{project}/{graph_id}/test-scenario", post(test_scenario))
        .route("/ontology/{project}/entity-map", get(entity_map))
        .route("/ontology/{project}/graph-view", get(graph_view));

    let agent_bus = Router::new()
        .route("/{project}/events/{channel}", post(ingest_event))
        .route("/{project}/intents", post(publish_intent))
        .route("/{project}/intent-mappings/invalidate", post(invalidate_mappings))
        .route("/intent-mappings", delete(invalidate_all_mappings))
        .route("/{project}/trace/{correlation_id}", get(get_trace))
        .route("/{project}/traces", get(recent_traces))
        .route("/{project}/logs/{service}", get(service_logs));

    Router::new()
        .route("/health", get(health_check))
        .nest("/decision-support", decision_support)
        .nest("/agent-bus", agent_bus)
        .route(
            "/context/{project}/entities/{entity_type}/{entity_id}",
            get(entity_context),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the API server
pub async fn start_server(state: AppState) -> Result<()> {
    let addr = state.config.bind_addr.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "api server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
