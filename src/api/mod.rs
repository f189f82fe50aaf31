//! HTTP binding over the orchestration core. Every route here maps
//! directly onto one coordinator/service-layer operation; this module
//! owns request/response shaping, auth/rate-limit/CORS layering, and input
//! validation, and nothing else.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::config::ServerConfig;
use crate::constants::SECURITY_EVENT_PROMPT_TRUNCATE_LEN;
use crate::context::Context;
use crate::events::EventBus;
use crate::models::{
    Actor, ActorType, Agent, AgentConnectionStatus, EvictionAction, Priority, RoutingTarget,
    SecurityEvent, SecurityEventAction, SecurityEventSource, Task, TaskStatus, WaitDelivery,
    WorkspaceContext,
};
use crate::monitoring::{SystemMetrics, SystemMonitor};
use crate::rate_limit::rate_limit_middleware;
use crate::{Result, WaahError};

const SERVICE_NAME: &str = "waaah-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct ApiServer {
    context: Context,
    monitor: Arc<SystemMonitor>,
}

impl ApiServer {
    pub fn new(context: Context, monitor: Arc<SystemMonitor>) -> Self {
        Self { context, monitor }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.context.config.server.host, self.context.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WaahError::Internal(e.into()))?;
        tracing::info!(%addr, "waaah-core listening");

        axum::serve(
            listener,
            self.build_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| WaahError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(
                self.context
                    .config
                    .server
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ]);

        // `/health` stays outside the auth/rate-limit layers: probes and
        // load balancers should not need an API key.
        let public = Router::new().route("/health", get(health));

        let protected = Router::new()
            .route("/metrics", get(metrics))
            .route("/agents", post(register_agent).get(list_agents))
            .route("/agents/{agent_id}", get(get_agent_status))
            .route("/agents/{agent_id}/wait", post(wait_for_prompt))
            .route("/agents/{agent_id}/evict", post(request_eviction))
            .route("/tasks", post(assign_task))
            .route("/tasks/{task_id}/ack", post(ack_task))
            .route("/tasks/{task_id}/response", post(send_response))
            .route("/tasks/{task_id}/progress", post(update_progress))
            .route("/tasks/{task_id}/block", post(block_task))
            .route("/tasks/{task_id}/answer", post(answer_task))
            .route("/tasks/{task_id}/wait", get(wait_for_task_completion))
            .route("/tasks/{task_id}/cancel", post(cancel_task))
            .route("/tasks/{task_id}/retry", post(force_retry))
            .route("/system-prompts", post(broadcast_system_prompt))
            .route("/events/{topic}", get(subscribe))
            .route_layer(middleware::from_fn_with_state(
                self.context.auth.clone(),
                auth_middleware,
            ))
            .route_layer(middleware::from_fn_with_state(
                self.context.rate_limits.clone(),
                rate_limit_middleware,
            ));

        public
            .merge(protected)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self.clone())
    }
}

fn clamp_timeout(server: &ServerConfig, requested: Option<u64>) -> Duration {
    let secs = requested
        .unwrap_or(server.default_wait_timeout_secs)
        .clamp(server.min_wait_timeout_secs, server.max_wait_timeout_secs);
    Duration::from_secs(secs)
}

async fn assigned_agent(context: &Context, task_id: &str) -> Result<String> {
    let task = context
        .db
        .get_task(task_id)
        .await?
        .ok_or_else(|| WaahError::NotFound(format!("task {task_id} not found")))?;
    task.assigned_to
        .ok_or_else(|| WaahError::WrongState(format!("task {task_id} is not assigned to any agent")))
}

async fn record_blocked_prompt(context: &Context, from: &Actor, prompt: &str) {
    let flags = context.validator.flag(prompt);
    let truncated: String = prompt.chars().take(SECURITY_EVENT_PROMPT_TRUNCATE_LEN).collect();
    let source = match from.kind {
        ActorType::Agent => SecurityEventSource::Agent,
        ActorType::User => SecurityEventSource::Cli,
    };
    let event = SecurityEvent {
        id: Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        source,
        from_id: Some(from.id.clone()),
        prompt: truncated,
        flags,
        action: SecurityEventAction::Blocked,
    };
    if let Err(e) = context.db.record_security_event(&event).await {
        tracing::error!(error = %e, "failed to record security event for a blocked prompt");
    }
}

// --- health / metrics ---

async fn health(State(server): State<ApiServer>) -> std::result::Result<Json<serde_json::Value>, WaahError> {
    let metrics = server.monitor.sample_now().await?;
    Ok(Json(serde_json::json!({
        "status": metrics.health_status,
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    })))
}

async fn metrics(State(server): State<ApiServer>) -> std::result::Result<Json<SystemMetrics>, WaahError> {
    Ok(Json(server.monitor.sample_now().await?))
}

// --- agents ---

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    id: String,
    display_name: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    workspace_context: Option<WorkspaceContext>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    color: Option<String>,
}

async fn register_agent(
    State(server): State<ApiServer>,
    Json(req): Json<RegisterAgentRequest>,
) -> std::result::Result<(StatusCode, Json<Agent>), WaahError> {
    let display_name = req.display_name.unwrap_or_else(|| req.id.clone());
    let capabilities: HashSet<String> = req.capabilities.into_iter().collect();
    let agent = server
        .context
        .registry
        .register(&req.id, &display_name, capabilities, req.workspace_context, req.aliases, req.color)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Serialize)]
struct AgentRecord {
    #[serde(flatten)]
    agent: Agent,
    status: AgentConnectionStatus,
}

async fn list_agents(
    State(server): State<ApiServer>,
) -> std::result::Result<Json<Vec<AgentRecord>>, WaahError> {
    let agents = server.context.registry.get_all().await?;
    let mut records = Vec::with_capacity(agents.len());
    for agent in agents {
        let status = server.context.registry.connection_status(&agent.id).await?;
        records.push(AgentRecord { agent, status });
    }
    Ok(Json(records))
}

async fn get_agent_status(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> std::result::Result<Json<AgentRecord>, WaahError> {
    let agent = server
        .context
        .registry
        .get(&agent_id)
        .await?
        .ok_or_else(|| WaahError::NotFound(format!("agent {agent_id} not found")))?;
    let status = server.context.registry.connection_status(&agent_id).await?;
    Ok(Json(AgentRecord { agent, status }))
}

#[derive(Debug, Deserialize)]
struct WaitForPromptRequest {
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    workspace_context: Option<WorkspaceContext>,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

async fn wait_for_prompt(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
    Json(req): Json<WaitForPromptRequest>,
) -> std::result::Result<Json<Option<WaitDelivery>>, WaahError> {
    server.context.registry.heartbeat(&agent_id).await?;
    let timeout = clamp_timeout(&server.context.config.server, req.timeout_sec);
    let capabilities: HashSet<String> = req.capabilities.into_iter().collect();

    let delivery = server
        .context
        .waiter
        .wait_for_task(&agent_id, &capabilities, req.workspace_context.as_ref(), timeout)
        .await?;
    Ok(Json(delivery))
}

#[derive(Debug, Deserialize)]
struct RequestEvictionRequest {
    reason: String,
    action: EvictionAction,
}

async fn request_eviction(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
    Json(req): Json<RequestEvictionRequest>,
) -> std::result::Result<StatusCode, WaahError> {
    server
        .context
        .registry
        .request_eviction(&agent_id, &req.reason, req.action)
        .await?;
    server.context.waiter.wake();
    Ok(StatusCode::ACCEPTED)
}

// --- tasks ---

#[derive(Debug, Deserialize)]
struct AssignTaskRequest {
    prompt: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    context: Option<serde_json::Value>,
    to: RoutingTarget,
    from: Actor,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AssignTaskResponse {
    task_id: String,
    reserved_agent_id: Option<String>,
}

async fn assign_task(
    State(server): State<ApiServer>,
    Json(req): Json<AssignTaskRequest>,
) -> std::result::Result<(StatusCode, Json<AssignTaskResponse>), WaahError> {
    let sanitized_prompt = match server.context.validator.validate_and_sanitize_prompt(&req.prompt) {
        Ok(prompt) => prompt,
        Err(e) => {
            record_blocked_prompt(&server.context, &req.from, &req.prompt).await;
            return Err(e);
        }
    };

    let sanitized_context = match req.context {
        Some(serde_json::Value::Object(map)) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                server.context.validator.validate_context_key(&key)?;
                let value = match value {
                    serde_json::Value::String(s) => serde_json::Value::String(
                        server.context.validator.validate_and_sanitize_context_value(&s)?,
                    ),
                    other => other,
                };
                sanitized.insert(key, value);
            }
            Some(serde_json::Value::Object(sanitized))
        }
        other => other,
    };

    let outcome = server
        .context
        .lifecycle
        .enqueue(sanitized_prompt, req.priority.unwrap_or_default(), req.from, req.to, sanitized_context, req.dependencies)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AssignTaskResponse {
            task_id: outcome.task_id,
            reserved_agent_id: outcome.reserved_agent_id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    agent_id: String,
}

async fn ack_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<AckRequest>,
) -> std::result::Result<Json<Task>, WaahError> {
    Ok(Json(server.context.lifecycle.ack_task(&task_id, &req.agent_id).await?))
}

#[derive(Debug, Deserialize)]
struct SendResponseRequest {
    status: TaskStatus,
    message: String,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    diff: Option<String>,
}

async fn send_response(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<SendResponseRequest>,
) -> std::result::Result<Json<Task>, WaahError> {
    let agent_id = assigned_agent(&server.context, &task_id).await?;
    let task = server
        .context
        .lifecycle
        .send_response(&task_id, &agent_id, req.status, req.message, req.artifacts, req.diff)
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct UpdateProgressRequest {
    agent_id: String,
    message: String,
    #[serde(default)]
    percentage: Option<u8>,
}

async fn update_progress(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<UpdateProgressRequest>,
) -> std::result::Result<StatusCode, WaahError> {
    server
        .context
        .lifecycle
        .update_progress(&task_id, &req.agent_id, &req.message, req.percentage)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct BlockTaskRequest {
    reason: String,
    question: String,
    summary: String,
}

async fn block_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<BlockTaskRequest>,
) -> std::result::Result<Json<Task>, WaahError> {
    let agent_id = assigned_agent(&server.context, &task_id).await?;
    let task = server
        .context
        .lifecycle
        .block(&task_id, &agent_id, &req.reason, &req.question, &req.summary)
        .await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct AnswerTaskRequest {
    answer: String,
}

async fn answer_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<AnswerTaskRequest>,
) -> std::result::Result<Json<Task>, WaahError> {
    Ok(Json(server.context.lifecycle.answer(&task_id, &req.answer).await?))
}

#[derive(Debug, Deserialize)]
struct WaitForTaskCompletionQuery {
    timeout_sec: Option<u64>,
}

async fn wait_for_task_completion(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Query(query): Query<WaitForTaskCompletionQuery>,
) -> std::result::Result<Json<Option<Task>>, WaahError> {
    let timeout = clamp_timeout(&server.context.config.server, query.timeout_sec);
    let task = server.context.waiter.wait_for_task_completion(&task_id, timeout).await?;
    Ok(Json(task))
}

async fn cancel_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<Task>, WaahError> {
    Ok(Json(server.context.lifecycle.cancel_task(&task_id).await?))
}

async fn force_retry(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<Task>, WaahError> {
    Ok(Json(server.context.lifecycle.force_retry(&task_id).await?))
}

// --- system prompts ---

#[derive(Debug, Deserialize)]
struct BroadcastSystemPromptRequest {
    prompt_type: String,
    message: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    target_agent_id: Option<String>,
    #[serde(default)]
    target_capability: Option<String>,
    #[serde(default)]
    broadcast: bool,
}

#[derive(Debug, Serialize)]
struct BroadcastSystemPromptResponse {
    delivered_to: usize,
}

async fn broadcast_system_prompt(
    State(server): State<ApiServer>,
    Json(req): Json<BroadcastSystemPromptRequest>,
) -> std::result::Result<Json<BroadcastSystemPromptResponse>, WaahError> {
    let delivered_to = server
        .context
        .system_prompts
        .broadcast(
            &server.context.registry,
            &req.prompt_type,
            &req.message,
            req.payload,
            req.priority.unwrap_or_default(),
            req.target_agent_id.as_deref(),
            req.target_capability.as_deref(),
            req.broadcast,
        )
        .await?;
    server.context.waiter.wake();
    Ok(Json(BroadcastSystemPromptResponse { delivered_to }))
}

// --- events ---

async fn subscribe(
    State(server): State<ApiServer>,
    Path(topic): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let rx = server.context.events.subscribe();

    let stream = stream::unfold(rx, move |mut rx| {
        let topic = topic.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if topic == "*" || event.topic() == topic {
                            let payload = serde_json::to_string(&event).unwrap_or_default();
                            let sse_event = Event::default().event(event.topic()).data(payload);
                            return Some((Ok(sse_event), rx));
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
