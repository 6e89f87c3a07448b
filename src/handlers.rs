use crate::calculator::{calculate_for, CalculatedParameters, CalculationInput};
use crate::constants::USER_ID_HEADER;
use crate::health;
use crate::history::{normalize_page, ConversationEvent};
use crate::ingress::{build_chat_body, build_ops_body, ChatIngress, OpsIngress};
use crate::logging::request_id_middleware;
use crate::main_helper::AppState;
use crate::models::{
    Conversation, ImageMessage, Machine, MachineParameter, Material, NewConversation,
    NewImageMessage, NewMachine, NewMachineParameter, NewMaterial, NewTextMessage, TextMessage,
};
use crate::search::{SimilarityRequest, SimilarityResponse};
use crate::persist::{AgentResponse, PersistJob, SavedImage, SavedText};
use crate::streaming::{FrameContent, RelayOutcome, RelayRequest};
use crate::types::{AgentMode, LatencyMs, RelayError, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .route("/api/conversations", post(create_conversation))
        .route(
            "/api/conversations/calculate_parameters",
            post(calculate_parameters),
        )
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/textMessages", post(create_text_message))
        .route("/api/conversations/:id/imageMessages", post(create_image_message))
        .route("/api/conversations/:id/parameters", post(create_parameter))
        .route("/api/conversations/:id/history", get(history))
        .route("/api/conversations/:id/streamsse", post(chat_stream))
        .route("/api/conversations/:id/ops-streamsse", post(ops_stream))
        .route("/api/conversations/:id/redirect", post(redirect))
        .route(
            "/api/conversations/:id/similarity_search",
            post(similarity_search),
        )
        .route("/api/machines", post(create_machine))
        .route("/api/materials", post(create_material))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Live conversation, scoped to the caller when it identifies itself.
async fn load_conversation(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Conversation> {
    state
        .store
        .get_conversation_for(id, user_id(headers).as_deref())
        .await
}

// --- conversations and records ---

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new): Json<NewConversation>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let owner = user_id(&headers).unwrap_or_else(|| "anonymous".to_string());
    let conversation = state.store.create_conversation(&owner, &new).await?;
    tracing::info!(
        "[🖥️  -> ⚙️ ] Created conversation [{}...] for {}",
        crate::str_utils::prefix_chars(&conversation.id, 8),
        owner
    );
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Conversation>> {
    Ok(Json(load_conversation(&state, &headers, &id).await?))
}

async fn create_text_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(new): Json<NewTextMessage>,
) -> Result<(StatusCode, Json<TextMessage>)> {
    load_conversation(&state, &headers, &id).await?;
    if new.text.trim().is_empty() {
        return Err(RelayError::Validation("text must not be empty".to_string()).into());
    }
    let message = state.store.create_text_message(&id, &new).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn create_image_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(new): Json<NewImageMessage>,
) -> Result<(StatusCode, Json<ImageMessage>)> {
    load_conversation(&state, &headers, &id).await?;
    let image = state.store.create_image_message(&id, &new).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

async fn similarity_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<SimilarityRequest>,
) -> Result<(StatusCode, Json<SimilarityResponse>)> {
    load_conversation(&state, &headers, &id).await?;
    let endpoint = match state.endpoints.search.as_deref() {
        Some(e) => e,
        None => {
            return Err(RelayError::Upstream(
                StatusCode::SERVICE_UNAVAILABLE,
                "image search is not configured".to_string(),
            )
            .into())
        }
    };
    let response = state.search.run(endpoint, &id, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn create_parameter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(new): Json<NewMachineParameter>,
) -> Result<(StatusCode, Json<MachineParameter>)> {
    load_conversation(&state, &headers, &id).await?;
    let parameter = state.store.create_machine_parameter(Some(&id), &new).await?;
    Ok((StatusCode::CREATED, Json(parameter)))
}

async fn create_machine(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewMachine>,
) -> Result<(StatusCode, Json<Machine>)> {
    let machine = state.store.create_machine(&new).await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

async fn create_material(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewMaterial>,
) -> Result<(StatusCode, Json<Material>)> {
    let material = state.store.create_material(&new).await?;
    Ok((StatusCode::CREATED, Json(material)))
}

// --- history ---

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    start: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PageLinks {
    pub next: Option<String>,
    pub previous: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEnvelope {
    pub links: PageLinks,
    pub count: i64,
    pub results: Vec<ConversationEvent>,
}

async fn history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryEnvelope>> {
    let (limit, offset) = normalize_page(query.limit, query.start)?;
    load_conversation(&state, &headers, &id).await?;

    let page = state.history.page(&id, limit, offset).await?;
    let link = |start: i64| {
        format!(
            "/api/conversations/{}/history?limit={}&start={}",
            id, limit, start
        )
    };

    Ok(Json(HistoryEnvelope {
        links: PageLinks {
            next: page.next_offset(limit, offset).map(link),
            previous: page.previous_offset(limit, offset).map(link),
        },
        count: page.total_count,
        results: page.items,
    }))
}

// --- agent relays ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayQuery {
    app_version: Option<String>,
    content: Option<String>,
}

impl RelayQuery {
    fn content(&self) -> FrameContent {
        match self.content.as_deref() {
            Some("structured") => FrameContent::Structured,
            _ => FrameContent::Text,
        }
    }
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<RelayQuery>,
    Json(ingress): Json<ChatIngress>,
) -> Result<Response> {
    load_conversation(&state, &headers, &id).await?;
    let turn = ingress.validate()?;
    tracing::info!(
        "[🖥️  -> ⚙️ ] Chat turn on [{}...] (text {}, image {})",
        crate::str_utils::prefix_chars(&id, 8),
        turn.text_query.id,
        turn.image_query.is_some()
    );

    let chat_history = state
        .history
        .context_window(turn.text_query.id, &id, AgentMode::Chat)
        .await?;
    let body = serde_json::to_value(build_chat_body(&turn, chat_history))?;

    let request = RelayRequest {
        mode: AgentMode::Chat,
        endpoint: state.endpoints.resolve(query.app_version.as_deref()).to_string(),
        body,
        content: query.content(),
        job: PersistJob {
            conversation_id: id,
            machine_model: Some(turn.machine_type),
            image_query: turn.image_query,
        },
        user_id: user_id(&headers),
    };
    Ok(start_relay(&state, request))
}

async fn ops_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<RelayQuery>,
    Json(ingress): Json<OpsIngress>,
) -> Result<Response> {
    load_conversation(&state, &headers, &id).await?;
    let turn = ingress.validate()?;

    let parameter = match state.store.find_machine_parameter(&turn.parameter_id).await? {
        Some(p) => p,
        None => {
            return Err(
                RelayError::NotFound(format!("parameter {} not found", turn.parameter_id)).into(),
            )
        }
    };
    let machine = match &parameter.machine_id {
        Some(machine_id) => state.store.find_machine(machine_id).await?,
        None => None,
    };
    let material = match &parameter.material_id {
        Some(material_id) => state.store.find_material(material_id).await?,
        None => None,
    };
    tracing::info!(
        "[🖥️  -> ⚙️ ] Ops turn on [{}...] (text {}, parameter {})",
        crate::str_utils::prefix_chars(&id, 8),
        turn.text_query.id,
        crate::str_utils::prefix_chars(&parameter.id, 8)
    );

    let chat_history = state
        .history
        .context_window(turn.text_query.id, &id, AgentMode::Ops)
        .await?;
    let body = build_ops_body(
        &turn,
        &parameter,
        machine.as_ref(),
        material.as_ref(),
        chat_history,
    )?;

    let request = RelayRequest {
        mode: AgentMode::Ops,
        endpoint: state.endpoints.resolve(query.app_version.as_deref()).to_string(),
        body: serde_json::to_value(body)?,
        content: query.content(),
        job: PersistJob {
            conversation_id: id,
            machine_model: machine.as_ref().map(|m| m.name.clone()),
            image_query: turn.image_query,
        },
        user_id: user_id(&headers),
    };
    Ok(start_relay(&state, request))
}

fn start_relay(state: &AppState, request: RelayRequest) -> Response {
    let handle = state.relay.relay(request);
    tokio::spawn(report_outcome(handle.task));

    let body = Body::from_stream(
        handle
            .frames
            .map(|frame| Ok::<_, Infallible>(frame.to_bytes())),
    );
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

async fn report_outcome(task: JoinHandle<RelayOutcome>) {
    match task.await {
        Ok(RelayOutcome::Completed(summary)) => tracing::debug!(
            "Relay completed: text={} images={} error={:?}",
            summary.text.is_some(),
            summary.images.len(),
            summary.error
        ),
        Ok(RelayOutcome::UpstreamFailed(reason)) => {
            tracing::warn!("Relay ended on upstream failure: {}", reason)
        }
        Ok(RelayOutcome::DecodeFailed(reason)) => {
            tracing::warn!("Relay ended on decode failure: {}", reason)
        }
        Err(e) => tracing::error!(target: "panic", "Relay task failed: {}", e),
    }
}

#[derive(Debug, Serialize)]
pub struct RedirectReply {
    pub text: Option<SavedText>,
    pub images: Vec<SavedImage>,
}

#[derive(Debug, Serialize)]
pub struct RedirectTimer {
    pub agent_ms: LatencyMs,
    pub persist_ms: LatencyMs,
}

#[derive(Debug, Serialize)]
pub struct RedirectResponse {
    pub response: RedirectReply,
    pub timer: RedirectTimer,
}

/// Non-streaming chat: one JSON round trip to the agent, saved before the
/// caller gets the answer.
async fn redirect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<RelayQuery>,
    Json(ingress): Json<ChatIngress>,
) -> Result<Json<RedirectResponse>> {
    load_conversation(&state, &headers, &id).await?;
    let turn = ingress.validate()?;

    let chat_history = state
        .history
        .context_window(turn.text_query.id, &id, AgentMode::Chat)
        .await?;
    let body = serde_json::to_value(build_chat_body(&turn, chat_history))?;
    let endpoint = state.endpoints.resolve(query.app_version.as_deref());

    let agent_started = Instant::now();
    let reply = state.upstream.chat(endpoint, &body).await?;
    let agent_ms = LatencyMs::from(agent_started.elapsed());

    let response: AgentResponse = match serde_json::from_value(reply) {
        Ok(r) => r,
        Err(e) => {
            return Err(RelayError::Decode(format!("agent reply is malformed: {}", e)).into())
        }
    };

    let job = PersistJob {
        conversation_id: id,
        machine_model: Some(turn.machine_type),
        image_query: turn.image_query,
    };
    let persist_started = Instant::now();
    let summary = state.persister.persist(response, &job).await;
    let persist_ms = LatencyMs::from(persist_started.elapsed());

    tracing::info!(
        "[⚙️  -> 🖥️ ] Redirect answered: agent {}ms, persist {}ms",
        agent_ms,
        persist_ms
    );

    Ok(Json(RedirectResponse {
        response: RedirectReply {
            text: summary.text,
            images: summary.images,
        },
        timer: RedirectTimer {
            agent_ms,
            persist_ms,
        },
    }))
}

// --- calculator ---

async fn calculate_parameters(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CalculationInput>,
) -> Result<Json<CalculatedParameters>> {
    let machine = match &input.machine_id {
        Some(machine_id) => state.store.find_machine(machine_id).await?,
        None => None,
    };
    let material = match &input.material_id {
        Some(material_id) => state.store.find_material(material_id).await?,
        None => None,
    };
    let result = calculate_for(machine.as_ref(), material.as_ref(), &input)?;
    Ok(Json(result))
}
