use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::{Stream, stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{
    catalog::{Catalog, CatalogEntry},
    chat::{build_chat_messages, render_prompt},
    config::{AppConfig, GenerationSettings},
    error::{ErrorNotice, SessionError},
    model::ChatMessage,
    protocol::{
        Banner, FailureKind, GeneratePayload, GenerationOutcome, SessionConfig, Stage,
        StatusPayload, TokenPayload,
    },
    session::{
        SessionController,
        events::EventSink,
        negotiation::{Backend, Precision},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub controller: Arc<SessionController>,
    pub catalog: Arc<Catalog>,
}

/// Records the side-channel events of one HTTP request.
#[derive(Default)]
struct CollectingSink {
    events: Mutex<Collected>,
}

#[derive(Default)]
struct Collected {
    tokens: usize,
    statuses: Vec<StatusPayload>,
    banners: Vec<Banner>,
}

impl CollectingSink {
    fn take(&self) -> Collected {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for CollectingSink {
    fn on_token(&self, _token: &TokenPayload) {
        self.events.lock().tokens += 1;
    }

    fn on_status(&self, status: &StatusPayload) {
        self.events.lock().statuses.push(status.clone());
    }

    fn on_banner(&self, banner: &Banner) {
        self.events.lock().banners.push(banner.clone());
    }
}

/// One server-sent event of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Token(TokenPayload),
    Status(StatusPayload),
    Banner(Banner),
    Done(GenerationOutcome),
    Error {
        kind: FailureKind,
        message: String,
        notice: ErrorNotice,
    },
}

impl StreamFrame {
    fn settled(result: Result<GenerationOutcome, SessionError>) -> Self {
        match result {
            Ok(outcome) => StreamFrame::Done(outcome),
            Err(err) => StreamFrame::Error {
                kind: err.kind(),
                message: err.to_string(),
                notice: err.notice(Stage::Generate),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamFrame::Token(_) => "token",
            StreamFrame::Status(_) => "status",
            StreamFrame::Banner(_) => "banner",
            StreamFrame::Done(_) => "done",
            StreamFrame::Error { .. } => "error",
        }
    }

    fn into_event(self) -> Result<Event, axum::Error> {
        let event = Event::default().event(self.name());
        match self {
            StreamFrame::Token(token) => event.json_data(token),
            StreamFrame::Status(status) => event.json_data(status),
            StreamFrame::Banner(banner) => event.json_data(banner),
            StreamFrame::Done(outcome) => event.json_data(outcome),
            StreamFrame::Error {
                kind,
                message,
                notice,
            } => event.json_data(serde_json::json!({
                "kind": kind,
                "message": message,
                "notice": notice,
            })),
        }
    }
}

struct StreamSink {
    frames: mpsc::UnboundedSender<StreamFrame>,
}

impl EventSink for StreamSink {
    fn on_token(&self, token: &TokenPayload) {
        let _ = self.frames.send(StreamFrame::Token(token.clone()));
    }

    fn on_status(&self, status: &StatusPayload) {
        let _ = self.frames.send(StreamFrame::Status(status.clone()));
    }

    fn on_banner(&self, banner: &Banner) {
        let _ = self.frames.send(StreamFrame::Banner(banner.clone()));
    }
}

/// Runs one generation in the background and yields its events, ending with
/// a `Done` or `Error` frame. Dropping the receiver aborts the generation.
pub fn stream_generation(
    controller: Arc<SessionController>,
    payload: GeneratePayload,
) -> mpsc::UnboundedReceiver<StreamFrame> {
    let (frames, rx) = mpsc::unbounded_channel();
    let sink = Arc::new(StreamSink {
        frames: frames.clone(),
    });

    tokio::spawn(async move {
        let run = controller.generate(payload, sink);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = frames.closed() => {
                debug!("stream client went away, aborting generation");
                controller.abort();
                run.await
            }
        };
        let _ = frames.send(StreamFrame::settled(result));
    });

    rx
}

#[derive(Debug, Default, Deserialize)]
struct InitRequest {
    model_id: Option<String>,
    precision: Option<Precision>,
    backend: Option<Backend>,
}

#[derive(Serialize)]
struct InitResponse {
    config: SessionConfig,
    status: Vec<StatusPayload>,
    banners: Vec<Banner>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    max_new_tokens: Option<usize>,
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct GenerateResponse {
    text: String,
    aborted: bool,
    streamed_tokens: usize,
    banners: Vec<Banner>,
    config: Option<SessionConfig>,
}

#[derive(Serialize)]
struct SessionSnapshot {
    config: Option<SessionConfig>,
    generating: bool,
    executor_alive: bool,
}

#[derive(Serialize)]
struct AbortResponse {
    requested: bool,
}

pub fn build_router(
    config: Arc<AppConfig>,
    controller: Arc<SessionController>,
    catalog: Arc<Catalog>,
) -> Router {
    let state = AppState {
        config,
        controller,
        catalog,
    };

    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/session", get(session_snapshot))
        .route("/session/init", post(init_session))
        .route("/session/generate", post(generate))
        .route("/session/generate/stream", post(generate_stream))
        .route("/session/abort", post(abort))
        .route("/session/reset", post(reset))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<CatalogEntry>> {
    Json(state.catalog.entries().to_vec())
}

async fn session_snapshot(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(snapshot(&state.controller))
}

fn snapshot(controller: &SessionController) -> SessionSnapshot {
    SessionSnapshot {
        config: controller.config(),
        generating: controller.is_generating(),
        executor_alive: controller.has_executor(),
    }
}

async fn init_session(
    State(state): State<AppState>,
    body: Option<Json<InitRequest>>,
) -> Result<Json<InitResponse>, SessionError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let entry = state
        .catalog
        .pick(request.model_id.as_deref(), &state.config.model_id)?;

    let settings = GenerationSettings {
        precision: request.precision.unwrap_or(state.config.settings.precision),
        ..state.config.settings
    };
    let payload = entry.init_payload(&settings, request.backend.or(state.config.backend));

    let sink = Arc::new(CollectingSink::default());
    let config = state.controller.init(payload, sink.clone()).await?;
    let collected = sink.take();
    info!(model_id = %config.model_id, backend = %config.backend, precision = %config.precision, "session ready");

    Ok(Json(InitResponse {
        config,
        status: collected.statuses,
        banners: collected.banners,
    }))
}

fn generation_payload(
    config: &AppConfig,
    request: GenerateRequest,
) -> Result<GeneratePayload, SessionError> {
    if request.prompt.trim().is_empty() {
        return Err(SessionError::BadRequest("prompt must not be empty".into()));
    }
    let messages = build_chat_messages(&request.history, &request.prompt);

    let settings = GenerationSettings {
        max_new_tokens: request
            .max_new_tokens
            .unwrap_or(config.settings.max_new_tokens),
        temperature: request.temperature.unwrap_or(config.settings.temperature),
        ..config.settings
    }
    .normalized();

    Ok(GeneratePayload {
        prompt: render_prompt(&messages),
        max_new_tokens: settings.max_new_tokens,
        temperature: settings.temperature,
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, SessionError> {
    let payload = generation_payload(&state.config, request)?;

    let sink = Arc::new(CollectingSink::default());
    let outcome = state.controller.generate(payload, sink.clone()).await?;
    let collected = sink.take();

    Ok(Json(GenerateResponse {
        text: outcome.text,
        aborted: outcome.aborted,
        streamed_tokens: collected.tokens,
        banners: collected.banners,
        config: state.controller.config(),
    }))
}

/// Streams a generation as server-sent events. `/session/abort` stops it early.
async fn generate_stream(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, SessionError> {
    let payload = generation_payload(&state.config, request)?;
    let frames = stream_generation(state.controller.clone(), payload);

    let events = stream::unfold(frames, |mut frames| async move {
        let frame = frames.recv().await?;
        Some((frame.into_event(), frames))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn abort(State(state): State<AppState>) -> Json<AbortResponse> {
    Json(AbortResponse {
        requested: state.controller.abort(),
    })
}

async fn reset(State(state): State<AppState>) -> Json<SessionSnapshot> {
    state.controller.reset("reset requested");
    Json(snapshot(&state.controller))
}
