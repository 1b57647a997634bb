use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt, future};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use volkai_core::{
    config::Config, error::ChatError, model::ChatRequest, pipeline::Pipeline,
    prompt::format_prompt, source::FragmentSource, stream::StreamEvent,
    telemetry::{KEY_ERROR_KIND, KEY_ERROR_MESSAGE, KEY_REQUEST_ID},
};

/// Sent in place of backend error details once the stream has started.
pub const STREAM_FAILED_MESSAGE: &str = "Streaming response failed.";

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn FragmentSource>,
    pub pipeline: Arc<Pipeline>,
    pub cfg: Arc<Config>,
}

impl AppState {
    pub fn new(source: Arc<dyn FragmentSource>, cfg: Config) -> anyhow::Result<Self> {
        let pipeline = Pipeline::from_cfg(&cfg.stream)?;
        Ok(Self {
            source,
            pipeline: Arc::new(pipeline),
            cfg: Arc::new(cfg),
        })
    }
}

/// Error answered before any SSE byte is written.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status =
            StatusCode::from_u16(err.status_hint()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match err {
            ChatError::Validation(msg) => msg,
            other => format!("Failed to start generation: {other}"),
        };
        Self { status, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/chat", post(chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "VolkAI Chat API is running!" }))
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let Json(req) = payload.map_err(|rej| ApiError::bad_request(rej.body_text()))?;
    let (messages, params) = req.into_parts(state.cfg.defaults)?;
    let prompt = format_prompt(&state.cfg.prompt.preamble, &messages);

    let request_id = Uuid::new_v4().to_string();
    tracing::info!(
        { KEY_REQUEST_ID } = request_id.as_str(),
        messages = messages.len(),
        max_tokens = params.max_tokens,
        temperature = params.temperature,
        "chat request"
    );

    let events = state
        .pipeline
        .start(state.source.as_ref(), &prompt, params, Some(request_id.clone()))
        .await
        .inspect_err(|e| {
            let message = e.to_string();
            tracing::error!(
                { KEY_REQUEST_ID } = request_id.as_str(),
                { KEY_ERROR_KIND } = e.kind(),
                { KEY_ERROR_MESSAGE } = message.as_str(),
                "failed to open backend session"
            )
        })?;

    Ok(Sse::new(events.filter_map(|ev| future::ready(to_sse(ev).map(Ok::<_, Infallible>)))))
}

/// Segments become `data:` events; a failure becomes one out-of-band
/// `error` event. Normal terminations just close the stream.
fn to_sse(ev: StreamEvent) -> Option<Event> {
    match ev {
        StreamEvent::Segment(text) => Some(segment_event(&text)),
        StreamEvent::Error(_) => Some(Event::default().event("error").data(STREAM_FAILED_MESSAGE)),
        StreamEvent::Completed | StreamEvent::StopDetected => None,
    }
}

// SSE field values cannot carry CR; fold CRLF and lone CR into LF so axum
// splits them into separate `data:` lines.
fn segment_event(text: &str) -> Event {
    if text.contains('\r') {
        Event::default().data(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Event::default().data(text)
    }
}
