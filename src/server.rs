use crate::billing::UsageSettler;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::logging::SharedLogger;
use crate::proxy::{self, RelayRequest, RelayResponse, SseEvent};
use crate::relay::Channel;
use crate::translate::response::{error_for_format, relay_error_body};
use crate::translate::RelayFormat;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub channel: Channel,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
    pub settler: Arc<dyn UsageSettler>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/responses", post(handle_responses))
        .route("/v1beta/models/:target", post(handle_gemini))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_body(state, RelayFormat::Claude, &body, None, false).await
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    relay_body(state, RelayFormat::OpenAI, &body, None, false).await
}

async fn handle_responses() -> Response {
    let err = RelayError::unsupported(RelayFormat::OpenAIResponses, RelayFormat::OpenAI);
    error_response(&err, RelayFormat::OpenAI)
}

/// `POST /v1beta/models/{model}:{action}`
async fn handle_gemini(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    body: Bytes,
) -> Response {
    let (model, action) = target.rsplit_once(':').unwrap_or((target.as_str(), ""));
    let stream = match action {
        "streamGenerateContent" => true,
        "generateContent" => false,
        _ => {
            let body = error_for_format(
                RelayFormat::Gemini,
                "not_found_error",
                &format!("Unsupported method '{target}'"),
                404,
            );
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        }
    };
    let model = model.to_string();
    relay_body(state, RelayFormat::Gemini, &body, Some(&model), stream).await
}

async fn relay_body(
    state: Arc<AppState>,
    format: RelayFormat,
    body: &[u8],
    path_model: Option<&str>,
    stream: bool,
) -> Response {
    let request = match RelayRequest::decode(format, body, path_model, stream) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .warn("server", format!("Rejected {format} request: {e}"));
            return error_response(&e, format);
        }
    };

    tracing::info!(
        format = %format,
        model = %request.canonical.model,
        stream = request.canonical.stream,
        messages = request.canonical.messages.len(),
        "Request"
    );

    match proxy::relay(request, &state.channel, &state.client, state.settler.clone()).await {
        Ok(RelayResponse::Json { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(body)).into_response()
        }
        Ok(RelayResponse::Stream(events)) => sse_response(events),
        Err(e) => {
            state.logger.error("server", format!("Relay error: {e}"));
            error_response(&e, format)
        }
    }
}

fn sse_response(events: proxy::SseStream) -> Response {
    let events = events.map(|e: SseEvent| -> std::result::Result<Event, Infallible> {
        let event = Event::default().data(e.data);
        Ok(match e.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// An error in the client's own format.
pub fn error_response(err: &RelayError, format: RelayFormat) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(relay_error_body(err, format))).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": state.channel.format.as_str(),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut names: Vec<&String> = state.config.models.keys().collect();
    names.sort();
    let models: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| {
            serde_json::json!({
                "id": name,
                "object": "model",
                "owned_by": state.config.provider.name,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
