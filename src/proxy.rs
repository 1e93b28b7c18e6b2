//! Upstream I/O.
//!
//! [`relay`] sends a translated request upstream and adapts the response for
//! the client. Streaming responses are parsed with `eventsource-stream` and
//! fed through the pure state machines in [`crate::translate`]; the adapters
//! here only move bytes and settle usage.

use crate::billing::{SettleGuard, UsageSettler};
use crate::error::{RelayError, Result};
use crate::relay::{Channel, RelayInfo};
use crate::tokenizer;
use crate::translate::anthropic_types::StreamEvent;
use crate::translate::canonical::{self, CanonicalRequest};
use crate::translate::claude_stream::ClaudeStreamIngest;
use crate::translate::gemini_stream::{GeminiChunkWriter, GeminiStreamIngest};
use crate::translate::openai_types::ChatCompletionChunk;
use crate::translate::request::translate_request;
use crate::translate::response::{
    embedded_error, relay_error_body, translate_response, translate_upstream_error,
};
use crate::translate::streaming::StreamTranslator;
use crate::translate::{RelayFormat, Usage, UsagePolicy};

use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One outgoing SSE event. OpenAI and Gemini streams carry data only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

/// What the client gets back.
pub enum RelayResponse {
    Json { status: u16, body: Value },
    Stream(SseStream),
}

/// A decoded inbound request, with the raw body kept for same-format passthrough.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub canonical: CanonicalRequest,
    pub raw: Value,
}

impl RelayRequest {
    /// Decode a client body. Gemini clients put the model and streaming mode
    /// in the URL, passed here as `path_model` and `stream`.
    pub fn decode(
        format: RelayFormat,
        body: &[u8],
        path_model: Option<&str>,
        stream: bool,
    ) -> Result<Self> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| RelayError::bad_request(format!("Invalid JSON body: {e}")))?;
        let canonical = match format {
            RelayFormat::OpenAI => canonical::decode_openai(&raw)?,
            RelayFormat::Claude => canonical::decode_claude(&raw)?,
            RelayFormat::Gemini => canonical::decode_gemini(&raw, path_model.unwrap_or_default(), stream)?,
            other => return Err(RelayError::unsupported(other, RelayFormat::OpenAI)),
        };
        Ok(Self { canonical, raw })
    }
}

/// Forward a request through `channel` and adapt the response for the client.
pub async fn relay(
    request: RelayRequest,
    channel: &Channel,
    client: &reqwest::Client,
    settler: Arc<dyn UsageSettler>,
) -> Result<RelayResponse> {
    let prompt_estimate = tokenizer::estimate_prompt_tokens(&request.canonical);
    let info = RelayInfo::new(&request.canonical, channel, prompt_estimate);
    let (model, body) = upstream_body(&request, &info, channel)?;
    let url = channel.endpoint(&model, info.stream);

    info!(
        request_id = %info.request_id,
        chain = %info.chain,
        model = %model,
        stream = info.stream,
        "POST {url}"
    );

    let mut builder = client.post(&url).header("content-type", "application/json");
    for (name, value) in channel.auth_headers() {
        builder = builder.header(name, value);
    }
    let response = builder
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::provider(format!("Request to {url} failed: {e}")))?;

    let status = response.status().as_u16();
    let policy = channel.usage_policy(&info.upstream_model);
    let mut guard = SettleGuard::new(settler, info);
    guard.set_status(status);

    if status >= 400 {
        let body = response.bytes().await.unwrap_or_default();
        warn!(status, body_len = body.len(), "Upstream returned an error");
        let client_format = guard.info().client_format;
        return Ok(RelayResponse::Json {
            status,
            body: translate_upstream_error(status, &body, client_format),
        });
    }

    if guard.info().stream {
        let client_format = guard.info().client_format;
        let mut items = upstream_events(response.bytes_stream(), policy, guard);
        // Nothing is flushed until the first event is ready, so an upstream
        // failure at this point can still be a plain error response.
        let first = match items.next().await {
            Some(Err(e)) => {
                return Ok(RelayResponse::Json {
                    status: e.status_code(),
                    body: relay_error_body(&e, client_format),
                });
            }
            first => first,
        };
        let items = Box::pin(futures::stream::iter(first).chain(items));
        return Ok(RelayResponse::Stream(client_events(items, client_format)));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| RelayError::provider(format!("Failed to read upstream response: {e}")))?;
    debug!(status, body_len = body.len(), "Upstream response");

    let info = guard.info();
    match translate_response(
        &body,
        info.upstream_format,
        info.client_format,
        &info.client_model,
        &policy,
    ) {
        Ok(translated) => {
            guard.settle(translated.usage);
            Ok(RelayResponse::Json {
                status,
                body: translated.body,
            })
        }
        Err(e) => {
            guard.fail(&e);
            Err(e)
        }
    }
}

/// The upstream model (for the URL) and JSON body.
///
/// Same-format requests forward the client's body with only the model
/// replaced, so fields the translator does not model survive.
fn upstream_body(request: &RelayRequest, info: &RelayInfo, channel: &Channel) -> Result<(String, Value)> {
    if info.is_passthrough() {
        let mut body = request.raw.clone();
        if let Value::Object(ref mut map) = body {
            if channel.format != RelayFormat::Gemini {
                map.insert("model".to_string(), Value::String(info.upstream_model.clone()));
            }
            if channel.format == RelayFormat::OpenAI
                && info.stream
                && !map.contains_key("stream_options")
            {
                map.insert("stream_options".to_string(), json!({ "include_usage": true }));
            }
        }
        return Ok((info.upstream_model.clone(), body));
    }

    let mut canonical = request.canonical.clone();
    canonical.model.clone_from(&info.upstream_model);
    let payload = translate_request(&canonical, channel.format, &channel.options)?;
    Ok((payload.model().to_string(), payload.to_json()?))
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Adapt an upstream SSE byte stream for the client described by the guard.
///
/// The guard travels with the stream: it settles on normal completion, and
/// settles the partial usage if the client drops the stream early.
pub fn translate_stream<S, B, E>(bytes: S, policy: UsagePolicy, guard: SettleGuard) -> SseStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let client_format = guard.info().client_format;
    client_events(upstream_events(bytes, policy, guard), client_format)
}

/// Client events, or the error that ended the stream. An error is always the
/// last item.
type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>;

fn upstream_events<S, B, E>(bytes: S, policy: UsagePolicy, guard: SettleGuard) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    match guard.info().upstream_format {
        RelayFormat::Claude => Box::pin(from_claude(bytes, guard)),
        RelayFormat::Gemini => Box::pin(from_gemini(bytes, guard)),
        _ => Box::pin(from_openai(bytes, policy, guard)),
    }
}

/// Drop the terminal error once the stream is under way. Only an error the
/// upstream reported itself reaches the client, as one event in its format;
/// anything else just closes the stream.
fn client_events(items: EventStream, client: RelayFormat) -> SseStream {
    Box::pin(items.filter_map(move |item| {
        futures::future::ready(match item {
            Ok(event) => Some(event),
            Err(e @ RelayError::UpstreamProtocolError { .. }) => Some(error_event(&e, client)),
            Err(_) => None,
        })
    }))
}

/// Record the failure on the guard before the error is handed on.
fn stream_failure(guard: &mut SettleGuard, usage: Usage, err: &RelayError) {
    warn!(request_id = %guard.info().request_id, "Stopping stream: {err}");
    guard.update(usage);
    guard.fail(err);
}

fn from_openai<S, B, E>(
    bytes: S,
    policy: UsagePolicy,
    mut guard: SettleGuard,
) -> impl Stream<Item = Result<SseEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    async_stream::stream! {
        let info = guard.info().clone();
        let passthrough = info.is_passthrough();
        let mut sink = ClientSink::new(&info, policy);
        let mut events = Box::pin(bytes.eventsource());

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let e = RelayError::provider(format!("Upstream stream interrupted: {e}"));
                    stream_failure(&mut guard, sink.observed(), &e);
                    yield Err(e);
                    return;
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            let chunk = match parse_openai_chunk(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    stream_failure(&mut guard, sink.observed(), &e);
                    yield Err(e);
                    return;
                }
            };

            let out = if passthrough {
                sink.observe(&chunk);
                vec![SseEvent::data(data)]
            } else {
                sink.push(&chunk)
            };
            guard.update(sink.observed());
            for e in out {
                yield Ok(e);
            }
        }

        for e in sink.finish() {
            yield Ok(e);
        }
        guard.settle(sink.final_usage());
    }
}

fn from_claude<S, B, E>(bytes: S, mut guard: SettleGuard) -> impl Stream<Item = Result<SseEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    async_stream::stream! {
        let info = guard.info().clone();
        let mut ingest = ClaudeStreamIngest::new(&info.client_model, info.prompt_estimate);
        let mut sink = (!info.is_passthrough()).then(|| ClientSink::new(&info, UsagePolicy::default()));
        let mut events = Box::pin(bytes.eventsource());

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let e = RelayError::provider(format!("Upstream stream interrupted: {e}"));
                    stream_failure(&mut guard, ingest.usage(), &e);
                    yield Err(e);
                    return;
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }

            let out = match sink {
                Some(ref mut sink) => ingest.ingest(&event.event, &event.data).map(|parsed| {
                    parsed
                        .map(|parsed| {
                            ingest
                                .to_openai_chunks(&parsed)
                                .iter()
                                .flat_map(|chunk| sink.push(chunk))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                }),
                None => ingest
                    .passthrough(&event.event, &event.data)
                    .map(|data| vec![SseEvent::named(event.event.clone(), data)]),
            };

            match out {
                Ok(out) => {
                    guard.update(ingest.usage());
                    for e in out {
                        yield Ok(e);
                    }
                }
                Err(e) => {
                    stream_failure(&mut guard, ingest.usage(), &e);
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(ref mut sink) = sink {
            for e in sink.finish() {
                yield Ok(e);
            }
        }
        guard.settle(ingest.finalize_usage());
    }
}

fn from_gemini<S, B, E>(bytes: S, mut guard: SettleGuard) -> impl Stream<Item = Result<SseEvent>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    async_stream::stream! {
        let info = guard.info().clone();
        let mut ingest = GeminiStreamIngest::new(&info.client_model, info.prompt_estimate);
        let mut sink = (!info.is_passthrough()).then(|| ClientSink::new(&info, UsagePolicy::default()));
        let mut events = Box::pin(bytes.eventsource());

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let e = RelayError::provider(format!("Upstream stream interrupted: {e}"));
                    stream_failure(&mut guard, ingest.usage(), &e);
                    yield Err(e);
                    return;
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }

            let chunks = match ingest.ingest(data) {
                Ok(chunks) => chunks,
                Err(e) => {
                    stream_failure(&mut guard, ingest.usage(), &e);
                    yield Err(e);
                    return;
                }
            };
            guard.update(ingest.usage());

            let out = match sink {
                Some(ref mut sink) => chunks.iter().flat_map(|chunk| sink.push(chunk)).collect::<Vec<_>>(),
                None => vec![SseEvent::data(data)],
            };
            for e in out {
                yield Ok(e);
            }
        }

        if let Some(ref mut sink) = sink {
            for e in sink.finish() {
                yield Ok(e);
            }
        }
        guard.settle(ingest.finalize_usage());
    }
}

/// Parse an OpenAI stream payload, surfacing an embedded error object.
fn parse_openai_chunk(data: &str) -> Result<ChatCompletionChunk> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| RelayError::bad_upstream(format!("invalid openai stream chunk: {e}")))?;
    if let Some(err) = embedded_error(&value) {
        return Err(err);
    }
    serde_json::from_value(value)
        .map_err(|e| RelayError::bad_upstream(format!("invalid openai stream chunk: {e}")))
}

/// Error event in the client's stream format.
fn error_event(err: &RelayError, client: RelayFormat) -> SseEvent {
    let body = relay_error_body(err, client).to_string();
    match client {
        RelayFormat::Claude => SseEvent::named("error", body),
        _ => SseEvent::data(body),
    }
}

fn claude_event(event: &StreamEvent) -> Option<SseEvent> {
    serde_json::to_string(event)
        .ok()
        .map(|data| SseEvent::named(event.event_name(), data))
}

fn json_event<T: Serialize>(value: &T) -> Option<SseEvent> {
    serde_json::to_string(value).ok().map(SseEvent::data)
}

/// Writes OpenAI chunks out in the client's stream format.
enum SinkWriter {
    OpenAI { done: bool },
    Claude(StreamTranslator),
    Gemini(GeminiChunkWriter),
}

struct ClientSink {
    writer: SinkWriter,
    model: String,
    prompt_estimate: u64,
    policy: UsagePolicy,
    usage: Usage,
    text: String,
}

impl ClientSink {
    fn new(info: &RelayInfo, policy: UsagePolicy) -> Self {
        let writer = match info.client_format {
            RelayFormat::Claude => SinkWriter::Claude(
                StreamTranslator::new(&info.client_model, info.prompt_estimate).with_policy(policy),
            ),
            RelayFormat::Gemini => SinkWriter::Gemini(GeminiChunkWriter::new(&info.client_model)),
            _ => SinkWriter::OpenAI { done: false },
        };
        Self {
            writer,
            model: info.client_model.clone(),
            prompt_estimate: info.prompt_estimate,
            policy,
            usage: Usage::default(),
            text: String::new(),
        }
    }

    /// Track usage and generated text without writing anything.
    fn observe(&mut self, chunk: &ChatCompletionChunk) {
        if let Some(ref usage) = chunk.usage {
            self.usage.merge(&self.policy.read_openai(usage));
        }
        if let Some(choice) = chunk.choices.first() {
            let delta = &choice.delta;
            if let Some(ref t) = delta.reasoning_content {
                self.text.push_str(t);
            }
            if let Some(ref t) = delta.content {
                self.text.push_str(t);
            }
            for call in delta.tool_calls.iter().flatten() {
                if let Some(args) = call.function.as_ref().and_then(|f| f.arguments.as_deref()) {
                    self.text.push_str(args);
                }
            }
        }
    }

    fn push(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseEvent> {
        self.observe(chunk);
        match self.writer {
            SinkWriter::Claude(ref mut translator) => translator
                .process_chunk(chunk)
                .iter()
                .filter_map(claude_event)
                .collect(),
            SinkWriter::Gemini(ref mut writer) => writer
                .push(chunk)
                .and_then(|resp| json_event(&resp))
                .into_iter()
                .collect(),
            SinkWriter::OpenAI { done: true } => Vec::new(),
            SinkWriter::OpenAI { done: false } => {
                let mut chunk = chunk.clone();
                chunk.model.clone_from(&self.model);
                json_event(&chunk).into_iter().collect()
            }
        }
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        match self.writer {
            SinkWriter::Claude(ref mut translator) => {
                translator.finish().iter().filter_map(claude_event).collect()
            }
            SinkWriter::Gemini(ref mut writer) => writer
                .finish()
                .and_then(|resp| json_event(&resp))
                .into_iter()
                .collect(),
            SinkWriter::OpenAI { ref mut done } => {
                if *done {
                    return Vec::new();
                }
                *done = true;
                vec![SseEvent::data("[DONE]")]
            }
        }
    }

    /// Usage reported so far, without estimates.
    fn observed(&self) -> Usage {
        self.usage
    }

    fn final_usage(&self) -> Usage {
        if let SinkWriter::Claude(ref translator) = self.writer {
            return translator.usage();
        }
        let mut usage = self.usage;
        if usage.completion_tokens == 0 {
            usage.completion_tokens = tokenizer::count_tokens(&self.model, &self.text);
        }
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.prompt_estimate;
        }
        usage.finalized()
    }
}
