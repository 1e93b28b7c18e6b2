//! Gemini `streamGenerateContent?alt=sse` chunk mapping.
//!
//! Gemini streams are a sequence of complete `GenerateContentResponse`
//! objects, one per `data:` line. Each chunk maps onto OpenAI chunks on its
//! own; only tool-call indices and usage are carried across the stream.
//! Function calls always arrive whole, never as argument fragments.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::finish_reason;
use super::gemini_types::{
    Candidate, FunctionCall, GeminiContent, GeminiPart, GenerateContentResponse,
};
use super::openai_types::{
    ChatCompletionChunk, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use super::response::{gemini_call_id, normalize_error_type, openai_id, unix_now};
use super::usage::Usage;
use crate::error::{RelayError, Result};
use crate::tokenizer;

// ---------------------------------------------------------------------------
// Gemini -> OpenAI
// ---------------------------------------------------------------------------

/// Reads a Gemini stream and produces OpenAI chunks.
#[derive(Debug)]
pub struct GeminiStreamIngest {
    model: String,
    prompt_estimate: u64,
    id: String,
    created: u64,
    usage: Usage,
    next_tool_index: u64,
    started: bool,
    finished: bool,
    response_text: String,
}

impl GeminiStreamIngest {
    pub fn new(model: &str, prompt_estimate: u64) -> Self {
        Self {
            model: model.to_string(),
            prompt_estimate,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: unix_now(),
            usage: Usage::default(),
            next_tool_index: 0,
            started: false,
            finished: false,
            response_text: String::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Usage reported so far.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Parse one `data:` payload. An `{"error": ...}` payload becomes
    /// [`RelayError::UpstreamProtocolError`].
    pub fn ingest(&mut self, data: &str) -> Result<Vec<ChatCompletionChunk>> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| RelayError::bad_upstream(format!("invalid gemini stream chunk: {e}")))?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let kind = error
                .get("status")
                .and_then(Value::as_str)
                .map_or_else(|| "api_error".to_string(), normalize_error_type);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("gemini stream error")
                .to_string();
            return Err(RelayError::upstream_protocol(kind, message));
        }
        let chunk: GenerateContentResponse = serde_json::from_value(value)
            .map_err(|e| RelayError::bad_upstream(format!("invalid gemini stream chunk: {e}")))?;
        Ok(self.chunk_to_openai(&chunk))
    }

    /// Map one Gemini chunk. Text, thoughts and function calls each become a
    /// delta chunk, in part order; a finish reason adds a finish chunk that
    /// carries the usage seen so far.
    pub fn chunk_to_openai(&mut self, chunk: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        if let Some(ref meta) = chunk.usage_metadata {
            self.usage.merge(&Usage::from_gemini(meta));
        }
        if let Some(ref id) = chunk.response_id {
            self.id = openai_id(id);
        }
        if self.finished {
            return Vec::new();
        }

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(self.chunk(
                ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                    ..ChunkDelta::default()
                },
                None,
            ));
        }

        let Some(candidate) = chunk.candidates.first() else {
            return out;
        };

        let mut saw_tools = false;
        for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
            if let Some(ref text) = part.text {
                if text.is_empty() {
                    continue;
                }
                self.response_text.push_str(text);
                let delta = if part.thought == Some(true) {
                    ChunkDelta {
                        reasoning_content: Some(text.clone()),
                        ..ChunkDelta::default()
                    }
                } else {
                    ChunkDelta {
                        content: Some(text.clone()),
                        ..ChunkDelta::default()
                    }
                };
                out.push(self.chunk(delta, None));
            } else if let Some(ref call) = part.function_call {
                saw_tools = true;
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                let arguments = call.args.to_string();
                self.response_text.push_str(&arguments);
                out.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ChunkToolCall {
                            index: Some(index),
                            id: Some(call.id.clone().unwrap_or_else(gemini_call_id)),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(call.name.clone()),
                                arguments: Some(arguments),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            let reason = if reason == "STOP" && (saw_tools || self.next_tool_index > 0) {
                "tool_calls".to_string()
            } else {
                finish_reason::gemini_to_openai(reason)
            };
            self.finished = true;
            let mut finish = self.chunk(ChunkDelta::default(), Some(reason));
            finish.usage = Some(self.finalize_usage().to_openai());
            out.push(finish);
        }

        out
    }

    /// Usage for billing, estimating whatever Gemini never reported.
    pub fn finalize_usage(&mut self) -> Usage {
        if self.usage.completion_tokens == 0 {
            self.usage.completion_tokens = tokenizer::count_tokens(&self.model, &self.response_text);
        }
        if self.usage.prompt_tokens == 0 {
            self.usage.prompt_tokens = self.prompt_estimate;
        }
        self.usage.finalize();
        self.usage
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.id, &self.model, self.created).with_delta(delta, finish_reason)
    }
}

// ---------------------------------------------------------------------------
// OpenAI -> Gemini
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Writes OpenAI chunks out as Gemini stream chunks.
///
/// OpenAI streams tool arguments in fragments while Gemini sends each call
/// whole, so tool calls are buffered until the finish chunk.
#[derive(Debug)]
pub struct GeminiChunkWriter {
    model: String,
    usage: Usage,
    pending: BTreeMap<u64, PendingCall>,
    finished: bool,
}

impl GeminiChunkWriter {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            usage: Usage::default(),
            pending: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Convert one OpenAI chunk. Returns `None` when the chunk has nothing
    /// Gemini clients can see yet.
    pub fn push(&mut self, chunk: &ChatCompletionChunk) -> Option<GenerateContentResponse> {
        let reported = chunk.usage.as_ref().map(Usage::from_openai);
        if let Some(ref usage) = reported {
            self.usage.merge(usage);
        }

        if self.finished {
            // Trailing usage-only chunk.
            return reported.map(|_| self.response(Vec::new(), None));
        }

        let mut parts = Vec::new();
        let mut finish = None;

        if let Some(choice) = chunk.choices.first() {
            let delta = &choice.delta;
            if let Some(thinking) = delta.reasoning_content.as_deref().filter(|s| !s.is_empty()) {
                parts.push(GeminiPart {
                    thought: Some(true),
                    ..GeminiPart::text(thinking)
                });
            }
            if let Some(text) = delta.content.as_deref().filter(|s| !s.is_empty()) {
                parts.push(GeminiPart::text(text));
            }
            for (position, call) in delta.tool_calls.iter().flatten().enumerate() {
                let index = call.index.unwrap_or(position as u64);
                let pending = self.pending.entry(index).or_default();
                if let Some(ref id) = call.id {
                    pending.id = Some(id.clone());
                }
                if let Some(ref function) = call.function {
                    if let Some(ref name) = function.name {
                        pending.name.push_str(name);
                    }
                    if let Some(ref args) = function.arguments {
                        pending.arguments.push_str(args);
                    }
                }
            }
            finish = choice.finish_reason.clone().filter(|r| !r.is_empty());
        }

        if let Some(ref reason) = finish {
            self.finished = true;
            parts.extend(self.flush_calls());
            return Some(self.response(parts, Some(finish_reason::openai_to_gemini(reason))));
        }

        if parts.is_empty() && reported.is_none() {
            return None;
        }
        Some(self.response(parts, None))
    }

    /// Close a stream that ended without a finish chunk.
    pub fn finish(&mut self) -> Option<GenerateContentResponse> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let parts = self.flush_calls();
        Some(self.response(parts, Some("STOP".to_string())))
    }

    fn flush_calls(&mut self) -> Vec<GeminiPart> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|call| {
                let args = match serde_json::from_str::<Value>(&call.arguments) {
                    Ok(v @ Value::Object(_)) => v,
                    _ => json!({}),
                };
                GeminiPart {
                    function_call: Some(FunctionCall {
                        id: call.id,
                        name: call.name,
                        args,
                    }),
                    ..GeminiPart::default()
                }
            })
            .collect()
    }

    fn response(&self, parts: Vec<GeminiPart>, finish_reason: Option<String>) -> GenerateContentResponse {
        let candidates = if parts.is_empty() && finish_reason.is_none() {
            Vec::new()
        } else {
            vec![Candidate {
                content: Some(GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason,
                index: 0,
            }]
        };
        GenerateContentResponse {
            candidates,
            usage_metadata: (!self.usage.is_empty()).then(|| self.usage.finalized().to_gemini()),
            model_version: Some(self.model.clone()),
            response_id: None,
        }
    }
}
