//! Ingestion of Claude SSE streams.
//!
//! [`ClaudeStreamIngest`] reads the `(event, data)` pairs of a Claude Messages
//! stream, from Anthropic or from a Bedrock-hosted Claude. Bedrock splits
//! `input_tokens` and the cache counters between `message_start` and
//! `message_delta`, so usage is merged across events and never reset by a
//! later zero. The accumulated usage is used three ways: written back into a
//! raw `message_delta` forwarded to a Claude client, attached to OpenAI
//! chunks for other clients, and handed to billing.

use std::collections::HashMap;

use serde_json::Value;

use super::anthropic_types::{Delta, ResponseContentBlock, StreamEvent};
use super::finish_reason;
use super::openai_types::{
    ChatCompletionChunk, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use super::response::{normalize_error_type, openai_id, unix_now};
use super::usage::Usage;
use crate::error::{RelayError, Result};
use crate::tokenizer;

/// Accumulator for one Claude stream.
#[derive(Debug)]
pub struct ClaudeStreamIngest {
    /// Model used for token estimation and reported to OpenAI clients.
    model: String,
    prompt_estimate: u64,
    response_id: String,
    response_model: String,
    created: u64,
    usage: Usage,
    response_text: String,
    /// Set by `message_delta` only.
    done: bool,
    stopped: bool,
    /// Claude block index -> OpenAI tool call index.
    tool_indices: HashMap<usize, u64>,
    next_tool_index: u64,
}

impl ClaudeStreamIngest {
    pub fn new(model: &str, prompt_estimate: u64) -> Self {
        Self {
            model: model.to_string(),
            prompt_estimate,
            response_id: String::new(),
            response_model: String::new(),
            created: unix_now(),
            usage: Usage::default(),
            response_text: String::new(),
            done: false,
            stopped: false,
            tool_indices: HashMap::new(),
            next_tool_index: 0,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    /// Model name the upstream reported in `message_start`.
    pub fn response_model(&self) -> &str {
        &self.response_model
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether `message_stop` was seen.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    /// Parse and absorb one SSE event. Returns `None` for events that carry
    /// nothing (empty data, pings).
    ///
    /// An upstream `error` event is returned as [`RelayError::UpstreamProtocolError`].
    pub fn ingest(&mut self, event: &str, data: &str) -> Result<Option<StreamEvent>> {
        let data = data.trim();
        if data.is_empty() || event == "ping" {
            return Ok(None);
        }

        let parsed: StreamEvent = serde_json::from_str(data).map_err(|e| {
            RelayError::bad_upstream(format!("invalid claude stream event `{event}`: {e}"))
        })?;

        match &parsed {
            StreamEvent::MessageStart { message } => {
                self.response_id.clone_from(&message.id);
                self.response_model.clone_from(&message.model);
                self.usage = Usage::from_claude(&message.usage);
            }
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } => self.response_text.push_str(text),
                Delta::ThinkingDelta { thinking } => self.response_text.push_str(thinking),
                _ => {}
            },
            StreamEvent::MessageDelta { usage, .. } => {
                self.usage.merge_claude_delta(usage);
                self.done = true;
            }
            StreamEvent::MessageStop => self.stopped = true,
            StreamEvent::Error { error } => {
                return Err(RelayError::upstream_protocol(
                    normalize_error_type(&error.error_type),
                    error.message.clone(),
                ));
            }
            StreamEvent::Ping => return Ok(None),
            _ => {}
        }

        Ok(Some(parsed))
    }

    /// Ingest an event and return the data to forward verbatim to a Claude
    /// client. Only `message_delta` is rewritten, see [`Self::patch_message_delta`].
    pub fn passthrough(&mut self, event: &str, data: &str) -> Result<String> {
        match self.ingest(event, data)? {
            Some(StreamEvent::MessageDelta { .. }) => self.patch_message_delta(data),
            _ => Ok(data.to_string()),
        }
    }

    /// Fill the usage counters a raw `message_delta` left out with the values
    /// accumulated so far. A present non-zero wire value is never replaced
    /// and all other fields keep their position and content.
    pub fn patch_message_delta(&self, raw: &str) -> Result<String> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::bad_upstream(format!("invalid message_delta: {e}")))?;

        let patches: [(&[&str], u64); 5] = [
            (&["usage", "input_tokens"], self.usage.prompt_tokens),
            (&["usage", "cache_read_input_tokens"], self.usage.cached_read_tokens),
            (
                &["usage", "cache_creation_input_tokens"],
                self.usage.cached_creation_tokens,
            ),
            (
                &["usage", "cache_creation", "ephemeral_5m_input_tokens"],
                self.usage.cache_creation_5m_tokens,
            ),
            (
                &["usage", "cache_creation", "ephemeral_1h_input_tokens"],
                self.usage.cache_creation_1h_tokens,
            ),
        ];

        for (path, accumulated) in patches {
            if accumulated == 0 {
                continue;
            }
            let on_wire = json_path(&value, path).and_then(Value::as_u64).unwrap_or(0);
            if on_wire == 0 {
                set_json_path(&mut value, path, Value::from(accumulated));
            }
        }

        Ok(serde_json::to_string(&value)?)
    }

    /// Final usage for billing and the client.
    ///
    /// Completion tokens are estimated from the streamed text when the
    /// upstream never reported them or the stream ended without a
    /// `message_delta`. Prompt tokens fall back to the request estimate.
    pub fn finalize_usage(&mut self) -> Usage {
        if self.usage.completion_tokens == 0 || !self.done {
            let estimate = tokenizer::count_tokens(&self.model, &self.response_text);
            self.usage.completion_tokens = self.usage.completion_tokens.max(estimate);
        }
        if self.usage.prompt_tokens == 0 {
            self.usage.prompt_tokens = self.prompt_estimate;
        }
        self.usage.finalize();
        self.usage
    }

    /// Convert an ingested event into OpenAI chunks.
    ///
    /// `message_start` becomes a role chunk, deltas become content, reasoning
    /// or tool-call deltas, and `message_delta` becomes a finish chunk followed
    /// by a usage-only chunk.
    pub fn to_openai_chunks(&mut self, event: &StreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            StreamEvent::MessageStart { .. } => vec![self.chunk(
                ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                    ..ChunkDelta::default()
                },
                None,
            )],
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(*index, tool_index);
                    vec![self.tool_chunk(ChunkToolCall {
                        index: Some(tool_index),
                        id: Some(id.clone()),
                        call_type: Some("function".to_string()),
                        function: Some(ChunkToolCallFunction {
                            name: Some(name.clone()),
                            arguments: Some(String::new()),
                        }),
                    })]
                }
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    vec![self.content_chunk(text)]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => vec![self.content_chunk(text)],
                Delta::ThinkingDelta { thinking } => vec![self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(thinking.clone()),
                        ..ChunkDelta::default()
                    },
                    None,
                )],
                Delta::InputJsonDelta { partial_json } => {
                    let Some(&tool_index) = self.tool_indices.get(index) else {
                        return Vec::new();
                    };
                    vec![self.tool_chunk(ChunkToolCall {
                        index: Some(tool_index),
                        function: Some(ChunkToolCallFunction {
                            name: None,
                            arguments: Some(partial_json.clone()),
                        }),
                        ..ChunkToolCall::default()
                    })]
                }
                _ => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, .. } => {
                let reason = delta
                    .stop_reason
                    .as_deref()
                    .map_or_else(|| "stop".to_string(), finish_reason::claude_to_openai);
                let finish = self.chunk(ChunkDelta::default(), Some(reason));
                let mut usage_chunk = ChatCompletionChunk::new(&self.chunk_id(), &self.model, self.created);
                usage_chunk.usage = Some(self.finalize_usage().to_openai());
                vec![finish, usage_chunk]
            }
            _ => Vec::new(),
        }
    }

    fn chunk_id(&self) -> String {
        if self.response_id.is_empty() {
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
        } else {
            openai_id(&self.response_id)
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.chunk_id(), &self.model, self.created)
            .with_delta(delta, finish_reason)
    }

    fn content_chunk(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                content: Some(text.to_string()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn tool_chunk(&self, call: ChunkToolCall) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![call]),
                ..ChunkDelta::default()
            },
            None,
        )
    }
}

fn json_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

/// Set `path` to `new`, creating intermediate objects as needed. Existing
/// keys keep their order; a non-object on the path is replaced.
pub fn set_json_path(value: &mut Value, path: &[&str], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        *value = new;
        return;
    };

    let mut cursor = value;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        cursor = match cursor {
            Value::Object(map) => map
                .entry((*key).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            _ => return,
        };
    }

    if !cursor.is_object() {
        *cursor = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert((*last).to_string(), new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const START: &str = r#"{"type":"message_start","message":{"id":"msg_01","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":100,"cache_read_input_tokens":30,"output_tokens":1}}}"#;

    fn feed(ingest: &mut ClaudeStreamIngest, events: &[(&str, Value)]) -> Vec<StreamEvent> {
        events
            .iter()
            .filter_map(|(name, data)| ingest.ingest(name, &data.to_string()).unwrap())
            .collect()
    }

    #[test]
    fn test_bedrock_split_usage_is_merged() {
        let mut ingest = ClaudeStreamIngest::new("claude-sonnet-4", 0);
        ingest.ingest("message_start", START).unwrap();
        ingest
            .ingest(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":200}}"#,
            )
            .unwrap();

        let usage = ingest.usage();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.cached_read_tokens, 30);
        assert_eq!(usage.completion_tokens, 200);
        assert!(ingest.is_done());
        assert_eq!(ingest.finalize_usage().total_tokens, 300);
    }

    #[test]
    fn test_message_start_captures_identity() {
        let mut ingest = ClaudeStreamIngest::new("claude-sonnet-4", 0);
        ingest.ingest("message_start", START).unwrap();
        assert_eq!(ingest.response_id(), "msg_01");
        assert_eq!(ingest.response_model(), "claude-sonnet-4");
        assert!(!ingest.is_done());
    }

    #[test]
    fn test_text_and_thinking_accumulate() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        feed(
            &mut ingest,
            &[
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Hmm. "}}),
                ),
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hello"}}),
                ),
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":1,"delta":{"type":"signature_delta","signature":"sig"}}),
                ),
            ],
        );
        assert_eq!(ingest.response_text(), "Hmm. Hello");
    }

    #[test]
    fn test_passthrough_patches_missing_usage() {
        let mut ingest = ClaudeStreamIngest::new("claude-sonnet-4", 0);
        ingest.passthrough("message_start", START).unwrap();
        let raw = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":200},"vendor_extra":{"a":1}}"#;
        let patched = ingest.passthrough("message_delta", raw).unwrap();
        let value: Value = serde_json::from_str(&patched).unwrap();

        assert_eq!(value["usage"]["input_tokens"], 100);
        assert_eq!(value["usage"]["cache_read_input_tokens"], 30);
        assert_eq!(value["usage"]["output_tokens"], 200);
        assert_eq!(value["vendor_extra"], json!({"a": 1}));
        assert!(value["usage"].get("cache_creation_input_tokens").is_none());
        // Field order is preserved.
        assert!(patched.starts_with(r#"{"type":"message_delta","delta":"#));
    }

    #[test]
    fn test_patch_never_overwrites_present_values() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        ingest.ingest("message_start", START).unwrap();
        let raw = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":120,"cache_read_input_tokens":0,"output_tokens":5}}"#;
        let patched = ingest.passthrough("message_delta", raw).unwrap();
        let value: Value = serde_json::from_str(&patched).unwrap();

        assert_eq!(value["usage"]["input_tokens"], 120);
        assert_eq!(value["usage"]["cache_read_input_tokens"], 30);
        assert_eq!(ingest.usage().prompt_tokens, 120);
    }

    #[test]
    fn test_patch_fills_cache_creation_split() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        let start = json!({
            "type": "message_start",
            "message": {
                "id": "msg_2", "type": "message", "role": "assistant", "content": [],
                "model": "m", "stop_reason": null, "stop_sequence": null,
                "usage": {
                    "input_tokens": 10, "output_tokens": 0,
                    "cache_creation_input_tokens": 8,
                    "cache_creation": {"ephemeral_5m_input_tokens": 5, "ephemeral_1h_input_tokens": 3}
                }
            }
        });
        ingest.ingest("message_start", &start.to_string()).unwrap();
        let patched = ingest
            .passthrough(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#,
            )
            .unwrap();
        let value: Value = serde_json::from_str(&patched).unwrap();
        assert_eq!(value["usage"]["cache_creation_input_tokens"], 8);
        assert_eq!(value["usage"]["cache_creation"]["ephemeral_5m_input_tokens"], 5);
        assert_eq!(value["usage"]["cache_creation"]["ephemeral_1h_input_tokens"], 3);
    }

    #[test]
    fn test_other_events_pass_through_verbatim() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        let raw = r#"{"type":"content_block_start","index":0,"content_block":{"type":"server_tool_use","id":"srv_1","name":"web_search"}}"#;
        assert_eq!(ingest.passthrough("content_block_start", raw).unwrap(), raw);
    }

    #[test]
    fn test_error_event_is_upstream_protocol_error() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        let err = ingest
            .ingest(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .unwrap_err();
        match err {
            RelayError::UpstreamProtocolError {
                error_type,
                message,
            } => {
                assert_eq!(error_type, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("expected upstream protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_data_is_bad_upstream() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        let err = ingest.ingest("content_block_delta", "{not json").unwrap_err();
        assert!(matches!(err, RelayError::BadUpstreamResponseBody { .. }));
    }

    #[test]
    fn test_ping_and_empty_data_are_skipped() {
        let mut ingest = ClaudeStreamIngest::new("m", 0);
        assert!(ingest.ingest("ping", r#"{"type":"ping"}"#).unwrap().is_none());
        assert!(ingest.ingest("message_start", "  ").unwrap().is_none());
    }

    #[test]
    fn test_missing_usage_is_estimated() {
        let mut ingest = ClaudeStreamIngest::new("claude-sonnet-4", 25);
        feed(
            &mut ingest,
            &[
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"A reasonably long answer."}}),
                ),
                ("message_stop", json!({"type":"message_stop"})),
            ],
        );
        assert!(ingest.is_stopped());
        assert!(!ingest.is_done());
        let usage = ingest.finalize_usage();
        assert_eq!(usage.prompt_tokens, 25);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn test_openai_chunks_for_text_and_tools() {
        let mut ingest = ClaudeStreamIngest::new("client-model", 0);
        let events = feed(
            &mut ingest,
            &[
                ("message_start", serde_json::from_str(START).unwrap()),
                (
                    "content_block_start",
                    json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
                ),
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me check."}}),
                ),
                ("content_block_stop", json!({"type":"content_block_stop","index":0})),
                (
                    "content_block_start",
                    json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"search","input":{}}}),
                ),
                (
                    "content_block_delta",
                    json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":1}"}}),
                ),
                ("content_block_stop", json!({"type":"content_block_stop","index":1})),
                (
                    "message_delta",
                    json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}),
                ),
                ("message_stop", json!({"type":"message_stop"})),
            ],
        );
        let chunks: Vec<ChatCompletionChunk> = events
            .iter()
            .flat_map(|e| ingest.to_openai_chunks(e))
            .collect();

        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0].id, "chatcmpl-01");
        assert_eq!(chunks[0].model, "client-model");
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Let me check."));

        let start = &chunks[2].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(start.index, Some(0));
        assert_eq!(start.id.as_deref(), Some("toolu_1"));
        let args = &chunks[3].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(args.index, Some(0));
        assert_eq!(
            args.function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"q\":1}")
        );

        assert_eq!(chunks[4].choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let usage = chunks[5].usage.as_ref().unwrap();
        assert!(chunks[5].choices.is_empty());
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total_tokens, 112);
    }

    #[test]
    fn test_set_json_path_creates_intermediates() {
        let mut value = json!({"usage": 3, "keep": true});
        set_json_path(&mut value, &["usage", "cache_creation", "x"], json!(1));
        assert_eq!(value, json!({"usage": {"cache_creation": {"x": 1}}, "keep": true}));
    }
}
