//! Non-streaming response translation.
//!
//! Every conversion pivots through the OpenAI [`ChatCompletionResponse`].
//! Usage is always re-read into the canonical [`Usage`] before it is written
//! back out in the client's vocabulary.

use serde_json::{json, Value};

use super::anthropic_types::{ErrorResponse, MessagesResponse, ResponseContentBlock};
use super::finish_reason;
use super::format::RelayFormat;
use super::gemini_types::{
    Candidate, FunctionCall, GeminiContent, GeminiError, GeminiErrorResponse, GeminiPart,
    GenerateContentResponse,
};
use super::openai_types::{
    ChatCompletionResponse, ChatError, ChatErrorResponse, ChatToolCall, ChatToolCallFunction,
    Choice, ChoiceMessage,
};
use super::usage::{Usage, UsagePolicy};
use crate::error::{RelayError, Result};

/// A client-ready response body and the usage it reports.
#[derive(Debug, Clone)]
pub struct TranslatedResponse {
    pub body: Value,
    pub usage: Usage,
}

pub(crate) fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

pub(crate) fn openai_id(id: &str) -> String {
    if id.starts_with("chatcmpl-") {
        id.to_string()
    } else {
        format!("chatcmpl-{}", id.trim_start_matches("msg_"))
    }
}

fn claude_id(id: &str) -> String {
    if id.starts_with("msg_") {
        id.to_string()
    } else {
        format!("msg_{}", id.trim_start_matches("chatcmpl-"))
    }
}

/// Translate a Claude Messages response into an OpenAI chat completion.
pub fn claude_to_openai(resp: &MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ResponseContentBlock::Text { text: t } => text.push_str(t),
            ResponseContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ResponseContentBlock::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ResponseContentBlock::Unknown => {}
        }
    }

    let finish = resp
        .stop_reason
        .as_deref()
        .map_or_else(|| "stop".to_string(), finish_reason::claude_to_openai);

    ChatCompletionResponse {
        id: openai_id(&resp.id),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish),
        }],
        usage: Some(Usage::from_claude(&resp.usage).to_openai()),
    }
}

/// Translate an OpenAI chat completion into a Claude Messages response.
/// `model` is the name the client asked for.
pub fn openai_to_claude(resp: &ChatCompletionResponse, model: &str) -> MessagesResponse {
    let choice = resp.choices.first();
    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(c) = choice {
        if let Some(ref reasoning) = c.message.reasoning_content {
            if !reasoning.is_empty() {
                content.push(ResponseContentBlock::Thinking {
                    thinking: reasoning.clone(),
                    signature: None,
                });
            }
        }

        if let Some(ref text) = c.message.content {
            if !text.is_empty() {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }
        }

        if let Some(ref tool_calls) = c.message.tool_calls {
            for tc in tool_calls {
                let input = serde_json::from_str::<Value>(&tc.function.arguments)
                    .unwrap_or_else(|_| Value::String(tc.function.arguments.clone()));
                content.push(ResponseContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input,
                });
            }
        }
    }

    // Claude clients expect at least one block.
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map_or_else(|| "end_turn".to_string(), finish_reason::openai_to_claude);

    let usage = resp
        .usage
        .as_ref()
        .map(Usage::from_openai)
        .unwrap_or_default();

    MessagesResponse {
        id: claude_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: usage.to_claude(),
    }
}

/// Translate a Gemini response into an OpenAI chat completion.
pub fn gemini_to_openai(resp: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let candidate = resp.candidates.first();

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    if let Some(content) = candidate.and_then(|c| c.content.as_ref()) {
        for part in &content.parts {
            if let Some(ref t) = part.text {
                if part.thought == Some(true) {
                    reasoning.push_str(t);
                } else {
                    text.push_str(t);
                }
            } else if let Some(ref call) = part.function_call {
                tool_calls.push(ChatToolCall {
                    id: call.id.clone().unwrap_or_else(gemini_call_id),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                });
            }
        }
    }

    let finish = match candidate.and_then(|c| c.finish_reason.as_deref()) {
        // Gemini reports STOP even when it called a function.
        Some("STOP") | None if !tool_calls.is_empty() => "tool_calls".to_string(),
        Some(reason) => finish_reason::gemini_to_openai(reason),
        None => "stop".to_string(),
    };

    let id = resp
        .response_id
        .clone()
        .map_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()), |id| openai_id(&id));

    ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish),
        }],
        usage: resp
            .usage_metadata
            .as_ref()
            .map(|u| Usage::from_gemini(u).to_openai()),
    }
}

pub(crate) fn gemini_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Translate an OpenAI chat completion into a Gemini response.
pub fn openai_to_gemini(resp: &ChatCompletionResponse, model: &str) -> GenerateContentResponse {
    let choice = resp.choices.first();
    let mut parts = Vec::new();

    if let Some(c) = choice {
        if let Some(ref reasoning) = c.message.reasoning_content {
            if !reasoning.is_empty() {
                parts.push(GeminiPart {
                    thought: Some(true),
                    ..GeminiPart::text(reasoning.clone())
                });
            }
        }
        if let Some(ref text) = c.message.content {
            if !text.is_empty() {
                parts.push(GeminiPart::text(text.clone()));
            }
        }
        for tc in c.message.tool_calls.iter().flatten() {
            let args = match serde_json::from_str::<Value>(&tc.function.arguments) {
                Ok(v @ Value::Object(_)) => v,
                _ => json!({}),
            };
            parts.push(GeminiPart {
                function_call: Some(FunctionCall {
                    id: Some(tc.id.clone()),
                    name: tc.function.name.clone(),
                    args,
                }),
                ..GeminiPart::default()
            });
        }
    }

    let finish = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map_or_else(|| "STOP".to_string(), finish_reason::openai_to_gemini);

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(GeminiContent {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason: Some(finish),
            index: 0,
        }],
        usage_metadata: resp.usage.as_ref().map(|u| Usage::from_openai(u).to_gemini()),
        model_version: Some(model.to_string()),
        response_id: Some(resp.id.clone()),
    }
}

// ---------------------------------------------------------------------------
// Full body translation
// ---------------------------------------------------------------------------

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::bad_upstream(format!("invalid {what} response: {e}")))
}

/// An error object embedded in a successful upstream response.
pub(crate) fn embedded_error(value: &Value) -> Option<RelayError> {
    let is_claude_error = value.get("type").and_then(Value::as_str) == Some("error");
    let error = value.get("error").filter(|e| !e.is_null())?;
    if !is_claude_error && value.get("choices").is_some() {
        return None;
    }
    let (kind, message) = error_fields(error);
    Some(RelayError::upstream_protocol(kind, message))
}

fn error_fields(error: &Value) -> (String, String) {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_string);
    let kind = error
        .get("type")
        .or_else(|| error.get("status"))
        .and_then(Value::as_str)
        .map_or_else(|| "api_error".to_string(), normalize_error_type);
    (kind, message)
}

/// Translate a complete upstream body into the client's format.
///
/// `client_model` is the model name the client asked for; translated bodies
/// report it instead of the upstream name. Same-format pairs pass the body
/// through untouched.
pub fn translate_response(
    body: &[u8],
    upstream: RelayFormat,
    client: RelayFormat,
    client_model: &str,
    policy: &UsagePolicy,
) -> Result<TranslatedResponse> {
    if !upstream.is_chat() {
        return Err(RelayError::unsupported(client, upstream));
    }
    if !client.is_chat() {
        return Err(RelayError::unsupported(upstream, client));
    }

    let raw: Value = parse_body(body, upstream.as_str())?;
    if let Some(err) = embedded_error(&raw) {
        return Err(err);
    }

    // Same format: report usage but leave the body alone.
    if upstream == client {
        let usage = match upstream {
            RelayFormat::Claude => {
                Usage::from_claude(&parse_body::<MessagesResponse>(body, "claude")?.usage)
            }
            RelayFormat::Gemini => parse_body::<GenerateContentResponse>(body, "gemini")?
                .usage_metadata
                .as_ref()
                .map(Usage::from_gemini)
                .unwrap_or_default(),
            _ => parse_body::<ChatCompletionResponse>(body, "openai")?
                .usage
                .as_ref()
                .map(|u| policy.read_openai(u))
                .unwrap_or_default(),
        };
        return Ok(TranslatedResponse {
            body: raw,
            usage: usage.finalized(),
        });
    }

    let (pivot, usage) = match upstream {
        RelayFormat::Claude => {
            let resp: MessagesResponse = parse_body(body, "claude")?;
            let usage = Usage::from_claude(&resp.usage);
            (claude_to_openai(&resp), usage)
        }
        RelayFormat::Gemini => {
            let resp: GenerateContentResponse = parse_body(body, "gemini")?;
            let usage = resp
                .usage_metadata
                .as_ref()
                .map(Usage::from_gemini)
                .unwrap_or_default();
            (gemini_to_openai(&resp, client_model), usage)
        }
        _ => {
            let resp: ChatCompletionResponse = parse_body(body, "openai")?;
            let usage = resp
                .usage
                .as_ref()
                .map(|u| policy.read_openai(u))
                .unwrap_or_default();
            (resp, usage)
        }
    };
    let usage = usage.finalized();

    let body = match client {
        RelayFormat::Claude => {
            let mut resp = openai_to_claude(&pivot, client_model);
            resp.usage = usage.to_claude();
            serde_json::to_value(resp)?
        }
        RelayFormat::Gemini => {
            let mut resp = openai_to_gemini(&pivot, client_model);
            resp.usage_metadata = Some(usage.to_gemini());
            serde_json::to_value(resp)?
        }
        _ => {
            let mut resp = pivot;
            resp.model = client_model.to_string();
            let cost = resp.usage.as_ref().and_then(|u| u.cost);
            resp.usage = Some(super::openai_types::ChatUsage {
                cost,
                ..usage.to_openai()
            });
            serde_json::to_value(resp)?
        }
    };

    Ok(TranslatedResponse { body, usage })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Map provider error vocabularies onto the Claude/OpenAI error type names.
pub(crate) fn normalize_error_type(kind: &str) -> String {
    match kind {
        "rate_limit_exceeded" | "RESOURCE_EXHAUSTED" => "rate_limit_error",
        "server_error" | "internal_error" | "INTERNAL" | "UNKNOWN" => "api_error",
        "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => "invalid_request_error",
        "UNAUTHENTICATED" | "invalid_api_key" => "authentication_error",
        "PERMISSION_DENIED" => "permission_error",
        "NOT_FOUND" => "not_found_error",
        "UNAVAILABLE" => "overloaded_error",
        other => other,
    }
    .to_string()
}

fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 | 413 | 422 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn grpc_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        503 | 529 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// An error object in the shape `format` clients expect.
#[must_use]
pub fn error_for_format(format: RelayFormat, kind: &str, message: &str, status: u16) -> Value {
    let value = match format {
        RelayFormat::Claude => serde_json::to_value(ErrorResponse::new(kind, message)),
        RelayFormat::Gemini => serde_json::to_value(GeminiErrorResponse {
            error: GeminiError {
                code: status,
                message: message.to_string(),
                status: grpc_status(status).to_string(),
            },
        }),
        _ => serde_json::to_value(ChatErrorResponse {
            error: ChatError {
                message: message.to_string(),
                error_type: kind.to_string(),
                code: None,
            },
        }),
    };
    value.unwrap_or_else(|_| json!({ "error": { "type": kind, "message": message } }))
}

/// A relay error as a client-facing error object.
#[must_use]
pub fn relay_error_body(err: &RelayError, format: RelayFormat) -> Value {
    error_for_format(format, err.wire_type(), &err.client_message(), err.status_code())
}

/// Re-shape an upstream error body (any format) for the client.
#[must_use]
pub fn translate_upstream_error(status: u16, body: &[u8], format: RelayFormat) -> Value {
    let parsed = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_fields));
    let (kind, message) = parsed.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        let message = if text.trim().is_empty() {
            format!("upstream returned status {status}")
        } else {
            text.chars().take(2000).collect()
        };
        (error_type_for_status(status).to_string(), message)
    });
    error_for_format(format, &kind, &message, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::anthropic_types;
    use crate::translate::gemini_types::UsageMetadata;
    use crate::translate::openai_types::*;
    use crate::translate::usage::ModelPrice;

    fn make_response(content: Option<String>, finish_reason: Option<String>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-abc123".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason,
            }],
            usage: Some(ChatUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
                ..ChatUsage::default()
            }),
        }
    }

    fn claude_response(content: Vec<ResponseContentBlock>, stop: &str) -> MessagesResponse {
        MessagesResponse {
            id: "msg_01".to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: "claude-sonnet-4".to_string(),
            stop_reason: Some(stop.to_string()),
            stop_sequence: None,
            usage: anthropic_types::Usage {
                input_tokens: 100,
                output_tokens: 40,
                cache_read_input_tokens: Some(30),
                ..anthropic_types::Usage::default()
            },
        }
    }

    #[test]
    fn test_simple_text_response() {
        let resp = make_response(Some("Hello!".to_string()), Some("stop".to_string()));
        let result = openai_to_claude(&resp, "claude-sonnet-4-20250514");

        assert_eq!(result.id, "msg_abc123");
        assert_eq!(result.model, "claude-sonnet-4-20250514");
        assert_eq!(result.stop_reason, Some("end_turn".to_string()));
        assert_eq!(
            result.content,
            vec![ResponseContentBlock::Text {
                text: "Hello!".to_string()
            }]
        );
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 20);
    }

    #[test]
    fn test_tool_call_arguments_fall_back_to_raw_string() {
        let mut resp = make_response(Some("Let me check.".to_string()), Some("tool_calls".to_string()));
        resp.choices[0].message.tool_calls = Some(vec![
            ChatToolCall {
                id: "call_abc".to_string(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: "get_weather".to_string(),
                    arguments: "{\"city\":\"London\"}".to_string(),
                },
            },
            ChatToolCall {
                id: "call_def".to_string(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: "broken".to_string(),
                    arguments: "{\"city\":".to_string(),
                },
            },
        ]);

        let result = openai_to_claude(&resp, "test-model");
        assert_eq!(result.content.len(), 3);
        assert_eq!(result.stop_reason.as_deref(), Some("tool_use"));
        match &result.content[1] {
            ResponseContentBlock::ToolUse { input, .. } => assert_eq!(input["city"], "London"),
            other => panic!("expected tool_use, got {other:?}"),
        }
        match &result.content[2] {
            ResponseContentBlock::ToolUse { input, .. } => {
                assert_eq!(input, &Value::String("{\"city\":".to_string()));
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn test_reasoning_becomes_leading_thinking_block() {
        let mut resp = make_response(Some("42".to_string()), Some("stop".to_string()));
        resp.choices[0].message.reasoning_content = Some("let me think".to_string());
        let result = openai_to_claude(&resp, "m");
        assert!(matches!(result.content[0], ResponseContentBlock::Thinking { .. }));
        assert!(matches!(result.content[1], ResponseContentBlock::Text { .. }));
    }

    #[test]
    fn test_claude_to_openai_collects_blocks() {
        let resp = claude_response(
            vec![
                ResponseContentBlock::Thinking {
                    thinking: "hmm".to_string(),
                    signature: Some("sig".to_string()),
                },
                ResponseContentBlock::Text {
                    text: "Sure.".to_string(),
                },
                ResponseContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "lookup".to_string(),
                    input: json!({"q": "rust"}),
                },
            ],
            "tool_use",
        );
        let out = claude_to_openai(&resp);
        let choice = &out.choices[0];

        assert_eq!(out.id, "chatcmpl-01");
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.content.as_deref(), Some("Sure."));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);

        let usage = out.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.prompt_tokens_details.unwrap().cached_tokens, 30);
    }

    #[test]
    fn test_gemini_function_call_sets_tool_calls_finish() {
        let resp = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![GeminiPart {
                        function_call: Some(FunctionCall {
                            id: None,
                            name: "get_weather".to_string(),
                            args: json!({"city": "Oslo"}),
                        }),
                        ..GeminiPart::default()
                    }],
                }),
                finish_reason: Some("STOP".to_string()),
                index: 0,
            }],
            usage_metadata: Some(UsageMetadata {
                prompt_token_count: 12,
                candidates_token_count: 5,
                total_token_count: 17,
                ..UsageMetadata::default()
            }),
            ..GenerateContentResponse::default()
        };
        let out = gemini_to_openai(&resp, "gemini-2.5-flash");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let calls = out.choices[0].message.tool_calls.as_ref().unwrap();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(out.usage.unwrap().completion_tokens, 5);
    }

    #[test]
    fn test_openai_to_gemini_shape() {
        let mut resp = make_response(Some("hi".to_string()), Some("length".to_string()));
        resp.choices[0].message.reasoning_content = Some("thinking".to_string());
        let out = openai_to_gemini(&resp, "gemini-2.5-pro");
        let candidate = &out.candidates[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("MAX_TOKENS"));
        let parts = &candidate.content.as_ref().unwrap().parts;
        assert_eq!(parts[0].thought, Some(true));
        assert_eq!(parts[1].text.as_deref(), Some("hi"));
        assert_eq!(out.usage_metadata.unwrap().prompt_token_count, 10);
    }

    #[test]
    fn test_translate_response_claude_to_gemini_pivots() {
        let body = serde_json::to_vec(&claude_response(
            vec![ResponseContentBlock::Text {
                text: "hello".to_string(),
            }],
            "end_turn",
        ))
        .unwrap();
        let out = translate_response(
            &body,
            RelayFormat::Claude,
            RelayFormat::Gemini,
            "gemini-2.5-pro",
            &UsagePolicy::default(),
        )
        .unwrap();
        assert_eq!(out.body["candidates"][0]["content"]["parts"][0]["text"], "hello");
        assert_eq!(out.body["candidates"][0]["finishReason"], "STOP");
        assert_eq!(out.usage.total_tokens, 140);
        assert_eq!(out.usage.cached_read_tokens, 30);
    }

    #[test]
    fn test_translate_response_applies_openrouter_estimate() {
        let mut resp = make_response(Some("ok".to_string()), Some("stop".to_string()));
        resp.usage = Some(ChatUsage {
            prompt_tokens: 1000,
            completion_tokens: 100,
            total_tokens: 1100,
            cost: Some((600.0 * 3.0 + 400.0 * 3.75 + 100.0 * 15.0) / 1_000_000.0),
            ..ChatUsage::default()
        });
        let body = serde_json::to_vec(&resp).unwrap();
        let policy = UsagePolicy {
            openrouter: true,
            price: Some(ModelPrice {
                input: 3.0,
                output: 15.0,
                cache_read: 0.3,
                cache_write: 3.75,
            }),
            custom_price_override: false,
        };

        let out = translate_response(
            &body,
            RelayFormat::OpenAI,
            RelayFormat::Claude,
            "claude-sonnet-4",
            &policy,
        )
        .unwrap();
        assert_eq!(out.usage.cached_creation_tokens, 400);
        assert_eq!(out.body["usage"]["cache_creation_input_tokens"], 400);
        assert_eq!(out.body["model"], "claude-sonnet-4");
    }

    #[test]
    fn test_translate_response_same_format_passes_through() {
        let body = br#"{"id":"chatcmpl-1","choices":[{"index":0,"message":{"role":"assistant","content":"x"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7},"system_fingerprint":"fp"}"#;
        let out = translate_response(
            body,
            RelayFormat::OpenAI,
            RelayFormat::OpenAI,
            "gpt-4o",
            &UsagePolicy::default(),
        )
        .unwrap();
        assert_eq!(out.body["system_fingerprint"], "fp");
        assert_eq!(out.usage.total_tokens, 7);
    }

    #[test]
    fn test_translate_response_rejects_garbage_and_embedded_errors() {
        let err = translate_response(
            b"not json",
            RelayFormat::OpenAI,
            RelayFormat::Claude,
            "m",
            &UsagePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::BadUpstreamResponseBody { .. }));

        let err = translate_response(
            br#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
            RelayFormat::Claude,
            RelayFormat::OpenAI,
            "m",
            &UsagePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RelayError::UpstreamProtocolError { ref error_type, .. } if error_type == "overloaded_error"
        ));
    }

    #[test]
    fn test_error_shapes_per_format() {
        let claude = error_for_format(RelayFormat::Claude, "invalid_request_error", "bad", 400);
        assert_eq!(claude["type"], "error");
        assert_eq!(claude["error"]["type"], "invalid_request_error");

        let openai = error_for_format(RelayFormat::OpenAI, "invalid_request_error", "bad", 400);
        assert_eq!(openai["error"]["message"], "bad");

        let gemini = error_for_format(RelayFormat::Gemini, "invalid_request_error", "bad", 400);
        assert_eq!(gemini["error"]["code"], 400);
        assert_eq!(gemini["error"]["status"], "INVALID_ARGUMENT");
    }

    #[test]
    fn test_upstream_error_is_reshaped_for_client() {
        let body = br#"{"error":{"message":"Quota exceeded","type":"rate_limit_exceeded"}}"#;
        let out = translate_upstream_error(429, body, RelayFormat::Claude);
        assert_eq!(out["error"]["type"], "rate_limit_error");
        assert_eq!(out["error"]["message"], "Quota exceeded");

        let gemini = br#"{"error":{"code":400,"message":"bad field","status":"INVALID_ARGUMENT"}}"#;
        let out = translate_upstream_error(400, gemini, RelayFormat::OpenAI);
        assert_eq!(out["error"]["type"], "invalid_request_error");

        let out = translate_upstream_error(503, b"", RelayFormat::OpenAI);
        assert_eq!(out["error"]["type"], "api_error");
        assert_eq!(out["error"]["message"], "upstream returned status 503");
    }
}
