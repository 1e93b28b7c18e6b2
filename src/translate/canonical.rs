//! Format-independent chat request and the decoders that build it.
//!
//! Inbound bodies are decoded from `serde_json::Value` rather than straight
//! into typed wire structs: only `model` and the message list are required,
//! and a malformed optional field is dropped instead of failing the request.

use serde_json::{Map, Value};

use super::format::RelayFormat;
use crate::error::{RelayError, Result};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_DEVELOPER: &str = "developer";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRequest {
    /// Wire format the client spoke.
    pub source: RelayFormat,
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoiceSpec>,
    pub reasoning: Option<ReasoningRequest>,
    pub web_search: Option<WebSearchOptions>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: MessageBody,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image(ImageData),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: Option<String>,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageData {
    Url(String),
    Base64 { media_type: String, data: String },
}

/// A tool invocation. `arguments` is always the JSON-encoded argument object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoiceSpec {
    Auto,
    None,
    Required,
    Function(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningRequest {
    pub effort: Option<String>,
    pub budget_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebSearchOptions {
    pub search_context_size: Option<String>,
    pub user_location: Option<Value>,
}

impl CanonicalMessage {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageBody::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == ROLE_SYSTEM || self.role == ROLE_DEVELOPER
    }

    /// Content as a list of parts.
    #[must_use]
    pub fn parts(&self) -> Vec<ContentPart> {
        match &self.content {
            MessageBody::Text(t) if t.is_empty() => Vec::new(),
            MessageBody::Text(t) => vec![ContentPart::Text { text: t.clone() }],
            MessageBody::Parts(p) => p.clone(),
        }
    }

    /// All text parts joined with newlines.
    #[must_use]
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageBody::Text(t) => t.clone(),
            MessageBody::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ImageData {
    /// Split a `data:` URI into its media type and payload; any other URL is kept as-is.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((meta, data)) = rest.split_once(',') {
                if let Some(media_type) = meta.strip_suffix(";base64") {
                    return ImageData::Base64 {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    };
                }
            }
        }
        ImageData::Url(url.to_string())
    }

    #[must_use]
    pub fn to_url(&self) -> String {
        match self {
            ImageData::Url(url) => url.clone(),
            ImageData::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        }
    }
}

impl CanonicalRequest {
    /// Every piece of text in the request, used for prompt-token estimation.
    #[must_use]
    pub fn prompt_text(&self) -> String {
        let mut out = String::new();
        for msg in &self.messages {
            out.push_str(&msg.role);
            out.push('\n');
            for part in msg.parts() {
                match part {
                    ContentPart::Text { text } | ContentPart::Thinking { text, .. } => {
                        out.push_str(&text);
                    }
                    ContentPart::ToolResult { content, .. } => out.push_str(&content),
                    ContentPart::ToolUse { input, .. } => out.push_str(&input.to_string()),
                    ContentPart::Image(_) => {}
                }
                out.push('\n');
            }
            for call in &msg.tool_calls {
                out.push_str(&call.name);
                out.push_str(&call.arguments);
                out.push('\n');
            }
        }
        for tool in &self.tools {
            out.push_str(&tool.name);
            if let Some(ref d) = tool.description {
                out.push_str(d);
            }
            out.push_str(&tool.parameters.to_string());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn u64_field(obj: &Map<String, Value>, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

fn f64_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Arguments may arrive as a JSON string or as a native object.
fn arguments_string(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

fn required_model(obj: &Map<String, Value>) -> Result<String> {
    match obj.get("model").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => Ok(m.to_string()),
        _ => Err(RelayError::bad_request("missing required field `model`")),
    }
}

fn required_array<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>> {
    obj.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::bad_request(format!("missing required field `{key}`")))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| RelayError::bad_request(format!("{what} request body must be a JSON object")))
}

/// Parse the optional `user_location` object, tolerating a JSON-encoded string.
fn parse_user_location(v: Option<&Value>) -> Option<Value> {
    match v {
        Some(Value::Object(_)) => v.cloned(),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// OpenAI Chat Completions
// ---------------------------------------------------------------------------

/// Decode an OpenAI Chat Completions request body.
pub fn decode_openai(value: &Value) -> Result<CanonicalRequest> {
    let obj = as_object(value, "openai")?;
    let model = required_model(obj)?;
    let raw_messages = required_array(obj, "messages")?;

    let messages = raw_messages
        .iter()
        .filter_map(Value::as_object)
        .map(decode_openai_message)
        .collect();

    let tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| tools.iter().filter_map(decode_openai_tool).collect())
        .unwrap_or_default();

    let tool_choice = match obj.get("tool_choice") {
        Some(Value::String(s)) => match s.as_str() {
            "none" => Some(ToolChoiceSpec::None),
            "required" => Some(ToolChoiceSpec::Required),
            "auto" => Some(ToolChoiceSpec::Auto),
            _ => None,
        },
        Some(Value::Object(o)) => o
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|n| ToolChoiceSpec::Function(n.to_string())),
        _ => None,
    };

    let effort = str_field(obj, "reasoning_effort");
    let reasoning_obj = obj.get("reasoning").and_then(Value::as_object);
    let budget = reasoning_obj
        .and_then(|r| u64_field(r, "max_tokens"))
        .filter(|b| *b > 0);
    let effort = effort.or_else(|| reasoning_obj.and_then(|r| str_field(r, "effort")));
    let reasoning = (effort.is_some() || budget.is_some()).then(|| ReasoningRequest {
        effort,
        budget_tokens: budget,
    });

    let web_search = obj
        .get("web_search_options")
        .and_then(Value::as_object)
        .map(|ws| WebSearchOptions {
            search_context_size: str_field(ws, "search_context_size"),
            user_location: parse_user_location(ws.get("user_location")),
        });

    Ok(CanonicalRequest {
        source: RelayFormat::OpenAI,
        model,
        messages,
        max_tokens: u64_field(obj, "max_tokens").or_else(|| u64_field(obj, "max_completion_tokens")),
        temperature: f64_field(obj, "temperature"),
        top_p: f64_field(obj, "top_p"),
        top_k: u64_field(obj, "top_k"),
        stop: string_list(obj.get("stop")),
        stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
        tools,
        tool_choice,
        reasoning,
        web_search,
        user: str_field(obj, "user"),
    })
}

fn decode_openai_message(obj: &Map<String, Value>) -> CanonicalMessage {
    let role = str_field(obj, "role").unwrap_or_else(|| ROLE_USER.to_string());

    let content = match obj.get("content") {
        Some(Value::String(s)) => MessageBody::Text(s.clone()),
        Some(Value::Array(parts)) => {
            MessageBody::Parts(parts.iter().filter_map(decode_openai_part).collect())
        }
        _ => MessageBody::Text(String::new()),
    };

    let tool_calls = obj
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let function = c.get("function")?.as_object()?;
                    Some(ToolCall {
                        id: c.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                        name: str_field(function, "name")?,
                        arguments: arguments_string(function.get("arguments")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    CanonicalMessage {
        role,
        content,
        tool_calls,
        tool_call_id: str_field(obj, "tool_call_id"),
    }
}

fn decode_openai_part(part: &Value) -> Option<ContentPart> {
    let obj = part.as_object()?;
    match obj.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentPart::Text {
            text: str_field(obj, "text")?,
        }),
        "image_url" => {
            let url = match obj.get("image_url")? {
                Value::String(s) => s.clone(),
                Value::Object(o) => str_field(o, "url")?,
                _ => return None,
            };
            Some(ContentPart::Image(ImageData::from_url(&url)))
        }
        _ => None,
    }
}

fn decode_openai_tool(tool: &Value) -> Option<ToolSpec> {
    let function = tool.get("function")?.as_object()?;
    Some(ToolSpec {
        name: str_field(function, "name")?,
        description: str_field(function, "description"),
        parameters: function
            .get("parameters")
            .filter(|p| p.is_object())
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
    })
}

// ---------------------------------------------------------------------------
// Claude Messages
// ---------------------------------------------------------------------------

/// Decode an Anthropic Messages request body.
pub fn decode_claude(value: &Value) -> Result<CanonicalRequest> {
    let obj = as_object(value, "claude")?;
    let model = required_model(obj)?;
    let raw_messages = required_array(obj, "messages")?;

    let mut messages = Vec::new();

    let system_text = match obj.get("system") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if !system_text.is_empty() {
        messages.push(CanonicalMessage::text(ROLE_SYSTEM, system_text));
    }

    for msg in raw_messages.iter().filter_map(Value::as_object) {
        messages.push(decode_claude_message(msg));
    }

    let tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let t = t.as_object()?;
                    Some(ToolSpec {
                        name: str_field(t, "name")?,
                        description: str_field(t, "description"),
                        parameters: t.get("input_schema").filter(|s| s.is_object()).cloned()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = obj
        .get("tool_choice")
        .and_then(Value::as_object)
        .and_then(|tc| match tc.get("type").and_then(Value::as_str)? {
            "auto" => Some(ToolChoiceSpec::Auto),
            "any" => Some(ToolChoiceSpec::Required),
            "none" => Some(ToolChoiceSpec::None),
            "tool" => str_field(tc, "name").map(ToolChoiceSpec::Function),
            _ => None,
        });

    let reasoning = obj
        .get("thinking")
        .and_then(Value::as_object)
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("enabled"))
        .map(|t| ReasoningRequest {
            effort: None,
            budget_tokens: u64_field(t, "budget_tokens").filter(|b| *b > 0),
        });

    Ok(CanonicalRequest {
        source: RelayFormat::Claude,
        model,
        messages,
        max_tokens: u64_field(obj, "max_tokens"),
        temperature: f64_field(obj, "temperature"),
        top_p: f64_field(obj, "top_p"),
        top_k: u64_field(obj, "top_k"),
        stop: string_list(obj.get("stop_sequences")),
        stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
        tools,
        tool_choice,
        reasoning,
        web_search: None,
        user: obj
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_claude_message(obj: &Map<String, Value>) -> CanonicalMessage {
    let role = str_field(obj, "role").unwrap_or_else(|| ROLE_USER.to_string());

    let blocks = match obj.get("content") {
        Some(Value::String(s)) => return CanonicalMessage::text(&role, s.clone()),
        Some(Value::Array(blocks)) => blocks,
        _ => return CanonicalMessage::text(&role, String::new()),
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks.iter().filter_map(Value::as_object) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = str_field(block, "text") {
                    parts.push(ContentPart::Text { text });
                }
            }
            Some("image") => {
                if let Some(image) = block.get("source").and_then(decode_claude_image) {
                    parts.push(ContentPart::Image(image));
                }
            }
            Some("tool_use") => {
                let (Some(id), Some(name)) = (str_field(block, "id"), str_field(block, "name"))
                else {
                    continue;
                };
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: arguments_string(block.get("input")),
                });
            }
            Some("tool_result") => {
                let Some(tool_use_id) = str_field(block, "tool_use_id") else {
                    continue;
                };
                let content = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|i| i.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                parts.push(ContentPart::ToolResult {
                    tool_use_id,
                    name: None,
                    content,
                    is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                });
            }
            Some("thinking") => {
                if let Some(text) = str_field(block, "thinking") {
                    parts.push(ContentPart::Thinking {
                        text,
                        signature: str_field(block, "signature"),
                    });
                }
            }
            _ => {}
        }
    }

    CanonicalMessage {
        role,
        content: MessageBody::Parts(parts),
        tool_calls,
        tool_call_id: None,
    }
}

fn decode_claude_image(source: &Value) -> Option<ImageData> {
    let source = source.as_object()?;
    match source.get("type").and_then(Value::as_str)? {
        "base64" => Some(ImageData::Base64 {
            media_type: str_field(source, "media_type")?,
            data: str_field(source, "data")?,
        }),
        "url" => Some(ImageData::Url(str_field(source, "url")?)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Gemini generateContent
// ---------------------------------------------------------------------------

/// Decode a Gemini `generateContent` body. The model and the streaming flag
/// come from the request path, not the body.
pub fn decode_gemini(value: &Value, model: &str, stream: bool) -> Result<CanonicalRequest> {
    let obj = as_object(value, "gemini")?;
    if model.is_empty() {
        return Err(RelayError::bad_request("missing model in request path"));
    }
    let contents = required_array(obj, "contents")?;

    let mut messages = Vec::new();

    let system_text = obj
        .get("systemInstruction")
        .or_else(|| obj.get("system_instruction"))
        .and_then(|s| s.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if !system_text.is_empty() {
        messages.push(CanonicalMessage::text(ROLE_SYSTEM, system_text));
    }

    // Gemini has no call ids: pair each functionResponse with the oldest
    // outstanding functionCall of the same name.
    let mut pending: Vec<(String, String)> = Vec::new();
    let mut call_counter = 0usize;

    for content in contents.iter().filter_map(Value::as_object) {
        let role = match content.get("role").and_then(Value::as_str) {
            Some("model") | Some("assistant") => ROLE_ASSISTANT,
            _ => ROLE_USER,
        };
        let Some(raw_parts) = content.get("parts").and_then(Value::as_array) else {
            continue;
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for part in raw_parts.iter().filter_map(Value::as_object) {
            if let Some(text) = str_field(part, "text") {
                if part.get("thought").and_then(Value::as_bool) == Some(true) {
                    parts.push(ContentPart::Thinking {
                        text,
                        signature: str_field(part, "thoughtSignature"),
                    });
                } else {
                    parts.push(ContentPart::Text { text });
                }
            } else if let Some(inline) = part.get("inlineData").and_then(Value::as_object) {
                if let (Some(media_type), Some(data)) =
                    (str_field(inline, "mimeType"), str_field(inline, "data"))
                {
                    parts.push(ContentPart::Image(ImageData::Base64 { media_type, data }));
                }
            } else if let Some(file) = part.get("fileData").and_then(Value::as_object) {
                if let Some(uri) = str_field(file, "fileUri") {
                    parts.push(ContentPart::Image(ImageData::Url(uri)));
                }
            } else if let Some(call) = part.get("functionCall").and_then(Value::as_object) {
                let Some(name) = str_field(call, "name") else {
                    continue;
                };
                let id = str_field(call, "id").unwrap_or_else(|| {
                    call_counter += 1;
                    format!("call_{name}_{call_counter}")
                });
                pending.push((name.clone(), id.clone()));
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: arguments_string(call.get("args")),
                });
            } else if let Some(resp) = part.get("functionResponse").and_then(Value::as_object) {
                let Some(name) = str_field(resp, "name") else {
                    continue;
                };
                let id = str_field(resp, "id").unwrap_or_else(|| {
                    match pending.iter().position(|(n, _)| *n == name) {
                        Some(pos) => pending.remove(pos).1,
                        None => {
                            call_counter += 1;
                            format!("call_{name}_{call_counter}")
                        }
                    }
                });
                let content = match resp.get("response") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                tool_results.push(CanonicalMessage {
                    role: ROLE_TOOL.to_string(),
                    content: MessageBody::Text(content),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(id),
                });
            }
        }

        if !parts.is_empty() || !tool_calls.is_empty() {
            messages.push(CanonicalMessage {
                role: role.to_string(),
                content: MessageBody::Parts(parts),
                tool_calls,
                tool_call_id: None,
            });
        }
        messages.extend(tool_results);
    }

    let gen = obj.get("generationConfig").and_then(Value::as_object);

    let reasoning = gen
        .and_then(|g| g.get("thinkingConfig"))
        .and_then(Value::as_object)
        .and_then(|t| u64_field(t, "thinkingBudget"))
        .filter(|b| *b > 0)
        .map(|budget| ReasoningRequest {
            effort: None,
            budget_tokens: Some(budget),
        });

    let tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("functionDeclarations").and_then(Value::as_array))
                .flatten()
                .filter_map(|decl| {
                    let decl = decl.as_object()?;
                    Some(ToolSpec {
                        name: str_field(decl, "name")?,
                        description: str_field(decl, "description"),
                        parameters: decl
                            .get("parameters")
                            .filter(|p| p.is_object())
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = obj
        .get("toolConfig")
        .and_then(|t| t.get("functionCallingConfig"))
        .and_then(Value::as_object)
        .and_then(|cfg| {
            let allowed = string_list(cfg.get("allowedFunctionNames"));
            match cfg.get("mode").and_then(Value::as_str)? {
                "NONE" => Some(ToolChoiceSpec::None),
                "ANY" if allowed.len() == 1 => Some(ToolChoiceSpec::Function(allowed[0].clone())),
                "ANY" => Some(ToolChoiceSpec::Required),
                "AUTO" => Some(ToolChoiceSpec::Auto),
                _ => None,
            }
        });

    Ok(CanonicalRequest {
        source: RelayFormat::Gemini,
        model: model.to_string(),
        messages,
        max_tokens: gen.and_then(|g| u64_field(g, "maxOutputTokens")),
        temperature: gen.and_then(|g| f64_field(g, "temperature")),
        top_p: gen.and_then(|g| f64_field(g, "topP")),
        top_k: gen.and_then(|g| u64_field(g, "topK")),
        stop: string_list(gen.and_then(|g| g.get("stopSequences"))),
        stream,
        tools,
        tool_choice,
        reasoning,
        web_search: None,
        user: None,
    })
}
