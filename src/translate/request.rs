//! Translate a [`CanonicalRequest`] into the payload an upstream expects.
//!
//! Claude targets need the most rewriting: system prompts move into `system`,
//! consecutive turns of the same role are merged, tool results ride on `user`
//! messages, and reasoning knobs become an explicit thinking budget.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Metadata, Role,
    SystemContent, ThinkingConfig, Tool, ToolChoice, ToolResultContent,
};
use super::canonical::{
    CanonicalMessage, CanonicalRequest, ContentPart, ImageData, MessageBody, ToolChoiceSpec,
    ToolSpec, WebSearchOptions, ROLE_ASSISTANT, ROLE_TOOL,
};
use super::format::RelayFormat;
use super::gemini_types::{
    FileData, FunctionCall, FunctionDeclaration, FunctionResponse, GeminiContent, GeminiPart,
    GeminiThinkingConfig, GeminiTool, GenerateContentRequest, GenerationConfig, InlineData,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart as ChatPart, ImageUrlDetail, StreamOptions,
};
use crate::error::{RelayError, Result};

pub const THINKING_SUFFIX: &str = "-thinking";

/// Smallest thinking budget Claude accepts.
pub const MIN_THINKING_TOKENS: u64 = 1280;

/// Claude requires `max_tokens`; used when the client sent none.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslateOptions {
    /// Share of `max_tokens` given to thinking for `-thinking` models.
    pub thinking_budget_percentage: f64,
    /// Forward the `-thinking` suffix in the upstream model name.
    pub keep_thinking_suffix: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            thinking_budget_percentage: 0.6,
            keep_thinking_suffix: false,
        }
    }
}

/// A request body ready to be sent upstream.
#[derive(Debug, Clone)]
pub enum UpstreamPayload {
    OpenAI(ChatCompletionRequest),
    Claude(MessagesRequest),
    /// Gemini carries the model in the URL, not the body.
    Gemini {
        model: String,
        request: GenerateContentRequest,
    },
}

impl UpstreamPayload {
    #[must_use]
    pub fn format(&self) -> RelayFormat {
        match self {
            UpstreamPayload::OpenAI(_) => RelayFormat::OpenAI,
            UpstreamPayload::Claude(_) => RelayFormat::Claude,
            UpstreamPayload::Gemini { .. } => RelayFormat::Gemini,
        }
    }

    /// Model name as sent upstream.
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            UpstreamPayload::OpenAI(r) => &r.model,
            UpstreamPayload::Claude(r) => &r.model,
            UpstreamPayload::Gemini { model, .. } => model,
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            UpstreamPayload::OpenAI(r) => serde_json::to_value(r)?,
            UpstreamPayload::Claude(r) => serde_json::to_value(r)?,
            UpstreamPayload::Gemini { request, .. } => serde_json::to_value(request)?,
        })
    }
}

/// Translate a canonical request into the payload for `target`.
pub fn translate_request(
    req: &CanonicalRequest,
    target: RelayFormat,
    opts: &TranslateOptions,
) -> Result<UpstreamPayload> {
    match target {
        RelayFormat::Claude => Ok(UpstreamPayload::Claude(to_claude(req, opts))),
        RelayFormat::OpenAI => Ok(UpstreamPayload::OpenAI(to_openai(req))),
        RelayFormat::Gemini => {
            let (model, request) = to_gemini(req, opts);
            Ok(UpstreamPayload::Gemini { model, request })
        }
        other => Err(RelayError::unsupported(req.source, other)),
    }
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThinkingPlan {
    model: String,
    max_tokens: u64,
    budget: Option<u64>,
}

fn effort_to_budget(effort: &str) -> Option<u64> {
    match effort {
        "low" => Some(1280),
        "medium" => Some(2048),
        "high" => Some(4096),
        _ => None,
    }
}

/// Claude budget to OpenAI `reasoning_effort`.
#[must_use]
pub fn budget_to_effort(budget: u64) -> &'static str {
    if budget <= 1280 {
        "low"
    } else if budget <= 2048 {
        "medium"
    } else {
        "high"
    }
}

fn plan_thinking(req: &CanonicalRequest, opts: &TranslateOptions) -> ThinkingPlan {
    let mut max_tokens = req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let mut budget = None;

    let base = req.model.strip_suffix(THINKING_SUFFIX);
    if base.is_some() {
        max_tokens = max_tokens.max(MIN_THINKING_TOKENS);
        budget = Some((max_tokens as f64 * opts.thinking_budget_percentage).ceil() as u64);
    }

    if let Some(ref reasoning) = req.reasoning {
        if let Some(b) = reasoning.effort.as_deref().and_then(effort_to_budget) {
            budget = Some(b);
        }
        if let Some(b) = reasoning.budget_tokens.filter(|b| *b > 0) {
            budget = Some(b);
        }
    }

    let model = match base {
        Some(base) if !opts.keep_thinking_suffix => base.to_string(),
        _ => req.model.clone(),
    };

    ThinkingPlan {
        model,
        max_tokens,
        budget,
    }
}

/// Tool arguments as an object; anything else becomes `{}`.
fn parse_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(v @ Value::Object(_)) => v,
        _ => json!({}),
    }
}

fn body_parts(body: &MessageBody) -> Vec<ContentPart> {
    match body {
        MessageBody::Text(t) if t.is_empty() => Vec::new(),
        MessageBody::Text(t) => vec![ContentPart::Text { text: t.clone() }],
        MessageBody::Parts(p) => p.clone(),
    }
}

fn merge_bodies(a: &MessageBody, b: &MessageBody) -> MessageBody {
    match (a, b) {
        (MessageBody::Text(x), MessageBody::Text(y)) => {
            let joined = [x.trim(), y.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            MessageBody::Text(joined)
        }
        _ => {
            let mut parts = body_parts(a);
            parts.extend(body_parts(b));
            MessageBody::Parts(parts)
        }
    }
}

/// Merge consecutive non-tool messages that share a role.
fn merge_consecutive<'a>(
    messages: impl Iterator<Item = &'a CanonicalMessage>,
) -> Vec<CanonicalMessage> {
    let mut out: Vec<CanonicalMessage> = Vec::new();
    for msg in messages {
        if let Some(last) = out.last_mut() {
            if last.role == msg.role && msg.role != ROLE_TOOL {
                last.content = merge_bodies(&last.content, &msg.content);
                last.tool_calls.extend(msg.tool_calls.iter().cloned());
                continue;
            }
        }
        out.push(msg.clone());
    }
    out
}

fn system_text(req: &CanonicalRequest) -> String {
    req.messages
        .iter()
        .filter(|m| m.is_system())
        .map(CanonicalMessage::text_content)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

fn to_claude(req: &CanonicalRequest, opts: &TranslateOptions) -> MessagesRequest {
    let plan = plan_thinking(req, opts);
    let system = system_text(req);

    let mut messages: Vec<Message> = Vec::new();
    for msg in merge_consecutive(req.messages.iter().filter(|m| !m.is_system())) {
        match msg.role.as_str() {
            ROLE_TOOL => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: Some(ToolResultContent::Text(msg.text_content())),
                    is_error: None,
                };
                push_user_content(&mut messages, MessageContent::Blocks(vec![block]));
            }
            ROLE_ASSISTANT => messages.push(Message {
                role: Role::Assistant,
                content: claude_assistant_content(&msg),
            }),
            _ => push_user_content(&mut messages, claude_user_content(&msg)),
        }
    }

    if messages.first().is_some_and(|m| m.role == Role::Assistant) {
        messages.insert(
            0,
            Message {
                role: Role::User,
                content: MessageContent::Text("...".to_string()),
            },
        );
    }

    let mut tools: Vec<Tool> = req.tools.iter().map(claude_tool).collect();
    if let Some(ref ws) = req.web_search {
        tools.push(web_search_tool(ws));
    }

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoiceSpec::Auto => ToolChoice::Auto,
        ToolChoiceSpec::None => ToolChoice::None,
        ToolChoiceSpec::Required => ToolChoice::Any,
        ToolChoiceSpec::Function(name) => ToolChoice::Tool { name: name.clone() },
    });

    let thinking = plan.budget.map(|budget_tokens| ThinkingConfig {
        thinking_type: "enabled".to_string(),
        budget_tokens,
    });
    // Extended thinking only accepts the default sampling parameters.
    let (temperature, top_p) = if thinking.is_some() {
        (Some(1.0), None)
    } else {
        (req.temperature, req.top_p)
    };

    MessagesRequest {
        model: plan.model,
        max_tokens: plan.max_tokens,
        messages,
        system: (!system.is_empty()).then_some(SystemContent::Text(system)),
        stream: req.stream.then_some(true),
        temperature,
        top_p,
        top_k: req.top_k,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        metadata: req.user.clone().map(|u| Metadata { user_id: Some(u) }),
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        thinking,
    }
}

/// Append to the previous message when it is already a user turn.
fn push_user_content(messages: &mut Vec<Message>, content: MessageContent) {
    if let Some(last) = messages.last_mut() {
        if last.role == Role::User {
            let mut blocks = last.content.blocks();
            blocks.retain(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()));
            blocks.extend(content.blocks());
            last.content = MessageContent::Blocks(blocks);
            return;
        }
    }
    messages.push(Message {
        role: Role::User,
        content,
    });
}

fn claude_image(image: &ImageData) -> ImageSource {
    match image {
        ImageData::Url(url) => ImageSource::Url { url: url.clone() },
        ImageData::Base64 { media_type, data } => ImageSource::Base64 {
            media_type: media_type.clone(),
            data: data.clone(),
        },
    }
}

fn claude_user_content(msg: &CanonicalMessage) -> MessageContent {
    let parts = match &msg.content {
        MessageBody::Text(t) => return MessageContent::Text(t.clone()),
        MessageBody::Parts(parts) => parts,
    };
    let blocks = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
            ContentPart::Image(image) => Some(ContentBlock::Image {
                source: claude_image(image),
            }),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => Some(ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: Some(ToolResultContent::Text(content.clone())),
                is_error: is_error.then_some(true),
            }),
            ContentPart::ToolUse { .. } | ContentPart::Thinking { .. } => None,
        })
        .collect();
    MessageContent::Blocks(blocks)
}

fn claude_assistant_content(msg: &CanonicalMessage) -> MessageContent {
    if let MessageBody::Text(ref t) = msg.content {
        if msg.tool_calls.is_empty() {
            return MessageContent::Text(t.clone());
        }
    }

    let mut blocks = Vec::new();
    for part in body_parts(&msg.content) {
        match part {
            // Claude rejects thinking blocks it did not sign.
            ContentPart::Thinking {
                text,
                signature: Some(signature),
            } => blocks.push(ContentBlock::Thinking {
                thinking: text,
                signature: Some(signature),
            }),
            ContentPart::Text { text } if !text.is_empty() => {
                blocks.push(ContentBlock::Text { text });
            }
            ContentPart::ToolUse { id, name, input } => {
                blocks.push(ContentBlock::ToolUse { id, name, input });
            }
            _ => {}
        }
    }
    for call in &msg.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: parse_arguments(&call.arguments),
        });
    }
    MessageContent::Blocks(blocks)
}

fn claude_tool(spec: &ToolSpec) -> Tool {
    Tool {
        name: spec.name.clone(),
        description: spec.description.clone(),
        input_schema: Some(input_schema(&spec.parameters)),
        ..Tool::default()
    }
}

/// Build a Claude `input_schema` from OpenAI function parameters. Keys other
/// than `type`, `properties` and `required` are copied verbatim.
#[must_use]
pub fn input_schema(parameters: &Value) -> Value {
    let params = parameters.as_object();
    let mut schema = Map::new();
    schema.insert(
        "type".to_string(),
        params
            .and_then(|p| p.get("type"))
            .cloned()
            .unwrap_or_else(|| json!("object")),
    );
    schema.insert(
        "properties".to_string(),
        params
            .and_then(|p| p.get("properties"))
            .cloned()
            .unwrap_or_else(|| json!({})),
    );
    if let Some(required) = params.and_then(|p| p.get("required")) {
        schema.insert("required".to_string(), required.clone());
    }
    if let Some(params) = params {
        for (key, value) in params {
            if !schema.contains_key(key) {
                schema.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(schema)
}

fn web_search_tool(opts: &WebSearchOptions) -> Tool {
    let max_uses = match opts.search_context_size.as_deref() {
        Some("low") => 1,
        Some("high") => 10,
        _ => 5,
    };
    Tool {
        tool_type: Some(WEB_SEARCH_TOOL_TYPE.to_string()),
        name: "web_search".to_string(),
        max_uses: Some(max_uses),
        user_location: opts.user_location.as_ref().and_then(claude_user_location),
        ..Tool::default()
    }
}

/// OpenAI nests the location under `approximate`; Claude wants it flat.
fn claude_user_location(location: &Value) -> Option<Value> {
    let obj = location.as_object()?;
    let mut out = Map::new();
    out.insert("type".to_string(), json!("approximate"));
    let fields = obj
        .get("approximate")
        .and_then(Value::as_object)
        .unwrap_or(obj);
    for (key, value) in fields {
        if key != "type" && !value.is_null() {
            out.insert(key.clone(), value.clone());
        }
    }
    Some(Value::Object(out))
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

fn chat_message(role: &str, content: Option<ChatContent>) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content,
        tool_calls: None,
        tool_call_id: None,
        name: None,
    }
}

fn to_openai(req: &CanonicalRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    for msg in &req.messages {
        if msg.is_system() {
            messages.push(chat_message(
                "system",
                Some(ChatContent::Text(msg.text_content())),
            ));
            continue;
        }
        match msg.role.as_str() {
            ROLE_TOOL => messages.push(ChatMessage {
                tool_call_id: msg.tool_call_id.clone(),
                ..chat_message("tool", Some(ChatContent::Text(msg.text_content())))
            }),
            ROLE_ASSISTANT => messages.push(openai_assistant_message(msg)),
            _ => messages.extend(openai_user_messages(msg)),
        }
    }

    let tools = (!req.tools.is_empty()).then(|| {
        req.tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoiceSpec::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoiceSpec::None => ChatToolChoice::String("none".to_string()),
        ToolChoiceSpec::Required => ChatToolChoice::String("required".to_string()),
        ToolChoiceSpec::Function(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    });

    let reasoning_effort = req.reasoning.as_ref().and_then(|r| match r.budget_tokens {
        Some(budget) => Some(budget_to_effort(budget).to_string()),
        None => r.effort.clone(),
    });

    let web_search_options = req.web_search.as_ref().map(|ws| {
        let mut obj = Map::new();
        if let Some(ref size) = ws.search_context_size {
            obj.insert("search_context_size".to_string(), json!(size));
        }
        if let Some(ref loc) = ws.user_location {
            obj.insert("user_location".to_string(), loc.clone());
        }
        Value::Object(obj)
    });

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream.then_some(true),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools,
        tool_choice,
        stop: (!req.stop.is_empty()).then(|| req.stop.clone()),
        user: req.user.clone(),
        reasoning_effort,
        web_search_options,
    }
}

/// A user turn can expand into several messages: each tool result becomes
/// its own `tool` message.
fn openai_user_messages(msg: &CanonicalMessage) -> Vec<ChatMessage> {
    let parts = match &msg.content {
        MessageBody::Text(t) => {
            return vec![chat_message("user", Some(ChatContent::Text(t.clone())))];
        }
        MessageBody::Parts(parts) => parts,
    };

    let mut messages = Vec::new();
    let mut pending: Vec<ChatPart> = Vec::new();

    for part in parts {
        match part {
            ContentPart::Text { text } => pending.push(ChatPart::Text { text: text.clone() }),
            ContentPart::Image(image) => pending.push(ChatPart::ImageUrl {
                image_url: ImageUrlDetail {
                    url: image.to_url(),
                    detail: None,
                },
            }),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                if !pending.is_empty() {
                    messages.push(chat_message("user", Some(collapse_parts(&pending))));
                    pending.clear();
                }
                let text = if *is_error {
                    format!("ERROR: {content}")
                } else {
                    content.clone()
                };
                messages.push(ChatMessage {
                    tool_call_id: Some(tool_use_id.clone()),
                    ..chat_message("tool", Some(ChatContent::Text(text)))
                });
            }
            ContentPart::ToolUse { .. } | ContentPart::Thinking { .. } => {}
        }
    }

    if !pending.is_empty() {
        messages.push(chat_message("user", Some(collapse_parts(&pending))));
    }
    if messages.is_empty() {
        messages.push(chat_message("user", Some(ChatContent::Text(String::new()))));
    }
    messages
}

fn openai_assistant_message(msg: &CanonicalMessage) -> ChatMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for part in body_parts(&msg.content) {
        match part {
            ContentPart::Text { text: t } => text.push_str(&t),
            ContentPart::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id,
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }
    for call in &msg.tool_calls {
        tool_calls.push(ChatToolCall {
            id: call.id.clone(),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        });
    }

    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text))
    };

    ChatMessage {
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..chat_message("assistant", content)
    }
}

fn collapse_parts(parts: &[ChatPart]) -> ChatContent {
    if let [ChatPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

fn to_gemini(req: &CanonicalRequest, opts: &TranslateOptions) -> (String, GenerateContentRequest) {
    let plan = plan_thinking(req, opts);
    let system = system_text(req);

    // Gemini matches responses to calls by name, so remember which id named what.
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for msg in req.messages.iter().filter(|m| !m.is_system()) {
        match msg.role.as_str() {
            ROLE_ASSISTANT => {
                let mut parts = Vec::new();
                for part in body_parts(&msg.content) {
                    match part {
                        ContentPart::Text { text } if !text.is_empty() => {
                            parts.push(GeminiPart::text(text));
                        }
                        ContentPart::ToolUse { id, name, input } => {
                            call_names.insert(id, name.clone());
                            parts.push(GeminiPart {
                                function_call: Some(FunctionCall {
                                    id: None,
                                    name,
                                    args: input,
                                }),
                                ..GeminiPart::default()
                            });
                        }
                        _ => {}
                    }
                }
                for call in &msg.tool_calls {
                    call_names.insert(call.id.clone(), call.name.clone());
                    parts.push(GeminiPart {
                        function_call: Some(FunctionCall {
                            id: None,
                            name: call.name.clone(),
                            args: parse_arguments(&call.arguments),
                        }),
                        ..GeminiPart::default()
                    });
                }
                if !parts.is_empty() {
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
            ROLE_TOOL => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                let part = function_response_part(
                    call_names.get(&id).cloned().unwrap_or_default(),
                    &msg.text_content(),
                );
                push_gemini_user(&mut contents, vec![part]);
            }
            _ => {
                let parts = body_parts(&msg.content)
                    .into_iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(GeminiPart::text(text)),
                        ContentPart::Image(ImageData::Base64 { media_type, data }) => {
                            Some(GeminiPart {
                                inline_data: Some(InlineData {
                                    mime_type: media_type,
                                    data,
                                }),
                                ..GeminiPart::default()
                            })
                        }
                        ContentPart::Image(ImageData::Url(url)) => Some(GeminiPart {
                            file_data: Some(FileData {
                                mime_type: None,
                                file_uri: url,
                            }),
                            ..GeminiPart::default()
                        }),
                        ContentPart::ToolResult {
                            tool_use_id,
                            name,
                            content,
                            ..
                        } => {
                            let name = name
                                .or_else(|| call_names.get(&tool_use_id).cloned())
                                .unwrap_or_default();
                            Some(function_response_part(name, &content))
                        }
                        ContentPart::ToolUse { .. } | ContentPart::Thinking { .. } => None,
                    })
                    .collect::<Vec<_>>();
                if !parts.is_empty() {
                    push_gemini_user(&mut contents, parts);
                }
            }
        }
    }

    let generation_config = GenerationConfig {
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        thinking_config: plan.budget.map(|budget| GeminiThinkingConfig {
            thinking_budget: Some(budget),
            include_thoughts: Some(true),
        }),
    };

    let declarations: Vec<FunctionDeclaration> = req
        .tools
        .iter()
        .map(|t| FunctionDeclaration {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: Some(t.parameters.clone()),
        })
        .collect();

    let tool_config = req.tool_choice.as_ref().map(|tc| {
        let cfg = match tc {
            ToolChoiceSpec::Auto => json!({"mode": "AUTO"}),
            ToolChoiceSpec::None => json!({"mode": "NONE"}),
            ToolChoiceSpec::Required => json!({"mode": "ANY"}),
            ToolChoiceSpec::Function(name) => {
                json!({"mode": "ANY", "allowedFunctionNames": [name]})
            }
        };
        json!({ "functionCallingConfig": cfg })
    });

    let request = GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart::text(system)],
        }),
        generation_config: (generation_config != GenerationConfig::default())
            .then_some(generation_config),
        tools: (!declarations.is_empty()).then(|| {
            vec![GeminiTool {
                function_declarations: declarations,
            }]
        }),
        tool_config,
    };

    (plan.model, request)
}

/// `functionResponse.response` must be an object; wrap anything else.
fn function_response_part(name: String, content: &str) -> GeminiPart {
    let response = match serde_json::from_str::<Value>(content) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => json!({ "content": other }),
        Err(_) => json!({ "content": content }),
    };
    GeminiPart {
        function_response: Some(FunctionResponse {
            id: None,
            name,
            response,
        }),
        ..GeminiPart::default()
    }
}

fn push_gemini_user(contents: &mut Vec<GeminiContent>, parts: Vec<GeminiPart>) {
    if let Some(last) = contents.last_mut() {
        if last.role.as_deref() == Some("user") {
            last.parts.extend(parts);
            return;
        }
    }
    contents.push(GeminiContent {
        role: Some("user".to_string()),
        parts,
    });
}
