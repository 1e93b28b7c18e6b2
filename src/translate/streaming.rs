//! State machine for translating OpenAI streaming chunks into Claude SSE events.
//!
//! The [`StreamTranslator`] processes OpenAI `ChatCompletionChunk`s one at a time,
//! keeping track of which content block is open, and emits the matching Claude
//! stream events. Claude streams are a strict `start -> delta* -> stop`
//! sequence per block index: a block must be stopped before a block of another
//! kind opens, and every started index is stopped exactly once before
//! `message_stop`.
//!
//! Several tool calls can be open at once. OpenAI-compatible upstreams may
//! interleave argument deltas for parallel calls, so a tool run occupies the
//! index range `[tool_call_base_index, tool_call_base_index + tool_call_max_offset]`.

use std::collections::{BTreeSet, HashMap};

use super::anthropic_types::{
    Delta, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent,
};
use super::finish_reason;
use super::openai_types::{ChatCompletionChunk, ChunkDelta, ChunkToolCall};
use super::usage::{Usage, UsagePolicy};
use crate::tokenizer;

/// Kind of the content block currently open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockKind {
    #[default]
    None,
    Text,
    Thinking,
    Tools,
}

/// Per-response conversion state. Owned by the task reading the upstream.
#[derive(Debug, Clone, Default)]
pub struct StreamConversionState {
    pub open_block: BlockKind,
    /// Index of the current (or next) content block.
    pub block_index: usize,
    pub tool_call_base_index: usize,
    pub tool_call_max_offset: usize,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    /// Terminal. Never reset once set.
    pub done: bool,
    pub chunk_count: u64,
    /// Offsets of the current tool run that already got `content_block_start`.
    started_tools: BTreeSet<usize>,
    /// Upstream tool index to offset within the current tool run, assigned in
    /// order of first appearance.
    tool_offsets: HashMap<usize, usize>,
    /// Everything generated so far, for completion-token estimation.
    output_text: String,
}

/// Translates an OpenAI chunk stream into Claude events.
///
/// ```ignore
/// let mut translator = StreamTranslator::new("claude-sonnet-4", prompt_estimate);
/// for chunk in openai_chunks {
///     for event in translator.process_chunk(&chunk) {
///         // send as SSE
///     }
/// }
/// let final_events = translator.finish();
/// ```
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    prompt_estimate: u64,
    policy: UsagePolicy,
    state: StreamConversionState,
}

impl StreamTranslator {
    /// `model` is reported to the client; `prompt_estimate` is used in
    /// `message_start` and whenever the upstream never reports prompt tokens.
    pub fn new(model: &str, prompt_estimate: u64) -> Self {
        Self {
            model: model.to_string(),
            msg_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            prompt_estimate,
            policy: UsagePolicy::default(),
            state: StreamConversionState::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UsagePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> &StreamConversionState {
        &self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.done
    }

    /// Usage for billing: what the upstream reported, with estimates filling
    /// whatever it left out.
    pub fn usage(&self) -> Usage {
        let mut usage = self.state.usage;
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.prompt_estimate;
        }
        if usage.completion_tokens == 0 {
            usage.completion_tokens = tokenizer::count_tokens(&self.model, &self.state.output_text);
        }
        usage.finalized()
    }

    /// Process a single OpenAI streaming chunk, returning zero or more Claude events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        // Late usage chunks still count for billing.
        if let Some(ref usage) = chunk.usage {
            self.state.usage.merge(&self.policy.read_openai(usage));
        }

        if self.state.done {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.state.chunk_count += 1;

        if self.state.chunk_count == 1 {
            events.push(self.message_start());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        self.apply_delta(&choice.delta, &mut events);

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            events.append(&mut self.close(reason));
        }

        events
    }

    /// Call when the upstream signals completion out of band (`[DONE]` or EOF).
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.state.done {
            return Vec::new();
        }
        let mut events = Vec::new();
        if self.state.chunk_count == 0 {
            events.push(self.message_start());
        }
        let reason = self
            .state
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".to_string());
        events.append(&mut self.close(&reason));
        events
    }

    fn message_start(&self) -> StreamEvent {
        let mut usage = self.state.usage;
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.prompt_estimate;
        }
        usage.completion_tokens = 0;

        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: usage.to_claude(),
            },
        }
    }

    fn apply_delta(&mut self, delta: &ChunkDelta, events: &mut Vec<StreamEvent>) {
        if let Some(thinking) = delta.reasoning_content.as_deref().filter(|s| !s.is_empty()) {
            self.transition(BlockKind::Thinking, events);
            self.state.output_text.push_str(thinking);
            events.push(StreamEvent::ContentBlockDelta {
                index: self.state.block_index,
                delta: Delta::ThinkingDelta {
                    thinking: thinking.to_string(),
                },
            });
        }

        if let Some(text) = delta.content.as_deref().filter(|s| !s.is_empty()) {
            self.transition(BlockKind::Text, events);
            self.state.output_text.push_str(text);
            events.push(StreamEvent::ContentBlockDelta {
                index: self.state.block_index,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        if let Some(calls) = delta.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            self.transition(BlockKind::Tools, events);
            for (position, call) in calls.iter().enumerate() {
                self.apply_tool_call(position, call, events);
            }
            self.state.block_index = self.state.tool_call_base_index + self.state.tool_call_max_offset;
        }
    }

    fn apply_tool_call(&mut self, position: usize, call: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let state = &mut self.state;
        let raw_index = call.index.map_or(position, |i| i as usize);
        let next = state.tool_offsets.len();
        let offset = *state.tool_offsets.entry(raw_index).or_insert(next);
        state.tool_call_max_offset = state.tool_call_max_offset.max(offset);
        let index = state.tool_call_base_index + offset;

        let function = call.function.as_ref();
        let name = function
            .and_then(|f| f.name.as_deref())
            .filter(|n| !n.is_empty());
        let arguments = function
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty());

        if !state.started_tools.contains(&offset) && (name.is_some() || arguments.is_some()) {
            state.started_tools.insert(offset);
            let id = call
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ResponseContentBlock::ToolUse {
                    id,
                    name: name.unwrap_or_default().to_string(),
                    input: serde_json::Value::Object(serde_json::Map::new()),
                },
            });
        }

        if let Some(arguments) = arguments {
            state.output_text.push_str(arguments);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    /// Switch the open block to `kind`, stopping whatever was open before.
    fn transition(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) {
        if self.state.open_block == kind {
            return;
        }

        let was_open = self.state.open_block != BlockKind::None;
        self.stop_open_block(events);
        if was_open {
            self.state.block_index += 1;
        }
        self.state.open_block = kind;

        match kind {
            BlockKind::Tools => {
                self.state.tool_call_base_index = self.state.block_index;
                self.state.tool_call_max_offset = 0;
                self.state.tool_offsets.clear();
                self.state.started_tools.clear();
            }
            BlockKind::Text => events.push(StreamEvent::ContentBlockStart {
                index: self.state.block_index,
                content_block: ResponseContentBlock::Text {
                    text: String::new(),
                },
            }),
            BlockKind::Thinking => events.push(StreamEvent::ContentBlockStart {
                index: self.state.block_index,
                content_block: ResponseContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            }),
            BlockKind::None => {}
        }
    }

    /// Emit stops for the open block. A tool run stops every started index in
    /// ascending order and leaves `block_index` on the last one.
    fn stop_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        match self.state.open_block {
            BlockKind::Text | BlockKind::Thinking => {
                events.push(StreamEvent::ContentBlockStop {
                    index: self.state.block_index,
                });
            }
            BlockKind::Tools => {
                let base = self.state.tool_call_base_index;
                for offset in &self.state.started_tools {
                    events.push(StreamEvent::ContentBlockStop {
                        index: base + offset,
                    });
                }
                self.state.block_index = base + self.state.tool_call_max_offset;
                self.state.started_tools.clear();
                self.state.tool_offsets.clear();
            }
            BlockKind::None => {}
        }
        self.state.open_block = BlockKind::None;
    }

    /// Close sequence: stop open blocks, then `message_delta` and `message_stop`.
    fn close(&mut self, reason: &str) -> Vec<StreamEvent> {
        if self.state.done {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.stop_open_block(&mut events);

        self.state.finish_reason = Some(reason.to_string());
        let usage = self.usage();
        self.state.usage = usage;
        self.state.done = true;

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(finish_reason::openai_to_claude(reason)),
                stop_sequence: None,
            },
            usage: usage.to_claude_delta(),
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::*;
    use std::collections::HashMap;

    fn chunk(delta: ChunkDelta, finish: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk::new("c1", "test", 0).with_delta(delta, finish.map(String::from))
    }

    fn text_chunk(content: &str, finish: Option<&str>) -> ChatCompletionChunk {
        chunk(
            ChunkDelta {
                content: Some(content.to_string()),
                ..ChunkDelta::default()
            },
            finish,
        )
    }

    fn reasoning_chunk(content: &str) -> ChatCompletionChunk {
        chunk(
            ChunkDelta {
                reasoning_content: Some(content.to_string()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn tool_delta(index: u64, id: Option<&str>, name: Option<&str>, args: &str) -> ChunkToolCall {
        ChunkToolCall {
            index: Some(index),
            id: id.map(String::from),
            call_type: id.map(|_| "function".to_string()),
            function: Some(ChunkToolCallFunction {
                name: name.map(String::from),
                arguments: Some(args.to_string()),
            }),
        }
    }

    fn tools_chunk(calls: Vec<ChunkToolCall>, finish: Option<&str>) -> ChatCompletionChunk {
        chunk(
            ChunkDelta {
                tool_calls: Some(calls),
                ..ChunkDelta::default()
            },
            finish,
        )
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    /// Every started index is stopped exactly once, deltas only go to open
    /// indices, and `message_stop` is last and unique.
    fn assert_well_formed(events: &[StreamEvent]) {
        let mut open: HashMap<usize, bool> = HashMap::new();
        let mut stops = 0;
        for (i, event) in events.iter().enumerate() {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(!open.contains_key(index), "index {index} started twice");
                    open.insert(*index, true);
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert_eq!(open.get(index), Some(&true), "delta for closed index {index}");
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open.get(index), Some(&true), "stop for closed index {index}");
                    open.insert(*index, false);
                }
                StreamEvent::MessageStop => {
                    stops += 1;
                    assert_eq!(i, events.len() - 1, "message_stop is not last");
                }
                _ => {}
            }
        }
        assert!(open.values().all(|o| !o), "unclosed blocks: {open:?}");
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_first_text_chunk_opens_block_without_stop() {
        let mut translator = StreamTranslator::new("claude-sonnet-4", 10);
        let events = translator.process_chunk(&text_chunk("Hi", None));

        assert_eq!(
            names(&events),
            ["message_start", "content_block_start", "content_block_delta"]
        );
        assert!(matches!(
            &events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text { .. }
            }
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text } } if text == "Hi"
        ));
    }

    #[test]
    fn test_finish_chunk_runs_close_sequence() {
        let mut translator = StreamTranslator::new("claude-sonnet-4", 10);
        translator.process_chunk(&text_chunk("Hi", None));
        let events = translator.process_chunk(&chunk(ChunkDelta::default(), Some("stop")));

        assert_eq!(
            names(&events),
            ["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        match &events[1] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        assert!(translator.is_done());
    }

    #[test]
    fn test_single_chunk_stream_closes_immediately() {
        let mut translator = StreamTranslator::new("m", 10);
        let events = translator.process_chunk(&text_chunk("All done", Some("length")));
        assert_eq!(
            names(&events),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        match &events[4] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("max_tokens"));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_terminal_guard_ignores_later_chunks_but_keeps_usage() {
        let mut translator = StreamTranslator::new("m", 10);
        translator.process_chunk(&text_chunk("Hi", Some("stop")));

        let mut usage_chunk = ChatCompletionChunk::new("c1", "test", 0);
        usage_chunk.usage = Some(ChatUsage {
            prompt_tokens: 50,
            completion_tokens: 7,
            total_tokens: 57,
            ..ChatUsage::default()
        });
        assert!(translator.process_chunk(&usage_chunk).is_empty());
        assert!(translator.process_chunk(&text_chunk("more", None)).is_empty());
        assert!(translator.finish().is_empty());

        let usage = translator.usage();
        assert_eq!(usage.prompt_tokens, 50);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 57);
    }

    #[test]
    fn test_empty_first_chunk_opens_nothing() {
        let mut translator = StreamTranslator::new("m", 10);
        let role_chunk = chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..ChunkDelta::default()
            },
            None,
        );
        assert_eq!(names(&translator.process_chunk(&role_chunk)), ["message_start"]);

        let events = translator.process_chunk(&text_chunk("Hi", None));
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 0, .. }));
    }

    #[test]
    fn test_heartbeat_chunks_emit_nothing() {
        let mut translator = StreamTranslator::new("m", 10);
        translator.process_chunk(&text_chunk("Hi", None));
        let empty = ChatCompletionChunk::new("c1", "test", 0);
        assert!(translator.process_chunk(&empty).is_empty());
    }

    #[test]
    fn test_thinking_then_text_transitions_blocks() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&reasoning_chunk("Let me think"));
        events.extend(translator.process_chunk(&reasoning_chunk(" more")));
        events.extend(translator.process_chunk(&text_chunk("Answer", None)));
        events.extend(translator.process_chunk(&chunk(ChunkDelta::default(), Some("stop"))));

        assert_eq!(
            names(&events),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Thinking { .. }
            }
        ));
        assert!(matches!(events[4], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[5], StreamEvent::ContentBlockStart { index: 1, .. }));
        assert!(matches!(events[7], StreamEvent::ContentBlockStop { index: 1 }));
        assert_well_formed(&events);
    }

    #[test]
    fn test_first_chunk_tool_call_with_arguments() {
        let mut translator = StreamTranslator::new("m", 10);
        let events = translator.process_chunk(&tools_chunk(
            vec![tool_delta(0, Some("call_1"), Some("search"), "{\"q\":")],
            None,
        ));
        assert_eq!(
            names(&events),
            ["message_start", "content_block_start", "content_block_delta"]
        );
        match &events[1] {
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::ToolUse { id, name, .. },
            } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "search");
            }
            other => panic!("expected tool_use start, got {other:?}"),
        }
        assert_eq!(translator.state().open_block, BlockKind::Tools);
    }

    #[test]
    fn test_parallel_tool_calls_after_text() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&text_chunk("Checking both.", None));

        let starts = translator.process_chunk(&tools_chunk(
            vec![
                tool_delta(0, Some("call_a"), Some("weather"), ""),
                tool_delta(1, Some("call_b"), Some("time"), ""),
            ],
            None,
        ));
        let start_indices: Vec<usize> = starts
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(start_indices, [1, 2]);
        assert!(matches!(starts[0], StreamEvent::ContentBlockStop { index: 0 }));
        events.extend(starts);

        // Interleaved argument deltas.
        events.extend(translator.process_chunk(&tools_chunk(
            vec![tool_delta(1, None, None, "{\"tz\":\"UTC\"}")],
            None,
        )));
        events.extend(translator.process_chunk(&tools_chunk(
            vec![tool_delta(0, None, None, "{\"city\":\"Oslo\"}")],
            None,
        )));
        assert_eq!(translator.state().block_index, 2);

        let close = translator.process_chunk(&chunk(ChunkDelta::default(), Some("tool_calls")));
        assert_eq!(
            names(&close),
            ["content_block_stop", "content_block_stop", "message_delta", "message_stop"]
        );
        assert!(matches!(close[0], StreamEvent::ContentBlockStop { index: 1 }));
        assert!(matches!(close[1], StreamEvent::ContentBlockStop { index: 2 }));
        match &close[2] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        events.extend(close);
        assert_well_formed(&events);
    }

    #[test]
    fn test_arguments_without_start_synthesize_one() {
        let mut translator = StreamTranslator::new("m", 10);
        let events = translator.process_chunk(&tools_chunk(
            vec![tool_delta(0, None, None, "{}")],
            Some("tool_calls"),
        ));
        assert_eq!(
            names(&events),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_well_formed(&events);
    }

    #[test]
    fn test_text_after_tools_moves_past_tool_range() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&tools_chunk(
            vec![
                tool_delta(0, Some("call_a"), Some("a"), "{}"),
                tool_delta(1, Some("call_b"), Some("b"), "{}"),
            ],
            None,
        ));
        let next = translator.process_chunk(&text_chunk("done", None));
        assert!(matches!(next[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(next[1], StreamEvent::ContentBlockStop { index: 1 }));
        assert!(matches!(next[2], StreamEvent::ContentBlockStart { index: 2, .. }));
        events.extend(next);
        events.extend(translator.finish());
        assert_well_formed(&events);
    }

    fn tool_json_by_index(events: &[StreamEvent]) -> Vec<(usize, String)> {
        let mut out: Vec<(usize, String)> = Vec::new();
        for event in events {
            if let StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            } = event
            {
                match out.iter_mut().find(|(i, _)| i == index) {
                    Some((_, json)) => json.push_str(partial_json),
                    None => out.push((*index, partial_json.clone())),
                }
            }
        }
        out
    }

    #[test]
    fn test_tool_indices_out_of_order_get_separate_blocks() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&tools_chunk(
            vec![tool_delta(1, Some("call_b"), Some("b"), "{\"y\":2}")],
            None,
        ));
        events.extend(translator.process_chunk(&tools_chunk(
            vec![tool_delta(0, Some("call_a"), Some("a"), "{\"x\":1}")],
            None,
        )));
        events.extend(translator.finish());

        let starts: Vec<(usize, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::ToolUse { id, .. },
                } => Some((*index, id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            starts,
            [(0, "call_b".to_string()), (1, "call_a".to_string())]
        );
        assert_eq!(
            tool_json_by_index(&events),
            [(0, "{\"y\":2}".to_string()), (1, "{\"x\":1}".to_string())]
        );
        assert_well_formed(&events);
    }

    #[test]
    fn test_tool_indices_not_starting_at_zero() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&text_chunk("Looking.", None));
        events.extend(translator.process_chunk(&tools_chunk(
            vec![
                tool_delta(3, Some("call_a"), Some("a"), "{\"x\":"),
                tool_delta(4, Some("call_b"), Some("b"), "{\"y\":"),
            ],
            None,
        )));
        events.extend(translator.process_chunk(&tools_chunk(
            vec![tool_delta(4, None, None, "2}"), tool_delta(3, None, None, "1}")],
            None,
        )));
        assert_eq!(translator.state().block_index, 2);
        events.extend(translator.process_chunk(&chunk(ChunkDelta::default(), Some("tool_calls"))));

        assert_eq!(
            tool_json_by_index(&events),
            [(1, "{\"x\":1}".to_string()), (2, "{\"y\":2}".to_string())]
        );
        let stops = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 3);
        assert_well_formed(&events);
    }

    #[test]
    fn test_finish_without_chunks() {
        let mut translator = StreamTranslator::new("test-model", 0);
        let events = translator.finish();
        assert_eq!(names(&events), ["message_start", "message_delta", "message_stop"]);
    }

    #[test]
    fn test_finish_after_content_closes_with_end_turn() {
        let mut translator = StreamTranslator::new("m", 10);
        let mut events = translator.process_chunk(&text_chunk("partial", None));
        let tail = translator.finish();
        match &tail[1] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
                assert_eq!(usage.input_tokens, Some(10));
                assert!(usage.output_tokens.unwrap_or(0) > 0);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        events.extend(tail);
        assert_well_formed(&events);
    }

    #[test]
    fn test_reported_usage_wins_over_estimate() {
        let mut translator = StreamTranslator::new("m", 10);
        translator.process_chunk(&text_chunk("Hello", None));
        let mut last = chunk(ChunkDelta::default(), Some("stop"));
        last.usage = Some(ChatUsage {
            prompt_tokens: 42,
            completion_tokens: 3,
            total_tokens: 45,
            prompt_tokens_details: Some(PromptTokensDetails {
                cached_tokens: 40,
                cache_creation_tokens: 0,
            }),
            ..ChatUsage::default()
        });
        let events = translator.process_chunk(&last);
        match &events[1] {
            StreamEvent::MessageDelta { usage, .. } => {
                assert_eq!(usage.input_tokens, Some(42));
                assert_eq!(usage.output_tokens, Some(3));
                assert_eq!(usage.cache_read_input_tokens, Some(40));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        assert_eq!(translator.usage().total_tokens, 45);
    }
}
