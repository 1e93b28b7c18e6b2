//! Finish/stop reason vocabularies.
//!
//! | OpenAI `finish_reason` | Claude `stop_reason` |
//! |---|---|
//! | stop | end_turn |
//! | stop_sequence | stop_sequence |
//! | length / max_tokens | max_tokens |
//! | tool_calls | tool_use |
//! | content_filter | refusal |
//!
//! Anything else passes through unchanged.

/// Map OpenAI finish_reason to Claude stop_reason.
pub fn openai_to_claude(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "stop_sequence" => "stop_sequence".to_string(),
        "length" | "max_tokens" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        "content_filter" => "refusal".to_string(),
        other => other.to_string(),
    }
}

/// Map Claude stop_reason to OpenAI finish_reason.
pub fn claude_to_openai(reason: &str) -> String {
    match reason {
        "end_turn" | "pause_turn" => "stop".to_string(),
        "stop_sequence" => "stop_sequence".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        "refusal" => "content_filter".to_string(),
        other => other.to_string(),
    }
}

/// Map a Gemini `finishReason` to OpenAI finish_reason.
pub fn gemini_to_openai(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            "content_filter".to_string()
        }
        other => other.to_ascii_lowercase(),
    }
}

/// Map OpenAI finish_reason to a Gemini `finishReason`.
pub fn openai_to_gemini(reason: &str) -> String {
    match reason {
        "stop" | "tool_calls" | "function_call" | "stop_sequence" => "STOP".to_string(),
        "length" | "max_tokens" => "MAX_TOKENS".to_string(),
        "content_filter" => "SAFETY".to_string(),
        other => other.to_ascii_uppercase(),
    }
}
