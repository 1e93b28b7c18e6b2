//! Wire formats a request can arrive in or be relayed as.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    Claude,
    Gemini,
    #[serde(rename = "openai_responses")]
    OpenAIResponses,
    Rerank,
    Embedding,
    Audio,
    Image,
}

impl RelayFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RelayFormat::OpenAI => "openai",
            RelayFormat::Claude => "claude",
            RelayFormat::Gemini => "gemini",
            RelayFormat::OpenAIResponses => "openai_responses",
            RelayFormat::Rerank => "rerank",
            RelayFormat::Embedding => "embedding",
            RelayFormat::Audio => "audio",
            RelayFormat::Image => "image",
        }
    }

    /// Parse a format name as written in config files. `anthropic` is accepted
    /// as an alias for `claude`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(RelayFormat::OpenAI),
            "claude" | "anthropic" => Some(RelayFormat::Claude),
            "gemini" | "google" => Some(RelayFormat::Gemini),
            "openai_responses" | "responses" => Some(RelayFormat::OpenAIResponses),
            "rerank" => Some(RelayFormat::Rerank),
            "embedding" => Some(RelayFormat::Embedding),
            "audio" => Some(RelayFormat::Audio),
            "image" => Some(RelayFormat::Image),
            _ => None,
        }
    }

    /// Formats the chat translators know how to speak.
    #[must_use]
    pub fn is_chat(self) -> bool {
        matches!(
            self,
            RelayFormat::OpenAI | RelayFormat::Claude | RelayFormat::Gemini
        )
    }
}

impl fmt::Display for RelayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of formats a request passed through, client first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionChain(Vec<RelayFormat>);

impl ConversionChain {
    /// Build the chain for a client/upstream pair. Pairs that do not share a
    /// translator directly pivot through the OpenAI chat format.
    #[must_use]
    pub fn for_pair(client: RelayFormat, upstream: RelayFormat) -> Self {
        let mut chain = vec![client];
        if client != upstream {
            let direct = matches!(
                (client, upstream),
                (RelayFormat::OpenAI, _) | (_, RelayFormat::OpenAI)
            );
            if !direct {
                chain.push(RelayFormat::OpenAI);
            }
            chain.push(upstream);
        }
        Self(chain)
    }

    pub fn push(&mut self, format: RelayFormat) {
        if self.0.last() != Some(&format) {
            self.0.push(format);
        }
    }

    #[must_use]
    pub fn formats(&self) -> &[RelayFormat] {
        &self.0
    }

    #[must_use]
    pub fn client(&self) -> Option<RelayFormat> {
        self.0.first().copied()
    }

    #[must_use]
    pub fn upstream(&self) -> Option<RelayFormat> {
        self.0.last().copied()
    }

    /// True when the request goes through the OpenAI chat format between two
    /// other formats.
    #[must_use]
    pub fn pivots(&self) -> bool {
        self.0.len() > 2
    }
}

impl fmt::Display for ConversionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|f| f.as_str()).collect();
        f.write_str(&names.join(" -> "))
    }
}
