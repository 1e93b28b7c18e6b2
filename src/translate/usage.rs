//! Canonical token accounting shared by every wire format.
//!
//! OpenAI, Claude and Gemini disagree on names (prompt/input, completion/output,
//! candidates) and on cache semantics. Every translator converts into [`Usage`]
//! and back out, so billing only ever sees one shape.

use serde::{Deserialize, Serialize};

use super::anthropic_types::{self, CacheCreation, DeltaUsage};
use super::gemini_types::UsageMetadata;
use super::openai_types::{ChatUsage, CompletionTokensDetails, PromptTokensDetails};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_read_tokens: u64,
    pub cached_creation_tokens: u64,
    pub cache_creation_5m_tokens: u64,
    pub cache_creation_1h_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Per-model prices in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// Zero never replaces an already observed value.
fn merge_field(current: &mut u64, incoming: u64) {
    if incoming != 0 {
        *current = incoming;
    }
}

impl Usage {
    /// Merge another usage report into this one. Non-zero incoming fields are
    /// authoritative; zero or absent fields keep what was already observed.
    pub fn merge(&mut self, incoming: &Usage) {
        merge_field(&mut self.prompt_tokens, incoming.prompt_tokens);
        merge_field(&mut self.completion_tokens, incoming.completion_tokens);
        merge_field(&mut self.total_tokens, incoming.total_tokens);
        merge_field(&mut self.cached_read_tokens, incoming.cached_read_tokens);
        merge_field(&mut self.cached_creation_tokens, incoming.cached_creation_tokens);
        merge_field(&mut self.cache_creation_5m_tokens, incoming.cache_creation_5m_tokens);
        merge_field(&mut self.cache_creation_1h_tokens, incoming.cache_creation_1h_tokens);
        merge_field(&mut self.reasoning_tokens, incoming.reasoning_tokens);
    }

    /// Apply the usage object of a Claude `message_delta`.
    ///
    /// Input and cache counters follow the merge rule; `output_tokens`, when
    /// present, always overwrites.
    pub fn merge_claude_delta(&mut self, delta: &DeltaUsage) {
        merge_field(&mut self.prompt_tokens, delta.input_tokens.unwrap_or(0));
        merge_field(
            &mut self.cached_read_tokens,
            delta.cache_read_input_tokens.unwrap_or(0),
        );
        merge_field(
            &mut self.cached_creation_tokens,
            delta.cache_creation_input_tokens.unwrap_or(0),
        );
        if let Some(ref cc) = delta.cache_creation {
            merge_field(&mut self.cache_creation_5m_tokens, cc.ephemeral_5m_input_tokens);
            merge_field(&mut self.cache_creation_1h_tokens, cc.ephemeral_1h_input_tokens);
        }
        if let Some(output) = delta.output_tokens {
            self.completion_tokens = output;
        }
    }

    /// Recompute `total_tokens`. Called once the response is complete.
    pub fn finalize(&mut self) {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }

    #[must_use]
    pub fn finalized(mut self) -> Self {
        self.finalize();
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    // -- wire conversions -------------------------------------------------

    #[must_use]
    pub fn from_openai(u: &ChatUsage) -> Self {
        let details = u.prompt_tokens_details.clone().unwrap_or_default();
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
            cached_read_tokens: details.cached_tokens,
            cached_creation_tokens: details.cache_creation_tokens,
            cache_creation_5m_tokens: 0,
            cache_creation_1h_tokens: 0,
            reasoning_tokens: u
                .completion_tokens_details
                .as_ref()
                .map_or(0, |d| d.reasoning_tokens),
        }
    }

    #[must_use]
    pub fn from_claude(u: &anthropic_types::Usage) -> Self {
        let cc = u.cache_creation.clone().unwrap_or_default();
        Self {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
            cached_read_tokens: u.cache_read_input_tokens.unwrap_or(0),
            cached_creation_tokens: u.cache_creation_input_tokens.unwrap_or(0),
            cache_creation_5m_tokens: cc.ephemeral_5m_input_tokens,
            cache_creation_1h_tokens: cc.ephemeral_1h_input_tokens,
            reasoning_tokens: 0,
        }
    }

    #[must_use]
    pub fn from_gemini(u: &UsageMetadata) -> Self {
        let completion = u.candidates_token_count + u.thoughts_token_count;
        Self {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: completion,
            total_tokens: u.prompt_token_count + completion,
            cached_read_tokens: u.cached_content_token_count,
            reasoning_tokens: u.thoughts_token_count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_openai(&self) -> ChatUsage {
        ChatUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.prompt_tokens + self.completion_tokens,
            prompt_tokens_details: (self.cached_read_tokens > 0
                || self.cached_creation_tokens > 0)
                .then(|| PromptTokensDetails {
                    cached_tokens: self.cached_read_tokens,
                    cache_creation_tokens: self.cached_creation_tokens,
                }),
            completion_tokens_details: (self.reasoning_tokens > 0).then(|| {
                CompletionTokensDetails {
                    reasoning_tokens: self.reasoning_tokens,
                }
            }),
            cost: None,
        }
    }

    #[must_use]
    pub fn to_claude(&self) -> anthropic_types::Usage {
        anthropic_types::Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            cache_creation_input_tokens: non_zero(self.cached_creation_tokens),
            cache_read_input_tokens: non_zero(self.cached_read_tokens),
            cache_creation: self.cache_creation_split(),
        }
    }

    /// Usage object for a `message_delta` we generate ourselves.
    #[must_use]
    pub fn to_claude_delta(&self) -> DeltaUsage {
        DeltaUsage {
            input_tokens: Some(self.prompt_tokens),
            output_tokens: Some(self.completion_tokens),
            cache_creation_input_tokens: non_zero(self.cached_creation_tokens),
            cache_read_input_tokens: non_zero(self.cached_read_tokens),
            cache_creation: self.cache_creation_split(),
        }
    }

    #[must_use]
    pub fn to_gemini(&self) -> UsageMetadata {
        UsageMetadata {
            prompt_token_count: self.prompt_tokens,
            candidates_token_count: self.completion_tokens.saturating_sub(self.reasoning_tokens),
            total_token_count: self.prompt_tokens + self.completion_tokens,
            cached_content_token_count: self.cached_read_tokens,
            thoughts_token_count: self.reasoning_tokens,
        }
    }

    fn cache_creation_split(&self) -> Option<CacheCreation> {
        (self.cache_creation_5m_tokens > 0 || self.cache_creation_1h_tokens > 0).then(|| {
            CacheCreation {
                ephemeral_5m_input_tokens: self.cache_creation_5m_tokens,
                ephemeral_1h_input_tokens: self.cache_creation_1h_tokens,
            }
        })
    }

    /// Fill in `cached_creation_tokens` from an OpenRouter dollar cost when the
    /// upstream did not report it.
    pub fn apply_openrouter_estimate(&mut self, cost: f64, price: &ModelPrice) {
        if self.cached_creation_tokens == 0 {
            self.cached_creation_tokens = estimate_openrouter_cache_creation(self, cost, price);
        }
    }
}

/// How usage reported by an OpenAI-format upstream is read for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsagePolicy {
    /// The channel is OpenRouter, which reports `cost` but not cache writes.
    pub openrouter: bool,
    /// Configured price of the upstream model, if any.
    pub price: Option<ModelPrice>,
    /// Prices are overridden locally; the upstream cost is not trusted.
    pub custom_price_override: bool,
}

impl UsagePolicy {
    /// Read an OpenAI usage object, back-estimating cache writes when allowed.
    #[must_use]
    pub fn read_openai(&self, wire: &ChatUsage) -> Usage {
        let mut usage = Usage::from_openai(wire);
        if self.openrouter && !self.custom_price_override {
            if let (Some(cost), Some(price)) = (wire.cost, self.price) {
                usage.apply_openrouter_estimate(cost, &price);
            }
        }
        usage
    }
}

fn non_zero(n: u64) -> Option<u64> {
    (n > 0).then_some(n)
}

/// Back-estimate how many prompt tokens were billed as cache writes.
///
/// OpenRouter counts cache writes inside `prompt_tokens` but bills them at the
/// cache-write price. Whatever part of `cost` is not explained by pricing every
/// uncached prompt token at the input price is attributed to the price
/// difference of cache writes. The result is clamped to the uncached prompt.
#[must_use]
pub fn estimate_openrouter_cache_creation(usage: &Usage, cost: f64, price: &ModelPrice) -> u64 {
    let write_premium = price.cache_write - price.input;
    if cost <= 0.0 || write_premium <= 0.0 {
        return 0;
    }

    let uncached = usage.prompt_tokens.saturating_sub(usage.cached_read_tokens);
    let explained = uncached as f64 * price.input
        + usage.cached_read_tokens as f64 * price.cache_read
        + usage.completion_tokens as f64 * price.output;
    let residual = cost * 1_000_000.0 - explained;
    if residual <= 0.0 {
        return 0;
    }

    let estimate = (residual / write_premium).round() as u64;
    estimate.min(uncached)
}
