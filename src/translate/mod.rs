//! Protocol translation between the OpenAI, Claude and Gemini wire formats.
//!
//! Requests are decoded into a [`canonical::CanonicalRequest`] and encoded for
//! the upstream. Responses and stream chunks pivot through the OpenAI chat
//! shape whenever client and upstream disagree. Everything in this module is
//! pure; I/O lives in [`crate::proxy`].

pub mod anthropic_types;
pub mod canonical;
pub mod claude_stream;
pub mod finish_reason;
pub mod format;
pub mod gemini_stream;
pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod usage;

pub use format::{ConversionChain, RelayFormat};
pub use usage::{ModelPrice, Usage, UsagePolicy};
