//! Token estimation for upstreams that do not report usage.
//!
//! Encoders are loaded lazily into a process-wide cache keyed by tiktoken
//! encoding, so the cache holds at most one entry per encoding no matter how
//! many model names clients send. Models tiktoken does not know share the
//! `cl100k_base` encoder.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

use crate::translate::canonical::CanonicalRequest;

type EncoderCache = RwLock<HashMap<Tokenizer, Arc<CoreBPE>>>;

static ENCODERS: OnceLock<EncoderCache> = OnceLock::new();

const FALLBACK_ENCODING: Tokenizer = Tokenizer::Cl100kBase;

/// Per-message framing overhead added to prompt estimates.
const TOKENS_PER_MESSAGE: u64 = 4;

fn cache() -> &'static EncoderCache {
    ENCODERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// `openrouter/openai/gpt-4o` and `gpt-4o` share a key.
fn model_key(model: &str) -> String {
    model
        .rsplit('/')
        .next()
        .unwrap_or(model)
        .to_ascii_lowercase()
}

fn cached(tokenizer: Tokenizer) -> Option<Arc<CoreBPE>> {
    cache().read().ok()?.get(&tokenizer).cloned()
}

fn load(tokenizer: Tokenizer) -> Option<Arc<CoreBPE>> {
    if let Some(bpe) = cached(tokenizer) {
        return Some(bpe);
    }
    let bpe = match tiktoken_rs::get_bpe_from_tokenizer(tokenizer) {
        Ok(bpe) => Arc::new(bpe),
        Err(e) => {
            warn!("Failed to load {tokenizer:?} encoder: {e}");
            return None;
        }
    };
    let mut map = cache().write().ok()?;
    Some(Arc::clone(map.entry(tokenizer).or_insert(bpe)))
}

/// Encoder for `model`, loading and caching it on first use.
pub fn encoder_for(model: &str) -> Option<Arc<CoreBPE>> {
    let key = model_key(model);
    let tokenizer = get_tokenizer(&key).unwrap_or_else(|| {
        debug!("No tiktoken encoding for {key}, using {FALLBACK_ENCODING:?}");
        FALLBACK_ENCODING
    });
    load(tokenizer).or_else(|| load(FALLBACK_ENCODING))
}

/// Count tokens in `text` as `model` would, or approximate at four characters
/// per token when no encoder can be loaded.
pub fn count_tokens(model: &str, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder_for(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.chars().count() as u64).div_ceil(4),
    }
}

/// Estimate the prompt size of a request.
pub fn estimate_prompt_tokens(req: &CanonicalRequest) -> u64 {
    count_tokens(&req.model, &req.prompt_text()) + TOKENS_PER_MESSAGE * req.messages.len() as u64
}
