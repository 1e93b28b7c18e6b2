//! Per-request relay context and upstream channel resolution.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::{PricingConfig, RelayConfig};
use crate::error::Result;
use crate::logging::RelayRecord;
use crate::providers;
use crate::translate::canonical::CanonicalRequest;
use crate::translate::request::{TranslateOptions, THINKING_SUFFIX};
use crate::translate::{ConversionChain, RelayFormat, Usage, UsagePolicy};

/// A resolved upstream: where to send requests, how to authenticate, and
/// which format it speaks.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub format: RelayFormat,
    pub models: HashMap<String, String>,
    pub options: TranslateOptions,
    pricing: PricingConfig,
}

impl Channel {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            name: config.provider.name.clone(),
            base_url: config.effective_base_url()?,
            api_key: config.resolve_api_key()?,
            format: config.upstream_format()?,
            models: config.models.clone(),
            options: config.translate_options(),
            pricing: config.pricing.clone(),
        })
    }

    /// Upstream model for a client model name.
    ///
    /// A `-thinking` model without its own entry maps through its base name
    /// and keeps the suffix, so the request translator still sees it.
    pub fn map_model(&self, client_model: &str) -> String {
        if let Some(mapped) = self.models.get(client_model) {
            return mapped.clone();
        }
        if let Some(base) = client_model.strip_suffix(THINKING_SUFFIX) {
            if let Some(mapped) = self.models.get(base) {
                return format!("{mapped}{THINKING_SUFFIX}");
            }
        }
        client_model.to_string()
    }

    /// Full upstream URL for a chat request.
    pub fn endpoint(&self, upstream_model: &str, stream: bool) -> String {
        format!(
            "{}{}",
            self.base_url,
            providers::endpoint_path(self.format, upstream_model, stream)
        )
    }

    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        providers::auth_headers(self.format, &self.api_key)
    }

    pub fn usage_policy(&self, upstream_model: &str) -> UsagePolicy {
        UsagePolicy {
            openrouter: self.name.eq_ignore_ascii_case("openrouter"),
            price: self.pricing.models.get(upstream_model).copied(),
            custom_price_override: self.pricing.custom_price_override,
        }
    }
}

/// Everything about one in-flight request that outlives translation.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub client_format: RelayFormat,
    pub upstream_format: RelayFormat,
    pub chain: ConversionChain,
    pub client_model: String,
    pub upstream_model: String,
    pub stream: bool,
    pub prompt_estimate: u64,
    pub started: Instant,
    /// The request failed in a way another channel might not.
    pub retryable: bool,
}

impl RelayInfo {
    pub fn new(req: &CanonicalRequest, channel: &Channel, prompt_estimate: u64) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            client_format: req.source,
            upstream_format: channel.format,
            chain: ConversionChain::for_pair(req.source, channel.format),
            client_model: req.model.clone(),
            upstream_model: channel.map_model(&req.model),
            stream: req.stream,
            prompt_estimate,
            started: Instant::now(),
            retryable: false,
        }
    }

    /// Both sides speak the same format.
    pub fn is_passthrough(&self) -> bool {
        self.client_format == self.upstream_format
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn record(&self, status: u16, usage: Usage, complete: bool) -> RelayRecord {
        let mut record = RelayRecord::new(
            &self.request_id,
            &self.chain,
            &self.client_model,
            &self.upstream_model,
        );
        record.stream = self.stream;
        record.status = status;
        record.usage = usage;
        record.complete = complete;
        record.retryable = self.retryable;
        record.elapsed_ms = self.elapsed_ms();
        record
    }
}
