//! Built-in provider presets for common LLM API providers.
//!
//! Each preset defines the base URL, wire format, and default environment variable
//! for the API key. Users specify a provider name in their config and the preset
//! fills in the details.

use crate::translate::RelayFormat;

/// Built-in provider presets. Each preset defines the base URL and wire format
/// so users only need to specify a provider name in their config.
#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub format: RelayFormat,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "OPENROUTER_API_KEY",
    },
    ProviderPreset {
        name: "fireworks",
        base_url: "https://api.fireworks.ai/inference/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "FIREWORKS_API_KEY",
    },
    ProviderPreset {
        name: "grok",
        base_url: "https://api.x.ai/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "XAI_API_KEY",
    },
    ProviderPreset {
        name: "together",
        base_url: "https://api.together.xyz/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "TOGETHER_API_KEY",
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "GROQ_API_KEY",
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        format: RelayFormat::OpenAI,
        default_api_key_env: "DEEPSEEK_API_KEY",
    },
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com/v1",
        format: RelayFormat::Claude,
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
    ProviderPreset {
        name: "gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        format: RelayFormat::Gemini,
        default_api_key_env: "GEMINI_API_KEY",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        let name = name.to_lowercase();
        PRESETS.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }

    /// Comma-separated preset names, for error messages.
    #[must_use]
    pub fn known_names() -> String {
        PRESETS.iter().map(|p| p.name).collect::<Vec<_>>().join(", ")
    }
}

/// Path of the chat endpoint below the base URL.
///
/// Gemini puts the model and the streaming mode in the path.
#[must_use]
pub fn endpoint_path(format: RelayFormat, model: &str, stream: bool) -> String {
    match format {
        RelayFormat::Claude => "/messages".to_string(),
        RelayFormat::Gemini if stream => {
            format!("/models/{model}:streamGenerateContent?alt=sse")
        }
        RelayFormat::Gemini => format!("/models/{model}:generateContent"),
        RelayFormat::OpenAIResponses => "/responses".to_string(),
        _ => "/chat/completions".to_string(),
    }
}

/// Authentication and version headers for an upstream request.
#[must_use]
pub fn auth_headers(format: RelayFormat, api_key: &str) -> Vec<(&'static str, String)> {
    match format {
        RelayFormat::Claude => vec![
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", "2023-06-01".to_string()),
        ],
        RelayFormat::Gemini => vec![("x-goog-api-key", api_key.to_string())],
        _ => vec![("authorization", format!("Bearer {api_key}"))],
    }
}
