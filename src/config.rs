use crate::error::{RelayError, Result};
use crate::providers::ProviderPreset;
use crate::translate::request::TranslateOptions;
use crate::translate::{ModelPrice, RelayFormat, UsagePolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub provider: ProviderConfig,
    /// Client model name -> upstream model name.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub thinking: ThinkingSettings,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// `openai`, `claude` (or `anthropic`) or `gemini`. Defaults to the preset's format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingSettings {
    /// Share of `max_tokens` given to the thinking budget for `-thinking` models.
    #[serde(default = "default_budget_percentage")]
    pub budget_percentage: f64,
    /// Send the `-thinking` suffix upstream instead of stripping it.
    #[serde(default)]
    pub keep_suffix: bool,
}

impl Default for ThinkingSettings {
    fn default() -> Self {
        Self {
            budget_percentage: default_budget_percentage(),
            keep_suffix: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Prices here replace whatever the upstream reports as cost.
    #[serde(default)]
    pub custom_price_override: bool,
    /// Upstream model name -> price per million tokens.
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
}

fn default_port() -> u16 {
    4222
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_budget_percentage() -> f64 {
    0.6
}

impl RelayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(RelayError::config(format!(
            "No config file found. Searched: {}. Create one from llm-relay.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    fn validate(&self) -> Result<()> {
        let pct = self.thinking.budget_percentage;
        if !(pct > 0.0 && pct <= 1.0) {
            return Err(RelayError::config(format!(
                "thinking.budget_percentage must be in (0, 1], got {pct}"
            )));
        }
        if let Some(ref fmt) = self.provider.format {
            let parsed = RelayFormat::from_name(fmt).filter(|f| f.is_chat());
            if parsed.is_none() {
                return Err(RelayError::config(format!(
                    "Unsupported provider format '{fmt}'. Use openai, claude or gemini"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the effective base URL (config override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.provider.base_url {
            return Ok(url.trim_end_matches('/').to_string());
        }

        let preset = ProviderPreset::from_name(&self.provider.name).ok_or_else(|| {
            RelayError::config(format!(
                "Unknown provider '{}' and no base_url configured. Known providers: {}",
                self.provider.name,
                ProviderPreset::known_names()
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    /// Resolve the API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.provider.api_key_env).map_err(|_| {
            RelayError::config(format!(
                "Environment variable '{}' not set. Set it with your provider API key.",
                self.provider.api_key_env
            ))
        })
    }

    /// Wire format the upstream speaks. An explicit `format` wins over the preset.
    pub fn upstream_format(&self) -> Result<RelayFormat> {
        if let Some(ref fmt) = self.provider.format {
            return RelayFormat::from_name(fmt)
                .ok_or_else(|| RelayError::config(format!("Unknown provider format '{fmt}'")));
        }

        Ok(ProviderPreset::from_name(&self.provider.name)
            .map_or(RelayFormat::OpenAI, |p| p.format))
    }

    pub fn translate_options(&self) -> TranslateOptions {
        TranslateOptions {
            thinking_budget_percentage: self.thinking.budget_percentage,
            keep_thinking_suffix: self.thinking.keep_suffix,
        }
    }

    /// How usage from `upstream_model` is read on this provider.
    pub fn usage_policy(&self, upstream_model: &str) -> UsagePolicy {
        UsagePolicy {
            openrouter: self.provider.name.eq_ignore_ascii_case("openrouter"),
            price: self.pricing.models.get(upstream_model).copied(),
            custom_price_override: self.pricing.custom_price_override,
        }
    }
}

/// Candidate config locations, in search order.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-relay.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("llm-relay")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("llm-relay").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("llm-relay").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".llm-relay.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_for(name: &str, base_url: Option<&str>, format: Option<&str>) -> RelayConfig {
        RelayConfig {
            port: 4222,
            provider: ProviderConfig {
                name: name.to_string(),
                base_url: base_url.map(String::from),
                api_key_env: "API_KEY".to_string(),
                format: format.map(String::from),
            },
            models: HashMap::new(),
            thinking: ThinkingSettings::default(),
            pricing: PricingConfig::default(),
        }
    }

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000

[provider]
name = "openrouter"
api_key_env = "OPENROUTER_API_KEY"

[models]
"claude-sonnet-4" = "anthropic/claude-sonnet-4"

[thinking]
budget_percentage = 0.5
keep_suffix = true

[pricing.models."anthropic/claude-sonnet-4"]
input = 3.0
output = 15.0
cache_read = 0.3
cache_write = 3.75
"#
        )
        .unwrap();

        let config = RelayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.provider.name, "openrouter");
        assert_eq!(
            config.models.get("claude-sonnet-4"),
            Some(&"anthropic/claude-sonnet-4".to_string())
        );
        assert!((config.thinking.budget_percentage - 0.5).abs() < f64::EPSILON);
        assert!(config.translate_options().keep_thinking_suffix);

        let policy = config.usage_policy("anthropic/claude-sonnet-4");
        assert!(policy.openrouter);
        assert_eq!(policy.price.map(|p| p.cache_write), Some(3.75));
        assert!(config.usage_policy("other").price.is_none());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[provider]\nname = \"openai\"").unwrap();
        let config = RelayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 4222);
        assert_eq!(config.provider.api_key_env, "API_KEY");
        assert!((config.thinking.budget_percentage - 0.6).abs() < f64::EPSILON);
        assert!(!config.pricing.custom_price_override);
    }

    #[test]
    fn test_invalid_budget_percentage_is_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[provider]\nname = \"openai\"\n[thinking]\nbudget_percentage = 1.5").unwrap();
        assert!(matches!(
            RelayConfig::load(f.path()),
            Err(RelayError::Config { .. })
        ));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[provider]\nname = \"custom\"\nformat = \"embedding\"").unwrap();
        assert!(RelayConfig::load(f.path()).is_err());
    }

    #[test]
    fn test_effective_base_url_from_preset() {
        let config = config_for("openai", None, None);
        assert_eq!(config.effective_base_url().unwrap(), "https://api.openai.com/v1");
    }

    #[test]
    fn test_effective_base_url_override() {
        let config = config_for("custom", Some("https://my-server.com/v1/"), None);
        assert_eq!(config.effective_base_url().unwrap(), "https://my-server.com/v1");
    }

    #[test]
    fn test_unknown_provider_without_url_fails() {
        let config = config_for("nowhere", None, None);
        assert!(config.effective_base_url().is_err());
    }

    #[test]
    fn test_upstream_format_resolution() {
        assert_eq!(
            config_for("anthropic", None, None).upstream_format().unwrap(),
            RelayFormat::Claude
        );
        assert_eq!(
            config_for("gemini", None, None).upstream_format().unwrap(),
            RelayFormat::Gemini
        );
        assert_eq!(
            config_for("custom", Some("http://x"), Some("anthropic"))
                .upstream_format()
                .unwrap(),
            RelayFormat::Claude
        );
        assert_eq!(
            config_for("custom", Some("http://x"), None).upstream_format().unwrap(),
            RelayFormat::OpenAI
        );
    }

    #[test]
    fn test_search_paths_start_in_cwd() {
        let paths = config_search_paths();
        assert_eq!(paths[0], PathBuf::from("llm-relay.toml"));
    }
}
