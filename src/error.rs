//! Error types for the relay.

use thiserror::Error;

use crate::translate::format::RelayFormat;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    /// The client payload failed required-field validation. Never retried.
    #[error("Bad request body: {message}")]
    BadRequestBody { message: String },

    /// The upstream body could not be parsed. Eligible for channel failover.
    #[error("Bad upstream response body: {message}")]
    BadUpstreamResponseBody { message: String },

    /// The upstream embedded its own error object in the response.
    #[error("Upstream error ({error_type}): {message}")]
    UpstreamProtocolError { error_type: String, message: String },

    #[error("Unsupported conversion from {from} to {to}")]
    UnsupportedConversion { from: RelayFormat, to: RelayFormat },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequestBody {
            message: msg.into(),
        }
    }

    pub fn bad_upstream(msg: impl Into<String>) -> Self {
        Self::BadUpstreamResponseBody {
            message: msg.into(),
        }
    }

    pub fn upstream_protocol(error_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamProtocolError {
            error_type: error_type.into(),
            message: msg.into(),
        }
    }

    pub fn unsupported(from: RelayFormat, to: RelayFormat) -> Self {
        Self::UnsupportedConversion { from, to }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
        }
    }

    /// HTTP status used when this error is returned to the client before any
    /// response bytes were written.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequestBody { .. } | Self::UnsupportedConversion { .. } | Self::Json(_) => 400,
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => 500,
            Self::BadUpstreamResponseBody { .. }
            | Self::UpstreamProtocolError { .. }
            | Self::Provider { .. }
            | Self::Http(_) => 502,
        }
    }

    /// Whether an external retry layer may try another channel.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BadUpstreamResponseBody { .. } | Self::Provider { .. } | Self::Http(_)
        )
    }

    /// Message used in the client-facing error object. Upstream errors keep
    /// the upstream's own wording.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::UpstreamProtocolError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Error type string used in the client-facing error object.
    #[must_use]
    pub fn wire_type(&self) -> &str {
        match self {
            Self::BadRequestBody { .. } | Self::UnsupportedConversion { .. } | Self::Json(_) => {
                "invalid_request_error"
            }
            Self::UpstreamProtocolError { error_type, .. } => error_type,
            _ => "api_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
