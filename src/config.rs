//! Configuration parsing and validation for the chat relay
//!
//! This module handles command-line and environment configuration using clap.
//! It defines the main configuration structure used throughout the application.
use anyhow::anyhow;
use clap::Parser;
use url::Url;

/// The models tried in order when no explicit list is configured.
pub const DEFAULT_MODEL_CANDIDATES: [&str; 4] = [
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash-001",
];

/// The public generative-language endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the relay will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// The API key used for upstream calls. Chat requests fail with a
    /// configuration error while this is unset.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// The shared secret clients must present in the x-banter-key header.
    /// When unset, requests are not authenticated.
    #[arg(long, env = "BANTER_CLIENT_KEY", hide_env_values = true)]
    pub client_key: Option<String>,

    /// Requests allowed per client identity per window.
    #[arg(long, env = "RATE_LIMIT_COUNT", default_value_t = 30)]
    pub rate_limit_count: u32,

    /// Length of the rate-limit window in milliseconds.
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: u64,

    /// Models tried in order until one answers.
    #[arg(
        long = "models",
        env = "GEMINI_MODEL_CANDIDATES",
        value_delimiter = ',',
        default_values_t = DEFAULT_MODEL_CANDIDATES.map(String::from)
    )]
    pub model_candidates: Vec<String>,

    /// Base URL of the generative-language API.
    #[arg(long, env = "GEMINI_API_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: Url,

    /// Seconds before an in-flight upstream exchange is abandoned.
    #[arg(long, env = "UPSTREAM_DEADLINE_SECS", default_value_t = 30)]
    pub upstream_deadline_secs: u64,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "banter")]
    pub metrics_prefix: String,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.model_candidates.is_empty()
            || self.model_candidates.iter().any(|model| model.is_empty())
        {
            return Err(anyhow!("At least one non-empty model candidate is required"));
        }
        if self.rate_limit_count == 0 {
            return Err(anyhow!("rate-limit-count must be at least 1"));
        }
        if self.rate_limit_window_ms == 0 {
            return Err(anyhow!("rate-limit-window-ms must be at least 1"));
        }
        if self.upstream_url.cannot_be_a_base() {
            return Err(anyhow!(
                "upstream-url '{}' cannot serve as a base URL",
                self.upstream_url
            ));
        }
        Ok(self)
    }
}

/// The debug form is logged at startup, so both keys are redacted.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("client_key", &self.client_key.as_ref().map(|_| "[redacted]"))
            .field("rate_limit_count", &self.rate_limit_count)
            .field("rate_limit_window_ms", &self.rate_limit_window_ms)
            .field("model_candidates", &self.model_candidates)
            .field("upstream_url", &self.upstream_url.as_str())
            .field("upstream_deadline_secs", &self.upstream_deadline_secs)
            .field("metrics_port", &self.metrics_port)
            .field("metrics", &self.metrics)
            .field("metrics_prefix", &self.metrics_prefix)
            .finish()
    }
}
