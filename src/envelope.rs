//! Wire types for the chat endpoint
//!
//! Every `/api/chat` outcome, success or failure, is expressed as a
//! [`ChatEnvelope`] so browser clients only ever parse one shape.
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Model name reported for failures that never reached a candidate.
pub const MODEL_UNKNOWN: &str = "unknown";

/// Model name reported when every candidate was unavailable.
pub const MODEL_UNAVAILABLE: &str = "unavailable";

/// The request body accepted by the chat endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub prompt: Option<String>,
}

impl ChatRequest {
    /// Parse a request body, treating malformed JSON the same as an empty body.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    /// The prompt with surrounding whitespace removed, if a usable one was supplied.
    pub fn trimmed_prompt(&self) -> Option<&str> {
        let prompt = self.prompt.as_deref()?.trim();
        (!prompt.is_empty()).then_some(prompt)
    }
}

/// The uniform response body returned by every chat outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    pub success: bool,
    pub reply: String,
    pub model_used: String,
    pub tokens_used: u64,
    pub timestamp: String,
}

impl ChatEnvelope {
    pub fn success(
        reply: impl Into<String>,
        model_used: impl Into<String>,
        tokens_used: u64,
    ) -> Self {
        Self {
            success: true,
            reply: reply.into(),
            model_used: model_used.into(),
            tokens_used,
            timestamp: rfc3339_now(),
        }
    }

    pub fn failure(reply: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            success: false,
            reply: reply.into(),
            model_used: model_used.into(),
            tokens_used: 0,
            timestamp: rfc3339_now(),
        }
    }
}

/// Liveness probe body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

impl HealthResponse {
    pub fn now() -> Self {
        Self {
            status: "OK".to_string(),
            timestamp: rfc3339_now(),
        }
    }
}

/// The current time in RFC 3339 with millisecond precision and a `Z` suffix.
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
