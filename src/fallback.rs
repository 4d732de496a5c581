//! Sequential model fallback
//!
//! Candidates are tried strictly in order. A success short-circuits; a 403 or
//! 404 moves on to the next candidate; anything else ends the run with that
//! model's failure. When every candidate is skipped, the failure names the
//! whole list that was tried.
use crate::client::HttpClient;
use crate::envelope::{ChatEnvelope, MODEL_UNAVAILABLE};
use crate::errors::ChatError;
use crate::gemini::{Disposition, GeminiClient, UPSTREAM_ERROR_FALLBACK};
use axum::http::StatusCode;
use tracing::{debug, info, warn};

/// The terminal outcome of one fallback run.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub status: StatusCode,
    pub envelope: ChatEnvelope,
}

/// Try each candidate in order until one answers or a hard failure ends the run.
pub async fn resolve<T: HttpClient>(
    client: &GeminiClient<'_, T>,
    candidates: &[String],
    prompt: &str,
) -> Result<ChatOutcome, ChatError> {
    let mut last_status = None;
    let mut last_message = None;

    for model in candidates {
        let outcome = client.generate(model, prompt).await?;
        match outcome.disposition() {
            Disposition::Success => {
                info!(
                    "Relaying reply from model {} ({} tokens)",
                    model,
                    outcome.tokens_used()
                );
                return Ok(ChatOutcome {
                    status: StatusCode::OK,
                    envelope: ChatEnvelope::success(
                        outcome.reply_text(),
                        model.as_str(),
                        outcome.tokens_used(),
                    ),
                });
            }
            Disposition::SkippableUnavailable => {
                debug!(
                    "Model {} unavailable ({}), trying next candidate",
                    model, outcome.status
                );
                last_status = Some(outcome.status);
                last_message = Some(outcome.error_message());
            }
            Disposition::RetryableThrottle | Disposition::FatalUpstreamError => {
                let message = outcome.error_message();
                warn!(
                    "Upstream failure from model {}: {} {}",
                    model, outcome.status, message
                );
                return Ok(ChatOutcome {
                    status: outcome.status,
                    envelope: ChatEnvelope::failure(message, model.as_str()),
                });
            }
        }
    }

    let status = last_status.unwrap_or(StatusCode::NOT_FOUND);
    let message = last_message.unwrap_or_else(|| UPSTREAM_ERROR_FALLBACK.to_string());
    warn!("Every candidate model was unavailable, answering {}", status);
    Ok(ChatOutcome {
        status,
        envelope: ChatEnvelope::failure(
            format!("{message} — tried: {}", candidates.join(", ")),
            MODEL_UNAVAILABLE,
        ),
    })
}
