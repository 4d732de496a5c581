/// Axum handlers for the chat relay
use crate::AppState;
use crate::auth;
use crate::client::HttpClient;
use crate::envelope::{ChatEnvelope, ChatRequest, HealthResponse, MODEL_UNKNOWN};
use crate::fallback;
use crate::gemini::GeminiClient;
use crate::rate_limit::{self, RateDecision};
use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

const MSG_METHOD_NOT_ALLOWED: &str = "Method Not Allowed";
const MSG_UNAUTHORIZED: &str = "Unauthorized";
const MSG_MISSING_API_KEY: &str = "Server configuration error - API key missing";
const MSG_PROMPT_REQUIRED: &str = "Prompt is required";
const MSG_INTERNAL: &str = "Internal Server Error";
const MSG_UPSTREAM_TIMEOUT: &str = "Upstream request timed out";

const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Request bodies larger than this are treated as having no prompt.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The main handler: authenticate, rate limit, validate, then relay the
/// prompt through the model fallback chain. Every exit is a [`ChatEnvelope`].
#[instrument(skip(state, req))]
pub async fn chat_handler<T: HttpClient>(
    State(state): State<AppState<T>>,
    req: axum::extract::Request,
) -> Response {
    // Auth first; refused requests carry no rate-limit headers.
    if let Some(expected) = &state.client_key
        && !auth::validate_client_key(expected, req.headers())
    {
        warn!("Refused request with a missing or invalid client key");
        return envelope_response(
            StatusCode::UNAUTHORIZED,
            ChatEnvelope::failure(MSG_UNAUTHORIZED, MODEL_UNKNOWN),
            None,
        );
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = (state.identity)(req.headers(), peer);
    let decision = state.limiter.check(&identity);
    if !decision.allowed {
        let retry_ms = decision.reset_at.saturating_sub(rate_limit::now_millis());
        debug!("Rate limit exceeded for {}", identity);
        return envelope_response(
            StatusCode::TOO_MANY_REQUESTS,
            ChatEnvelope::failure(
                format!("Rate limit exceeded. Try again after {retry_ms}ms."),
                MODEL_UNKNOWN,
            ),
            Some(&decision),
        );
    }

    let Some(api_key) = state.config.api_key.as_deref() else {
        error!("Refusing chat request, no upstream API key is configured");
        return envelope_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ChatEnvelope::failure(MSG_MISSING_API_KEY, MODEL_UNKNOWN),
            Some(&decision),
        );
    };

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return envelope_response(
                StatusCode::BAD_REQUEST,
                ChatEnvelope::failure(MSG_PROMPT_REQUIRED, MODEL_UNKNOWN),
                Some(&decision),
            );
        }
    };
    let request = ChatRequest::from_bytes(&body);
    let Some(prompt) = request.trimmed_prompt() else {
        return envelope_response(
            StatusCode::BAD_REQUEST,
            ChatEnvelope::failure(MSG_PROMPT_REQUIRED, MODEL_UNKNOWN),
            Some(&decision),
        );
    };
    debug!("Prompt accepted ({} bytes)", prompt.len());

    let client = GeminiClient::new(&state.http_client, &state.config.upstream_url, api_key);
    let deadline = Duration::from_secs(state.config.upstream_deadline_secs);
    let resolved = tokio::time::timeout(
        deadline,
        fallback::resolve(&client, &state.config.model_candidates, prompt),
    )
    .await;

    match resolved {
        Ok(Ok(outcome)) => envelope_response(outcome.status, outcome.envelope, Some(&decision)),
        Ok(Err(e)) => {
            error!("Chat relay failed: {}", e);
            envelope_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ChatEnvelope::failure(MSG_INTERNAL, MODEL_UNKNOWN),
                Some(&decision),
            )
        }
        Err(_) => {
            warn!(
                "No upstream outcome within {}s, abandoning the request",
                state.config.upstream_deadline_secs
            );
            envelope_response(
                StatusCode::GATEWAY_TIMEOUT,
                ChatEnvelope::failure(MSG_UPSTREAM_TIMEOUT, MODEL_UNKNOWN),
                Some(&decision),
            )
        }
    }
}

/// Browsers probe with OPTIONS before posting; answer 200 with no body.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// Any verb on `/api/chat` other than POST or OPTIONS.
pub async fn method_not_allowed() -> Response {
    envelope_response(
        StatusCode::METHOD_NOT_ALLOWED,
        ChatEnvelope::failure(MSG_METHOD_NOT_ALLOWED, MODEL_UNKNOWN),
        None,
    )
}

/// Liveness probe, exempt from auth and rate limiting.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse::now())
}

fn envelope_response(
    status: StatusCode,
    envelope: ChatEnvelope,
    decision: Option<&RateDecision>,
) -> Response {
    let mut response = (status, Json(envelope)).into_response();
    if let Some(decision) = decision {
        apply_rate_headers(response.headers_mut(), decision);
    }
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(decision.reset_at));
}
