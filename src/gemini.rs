//! The upstream model client for the generateContent endpoint
//!
//! One [`GeminiClient::generate`] call makes a single attempt against a single
//! model, except when the upstream throttles: a 429 is retried exactly once
//! after honoring the advertised retry-after (when sane) or a short fixed
//! backoff. Classifying the settled outcome is the caller's job, via
//! [`UpstreamOutcome::disposition`].
use crate::client::HttpClient;
use crate::errors::ChatError;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri, header};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Relayed when a successful response carries no usable text.
pub const EMPTY_REPLY_FALLBACK: &str = "I couldn’t generate a reply.";

/// Reported when an upstream error body offers no message of its own.
pub const UPSTREAM_ERROR_FALLBACK: &str = "Gemini API error";

/// Backoff before the single retry when no usable retry-after arrives.
const RETRY_BACKOFF_DEFAULT: Duration = Duration::from_millis(1500);

/// The longest advertised retry-after honored, in seconds.
const RETRY_AFTER_CAP_SECS: f64 = 60.0;

/// Lenient mirror of the generateContent response body. Absent or null pieces
/// degrade to the fallback reply or message rather than failing the exchange.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default, deserialize_with = "null_to_default")]
    pub candidates: Vec<ReplyCandidate>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub usage_metadata: UsageMetadata,
    #[serde(default, deserialize_with = "null_to_default")]
    pub error: UpstreamErrorBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyCandidate {
    pub content: Option<ReplyContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyContent {
    #[serde(default, deserialize_with = "null_to_default")]
    pub parts: Vec<ReplyPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyPart {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamErrorBody {
    pub message: Option<String>,
    pub status: Option<String>,
}

/// Reads an explicit `null` as the field's default; `#[serde(default)]` alone
/// only covers an absent key.
fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// What one settled exchange with the upstream produced.
#[derive(Debug, Clone)]
pub struct UpstreamOutcome {
    pub status: StatusCode,
    /// Parsed response body; `None` when the body was not valid JSON.
    pub body: Option<GenerateContentResponse>,
    /// Validated retry-after from a throttling response.
    pub retry_after: Option<Duration>,
}

/// How the fallback orchestrator should treat one settled attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A 2xx reply worth relaying.
    Success,
    /// Still throttled after the single retry was spent.
    RetryableThrottle,
    /// The model is absent or blocked for this key; try the next candidate.
    SkippableUnavailable,
    /// Any other upstream failure; abort the chain.
    FatalUpstreamError,
}

impl UpstreamOutcome {
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn disposition(&self) -> Disposition {
        if self.status.is_success() {
            return Disposition::Success;
        }
        match self.status {
            StatusCode::TOO_MANY_REQUESTS => Disposition::RetryableThrottle,
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Disposition::SkippableUnavailable,
            _ => Disposition::FatalUpstreamError,
        }
    }

    /// The reply text to relay, trimmed, with the canned fallback when the
    /// body carries none. Text that trims to nothing is kept as-is.
    pub fn reply_text(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| body.candidates.first())
            .and_then(|candidate| candidate.content.as_ref())
            .and_then(|content| content.parts.first())
            .and_then(|part| part.text.as_deref())
            .map(str::trim)
            .unwrap_or(EMPTY_REPLY_FALLBACK)
            .to_string()
    }

    pub fn tokens_used(&self) -> u64 {
        self.body
            .as_ref()
            .map(|body| body.usage_metadata.total_token_count)
            .unwrap_or_default()
    }

    /// The curated failure message: `error.message`, else `error.status`,
    /// skipping empty strings, else the generic fallback.
    pub fn error_message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| {
                non_empty(body.error.message.as_deref())
                    .or_else(|| non_empty(body.error.status.as_deref()))
            })
            .unwrap_or(UPSTREAM_ERROR_FALLBACK)
            .to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

/// A client bound to one transport, one base URL, and one API key.
#[derive(Debug)]
pub struct GeminiClient<'a, T> {
    transport: &'a T,
    base_url: &'a Url,
    api_key: &'a str,
}

impl<'a, T: HttpClient> GeminiClient<'a, T> {
    pub fn new(transport: &'a T, base_url: &'a Url, api_key: &'a str) -> Self {
        Self {
            transport,
            base_url,
            api_key,
        }
    }

    /// POST one prompt at one model, retrying a single time when throttled.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<UpstreamOutcome, ChatError> {
        let first = self.attempt(model, prompt).await?;
        if first.status != StatusCode::TOO_MANY_REQUESTS {
            return Ok(first);
        }

        let backoff = first.retry_after.unwrap_or(RETRY_BACKOFF_DEFAULT);
        debug!(
            "Model {} throttled, retrying once after {}ms",
            model,
            backoff.as_millis()
        );
        tokio::time::sleep(backoff).await;
        self.attempt(model, prompt).await
    }

    async fn attempt(&self, model: &str, prompt: &str) -> Result<UpstreamOutcome, ChatError> {
        let endpoint = self.endpoint(model)?;
        let payload = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))?;

        let response = self
            .transport
            .request(req)
            .await
            .map_err(ChatError::Transport)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = serde_json::from_slice(&bytes).ok();

        debug!("Model {} answered with status {}", model, status.as_u16());
        Ok(UpstreamOutcome {
            status,
            body,
            retry_after,
        })
    }

    /// The full generateContent URI for one model. The API key rides in the
    /// query string, so the result must never be logged.
    fn endpoint(&self, model: &str) -> Result<Uri, ChatError> {
        let mut url = self.base_url.clone();
        let action = format!("{model}:generateContent");
        url.path_segments_mut()
            .map_err(|_| ChatError::UpstreamEndpoint(model.to_string()))?
            .pop_if_empty()
            .extend(["models", action.as_str()]);
        url.query_pairs_mut().append_pair("key", self.api_key);

        Uri::try_from(url.as_str()).map_err(|_| ChatError::UpstreamEndpoint(model.to_string()))
    }
}

/// Seconds advertised by a throttling response, honored only in (0, 60].
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: f64 = headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;

    (seconds > 0.0 && seconds <= RETRY_AFTER_CAP_SECS).then(|| Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, MockResponse};
    use rstest::rstest;

    fn settled(status: StatusCode, body: &str) -> UpstreamOutcome {
        UpstreamOutcome {
            status,
            body: serde_json::from_str(body).ok(),
            retry_after: None,
        }
    }

    #[test]
    fn test_full_body_yields_reply_and_tokens() {
        let outcome = settled(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"  Hello there.  "}]}}],"usageMetadata":{"totalTokenCount":42}}"#,
        );

        assert!(outcome.is_ok());
        assert_eq!(outcome.reply_text(), "Hello there.");
        assert_eq!(outcome.tokens_used(), 42);
    }

    #[test]
    fn test_whitespace_only_reply_is_kept() {
        let outcome = settled(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"   "}]}}]}"#,
        );
        assert_eq!(outcome.reply_text(), "");
    }

    #[test]
    fn test_missing_reply_falls_back_to_canned_text() {
        for body in [
            "{}",
            r#"{"candidates":[]}"#,
            r#"{"candidates":[{}]}"#,
            r#"{"candidates":[{"content":null}]}"#,
            r#"{"candidates":[{"content":{"parts":[]}}]}"#,
            r#"{"candidates":[{"content":{"parts":null}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":null}]}}]}"#,
            "not json",
        ] {
            assert_eq!(settled(StatusCode::OK, body).reply_text(), EMPTY_REPLY_FALLBACK);
        }
    }

    #[test]
    fn test_explicit_null_fields_read_as_absent() {
        let outcome = settled(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"real reply"}]}}],"usageMetadata":null}"#,
        );
        assert_eq!(outcome.reply_text(), "real reply");
        assert_eq!(outcome.tokens_used(), 0);

        let all_null = settled(
            StatusCode::OK,
            r#"{"candidates":null,"usageMetadata":{"totalTokenCount":null},"error":null}"#,
        );
        assert_eq!(all_null.reply_text(), EMPTY_REPLY_FALLBACK);
        assert_eq!(all_null.tokens_used(), 0);
        assert_eq!(all_null.error_message(), UPSTREAM_ERROR_FALLBACK);
    }

    #[test]
    fn test_error_message_preferred_over_status() {
        let outcome = settled(
            StatusCode::FORBIDDEN,
            r#"{"error":{"message":"blocked","status":"PERMISSION_DENIED"}}"#,
        );
        assert_eq!(outcome.error_message(), "blocked");
    }

    #[test]
    fn test_empty_error_fields_fall_through() {
        let with_status = settled(
            StatusCode::FORBIDDEN,
            r#"{"error":{"message":"","status":"PERMISSION_DENIED"}}"#,
        );
        assert_eq!(with_status.error_message(), "PERMISSION_DENIED");

        let with_neither = settled(StatusCode::FORBIDDEN, r#"{"error":{"message":"","status":""}}"#);
        assert_eq!(with_neither.error_message(), UPSTREAM_ERROR_FALLBACK);

        let unparseable = settled(StatusCode::BAD_GATEWAY, "upstream text");
        assert_eq!(unparseable.error_message(), UPSTREAM_ERROR_FALLBACK);
    }

    #[rstest]
    #[case(StatusCode::OK, Disposition::Success)]
    #[case(StatusCode::CREATED, Disposition::Success)]
    #[case(StatusCode::TOO_MANY_REQUESTS, Disposition::RetryableThrottle)]
    #[case(StatusCode::FORBIDDEN, Disposition::SkippableUnavailable)]
    #[case(StatusCode::NOT_FOUND, Disposition::SkippableUnavailable)]
    #[case(StatusCode::BAD_REQUEST, Disposition::FatalUpstreamError)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, Disposition::FatalUpstreamError)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, Disposition::FatalUpstreamError)]
    fn test_status_to_disposition(#[case] status: StatusCode, #[case] expected: Disposition) {
        assert_eq!(settled(status, "{}").disposition(), expected);
    }

    fn retry_after_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, value.parse().unwrap());
        headers
    }

    #[rstest]
    #[case("2", Some(Duration::from_secs(2)))]
    #[case("60", Some(Duration::from_secs(60)))]
    #[case("2.5", Some(Duration::from_millis(2500)))]
    #[case("0", None)]
    #[case("-3", None)]
    #[case("61", None)]
    #[case("soon", None)]
    fn test_retry_after_honored_only_when_sane(
        #[case] value: &str,
        #[case] expected: Option<Duration>,
    ) {
        assert_eq!(parse_retry_after(&retry_after_headers(value)), expected);
    }

    #[test]
    fn test_missing_retry_after_is_none() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_generate_posts_to_model_endpoint() {
        let transport = MockHttpClient::new(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#,
        );
        let base: Url = "https://generativelanguage.googleapis.com/v1beta"
            .parse()
            .unwrap();
        let client = GeminiClient::new(&transport, &base, "test-key");

        let outcome = client.generate("gemini-2.5-flash", "Say hi").await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.reply_text(), "hi");

        let requests = transport.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(
            requests[0].uri,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent?key=test-key"
        );

        let payload: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "Say hi");

        let content_type = requests[0]
            .headers
            .iter()
            .find(|(name, _)| name == "content-type")
            .map(|(_, value)| value.clone());
        assert_eq!(content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_trailing_slash_base_same_endpoint() {
        let transport = MockHttpClient::new(StatusCode::OK, "{}");
        let base: Url = "https://example.test/v1beta/".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        client.generate("m", "p").await.unwrap();
        assert_eq!(
            transport.get_requests()[0].uri,
            "https://example.test/v1beta/models/m:generateContent?key=k"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_attempt_retried_once() {
        let transport = MockHttpClient::scripted(vec![
            MockResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"message":"slow down"}}"#,
            ),
            MockResponse::new(
                StatusCode::OK,
                r#"{"candidates":[{"content":{"parts":[{"text":"ok"}]}}]}"#,
            ),
        ]);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let outcome = client.generate("m", "p").await.unwrap();
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.reply_text(), "ok");
        assert_eq!(transport.get_requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_throttle_returned_as_is() {
        let transport = MockHttpClient::scripted(vec![
            MockResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"message":"slow down"}}"#,
            ),
            MockResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"message":"still throttled"}}"#,
            ),
        ]);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let outcome = client.generate("m", "p").await.unwrap();
        assert_eq!(outcome.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(outcome.error_message(), "still throttled");
        assert_eq!(transport.get_requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertised_retry_after_sets_backoff() {
        let transport = MockHttpClient::scripted(vec![
            MockResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}").with_header("retry-after", "7"),
            MockResponse::new(StatusCode::OK, "{}"),
        ]);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let started = tokio::time::Instant::now();
        client.generate("m", "p").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_backoff_without_retry_after() {
        let transport = MockHttpClient::scripted(vec![
            MockResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}"),
            MockResponse::new(StatusCode::OK, "{}"),
        ]);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let started = tokio::time::Instant::now();
        client.generate("m", "p").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_retry_after_uses_default() {
        let transport = MockHttpClient::scripted(vec![
            MockResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}")
                .with_header("retry-after", "3600"),
            MockResponse::new(StatusCode::OK, "{}"),
        ]);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let started = tokio::time::Instant::now();
        client.generate("m", "p").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_non_throttle_failures_not_retried() {
        let transport =
            MockHttpClient::new(StatusCode::FORBIDDEN, r#"{"error":{"message":"no"}}"#);
        let base: Url = "https://example.test/v1beta".parse().unwrap();
        let client = GeminiClient::new(&transport, &base, "k");

        let outcome = client.generate("m", "p").await.unwrap();
        assert_eq!(outcome.status, StatusCode::FORBIDDEN);
        assert_eq!(transport.get_requests().len(), 1);
    }
}
