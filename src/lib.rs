//! Banter - a thin chat relay for the Gemini generative-language API
//!
//! This library provides the core functionality for relaying browser chat
//! prompts upstream: shared-secret authentication, per-client fixed-window
//! rate limiting, sequential model fallback with a single retry on throttle,
//! and a uniform response envelope for every outcome.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod fallback;
pub mod gemini;
pub mod handlers;
pub mod identity;
pub mod rate_limit;

use auth::ConstantTimeString;
use client::{HttpClient, HyperClient};
use config::Config;
use handlers::{chat_handler, health, method_not_allowed, preflight};
use identity::IdentityFn;
use rate_limit::RateLimiter;

/// The main application state containing the HTTP client, configuration,
/// limiter, and identity extraction
#[derive(Clone)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub config: Arc<Config>,
    pub limiter: RateLimiter,
    pub client_key: Option<ConstantTimeString>,
    pub identity: IdentityFn,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(config: Config) -> Self {
        Self::with_client(config, client::create_hyper_client())
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(config: Config, http_client: T) -> Self {
        let limiter = RateLimiter::builder()
            .limit(config.rate_limit_count)
            .window(std::time::Duration::from_millis(config.rate_limit_window_ms))
            .build();
        let client_key = config.client_key.clone().map(ConstantTimeString::from);
        Self {
            http_client,
            config: Arc::new(config),
            limiter,
            client_key,
            identity: identity::forwarded_for_or_peer,
        }
    }

    /// Swap the identity extraction used for rate limiting
    pub fn with_identity(mut self, identity: IdentityFn) -> Self {
        self.identity = identity;
        self
    }
}

impl<T: HttpClient> std::fmt::Debug for AppState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("http_client", &self.http_client)
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("client_key", &self.client_key)
            .field("identity", &"<fn>")
            .finish()
    }
}

/// Build the main router for the relay
/// This creates routes for:
/// - `POST /api/chat` - the chat endpoint; OPTIONS is answered for preflights
///   and every other verb gets the method-not-allowed envelope
/// - `GET /api/health` - liveness probe
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route(
            "/api/chat",
            post(chat_handler::<T>)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route("/api/health", get(health))
        .layer(create_cors_layer())
        .with_state(state)
}

/// Permissive CORS for the browser client: any origin, method, and header,
/// with response headers readable cross-origin.
fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// The prefix uses `impl Into<Cow<'static, str>>` so either a string literal
/// or an owned string works; the metrics layer requires it to live for the
/// duration of the program.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

pub mod test_utils {
    //! Transport doubles shared by unit and integration tests.
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One canned upstream response.
    #[derive(Debug, Clone)]
    pub struct MockResponse {
        pub status: StatusCode,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl MockResponse {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }
        }

        pub fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_string(), value.to_string()));
            self
        }
    }

    /// A recording transport that replays a script of canned responses.
    /// The final response repeats once the script runs out.
    #[derive(Debug, Clone)]
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        script: Arc<Mutex<VecDeque<MockResponse>>>,
    }

    /// What one forwarded request looked like on the wire.
    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        /// A transport that always answers with the same response.
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self::scripted(vec![MockResponse::new(status, body)])
        }

        /// A transport that answers with each scripted response in turn.
        pub fn scripted(responses: Vec<MockResponse>) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                script: Arc::new(Mutex::new(responses.into())),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn next_response(&self) -> MockResponse {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script
                    .front()
                    .cloned()
                    .unwrap_or(MockResponse::new(StatusCode::OK, ""))
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            // Record the request details before consuming the body
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();
            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            let canned = self.next_response();
            let mut builder = axum::response::Response::builder().status(canned.status);
            for (name, value) in &canned.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            Ok(builder.body(axum::body::Body::from(canned.body)).unwrap())
        }
    }

    /// A transport that always fails at the connection level.
    #[derive(Debug, Clone)]
    pub struct FailingHttpClient;

    #[async_trait]
    impl HttpClient for FailingHttpClient {
        async fn request(
            &self,
            _req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            Err("connection refused".into())
        }
    }

    /// A transport that never resolves, for exercising deadlines.
    #[derive(Debug, Clone)]
    pub struct HangingHttpClient;

    #[async_trait]
    impl HttpClient for HangingHttpClient {
        async fn request(
            &self,
            _req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            std::future::pending().await
        }
    }
}
