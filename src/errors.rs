/// Errors raised while relaying a chat request upstream
///
/// These never reach clients directly; the handler resolves every one of them
/// into a generic envelope and logs the detail server-side.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("could not build an upstream endpoint for model '{0}'")]
    UpstreamEndpoint(String),

    #[error("failed to build the upstream request: {0}")]
    RequestBuild(#[from] axum::http::Error),

    #[error("upstream transport failure: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to read the upstream response body: {0}")]
    BodyRead(#[from] axum::Error),
}
