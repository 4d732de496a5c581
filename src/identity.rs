//! Client identity extraction for rate limiting
use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Identity reported when neither a forwarding header nor a peer address is known.
pub const UNKNOWN_IDENTITY: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// How the relay names a client for rate-limiting purposes.
///
/// A plain function pointer; deployments behind a different proxy topology can
/// swap the extraction without touching the handler.
pub type IdentityFn = fn(&HeaderMap, Option<SocketAddr>) -> String;

/// The default extractor: the first non-empty `x-forwarded-for` entry, else
/// the peer address, else [`UNKNOWN_IDENTITY`].
pub fn forwarded_for_or_peer(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        && let Some(first) = forwarded.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return first.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}
