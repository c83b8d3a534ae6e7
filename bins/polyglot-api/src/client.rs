// Caller identity for rate limiting

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use polyglot_engine::ClientKey;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rate-limit key of the caller, resolved from the peer address and the
/// `x-api-key` header according to the configured keying mode
pub struct ClientIdentity(pub ClientKey);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Absent when the router is driven without a socket (tests)
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let api_key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        Ok(ClientIdentity(ClientKey::resolve(
            state.rate_limit_key,
            ip.as_deref(),
            api_key,
        )))
    }
}
