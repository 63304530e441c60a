//! Client identity used for rate limits, concurrency caps and poll throttling.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

pub static X_CLIENT_ID: &str = "x-client-id";

const MAX_CLIENT_ID_LEN: usize = 128;

/// `x-client-id` header if present, else the peer IP, else `"anonymous"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for ClientId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(X_CLIENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= MAX_CLIENT_ID_LEN);
        if let Some(id) = header {
            return Ok(Self(id.to_owned()));
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(peer.unwrap_or_else(|| "anonymous".to_owned())))
    }
}

#[cfg(test)]
mod test {
    use axum::http::Request;

    use super::*;

    async fn client_of(req: Request<()>) -> ClientId {
        let (mut parts, ()) = req.into_parts();
        ClientId::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn header_wins_over_peer_address() {
        let mut req = Request::builder().header(X_CLIENT_ID, " alice ").body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));
        assert_eq!(client_of(req).await.as_str(), "alice");
    }

    #[tokio::test]
    async fn falls_back_to_peer_then_anonymous() {
        let mut req = Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));
        assert_eq!(client_of(req).await.as_str(), "10.0.0.7");

        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_of(req).await.as_str(), "anonymous");
    }
}
