use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::token::{extract_token, RequestMeta, TokenResult};

use super::AppState;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Caller identity pulled from a request: client address, user agent and
/// the presented token, if any.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub meta: RequestMeta,
    pub token: TokenResult<String>,
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = if state.http.trust_forwarded_for {
            forwarded_for(&parts.headers).or(peer)
        } else {
            peer
        };
        let user_agent = header_str(&parts.headers, USER_AGENT.as_str()).map(str::to_string);
        let token = extract_token(
            parts.uri.query(),
            header_str(&parts.headers, AUTHORIZATION.as_str()),
        );
        Ok(Self {
            meta: RequestMeta { ip, user_agent },
            token,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// First hop of `X-Forwarded-For`.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    header_str(headers, FORWARDED_FOR)?
        .split(',')
        .next()
        .and_then(|hop| hop.trim().parse().ok())
}
