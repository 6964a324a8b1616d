//! HTTP Gate Middleware (spec §4.9): session lookup, public-path bypass,
//! and the role gate. Built as `axum::middleware::from_fn_with_state`
//! layers, the same composition style the teacher's `main.rs` uses for its
//! request pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::permissions::Role;
use crate::rate_limit::RateLimiter;
use crate::session::{Identity, SessionStore};

pub struct GateState {
    pub sessions: Arc<SessionStore>,
    pub auth_enabled: bool,
    pub public_paths: Vec<String>,
    pub session_cookie_name: String,
}

/// The principal attached to the request extensions on a successful gate
/// pass. Handlers extract this with `Extension<AuthenticatedPrincipal>`.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub identity: Identity,
    pub must_change_password: bool,
}

pub async fn gate(
    State(state): State<Arc<GateState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !state.auth_enabled {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if state.public_paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
        return next.run(request).await;
    }

    let Some(token) = extract_token(request.headers(), &state.session_cookie_name) else {
        return unauthorized_response(request.headers(), path);
    };

    match state.sessions.validate(&token).await {
        Some(session) => {
            request.extensions_mut().insert(AuthenticatedPrincipal {
                identity: session.identity,
                must_change_password: session.must_change_password,
            });
            next.run(request).await
        }
        None => unauthorized_response(request.headers(), path),
    }
}

/// State for [`require_role`]: the role a route requires, carried
/// alongside the gate state so the middleware stays a plain
/// `from_fn_with_state` function instead of a closure factory.
#[derive(Clone)]
pub struct RoleGateState {
    pub required: Role,
}

/// Role gate: accept iff the principal's role equals `required` or the
/// principal is admin — admin supremacy is intentional (spec §9), not the
/// lattice's `>=` comparison.
pub async fn require_role(
    State(gate_state): State<Arc<RoleGateState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<AuthenticatedPrincipal>().cloned() else {
        return unauthorized_response(request.headers(), request.uri().path());
    };
    if principal.identity.role == gate_state.required || principal.identity.role == Role::Admin {
        next.run(request).await
    } else {
        forbidden_response(request.headers())
    }
}

/// Rate Limiter gate, run ahead of the session gate in the pipeline
/// (spec §2 "Flow"). Admits or returns 429 with `Retry-After: 1`.
pub async fn rate_limit_gate(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_ip(request.headers(), remote);
    if limiter.check(&key) {
        next.run(request).await
    } else {
        crate::error::GatewayError::RateLimited.into_response()
    }
}

/// §4.2 "Client-IP extraction contract": prefer the first
/// comma-separated `X-Forwarded-For` value, else `X-Real-IP`, else the
/// transport's remote address.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        if !real_ip.trim().is_empty() {
            return real_ip.trim().to_string();
        }
    }
    remote.ip().to_string()
}

fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    extract_cookie(headers, cookie_name).or_else(|| extract_bearer(headers))
}

fn extract_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let mut parts = pair.trim().splitn(2, '=');
        let name = parts.next()?.trim();
        let value = parts.next()?.trim();
        (name == cookie_name).then(|| value.to_string())
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(|token| token.to_string())
}

fn wants_json(headers: &HeaderMap, path: &str) -> bool {
    if path.starts_with("/api/") {
        return true;
    }
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false)
}

fn unauthorized_response(headers: &HeaderMap, path: &str) -> Response {
    if wants_json(headers, path) {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized", "message": "authentication required" })),
        )
            .into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "authentication required").into_response()
    }
}

fn forbidden_response(headers: &HeaderMap) -> Response {
    if headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false)
    {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "forbidden", "message": "insufficient role" })),
        )
            .into_response()
    } else {
        (StatusCode::FORBIDDEN, "insufficient role").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_cookie_finds_named_cookie_among_several() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; avika_session=tok123; third=2"),
        );
        assert_eq!(
            extract_cookie(&headers, "avika_session"),
            Some("tok123".to_string())
        );
    }

    #[test]
    fn extract_bearer_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer(&headers), Some("abc".to_string()));
    }

    #[test]
    fn token_extraction_prefers_cookie_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("avika_session=from-cookie"),
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            extract_token(&headers, "avika_session"),
            Some("from-cookie".to_string())
        );
    }

    #[test]
    fn client_ip_prefers_forwarded_for_then_real_ip_then_remote() {
        let remote: SocketAddr = "10.0.0.9:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        assert_eq!(client_ip(&headers, remote), "1.2.3.4");

        let mut real_ip_only = HeaderMap::new();
        real_ip_only.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&real_ip_only, remote), "9.9.9.9");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, remote), "10.0.0.9");
    }

    #[test]
    fn json_is_requested_for_api_paths_or_explicit_accept_header() {
        let headers = HeaderMap::new();
        assert!(wants_json(&headers, "/api/servers"));
        assert!(!wants_json(&headers, "/dashboard"));

        let mut json_headers = HeaderMap::new();
        json_headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(wants_json(&json_headers, "/dashboard"));
    }
}
