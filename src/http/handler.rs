//! Main axum router and HTTP request handlers for the forward-auth service.
//!
//! Routes:
//! - `ANY /validate` - Validate the bearer token and emit identity headers
//! - `GET /healthz`  - Health report
//! - `GET /ready`    - Readiness probe
//! - `GET /metrics`  - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::auth::outcome::{ErrorKind, Identity, ValidationError};
use crate::AppState;

const IDENTITY_HEADER_PREFIX: &str = "x-auth-user-";

const X_AUTH_USER_LOGIN: HeaderName = HeaderName::from_static("x-auth-user-login");
const X_AUTH_USER_ID: HeaderName = HeaderName::from_static("x-auth-user-id");
const X_AUTH_USER_ORG: HeaderName = HeaderName::from_static("x-auth-user-org");
const X_AUTH_USER_TEAMS: HeaderName = HeaderName::from_static("x-auth-user-teams");
const X_AUTH_USER_EMAIL: HeaderName = HeaderName::from_static("x-auth-user-email");

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/validate", any(handle_validate))
        .route("/healthz", get(crate::health::health_handler))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `ANY /validate`
///
/// Rejects requests that already carry identity headers, extracts the bearer
/// token and validates it within `auth.request_timeout`.  On success the
/// identity is returned as `X-Auth-User-*` response headers.
#[instrument(skip_all, fields(method = %request.method(), source_ip = tracing::field::Empty))]
async fn handle_validate(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, _body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let source_ip = source_ip(&parts.headers, peer);
    tracing::Span::current().record("source_ip", source_ip.as_str());

    // ---------- header injection ----------
    if let Some(name) = disallowed_header(&parts.headers) {
        warn!(header = name, "request contains injected identity header");
        return Err(AppError::DisallowedHeader);
    }

    // ---------- credentials ----------
    let token = parse_bearer_token(&parts.headers).ok_or_else(|| {
        warn!("missing or malformed Authorization header");
        AppError::MissingCredentials
    })?;

    // ---------- validation ----------
    let cancel = CancellationToken::new();
    let validation = state.validator.validate(token, &cancel);
    tokio::pin!(validation);

    let result = tokio::select! {
        result = &mut validation => result,
        _ = tokio::time::sleep(state.config.auth.request_timeout()) => {
            cancel.cancel();
            validation.await
        }
    };

    match result {
        Ok(identity) => {
            info!(login = %identity.login, user_id = identity.id, "authentication successful");
            identity_response(&identity)
        }
        Err(error) => {
            let retry_after = match error.kind() {
                ErrorKind::RateLimited => state.rate_limit.retry_after_secs(),
                _ => None,
            };
            Err(AppError::Denied { error, retry_after })
        }
    }
}

/// `GET /ready`
async fn handle_ready() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "ok")
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode()?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request already carried an `X-Auth-User-*` header.
    DisallowedHeader,
    /// No usable `Authorization: Bearer` header.
    MissingCredentials,
    /// The validator refused the token.
    Denied {
        error: ValidationError,
        retry_after: Option<u64>,
    },
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::DisallowedHeader => (
                StatusCode::FORBIDDEN,
                "forbidden: request contains disallowed headers",
            ),
            AppError::MissingCredentials => (
                StatusCode::UNAUTHORIZED,
                "missing or malformed Authorization header",
            ),
            AppError::Denied { error, .. } => match error.kind() {
                ErrorKind::Unauthorized => (StatusCode::UNAUTHORIZED, "access denied"),
                ErrorKind::NotMember => (StatusCode::FORBIDDEN, "access denied"),
                ErrorKind::ClassicPat => (
                    StatusCode::FORBIDDEN,
                    "forbidden: classic PATs are not allowed",
                ),
                ErrorKind::RateLimited => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate limit exceeded, try again later",
                ),
                ErrorKind::Cancelled => (StatusCode::GATEWAY_TIMEOUT, "upstream timeout"),
                ErrorKind::Internal => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
                }
            },
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(err) = &self {
            error!(error = %format!("{err:#}"), "internal server error");
        }

        let (status, message) = self.status_and_message();
        let mut response = (status, Json(ErrorBody { error: message })).into_response();

        if let AppError::Denied {
            retry_after: Some(secs),
            ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn identity_response(identity: &Identity) -> Result<Response, AppError> {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();

    headers.insert(X_AUTH_USER_LOGIN, header_value(&identity.login)?);
    headers.insert(X_AUTH_USER_ID, HeaderValue::from(identity.id));
    headers.insert(X_AUTH_USER_ORG, header_value(&identity.org)?);
    headers.insert(
        X_AUTH_USER_TEAMS,
        header_value(&identity.teams.join(","))?,
    );
    if let Some(email) = &identity.email {
        headers.insert(X_AUTH_USER_EMAIL, header_value(email)?);
    }

    Ok(response)
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("identity is not a valid header value: {e}")))
}

/// First request header whose name starts with `X-Auth-User-`.
fn disallowed_header(headers: &HeaderMap) -> Option<&str> {
    // Header names are stored lowercase.
    headers
        .keys()
        .map(HeaderName::as_str)
        .find(|name| name.starts_with(IDENTITY_HEADER_PREFIX))
}

/// Extract the token from `Authorization: Bearer <token>`.
fn parse_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Leftmost `X-Forwarded-For` entry, else the peer address.
fn source_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
