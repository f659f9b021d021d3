use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::auth::cache::ResultCache;
use crate::forge::rate_limit::RateLimitState;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_cache(cache: &ResultCache) -> CheckResult {
    if cache.ttl().is_zero() {
        return CheckResult::healthy("disabled");
    }
    let detail = format!("{} / {} entries", cache.len(), cache.max_size());
    if cache.is_sweeping() {
        CheckResult::healthy(detail)
    } else {
        CheckResult::unhealthy(format!("sweeper not running ({detail})"))
    }
}

fn check_upstream(rate_limit: &RateLimitState) -> CheckResult {
    match rate_limit.remaining() {
        None => CheckResult::healthy("rate limit not yet observed"),
        Some(0) => match rate_limit.retry_after_secs() {
            Some(0) => CheckResult::healthy("rate limit window has reset"),
            Some(secs) => CheckResult::unhealthy(format!("rate limit exhausted, resets in {secs}s")),
            None => CheckResult::unhealthy("rate limit exhausted"),
        },
        Some(n) => CheckResult::healthy(format!("{n} calls remaining")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache.ok {
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

pub fn check_health(cache: &ResultCache, rate_limit: &RateLimitState) -> HealthResponse {
    let checks = HealthChecks {
        cache: check_cache(cache),
        upstream: check_upstream(rate_limit),
    };
    HealthResponse {
        status: aggregate_status(&checks),
        checks,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = check_health(&state.cache, &state.rate_limit);

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
