use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    context::RequestContext,
    error::ServiceError,
    ratelimit::{PolicyManager, RateLimitDecision},
};

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
static LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
static POLICY: HeaderName = HeaderName::from_static("x-ratelimit-policy");

#[derive(Clone)]
pub struct RateLimitState {
    pub manager: Arc<PolicyManager>,
    /// Let requests through when the limiter itself fails.
    pub fail_open_on_error: bool,
    pub decision_timeout: Option<Duration>,
}

impl RateLimitState {
    pub fn new(manager: Arc<PolicyManager>) -> Self {
        Self {
            manager,
            fail_open_on_error: false,
            decision_timeout: None,
        }
    }
}

/// Admission check for `axum::middleware::from_fn_with_state`.
pub async fn rate_limit(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let request_id = request
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_parts(&parts, peer);
    let request = Request::from_parts(parts, body);

    let evaluated = match state.decision_timeout {
        Some(deadline) => state.manager.allow_with_deadline(&ctx, deadline).await,
        None => state.manager.allow(&ctx).await,
    };

    let outcome = match evaluated {
        Ok(outcome) => outcome,
        Err(err) if state.fail_open_on_error => {
            warn!(
                request_id = %request_id,
                policy = err.policy().unwrap_or_default(),
                error = %err,
                "rate limiter failed; allowing request because fail-open is enabled"
            );
            return with_request_id(next.run(request).await, &request_id);
        }
        Err(err) => {
            warn!(
                request_id = %request_id,
                policy = err.policy().unwrap_or_default(),
                error = %err,
                "rate limiter failed"
            );
            return with_request_id(ServiceError::from(err).into_response(), &request_id);
        }
    };

    let Some(policy) = outcome.policy.as_deref() else {
        return with_request_id(next.run(request).await, &request_id);
    };
    let decision = &outcome.decision;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(
            request_id = %request_id,
            policy = %policy,
            path = %ctx.path(),
            retry_after_secs = whole_secs(decision.retry_after),
            "request rate limited"
        );
        ServiceError::RateLimited {
            retry_after_secs: whole_secs(decision.retry_after),
        }
        .into_response()
    };

    quota_headers(response.headers_mut(), policy, decision);
    with_request_id(response, &request_id)
}

fn quota_headers(headers: &mut HeaderMap, policy: &str, decision: &RateLimitDecision) {
    if decision.limit > 0 {
        headers.insert(LIMIT.clone(), HeaderValue::from(decision.limit));
    }
    headers.insert(REMAINING.clone(), HeaderValue::from(decision.remaining));

    let reset = whole_secs(decision.reset_after);
    if reset > 0 {
        headers.insert(RESET.clone(), HeaderValue::from(reset));
    }
    if let Ok(value) = HeaderValue::from_str(policy) {
        headers.insert(POLICY.clone(), value);
    }
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    response
}

fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
