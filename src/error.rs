use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Failures reported by a [`crate::storage::Storage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No live value exists for the key. Limiters treat this as fresh state.
    #[error("storage: value not found")]
    NotFound,

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage ttl must be positive")]
    InvalidTtl,
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Failures surfaced by `Limiter::allow` and `PolicyManager::allow`.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("corrupt rate limit state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("rate limit evaluation cancelled")]
    Cancelled,

    #[error("gave up updating {key} after repeated concurrent modification")]
    Contention { key: String },

    /// A failure inside the limiter of the named policy.
    #[error("policy {policy}: {source}")]
    Policy {
        policy: String,
        #[source]
        source: Box<RateLimitError>,
    },
}

impl RateLimitError {
    pub(crate) fn in_policy(policy: &str, err: RateLimitError) -> Self {
        Self::Policy {
            policy: policy.to_string(),
            source: Box::new(err),
        }
    }

    /// Name of the policy whose evaluation failed, when known.
    pub fn policy(&self) -> Option<&str> {
        match self {
            Self::Policy { policy, .. } => Some(policy),
            _ => None,
        }
    }

    /// The underlying failure with any policy context stripped.
    pub fn root(&self) -> &RateLimitError {
        match self {
            Self::Policy { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Invalid policy definitions. Only produced while building a manager.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("policy {policy}: algorithm.type is required")]
    MissingAlgorithm { policy: String },

    #[error("policy {policy}: unsupported algorithm: {kind}")]
    UnsupportedAlgorithm { policy: String, kind: String },

    #[error("policy {policy}: unsupported identity type {kind}")]
    UnsupportedIdentity { policy: String, kind: String },

    #[error("policy {policy}: {reason}")]
    InvalidParameter { policy: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(policy: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            policy: policy.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors rendered at the HTTP boundary.
#[derive(Debug)]
pub enum ServiceError {
    RateLimited { retry_after_secs: u64 },
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::RateLimited { .. } => "Rate limit exceeded".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.message(),
        }))
            .into_response();

        if let Self::RateLimited { retry_after_secs } = self
            && retry_after_secs > 0
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<RateLimitError> for ServiceError {
    fn from(err: RateLimitError) -> Self {
        match err.root() {
            RateLimitError::Cancelled => Self::Internal("rate limit evaluation timed out".to_string()),
            _ => Self::Internal("rate limiter backend unavailable".to_string()),
        }
    }
}
