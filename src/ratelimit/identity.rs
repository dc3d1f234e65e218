//! Strategies for deriving a rate-limit identity from a request.

use http::HeaderName;

use crate::{config::IdentityConfig, context::RequestContext, error::ConfigError};

const DEFAULT_IDENTITY_HEADER: &str = "x-api-key";

static FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityExtractor {
    ClientIp,
    Header { name: HeaderName, fallback_to_ip: bool },
    Query { param: String, fallback_to_ip: bool },
}

impl IdentityExtractor {
    pub fn from_config(policy: &str, cfg: &IdentityConfig) -> Result<Self, ConfigError> {
        let fallback_to_ip = cfg.fallback.eq_ignore_ascii_case("ip");

        match cfg.kind.to_ascii_lowercase().as_str() {
            "" | "ip" => Ok(Self::ClientIp),
            "header" | "api_key" => {
                let raw = if cfg.key.is_empty() { DEFAULT_IDENTITY_HEADER } else { cfg.key.as_str() };
                let name = HeaderName::from_bytes(raw.as_bytes())
                    .map_err(|_| ConfigError::invalid(policy, format!("invalid identity header {raw}")))?;
                Ok(Self::Header { name, fallback_to_ip })
            }
            "query" => {
                if cfg.key.is_empty() {
                    return Err(ConfigError::invalid(
                        policy,
                        "identity.key is required for query identity",
                    ));
                }
                Ok(Self::Query {
                    param: cfg.key.clone(),
                    fallback_to_ip,
                })
            }
            _ => Err(ConfigError::UnsupportedIdentity {
                policy: policy.to_string(),
                kind: cfg.kind.clone(),
            }),
        }
    }

    /// Identity for `req`; an empty string means none could be derived.
    pub fn extract(&self, req: &RequestContext) -> String {
        match self {
            Self::ClientIp => client_ip(req),
            Self::Header { name, fallback_to_ip } => {
                or_client_ip(req.header_value(name).to_string(), *fallback_to_ip, req)
            }
            Self::Query { param, fallback_to_ip } => {
                or_client_ip(req.query_param(param), *fallback_to_ip, req)
            }
        }
    }
}

fn or_client_ip(value: String, fallback_to_ip: bool, req: &RequestContext) -> String {
    if value.is_empty() && fallback_to_ip {
        client_ip(req)
    } else {
        value
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
pub fn client_ip(req: &RequestContext) -> String {
    let forwarded = req
        .header_value(&FORWARDED_FOR)
        .split(',')
        .next()
        .map(str::trim)
        .unwrap_or("");
    if !forwarded.is_empty() {
        return forwarded.to_string();
    }

    let real_ip = req.header_value(&REAL_IP).trim();
    if !real_ip.is_empty() {
        return real_ip.to_string();
    }

    req.peer_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "192.0.2.10:54321".parse().unwrap()
    }

    fn identity(kind: &str, key: &str, fallback: &str) -> IdentityConfig {
        IdentityConfig {
            kind: kind.to_string(),
            key: key.to_string(),
            fallback: fallback.to_string(),
        }
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let req = RequestContext::get("/")
            .header("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .peer(peer());
        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_then_peer() {
        let req = RequestContext::get("/").header("x-real-ip", "198.51.100.2").peer(peer());
        assert_eq!(client_ip(&req), "198.51.100.2");

        let req = RequestContext::get("/").peer(peer());
        assert_eq!(client_ip(&req), "192.0.2.10");

        assert_eq!(client_ip(&RequestContext::get("/")), "");
    }

    #[test]
    fn test_header_identity_defaults_to_api_key_header() {
        let extractor = IdentityExtractor::from_config("p", &identity("api_key", "", "")).unwrap();
        let req = RequestContext::get("/").header("X-API-Key", "k-123").peer(peer());
        assert_eq!(extractor.extract(&req), "k-123");
        assert_eq!(extractor.extract(&RequestContext::get("/").peer(peer())), "");
    }

    #[test]
    fn test_header_identity_with_ip_fallback() {
        let extractor = IdentityExtractor::from_config("p", &identity("header", "X-Tenant", "IP")).unwrap();
        let with_header = RequestContext::get("/").header("x-tenant", "acme").peer(peer());
        assert_eq!(extractor.extract(&with_header), "acme");
        assert_eq!(extractor.extract(&RequestContext::get("/").peer(peer())), "192.0.2.10");
    }

    #[test]
    fn test_query_identity() {
        let extractor = IdentityExtractor::from_config("p", &identity("query", "token", "ip")).unwrap();
        let req = RequestContext::get("/items?token=abc").peer(peer());
        assert_eq!(extractor.extract(&req), "abc");
        assert_eq!(extractor.extract(&RequestContext::get("/items").peer(peer())), "192.0.2.10");

        let strict = IdentityExtractor::from_config("p", &identity("query", "token", "")).unwrap();
        assert_eq!(strict.extract(&RequestContext::get("/items").peer(peer())), "");
    }

    #[test]
    fn test_query_identity_requires_key() {
        let err = IdentityExtractor::from_config("p", &identity("query", "", "")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));
    }

    #[test]
    fn test_unknown_identity_type() {
        let err = IdentityExtractor::from_config("p", &identity("cookie", "sid", "")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedIdentity { .. }));
    }

    #[test]
    fn test_default_identity_is_ip() {
        assert_eq!(
            IdentityExtractor::from_config("p", &IdentityConfig::default()).unwrap(),
            IdentityExtractor::ClientIp
        );
    }
}
