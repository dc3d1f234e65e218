use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    clock::{Clock, SystemClock},
    config::{AlgorithmConfig, PolicyConfig},
    context::RequestContext,
    error::{ConfigError, RateLimitError, RateLimitResult},
    ratelimit::{
        Algorithm, IdentityExtractor, LeakyBucketLimiter, Limiter, RateLimitDecision,
        SlidingWindowLimiter, TokenBucketLimiter, routes::RoutePattern,
    },
    storage::Storage,
};

/// Binds route and method criteria plus an identity strategy to one limiter.
pub struct Policy {
    pub name: String,
    routes: Vec<RoutePattern>,
    methods: Vec<String>,
    identity: IdentityExtractor,
    limiter: Arc<dyn Limiter>,
}

impl Policy {
    pub fn new(name: impl Into<String>, identity: IdentityExtractor, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            methods: Vec::new(),
            identity,
            limiter,
        }
    }

    pub fn routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.routes = routes.into_iter().map(|r| RoutePattern::parse(r.as_ref())).collect();
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.limiter.algorithm()
    }

    /// Empty method or route lists match anything.
    pub fn matches(&self, req: &RequestContext) -> bool {
        let method_ok = self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(req.method.as_str()));

        method_ok
            && (self.routes.is_empty() || self.routes.iter().any(|r| r.matches(req.path())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerDecision {
    pub decision: RateLimitDecision,
    /// Name of the policy that evaluated the request; `None` when unmetered.
    pub policy: Option<String>,
}

impl ManagerDecision {
    pub fn unmatched() -> Self {
        Self {
            decision: RateLimitDecision::unmetered(),
            policy: None,
        }
    }

    pub fn matched(&self) -> bool {
        self.policy.is_some()
    }

    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }
}

/// Ordered, first-match-wins policy list.
pub struct PolicyManager {
    policies: Vec<Policy>,
}

impl PolicyManager {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    pub fn from_config(configs: &[PolicyConfig], storage: Arc<dyn Storage>) -> Result<Self, ConfigError> {
        Self::from_config_with_clock(configs, storage, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        configs: &[PolicyConfig],
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let mut policies = Vec::with_capacity(configs.len());

        for cfg in configs {
            if cfg.algorithm.kind.trim().is_empty() {
                return Err(ConfigError::MissingAlgorithm {
                    policy: cfg.name.clone(),
                });
            }

            let identity = IdentityExtractor::from_config(&cfg.name, &cfg.identity)?;
            let limiter = build_limiter(&cfg.name, &cfg.algorithm, storage.clone(), clock.clone())?;

            info!(
                policy = %cfg.name,
                algorithm = %limiter.algorithm(),
                routes = ?cfg.routes,
                methods = ?cfg.methods,
                "rate limit policy loaded"
            );

            policies.push(
                Policy::new(cfg.name.clone(), identity, limiter)
                    .routes(&cfg.routes)
                    .methods(cfg.methods.iter().cloned()),
            );
        }

        Ok(Self::new(policies))
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Evaluates `req` against the first matching policy that yields an identity.
    ///
    /// Requests no policy applies to are allowed unconditionally.
    pub async fn allow(&self, req: &RequestContext) -> RateLimitResult<ManagerDecision> {
        for policy in &self.policies {
            if !policy.matches(req) {
                continue;
            }

            let key = policy.identity.extract(req);
            if key.is_empty() {
                debug!(policy = %policy.name, "no identity for request; trying next policy");
                continue;
            }

            let decision = policy
                .limiter
                .allow(&key)
                .await
                .map_err(|err| RateLimitError::in_policy(&policy.name, err))?;
            debug!(
                policy = %policy.name,
                key = %key,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "rate limit decision"
            );

            return Ok(ManagerDecision {
                decision,
                policy: Some(policy.name.clone()),
            });
        }

        Ok(ManagerDecision::unmatched())
    }

    /// Like [`allow`](Self::allow), giving up with `Cancelled` once `deadline` elapses.
    pub async fn allow_with_deadline(
        &self,
        req: &RequestContext,
        deadline: Duration,
    ) -> RateLimitResult<ManagerDecision> {
        tokio::time::timeout(deadline, self.allow(req))
            .await
            .map_err(|_| RateLimitError::Cancelled)?
    }
}

fn build_limiter(
    policy: &str,
    cfg: &AlgorithmConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Limiter>, ConfigError> {
    let algorithm: Algorithm = cfg.kind.trim().parse().map_err(|kind| ConfigError::UnsupportedAlgorithm {
        policy: policy.to_string(),
        kind,
    })?;
    let prefix = format!("{}:{policy}", algorithm.key_prefix());
    let ttl = cfg.ttl.unwrap_or_default();

    let limiter: Arc<dyn Limiter> = match algorithm {
        Algorithm::TokenBucket => {
            let burst = if cfg.burst <= 0 { cfg.limit } else { cfg.burst };
            let refill_rate = if cfg.refill_rate <= 0 { cfg.limit } else { cfg.refill_rate };
            let interval = cfg
                .interval
                .filter(|i| !i.is_zero())
                .unwrap_or(Duration::from_secs(1));

            let limiter = TokenBucketLimiter::new(
                storage,
                positive(policy, "capacity", burst)?,
                positive(policy, "refill_rate", refill_rate)?,
                interval,
                prefix,
            )
            .map_err(|e| relabel(policy, e))?;
            Arc::new(limiter.with_clock(clock).with_ttl(ttl))
        }
        Algorithm::LeakyBucket => {
            let limiter = LeakyBucketLimiter::new(storage, positive(policy, "limit", cfg.limit)?, cfg.leak_rate, prefix)
                .map_err(|e| relabel(policy, e))?;
            Arc::new(limiter.with_clock(clock).with_ttl(ttl))
        }
        Algorithm::SlidingWindow => {
            let window = cfg.window.unwrap_or_default();
            let limiter = SlidingWindowLimiter::new(storage, positive(policy, "limit", cfg.limit)?, window, prefix)
                .map_err(|e| relabel(policy, e))?;
            Arc::new(limiter.with_clock(clock).with_ttl(ttl))
        }
    };

    Ok(limiter)
}

fn positive(policy: &str, field: &str, value: i64) -> Result<u32, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::invalid(policy, format!("{field} must be > 0")));
    }
    u32::try_from(value).map_err(|_| ConfigError::invalid(policy, format!("{field} is too large")))
}

/// Limiter constructors only know their key prefix; report the policy name instead.
fn relabel(policy: &str, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::InvalidParameter { reason, .. } => ConfigError::invalid(policy, reason),
        other => other,
    }
}
