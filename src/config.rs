use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer};
use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub policy_file: PathBuf,
    pub fail_open_on_error: bool,
    /// Upper bound on a single rate limit evaluation; `None` waits for storage.
    pub decision_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    InMemory,
    Redis {
        url: String,
        key_prefix: String,
        op_timeout: Duration,
    },
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let storage = match env::var("STORAGE_DRIVER")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StorageConfig::InMemory,
            "redis" => StorageConfig::Redis {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_default(),
                op_timeout: Duration::from_millis(parse_env("REDIS_TIMEOUT_MS", 250u64).max(1)),
            },
            other => return Err(anyhow!("unsupported STORAGE_DRIVER: {other}")),
        };

        Ok(Self {
            bind_addr,
            storage,
            policy_file: env::var("POLICY_FILE")
                .unwrap_or_else(|_| "config/policies.yaml".to_string())
                .into(),
            fail_open_on_error: parse_env("RATE_LIMIT_FAIL_OPEN", false),
            decision_timeout: Some(parse_env("RATE_LIMIT_TIMEOUT_MS", 0u64))
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            shutdown_grace: Duration::from_secs(parse_env("SHUTDOWN_GRACE_SECS", 10u64)),
        })
    }

    /// Policies from `policy_file`, or the built-in set when the file does not exist.
    pub fn load_policies(&self) -> Result<PolicyFile> {
        if !self.policy_file.exists() {
            info!(path = %self.policy_file.display(), "policy file not found; using built-in policies");
            return Ok(PolicyFile::builtin());
        }
        PolicyFile::from_file(&self.policy_file)
    }
}

/// Ordered list of policy definitions, evaluated first-match-wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// `ip` (default), `header` / `api_key`, or `query`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Header or query parameter name.
    #[serde(default)]
    pub key: String,
    /// `ip` to fall back to the client address when the primary source is empty.
    #[serde(default)]
    pub fallback: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub burst: i64,
    #[serde(default)]
    pub refill_rate: i64,
    #[serde(default, deserialize_with = "optional_duration")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub leak_rate: f64,
    #[serde(default, deserialize_with = "optional_duration")]
    pub window: Option<Duration>,
    /// Overrides the algorithm's default state ttl.
    #[serde(default, deserialize_with = "optional_duration")]
    pub ttl: Option<Duration>,
}

impl PolicyFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading rate limit policies");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse rate limit policies")
    }

    pub fn builtin() -> Self {
        Self {
            policies: vec![
                PolicyConfig {
                    name: "premium-api-key".to_string(),
                    routes: vec!["/api/v1/premium/*".to_string()],
                    methods: Vec::new(),
                    identity: IdentityConfig {
                        kind: "header".to_string(),
                        key: "X-API-Key".to_string(),
                        fallback: "ip".to_string(),
                    },
                    algorithm: AlgorithmConfig {
                        kind: "sliding_window".to_string(),
                        limit: 100,
                        window: Some(Duration::from_secs(60)),
                        ..AlgorithmConfig::default()
                    },
                },
                PolicyConfig {
                    name: "per-ip".to_string(),
                    routes: vec!["/api/*".to_string()],
                    methods: Vec::new(),
                    identity: IdentityConfig::default(),
                    algorithm: AlgorithmConfig {
                        kind: "token_bucket".to_string(),
                        limit: 10,
                        interval: Some(Duration::from_secs(1)),
                        ..AlgorithmConfig::default()
                    },
                },
            ],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(humantime_serde::Serde<Duration>),
}

/// Accepts `"1s"`, `"200ms"`, `"1m 30s"` or a bare integer number of seconds.
fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawDuration>::deserialize(deserializer)?.map(|raw| match raw {
        RawDuration::Seconds(secs) => Duration::from_secs(secs),
        RawDuration::Text(text) => text.into_inner(),
    }))
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
