use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Json, Router, middleware::from_fn_with_state, routing::get};
use serde_json::{Value, json};
use tokio::{net::TcpListener, signal, sync::Notify};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttle::{
    config::{ServiceConfig, StorageConfig},
    middleware::{RateLimitState, rate_limit},
    ratelimit::PolicyManager,
    storage::{InMemoryStorage, RedisStorage, Storage},
};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ServiceConfig::from_env().context("failed to build service config")?;
    let storage = build_storage(&cfg.storage).await?;
    let policies = cfg.load_policies()?;
    let manager = PolicyManager::from_config(&policies.policies, storage)
        .context("failed to build rate limit policies")?;

    let state = RateLimitState {
        manager: Arc::new(manager),
        fail_open_on_error: cfg.fail_open_on_error,
        decision_timeout: cfg.decision_timeout,
    };

    let api = Router::new()
        .route("/api/v1/payments", get(payments))
        .route("/api/v1/premium/resource", get(premium_resource))
        .route_layer(from_fn_with_state(state, rate_limit));

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(api)
        .fallback(banner);

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;

    info!(addr = %cfg.bind_addr, policies = policies.policies.len(), "rate limiter listening");

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown({
            let stop = stop.clone();
            async move { stop.notified().await }
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => res.context("server error")?,
        () = shutdown_signal() => {
            stop.notify_one();
            match tokio::time::timeout(cfg.shutdown_grace, &mut server).await {
                Ok(res) => res.context("server error during shutdown")?,
                Err(_) => warn!(grace = ?cfg.shutdown_grace, "in-flight requests did not finish before the grace period"),
            }
        }
    }

    info!("rate limiter stopped");
    Ok(())
}

async fn build_storage(cfg: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match cfg {
        StorageConfig::InMemory => {
            let storage = Arc::new(InMemoryStorage::new());
            let sweeper = storage.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    let purged = sweeper.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, live = sweeper.len(), "purged expired limiter state");
                    }
                }
            });
            info!("using in-memory storage");
            Ok(storage as Arc<dyn Storage>)
        }
        StorageConfig::Redis {
            url,
            key_prefix,
            op_timeout,
        } => {
            let storage = RedisStorage::new(url.clone(), key_prefix.clone(), *op_timeout)
                .await
                .context("failed to connect to redis")?;
            info!(key_prefix = %key_prefix, timeout = ?op_timeout, "using redis storage");
            Ok(Arc::new(storage))
        }
    }
}

async fn payments() -> Json<Value> {
    Json(json!({ "resource": "payments", "status": "ok" }))
}

async fn premium_resource() -> Json<Value> {
    Json(json!({ "resource": "premium", "status": "ok" }))
}

async fn banner() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hyper=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
