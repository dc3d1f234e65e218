use std::{path::Path, sync::Arc, time::Duration};

use http::Method;
use throttle::{
    ManualClock, PolicyManager, RequestContext,
    config::PolicyFile,
    storage::{InMemoryStorage, Storage},
};

fn client(path: &str, ip: &str) -> RequestContext {
    RequestContext::get(path).header("x-forwarded-for", ip)
}

fn manager_from_yaml(yaml: &str, storage: Arc<dyn Storage>, clock: Arc<ManualClock>) -> PolicyManager {
    let file = PolicyFile::from_yaml(yaml).unwrap();
    PolicyManager::from_config_with_clock(&file.policies, storage, clock).unwrap()
}

async fn admitted(manager: &PolicyManager, req: &RequestContext) -> usize {
    let mut count = 0;
    while manager.allow(req).await.unwrap().allowed() {
        count += 1;
        assert!(count <= 1_000, "limiter never denied");
    }
    count
}

#[tokio::test]
async fn sample_policy_file_routes_to_each_algorithm() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/policies.yaml");
    let file = PolicyFile::from_file(&path).unwrap();
    let manager = PolicyManager::from_config_with_clock(
        &file.policies,
        Arc::new(InMemoryStorage::new()),
        Arc::new(ManualClock::default()),
    )
    .unwrap();

    let premium = client("/api/v1/premium/resource", "203.0.113.1").header("x-api-key", "gold");
    let outcome = manager.allow(&premium).await.unwrap();
    assert_eq!(outcome.policy.as_deref(), Some("premium-api-key"));
    assert_eq!(outcome.decision.limit, 100);

    let write = RequestContext::with_method(Method::POST, "/api/v1/payments").header("x-real-ip", "203.0.113.2");
    assert_eq!(manager.allow(&write).await.unwrap().policy.as_deref(), Some("payments-writes"));
    assert_eq!(admitted(&manager, &write).await, 4);

    let read = client("/api/v1/payments", "203.0.113.3");
    assert_eq!(admitted(&manager, &read).await, 20);

    let health = client("/healthz", "203.0.113.3");
    let outcome = manager.allow(&health).await.unwrap();
    assert!(outcome.allowed());
    assert!(!outcome.matched());
}

#[tokio::test]
async fn sliding_window_quota_resets_after_two_windows() {
    let clock = Arc::new(ManualClock::default());
    let manager = manager_from_yaml(
        r#"
policies:
  - name: burst
    algorithm: { type: sliding_window, limit: 2, window: 100ms }
"#,
        Arc::new(InMemoryStorage::new()),
        clock.clone(),
    );
    let req = client("/", "198.51.100.1");

    assert_eq!(admitted(&manager, &req).await, 2);
    clock.advance(Duration::from_millis(250));
    assert_eq!(admitted(&manager, &req).await, 2);
}

#[tokio::test]
async fn token_bucket_refills_over_time() {
    let clock = Arc::new(ManualClock::default());
    let manager = manager_from_yaml(
        r#"
policies:
  - name: api
    routes: ["/api/*"]
    algorithm: { type: token_bucket, limit: 5, interval: 10 }
"#,
        Arc::new(InMemoryStorage::new()),
        clock.clone(),
    );
    let req = client("/api/items", "198.51.100.2");

    assert_eq!(admitted(&manager, &req).await, 5);
    let denied = manager.allow(&req).await.unwrap();
    assert_eq!(denied.decision.retry_after, Duration::from_secs(2));

    clock.advance(Duration::from_secs(4));
    assert_eq!(admitted(&manager, &req).await, 2);
}

#[tokio::test]
async fn identities_are_limited_independently() {
    let manager = manager_from_yaml(
        r#"
policies:
  - name: api
    algorithm: { type: token_bucket, limit: 1 }
"#,
        Arc::new(InMemoryStorage::new()),
        Arc::new(ManualClock::default()),
    );

    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        assert_eq!(admitted(&manager, &client("/", ip)).await, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn instances_sharing_storage_respect_one_capacity() {
    let yaml = r#"
policies:
  - name: shared
    algorithm: { type: token_bucket, limit: 10, interval: 1m }
"#;
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(ManualClock::default());
    let instances = [
        Arc::new(manager_from_yaml(yaml, storage.clone(), clock.clone())),
        Arc::new(manager_from_yaml(yaml, storage, clock)),
    ];

    let handles: Vec<_> = (0..80)
        .map(|i| {
            let manager = instances[i % 2].clone();
            tokio::spawn(async move { manager.allow(&client("/", "192.0.2.50")).await.unwrap().allowed() })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
}
