//! Integration-level smoke tests over the public `Runtime` surface: one
//! sled database backing both the bus and the KV namespace (spec.md §6),
//! wired through to a working scheduler and observer.

use conductor_core::envelope::Priority;
use conductor_core::scheduler::{HandlerKind, RetryPolicy};
use conductor_core::RuntimeConfig;
use conductor_core::Runtime;

fn test_config(data_dir: &std::path::Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.kv.data_dir = data_dir.to_string_lossy().into_owned();
    config.kv.namespace = "itest".to_string();
    config
}

#[tokio::test]
async fn open_wires_kv_bus_and_scheduler_over_one_database() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::open(&test_config(dir.path())).unwrap();

    // The KV store and bus are both backed by the same on-disk database;
    // a KV write should be durable and independently readable.
    runtime
        .kv
        .set("probe", b"alive".to_vec(), None)
        .await
        .unwrap();
    let value = runtime.kv.get("probe").await.unwrap();
    assert_eq!(value, Some(b"alive".to_vec()));

    let bus_health = runtime.bus.health().await.unwrap();
    assert!(bus_health.ok);

    let kv_health = runtime.kv.health().await.unwrap();
    assert!(kv_health.ok);
}

#[tokio::test]
async fn scheduled_jobs_are_visible_through_the_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::open(&test_config(dir.path())).unwrap();

    let job = runtime
        .scheduler
        .schedule(
            "echo".to_string(),
            HandlerKind::Agent,
            "*/5 * * * *".to_string(),
            "UTC".to_string(),
            serde_json::json!({"n": 1}),
            RetryPolicy::default(),
            5_000,
            Priority::Medium,
            1,
            false,
        )
        .await
        .unwrap();

    let jobs = runtime.scheduler.list_jobs().await.unwrap();
    assert!(jobs.iter().any(|j| j.id == job.id));

    let fetched = runtime.scheduler.get_job(&job.id).await.unwrap();
    assert_eq!(fetched.handler_name, "echo");

    let health = runtime.scheduler.health_check().await.unwrap();
    assert!(health.kv_ok);
    assert!(health.bus_ok);
}

#[tokio::test]
async fn shutdown_is_safe_to_call_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::open(&test_config(dir.path())).unwrap();
    // Never called `start()`; shutdown must still be idempotent-safe and
    // not panic on a ticker that was never spawned.
    runtime.shutdown();
}
