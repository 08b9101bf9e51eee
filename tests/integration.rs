//! Integration tests for the replica router.
//!
//! In-process tests run against [`InMemoryBackend`] and SQLite files.
//! Tests marked `#[ignore]` need Docker for real Redis containers.
//!
//! # Running
//! ```bash
//! cargo test --test integration                  # in-process only
//! cargo test --test integration -- --ignored     # Docker-backed
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use replica_router::replication::wal::ReplayTarget;
use replica_router::{
    Backend, BackendError, Classification, Dialect, InMemoryBackend, Operation, RedisBackend, ReplicaRouter,
    ReplicationJob, RetryConfig, RouterConfig, RouterState, SegmentName, SegmentReplayer, SqlBackend,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Helpers
// =============================================================================

/// Create a Redis container for testing
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn config(strategy: &str, active: &str, region: &str) -> RouterConfig {
    serde_json::from_value(json!({
        "region": region,
        "active_group": active,
        "group_strategy": strategy,
        "retry_delay_ms": 10,
        "groups": [
            { "name": "g0", "region": "az0",
              "primary": { "name": "g0-p", "descriptor": "mem://g0-p" },
              "replicas": [ { "name": "g0-r1", "descriptor": "mem://g0-r1" },
                            { "name": "g0-r2", "descriptor": "mem://g0-r2" },
                            { "name": "g0-r3", "descriptor": "mem://g0-r3" } ] },
            { "name": "g1", "region": "az1",
              "primary": { "name": "g1-p", "descriptor": "mem://g1-p" },
              "replicas": [ { "name": "g1-r1", "descriptor": "mem://g1-r1" } ] }
        ]
    }))
    .unwrap()
}

fn with_secondary(mut config: RouterConfig, wal_dir: Option<&Path>) -> RouterConfig {
    config.replication.secondary = Some(replica_router::EndpointConfig::new("dr", "mem://dr"));
    config.replication.retry_delay_ms = 1;
    if let Some(dir) = wal_dir {
        config.durability.enabled = true;
        config.durability.dir = dir.to_path_buf();
        config.durability.flush_lines = 1;
    }
    config
}

fn set(k: &str, v: &str) -> Operation {
    Operation::new("SET", vec![json!(k), json!(v)])
}

fn get(k: &str) -> Operation {
    Operation::new("GET", vec![json!(k)])
}

fn segment_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".dat"))
        .collect();
    names.sort();
    names
}

/// Fails every SET of one key; everything else goes to the inner backend.
struct RejectKey {
    inner: InMemoryBackend,
    key: parking_lot::RwLock<Option<String>>,
}

impl RejectKey {
    fn new(key: &str) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            key: parking_lot::RwLock::new(Some(key.to_string())),
        }
    }

    fn heal(&self) {
        *self.key.write() = None;
    }
}

#[async_trait]
impl Backend for RejectKey {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        if let Some(key) = self.key.read().as_deref() {
            if op.arg_str(0).as_deref() == Some(key) {
                return Err(BackendError::Recoverable("connection reset".into()));
            }
        }
        self.inner.execute(descriptor, op).await
    }
}

/// Delays calls to one descriptor so a test can act while they are in flight.
struct Slow {
    inner: InMemoryBackend,
    descriptor: String,
    delay: Duration,
}

#[async_trait]
impl Backend for Slow {
    async fn execute(&self, descriptor: &str, op: &Operation) -> Result<Value, BackendError> {
        if descriptor == self.descriptor {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.execute(descriptor, op).await
    }
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn happy_writes_always_hit_active_primary() {
    let backend = Arc::new(InMemoryBackend::new());
    let router = ReplicaRouter::new(config("pinned", "g0", "az0"), backend.clone(), None).unwrap();
    router.start().await;

    for id in 0..20 {
        router
            .execute(&set(&format!("k{id}"), "v"), &Classification::write(id))
            .await
            .unwrap();
        // inside a read-write transaction reads stay on the primary too
        router
            .execute(&get("k"), &Classification::read(id).in_transaction(false))
            .await
            .unwrap();
    }

    assert_eq!(backend.calls("mem://g0-p"), 40);
    for replica in ["mem://g0-r1", "mem://g0-r2", "mem://g0-r3"] {
        assert_eq!(backend.calls(replica), 0);
    }
}

#[tokio::test]
async fn happy_round_robin_is_deterministic() {
    let backend = Arc::new(InMemoryBackend::new());
    let router = ReplicaRouter::new(config("pinned", "g0", "az0"), backend.clone(), None).unwrap();

    for id in 1..=6 {
        router.execute(&get("k"), &Classification::read(id)).await.unwrap();
    }
    let served: Vec<Operation> = ["mem://g0-r1", "mem://g0-r2", "mem://g0-r3"]
        .iter()
        .flat_map(|d| backend.applied_on(d))
        .collect();
    assert_eq!(served.len(), 6);
    for replica in ["mem://g0-r1", "mem://g0-r2", "mem://g0-r3"] {
        assert_eq!(backend.calls(replica), 2, "{replica}");
    }

    // a repeated correlation id moves to the next replica
    router.execute(&get("k"), &Classification::read(1)).await.unwrap();
    assert_eq!(backend.calls("mem://g0-r2"), 3);
}

#[tokio::test]
async fn happy_locality_routing_follows_region() {
    let backend = Arc::new(InMemoryBackend::new());
    let router = ReplicaRouter::new(config("locality", "g1", "az0"), backend.clone(), None).unwrap();

    // local reads go to g0, writes stay on the active g1
    router.execute(&get("k"), &Classification::read(1)).await.unwrap();
    router.execute(&set("k", "v"), &Classification::write(2)).await.unwrap();
    let g0_reads: u64 = ["mem://g0-r1", "mem://g0-r2", "mem://g0-r3"].iter().map(|d| backend.calls(d)).sum();
    assert_eq!(g0_reads, 1);
    assert_eq!(backend.calls("mem://g1-p"), 1);

    // no group in az2, reads fall back to the active group
    router.set_region("az2");
    router.execute(&get("k"), &Classification::read(3)).await.unwrap();
    assert_eq!(backend.calls("mem://g1-r1"), 1);
}

#[tokio::test]
async fn happy_active_switch_is_not_retroactive() {
    let backend = Arc::new(Slow {
        inner: InMemoryBackend::new(),
        descriptor: "mem://g0-p".into(),
        delay: Duration::from_millis(200),
    });
    let router = Arc::new(ReplicaRouter::new(config("pinned", "g0", "az0"), backend.clone(), None).unwrap());

    let in_flight = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.execute(&set("early", "v"), &Classification::write(1)).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.set_active("g1"));
    router.execute(&set("late", "v"), &Classification::write(2)).await.unwrap();
    in_flight.await.unwrap().unwrap();

    assert_eq!(backend.inner.value("mem://g0-p", "early"), Some(json!("v")));
    assert!(backend.inner.value("mem://g1-p", "early").is_none());
    assert_eq!(backend.inner.value("mem://g1-p", "late"), Some(json!("v")));
}

#[tokio::test]
async fn happy_run_loop_consumes_switch_signal() {
    let backend = Arc::new(InMemoryBackend::new());
    let router = Arc::new(ReplicaRouter::new(config("pinned", "g0", "az0"), backend.clone(), None).unwrap());
    router.start().await;

    let (active_tx, active_rx) = watch::channel(String::new());
    let run = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.run(active_rx).await }
    });
    router
        .state_receiver()
        .wait_for(|s| *s == RouterState::Running)
        .await
        .unwrap();

    active_tx.send("g1".into()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while router.topology().active_name() != "g1" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // an unknown name is ignored
    active_tx.send("purple".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(router.topology().active_name(), "g1");
    assert_eq!(router.health_check().switch_count, 1);

    router.shutdown().await;
    run.await.unwrap();
}

// =============================================================================
// Replication and Durability
// =============================================================================

#[tokio::test]
async fn happy_double_write_reaches_secondary() {
    let primary = Arc::new(InMemoryBackend::new());
    let secondary = Arc::new(InMemoryBackend::new());
    let router = ReplicaRouter::new(
        with_secondary(config("pinned", "g0", "az0"), None),
        primary.clone(),
        Some(secondary.clone()),
    )
    .unwrap();
    router.start().await;

    router.execute(&set("a", "1"), &Classification::write(1)).await.unwrap();
    router.execute(&get("a"), &Classification::read(2)).await.unwrap();
    router
        .execute_batch(
            &[set("b", "2"), Operation::new("INCR", vec![json!("n")])],
            true,
            &Classification::write(3),
        )
        .await
        .unwrap();
    router.shutdown().await;

    let mirrored = secondary.applied_on("mem://dr");
    assert_eq!(mirrored, vec![set("a", "1"), set("b", "2"), Operation::new("INCR", vec![json!("n")])]);
    assert_eq!(secondary.value("mem://dr", "n"), Some(json!(1)));
}

#[tokio::test]
async fn happy_segments_survive_restart_and_replay() {
    let dir = tempfile::tempdir().unwrap();

    // First process: secondary unreachable, every job lands only in the log
    {
        let secondary = Arc::new(InMemoryBackend::new());
        secondary.fail("mem://dr", BackendError::Recoverable("connection refused".into()));
        let mut config = with_secondary(config("pinned", "g0", "az0"), Some(dir.path()));
        config.replication.retry_times = 1;
        let router = ReplicaRouter::new(config, Arc::new(InMemoryBackend::new()), Some(secondary.clone())).unwrap();
        router.start().await;

        for i in 0..3 {
            router
                .execute(&set(&format!("k{i}"), "v"), &Classification::write(i))
                .await
                .unwrap();
        }
        router.shutdown().await;
        assert_eq!(router.replication_stats().unwrap().failed, 3);
        assert_eq!(router.segment_stats().unwrap().appends, 3);
    }
    assert_eq!(segment_files(dir.path()).len(), 1);

    // Second process: secondary healthy, startup replays the log
    let secondary = Arc::new(InMemoryBackend::new());
    let router = ReplicaRouter::new(
        with_secondary(config("pinned", "g0", "az0"), Some(dir.path())),
        Arc::new(InMemoryBackend::new()),
        Some(secondary.clone()),
    )
    .unwrap();
    router.start().await;

    assert!(segment_files(dir.path()).is_empty());
    for i in 0..3 {
        assert_eq!(secondary.value("mem://dr", &format!("k{i}")), Some(json!("v")));
    }
    router.shutdown().await;
}

#[tokio::test]
async fn happy_live_applied_writes_are_not_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let secondary = Arc::new(InMemoryBackend::new());
    let incr = Operation::new("INCR", vec![json!("n")]);

    // First process: healthy secondary mirrors the write live
    {
        let router = ReplicaRouter::new(
            with_secondary(config("pinned", "g0", "az0"), Some(dir.path())),
            Arc::new(InMemoryBackend::new()),
            Some(secondary.clone()),
        )
        .unwrap();
        router.start().await;
        router.execute(&incr, &Classification::write(1)).await.unwrap();
        router.shutdown().await;

        assert_eq!(router.replication_stats().unwrap().applied, 1);
        assert_eq!(router.segment_stats().unwrap().retired, 1);
    }
    assert_eq!(secondary.value("mem://dr", "n"), Some(json!(1)));
    assert!(segment_files(dir.path()).is_empty());

    // Second process over the same directory and secondary
    let router = ReplicaRouter::new(
        with_secondary(config("pinned", "g0", "az0"), Some(dir.path())),
        Arc::new(InMemoryBackend::new()),
        Some(secondary.clone()),
    )
    .unwrap();
    router.start().await;
    router.shutdown().await;

    assert_eq!(secondary.value("mem://dr", "n"), Some(json!(1)));
    assert_eq!(secondary.applied_on("mem://dr").len(), 1);
}

#[tokio::test]
async fn happy_partial_replay_salvages_unapplied_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let name = SegmentName::new("dr", 1_700_000_000_000, 0);
    let lines: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|k| format!("{}\r\n", ReplicationJob::single(set(k, "v")).encode().unwrap()))
        .collect();
    std::fs::write(name.path_in(dir.path()), lines.concat()).unwrap();

    let backend = Arc::new(RejectKey::new("b"));
    let replayer = SegmentReplayer::new(dir.path(), RetryConfig::fixed(2, Duration::from_millis(1)), Duration::from_secs(1))
        .with_target(
            "dr",
            ReplayTarget {
                backend: backend.clone(),
                descriptor: "mem://dr".into(),
            },
        );

    let report = replayer.replay(&HashSet::new()).await.unwrap();
    assert_eq!(report.segments, 1);
    assert_eq!(report.applied, 2);
    assert_eq!(report.interruptions, 1);
    assert_eq!(report.salvaged, 1);

    // [a, b, c] with b failing leaves [b, c] under the next version
    let salvage = name.next_version().path_in(dir.path());
    assert_eq!(segment_files(dir.path()), vec![salvage.file_name().unwrap().to_string_lossy().into_owned()]);
    assert_eq!(std::fs::read_to_string(&salvage).unwrap(), format!("{}{}", lines[1], lines[2]));

    backend.heal();
    let report = replayer.replay(&HashSet::new()).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.interruptions, 0);
    assert!(segment_files(dir.path()).is_empty());
    assert_eq!(backend.inner.value("mem://dr", "b"), Some(json!("v")));
}

#[tokio::test]
async fn happy_sql_double_write() {
    let dir = tempfile::tempdir().unwrap();
    let primary_url = format!("sqlite://{}?mode=rwc", dir.path().join("primary.db").display());
    let secondary_url = format!("sqlite://{}?mode=rwc", dir.path().join("dr.db").display());

    let config: RouterConfig = serde_json::from_value(json!({
        "active_group": "main",
        "groups": [ { "name": "main", "primary": { "name": "main-p", "descriptor": primary_url } } ],
        "replication": { "secondary": { "name": "dr", "descriptor": secondary_url } }
    }))
    .unwrap();

    let backend = Arc::new(SqlBackend::new());
    let router = ReplicaRouter::new(config, backend.clone(), None).unwrap();
    router.start().await;

    let ddl = Operation::bare("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)");
    router.execute_inferred(&ddl, Dialect::Relational).await.unwrap();
    let insert = Operation::new("INSERT INTO kv (k, v) VALUES (?, ?)", vec![json!("a"), json!(1)]);
    router.execute_inferred(&insert, Dialect::Relational).await.unwrap();
    router.shutdown().await;

    let rows = backend
        .execute(&secondary_url, &Operation::bare("SELECT k, v FROM kv"))
        .await
        .unwrap();
    assert_eq!(rows, json!([{"k": "a", "v": 1}]));
    assert_eq!(router.replication_stats().unwrap().applied, 2);
}

// =============================================================================
// Docker-backed Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_router_lifecycle_with_redis() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let port = redis.get_host_port_ipv4(6379);
    let url = format!("redis://127.0.0.1:{port}");

    let config: RouterConfig = serde_json::from_value(json!({
        "active_group": "g0",
        "groups": [ { "name": "g0", "primary": { "name": "g0-p", "descriptor": url } } ]
    }))
    .unwrap();
    let router = ReplicaRouter::new(config, Arc::new(RedisBackend::new()), None).unwrap();
    assert_eq!(router.state(), RouterState::Created);

    router.start().await;
    assert!(router.is_ready());

    let out = router.execute_inferred(&set("k", "v"), Dialect::KeyValue).await.unwrap();
    assert_eq!(out, json!("OK"));
    let out = router.execute_inferred(&get("k"), Dialect::KeyValue).await.unwrap();
    assert_eq!(out, json!("v"));

    router.shutdown().await;
    assert_eq!(router.state(), RouterState::ShuttingDown);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_redis_double_write_with_durable_log() {
    let docker = Cli::default();
    let primary = redis_container(&docker);
    let secondary = redis_container(&docker);
    let primary_url = format!("redis://127.0.0.1:{}", primary.get_host_port_ipv4(6379));
    let secondary_url = format!("redis://127.0.0.1:{}", secondary.get_host_port_ipv4(6379));
    let dir = tempfile::tempdir().unwrap();

    let config: RouterConfig = serde_json::from_value(json!({
        "active_group": "g0",
        "groups": [ { "name": "g0", "primary": { "name": "g0-p", "descriptor": primary_url } } ],
        "replication": { "secondary": { "name": "dr", "descriptor": secondary_url } },
        "durability": { "enabled": true, "dir": dir.path(), "flush_lines": 1 }
    }))
    .unwrap();

    let backend = Arc::new(RedisBackend::new());
    let router = ReplicaRouter::new(config, backend.clone(), None).unwrap();
    router.start().await;

    for i in 0..10 {
        router
            .execute_inferred(&set(&format!("k{i}"), "v"), Dialect::KeyValue)
            .await
            .unwrap();
    }
    router
        .execute_batch(&[set("x", "1"), set("y", "2")], true, &Classification::write(99))
        .await
        .unwrap();
    router.shutdown().await;

    let stats = router.replication_stats().unwrap();
    assert_eq!(stats.applied, 11);
    assert_eq!(router.segment_stats().unwrap().appends, 11);

    let out = backend.execute(&secondary_url, &get("k9")).await.unwrap();
    assert_eq!(out, json!("v"));
    let out = backend.execute(&secondary_url, &get("y")).await.unwrap();
    assert_eq!(out, json!("2"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn failure_redis_dies_mid_operation() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let config: RouterConfig = serde_json::from_value(json!({
        "active_group": "g0",
        "retry_times": 2,
        "retry_delay_ms": 50,
        "groups": [ { "name": "g0", "primary": { "name": "g0-p", "descriptor": url } } ]
    }))
    .unwrap();
    let router = ReplicaRouter::new(config, Arc::new(RedisBackend::new()), None).unwrap();
    router.start().await;

    router.execute_inferred(&set("k", "v"), Dialect::KeyValue).await.unwrap();

    // Kill Redis
    drop(redis);

    let err = router.execute_inferred(&get("k"), Dialect::KeyValue).await.unwrap_err();
    assert!(matches!(err, replica_router::RouterError::NoBackendAvailable { .. }));
    assert!(router.exclusions().is_endpoint_excluded("g0-p"));
    router.shutdown().await;
}
