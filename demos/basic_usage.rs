// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic replica-router usage example.
//!
//! Demonstrates, fully in-process:
//! 1. Building a two-group topology over the in-memory backend
//! 2. Routing writes to the primary and reads across replicas
//! 3. A failing replica being excluded and the read re-routed
//! 4. Switching the active group through the watch channel
//! 5. Double-writes landing on the secondary target via the segment log
//! 6. Displaying captured metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use replica_router::{
    BackendError, Classification, Dialect, InMemoryBackend, Operation, ReplicaRouter, RouterConfig, RouterState,
};
use serde_json::json;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the router emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "replica_router=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           replica-router: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the router
    // ─────────────────────────────────────────────────────────────────────────
    let wal_dir = tempfile::tempdir()?;
    let config: RouterConfig = serde_json::from_value(json!({
        "region": "az0",
        "active_group": "blue",
        "retry_times": 2,
        "retry_delay_ms": 50,
        "groups": [
            { "name": "blue", "region": "az0",
              "primary": { "name": "blue-p", "descriptor": "mem://blue-p" },
              "replicas": [ { "name": "blue-r1", "descriptor": "mem://blue-r1" },
                            { "name": "blue-r2", "descriptor": "mem://blue-r2" } ] },
            { "name": "green", "region": "az1",
              "primary": { "name": "green-p", "descriptor": "mem://green-p" } }
        ],
        "replication": { "secondary": { "name": "dr", "descriptor": "mem://dr" } },
        "durability": { "enabled": true, "dir": wal_dir.path(), "flush_lines": 1 }
    }))?;

    let primary = Arc::new(InMemoryBackend::new());
    let secondary = Arc::new(InMemoryBackend::new());
    let router = Arc::new(ReplicaRouter::new(config, primary.clone(), Some(secondary.clone()))?);
    println!("📦 State: {}", router.state());

    router.start().await;
    assert_eq!(router.state(), RouterState::Ready);
    println!("🚀 Router ready! State: {}", router.state());

    let (active_tx, active_rx) = watch::channel("blue".to_string());
    let run_handle = tokio::spawn({
        let router = Arc::clone(&router);
        async move { router.run(active_rx).await }
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Writes and reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing 3 keys (primary) and reading them back (replicas)...");
    for (k, v) in [("user.alice", "admin"), ("user.bob", "user"), ("user.carol", "user")] {
        let op = Operation::new("SET", vec![json!(k), json!(v)]);
        let out = router.execute_inferred(&op, Dialect::KeyValue).await?;
        println!("   └─ SET {k} → {out}");
    }
    for id in 1..=4 {
        let op = Operation::new("GET", vec![json!("user.alice")]);
        router.execute(&op, &Classification::read(id)).await?;
    }
    println!(
        "   └─ Reads served: blue-r1={} blue-r2={}",
        primary.calls("mem://blue-r1"),
        primary.calls("mem://blue-r2")
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Failure: one replica goes away
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Failing blue-r1...");
    primary.fail("mem://blue-r1", BackendError::Recoverable("connection refused".into()));
    let id = router.next_correlation_id();
    router
        .execute(&Operation::new("GET", vec![json!("user.bob")]), &Classification::read(id))
        .await?;
    let health = router.health_check();
    println!("   └─ Excluded: {:?}", health.excluded_endpoints);
    println!("   └─ Healthy: {}", health.healthy);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Active switch
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔀 Switching active group to green...");
    active_tx.send("green".to_string())?;
    while router.topology().active_name() != "green" {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    router
        .execute_inferred(&Operation::new("SET", vec![json!("after.switch"), json!(1)]), Dialect::KeyValue)
        .await?;
    println!("   └─ green-p received {} call(s)", primary.calls("mem://green-p"));

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Shutdown drains replication, then look at the secondary
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    router.shutdown().await;
    run_handle.await?;

    if let Some(stats) = router.replication_stats() {
        println!("   ┌─ Replication");
        println!("   │  └─ submitted={} applied={} failed={} rejected={}", stats.submitted, stats.applied, stats.failed, stats.rejected);
    }
    if let Some(stats) = router.segment_stats() {
        println!("   ├─ Segment log");
        println!(
            "   │  └─ appends={} rotations={} flushes={} retired={}",
            stats.appends, stats.rotations, stats.flushes, stats.retired
        );
    }
    println!("   └─ Secondary has user.alice = {:?}", secondary.value("mem://dr", "user.alice"));

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured counters, gauges and histogram summaries, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(String, String)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{v}"),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) if samples.is_empty() => "(no samples)".to_string(),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} avg={:.6}s", samples.len(), sum / samples.len() as f64)
            }
        };
        lines.push((name, rendered));
    }

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for (name, value) in &lines {
        println!("   └─ {name} = {value}");
    }
}
