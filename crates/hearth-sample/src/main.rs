//! Demo run: an export job driven to completion, a post taking views and
//! reactions with a live watcher, and a rate limiter saturating a window.
//!
//! Run with `RUST_LOG=info cargo run -p hearth-sample`.

use hearth::{init_tracing, Factory, FactoryConfig, Request};
use hearth_sample::{ExportJob, PostCounter, RateLimiter};
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("starting hearth demo");

    run_export().await?;
    run_counter().await?;
    run_limiter().await?;

    info!("demo complete");
    Ok(())
}

async fn run_export() -> Result<(), Box<dyn std::error::Error>> {
    let exports = Factory::<ExportJob>::new(FactoryConfig::default());

    let status = exports
        .fetch(
            "job-1042",
            Request::post("/start").with_body(json!({"item_count": 60, "delivery": "notify"})),
        )
        .await?;
    info!(phase = %status.body["phase"], "export started");

    // Mid-flight, evict the instance to show the job resuming from its
    // persisted cursor.
    tokio::time::sleep(Duration::from_millis(250)).await;
    exports.hibernate("job-1042").await?;
    info!("export instance hibernated mid-job");

    loop {
        let status = exports.fetch("job-1042", Request::get("/status")).await?;
        let phase = status.body["phase"].clone();
        info!(phase = %phase, cursor = %status.body["cursor"], "export progress");
        if phase == "Complete" || phase == "Failed" {
            info!(artifact = %status.body["artifact"], "export finished");
            break;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    Ok(())
}

async fn run_counter() -> Result<(), Box<dyn std::error::Error>> {
    let posts = Factory::<PostCounter>::new(FactoryConfig::default());

    let mut watcher = posts
        .connect("post-7", Some(hearth_sample::post_counter::WATCHERS_TAG.to_string()))
        .await?;

    for session in ["s1", "s2", "s1"] {
        posts
            .fetch(
                "post-7",
                Request::post("/view").with_body(json!({"session_id": session})),
            )
            .await?;
    }
    posts
        .fetch(
            "post-7",
            Request::post("/react").with_body(json!({"user_id": "alice", "kind": "like"})),
        )
        .await?;

    if let Some(update) = watcher.receiver.recv().await {
        info!(update = %update, "watcher received live stats");
    }
    let stats = posts.fetch("post-7", Request::get("/stats")).await?;
    info!(stats = %stats.body, "final post stats");
    Ok(())
}

async fn run_limiter() -> Result<(), Box<dyn std::error::Error>> {
    let limits = Factory::<RateLimiter>::new(FactoryConfig::default());

    for i in 0..3 {
        let verdict = limits
            .fetch(
                "tenant-a",
                Request::post("/check").with_body(json!({
                    "id": "api",
                    "cost": 40,
                    "limit": 100,
                    "fail_mode": "open",
                })),
            )
            .await?;
        info!(
            attempt = i + 1,
            allowed = %verdict.body["allowed"],
            remaining = %verdict.body["remaining"],
            "rate check"
        );
    }
    Ok(())
}
