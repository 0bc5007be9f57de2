//! Export job pipeline tests: phase progression, resumption after
//! hibernation, cancellation, and start conflicts.

use hearth::{Factory, FactoryConfig, Request};
use hearth_sample::ExportJob;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn factory() -> Factory<ExportJob> {
    Factory::new(FactoryConfig::default())
}

async fn status(factory: &Factory<ExportJob>, key: &str) -> Value {
    factory
        .fetch(key, Request::get("/status"))
        .await
        .unwrap()
        .body
}

/// Polls until the job satisfies `pred`, panicking after two seconds.
async fn wait_until(
    factory: &Factory<ExportJob>,
    key: &str,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let body = status(factory, key).await;
        if pred(&body) {
            return body;
        }
        if Instant::now() > deadline {
            panic!("job never reached the expected state, last: {body}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn status_before_any_start_is_404() {
    let factory = factory();
    let resp = factory
        .fetch("job-0", Request::get("/status"))
        .await
        .unwrap();
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn job_runs_through_all_phases() {
    let factory = factory();
    let resp = factory
        .fetch(
            "job-1",
            Request::post("/start").with_body(json!({"item_count": 60})),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body["phase"], "Querying");

    let done = wait_until(&factory, "job-1", |b| b["phase"] == "Complete").await;
    assert_eq!(done["cursor"], 60);
    assert!(done["artifact"].as_str().unwrap().ends_with(".zip"));
    assert_eq!(done["failure"], Value::Null);
}

#[tokio::test]
async fn job_resumes_from_persisted_cursor_after_hibernation() {
    let factory = factory();
    factory
        .fetch(
            "job-2",
            Request::post("/start")
                .with_body(json!({"item_count": 200, "delivery": "download"})),
        )
        .await
        .unwrap();

    // Let it get partway through Assembling, then evict the instance.
    let mid = wait_until(&factory, "job-2", |b| {
        b["phase"] == "Assembling" && b["cursor"].as_u64().unwrap() > 0
    })
    .await;
    let cursor_before = mid["cursor"].as_u64().unwrap();
    factory.hibernate("job-2").await.unwrap();

    // The respawned instance picks up mid-Assembling, never back at Pending.
    let woken = status(&factory, "job-2").await;
    assert_ne!(woken["phase"], "Pending");
    assert!(woken["cursor"].as_u64().unwrap() >= cursor_before);

    let done = wait_until(&factory, "job-2", |b| b["phase"] == "Complete").await;
    assert_eq!(done["cursor"], 200);
}

#[tokio::test]
async fn starting_while_active_conflicts() {
    let factory = factory();
    factory
        .fetch(
            "job-3",
            Request::post("/start").with_body(json!({"item_count": 500})),
        )
        .await
        .unwrap();

    let resp = factory
        .fetch(
            "job-3",
            Request::post("/start").with_body(json!({"item_count": 10})),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 409);
    assert_eq!(resp.error_envelope().error_code, "job_active");
}

#[tokio::test]
async fn cancel_fails_the_job_and_stops_progress() {
    let factory = factory();
    factory
        .fetch(
            "job-4",
            Request::post("/start").with_body(json!({"item_count": 500})),
        )
        .await
        .unwrap();

    let cancelled = factory
        .fetch("job-4", Request::post("/cancel"))
        .await
        .unwrap();
    assert_eq!(cancelled.body["phase"], "Failed");
    assert_eq!(cancelled.body["failure"], "cancelled");

    // No alarm left behind: the cursor stays where cancellation caught it.
    let cursor = cancelled.body["cursor"].as_u64().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = status(&factory, "job-4").await;
    assert_eq!(after["phase"], "Failed");
    assert_eq!(after["cursor"].as_u64().unwrap(), cursor);

    // Cancelling a finished job is a no-op.
    let again = factory
        .fetch("job-4", Request::post("/cancel"))
        .await
        .unwrap();
    assert_eq!(again.body["phase"], "Failed");

    // A terminal job can be restarted.
    let restarted = factory
        .fetch(
            "job-4",
            Request::post("/start").with_body(json!({"item_count": 25})),
        )
        .await
        .unwrap();
    assert_eq!(restarted.status, 200);
    assert_eq!(restarted.body["phase"], "Querying");
}

#[tokio::test]
async fn empty_export_is_rejected() {
    let factory = factory();
    let resp = factory
        .fetch(
            "job-5",
            Request::post("/start").with_body(json!({"item_count": 0})),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 400);
    assert_eq!(resp.error_envelope().error_code, "empty_export");
}
