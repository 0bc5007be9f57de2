//! Post counter and rate limiter tests: view dedup, reaction uniqueness,
//! live watcher broadcasts, presence heartbeats, and window enforcement.

use hearth::{Factory, FactoryConfig, Request};
use hearth_sample::post_counter::WATCHERS_TAG;
use hearth_sample::{PostCounter, RateLimiter};
use serde_json::json;

fn posts() -> Factory<PostCounter> {
    Factory::new(FactoryConfig::default())
}

fn limits() -> Factory<RateLimiter> {
    Factory::new(FactoryConfig::default())
}

async fn view(factory: &Factory<PostCounter>, key: &str, session: &str) -> serde_json::Value {
    factory
        .fetch(
            key,
            Request::post("/view").with_body(json!({"session_id": session})),
        )
        .await
        .unwrap()
        .body
}

#[tokio::test]
async fn repeat_views_within_the_window_are_deduplicated() {
    let factory = posts();
    assert_eq!(view(&factory, "post-1", "s1").await["counted"], true);
    assert_eq!(view(&factory, "post-1", "s1").await["counted"], false);
    assert_eq!(view(&factory, "post-1", "s2").await["counted"], true);

    let stats = factory
        .fetch("post-1", Request::get("/stats"))
        .await
        .unwrap();
    assert_eq!(stats.body["views"], 2);
}

#[tokio::test]
async fn reactions_are_unique_per_user() {
    let factory = posts();
    let react = |kind: &str| {
        Request::post("/react").with_body(json!({"user_id": "alice", "kind": kind}))
    };

    let first = factory.fetch("post-2", react("like")).await.unwrap();
    assert_eq!(first.body["added"], true);
    let second = factory.fetch("post-2", react("like")).await.unwrap();
    assert_eq!(second.body["added"], false);

    let stats = factory
        .fetch("post-2", Request::get("/stats"))
        .await
        .unwrap();
    assert_eq!(stats.body["reactions"]["like"], 1);

    let removed = factory
        .fetch(
            "post-2",
            Request::delete("/react").with_body(json!({"user_id": "alice", "kind": "like"})),
        )
        .await
        .unwrap();
    assert_eq!(removed.body["removed"], true);

    let stats = factory
        .fetch("post-2", Request::get("/stats"))
        .await
        .unwrap();
    assert!(stats.body["reactions"].get("like").is_none());
}

#[tokio::test]
async fn watchers_receive_live_stat_updates() {
    let factory = posts();
    let mut watcher = factory
        .connect("post-3", Some(WATCHERS_TAG.to_string()))
        .await
        .unwrap();

    view(&factory, "post-3", "s1").await;
    let update: serde_json::Value =
        serde_json::from_str(&watcher.receiver.recv().await.unwrap()).unwrap();
    assert_eq!(update["views"], 1);

    // Deduplicated views produce no broadcast.
    view(&factory, "post-3", "s1").await;
    assert!(watcher.receiver.try_recv().is_err());
}

#[tokio::test]
async fn view_totals_survive_hibernation() {
    let factory = posts();
    view(&factory, "post-4", "s1").await;
    view(&factory, "post-4", "s2").await;

    factory.hibernate("post-4").await.unwrap();

    let stats = factory
        .fetch("post-4", Request::get("/stats"))
        .await
        .unwrap();
    assert_eq!(stats.body["views"], 2);
}

#[tokio::test]
async fn socket_heartbeats_feed_the_presence_map() {
    let factory = posts();
    let conn = factory.connect("post-5", None).await.unwrap();
    let stub = factory.stub("post-5").await.unwrap();
    stub.socket_message(conn.id, "alice").await.unwrap();
    stub.socket_message(conn.id, "bob").await.unwrap();

    // The stats request queues behind the heartbeats in the same mailbox.
    let stats = factory
        .fetch("post-5", Request::get("/stats"))
        .await
        .unwrap();
    assert_eq!(stats.body["present"], 2);
}

#[tokio::test]
async fn limiter_enforces_the_window_budget() {
    let factory = limits();
    let check = || {
        Request::post("/check").with_body(json!({
            "id": "api",
            "cost": 40,
            "limit": 100,
            "fail_mode": "closed",
        }))
    };

    let first = factory.fetch("tenant-a", check()).await.unwrap();
    assert_eq!(first.body["allowed"], true);
    assert_eq!(first.body["remaining"], 60);

    let second = factory.fetch("tenant-a", check()).await.unwrap();
    assert_eq!(second.body["allowed"], true);
    assert_eq!(second.body["remaining"], 20);

    let third = factory.fetch("tenant-a", check()).await.unwrap();
    assert_eq!(third.body["allowed"], false);
    assert_eq!(third.body["remaining"], 20);
}

#[tokio::test]
async fn limiter_tracks_identifiers_independently() {
    let factory = limits();
    let check = |id: &str| {
        Request::post("/check").with_body(json!({
            "id": id,
            "cost": 100,
            "limit": 100,
            "fail_mode": "closed",
        }))
    };

    assert_eq!(
        factory.fetch("tenant-a", check("api")).await.unwrap().body["allowed"],
        true
    );
    assert_eq!(
        factory.fetch("tenant-a", check("api")).await.unwrap().body["allowed"],
        false
    );
    // A different identifier has its own window.
    assert_eq!(
        factory.fetch("tenant-a", check("web")).await.unwrap().body["allowed"],
        true
    );
}

#[tokio::test]
async fn oversized_cost_is_denied_not_a_crash() {
    let factory = limits();
    let seed = Request::post("/check").with_body(json!({
        "id": "api",
        "cost": 1,
        "limit": 100,
        "fail_mode": "closed",
    }));
    assert_eq!(
        factory.fetch("tenant-a", seed).await.unwrap().body["allowed"],
        true
    );

    // A cost near the counter's ceiling must read as over-limit, not
    // overflow the projection arithmetic.
    let huge = Request::post("/check").with_body(json!({
        "id": "api",
        "cost": u64::MAX,
        "limit": 100,
        "fail_mode": "closed",
    }));
    let verdict = factory.fetch("tenant-a", huge).await.unwrap();
    assert_eq!(verdict.body["allowed"], false);
    assert_eq!(verdict.body["remaining"], 99);

    // The instance is still alive and serving afterwards.
    let follow_up = Request::post("/check").with_body(json!({
        "id": "api",
        "cost": 1,
        "limit": 100,
        "fail_mode": "closed",
    }));
    assert_eq!(
        factory.fetch("tenant-a", follow_up).await.unwrap().body["allowed"],
        true
    );
}

#[tokio::test]
async fn missing_fail_mode_is_a_caller_error() {
    let factory = limits();
    let resp = factory
        .fetch(
            "tenant-a",
            Request::post("/check").with_body(json!({"id": "api"})),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 400);
    assert_eq!(resp.error_envelope().error_code, "invalid_body");
}
