//! # Post Counter Actor
//!
//! Hot per-post counters: views with a per-session dedup window, reactions
//! unique per user, and a presence map fed by socket heartbeats. One
//! instance per post.
//!
//! The view total is working state flushed through the dirty flag, so a
//! burst of views costs one write per mailbox drain instead of one per
//! view. The dedup and presence maps are in-memory only; hibernation
//! resets them, which at worst counts a returning session once more.
//!
//! Live watchers connect tagged `watchers`; every counted view or reaction
//! broadcasts the fresh stats to them.

use async_trait::async_trait;
use hearth::{
    Actor, ActorHost, BroadcastTarget, ConnectionId, HearthError, RequestContext, Response,
    Route, SqlArg,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;
use std::collections::HashMap;

const VIEWS_KEY: &str = "views";
const VIEW_DEDUP_WINDOW_MS: u64 = 30_000;
const PRESENCE_TTL_MS: u64 = 60_000;
const HOT_THRESHOLD: u64 = 100;
pub const WATCHERS_TAG: &str = "watchers";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS reactions (
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    reacted_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, kind)
)";

#[derive(Debug, Deserialize)]
struct ViewParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ReactParams {
    user_id: String,
    kind: String,
}

pub struct PostCounter {
    views: u64,
    recent_views: HashMap<String, u64>,
    presence: HashMap<String, u64>,
}

impl PostCounter {
    async fn reaction_counts(
        &self,
        host: &ActorHost,
    ) -> Result<HashMap<String, u64>, HearthError> {
        let rows = host
            .sql
            .query_all(
                "SELECT kind, COUNT(*) AS n FROM reactions GROUP BY kind",
                &[],
            )
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(kind, n as u64);
        }
        Ok(counts)
    }

    fn present_now(&self) -> u64 {
        let cutoff = hearth::now_ms().saturating_sub(PRESENCE_TTL_MS);
        self.presence.values().filter(|&&seen| seen >= cutoff).count() as u64
    }

    async fn stats(&self, host: &ActorHost) -> Result<serde_json::Value, HearthError> {
        Ok(json!({
            "views": self.views,
            "reactions": self.reaction_counts(host).await?,
            "present": self.present_now(),
            "hot": self.views >= HOT_THRESHOLD,
        }))
    }

    /// Drops dedup and presence entries past their windows. Both maps are
    /// bounded by this: every insert evicts whatever has already expired.
    fn prune_stale(&mut self, now: u64) {
        self.recent_views
            .retain(|_, &mut last| now.saturating_sub(last) < VIEW_DEDUP_WINDOW_MS);
        self.presence
            .retain(|_, &mut seen| now.saturating_sub(seen) < PRESENCE_TTL_MS);
    }

    async fn notify_watchers(&self, host: &mut ActorHost) -> Result<(), HearthError> {
        let stats = self.stats(host).await?;
        host.sockets
            .broadcast(BroadcastTarget::Tag(WATCHERS_TAG), &stats.to_string())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Actor for PostCounter {
    const NAME: &'static str = "post_counter";

    fn routes() -> Vec<Route> {
        vec![
            Route::post("/view", "view"),
            Route::post("/react", "react"),
            Route::delete("/react", "unreact"),
            Route::get("/stats", "stats"),
        ]
    }

    fn schema() -> Option<&'static str> {
        Some(SCHEMA)
    }

    async fn load(host: &mut ActorHost) -> Result<Self, HearthError> {
        Ok(Self {
            views: host.store.get_as(VIEWS_KEY).await?.unwrap_or(0),
            recent_views: HashMap::new(),
            presence: HashMap::new(),
        })
    }

    async fn handle(
        &mut self,
        route: &'static str,
        ctx: RequestContext,
        host: &mut ActorHost,
    ) -> Result<Response, HearthError> {
        match route {
            "view" => {
                let params: ViewParams = ctx.body_as()?;
                let now = hearth::now_ms();
                self.prune_stale(now);
                let counted = match self.recent_views.get(&params.session_id) {
                    Some(&last) if now.saturating_sub(last) < VIEW_DEDUP_WINDOW_MS => false,
                    _ => true,
                };
                self.recent_views.insert(params.session_id, now);
                if counted {
                    self.views += 1;
                    host.mark_dirty();
                    self.notify_watchers(host).await?;
                }
                Ok(Response::ok(json!({"counted": counted, "views": self.views})))
            }
            "react" => {
                let params: ReactParams = ctx.body_as()?;
                let inserted = host
                    .sql
                    .exec(
                        "INSERT OR IGNORE INTO reactions (user_id, kind, reacted_at)
                         VALUES (?1, ?2, ?3)",
                        &[
                            SqlArg::Text(params.user_id),
                            SqlArg::Text(params.kind),
                            SqlArg::Int(hearth::now_ms() as i64),
                        ],
                    )
                    .await?;
                if inserted > 0 {
                    self.notify_watchers(host).await?;
                }
                Ok(Response::ok(json!({"added": inserted > 0})))
            }
            "unreact" => {
                let params: ReactParams = ctx.body_as()?;
                let removed = host
                    .sql
                    .exec(
                        "DELETE FROM reactions WHERE user_id = ?1 AND kind = ?2",
                        &[SqlArg::Text(params.user_id), SqlArg::Text(params.kind)],
                    )
                    .await?;
                if removed > 0 {
                    self.notify_watchers(host).await?;
                }
                Ok(Response::ok(json!({"removed": removed > 0})))
            }
            "stats" => Ok(Response::ok(self.stats(host).await?)),
            _ => Ok(Response::not_found()),
        }
    }

    /// Socket frames are presence heartbeats carrying the user id.
    async fn on_socket_message(
        &mut self,
        _host: &mut ActorHost,
        _conn: ConnectionId,
        text: &str,
    ) -> Result<(), HearthError> {
        let now = hearth::now_ms();
        self.prune_stale(now);
        self.presence.insert(text.to_string(), now);
        Ok(())
    }

    async fn persist(&mut self, host: &mut ActorHost) -> Result<(), HearthError> {
        host.store.set(VIEWS_KEY, &json!(self.views)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> PostCounter {
        PostCounter {
            views: 0,
            recent_views: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    #[test]
    fn expired_entries_are_evicted_on_prune() {
        let mut counter = counter();
        let now = hearth::now_ms();
        counter
            .recent_views
            .insert("old-session".to_string(), now - VIEW_DEDUP_WINDOW_MS - 1);
        counter.recent_views.insert("fresh-session".to_string(), now);
        counter
            .presence
            .insert("ghost".to_string(), now - PRESENCE_TTL_MS - 1);
        counter.presence.insert("alice".to_string(), now);

        counter.prune_stale(now);
        assert_eq!(counter.recent_views.len(), 1);
        assert!(counter.recent_views.contains_key("fresh-session"));
        assert_eq!(counter.presence.len(), 1);
        assert!(counter.presence.contains_key("alice"));
    }

    #[test]
    fn dedup_map_stays_bounded_across_windows() {
        let mut counter = counter();
        let start = hearth::now_ms();
        // Sessions spread across many past windows all expire; only the
        // current window's entries remain resident.
        for window in 0..50u64 {
            for session in 0..10u64 {
                counter.recent_views.insert(
                    format!("w{window}-s{session}"),
                    start - window * VIEW_DEDUP_WINDOW_MS,
                );
            }
            counter.prune_stale(start);
        }
        assert_eq!(counter.recent_views.len(), 10);
    }
}
