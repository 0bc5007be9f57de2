//! # Rate Limiter Actor
//!
//! Fixed-window counters per identifier, one instance per scope (tenant,
//! API key prefix, ...). `POST /check` debits a cost against the current
//! window and reports the verdict.
//!
//! Storage failure never throws at the caller: each check names its own
//! failure posture. `fail_mode: "open"` admits traffic when the counter is
//! unreadable (availability over enforcement), `"closed"` rejects it
//! (enforcement over availability). Both verdicts are logged with the
//! cause.

use async_trait::async_trait;
use hearth::{Actor, ActorHost, HearthError, RequestContext, Response, Route, SqlArg};
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;

const WINDOW_MS: u64 = 60_000;
const DEFAULT_LIMIT: u64 = 100;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS windows (
    id TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    used INTEGER NOT NULL,
    PRIMARY KEY (id, window_start)
)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    Open,
    Closed,
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    id: String,
    #[serde(default = "default_cost")]
    cost: u64,
    #[serde(default = "default_limit")]
    limit: u64,
    fail_mode: FailMode,
}

fn default_cost() -> u64 {
    1
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

/// Verdict when the window counter cannot be read or written.
pub fn verdict_on_failure(mode: FailMode) -> bool {
    matches!(mode, FailMode::Open)
}

pub struct RateLimiter;

impl RateLimiter {
    async fn debit(
        &self,
        host: &mut ActorHost,
        params: &CheckParams,
        window_start: u64,
    ) -> Result<(bool, u64), HearthError> {
        let row = host
            .sql
            .query_one(
                "SELECT used FROM windows WHERE id = ?1 AND window_start = ?2",
                &[SqlArg::text(&params.id), SqlArg::Int(window_start as i64)],
            )
            .await?;
        let used: u64 = match row {
            Some(row) => row.try_get::<i64, _>("used")? as u64,
            None => 0,
        };

        // Overflowing the window counter is over-limit by definition, and
        // a cost that cannot bind as a SQLite integer never reaches it.
        let projected = match used.checked_add(params.cost) {
            Some(total) if params.cost <= i64::MAX as u64 => total,
            _ => return Ok((false, params.limit.saturating_sub(used))),
        };
        if projected > params.limit {
            return Ok((false, params.limit.saturating_sub(used)));
        }
        host.sql
            .exec(
                "INSERT INTO windows (id, window_start, used) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id, window_start) DO UPDATE SET used = used + ?3",
                &[
                    SqlArg::text(&params.id),
                    SqlArg::Int(window_start as i64),
                    SqlArg::Int(params.cost as i64),
                ],
            )
            .await?;
        Ok((true, params.limit - used - params.cost))
    }
}

#[async_trait]
impl Actor for RateLimiter {
    const NAME: &'static str = "rate_limiter";

    fn routes() -> Vec<Route> {
        vec![Route::post("/check", "check")]
    }

    fn schema() -> Option<&'static str> {
        Some(SCHEMA)
    }

    async fn load(_host: &mut ActorHost) -> Result<Self, HearthError> {
        Ok(Self)
    }

    async fn handle(
        &mut self,
        route: &'static str,
        ctx: RequestContext,
        host: &mut ActorHost,
    ) -> Result<Response, HearthError> {
        match route {
            "check" => {
                let params: CheckParams = ctx.body_as()?;
                let window_start = hearth::now_ms() / WINDOW_MS * WINDOW_MS;
                match self.debit(host, &params, window_start).await {
                    Ok((allowed, remaining)) => Ok(Response::ok(json!({
                        "allowed": allowed,
                        "remaining": remaining,
                    }))),
                    Err(err) => {
                        let allowed = verdict_on_failure(params.fail_mode);
                        if allowed {
                            host.log
                                .warn_cause("limiter storage failed, admitting (fail-open)", &err);
                        } else {
                            host.log
                                .warn_cause("limiter storage failed, rejecting (fail-closed)", &err);
                        }
                        Ok(Response::ok(json!({
                            "allowed": allowed,
                            "remaining": 0,
                            "degraded": true,
                        })))
                    }
                }
            }
            _ => Ok(Response::not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_verdict_follows_the_declared_mode() {
        assert!(verdict_on_failure(FailMode::Open));
        assert!(!verdict_on_failure(FailMode::Closed));
    }

    #[test]
    fn check_params_take_defaults() {
        let params: CheckParams =
            serde_json::from_value(json!({"id": "k", "fail_mode": "open"})).unwrap();
        assert_eq!(params.cost, 1);
        assert_eq!(params.limit, DEFAULT_LIMIT);
        assert_eq!(params.fail_mode, FailMode::Open);
    }

    #[test]
    fn fail_mode_is_mandatory() {
        assert!(serde_json::from_value::<CheckParams>(json!({"id": "k"})).is_err());
    }
}
