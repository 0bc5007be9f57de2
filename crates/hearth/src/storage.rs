//! # Instance Storage
//!
//! Two layered persistence primitives, both owned exclusively by one actor
//! instance:
//!
//! - [`SqlHelper`] — parameterized single-statement SQL over the instance's
//!   SQLite pool. No string-built SQL, no multi-statement transactions;
//!   callers sequencing several writes must accept that a crash can land
//!   between them.
//! - [`JsonStore`] — a JSON key/value layer on top, one upserted row per
//!   key. A `get` of a never-written key is absent, which is distinguishable
//!   from a stored JSON `null`.
//!
//! Persisted corruption must never crash an actor: [`safe_json_parse`] and
//! the store's fallback reads log a warning and keep going.
//!
//! Statements retry up to 3 attempts with a 25 ms backoff before the error
//! surfaces. Bounded, so a failing statement inside a lock-held operation
//! cannot starve waiters indefinitely.

use crate::error::HearthError;
use crate::logger::Logger;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{FromRow, Sqlite, SqlitePool};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

const KV_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// A positional statement argument. Keeps every call parameterized without
/// forcing callers onto sqlx's typed binding at each site.
#[derive(Debug, Clone)]
pub enum SqlArg {
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl SqlArg {
    pub fn text(value: impl Into<String>) -> Self {
        SqlArg::Text(value.into())
    }
}

impl From<i64> for SqlArg {
    fn from(v: i64) -> Self {
        SqlArg::Int(v)
    }
}

impl From<u64> for SqlArg {
    fn from(v: u64) -> Self {
        SqlArg::Int(v as i64)
    }
}

impl From<&str> for SqlArg {
    fn from(v: &str) -> Self {
        SqlArg::Text(v.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(v: String) -> Self {
        SqlArg::Text(v)
    }
}

fn bind_args<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &'q [SqlArg],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Int(v) => query.bind(*v),
            SqlArg::Real(v) => query.bind(*v),
            SqlArg::Text(v) => query.bind(v.as_str()),
            SqlArg::Blob(v) => query.bind(v.as_slice()),
            SqlArg::Null => query.bind(Option::<i64>::None),
        };
    }
    query
}

fn bind_args_as<'q, T>(
    mut query: QueryAs<'q, Sqlite, T, SqliteArguments<'q>>,
    args: &'q [SqlArg],
) -> QueryAs<'q, Sqlite, T, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Int(v) => query.bind(*v),
            SqlArg::Real(v) => query.bind(*v),
            SqlArg::Text(v) => query.bind(v.as_str()),
            SqlArg::Blob(v) => query.bind(v.as_slice()),
            SqlArg::Null => query.bind(Option::<i64>::None),
        };
    }
    query
}

/// Typed SQL statement helper over one instance's pool.
#[derive(Clone)]
pub struct SqlHelper {
    pool: SqlitePool,
    log: Logger,
}

impl SqlHelper {
    pub fn new(pool: SqlitePool, log: Logger) -> Self {
        Self { pool, log }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs DDL, which may contain several statements separated by `;`.
    /// Only used during initialization; request-time calls go through the
    /// single-statement helpers.
    pub async fn run_ddl(&self, ddl: &str) -> Result<(), HearthError> {
        sqlx::raw_sql(ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Fetches at most one row. Absent is `Ok(None)`, not an error.
    pub async fn query_one(
        &self,
        sql: &str,
        args: &[SqlArg],
    ) -> Result<Option<SqliteRow>, HearthError> {
        let mut attempt = 1;
        loop {
            match bind_args(sqlx::query(sql), args)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(row) => return Ok(row),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    self.log.warn_cause("query_one failed, retrying", &err);
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn query_all(
        &self,
        sql: &str,
        args: &[SqlArg],
    ) -> Result<Vec<SqliteRow>, HearthError> {
        let mut attempt = 1;
        loop {
            match bind_args(sqlx::query(sql), args).fetch_all(&self.pool).await {
                Ok(rows) => return Ok(rows),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    self.log.warn_cause("query_all failed, retrying", &err);
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Executes a write statement, returning the affected-row count.
    pub async fn exec(&self, sql: &str, args: &[SqlArg]) -> Result<u64, HearthError> {
        let mut attempt = 1;
        loop {
            match bind_args(sqlx::query(sql), args).execute(&self.pool).await {
                Ok(result) => return Ok(result.rows_affected()),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    self.log.warn_cause("exec failed, retrying", &err);
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Typed single-row fetch.
    pub async fn query_one_as<T>(
        &self,
        sql: &str,
        args: &[SqlArg],
    ) -> Result<Option<T>, HearthError>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(bind_args_as(sqlx::query_as::<Sqlite, T>(sql), args)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Typed multi-row fetch.
    pub async fn query_all_as<T>(&self, sql: &str, args: &[SqlArg]) -> Result<Vec<T>, HearthError>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        Ok(bind_args_as(sqlx::query_as::<Sqlite, T>(sql), args)
            .fetch_all(&self.pool)
            .await?)
    }
}

/// Parses persisted JSON, falling back instead of failing. Malformed
/// content logs a warning and yields the caller-supplied fallback.
pub fn safe_json_parse(raw: &str, fallback: Value) -> Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(cause = %err, "discarding malformed persisted JSON");
            fallback
        }
    }
}

/// JSON key/value store layered on [`SqlHelper`] as upsert-by-key rows.
#[derive(Clone)]
pub struct JsonStore {
    sql: SqlHelper,
    log: Logger,
}

impl JsonStore {
    pub fn new(sql: SqlHelper, log: Logger) -> Self {
        Self { sql, log }
    }

    pub async fn create_table(&self) -> Result<(), HearthError> {
        self.sql.run_ddl(KV_TABLE_DDL).await
    }

    /// Raw stored text for a key, or absent.
    async fn get_raw(&self, key: &str) -> Result<Option<String>, HearthError> {
        use sqlx::Row;
        let row = self
            .sql
            .query_one(
                "SELECT value FROM kv_store WHERE key = ?1",
                &[SqlArg::text(key)],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("value")?)),
            None => Ok(None),
        }
    }

    /// Stored value for a key. Absent keys yield `Ok(None)`; a stored JSON
    /// `null` yields `Ok(Some(Value::Null))`. A corrupted row logs a
    /// warning and reads as absent rather than crashing the actor.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, HearthError> {
        match self.get_raw(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    self.log
                        .warn_cause("stored JSON is corrupted, treating as absent", &err);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Stored value with a caller-supplied fallback: absent keys, corrupted
    /// rows, and storage failures all yield the fallback. Storage failures
    /// are logged as errors; corruption as warnings.
    pub async fn get_or(&self, key: &str, fallback: Value) -> Value {
        match self.get_raw(key).await {
            Ok(Some(raw)) => safe_json_parse(&raw, fallback),
            Ok(None) => fallback,
            Err(err) => {
                self.log.error_cause("kv read failed, using fallback", &err);
                fallback
            }
        }
    }

    /// Typed read; corrupted or mis-shaped rows read as absent with a
    /// warning.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HearthError> {
        match self.get(key).await? {
            Some(value) => match serde_json::from_value(value) {
                Ok(typed) => Ok(Some(typed)),
                Err(err) => {
                    self.log
                        .warn_cause("stored JSON does not match expected shape", &err);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), HearthError> {
        let raw = serde_json::to_string(value)?;
        self.sql
            .exec(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
                &[
                    SqlArg::text(key),
                    SqlArg::Text(raw),
                    SqlArg::Int(crate::now_ms() as i64),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), HearthError> {
        self.sql
            .exec("DELETE FROM kv_store WHERE key = ?1", &[SqlArg::text(key)])
            .await?;
        Ok(())
    }

    /// Writes raw text without JSON validation. Test-only: lets tests plant
    /// corrupted rows.
    #[doc(hidden)]
    pub async fn set_raw_unchecked(&self, key: &str, raw: &str) -> Result<(), HearthError> {
        self.sql
            .exec(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
                &[
                    SqlArg::text(key),
                    SqlArg::text(raw),
                    SqlArg::Int(crate::now_ms() as i64),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> JsonStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let log = Logger::new("test", "0");
        let store = JsonStore::new(SqlHelper::new(pool, log), Logger::new("test", "0"));
        store.create_table().await.unwrap();
        store
    }

    #[tokio::test]
    async fn set_get_round_trip() {
        let store = store().await;
        let value = json!({"name": "acme", "limits": {"posts": 10}});
        store.set("config", &value).await.unwrap();
        assert_eq!(store.get("config").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn delete_makes_key_absent() {
        let store = store().await;
        store.set("k", &json!(1)).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stored_null_is_not_absent() {
        let store = store().await;
        store.set("k", &Value::Null).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Value::Null));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupted_row_reads_as_fallback() {
        let store = store().await;
        store.set_raw_unchecked("bad", "{not json at all").await.unwrap();
        assert_eq!(store.get("bad").await.unwrap(), None);
        assert_eq!(
            store.get_or("bad", json!({"default": true})).await,
            json!({"default": true})
        );
    }

    #[tokio::test]
    async fn exec_reports_affected_rows() {
        let store = store().await;
        store.set("a", &json!(1)).await.unwrap();
        store.set("b", &json!(2)).await.unwrap();
        let affected = store
            .sql
            .exec("DELETE FROM kv_store WHERE key IN (?1, ?2)", &[
                SqlArg::text("a"),
                SqlArg::text("b"),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 2);
    }

    #[test]
    fn safe_json_parse_never_panics() {
        assert_eq!(safe_json_parse("{broken", json!([])), json!([]));
        assert_eq!(safe_json_parse("42", json!([])), json!(42));
    }
}
