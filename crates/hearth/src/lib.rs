//! # Hearth
//!
//! Single-writer, per-key stateful actors with hibernation.
//!
//! A [`Factory`] resolves business keys to actor instances: one tokio task
//! per key, owning its own SQLite storage, alarm, and attached connections,
//! processing requests strictly in order. Instances hibernate away when
//! idle and respawn transparently on the next request, reconstructing
//! working state from storage.
//!
//! ## Defining an actor
//!
//! Implement [`Actor`]: declare a route table, reconstruct state in `load`,
//! and dispatch on the route name in `handle`. Hooks for alarms, socket
//! traffic, and persistence are optional.
//!
//! ```ignore
//! struct Counter { total: u64 }
//!
//! #[async_trait]
//! impl Actor for Counter {
//!     const NAME: &'static str = "counter";
//!
//!     fn routes() -> Vec<Route> {
//!         vec![
//!             Route::post("/hit", "hit"),
//!             Route::get("/total", "total"),
//!         ]
//!     }
//!
//!     async fn load(host: &mut ActorHost) -> Result<Self, HearthError> {
//!         let total = host.store.get_as("total").await?.unwrap_or(0);
//!         Ok(Self { total })
//!     }
//!
//!     async fn handle(
//!         &mut self,
//!         route: &'static str,
//!         _ctx: RequestContext,
//!         host: &mut ActorHost,
//!     ) -> Result<Response, HearthError> {
//!         match route {
//!             "hit" => {
//!                 self.total += 1;
//!                 host.store.set("total", &json!(self.total)).await?;
//!                 Ok(Response::ok(json!({"total": self.total})))
//!             }
//!             _ => Ok(Response::ok(json!({"total": self.total}))),
//!         }
//!     }
//! }
//!
//! let factory = Factory::<Counter>::new(FactoryConfig::default());
//! let resp = factory.fetch("tenant-a", Request::post("/hit")).await?;
//! ```
//!
//! ## Durability model
//!
//! In-memory actor state is a cache. Anything that must survive
//! hibernation goes through [`ActorHost::store`] (JSON key/value) or
//! [`ActorHost::sql`] (parameterized SQL); `load` is the only place it
//! comes back from.

pub mod actor;
pub mod alarm;
pub mod error;
pub mod factory;
pub mod logger;
pub mod message;
pub mod mock;
pub mod request;
pub mod router;
pub mod single_flight;
pub mod socket;
pub mod storage;

pub use actor::{Actor, ActorHost, Counters};
pub use alarm::AlarmScheduler;
pub use error::{ErrorEnvelope, HearthError};
pub use factory::{Factory, FactoryConfig, InstanceId, InstanceStub, StorageConfig};
pub use logger::{init_tracing, Logger};
pub use message::Envelope;
pub use mock::StubHarness;
pub use request::{Method, Request, RequestContext, Response};
pub use router::{Dispatch, Route, Router};
pub use single_flight::SingleFlight;
pub use socket::{BroadcastTarget, ConnectionId, SocketConnection, SocketRegistry, WebSocketManager};
pub use storage::{safe_json_parse, JsonStore, SqlArg, SqlHelper};

/// Current unix time in milliseconds. All persisted timestamps and alarm
/// fire-at values use this clock.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
