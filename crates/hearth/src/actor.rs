//! # Base Actor Runtime
//!
//! The contract every actor implements and the per-instance task that runs
//! it. An instance is a tokio task that owns the actor value, its storage,
//! and its mailbox receiver; envelopes are processed strictly in arrival
//! order, which is what gives each business key single-writer semantics.
//!
//! Lifecycle of one instance:
//!
//! 1. initialize — KV table, actor schema DDL, socket restore, alarm re-arm
//! 2. load — the actor reconstructs working state from storage
//! 3. envelope loop — requests, socket traffic, alarm fires
//! 4. exit — on a `Hibernate` envelope or when every stub is dropped;
//!    dirty state is persisted first
//!
//! Working state in memory is a cache. Anything that must survive step 4
//! has to be written through [`ActorHost::store`] or [`ActorHost::sql`].

use crate::alarm::AlarmScheduler;
use crate::error::HearthError;
use crate::logger::Logger;
use crate::message::Envelope;
use crate::request::{Request, RequestContext, Response};
use crate::router::{Dispatch, Route, Router};
use crate::single_flight::SingleFlight;
use crate::socket::{ConnectionId, SocketRegistry, WebSocketManager};
use crate::storage::{JsonStore, SqlHelper};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::marker::PhantomData;
use tokio::sync::mpsc;

/// Reserved handler name for the built-in health route.
const HEALTH_ROUTE: &str = "__health";

/// A stateful actor definition. One implementation serves many instances;
/// each instance gets its own actor value, storage, and mailbox.
///
/// `load` runs on every wake, including respawns after hibernation, and is
/// the only place working state may be rebuilt from. Hook defaults are
/// no-ops so simple actors implement only `routes`, `load`, and `handle`.
#[async_trait]
pub trait Actor: Send + Sized + 'static {
    /// Stable actor name, used for logging and instance identity.
    const NAME: &'static str;

    /// The request surface, validated once at spawn. `GET /health` is
    /// reserved by the runtime.
    fn routes() -> Vec<Route>;

    /// DDL run at initialization, before `load`. May contain several
    /// statements.
    fn schema() -> Option<&'static str> {
        None
    }

    /// Reconstructs working state from storage.
    async fn load(host: &mut ActorHost) -> Result<Self, HearthError>;

    /// Handles one routed request. `route` is the name from the matching
    /// [`Route`]; returning an error yields an opaque 5xx envelope.
    async fn handle(
        &mut self,
        route: &'static str,
        ctx: RequestContext,
        host: &mut ActorHost,
    ) -> Result<Response, HearthError>;

    /// Called when the pending alarm fires. Must be idempotent: determine
    /// due work from persisted state, and treat a fire with nothing due as
    /// a no-op.
    async fn on_alarm(&mut self, host: &mut ActorHost) -> Result<(), HearthError> {
        let _ = host;
        Ok(())
    }

    /// Inbound text frame from an attached connection.
    async fn on_socket_message(
        &mut self,
        host: &mut ActorHost,
        conn: ConnectionId,
        text: &str,
    ) -> Result<(), HearthError> {
        let _ = (host, conn, text);
        Ok(())
    }

    /// An attached connection closed. The manager has already detached it.
    async fn on_socket_close(
        &mut self,
        host: &mut ActorHost,
        conn: ConnectionId,
    ) -> Result<(), HearthError> {
        let _ = (host, conn);
        Ok(())
    }

    /// Writes dirty working state back to storage. Invoked by the runtime
    /// after any envelope that called [`ActorHost::mark_dirty`], and before
    /// hibernation.
    async fn persist(&mut self, host: &mut ActorHost) -> Result<(), HearthError> {
        let _ = host;
        Ok(())
    }
}

/// Per-instance activity counters, reported by the health route.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub requests: u64,
    pub errors: u64,
    pub alarms_fired: u64,
    pub socket_connections: u64,
}

/// The services bundle handed to every actor hook. Fields are public so a
/// hook can borrow several services at once (e.g. run a locked operation
/// that reads through `store` while `locks` is held).
pub struct ActorHost {
    pub sql: SqlHelper,
    pub store: JsonStore,
    pub locks: SingleFlight<Value>,
    pub alarms: AlarmScheduler,
    pub sockets: WebSocketManager,
    pub log: Logger,
    pub counters: Counters,
    instance: String,
    started_at: u64,
    dirty: bool,
}

impl ActorHost {
    pub fn new(
        actor: &'static str,
        instance: impl Into<String>,
        pool: SqlitePool,
        registry: SocketRegistry,
        mailbox: mpsc::Sender<Envelope>,
    ) -> Self {
        let instance = instance.into();
        let log = Logger::new(actor, instance.clone());
        let sql = SqlHelper::new(pool, log.clone());
        let store = JsonStore::new(sql.clone(), log.clone());
        Self {
            sockets: WebSocketManager::new(
                instance.clone(),
                registry,
                store.clone(),
                log.clone(),
            ),
            alarms: AlarmScheduler::new(mailbox, store.clone(), log.clone()),
            locks: SingleFlight::new(),
            sql,
            store,
            log,
            counters: Counters::default(),
            instance,
            started_at: crate::now_ms(),
            dirty: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// Flags working state as ahead of storage. The runtime calls the
    /// actor's `persist` after the current envelope.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn uptime_ms(&self) -> u64 {
        crate::now_ms().saturating_sub(self.started_at)
    }

    async fn initialize(&mut self, schema: Option<&str>) -> Result<(), HearthError> {
        self.store.create_table().await?;
        if let Some(ddl) = schema {
            self.sql.run_ddl(ddl).await?;
        }
        let restored = self.sockets.restore().await?;
        self.counters.socket_connections += restored as u64;
        self.alarms.re_arm().await?;
        Ok(())
    }
}

/// The per-instance task body. Constructed by the factory, which validates
/// the route table here so a broken table fails the spawn, not a request.
pub(crate) struct InstanceRuntime<A: Actor> {
    host: ActorHost,
    router: Router,
    mailbox: mpsc::Receiver<Envelope>,
    _actor: PhantomData<A>,
}

impl<A: Actor> InstanceRuntime<A> {
    pub(crate) fn new(
        host: ActorHost,
        mailbox: mpsc::Receiver<Envelope>,
    ) -> Result<Self, HearthError> {
        let mut routes = vec![Route::get("/health", HEALTH_ROUTE)];
        routes.extend(A::routes());
        let router = Router::new(&routes)?;
        Ok(Self {
            host,
            router,
            mailbox,
            _actor: PhantomData,
        })
    }

    pub(crate) async fn run(mut self) {
        self.host.log.info("instance starting");
        if let Err(err) = self.host.initialize(A::schema()).await {
            self.host.log.error_cause("instance initialization failed", &err);
            self.fail_pending();
            return;
        }
        let mut actor = match A::load(&mut self.host).await {
            Ok(actor) => actor,
            Err(err) => {
                self.host.log.error_cause("failed to load actor state", &err);
                self.fail_pending();
                return;
            }
        };

        while let Some(envelope) = self.mailbox.recv().await {
            match envelope {
                Envelope::Invoke {
                    request,
                    respond_to,
                } => {
                    let response = self.invoke(&mut actor, request).await;
                    let _ = respond_to.send(response);
                }
                Envelope::Connect { tag, respond_to } => {
                    let result = self.host.sockets.connect(tag).await;
                    if result.is_ok() {
                        self.host.counters.socket_connections += 1;
                    }
                    let _ = respond_to.send(result);
                }
                Envelope::SocketMessage { conn, text } => {
                    if let Err(err) = actor
                        .on_socket_message(&mut self.host, conn, &text)
                        .await
                    {
                        self.host.counters.errors += 1;
                        self.host
                            .log
                            .error_cause("socket message handler failed", &err);
                    }
                }
                Envelope::SocketClosed { conn } => {
                    if let Err(err) = self.host.sockets.on_close(conn).await {
                        self.host
                            .log
                            .warn_cause("failed to detach closed connection", &err);
                    }
                    if let Err(err) = actor.on_socket_close(&mut self.host, conn).await {
                        self.host.counters.errors += 1;
                        self.host
                            .log
                            .error_cause("socket close handler failed", &err);
                    }
                }
                Envelope::AlarmFired { scheduled_for } => {
                    match self.host.alarms.acknowledge(scheduled_for).await {
                        Ok(true) => {
                            self.host.counters.alarms_fired += 1;
                            if let Err(err) = actor.on_alarm(&mut self.host).await {
                                self.host.counters.errors += 1;
                                self.host.log.error_cause("alarm handler failed", &err);
                            }
                        }
                        Ok(false) => self.host.log.debug("skipping stale alarm fire"),
                        Err(err) => {
                            self.host
                                .log
                                .warn_cause("failed to acknowledge alarm", &err);
                        }
                    }
                }
                Envelope::Hibernate { respond_to } => {
                    self.persist_if_dirty(&mut actor).await;
                    self.host.log.info("instance hibernating");
                    let _ = respond_to.send(());
                    return;
                }
            }
            self.persist_if_dirty(&mut actor).await;
        }

        // Every stub dropped; exit like a hibernation.
        self.persist_if_dirty(&mut actor).await;
        self.host.log.info("instance stopping");
    }

    async fn invoke(&mut self, actor: &mut A, request: Request) -> Response {
        self.host.counters.requests += 1;
        match self.router.dispatch(request.method, &request.path) {
            Dispatch::Matched { name, params } => {
                if name == HEALTH_ROUTE {
                    return self.health();
                }
                let ctx = RequestContext::new(request, params);
                match actor.handle(name, ctx, &mut self.host).await {
                    Ok(response) => response,
                    Err(err) => {
                        self.host.counters.errors += 1;
                        self.host.log.error_cause("handler failed", &err);
                        failure_response(&err)
                    }
                }
            }
            Dispatch::NotFound => Response::not_found(),
            Dispatch::MethodNotAllowed => Response::method_not_allowed(),
        }
    }

    fn health(&self) -> Response {
        Response::ok(serde_json::json!({
            "status": "ok",
            "actor": A::NAME,
            "instance": self.host.instance_id(),
            "uptime_ms": self.host.uptime_ms(),
            "counters": self.host.counters,
        }))
    }

    async fn persist_if_dirty(&mut self, actor: &mut A) {
        if !self.host.dirty {
            return;
        }
        match actor.persist(&mut self.host).await {
            Ok(()) => self.host.dirty = false,
            Err(err) => {
                self.host.counters.errors += 1;
                self.host
                    .log
                    .error_cause("persist failed, state stays dirty", &err);
            }
        }
    }

    /// Answers envelopes already queued when startup fails, so no caller
    /// hangs on a oneshot that will never resolve.
    fn fail_pending(&mut self) {
        while let Ok(envelope) = self.mailbox.try_recv() {
            match envelope {
                Envelope::Invoke { respond_to, .. } => {
                    let _ = respond_to.send(Response::internal_error("instance_init_failed"));
                }
                Envelope::Connect { respond_to, .. } => {
                    let _ = respond_to.send(Err(HearthError::InstanceClosed));
                }
                Envelope::Hibernate { respond_to } => {
                    let _ = respond_to.send(());
                }
                Envelope::SocketMessage { .. }
                | Envelope::SocketClosed { .. }
                | Envelope::AlarmFired { .. } => {}
            }
        }
    }
}

/// Maps a handler error to its wire shape. Caller-fault shapes get a 400
/// with the real description; everything else is an opaque 500, with the
/// cause only in the log.
fn failure_response(err: &HearthError) -> Response {
    match err {
        HearthError::ResponseShape(description) => {
            Response::bad_request("invalid_body", description)
        }
        _ => Response::internal_error(err.error_code()),
    }
}
