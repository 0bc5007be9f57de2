//! # Instance Factory
//!
//! Resolves business keys to running instances. The factory derives a
//! stable identity from the normalized key, spawns an instance task on
//! first use, and hands out cloneable stubs. Across hibernation it retains
//! exactly what must survive: the instance's SQLite pool and the socket
//! registry; the next request respawns the task against them.
//!
//! Callers never see instance lifecycle. `fetch` on a hibernated key wakes
//! it transparently.

use crate::actor::{Actor, ActorHost, InstanceRuntime};
use crate::error::HearthError;
use crate::message::Envelope;
use crate::request::{Request, Response};
use crate::socket::{ConnectionId, SocketConnection, SocketRegistry};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable instance identity derived from a business key. The key is
/// trimmed and lowercased before hashing, so "  Tenant-A " and "tenant-a"
/// address the same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn derive(business_key: &str) -> Self {
        let normalized = business_key.trim().to_lowercase();
        let mut hash = FNV_OFFSET;
        for byte in normalized.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(format!("{hash:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an instance's SQLite database lives.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// One in-memory database per instance. The pool is retained across
    /// hibernation, so state survives eviction but not process exit.
    #[default]
    InMemory,
    /// One database file per instance under the directory.
    OnDisk { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub mailbox_capacity: usize,
    pub storage: StorageConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            storage: StorageConfig::InMemory,
        }
    }
}

/// Cloneable handle to one instance's mailbox.
#[derive(Debug, Clone)]
pub struct InstanceStub {
    mailbox: mpsc::Sender<Envelope>,
}

impl InstanceStub {
    pub(crate) fn from_mailbox(mailbox: mpsc::Sender<Envelope>) -> Self {
        Self { mailbox }
    }

    /// Sends a request and awaits its response. Every request is answered;
    /// an `Err` here means the instance went away mid-call.
    pub async fn send(&self, request: Request) -> Result<Response, HearthError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Invoke {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| HearthError::InstanceClosed)?;
        rx.await.map_err(|_| HearthError::InstanceDropped)
    }

    /// Attaches a long-lived connection, optionally tagged for grouped
    /// broadcasts.
    pub async fn connect(&self, tag: Option<String>) -> Result<SocketConnection, HearthError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Envelope::Connect {
                tag,
                respond_to: tx,
            })
            .await
            .map_err(|_| HearthError::InstanceClosed)?;
        rx.await.map_err(|_| HearthError::InstanceDropped)?
    }

    /// Typed request against this stub; see [`Factory::fetch_json`] for the
    /// rejection rules.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T, HearthError> {
        decode_json(self.send(request).await?)
    }

    /// Delivers an inbound text frame from an attached connection.
    pub async fn socket_message(
        &self,
        conn: ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), HearthError> {
        self.mailbox
            .send(Envelope::SocketMessage {
                conn,
                text: text.into(),
            })
            .await
            .map_err(|_| HearthError::InstanceClosed)
    }

    /// Signals that an attached connection closed on the caller side.
    pub async fn socket_close(&self, conn: ConnectionId) -> Result<(), HearthError> {
        self.mailbox
            .send(Envelope::SocketClosed { conn })
            .await
            .map_err(|_| HearthError::InstanceClosed)
    }

    /// Evicts the instance from memory and awaits the acknowledgement.
    /// Already-gone instances acknowledge trivially.
    pub async fn hibernate(&self) -> Result<(), HearthError> {
        let (tx, rx) = oneshot::channel();
        if self
            .mailbox
            .send(Envelope::Hibernate { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Typed decode shared by `fetch_json` and `send_json`: a non-success
/// response becomes `RemoteStatus` with its decoded envelope, and a success
/// body that does not deserialize as `T` becomes `ResponseShape`.
fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, HearthError> {
    if !response.is_success() {
        let envelope = response.error_envelope();
        return Err(HearthError::RemoteStatus {
            status: response.status,
            code: envelope.error_code,
            description: envelope.error_description,
        });
    }
    serde_json::from_value(response.body)
        .map_err(|err| HearthError::ResponseShape(err.to_string()))
}

struct Retained {
    pool: SqlitePool,
    stub: Option<InstanceStub>,
}

/// Resolves business keys to instances of one actor type.
pub struct Factory<A: Actor> {
    config: FactoryConfig,
    registry: SocketRegistry,
    retained: Arc<Mutex<HashMap<InstanceId, Retained>>>,
    // fn pointer marker so sharing a factory never requires A itself to be
    // Sync; only spawned runtimes own actor values.
    _actor: std::marker::PhantomData<fn() -> A>,
}

impl<A: Actor> Factory<A> {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            config,
            registry: SocketRegistry::new(),
            retained: Arc::new(Mutex::new(HashMap::new())),
            _actor: std::marker::PhantomData,
        }
    }

    /// Resolves a key to a live stub, spawning or respawning the instance
    /// as needed. Same key, same instance.
    pub async fn stub(&self, business_key: &str) -> Result<InstanceStub, HearthError> {
        let id = InstanceId::derive(business_key);
        let mut retained = self.retained.lock().await;

        if let Some(entry) = retained.get(&id) {
            if let Some(stub) = &entry.stub {
                if !stub.is_closed() {
                    return Ok(stub.clone());
                }
            }
        }

        let pool = match retained.get(&id) {
            Some(entry) => entry.pool.clone(),
            None => self.open_pool(&id).await?,
        };
        let stub = self.spawn(&id, pool.clone())?;
        retained.insert(
            id,
            Retained {
                pool,
                stub: Some(stub.clone()),
            },
        );
        Ok(stub)
    }

    /// One-shot request against a key.
    pub async fn fetch(
        &self,
        business_key: &str,
        request: Request,
    ) -> Result<Response, HearthError> {
        let stub = self.stub(business_key).await?;
        match stub.send(request.clone()).await {
            Ok(response) => Ok(response),
            // Lost a race against hibernation. Both variants mean the
            // envelope was never processed, so the respawned instance can
            // serve the retry without double-executing anything.
            Err(HearthError::InstanceClosed) | Err(HearthError::InstanceDropped) => {
                let stub = self.stub(business_key).await?;
                stub.send(request).await
            }
            Err(err) => Err(err),
        }
    }

    /// Typed request: rejects non-success responses (decoding their error
    /// envelope) and success bodies that do not deserialize as `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        business_key: &str,
        request: Request,
    ) -> Result<T, HearthError> {
        decode_json(self.fetch(business_key, request).await?)
    }

    /// Attaches a connection to a key's instance.
    pub async fn connect(
        &self,
        business_key: &str,
        tag: Option<String>,
    ) -> Result<SocketConnection, HearthError> {
        let stub = self.stub(business_key).await?;
        stub.connect(tag).await
    }

    /// Evicts a key's instance from memory. Its pool and attached
    /// connections stay retained; the next request respawns it.
    pub async fn hibernate(&self, business_key: &str) -> Result<(), HearthError> {
        let id = InstanceId::derive(business_key);
        // The map lock is held through the drain acknowledgement. A
        // concurrent resolve for the same key blocks here instead of
        // respawning over a runtime that is still processing its mailbox,
        // which would put two writers on one pool.
        let mut retained = self.retained.lock().await;
        if let Some(entry) = retained.get_mut(&id) {
            if let Some(stub) = entry.stub.take() {
                stub.hibernate().await?;
            }
        }
        Ok(())
    }

    fn spawn(&self, id: &InstanceId, pool: SqlitePool) -> Result<InstanceStub, HearthError> {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        let host = ActorHost::new(
            A::NAME,
            id.as_str(),
            pool,
            self.registry.clone(),
            tx.clone(),
        );
        let runtime = InstanceRuntime::<A>::new(host, rx)?;
        tokio::spawn(runtime.run());
        Ok(InstanceStub::from_mailbox(tx))
    }

    async fn open_pool(&self, id: &InstanceId) -> Result<SqlitePool, HearthError> {
        // A single connection held open for the pool's lifetime. For the
        // in-memory backend this is also what keeps the database alive
        // across hibernation.
        let options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        let pool = match &self.config.storage {
            StorageConfig::InMemory => options.connect("sqlite::memory:").await?,
            StorageConfig::OnDisk { dir } => {
                let connect = SqliteConnectOptions::new()
                    .filename(dir.join(format!("{}-{}.db", A::NAME, id)))
                    .create_if_missing(true);
                options.connect_with(connect).await?
            }
        };
        Ok(pool)
    }
}
