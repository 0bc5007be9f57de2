//! # Attached Connections
//!
//! Long-lived connections attached to an actor instance, grouped by an
//! optional tag so broadcasts can target a subset (e.g. only
//! "progress-watchers"). The manager is host-agnostic: a connection handle
//! is the write half of a text channel supplied by the host, the same way
//! the rest of the framework models endpoints as channel halves.
//!
//! Hibernation: the in-memory session map dies with the instance, but the
//! host-level [`SocketRegistry`] keeps the raw handles alive and tag
//! membership is persisted as a small attachment record (connection id →
//! tag) in the JSON store. On wake the manager re-derives each connection's
//! tag from that record, falling back to untagged for connections it has no
//! record of — group membership is never silently guessed.

use crate::error::HearthError;
use crate::logger::Logger;
use crate::storage::JsonStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type ConnectionId = u64;

const TAGS_KEY: &str = "__hearth_socket_tags";
const CONNECTION_CAPACITY: usize = 32;

/// Framework-side write half of an attached connection.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: ConnectionId,
    sender: mpsc::Sender<String>,
}

impl SocketHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn deliver(&self, message: &str) -> Delivery {
        match self.sender.try_send(message.to_string()) {
            Ok(()) => Delivery::Sent,
            // A full buffer is backpressure, not death: the message is
            // skipped but the connection keeps its group membership.
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Skipped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

enum Delivery {
    Sent,
    Skipped,
    Gone,
}

/// Caller-side half of an attached connection: the id to address it by and
/// the receiver that yields broadcasts.
#[derive(Debug)]
pub struct SocketConnection {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<String>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: ConnectionId,
    attached: HashMap<String, Vec<SocketHandle>>,
}

/// Host-level list of still-attached connections per instance. Owned by the
/// factory, so handles survive instance eviction and can be handed back to
/// the manager on wake.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection for an instance, returning the framework-side
    /// handle and the caller-side receiver.
    pub fn open(&self, instance: &str, capacity: usize) -> (SocketHandle, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("socket registry poisoned");
        inner.next_id += 1;
        let handle = SocketHandle {
            id: inner.next_id,
            sender,
        };
        inner
            .attached
            .entry(instance.to_string())
            .or_default()
            .push(handle.clone());
        (handle, receiver)
    }

    /// Still-attached handles for an instance, with closed ones pruned.
    pub fn attached(&self, instance: &str) -> Vec<SocketHandle> {
        let mut inner = self.inner.lock().expect("socket registry poisoned");
        if let Some(handles) = inner.attached.get_mut(instance) {
            handles.retain(|h| !h.is_closed());
            handles.clone()
        } else {
            Vec::new()
        }
    }

    pub fn drop_connection(&self, instance: &str, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("socket registry poisoned");
        if let Some(handles) = inner.attached.get_mut(instance) {
            handles.retain(|h| h.id != id);
        }
    }
}

/// Broadcast audience: every attached connection, or one tag group.
#[derive(Debug, Clone, Copy)]
pub enum BroadcastTarget<'a> {
    All,
    Tag(&'a str),
}

struct Session {
    handle: SocketHandle,
    tag: Option<String>,
    #[allow(dead_code)]
    attached_at: u64,
}

/// Per-instance connection manager.
pub struct WebSocketManager {
    instance: String,
    registry: SocketRegistry,
    store: JsonStore,
    log: Logger,
    sessions: HashMap<ConnectionId, Session>,
}

impl WebSocketManager {
    pub fn new(instance: impl Into<String>, registry: SocketRegistry, store: JsonStore, log: Logger) -> Self {
        Self {
            instance: instance.into(),
            registry,
            store,
            log,
            sessions: HashMap::new(),
        }
    }

    /// Opens a fresh connection for this instance and registers it in one
    /// step, returning the caller-side half.
    pub async fn connect(&mut self, tag: Option<String>) -> Result<SocketConnection, HearthError> {
        let (handle, receiver) = self.registry.open(&self.instance, CONNECTION_CAPACITY);
        let id = self.accept(handle, tag).await?;
        Ok(SocketConnection { id, receiver })
    }

    /// Registers a connection under an optional tag and persists the
    /// attachment record so the tag survives hibernation.
    pub async fn accept(
        &mut self,
        handle: SocketHandle,
        tag: Option<String>,
    ) -> Result<ConnectionId, HearthError> {
        let id = handle.id();
        self.sessions.insert(
            id,
            Session {
                handle,
                tag,
                attached_at: crate::now_ms(),
            },
        );
        self.persist_tags().await?;
        self.log.debug("connection attached");
        Ok(id)
    }

    /// Rebuilds the session map from host-retained handles after a wake.
    /// Tags come from the persisted attachment record; connections with no
    /// record are kept untagged rather than dropped.
    pub async fn restore(&mut self) -> Result<usize, HearthError> {
        let record = self
            .store
            .get_or(TAGS_KEY, Value::Object(Default::default()))
            .await;
        let tags = record.as_object().cloned().unwrap_or_default();

        self.sessions.clear();
        for handle in self.registry.attached(&self.instance) {
            let tag = tags
                .get(&handle.id().to_string())
                .and_then(Value::as_str)
                .map(String::from);
            self.sessions.insert(
                handle.id(),
                Session {
                    handle,
                    tag,
                    attached_at: crate::now_ms(),
                },
            );
        }

        let restored = self.sessions.len();
        if restored > 0 {
            self.log.debug("re-attached connections after wake");
            self.persist_tags().await?;
        }
        Ok(restored)
    }

    /// Sends a message to every connection in the target group. Dead
    /// connections are dropped from the group and the broadcast continues;
    /// returns the number of successful deliveries.
    pub async fn broadcast(
        &mut self,
        target: BroadcastTarget<'_>,
        message: &str,
    ) -> Result<usize, HearthError> {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, session) in &self.sessions {
            let in_target = match target {
                BroadcastTarget::All => true,
                BroadcastTarget::Tag(tag) => session.tag.as_deref() == Some(tag),
            };
            if !in_target {
                continue;
            }
            match session.handle.deliver(message) {
                Delivery::Sent => delivered += 1,
                Delivery::Skipped => {}
                Delivery::Gone => dead.push(*id),
            }
        }

        for id in dead {
            self.log.debug("dropping dead connection during broadcast");
            self.remove(id);
        }
        self.persist_tags().await?;
        Ok(delivered)
    }

    /// Detaches a closed connection from the group.
    pub async fn on_close(&mut self, id: ConnectionId) -> Result<(), HearthError> {
        self.remove(id);
        self.persist_tags().await
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_for_tag(&self, tag: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.tag.as_deref() == Some(tag))
            .count()
    }

    fn remove(&mut self, id: ConnectionId) {
        self.sessions.remove(&id);
        self.registry.drop_connection(&self.instance, id);
    }

    async fn persist_tags(&self) -> Result<(), HearthError> {
        let mut record = serde_json::Map::new();
        for (id, session) in &self.sessions {
            let tag = match &session.tag {
                Some(tag) => Value::String(tag.clone()),
                None => Value::Null,
            };
            record.insert(id.to_string(), tag);
        }
        self.store.set(TAGS_KEY, &Value::Object(record)).await
    }
}
