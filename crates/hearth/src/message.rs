//! # Instance Mailbox Protocol
//!
//! The envelope type delivered to an instance's mailbox. Stubs send
//! envelopes over a Tokio mpsc channel and receive replies on oneshot
//! channels; the runtime processes them strictly in order, which is what
//! gives each instance its single-writer semantics.

use crate::error::HearthError;
use crate::request::{Request, Response};
use crate::socket::{ConnectionId, SocketConnection};
use tokio::sync::oneshot;

/// Messages delivered to an instance runtime.
#[derive(Debug)]
pub enum Envelope {
    /// An HTTP-shaped request. Always answered — routing misses and
    /// handler failures come back as structured error responses.
    Invoke {
        request: Request,
        respond_to: oneshot::Sender<Response>,
    },
    /// Attach a long-lived connection, optionally tagged for grouped
    /// broadcasts.
    Connect {
        tag: Option<String>,
        respond_to: oneshot::Sender<Result<SocketConnection, HearthError>>,
    },
    /// An inbound text frame from an attached connection.
    SocketMessage { conn: ConnectionId, text: String },
    /// An attached connection closed on the caller side.
    SocketClosed { conn: ConnectionId },
    /// The wake-up timer fired for the given target time.
    AlarmFired { scheduled_for: u64 },
    /// Evict the instance from memory. Durable storage and host-retained
    /// connections survive; the factory respawns on the next request.
    Hibernate { respond_to: oneshot::Sender<()> },
}
