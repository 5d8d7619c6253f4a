//! Connection handles
//!
//! A `ConnectionHandle` is the registry's and relay's view of one live stream.
//! The transport owns the matching `OutboundReceiver` and writes every frame
//! it yields to the socket.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

/// A serialized JSON frame, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Frame>;

/// Unique identifier for a live connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct Shared {
    id: ConnectionId,
    session_id: String,
    state: AtomicU8,
    outbound: mpsc::Sender<Frame>,
    closing: CancellationToken,
}

/// Cheaply cloneable handle to one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("session_id", &self.shared.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state with an outbound queue of
    /// `capacity` frames.
    pub fn new(session_id: impl Into<String>, capacity: usize) -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                session_id: session_id.into(),
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                outbound,
                closing: CancellationToken::new(),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The session this connection was opened for.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move to `Open`. Returns false if the connection had already moved past it.
    pub(crate) fn mark_open(&self) -> bool {
        self.advance(ConnectionState::Open)
    }

    pub(crate) fn mark_closed(&self) {
        self.advance(ConnectionState::Closed);
        self.shared.closing.cancel();
    }

    /// Begin closing: new deliveries are refused and `closed()` resolves.
    pub fn close(&self) {
        if self.advance(ConnectionState::Closing) {
            debug!(conn_id = %self.id(), "connection closing");
        }
        self.shared.closing.cancel();
    }

    /// Close after a transport error observed by the writer or reader.
    pub fn fail(&self, reason: &str) {
        if self.advance(ConnectionState::Closing) {
            warn!(conn_id = %self.id(), session = %self.session_id(), reason, "connection failed");
        }
        self.shared.closing.cancel();
    }

    /// Resolves once the connection has started closing for any reason.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shared.closing.cancelled()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    /// Queue a frame for the transport writer without waiting.
    ///
    /// A missing writer means the transport failed; the connection is moved to
    /// `Closing` so its lifecycle loop exits and deregisters it.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed(self.id()));
        }
        match self.shared.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Lagging(self.id())),
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(DeliveryError::Transport(self.id()))
            }
        }
    }

    fn advance(&self, to: ConnectionState) -> bool {
        self.shared
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .is_ok()
    }
}
