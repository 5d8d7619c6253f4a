//! Broadcast Relay
//!
//! Fans a message out to a snapshot of a session's members. Each call stamps
//! and serializes the message once; recipients share the resulting frame.
//! A failed recipient never aborts delivery to the rest and is deregistered
//! once the fan-out completes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionId, Frame};
use crate::error::DeliveryError;
use crate::message::Message;
use crate::registry::{ALL_SESSIONS, SessionRegistry};

/// Outcome of handing a frame to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The connection was not open; nothing was sent.
    Skipped,
    /// The connection's queue was full; the frame was discarded.
    Dropped,
    /// The transport is gone; the connection has been deregistered.
    Failed,
}

/// Per-call delivery tally. `recipients` is the size of the member snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl BroadcastReport {
    fn record(&mut self, outcome: Delivery) {
        match outcome {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Skipped => self.skipped += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Failed => self.failed += 1,
        }
    }
}

/// Relay-wide delivery counters
#[derive(Debug, Default)]
pub struct RelayStats {
    pub broadcasts: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_skipped: AtomicU64,
    /// Frames discarded because the recipient's queue was full
    pub frames_dropped: AtomicU64,
    pub deliveries_failed: AtomicU64,
    /// Text or binary frames read from clients
    pub frames_received: AtomicU64,
    /// Inbound frames answered with an "Invalid message format" error
    pub frames_rejected: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: Delivery) {
        let counter = match outcome {
            Delivery::Delivered => &self.frames_delivered,
            Delivery::Skipped => &self.frames_skipped,
            Delivery::Dropped => &self.frames_dropped,
            Delivery::Failed => &self.deliveries_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of relay stats (for serialization/logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub deliveries_failed: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    stats: RelayStats,
}

impl Relay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: RelayStats::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Deliver to exactly one connection. Never errors: a closed connection is
    /// skipped, a failed one is deregistered.
    pub async fn send_to(&self, message: &Message, conn: &ConnectionHandle) -> Delivery {
        let frame = message.to_frame(Utc::now());
        let outcome = self.deliver(&frame, conn);
        if outcome == Delivery::Failed {
            self.registry.leave_all(conn.id()).await;
        }
        outcome
    }

    /// Deliver to every member of `session_id`, or of "all" when `None`.
    pub async fn broadcast(&self, message: &Message, session_id: Option<&str>) -> BroadcastReport {
        let session_id = session_id.unwrap_or(ALL_SESSIONS);
        let members = self.registry.members(session_id).await;
        self.fan_out(message, session_id, members).await
    }

    /// Deliver to every member of `session_id` except `origin`.
    pub async fn broadcast_from(
        &self,
        message: &Message,
        session_id: &str,
        origin: ConnectionId,
    ) -> BroadcastReport {
        let mut members = self.registry.members(session_id).await;
        members.retain(|conn| conn.id() != origin);
        self.fan_out(message, session_id, members).await
    }

    async fn fan_out(
        &self,
        message: &Message,
        session_id: &str,
        members: Vec<ConnectionHandle>,
    ) -> BroadcastReport {
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut report = BroadcastReport {
            recipients: members.len(),
            ..BroadcastReport::default()
        };
        if members.is_empty() {
            return report;
        }

        let frame = message.to_frame(Utc::now());
        let mut failed = Vec::new();
        for conn in &members {
            let outcome = self.deliver(&frame, conn);
            if outcome == Delivery::Failed {
                failed.push(conn.id());
            }
            report.record(outcome);
        }

        // Every recipient has been tried before any deregistration.
        for id in failed {
            self.registry.leave_all(id).await;
        }

        debug!(
            session = %session_id,
            kind = message.kind(),
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast"
        );
        report
    }

    fn deliver(&self, frame: &Frame, conn: &ConnectionHandle) -> Delivery {
        let outcome = match conn.deliver(frame.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(DeliveryError::Closed(_)) => Delivery::Skipped,
            Err(e @ DeliveryError::Lagging(_)) => {
                warn!(session = %conn.session_id(), "{e}, dropping frame");
                Delivery::Dropped
            }
            Err(e @ DeliveryError::Transport(_)) => {
                warn!(session = %conn.session_id(), "{e}");
                Delivery::Failed
            }
        };
        self.stats.record(outcome);
        outcome
    }
}
