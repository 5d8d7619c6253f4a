//! Session Relay - session-scoped connection registry and broadcast relay
//!
//! This crate tracks live streaming connections grouped by session id and
//! fans JSON messages out to them. It has no HTTP or WebSocket dependencies:
//! a transport adapter feeds inbound frames in as a stream and drains each
//! connection's outbound queue into its socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_relay::{ConnectionHandle, Inbound, Message, Relay, SessionRegistry, StreamMode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = Arc::new(Relay::new(Arc::new(SessionRegistry::new())));
//!
//!     let (conn, mut outbound) = ConnectionHandle::new("race-42", 64);
//!     let (client, inbound) = futures::channel::mpsc::unbounded::<Result<Inbound, String>>();
//!
//!     // Writer side: forward queued frames to the socket
//!     tokio::spawn(async move {
//!         while let Some(frame) = outbound.recv().await {
//!             println!("-> {frame}");
//!         }
//!     });
//!
//!     let task = tokio::spawn(session_relay::serve(
//!         relay.clone(),
//!         conn,
//!         inbound,
//!         StreamMode::Broadcast,
//!     ));
//!
//!     client
//!         .unbounded_send(Ok(Inbound::Text(r#"{"type":"ping"}"#.into())))
//!         .unwrap();
//!     relay.broadcast(&Message::info("green flag"), Some("race-42")).await;
//!
//!     client.unbounded_send(Ok(Inbound::Close)).unwrap();
//!     println!("disconnected: {}", task.await.unwrap());
//! }
//! ```

mod connection;
mod error;
mod lifecycle;
pub mod message;
mod registry;
mod relay;
mod telemetry;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, Frame, OutboundReceiver};
pub use error::{DeliveryError, MessageError};
pub use lifecycle::{Disconnect, Inbound, StreamMode, serve};
pub use message::{ClientMessage, Message};
pub use registry::{ALL_SESSIONS, SessionRegistry, SessionSummary};
pub use relay::{BroadcastReport, Delivery, Relay, RelayStats, RelayStatsSnapshot};
pub use telemetry::TelemetryProvider;
