//! Connection Lifecycle
//!
//! [`serve`] drives one connection from registration to cleanup. The transport
//! adapter supplies the inbound half as a stream of [`Inbound`] frames and
//! drains the connection's outbound queue on its own; nothing here knows about
//! sockets.
//!
//! Every exit path (client close, transport error, cancellation, panic) ends
//! with the connection deregistered and in the `Closed` state.

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandle;
use crate::message::{ClientMessage, INVALID_FORMAT, Message};
use crate::relay::Relay;
use crate::telemetry::TelemetryProvider;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A frame read from the client, already stripped of transport framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Transport-level keepalive. Answered by the transport itself.
    Ping(Vec<u8>),
    Close,
}

/// Which loop a connection runs once it is registered.
#[derive(Clone)]
pub enum StreamMode {
    /// Push live telemetry for the connection's session to that connection only.
    Telemetry {
        provider: Arc<dyn TelemetryProvider>,
        driver_id: Option<String>,
        poll_interval: Duration,
    },
    /// Relay client-published events to the other members of the session.
    Broadcast,
}

impl StreamMode {
    pub fn name(&self) -> &'static str {
        match self {
            StreamMode::Telemetry { .. } => "telemetry",
            StreamMode::Broadcast => "broadcast",
        }
    }
}

impl fmt::Debug for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Telemetry {
                driver_id,
                poll_interval,
                ..
            } => f
                .debug_struct("Telemetry")
                .field("driver_id", driver_id)
                .field("poll_interval", poll_interval)
                .finish_non_exhaustive(),
            StreamMode::Broadcast => f.write_str("Broadcast"),
        }
    }
}

/// Why a connection's loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The client sent a close frame.
    ClientClosed,
    /// The inbound stream ended without a close frame.
    StreamEnded,
    /// Reading from the transport failed.
    Transport(String),
    /// The connection was closed from elsewhere (shutdown, failed delivery).
    Cancelled,
    /// The loop panicked; the panic was contained.
    Panicked,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::ClientClosed => f.write_str("client closed"),
            Disconnect::StreamEnded => f.write_str("stream ended"),
            Disconnect::Transport(e) => write!(f, "transport error: {e}"),
            Disconnect::Cancelled => f.write_str("cancelled"),
            Disconnect::Panicked => f.write_str("handler panicked"),
        }
    }
}

/// Register `conn`, run `mode`'s loop over `inbound`, then clean up.
pub async fn serve<S, E>(
    relay: Arc<Relay>,
    conn: ConnectionHandle,
    inbound: S,
    mode: StreamMode,
) -> Disconnect
where
    S: Stream<Item = Result<Inbound, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let session_id = conn.session_id().to_string();
    conn.mark_open();
    relay.registry().join(&conn, &session_id).await;
    info!(conn_id = %conn.id(), session = %session_id, mode = mode.name(), "stream opened");

    let outcome = AssertUnwindSafe(run(&relay, &conn, inbound, mode))
        .catch_unwind()
        .await;
    let reason = outcome.unwrap_or_else(|_| {
        error!(conn_id = %conn.id(), session = %session_id, "stream handler panicked");
        Disconnect::Panicked
    });

    conn.close();
    relay.registry().leave(conn.id(), &session_id).await;
    conn.mark_closed();
    info!(conn_id = %conn.id(), session = %session_id, %reason, "stream closed");
    reason
}

async fn run<S, E>(relay: &Relay, conn: &ConnectionHandle, inbound: S, mode: StreamMode) -> Disconnect
where
    S: Stream<Item = Result<Inbound, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    match mode {
        StreamMode::Telemetry {
            provider,
            driver_id,
            poll_interval,
        } => {
            telemetry_loop(
                relay,
                conn,
                inbound,
                provider.as_ref(),
                driver_id.as_deref(),
                poll_interval,
            )
            .await
        }
        StreamMode::Broadcast => broadcast_loop(relay, conn, inbound).await,
    }
}

enum Step {
    Text(String),
    Undecodable,
    Continue,
    Exit(Disconnect),
}

fn step<E: fmt::Display>(relay: &Relay, item: Option<Result<Inbound, E>>) -> Step {
    let step = match item {
        None => Step::Exit(Disconnect::StreamEnded),
        Some(Err(e)) => Step::Exit(Disconnect::Transport(e.to_string())),
        Some(Ok(Inbound::Close)) => Step::Exit(Disconnect::ClientClosed),
        Some(Ok(Inbound::Ping(_))) => Step::Continue,
        Some(Ok(Inbound::Text(text))) => Step::Text(text),
        Some(Ok(Inbound::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => Step::Text(text),
            Err(_) => Step::Undecodable,
        },
    };
    if matches!(step, Step::Text(_) | Step::Undecodable) {
        relay.stats().frames_received.fetch_add(1, Ordering::Relaxed);
    }
    step
}

async fn reject(relay: &Relay, conn: &ConnectionHandle) {
    relay.stats().frames_rejected.fetch_add(1, Ordering::Relaxed);
    relay.send_to(&Message::error(INVALID_FORMAT), conn).await;
}

async fn telemetry_loop<S, E>(
    relay: &Relay,
    conn: &ConnectionHandle,
    mut inbound: S,
    provider: &dyn TelemetryProvider,
    driver_id: Option<&str>,
    poll_interval: Duration,
) -> Disconnect
where
    S: Stream<Item = Result<Inbound, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let session_id = conn.session_id();
    let mut last_pushed: Option<Value> = None;

    if let Some(snapshot) = provider.fetch_cached(session_id, driver_id).await {
        relay
            .send_to(&Message::cached_data(snapshot.clone()), conn)
            .await;
        last_pushed = Some(snapshot);
    }

    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let mut poll = interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // At most one fetch in flight; inbound frames keep being read while it runs
    let mut in_flight: Option<BoxFuture<'_, Option<Value>>> = None;

    loop {
        tokio::select! {
            biased;
            _ = conn.closed() => return Disconnect::Cancelled,
            item = inbound.next() => match step(relay, item) {
                Step::Exit(reason) => return reason,
                Step::Continue => {}
                Step::Undecodable => reject(relay, conn).await,
                Step::Text(text) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::Ping) => {
                        relay.send_to(&Message::pong(), conn).await;
                    }
                    Ok(other) => debug!(conn_id = %conn.id(), ?other, "ignoring message on telemetry stream"),
                    Err(e) => {
                        debug!(conn_id = %conn.id(), error = %e, "malformed frame");
                        reject(relay, conn).await;
                    }
                },
            },
            live = async {
                match in_flight.as_mut() {
                    Some(fetch) => fetch.await,
                    None => std::future::pending().await,
                }
            }, if in_flight.is_some() => {
                in_flight = None;
                match live {
                    Some(data) if last_pushed.as_ref() != Some(&data) => {
                        relay
                            .send_to(&Message::telemetry_update(data.clone()), conn)
                            .await;
                        last_pushed = Some(data);
                    }
                    _ => {}
                }
            }
            _ = poll.tick(), if in_flight.is_none() => {
                in_flight = Some(provider.fetch_live(session_id, driver_id));
            }
        }
    }
}

async fn broadcast_loop<S, E>(relay: &Relay, conn: &ConnectionHandle, mut inbound: S) -> Disconnect
where
    S: Stream<Item = Result<Inbound, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let session_id = conn.session_id();
    let welcome = Message::info(format!(
        "Connected to broadcast channel for session {session_id}"
    ));
    relay.send_to(&welcome, conn).await;

    loop {
        let item = tokio::select! {
            biased;
            _ = conn.closed() => return Disconnect::Cancelled,
            item = inbound.next() => item,
        };
        let text = match step(relay, item) {
            Step::Exit(reason) => return reason,
            Step::Continue => continue,
            Step::Undecodable => {
                reject(relay, conn).await;
                continue;
            }
            Step::Text(text) => text,
        };

        match ClientMessage::parse(&text) {
            Ok(ClientMessage::Ping) => {
                relay.send_to(&Message::pong(), conn).await;
            }
            Ok(ClientMessage::Publish { kind, data }) => {
                let report = relay
                    .broadcast_from(&Message::relayed(kind, data), session_id, conn.id())
                    .await;
                if report.failed > 0 {
                    warn!(session = %session_id, failed = report.failed, "relay dropped failed recipients");
                }
            }
            Ok(ClientMessage::Incomplete) => reject(relay, conn).await,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "malformed frame");
                reject(relay, conn).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundReceiver;
    use crate::registry::{ALL_SESSIONS, SessionRegistry};
    use async_trait::async_trait;
    use futures::channel::mpsc::{UnboundedSender, unbounded};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    type Client = UnboundedSender<Result<Inbound, String>>;

    struct Harness {
        relay: Arc<Relay>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                relay: Arc::new(Relay::new(Arc::new(SessionRegistry::new()))),
            }
        }

        fn spawn(
            &self,
            session: &str,
            mode: StreamMode,
        ) -> (ConnectionHandle, Client, OutboundReceiver, JoinHandle<Disconnect>) {
            let (conn, rx) = ConnectionHandle::new(session, 32);
            let (client, inbound) = unbounded();
            let task = tokio::spawn(serve(self.relay.clone(), conn.clone(), inbound, mode));
            (conn, client, rx, task)
        }
    }

    async fn next_json(rx: &mut OutboundReceiver) -> Value {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        serde_json::from_str(&frame).unwrap()
    }

    fn text(client: &Client, body: &str) {
        client
            .unbounded_send(Ok(Inbound::Text(body.to_string())))
            .unwrap();
    }

    struct ScriptedProvider {
        cached: Option<Value>,
        live: Mutex<VecDeque<Value>>,
    }

    impl ScriptedProvider {
        fn new(cached: Option<Value>, live: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                cached,
                live: Mutex::new(live.into()),
            })
        }
    }

    #[async_trait]
    impl TelemetryProvider for ScriptedProvider {
        async fn fetch_live(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            let mut live = self.live.lock().unwrap();
            if live.len() > 1 {
                live.pop_front()
            } else {
                live.front().cloned()
            }
        }

        async fn fetch_cached(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            self.cached.clone()
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl TelemetryProvider for PanickingProvider {
        async fn fetch_live(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            panic!("telemetry source exploded");
        }

        async fn fetch_cached(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            None
        }
    }

    /// A source whose live fetch never completes.
    struct StalledProvider;

    #[async_trait]
    impl TelemetryProvider for StalledProvider {
        async fn fetch_live(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            std::future::pending().await
        }

        async fn fetch_cached(&self, _session_id: &str, _driver_id: Option<&str>) -> Option<Value> {
            None
        }
    }

    fn telemetry(provider: Arc<dyn TelemetryProvider>, poll_interval: Duration) -> StreamMode {
        StreamMode::Telemetry {
            provider,
            driver_id: None,
            poll_interval,
        }
    }

    #[tokio::test]
    async fn broadcast_stream_welcomes_and_answers_ping() {
        let h = Harness::new();
        let (conn, client, mut rx, task) = h.spawn("race", StreamMode::Broadcast);

        let welcome = next_json(&mut rx).await;
        assert_eq!(welcome["type"], "info");
        assert_eq!(
            welcome["message"],
            "Connected to broadcast channel for session race"
        );
        assert!(h.relay.registry().contains("race", conn.id()).await);

        text(&client, r#"{"type":"ping"}"#);
        let pong = next_json(&mut rx).await;
        assert_eq!(pong["type"], "pong");
        chrono::DateTime::parse_from_rfc3339(pong["timestamp"].as_str().unwrap()).unwrap();

        client.unbounded_send(Ok(Inbound::Close)).unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::ClientClosed);
        assert!(!h.relay.registry().contains(ALL_SESSIONS, conn.id()).await);
        assert_eq!(conn.state(), crate::ConnectionState::Closed);
    }

    #[tokio::test]
    async fn malformed_message_is_answered_and_connection_stays_open() {
        let h = Harness::new();
        let (sender, sender_client, mut sender_rx, _t1) = h.spawn("race", StreamMode::Broadcast);
        let (_peer, _peer_client, mut peer_rx, _t2) = h.spawn("race", StreamMode::Broadcast);
        next_json(&mut sender_rx).await;
        next_json(&mut peer_rx).await;

        text(&sender_client, r#"{"type":"foo"}"#);
        let err = next_json(&mut sender_rx).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "Invalid message format");
        assert!(sender.is_open());

        text(&sender_client, r#"{"type":"flag","data":{"sector":2}}"#);
        let relayed = next_json(&mut peer_rx).await;
        assert_eq!(relayed["type"], "flag");
        assert_eq!(relayed["data"], json!({"sector": 2}));
        assert!(relayed["timestamp"].is_string());

        // Neither the error nor the sender's own publish reached the peer twice
        assert!(peer_rx.try_recv().is_err());
        assert!(sender_rx.try_recv().is_err());
        assert_eq!(h.relay.stats().snapshot().frames_rejected, 1);
    }

    #[tokio::test]
    async fn non_json_text_gets_an_error_reply() {
        let h = Harness::new();
        let (conn, client, mut rx, _task) = h.spawn("race", StreamMode::Broadcast);
        next_json(&mut rx).await;

        text(&client, "hello there");
        assert_eq!(next_json(&mut rx).await["type"], "error");

        client
            .unbounded_send(Ok(Inbound::Binary(vec![0xff, 0xfe])))
            .unwrap();
        assert_eq!(next_json(&mut rx).await["type"], "error");
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn publish_stays_inside_the_session() {
        let h = Harness::new();
        let (_a, a_client, mut a_rx, _t1) = h.spawn("A", StreamMode::Broadcast);
        let (_a2, _a2_client, mut a2_rx, _t2) = h.spawn("A", StreamMode::Broadcast);
        let (_b, _b_client, mut b_rx, _t3) = h.spawn("B", StreamMode::Broadcast);
        next_json(&mut a_rx).await;
        next_json(&mut a2_rx).await;
        next_json(&mut b_rx).await;

        text(&a_client, r#"{"type":"note","data":"box this lap"}"#);
        assert_eq!(next_json(&mut a2_rx).await["data"], "box this lap");

        tokio::task::yield_now().await;
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_end_and_transport_error_clean_up() {
        let h = Harness::new();

        let (conn, client, _rx, task) = h.spawn("race", StreamMode::Broadcast);
        drop(client);
        assert_eq!(task.await.unwrap(), Disconnect::StreamEnded);
        assert!(!h.relay.registry().contains("race", conn.id()).await);

        let (conn, client, _rx, task) = h.spawn("race", StreamMode::Broadcast);
        client.unbounded_send(Err("connection reset".into())).unwrap();
        assert_eq!(
            task.await.unwrap(),
            Disconnect::Transport("connection reset".into())
        );
        assert!(!h.relay.registry().contains(ALL_SESSIONS, conn.id()).await);
        assert_eq!(h.relay.registry().session_count().await, 1);
    }

    #[tokio::test]
    async fn external_close_cancels_the_loop() {
        let h = Harness::new();
        let (conn, _client, mut rx, task) = h.spawn("race", StreamMode::Broadcast);
        next_json(&mut rx).await;

        conn.close();
        assert_eq!(task.await.unwrap(), Disconnect::Cancelled);
        assert!(!h.relay.registry().contains("race", conn.id()).await);
    }

    #[tokio::test]
    async fn writer_failure_ends_the_loop() {
        let h = Harness::new();
        let (conn, _client, rx, task) = h.spawn("race", StreamMode::Broadcast);
        drop(rx);

        // The welcome fails to deliver, which closes the connection
        assert_eq!(task.await.unwrap(), Disconnect::Cancelled);
        assert_eq!(h.relay.registry().member_count(ALL_SESSIONS).await, 0);
        assert_eq!(conn.state(), crate::ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_sends_snapshot_then_pong_before_first_poll() {
        let h = Harness::new();
        let provider = ScriptedProvider::new(Some(json!({"lap": 1})), vec![json!({"lap": 2})]);
        let (_conn, client, mut rx, _task) =
            h.spawn("race", telemetry(provider, Duration::from_millis(100)));
        text(&client, r#"{"type":"ping"}"#);

        let first = next_json(&mut rx).await;
        assert_eq!(first["type"], "cached_data");
        assert_eq!(first["data"], json!({"lap": 1}));

        let second = next_json(&mut rx).await;
        assert_eq!(second["type"], "pong");

        let third = next_json(&mut rx).await;
        assert_eq!(third["type"], "telemetry_update");
        assert_eq!(third["data"], json!({"lap": 2}));

        // Exactly one pong for the one ping, and the repeated payload is not re-sent
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_during_pending_fetch_cleans_up() {
        let h = Harness::new();
        let (conn, client, _rx, task) = h.spawn(
            "race",
            telemetry(Arc::new(StalledProvider), Duration::from_millis(10)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.unbounded_send(Ok(Inbound::Close)).unwrap();
        drop(client);

        let reason = timeout(Duration::from_secs(2), task)
            .await
            .expect("stream kept running after the client closed")
            .unwrap();
        assert_eq!(reason, Disconnect::ClientClosed);
        assert!(!h.relay.registry().contains(ALL_SESSIONS, conn.id()).await);
        assert!(!h.relay.registry().contains("race", conn.id()).await);
        assert_eq!(conn.state(), crate::ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_during_pending_fetch_cleans_up() {
        let h = Harness::new();
        let (conn, client, _rx, task) = h.spawn(
            "race",
            telemetry(Arc::new(StalledProvider), Duration::from_millis(10)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        let reason = timeout(Duration::from_secs(2), task)
            .await
            .expect("stream kept running after the inbound side ended")
            .unwrap();
        assert_eq!(reason, Disconnect::StreamEnded);
        assert_eq!(h.relay.registry().member_count(ALL_SESSIONS).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_answered_while_fetch_is_pending() {
        let h = Harness::new();
        let (_conn, client, mut rx, _task) = h.spawn(
            "race",
            telemetry(Arc::new(StalledProvider), Duration::from_millis(10)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        text(&client, r#"{"type":"ping"}"#);
        assert_eq!(next_json(&mut rx).await["type"], "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_skips_unchanged_payloads() {
        let h = Harness::new();
        let provider = ScriptedProvider::new(
            None,
            vec![json!(1), json!(1), json!(2), json!(2), json!(3)],
        );
        let (_conn, _client, mut rx, _task) =
            h.spawn("race", telemetry(provider, Duration::from_millis(100)));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = next_json(&mut rx).await;
            assert_eq!(frame["type"], "telemetry_update");
            seen.push(frame["data"].clone());
        }
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);

        // The provider now repeats its last value forever; nothing more is pushed
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_ignores_other_message_types() {
        let h = Harness::new();
        let provider = ScriptedProvider::new(None, vec![]);
        let (_conn, client, mut rx, _task) =
            h.spawn("race", telemetry(provider, Duration::from_millis(100)));

        text(&client, r#"{"type":"subscribe","data":{}}"#);
        text(&client, r#"{"type":"ping"}"#);
        assert_eq!(next_json(&mut rx).await["type"], "pong");
    }

    #[tokio::test]
    async fn panic_in_provider_is_contained_and_cleaned_up() {
        let h = Harness::new();
        let (conn, _client, _rx, task) = h.spawn(
            "race",
            telemetry(Arc::new(PanickingProvider), Duration::from_millis(10)),
        );

        assert_eq!(task.await.unwrap(), Disconnect::Panicked);
        assert!(!h.relay.registry().contains(ALL_SESSIONS, conn.id()).await);
        assert_eq!(conn.state(), crate::ConnectionState::Closed);
    }
}
