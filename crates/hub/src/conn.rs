//! Bus connection lifecycle: connect, subscribe, consume, reconnect
//! with capped exponential backoff, stop.
//!
//! Exactly one `ConnectionManager` owns the event loop; everything
//! else publishes through a cloned [`BusHandle`]. Messages are handled
//! sequentially in arrival order — a handler finishes (including its
//! repository writes) before the next message is read.

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::db::Db;
use crate::router::{self, Route};
use crate::state::SharedState;
use crate::{provision, reconcile, timesvc};

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: the reconnect budget is exhausted. Bus ingestion has
    /// ended; the web layer keeps running.
    Failed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

/// Capped exponential backoff: first delay `initial`, multiplied by
/// `rate` after each consecutive failure, capped at `max`, exhausted
/// after `give_up_after` failures.
pub(crate) struct Backoff {
    initial_sec: u64,
    rate: u64,
    max_sec: u64,
    give_up_after: u32,
    failures: u32,
}

impl Backoff {
    pub(crate) fn new(initial_sec: u64, rate: u64, max_sec: u64, give_up_after: u32) -> Self {
        Self {
            initial_sec,
            rate,
            max_sec,
            give_up_after,
            failures: 0,
        }
    }

    /// Register a failure. `Some(delay)` to sleep before the next
    /// attempt, `None` when the budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.give_up_after {
            return None;
        }
        let factor = self
            .rate
            .checked_pow(self.failures - 1)
            .unwrap_or(u64::MAX);
        let secs = self
            .initial_sec
            .saturating_mul(factor)
            .min(self.max_sec);
        Some(Duration::from_secs(secs))
    }

    /// Consecutive failures so far.
    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Publish façade
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub(crate) enum PublishError {
    /// Explicit rejection instead of silent queueing while the
    /// connection is down.
    #[error("bus connection is not established")]
    NotConnected,
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Cheap-clone publish handle, safe to use from outside the consume
/// loop (e.g. the relay-toggle HTTP path).
#[derive(Clone)]
pub(crate) struct BusHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl BusHandle {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .publish(topic.to_string(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    /// A handle whose client never connects; every publish is rejected.
    #[cfg(test)]
    pub(crate) fn disconnected_for_tests() -> Self {
        let options = MqttOptions::new("test", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 4);
        Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

// ---------------------------------------------------------------------------
// Message dispatch context
// ---------------------------------------------------------------------------

/// Handler-side half of the manager. The consume loop keeps the
/// (non-`Sync`) event loop to itself and awaits only through this
/// context, so the whole `run` future stays `Send`-spawnable.
struct Dispatcher {
    settings: Arc<Settings>,
    db: Db,
    shared: SharedState,
    bus: BusHandle,
}

impl Dispatcher {
    async fn set_state(&self, state: ConnState) {
        let mut st = self.shared.write().await;
        st.set_bus_state(state);
    }

    async fn record_error(&self, detail: String) {
        let mut st = self.shared.write().await;
        st.record_error(detail);
    }

    /// Route one inbound message. Handler errors are logged and
    /// recorded here; nothing raises past the dispatcher.
    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        match router::route(topic, payload) {
            Route::TimeQuery => {
                let reply_topic = timesvc::reply_topic(topic);
                let payload =
                    timesvc::build_time_payload(self.settings.time_zone(), Utc::now());
                match serde_json::to_vec(&payload) {
                    Ok(body) => {
                        if let Err(e) = self.bus.publish(&reply_topic, body).await {
                            error!(topic = %reply_topic, error = %e, "time reply failed");
                            self.record_error(format!("time reply failed: {e}")).await;
                        } else {
                            info!(topic = %reply_topic, "time reply sent");
                        }
                    }
                    Err(e) => error!(error = %e, "time payload serialization failed"),
                }
            }
            Route::Startup => {
                if let Err(e) =
                    provision::handle_startup(&self.db, &self.bus, &self.settings, topic, payload)
                        .await
                {
                    error!(topic = %topic, error = %e, "startup handling failed");
                    self.record_error(format!("startup handling failed for {topic}: {e}"))
                        .await;
                } else {
                    let mut st = self.shared.write().await;
                    st.record_provision(format!("provisioning requested for {topic}"));
                }
            }
            Route::Telemetry(map) => {
                if let Err(e) = reconcile::handle(
                    &self.db,
                    self.settings.time_zone(),
                    topic,
                    map,
                )
                .await
                {
                    error!(topic = %topic, error = %e, "telemetry handling failed");
                    self.record_error(format!("telemetry handling failed for {topic}: {e}"))
                        .await;
                }
            }
            Route::Discard(reason) => {
                warn!(topic = %topic, %reason, "discarding message");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionManager {
    settings: Arc<Settings>,
    db: Db,
    shared: SharedState,
    client: AsyncClient,
    eventloop: EventLoop,
    bus: BusHandle,
}

impl ConnectionManager {
    pub(crate) fn new(settings: Arc<Settings>, db: Db, shared: SharedState) -> (Self, BusHandle) {
        let mut options = MqttOptions::new(
            settings.mqtt.client_id.clone(),
            settings.mqtt.host.clone(),
            settings.mqtt.port,
        );
        options.set_keep_alive(Duration::from_secs(settings.mqtt.keep_alive_sec));
        if let (Some(user), Some(pass)) = (&settings.mqtt.username, &settings.mqtt.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 20);
        let bus = BusHandle {
            client: client.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        };

        let manager = Self {
            settings,
            db,
            shared,
            client,
            eventloop,
            bus: bus.clone(),
        };
        (manager, bus)
    }

    /// Blocking consume loop; returns when the shutdown signal fires
    /// or the reconnect budget is exhausted. No handler runs after it
    /// returns.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            settings,
            db,
            shared,
            client,
            mut eventloop,
            bus,
        } = self;
        let ctx = Dispatcher {
            settings: Arc::clone(&settings),
            db,
            shared,
            bus: bus.clone(),
        };

        let mqtt = &settings.mqtt;
        let mut backoff = Backoff::new(
            mqtt.reconnect_initial_sec,
            2,
            mqtt.reconnect_max_sec,
            mqtt.reconnect_attempts,
        );

        ctx.set_state(ConnState::Connecting).await;

        'consume: loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown requested, leaving consume loop");
                        break 'consume;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        bus.connected.store(true, Ordering::SeqCst);
                        backoff.reset();
                        ctx.set_state(ConnState::Connected).await;
                        info!(topic = %mqtt.topic, "bus connected, subscribing");
                        if let Err(e) = client.subscribe(mqtt.topic.clone(), QoS::AtLeastOnce).await
                        {
                            error!(error = %e, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        ctx.dispatch(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        bus.connected.store(false, Ordering::SeqCst);
                        ctx.set_state(ConnState::Reconnecting).await;
                        ctx.record_error(format!("bus error: {e}")).await;
                        match backoff.next_delay() {
                            None => {
                                error!(
                                    attempts = backoff.failures(),
                                    error = %e,
                                    "reconnect budget exhausted, bus ingestion stops"
                                );
                                ctx.set_state(ConnState::Failed).await;
                                return;
                            }
                            Some(delay) => {
                                warn!(
                                    error = %e,
                                    attempt = backoff.failures(),
                                    delay_sec = delay.as_secs(),
                                    "bus connection lost, backing off"
                                );
                                // Shutdown aborts a pending backoff sleep.
                                tokio::select! {
                                    _ = sleep(delay) => {
                                        ctx.set_state(ConnState::Connecting).await;
                                    }
                                    _ = shutdown.changed() => {
                                        if *shutdown.borrow() {
                                            info!("shutdown during backoff");
                                            break 'consume;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        bus.connected.store(false, Ordering::SeqCst);
        let _ = client.disconnect().await;
        ctx.set_state(ConnState::Disconnected).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EventKind, HubState};

    // -- Backoff ------------------------------------------------------------

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(1, 2, 60, 12);
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60, 60]);
    }

    #[test]
    fn backoff_gives_up_after_configured_failures() {
        let mut b = Backoff::new(1, 2, 60, 12);
        for _ in 0..11 {
            assert!(b.next_delay().is_some());
        }
        assert!(b.next_delay().is_none(), "12th consecutive failure is terminal");
        assert_eq!(b.failures(), 12);
    }

    #[test]
    fn backoff_reset_restarts_sequence() {
        let mut b = Backoff::new(1, 2, 60, 12);
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay().unwrap().as_secs(), 1);
    }

    #[test]
    fn backoff_single_attempt_budget() {
        let mut b = Backoff::new(1, 2, 60, 1);
        assert!(b.next_delay().is_none());
    }

    // -- BusHandle ----------------------------------------------------------

    #[tokio::test]
    async fn publish_while_disconnected_is_an_explicit_error() {
        let bus = BusHandle::disconnected_for_tests();
        assert!(!bus.is_connected());
        let err = bus
            .publish("flat/room/ctrl/set/Lamp", b"on".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    // -- Consume loop -------------------------------------------------------

    /// Spawns the consume loop on the multithreaded runtime (the loop
    /// future must be `Send`), drives it against a port nothing
    /// listens on, and checks the failure lands in the event ring
    /// before a clean shutdown.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consume_loop_is_spawnable_and_records_bus_errors() {
        let settings: Arc<Settings> = Arc::new(
            toml::from_str(
                r#"
[mqtt]
host = "127.0.0.1"
port = 1
topic = "flat/#"
"#,
            )
            .unwrap(),
        );
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = HubState::shared();

        let (manager, bus) = ConnectionManager::new(settings, db, Arc::clone(&shared));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(stop_rx));

        // connection refused is immediate on loopback
        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            let st = shared.read().await;
            assert_eq!(st.bus, ConnState::Reconnecting);
            assert!(
                st.events.iter().any(|e| matches!(e.kind, EventKind::Error)),
                "connect failure should be recorded as an error event"
            );
        }
        assert!(!bus.is_connected());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(shared.read().await.bus, ConnState::Disconnected);
    }
}
