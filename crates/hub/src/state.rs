use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::conn::ConnState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub(crate) type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub(crate) struct HubState {
    pub started_at: Instant,
    pub bus: ConnState,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub(crate) struct HubEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EventKind {
    Bus,
    Provision,
    Error,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub uptime_secs: u64,
    pub bus: ConnState,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub(crate) fn shared() -> SharedState {
        Arc::new(RwLock::new(Self {
            started_at: Instant::now(),
            bus: ConnState::Disconnected,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }))
    }

    /// Record a bus connection state transition.
    pub(crate) fn set_bus_state(&mut self, state: ConnState) {
        if self.bus != state {
            self.bus = state;
            self.push_event(EventKind::Bus, format!("bus {state}"));
        }
    }

    pub(crate) fn record_provision(&mut self, detail: String) {
        self.push_event(EventKind::Provision, detail);
    }

    pub(crate) fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub(crate) fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            bus: self.bus,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
