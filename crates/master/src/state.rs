use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::catalog::{ZoneCatalog, ZoneDescriptor};
use crate::device::{DeviceId, MasterActiveState};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub masters: BTreeMap<DeviceId, MasterSnapshot>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct MasterSnapshot {
    pub zones: Vec<ZoneDescriptor>,
    pub state: MasterActiveState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Catalog,
    State,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub masters: BTreeMap<DeviceId, MasterSnapshot>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            masters: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a freshly built catalog. The master starts out idle.
    pub fn record_catalog(&mut self, catalog: &ZoneCatalog) {
        let master = catalog.master_id();
        self.masters.insert(
            master,
            MasterSnapshot {
                zones: catalog.entries().to_vec(),
                state: MasterActiveState::IDLE,
                last_changed: None,
            },
        );
        self.push_event(
            EventKind::Catalog,
            format!("master {master}: {} zone(s) mapped", catalog.len()),
        );
    }

    pub fn remove_master(&mut self, master: DeviceId) {
        if self.masters.remove(&master).is_some() {
            self.push_event(EventKind::Catalog, format!("master {master}: stopped"));
        }
    }

    /// Record a published change of a master's active state.
    pub fn record_state(&mut self, master: DeviceId, state: MasterActiveState) {
        if let Some(m) = self.masters.get_mut(&master) {
            m.state = state;
            m.last_changed = Some(OffsetDateTime::now_utc());
        }

        let detail = if state.is_idle() {
            format!("master {master}: all zones off")
        } else {
            format!(
                "master {master}: zone {} on (controller {} zone {})",
                state.active_zone, state.active_slave_id, state.active_slave_zone
            )
        };
        self.push_event(EventKind::State, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            masters: self.masters.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
