//! Fan-out of worker events to UI subscribers.
//!
//! Events are re-broadcast unchanged except accessory changes, which gain the
//! room/name/visibility the hub keeps in its layout store. Workers know
//! nothing about rooms.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::monitor::HealthReport;
use crate::rpc::{AccessoryChange, EventSink, WorkerEvent};

const CHANNEL_CAPACITY: usize = 1024;

/// Event name used when relaying bus traffic over the control-plane socket.
pub const RELAY_BRIDGE_EVENT: &str = "bridge:event";
pub const RELAY_MONITOR: &str = "monitor";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LayoutEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Hub-local accessory layout, keyed by accessory identifier.
pub struct LayoutStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, LayoutEntry>>,
}

impl LayoutStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_layout(&path);
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn empty() -> Self {
        Self {
            path: PathBuf::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn reload(&self) {
        let entries = read_layout(&self.path);
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = entries;
    }

    pub fn get(&self, accessory: &str) -> Option<LayoutEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(accessory)
            .cloned()
    }
}

fn read_layout(path: &Path) -> HashMap<String, LayoutEntry> {
    if path.as_os_str().is_empty() || !path.exists() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path).map(|c| serde_json::from_str(&c)) {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            warn!(path = %path.display(), "Layout file corrupt, ignoring: {}", e);
            HashMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), "Layout file unreadable, ignoring: {}", e);
            HashMap::new()
        }
    }
}

/// What UI subscribers receive.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Worker {
        bridge: String,
        event: String,
        data: Value,
    },
    Health(HealthReport),
}

impl HubEvent {
    /// Shape used on the control-plane socket.
    pub fn to_wire(&self) -> WorkerEvent {
        let event = match self {
            HubEvent::Worker { .. } => RELAY_BRIDGE_EVENT,
            HubEvent::Health(_) => RELAY_MONITOR,
        };
        WorkerEvent::Other {
            event: event.to_string(),
            data: serde_json::to_value(self).unwrap_or(Value::Null),
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
    layout: LayoutStore,
}

impl EventBus {
    pub fn new(layout: LayoutStore) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, layout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    pub fn layout(&self) -> &LayoutStore {
        &self.layout
    }

    /// Re-broadcast one worker event; returns how many subscribers got it.
    pub fn publish_worker(&self, bridge: &str, event: WorkerEvent) -> usize {
        let event = match event {
            WorkerEvent::AccessoryChange(change) => WorkerEvent::AccessoryChange(self.enrich(change)),
            other => other,
        };
        trace!(bridge, event = event.name(), "Publishing worker event");
        self.send(HubEvent::Worker {
            bridge: bridge.to_string(),
            event: event.name().to_string(),
            data: event.data(),
        })
    }

    pub fn publish_health(&self, report: HealthReport) -> usize {
        self.send(HubEvent::Health(report))
    }

    /// Sink for one worker's transport, tagging everything with its id.
    pub fn sink_for(self: &Arc<Self>, bridge: &str) -> EventSink {
        let bus = Arc::clone(self);
        let bridge = bridge.to_string();
        Arc::new(move |event| {
            bus.publish_worker(&bridge, event);
        })
    }

    fn send(&self, event: HubEvent) -> usize {
        // no subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    fn enrich(&self, mut change: AccessoryChange) -> AccessoryChange {
        if let Some(entry) = self.layout.get(&change.accessory_identifier) {
            if let Some(room) = entry.room {
                change.state.insert("room".into(), json!(room));
            }
            if let Some(name) = entry.name {
                change.state.insert("name".into(), json!(name));
            }
            change.state.insert("hidden".into(), json!(entry.hidden));
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{LogLevel, LogLine};

    fn change(id: &str) -> WorkerEvent {
        let mut state = serde_json::Map::new();
        state.insert("on".into(), json!(true));
        WorkerEvent::AccessoryChange(AccessoryChange {
            accessory_identifier: id.into(),
            state,
        })
    }

    #[tokio::test]
    async fn accessory_changes_gain_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        std::fs::write(
            &path,
            r#"{"lamp-1": {"room": "Kitchen", "name": "Counter Lamp"}}"#,
        )
        .unwrap();
        let bus = EventBus::new(LayoutStore::load(&path));
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish_worker("kitchen", change("lamp-1")), 1);
        match rx.recv().await.unwrap() {
            HubEvent::Worker { bridge, event, data } => {
                assert_eq!(bridge, "kitchen");
                assert_eq!(event, "accessory:change");
                assert_eq!(data["room"], "Kitchen");
                assert_eq!(data["name"], "Counter Lamp");
                assert_eq!(data["on"], true);
            }
            other => panic!("unexpected {other:?}"),
        }

        bus.publish_worker("kitchen", change("unknown"));
        match rx.recv().await.unwrap() {
            HubEvent::Worker { data, .. } => assert!(data.get("room").is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_events_pass_unchanged() {
        let bus = Arc::new(EventBus::new(LayoutStore::empty()));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let sink = bus.sink_for("garage");
        sink(WorkerEvent::Log(LogLine {
            level: LogLevel::Info,
            message: "door opened".into(),
            timestamp: None,
        }));

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                HubEvent::Worker { bridge, event, data } => {
                    assert_eq!(bridge, "garage");
                    assert_eq!(event, "log");
                    assert_eq!(data["message"], "door opened");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(LayoutStore::empty());
        assert_eq!(bus.publish_worker("kitchen", change("lamp-1")), 0);
    }

    #[test]
    fn layout_file_loads_and_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        std::fs::write(&path, r#"{"lamp-1": {"room": "Kitchen"}}"#).unwrap();

        let store = LayoutStore::load(&path);
        assert_eq!(store.get("lamp-1").unwrap().room.as_deref(), Some("Kitchen"));

        std::fs::write(&path, "garbage").unwrap();
        store.reload();
        assert!(store.get("lamp-1").is_none());
    }

    #[test]
    fn relay_shape() {
        let wire = HubEvent::Worker {
            bridge: "kitchen".into(),
            event: "log".into(),
            data: json!({"message": "x"}),
        }
        .to_wire();
        assert_eq!(wire.name(), RELAY_BRIDGE_EVENT);
        assert_eq!(wire.data()["type"], "worker");
        assert_eq!(wire.data()["bridge"], "kitchen");
    }
}
