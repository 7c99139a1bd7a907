//! Wire types shared by both transport bindings.
//!
//! Every frame is one UTF-8 JSON object `{event, data?}` on its own line.
//! Frames are decoded once, at the transport boundary, into [`Message`];
//! anything that does not decode is dropped there.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const REQUEST: &str = "request";
pub const RESPONSE: &str = "response";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const LOG: &str = "log";
pub const NOTIFICATION: &str = "notification";
pub const ACCESSORY_CHANGE: &str = "accessory:change";
pub const PROGRESS: &str = "progress";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub path: String,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RpcRequest {
    /// String parameter by name.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub session: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_notification_level")]
    pub level: LogLevel,
}

fn default_notification_level() -> LogLevel {
    LogLevel::Info
}

/// State change of one accessory; `state` carries whatever the engine reported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AccessoryChange {
    pub accessory_identifier: String,
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Progress {
    pub action: String,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

/// Asynchronous notification pushed from a worker to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Log(LogLine),
    Notification(Notification),
    AccessoryChange(AccessoryChange),
    Progress(Progress),
    Other { event: String, data: Value },
}

impl WorkerEvent {
    pub fn name(&self) -> &str {
        match self {
            WorkerEvent::Log(_) => LOG,
            WorkerEvent::Notification(_) => NOTIFICATION,
            WorkerEvent::AccessoryChange(_) => ACCESSORY_CHANGE,
            WorkerEvent::Progress(_) => PROGRESS,
            WorkerEvent::Other { event, .. } => event,
        }
    }

    pub fn data(&self) -> Value {
        let data = match self {
            WorkerEvent::Log(line) => serde_json::to_value(line),
            WorkerEvent::Notification(n) => serde_json::to_value(n),
            WorkerEvent::AccessoryChange(c) => serde_json::to_value(c),
            WorkerEvent::Progress(p) => serde_json::to_value(p),
            WorkerEvent::Other { data, .. } => Ok(data.clone()),
        };
        data.unwrap_or(Value::Null)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.name(), Some(self.data()))
    }

    /// Typed event for known names; `None` when a known event carries a bad payload.
    fn from_envelope(envelope: Envelope) -> Option<Self> {
        let data = envelope.data.unwrap_or(Value::Null);
        let event = match envelope.event.as_str() {
            LOG => WorkerEvent::Log(serde_json::from_value(data).ok()?),
            NOTIFICATION => WorkerEvent::Notification(serde_json::from_value(data).ok()?),
            ACCESSORY_CHANGE => WorkerEvent::AccessoryChange(serde_json::from_value(data).ok()?),
            PROGRESS => WorkerEvent::Progress(serde_json::from_value(data).ok()?),
            _ => WorkerEvent::Other {
                event: envelope.event,
                data,
            },
        };
        Some(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RpcRequest),
    Response(RpcResponse),
    Ping,
    Pong,
    Event(WorkerEvent),
}

impl Message {
    /// Decode one frame. Unparsable frames yield `None` and are dropped by the caller.
    pub fn decode(frame: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(frame.trim()).ok()?;

        let message = match envelope.event.as_str() {
            REQUEST => Message::Request(serde_json::from_value(envelope.data?).ok()?),
            RESPONSE => Message::Response(serde_json::from_value(envelope.data?).ok()?),
            PING => Message::Ping,
            PONG => Message::Pong,
            "" => return None,
            _ => Message::Event(WorkerEvent::from_envelope(envelope)?),
        };
        Some(message)
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            Message::Request(req) => Envelope::new(REQUEST, serde_json::to_value(req).ok()),
            Message::Response(resp) => Envelope::new(RESPONSE, serde_json::to_value(resp).ok()),
            Message::Ping => Envelope::new(PING, None),
            Message::Pong => Envelope::new(PONG, None),
            Message::Event(event) => event.to_envelope(),
        }
    }

    /// One newline-terminated frame.
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(&self.to_envelope())?;
        line.push('\n');
        Ok(line)
    }
}
