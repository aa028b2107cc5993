//! Wire protocol shared by the orchestration server and the devices it drives.
//!
//! Every frame on the socket is a UTF-8 JSON object shaped as
//! `{ type, content, sender, timestamp? }`. The one exception is the initial
//! join frame, which carries a top-level `role` instead of a meaningful type.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Sender name stamped on every message the server originates
pub const SYSTEM_SENDER: &str = "System";
/// Smallest accepted pattern interval
pub const MIN_INTERVAL_MS: u64 = 500;
/// Status reported for every live device in a device list
pub const STATUS_CONNECTED: &str = "connected";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("unknown role `{0}`")]
    UnknownRole(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// The two roles a device can register as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "master")]
    Controller,
    #[serde(rename = "client")]
    Display,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "master",
            Role::Display => "client",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "master" => Ok(Role::Controller),
            "client" => Ok(Role::Display),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation algorithm selected by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Random,
    Sequential,
    Simultaneous,
    Hit,
}

/// Game state as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStateKind {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    #[serde(alias = "intervalSpeed")]
    pub interval_ms: u64,
    pub pattern: Pattern,
    pub colors: Vec<String>,
}

impl GameSettings {
    /// Rejects intervals below the minimum and empty color lists
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.interval_ms < MIN_INTERVAL_MS {
            return Err(ProtocolError::InvalidSettings(format!(
                "interval {}ms is below the {}ms minimum",
                self.interval_ms, MIN_INTERVAL_MS
            )));
        }
        if self.colors.is_empty() {
            return Err(ProtocolError::InvalidSettings(
                "at least one color is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A display's self-reported hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitReport {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_speed: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Payload of `command` and `hit` frames, discriminated by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    /// `color: None` means off, `target_id: None` means every device
    #[serde(rename_all = "camelCase")]
    Color {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default)]
        color: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GameState {
        game_state: GameStateKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<GameSettings>,
    },
    #[serde(rename_all = "camelCase")]
    Rename {
        #[serde(default)]
        device_id: Option<String>,
        name: String,
    },
    Hit(HitReport),
}

impl Command {
    pub fn color(target_id: Option<String>, color: Option<String>) -> Self {
        Command::Color { target_id, color }
    }

    pub fn off() -> Self {
        Command::Color {
            target_id: None,
            color: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub id: String,
}

/// One row of the controller's device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub role: Role,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: String,
}

/// Typed `{ type, content }` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum Payload {
    DeviceUpdate(DeviceAssignment),
    DeviceList(Vec<DeviceEntry>),
    System(String),
    Error(String),
    Command(Command),
    Hit(Command),
}

/// A complete frame as sent by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Envelope {
    pub fn system(payload: Payload) -> Self {
        Self {
            payload,
            sender: SYSTEM_SENDER.to_string(),
            timestamp: None,
        }
    }

    pub fn from_device(payload: Payload, sender: &str) -> Self {
        Self {
            payload,
            sender: sender.to_string(),
            timestamp: Some(now_millis()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a server frame; used by device-side tooling
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.kind.ok_or(ProtocolError::MissingField("type"))?;
        let payload = serde_json::from_value(json!({ "type": kind, "content": raw.content }))?;
        Ok(Self {
            payload,
            sender: raw.sender.unwrap_or_else(|| SYSTEM_SENDER.to_string()),
            timestamp: raw.timestamp,
        })
    }
}

/// Everything a device may send to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join {
        role: Role,
        username: Option<String>,
    },
    Command(Command),
    Hit(HitReport),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    role: Option<String>,
}

/// Classifies an inbound text frame
///
/// A top-level `role` always marks a join, whatever the `type` says. Hits
/// are accepted both as `type: "hit"` and as a `command` with `action: "hit"`.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;

    if let Some(role) = raw.role {
        return Ok(ClientMessage::Join {
            role: Role::parse(&role)?,
            username: raw.sender.filter(|s| !s.trim().is_empty()),
        });
    }

    let kind = raw.kind.ok_or(ProtocolError::MissingField("type"))?;
    if raw.content.is_null() {
        return Err(ProtocolError::MissingField("content"));
    }

    match kind.as_str() {
        "command" | "hit" => match serde_json::from_value::<Command>(raw.content)? {
            Command::Hit(report) => Ok(ClientMessage::Hit(report)),
            _ if kind == "hit" => Err(ProtocolError::MissingField("action")),
            command => Ok(ClientMessage::Command(command)),
        },
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
