//! # Mesh Event Decoding
//!
//! Converts the JSON object a Meshtastic MQTT gateway publishes into a typed
//! [`MeshEvent`]. The gateway's JSON is only loosely structured: most fields are
//! optional and their absence is meaningful (a missing `rssi`/`snr` means the
//! uplinking node is itself the sender; a missing `hops_away` means firmware
//! older than 2.3.0). Decoding is therefore best-effort field extraction with
//! explicit defaults rather than strict schema validation.
//!
//! Two fields identify nodes and are easy to confuse:
//!
//! - `from` is the numeric id of the node that *originated* the packet on the
//!   mesh. It is the only required field and keys the node registry.
//! - `sender` is the `!hex` id of the node that *uplinked* the packet to MQTT.
//!   It may differ from `from` when the packet was relayed, and it is what the
//!   responder's identity table is keyed by.
//!
//! A `sendtext` event is the gateway reflecting this service's own outbound
//! message back at it; callers drop those before they reach the registry or
//! the responder.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while decoding an inbound bus payload.
///
/// Per-message failures only: the caller logs and drops the message, the
/// subscription loop keeps running.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload bytes were not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed but the top level is not an object.
    #[error("payload is not a json object")]
    NotAnObject,

    /// The required `from` sender id is absent or not an integer.
    #[error("missing or non-integer `from` field")]
    MissingFrom,

    /// `from` was an integer but does not fit a 32-bit node address.
    #[error("sender id {0} out of range for a node address")]
    FromOutOfRange(u64),
}

/// Closed set of event kinds the tracker understands.
///
/// Unrecognized kinds are carried as [`EventKind::Other`] so a newer gateway
/// firmware still gets its traffic counted in the per-node statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    NodeInfo,
    Position,
    Telemetry,
    Text,
    /// Reflection of our own outbound text; never merged, never answered.
    SendText,
    Other(String),
}

impl EventKind {
    /// Map the wire `type` field (blank when absent) to a kind.
    pub fn from_label(label: &str) -> Self {
        match label {
            "nodeinfo" => EventKind::NodeInfo,
            "position" => EventKind::Position,
            "telemetry" => EventKind::Telemetry,
            "text" => EventKind::Text,
            "sendtext" => EventKind::SendText,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// The wire label for this kind.
    pub fn label(&self) -> &str {
        match self {
            EventKind::NodeInfo => "nodeinfo",
            EventKind::Position => "position",
            EventKind::Telemetry => "telemetry",
            EventKind::Text => "text",
            EventKind::SendText => "sendtext",
            EventKind::Other(label) => label,
        }
    }

    /// Key used in per-node message statistics. Blank kinds collapse to the
    /// `"_"` sentinel so they still get counted.
    pub fn stat_key(&self) -> &str {
        match self {
            EventKind::Other(label) if label.is_empty() => "_",
            kind => kind.label(),
        }
    }
}

/// One decoded event from the bus.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub kind: EventKind,
    /// Originating node's numeric address.
    pub from: u32,
    /// Uplink node's `!hex` id, when the gateway includes it.
    pub sender: Option<String>,
    /// Channel index the packet arrived on.
    pub channel: u32,
    /// 0 when absent: the publishing node is the sender.
    pub rssi: i64,
    /// 0 when absent, same rule as `rssi`.
    pub snr: f64,
    /// -1 when absent: unknown, or firmware older than 2.3.0.
    pub hops_away: i64,
    /// Kind-specific payload object, `Null` when the gateway sent none.
    pub payload: Value,
}

/// Nested payload of a `nodeinfo` event.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfoPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub hardware: String,
    pub shortname: String,
    pub longname: String,
}

/// Nested payload of a `position` event. Coordinates arrive as fixed-point
/// integers scaled by 1e7.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionPayload {
    pub latitude_i: i64,
    pub longitude_i: i64,
    /// Sometimes absent from the wire payload.
    #[serde(default)]
    pub altitude: i64,
    #[serde(default)]
    pub time: i64,
}

/// Nested payload of a `telemetry` event.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    pub air_util_tx: f64,
    pub battery_level: i64,
    pub channel_utilization: f64,
    pub voltage: f64,
}

impl MeshEvent {
    /// Decode raw payload bytes into an event.
    ///
    /// Only `from` is required. Everything else defaults per the wire
    /// conventions documented on the struct fields.
    pub fn decode(payload: &[u8]) -> Result<MeshEvent, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let label = obj.get("type").and_then(Value::as_str).unwrap_or("");
        let kind = EventKind::from_label(label);

        let raw_from = obj
            .get("from")
            .and_then(Value::as_u64)
            .ok_or(DecodeError::MissingFrom)?;
        let from = u32::try_from(raw_from).map_err(|_| DecodeError::FromOutOfRange(raw_from))?;

        Ok(MeshEvent {
            kind,
            from,
            sender: obj
                .get("sender")
                .and_then(Value::as_str)
                .map(str::to_string),
            channel: obj.get("channel").and_then(Value::as_u64).unwrap_or(0) as u32,
            rssi: obj.get("rssi").and_then(Value::as_i64).unwrap_or(0),
            snr: obj.get("snr").and_then(Value::as_f64).unwrap_or(0.0),
            hops_away: obj.get("hops_away").and_then(Value::as_i64).unwrap_or(-1),
            payload: obj.get("payload").cloned().unwrap_or(Value::Null),
        })
    }

    /// Typed view of a `nodeinfo` payload. Missing fields fail this event only.
    pub fn node_info(&self) -> Result<NodeInfoPayload, DecodeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Typed view of a `position` payload.
    pub fn position(&self) -> Result<PositionPayload, DecodeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Typed view of a `telemetry` payload.
    pub fn telemetry(&self) -> Result<TelemetryPayload, DecodeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The text of a `text` event, if the payload carries one.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }
}

/// The `hardware` field is an integer model code on current firmware and a
/// string on some older gateways; normalize both to a string.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for hardware, got {other}"
        ))),
    }
}
