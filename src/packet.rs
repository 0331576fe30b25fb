//! KDE Connect network packet
//!
//! Packets are single-line JSON documents terminated by a newline:
//!
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: JSON dictionary of plugin-specific parameters
//! - `payloadSize`: (optional) size of side-channel payload in bytes
//! - `payloadTransferInfo`: (optional) transfer negotiation parameters

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::io::AsyncRead;

/// Maximum serialized packet size (DoS guard on the framing layer)
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Payload size value meaning "stream until EOF"
pub const PAYLOAD_SIZE_UNKNOWN: i64 = -1;

/// Represents a KDE Connect network packet
///
/// # Examples
///
/// ```
/// use kdeconnect_link::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({"message": "hi"}));
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "kdeconnect.ping");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds.
    /// Some clients send this as a string, so deserialization accepts both.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type, e.g. "kdeconnect.battery", "kdeconnect.pair"
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters. Unknown keys are preserved verbatim
    /// across a round-trip.
    #[serde(default)]
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info (e.g. {"port": 1739})
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body.
    /// The packet id is set to the current timestamp in milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a packet with an explicit id (useful in tests)
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize to newline-terminated JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes.
    ///
    /// Accepts `\n` and `\r\n` terminated frames as well as bare JSON.
    /// Invalid JSON or a missing/empty `type` field is rejected with
    /// [`ProtocolError::InvalidPacket`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        let packet: Packet = serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("failed to deserialize packet: {}", e))
        })?;

        if packet.packet_type.is_empty() {
            return Err(ProtocolError::InvalidPacket(
                "packet type is empty".to_string(),
            ));
        }

        Ok(packet)
    }

    /// Builder: set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder: set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder: add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether this packet announces a side-channel payload
    pub fn has_payload_info(&self) -> bool {
        self.payload_size.is_some() && self.payload_transfer_info.is_some()
    }

    /// Port advertised in `payloadTransferInfo`
    pub fn payload_port(&self) -> Option<u16> {
        let port = self
            .payload_transfer_info
            .as_ref()?
            .get("port")?
            .as_u64()?;
        u16::try_from(port).ok()
    }

    /// Socket address an announced payload can be fetched from.
    ///
    /// Senders advertise only a port; the link that delivered the packet
    /// fills in the `host` entry from its remote address, so this is
    /// present on packets received over a network-backed link.
    pub fn payload_source(&self) -> Option<SocketAddr> {
        let host = self.payload_transfer_info.as_ref()?.get("host")?.as_str()?;
        let ip: IpAddr = host.parse().ok()?;
        Some(SocketAddr::new(ip, self.payload_port()?))
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a string body field. Absent or wrongly-typed values yield `None`;
    /// callers supply their own default where one makes sense.
    pub fn string(&self, key: &str) -> Option<String> {
        self.body
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Get an integer body field
    pub fn int(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(|v| v.as_i64())
    }

    /// Get a boolean body field
    pub fn boolean(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(|v| v.as_bool())
    }

    /// Get a string-array body field. Non-string elements are skipped.
    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.body.get(key).and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
    }
}

/// Accepts both string and number encodings of the packet id
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Boxed async byte stream carried alongside a packet
pub type PayloadReader = Pin<Box<dyn AsyncRead + Send>>;

/// A bulk data stream attached to a packet.
///
/// The stream is single-use: [`Payload::take_reader`] hands ownership of
/// the underlying reader to exactly one caller, and any later attempt to
/// consume it again fails.
pub struct Payload {
    /// Declared size in bytes, or [`PAYLOAD_SIZE_UNKNOWN`] for streams of
    /// unknown length
    pub size: i64,
    reader: Mutex<Option<PayloadReader>>,
}

impl Payload {
    pub fn new(reader: PayloadReader, size: i64) -> Self {
        Self {
            size,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Whether the stream has not been consumed yet
    pub fn is_available(&self) -> bool {
        self.reader.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Take ownership of the underlying stream. Fails on the second call.
    pub fn take_reader(&self) -> Result<PayloadReader> {
        let mut guard = self
            .reader
            .lock()
            .map_err(|_| ProtocolError::Cancelled("payload lock poisoned".to_string()))?;
        guard
            .take()
            .ok_or_else(|| ProtocolError::Cancelled("payload already consumed".to_string()))
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("size", &self.size)
            .field("available", &self.is_available())
            .finish()
    }
}
