//! Device identity
//!
//! The identity packet (`kdeconnect.identity`) is how devices announce
//! themselves during discovery and connection bootstrap. It carries the
//! stable device id, a human-readable name, and the capability lists used
//! for plugin matching.

use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Packet type for identity announcements
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Maximum accepted device-name length; longer names are truncated
pub const MAX_DEVICE_NAME_LEN: usize = 32;

/// Maximum accepted device-id length
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Device type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Desktop
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Desktop => write!(f, "desktop"),
            DeviceType::Laptop => write!(f, "laptop"),
            DeviceType::Phone => write!(f, "phone"),
            DeviceType::Tablet => write!(f, "tablet"),
            DeviceType::Tv => write!(f, "tv"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "tv" => Ok(DeviceType::Tv),
            other => Err(ProtocolError::InvalidPacket(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

/// Information a device advertises about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Stable unique identifier (UUID with underscores)
    pub device_id: String,

    /// Human-readable name
    pub device_name: String,

    /// Device type classification
    pub device_type: DeviceType,

    /// Protocol version this device speaks
    pub protocol_version: u32,

    /// Packet types this device can receive
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,

    /// TCP port the device listens on for connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

impl DeviceInfo {
    /// Create device info with a freshly generated id
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self::with_id(generate_device_id(), device_name, device_type)
    }

    /// Create device info with an explicit id
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        let device_name = sanitize_device_name(device_name.into());
        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port: None,
        }
    }

    /// Builder: set capability lists
    pub fn with_capabilities(mut self, incoming: Vec<String>, outgoing: Vec<String>) -> Self {
        self.incoming_capabilities = incoming;
        self.outgoing_capabilities = outgoing;
        self
    }

    /// Builder: set the advertised TCP port
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Build the identity packet announcing this device
    pub fn to_identity_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.to_string(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
        });

        if let Some(port) = self.tcp_port {
            body["tcpPort"] = json!(port);
        }

        Packet::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Parse device info out of an identity packet.
    ///
    /// `deviceId`, `deviceName` and `deviceType` are required; version and
    /// capability fields fall back to sensible defaults so older peers
    /// still parse.
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .string("deviceId")
            .ok_or_else(|| {
                ProtocolError::InvalidPacket("identity packet missing deviceId".to_string())
            })?;
        if !is_valid_device_id(&device_id) {
            return Err(ProtocolError::InvalidDeviceId(device_id));
        }

        let device_name = packet
            .string("deviceName")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ProtocolError::InvalidPacket("identity packet missing deviceName".to_string())
            })?;

        let device_type = packet
            .string("deviceType")
            .ok_or_else(|| {
                ProtocolError::InvalidPacket("identity packet missing deviceType".to_string())
            })?
            .parse()?;

        let protocol_version = packet
            .int("protocolVersion")
            .map(|v| v as u32)
            .unwrap_or(PROTOCOL_VERSION);

        let tcp_port = packet
            .int("tcpPort")
            .and_then(|p| u16::try_from(p).ok());

        Ok(Self {
            device_id,
            device_name: sanitize_device_name(device_name),
            device_type,
            protocol_version,
            incoming_capabilities: packet.string_list("incomingCapabilities").unwrap_or_default(),
            outgoing_capabilities: packet.string_list("outgoingCapabilities").unwrap_or_default(),
            tcp_port,
        })
    }
}

/// Generate a new device id: UUID v4 with dashes replaced by underscores
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "_")
}

/// Whether an id is acceptable as a device identifier.
///
/// Ids arrive over the wire and end up in file names and log lines, so
/// they are restricted to ASCII alphanumerics plus `_` and `-`, the
/// alphabet [`generate_device_id`] produces.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_DEVICE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn sanitize_device_name(name: String) -> String {
    if name.len() > MAX_DEVICE_NAME_LEN {
        warn!(
            "Device name exceeds {} characters, truncating",
            MAX_DEVICE_NAME_LEN
        );
        let mut end = MAX_DEVICE_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name[..end].to_string()
    } else {
        name
    }
}
