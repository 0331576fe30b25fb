//! Error handling for the link layer.
//!
//! All fallible operations return [`Result`], and errors from the
//! underlying libraries convert automatically via `thiserror`.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use kdeconnect_link::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS/SSL error (handshake, secure read/write)
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or management error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device id outside the allowed identifier alphabet. Ids are used as
    /// file names in the trust store, so anything else is refused.
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// A trusted device presented a certificate other than the pinned one.
    /// This is a distinct condition from [`ProtocolError::NotPaired`]: the
    /// connection must be refused, never silently re-trusted.
    #[error("Certificate mismatch for device {device_id}: expected {expected}, got {actual}")]
    CertificateMismatch {
        device_id: String,
        expected: String,
        actual: String,
    },

    /// Pairing request timed out waiting for the peer
    #[error("Pairing timed out for device {0}")]
    PairingTimeout(String),

    /// Pairing request was rejected by the peer or the local user
    #[error("Pairing rejected for device {0}")]
    PairingRejected(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Operation timed out
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection actively refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the remote host
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Operation explicitly cancelled (e.g. by a progress callback)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Packet exceeds the maximum allowed frame size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// A link worker is gone and can no longer accept packets
    #[error("Link closed: {0}")]
    LinkClosed(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    /// based on its kind.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation can be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::LinkClosed(_)
                | ProtocolError::Io(_)
        )
    }

    /// Get a user-friendly message suitable for display in notifications.
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Device not paired. Please pair the device first.".to_string()
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found. Check if the device is connected.", id)
            }
            ProtocolError::CertificateMismatch { device_id, .. } => format!(
                "Device '{}' presented an unexpected certificate. \
                 Unpair and pair again if the device was reinstalled.",
                device_id
            ),
            ProtocolError::PairingTimeout(id) => {
                format!("Pairing with '{}' timed out. Try again.", id)
            }
            ProtocolError::PairingRejected(id) => {
                format!("Pairing with '{}' was rejected.", id)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check if KDE Connect is running on the device.".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check if both devices are on the same network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::PacketSizeExceeded(size, max) => format!(
                "Packet too large ({} bytes, max {} bytes).",
                size, max
            ),
            ProtocolError::InvalidPacket(msg) => {
                format!("Invalid data received: {}.", msg)
            }
            ProtocolError::InvalidDeviceId(id) => {
                format!("Rejected malformed device id '{}'.", id)
            }
            ProtocolError::Plugin(msg) => format!("Plugin error: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::LinkClosed(msg) => format!("Connection closed: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
        }
    }
}
