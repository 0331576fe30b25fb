//! Loopback link provider
//!
//! Connects two in-process endpoints over a duplex pipe. The identity and
//! certificate exchange happens in memory, so links come up authenticated
//! without a real handshake. Used for end-to-end tests and local IPC.

use crate::certstore::LocalIdentity;
use crate::identity::DeviceInfo;
use crate::provider::{LinkProvider, ProviderEvent};
use crate::transport::{StreamTransport, TransportAddress};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Below LAN: a loopback link only wins when nothing better exists
pub const LOOPBACK_PRIORITY: u8 = 60;

const PIPE_CAPACITY: usize = 256 * 1024;

/// In-process link endpoint
pub struct LoopbackProvider {
    identity: LocalIdentity,
    device_info: DeviceInfo,
    event_tx: Mutex<Option<mpsc::UnboundedSender<ProviderEvent>>>,
}

impl LoopbackProvider {
    pub fn new(identity: LocalIdentity, device_info: DeviceInfo) -> Self {
        Self {
            identity,
            device_info,
            event_tx: Mutex::new(None),
        }
    }

    /// Wire two started endpoints together. Both sides surface a
    /// `ConnectionEstablished` carrying the other's identity and
    /// certificate.
    pub async fn connect(a: &LoopbackProvider, b: &LoopbackProvider) -> Result<()> {
        let a_tx = a.event_tx.lock().await.clone().ok_or_else(|| {
            ProtocolError::NetworkError("loopback provider not started".to_string())
        })?;
        let b_tx = b.event_tx.lock().await.clone().ok_or_else(|| {
            ProtocolError::NetworkError("loopback provider not started".to_string())
        })?;

        let (pipe_a, pipe_b) = tokio::io::duplex(PIPE_CAPACITY);

        let transport_a = StreamTransport::new(
            pipe_a,
            TransportAddress::Loopback,
            Some(b.identity.certificate.clone()),
        );
        let transport_b = StreamTransport::new(
            pipe_b,
            TransportAddress::Loopback,
            Some(a.identity.certificate.clone()),
        );

        info!(
            "Loopback link between {} and {}",
            a.device_info.device_id, b.device_info.device_id
        );

        a_tx.send(ProviderEvent::ConnectionEstablished {
            identity: b.device_info.clone(),
            transport: Box::new(transport_a),
            provider_name: "loopback".to_string(),
            priority: LOOPBACK_PRIORITY,
            keep_alive: true,
        })
        .map_err(|_| ProtocolError::NetworkError("registry is gone".to_string()))?;

        b_tx.send(ProviderEvent::ConnectionEstablished {
            identity: a.device_info.clone(),
            transport: Box::new(transport_b),
            provider_name: "loopback".to_string(),
            priority: LOOPBACK_PRIORITY,
            keep_alive: true,
        })
        .map_err(|_| ProtocolError::NetworkError("registry is gone".to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl LinkProvider for LoopbackProvider {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn priority(&self) -> u8 {
        LOOPBACK_PRIORITY
    }

    async fn start(&self, events: mpsc::UnboundedSender<ProviderEvent>) -> Result<()> {
        let mut event_tx = self.event_tx.lock().await;
        if event_tx.is_some() {
            debug!("Loopback provider already started");
            return Ok(());
        }
        *event_tx = Some(events);
        Ok(())
    }

    async fn stop(&self) {
        *self.event_tx.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceType;
    use crate::Packet;
    use serde_json::json;

    fn endpoint(name: &str) -> LoopbackProvider {
        let info = DeviceInfo::new(name, DeviceType::Desktop);
        let identity = LocalIdentity::generate(&info.device_id).unwrap();
        LoopbackProvider::new(identity, info)
    }

    #[tokio::test]
    async fn test_connect_surfaces_both_endpoints() {
        let a = endpoint("Alpha");
        let b = endpoint("Beta");

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.start(tx_a).await.unwrap();
        b.start(tx_b).await.unwrap();

        LoopbackProvider::connect(&a, &b).await.unwrap();

        let ProviderEvent::ConnectionEstablished {
            identity: seen_by_a,
            transport: mut ta,
            keep_alive,
            ..
        } = rx_a.recv().await.unwrap()
        else {
            panic!("expected established event");
        };
        let ProviderEvent::ConnectionEstablished {
            identity: seen_by_b,
            transport: mut tb,
            ..
        } = rx_b.recv().await.unwrap()
        else {
            panic!("expected established event");
        };

        assert_eq!(seen_by_a.device_id, b.device_info.device_id);
        assert_eq!(seen_by_b.device_id, a.device_info.device_id);
        assert!(keep_alive);

        // Certificates crossed over
        assert_eq!(
            ta.peer_certificate().unwrap(),
            b.identity.certificate.as_slice()
        );

        ta.send_packet(&Packet::new("kdeconnect.ping", json!({})))
            .await
            .unwrap();
        let got = tb.receive_packet().await.unwrap();
        assert_eq!(got.packet_type, "kdeconnect.ping");
    }

    #[tokio::test]
    async fn test_connect_requires_start() {
        let a = endpoint("Alpha");
        let b = endpoint("Beta");
        assert!(LoopbackProvider::connect(&a, &b).await.is_err());
    }
}
