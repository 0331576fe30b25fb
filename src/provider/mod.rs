//! Link providers
//!
//! A provider watches one kind of channel (LAN, in-process loopback) and
//! produces authenticated transports plus the peer identity that arrived
//! with them. The device registry consumes these events and turns them
//! into links; providers never touch device state themselves.

pub mod lan;
pub mod loopback;

pub use lan::{LanProvider, LanProviderConfig};
pub use loopback::LoopbackProvider;

use crate::identity::DeviceInfo;
use crate::transport::Transport;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Events a provider reports to the registry
#[derive(Debug)]
pub enum ProviderEvent {
    /// A connection finished its bootstrap: identity exchanged, channel
    /// authenticated, peer certificate captured.
    ConnectionEstablished {
        identity: DeviceInfo,
        transport: Box<dyn Transport>,
        provider_name: String,
        priority: u8,
        /// Idle-sweep exemption for links over channels that cost nothing
        /// to keep open
        keep_alive: bool,
    },

    /// A connection attempt was refused or broke during bootstrap.
    /// Certificate mismatches always surface here, never as a silent drop.
    ConnectionFailed {
        device_id: Option<String>,
        error: ProtocolError,
    },
}

/// A source of device links
#[async_trait]
pub trait LinkProvider: Send + Sync {
    /// Stable provider name, recorded on every link it produces
    fn name(&self) -> &'static str;

    /// Priority of this provider's links; higher is preferred
    fn priority(&self) -> u8;

    /// Start announcing and accepting. Idempotent.
    async fn start(&self, events: mpsc::UnboundedSender<ProviderEvent>) -> Result<()>;

    /// Stop all background tasks. Established links are unaffected.
    async fn stop(&self);

    /// The network changed; re-announce so peers rediscover us quickly
    async fn network_changed(&self) -> Result<()> {
        Ok(())
    }
}
