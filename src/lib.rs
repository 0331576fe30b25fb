//! KDE Connect device-link layer
//!
//! Implements the discovery, pairing, and packet-link core of the KDE
//! Connect protocol: UDP identity broadcast on the LAN, a TLS channel
//! bootstrapped from a plaintext identity exchange, trust-on-first-use
//! certificate pinning, the pair/unpair state machine, and multiplexed
//! packet links with side-channel payload transfers.
//!
//! The entry point is the [`DeviceRegistry`]: feed it provider events
//! (usually from a started [`LanProvider`]) and consume
//! [`RegistryEvent`]s. Everything above the link layer is a [`Plugin`]
//! selected by capability overlap with the peer.
//!
//! ```no_run
//! use kdeconnect_link::{
//!     CertificateStore, DeviceInfo, DeviceRegistry, DeviceType, LanProvider,
//!     LinkProvider, PluginRegistry, RegistryConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> kdeconnect_link::Result<()> {
//! let store = Arc::new(CertificateStore::open("/var/lib/myapp")?);
//! let identity = store.ensure_local_identity(&kdeconnect_link::generate_device_id())?;
//!
//! let plugins = PluginRegistry::with_defaults();
//! let info = DeviceInfo::with_id(&identity.device_id, "My desktop", DeviceType::Desktop)
//!     .with_capabilities(
//!         plugins.all_incoming_capabilities(),
//!         plugins.all_outgoing_capabilities(),
//!     );
//!
//! let (registry, mut events) =
//!     DeviceRegistry::new(store.clone(), identity.clone(), plugins, RegistryConfig::default());
//! registry.load_trusted_devices().await?;
//!
//! let lan = LanProvider::new(identity, info, store, Default::default());
//! lan.start(registry.provider_events()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod certstore;
pub mod device;
pub mod error;
pub mod identity;
pub mod link;
pub mod packet;
pub mod pairing;
pub mod payload;
pub mod plugins;
pub mod provider;
pub mod transport;

pub use certstore::{CertificateStore, LocalIdentity};
pub use device::{Device, DeviceRegistry, RegistryConfig, RegistryEvent};
pub use error::{ProtocolError, Result};
pub use identity::{
    generate_device_id, is_valid_device_id, DeviceInfo, DeviceType, PACKET_TYPE_IDENTITY,
};
pub use link::{Link, LinkEvent};
pub use packet::{Packet, Payload, MAX_PACKET_SIZE, PAYLOAD_SIZE_UNKNOWN};
pub use pairing::{
    PairState, PairingConfig, PairingEvent, PairingFailure, PairingHandler, PACKET_TYPE_PAIR,
};
pub use plugins::{Plugin, PluginContext, PluginFactory, PluginRegistry};
pub use provider::{LanProvider, LanProviderConfig, LinkProvider, LoopbackProvider, ProviderEvent};

/// Protocol version announced in identity packets
pub const PROTOCOL_VERSION: u32 = 7;
