//! Plugin System
//!
//! Plugins implement the functional packet types on top of the link layer.
//! Each device gets its own plugin instances, chosen by intersecting the
//! plugin's capabilities with what the peer advertised in its identity
//! packet. The set of available plugins is a compile-time table; nothing is
//! discovered at runtime.

pub mod ping;

use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What a plugin gets to talk back through
#[derive(Clone)]
pub struct PluginContext {
    device_id: String,
    outgoing_tx: mpsc::UnboundedSender<Packet>,
}

impl PluginContext {
    pub fn new(device_id: impl Into<String>, outgoing_tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            device_id: device_id.into(),
            outgoing_tx,
        }
    }

    /// Id of the device this plugin instance is bound to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queue a packet for the device's best link
    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        self.outgoing_tx.send(packet).map_err(|_| {
            ProtocolError::Plugin(format!("device {} is gone", self.device_id))
        })
    }
}

/// A per-device plugin instance
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable plugin name (e.g. "ping")
    fn name(&self) -> &'static str;

    /// Packet types this plugin handles
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin may send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Whether packets from unpaired devices reach this plugin. Almost
    /// everything should leave this false.
    fn listens_to_unpaired(&self) -> bool {
        false
    }

    /// Called once when the plugin is attached to a device
    async fn start(&mut self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the plugin is detached
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle a packet whose type is in `incoming_capabilities`
    async fn handle_packet(&mut self, packet: &Packet, ctx: &PluginContext) -> Result<()>;
}

/// Creates plugin instances; one factory per plugin kind
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn incoming_capabilities(&self) -> Vec<String>;
    fn outgoing_capabilities(&self) -> Vec<String>;
    fn create(&self) -> Box<dyn Plugin>;
}

/// The compile-time table of available plugins
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<&'static str, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ping::PingPluginFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        debug!("Registered plugin factory '{}'", factory.name());
        self.factories.insert(factory.name(), factory);
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Union of all plugins' incoming capabilities, for our identity packet
    pub fn all_incoming_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .factories
            .values()
            .flat_map(|f| f.incoming_capabilities())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        caps.sort();
        caps
    }

    /// Union of all plugins' outgoing capabilities, for our identity packet
    pub fn all_outgoing_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .factories
            .values()
            .flat_map(|f| f.outgoing_capabilities())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        caps.sort();
        caps
    }

    /// Instantiate the plugins relevant for a peer, based on capability
    /// overlap: a plugin is eligible when it can receive something the peer
    /// sends, or send something the peer receives.
    pub fn create_for_peer(
        &self,
        peer_incoming: &[String],
        peer_outgoing: &[String],
    ) -> Vec<Box<dyn Plugin>> {
        let peer_incoming: HashSet<&str> = peer_incoming.iter().map(|s| s.as_str()).collect();
        let peer_outgoing: HashSet<&str> = peer_outgoing.iter().map(|s| s.as_str()).collect();

        let mut names: Vec<&&'static str> = self.factories.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let factory = &self.factories[name];
                let receives_from_peer = factory
                    .incoming_capabilities()
                    .iter()
                    .any(|c| peer_outgoing.contains(c.as_str()));
                let sends_to_peer = factory
                    .outgoing_capabilities()
                    .iter()
                    .any(|c| peer_incoming.contains(c.as_str()));

                if receives_from_peer || sends_to_peer {
                    Some(factory.create())
                } else {
                    None
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("PluginRegistry").field("plugins", &names).finish()
    }
}
