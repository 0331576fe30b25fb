//! Devices and the device registry
//!
//! A [`Device`] aggregates everything known about one remote peer: its
//! advertised identity, the set of live links to it (best first), its
//! pairing state machine, and its plugin instances. The
//! [`DeviceRegistry`] owns all devices, consumes provider and link events,
//! and applies the lifecycle rules: devices appear with their first link,
//! unpaired devices vanish with their last one, paired devices are
//! remembered even while unreachable.

use crate::certstore::{CertificateStore, LocalIdentity};
use crate::identity::DeviceInfo;
use crate::link::{Link, LinkEvent};
use crate::pairing::{PairingConfig, PairingEvent, PairingHandler, PACKET_TYPE_PAIR};
use crate::plugins::{Plugin, PluginContext, PluginRegistry};
use crate::provider::ProviderEvent;
use crate::{Packet, ProtocolError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long an unpaired, idle, non-keep-alive link survives
const UNPAIRED_LINK_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the idle sweep runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub pairing: PairingConfig,
    /// Idle threshold for unpaired links without `keep_alive`
    pub unpaired_link_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pairing: PairingConfig::default(),
            unpaired_link_timeout: UNPAIRED_LINK_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

/// Events the registry surfaces to the application
#[derive(Debug)]
pub enum RegistryEvent {
    /// A device entered the registry
    DeviceAdded { device_id: String },
    /// A device was evicted (last link gone, not paired)
    DeviceRemoved { device_id: String },
    /// First link to a device came up
    DeviceReachable { device_id: String },
    /// Last link to a device went down (paired devices stay registered)
    DeviceUnreachable { device_id: String },
    /// Pairing activity on some device
    Pairing(PairingEvent),
    /// A known device presented the wrong certificate and was refused
    CertificateMismatch { device_id: String },
}

struct PluginEntry {
    name: String,
    incoming: Vec<String>,
    listens_to_unpaired: bool,
    plugin: Box<dyn Plugin>,
}

/// One remote device
pub struct Device {
    info: RwLock<DeviceInfo>,
    /// Live links, best first: higher provider priority, then most recent
    links: Mutex<Vec<Link>>,
    pairing: PairingHandler,
    plugins: Mutex<Vec<PluginEntry>>,
    plugin_registry: PluginRegistry,
    /// Plugins the user switched off for this device
    disabled_plugins: std::sync::Mutex<HashSet<String>>,
    context: PluginContext,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl Device {
    /// Create a device and spawn its outgoing-packet pump.
    fn new(
        info: DeviceInfo,
        local_identity: &LocalIdentity,
        store: Arc<CertificateStore>,
        plugin_registry: PluginRegistry,
        pairing_config: PairingConfig,
        event_tx: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Arc<Self> {
        let device_id = info.device_id.clone();

        let (pairing_event_tx, mut pairing_event_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Packet>();

        let pairing = PairingHandler::new(
            device_id.clone(),
            local_identity.certificate.clone(),
            store,
            pairing_event_tx,
            outgoing_tx.clone(),
            pairing_config,
        );

        let device = Arc::new(Self {
            info: RwLock::new(info),
            links: Mutex::new(Vec::new()),
            pairing,
            plugins: Mutex::new(Vec::new()),
            plugin_registry,
            disabled_plugins: std::sync::Mutex::new(HashSet::new()),
            context: PluginContext::new(device_id.clone(), outgoing_tx),
            event_tx: event_tx.clone(),
        });

        // Pump queued packets (pairing responses, plugin sends) onto the
        // best link. Holds only a weak handle so a dropped device stops it.
        let weak: Weak<Device> = Arc::downgrade(&device);
        tokio::spawn(async move {
            while let Some(packet) = outgoing_rx.recv().await {
                let Some(device) = weak.upgrade() else { break };
                if let Err(e) = device.send_packet(&packet).await {
                    warn!(
                        "Dropping queued '{}' for {}: {}",
                        packet.packet_type,
                        device.device_id().await,
                        e
                    );
                }
            }
        });

        // Forward pairing events into the registry stream
        tokio::spawn(async move {
            while let Some(event) = pairing_event_rx.recv().await {
                if event_tx.send(RegistryEvent::Pairing(event)).is_err() {
                    break;
                }
            }
        });

        device
    }

    pub async fn device_id(&self) -> String {
        self.info.read().await.device_id.clone()
    }

    pub async fn info(&self) -> DeviceInfo {
        self.info.read().await.clone()
    }

    pub async fn is_reachable(&self) -> bool {
        !self.links.lock().await.is_empty()
    }

    pub async fn is_paired(&self) -> bool {
        self.pairing.is_paired().await
    }

    /// The pairing state machine for this device
    pub fn pairing(&self) -> &PairingHandler {
        &self.pairing
    }

    /// Request pairing with this device
    pub async fn request_pairing(&self) -> Result<()> {
        self.pairing.request_pairing().await
    }

    /// Accept the peer's pending pairing request
    pub async fn accept_pairing(&self) -> Result<()> {
        self.pairing.accept_pairing().await
    }

    /// Reject the peer's pending pairing request
    pub async fn reject_pairing(&self) -> Result<()> {
        self.pairing.reject_pairing().await
    }

    /// Dissolve the pairing
    pub async fn unpair(&self) -> Result<()> {
        self.pairing.unpair().await
    }

    /// Send a packet over the best link, falling back to the next-best
    /// link once if the first attempt fails.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let candidates: Vec<Link> = {
            let links = self.links.lock().await;
            links.iter().take(2).cloned().collect()
        };

        if candidates.is_empty() {
            return Err(ProtocolError::NetworkError(format!(
                "device {} has no links",
                self.info.read().await.device_id
            )));
        }

        let mut last_err = None;
        for link in candidates {
            match link.send_packet(packet).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Send on link {} failed, trying next: {}", link.id(), e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(ProtocolError::NotPaired))
    }

    async fn attach_link(&self, link: Link) -> bool {
        let mut links = self.links.lock().await;
        let first = links.is_empty();

        // Best first; among equal priority the newest link wins
        let pos = links
            .iter()
            .position(|l| l.priority() <= link.priority())
            .unwrap_or(links.len());
        links.insert(pos, link);
        first
    }

    /// Remove a link; returns true when the device just became unreachable
    async fn detach_link(&self, link_id: u64) -> bool {
        let mut links = self.links.lock().await;
        let before = links.len();
        links.retain(|l| l.id() != link_id);
        before > 0 && links.is_empty()
    }

    async fn links_snapshot(&self) -> Vec<Link> {
        self.links.lock().await.clone()
    }

    async fn update_info(&self, info: DeviceInfo) {
        *self.info.write().await = info;
    }

    /// Switch a plugin on or off for this device and apply the change
    pub async fn set_plugin_enabled(&self, name: &str, enabled: bool) {
        {
            let mut disabled = self
                .disabled_plugins
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if enabled {
                disabled.remove(name);
            } else {
                disabled.insert(name.to_string());
            }
        }
        self.reload_plugins().await;
    }

    /// Recompute the plugin set from capability overlap with the peer and
    /// the per-device enablement. Plugins that stay eligible keep their
    /// instances; removed ones are stopped, new ones started.
    pub async fn reload_plugins(&self) {
        let info = self.info.read().await.clone();
        let disabled = self
            .disabled_plugins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let desired: Vec<Box<dyn Plugin>> = self
            .plugin_registry
            .create_for_peer(&info.incoming_capabilities, &info.outgoing_capabilities)
            .into_iter()
            .filter(|p| !disabled.contains(p.name()))
            .collect();
        let desired_names: Vec<&'static str> = desired.iter().map(|p| p.name()).collect();

        let mut plugins = self.plugins.lock().await;

        // Stop plugins that lost their capability overlap
        let mut kept = Vec::new();
        for mut entry in plugins.drain(..) {
            if desired_names.contains(&entry.name.as_str()) {
                kept.push(entry);
            } else {
                debug!("Stopping plugin '{}' for {}", entry.name, info.device_id);
                if let Err(e) = entry.plugin.stop().await {
                    warn!("Plugin '{}' failed to stop: {}", entry.name, e);
                }
            }
        }

        // Start newly eligible ones
        for plugin in desired {
            if kept.iter().any(|e| e.name == plugin.name()) {
                continue;
            }
            let mut entry = PluginEntry {
                name: plugin.name().to_string(),
                incoming: plugin.incoming_capabilities(),
                listens_to_unpaired: plugin.listens_to_unpaired(),
                plugin,
            };
            debug!("Starting plugin '{}' for {}", entry.name, info.device_id);
            if let Err(e) = entry.plugin.start(&self.context).await {
                warn!("Plugin '{}' failed to start: {}", entry.name, e);
                continue;
            }
            kept.push(entry);
        }

        *plugins = kept;
    }

    /// Names of the currently loaded plugins
    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.plugins.lock().await.iter().map(|e| e.name.clone()).collect()
    }

    /// Route one received packet.
    ///
    /// Pairing packets go to the pairing handler together with the
    /// delivering link's peer certificate. Everything else is dispatched
    /// to every loaded plugin whose incoming capabilities match, gated on
    /// pairing state, with per-plugin failures isolated.
    async fn on_packet(&self, link_id: u64, packet: Packet) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            let peer_cert = {
                let links = self.links.lock().await;
                links
                    .iter()
                    .find(|l| l.id() == link_id)
                    .and_then(|l| l.peer_certificate().map(|c| c.to_vec()))
            };

            let Some(peer_cert) = peer_cert else {
                warn!(
                    "Pairing packet on unauthenticated link {} ignored",
                    link_id
                );
                return;
            };

            if let Err(e) = self.pairing.handle_packet(&packet, &peer_cert).await {
                warn!("Pairing packet handling failed: {}", e);
            }
            return;
        }

        let paired = self.pairing.is_paired().await;
        let mut plugins = self.plugins.lock().await;
        let mut delivered = false;

        for entry in plugins.iter_mut() {
            if !entry.incoming.contains(&packet.packet_type) {
                continue;
            }
            if !paired && !entry.listens_to_unpaired {
                continue;
            }

            delivered = true;
            if let Err(e) = entry.plugin.handle_packet(&packet, &self.context).await {
                warn!(
                    "Plugin '{}' failed on '{}': {}",
                    entry.name, packet.packet_type, e
                );
            }
        }

        if !delivered {
            debug!(
                "No plugin consumed '{}' (paired: {})",
                packet.packet_type, paired
            );
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

/// Owns all known devices and the event plumbing around them
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Arc<Device>>>>,
    store: Arc<CertificateStore>,
    local_identity: LocalIdentity,
    plugin_registry: PluginRegistry,
    config: RegistryConfig,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
    provider_tx: mpsc::UnboundedSender<ProviderEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRegistry {
    /// Build a registry. Returns the registry and the application-facing
    /// event stream.
    pub fn new(
        store: Arc<CertificateStore>,
        local_identity: LocalIdentity,
        plugin_registry: PluginRegistry,
        config: RegistryConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (provider_tx, provider_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            store,
            local_identity,
            plugin_registry,
            config,
            event_tx,
            provider_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        registry.clone().spawn_loops(provider_rx, link_rx, link_tx);
        (registry, event_rx)
    }

    /// Sender that providers report into; pass to [`LinkProvider::start`]
    ///
    /// [`LinkProvider::start`]: crate::provider::LinkProvider::start
    pub fn provider_events(&self) -> mpsc::UnboundedSender<ProviderEvent> {
        self.provider_tx.clone()
    }

    pub async fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Pre-register devices with pinned certificates so paired devices
    /// exist (unreachable) right after startup. Their identity details
    /// fill in when they next connect.
    pub async fn load_trusted_devices(&self) -> Result<()> {
        for device_id in self.store.trusted_device_ids()? {
            let placeholder = DeviceInfo::with_id(
                device_id.clone(),
                device_id.clone(),
                crate::identity::DeviceType::Desktop,
            );
            let created = self.get_or_create(placeholder).await;
            if created {
                info!("Restored paired device {}", device_id);
            }
        }
        Ok(())
    }

    /// Shut down the registry's background loops
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Returns true when the device was newly created
    async fn get_or_create(&self, info: DeviceInfo) -> bool {
        let device_id = info.device_id.clone();
        {
            let devices = self.devices.read().await;
            if devices.contains_key(&device_id) {
                return false;
            }
        }

        let mut devices = self.devices.write().await;
        if devices.contains_key(&device_id) {
            return false;
        }

        let device = Device::new(
            info,
            &self.local_identity,
            self.store.clone(),
            self.plugin_registry.clone(),
            self.config.pairing.clone(),
            self.event_tx.clone(),
        );
        devices.insert(device_id.clone(), device);
        drop(devices);

        let _ = self.event_tx.send(RegistryEvent::DeviceAdded { device_id });
        true
    }

    fn spawn_loops(
        self: Arc<Self>,
        mut provider_rx: mpsc::UnboundedReceiver<ProviderEvent>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let mut tasks = Vec::new();

        // Provider events: new connections become links on devices
        {
            let registry = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = provider_rx.recv().await {
                    match event {
                        ProviderEvent::ConnectionEstablished {
                            identity,
                            transport,
                            provider_name,
                            priority,
                            keep_alive,
                        } => {
                            registry
                                .on_connection(
                                    identity,
                                    transport,
                                    provider_name,
                                    priority,
                                    keep_alive,
                                    link_tx.clone(),
                                )
                                .await;
                        }
                        ProviderEvent::ConnectionFailed { device_id, error } => {
                            if let ProtocolError::CertificateMismatch {
                                device_id: id, ..
                            } = &error
                            {
                                warn!("Refused {}: {}", id, error);
                                let _ = registry.event_tx.send(
                                    RegistryEvent::CertificateMismatch {
                                        device_id: id.clone(),
                                    },
                                );
                            } else if let Some(id) = device_id {
                                debug!("Connection to {} failed: {}", id, error);
                            } else {
                                debug!("Inbound connection failed: {}", error);
                            }
                        }
                    }
                }
            }));
        }

        // Link events: packets and closures
        {
            let registry = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = link_rx.recv().await {
                    match event {
                        LinkEvent::PacketReceived {
                            link_id,
                            device_id,
                            packet,
                        } => {
                            let device = registry.device(&device_id).await;
                            if let Some(device) = device {
                                device.on_packet(link_id, packet).await;
                            } else {
                                debug!("Packet for unknown device {}", device_id);
                            }
                        }
                        LinkEvent::Closed { link_id, device_id } => {
                            registry.on_link_closed(link_id, &device_id).await;
                        }
                    }
                }
            }));
        }

        // Idle sweep for unpaired links and orphaned unpaired devices
        {
            let registry = self.clone();
            let period = self.config.sweep_interval;
            let idle_limit = self.config.unpaired_link_timeout;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    for device in registry.devices().await {
                        if device.is_paired().await {
                            continue;
                        }

                        let links = device.links_snapshot().await;
                        if links.is_empty() {
                            // Unpaired with no links, e.g. unpaired locally
                            // while unreachable; nothing keeps it registered
                            registry.evict(&device.device_id().await).await;
                            continue;
                        }

                        for link in links {
                            if !link.keep_alive() && link.idle_for() > idle_limit {
                                info!(
                                    "Disconnecting idle unpaired link {} to {}",
                                    link.id(),
                                    link.device_id()
                                );
                                link.close();
                            }
                        }
                    }
                }
            }));
        }

        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        guard.extend(tasks);
    }

    async fn on_connection(
        &self,
        identity: DeviceInfo,
        transport: Box<dyn crate::transport::Transport>,
        provider_name: String,
        priority: u8,
        keep_alive: bool,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let device_id = identity.device_id.clone();

        // Last line of defense: the provider checked this too, but links
        // from providers that skip it must not bypass pinning
        if let Some(cert) = transport.peer_certificate() {
            if let Err(e) = self.store.verify_pinned(&device_id, cert) {
                warn!("Refused link to {}: {}", device_id, e);
                let _ = self
                    .event_tx
                    .send(RegistryEvent::CertificateMismatch { device_id });
                return;
            }
        }

        self.get_or_create(identity.clone()).await;
        let Some(device) = self.device(&device_id).await else {
            return;
        };

        device.update_info(identity).await;

        let link = Link::spawn(
            transport,
            device_id.clone(),
            provider_name,
            priority,
            keep_alive,
            link_tx,
        );

        let first = device.attach_link(link).await;
        device.reload_plugins().await;

        if first {
            let _ = self
                .event_tx
                .send(RegistryEvent::DeviceReachable { device_id });
        }
    }

    async fn on_link_closed(&self, link_id: u64, device_id: &str) {
        let Some(device) = self.device(device_id).await else {
            return;
        };

        let now_unreachable = device.detach_link(link_id).await;
        if !now_unreachable {
            return;
        }

        let _ = self.event_tx.send(RegistryEvent::DeviceUnreachable {
            device_id: device_id.to_string(),
        });

        // Paired devices are remembered while unreachable; unpaired ones
        // have no reason to stay
        if !device.is_paired().await {
            self.evict(device_id).await;
        }
    }

    /// Drop an unpaired device from the registry
    async fn evict(&self, device_id: &str) {
        if self.devices.write().await.remove(device_id).is_none() {
            return;
        }

        info!("Evicted unpaired device {}", device_id);
        let _ = self.event_tx.send(RegistryEvent::DeviceRemoved {
            device_id: device_id.to_string(),
        });
    }
}
