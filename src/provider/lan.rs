//! LAN link provider
//!
//! Discovery is a UDP broadcast of our identity packet; the receiving side
//! dials back over TCP. The connection bootstrap is:
//!
//! - connector: TCP connect, identity packet in the clear, then TLS as
//!   client; the acceptor's identity arrives over the encrypted channel
//! - acceptor: read the plaintext identity, then TLS as server, then send
//!   our identity over the encrypted channel
//!
//! Either way the peer certificate comes out of the TLS handshake and is
//! checked against the pinned one before the link surfaces.

use crate::certstore::{CertificateStore, LocalIdentity};
use crate::identity::DeviceInfo;
use crate::provider::{LinkProvider, ProviderEvent};
use crate::transport::{
    client_handshake, peer_certificate_der, read_packet_plain, server_handshake, write_packet_plain,
    StreamTransport, Transport, TransportAddress,
};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};

/// Canonical discovery port
pub const DISCOVERY_PORT: u16 = 1716;

/// Fallback range when the canonical port is taken
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// LAN links rank above everything slower
pub const LAN_PRIORITY: u8 = 100;

/// Deadline for the plaintext half of the bootstrap
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum gap between connection attempts to the same device
const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(5);

/// LAN provider configuration
#[derive(Debug, Clone)]
pub struct LanProviderConfig {
    /// UDP port to announce on (and preferred TCP port)
    pub discovery_port: u16,
    /// How often to re-broadcast our identity
    pub broadcast_interval: Duration,
    /// Whether to broadcast at all (listening always happens)
    pub enable_broadcast: bool,
}

impl Default for LanProviderConfig {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            broadcast_interval: Duration::from_secs(30),
            enable_broadcast: true,
        }
    }
}

struct Running {
    tasks: Vec<JoinHandle<()>>,
    udp: Arc<UdpSocket>,
    announce: Vec<u8>,
    tcp_port: u16,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
    device_info: Arc<DeviceInfo>,
}

/// Discovers and connects devices on the local network
pub struct LanProvider {
    identity: Arc<LocalIdentity>,
    base_info: DeviceInfo,
    store: Arc<CertificateStore>,
    config: LanProviderConfig,
    running: Mutex<Option<Running>>,
}

impl LanProvider {
    pub fn new(
        identity: LocalIdentity,
        device_info: DeviceInfo,
        store: Arc<CertificateStore>,
        config: LanProviderConfig,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            base_info: device_info,
            store,
            config,
            running: Mutex::new(None),
        }
    }

    /// TCP port we ended up listening on (after `start`)
    pub async fn tcp_port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.tcp_port)
    }

    /// Dial a known host directly, skipping UDP discovery
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        let (event_tx, device_info) = {
            let running = self.running.lock().await;
            let running = running.as_ref().ok_or_else(|| {
                ProtocolError::NetworkError("provider not started".to_string())
            })?;
            (running.event_tx.clone(), running.device_info.clone())
        };

        connect_to(
            addr,
            self.identity.clone(),
            device_info,
            self.store.clone(),
            event_tx,
        )
        .await
    }

    async fn bind_tcp(&self) -> Result<(TcpListener, u16)> {
        let mut ports: Vec<u16> = vec![self.config.discovery_port];
        ports.extend((PORT_RANGE_START..=PORT_RANGE_END).filter(|p| *p != self.config.discovery_port));

        for port in ports {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    info!("LAN provider listening on TCP port {}", port);
                    return Ok((listener, port));
                }
                Err(_) => continue,
            }
        }

        Err(ProtocolError::NetworkError(format!(
            "no free TCP port in {}-{}",
            PORT_RANGE_START, PORT_RANGE_END
        )))
    }

    async fn bind_udp(&self) -> Result<Arc<UdpSocket>> {
        let mut ports: Vec<u16> = vec![self.config.discovery_port];
        ports.extend((PORT_RANGE_START..=PORT_RANGE_END).filter(|p| *p != self.config.discovery_port));

        for port in ports {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    socket.set_broadcast(true)?;
                    info!("LAN provider listening on UDP port {}", port);
                    return Ok(Arc::new(socket));
                }
                Err(_) => continue,
            }
        }

        Err(ProtocolError::NetworkError(format!(
            "no free UDP port in {}-{}",
            PORT_RANGE_START, PORT_RANGE_END
        )))
    }
}

#[async_trait]
impl LinkProvider for LanProvider {
    fn name(&self) -> &'static str {
        "lan"
    }

    fn priority(&self) -> u8 {
        LAN_PRIORITY
    }

    async fn start(&self, event_tx: mpsc::UnboundedSender<ProviderEvent>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("LAN provider already started");
            return Ok(());
        }

        let (listener, tcp_port) = self.bind_tcp().await?;
        let udp = self.bind_udp().await?;

        let device_info = Arc::new(self.base_info.clone().with_tcp_port(tcp_port));
        let announce = device_info.to_identity_packet().to_bytes()?;

        let mut tasks = Vec::new();

        // Accept loop
        {
            let identity = self.identity.clone();
            let store = self.store.clone();
            let event_tx = event_tx.clone();
            let device_info = device_info.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let identity = identity.clone();
                            let store = store.clone();
                            let event_tx = event_tx.clone();
                            let device_info = device_info.clone();
                            tokio::spawn(async move {
                                if let Err(e) = accept_incoming(
                                    stream,
                                    addr,
                                    identity,
                                    device_info,
                                    store,
                                    event_tx.clone(),
                                )
                                .await
                                {
                                    debug!("Incoming connection from {} failed: {}", addr, e);
                                    let _ = event_tx.send(ProviderEvent::ConnectionFailed {
                                        device_id: None,
                                        error: e,
                                    });
                                }
                            });
                        }
                        Err(e) => {
                            warn!("TCP accept failed: {}", e);
                        }
                    }
                }
            }));
        }

        // UDP listen loop
        {
            let udp = udp.clone();
            let identity = self.identity.clone();
            let store = self.store.clone();
            let event_tx = event_tx.clone();
            let device_info = device_info.clone();
            let our_id = device_info.device_id.clone();
            tasks.push(tokio::spawn(async move {
                let mut debounce = ConnectDebounce::new(RECONNECT_DEBOUNCE);
                let mut buf = vec![0u8; 8192];

                loop {
                    let (len, src) = match udp.recv_from(&mut buf).await {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("UDP receive failed: {}", e);
                            continue;
                        }
                    };

                    let packet = match Packet::from_bytes(&buf[..len]) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let info = match DeviceInfo::from_identity_packet(&packet) {
                        Ok(i) => i,
                        Err(_) => continue,
                    };

                    if info.device_id == our_id {
                        continue;
                    }
                    let Some(port) = info.tcp_port else { continue };

                    if !debounce.allow(&info.device_id, Instant::now()) {
                        continue;
                    }

                    debug!(
                        "Discovered {} ({}) at {}",
                        info.device_name, info.device_id, src
                    );

                    let target = SocketAddr::new(normalize_ip(src.ip()), port);
                    let identity = identity.clone();
                    let store = store.clone();
                    let event_tx = event_tx.clone();
                    let device_info = device_info.clone();
                    let expected_id = info.device_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connect_to(
                            target,
                            identity,
                            device_info,
                            store,
                            event_tx.clone(),
                        )
                        .await
                        {
                            debug!("Connection to discovered {} failed: {}", target, e);
                            let _ = event_tx.send(ProviderEvent::ConnectionFailed {
                                device_id: Some(expected_id),
                                error: e,
                            });
                        }
                    });
                }
            }));
        }

        // Periodic identity broadcast
        if self.config.enable_broadcast {
            let udp = udp.clone();
            let announce_bytes = announce.clone();
            let broadcast_port = self.config.discovery_port;
            let period = self.config.broadcast_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    if let Err(e) = udp
                        .send_to(&announce_bytes, ("255.255.255.255", broadcast_port))
                        .await
                    {
                        debug!("Identity broadcast failed: {}", e);
                    }
                }
            }));
        }

        *running = Some(Running {
            tasks,
            udp,
            announce,
            tcp_port,
            event_tx,
            device_info,
        });

        info!("LAN provider started");
        Ok(())
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(running) = running.take() {
            for task in running.tasks {
                task.abort();
            }
            info!("LAN provider stopped");
        }
    }

    async fn network_changed(&self) -> Result<()> {
        let running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            debug!("Network changed, re-announcing");
            running
                .udp
                .send_to(&running.announce, ("255.255.255.255", self.config.discovery_port))
                .await?;
        }
        Ok(())
    }
}

/// Minimum gap between connection attempts per device. Expired entries
/// are pruned on every call, so the map stays bounded by the window.
struct ConnectDebounce {
    window: Duration,
    last: HashMap<String, Instant>,
}

impl ConnectDebounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Whether an attempt to `device_id` may go out now; records it if so
    fn allow(&mut self, device_id: &str, now: Instant) -> bool {
        self.last.retain(|_, t| now.duration_since(*t) < self.window);
        if self.last.contains_key(device_id) {
            return false;
        }
        self.last.insert(device_id.to_string(), now);
        true
    }
}

/// Map a v4-mapped v6 source back to plain v4 so dialing works either way
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Connector side of the bootstrap
async fn connect_to(
    addr: SocketAddr,
    identity: Arc<LocalIdentity>,
    device_info: Arc<DeviceInfo>,
    store: Arc<CertificateStore>,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
) -> Result<()> {
    let mut stream = timeout(BOOTSTRAP_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;

    write_packet_plain(&mut stream, &device_info.to_identity_packet()).await?;

    let tls = client_handshake(stream, &identity).await?;
    let peer_cert = peer_certificate_der(&tls)?;

    let mut transport = StreamTransport::new(tls, TransportAddress::Tcp(addr), Some(peer_cert.clone()));

    let peer_identity = transport.receive_packet().await?;
    let info = DeviceInfo::from_identity_packet(&peer_identity)?;

    store.verify_pinned(&info.device_id, &peer_cert)?;

    info!(
        "Connected to {} ({}) at {}",
        info.device_name, info.device_id, addr
    );

    let _ = event_tx.send(ProviderEvent::ConnectionEstablished {
        identity: info,
        transport: Box::new(transport),
        provider_name: "lan".to_string(),
        priority: LAN_PRIORITY,
        keep_alive: false,
    });
    Ok(())
}

/// Acceptor side of the bootstrap
async fn accept_incoming(
    mut stream: TcpStream,
    addr: SocketAddr,
    identity: Arc<LocalIdentity>,
    device_info: Arc<DeviceInfo>,
    store: Arc<CertificateStore>,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
) -> Result<()> {
    let peer_identity = read_packet_plain(&mut stream, BOOTSTRAP_TIMEOUT).await?;
    let info = DeviceInfo::from_identity_packet(&peer_identity)?;

    if info.device_id == device_info.device_id {
        return Err(ProtocolError::NetworkError(
            "connection from ourselves".to_string(),
        ));
    }

    let tls = server_handshake(stream, &identity).await?;
    let peer_cert = peer_certificate_der(&tls)?;

    store.verify_pinned(&info.device_id, &peer_cert)?;

    let mut transport =
        StreamTransport::new(tls, TransportAddress::Tcp(addr), Some(peer_cert));
    transport
        .send_packet(&device_info.to_identity_packet())
        .await?;

    info!(
        "Accepted {} ({}) from {}",
        info.device_name, info.device_id, addr
    );

    let _ = event_tx.send(ProviderEvent::ConnectionEstablished {
        identity: info,
        transport: Box::new(transport),
        provider_name: "lan".to_string(),
        priority: LAN_PRIORITY,
        keep_alive: false,
    });
    Ok(())
}
