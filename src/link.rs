//! Device links
//!
//! A [`Link`] is a cheap handle to a worker task that owns one transport.
//! The worker multiplexes outgoing sends (each acknowledged individually)
//! with the incoming read loop, forwards received packets in wire order,
//! and reports exactly one [`LinkEvent::Closed`] when the channel dies for
//! any reason.

use crate::packet::Payload;
use crate::payload::{PayloadServer, ProgressCallback};
use crate::transport::{Transport, TransportAddress};
use crate::{Packet, ProtocolError, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Events emitted by link workers
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet arrived on a link. Packets from one link are delivered in
    /// the order they were received from the wire.
    PacketReceived {
        link_id: u64,
        device_id: String,
        packet: Packet,
    },

    /// The link is gone (remote close, read error, or local close).
    /// Emitted exactly once per link.
    Closed { link_id: u64, device_id: String },
}

enum LinkCommand {
    Send {
        packet: Packet,
        ack: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Handle to an established connection to a device
#[derive(Clone)]
pub struct Link {
    id: u64,
    device_id: String,
    provider_name: String,
    priority: u8,
    keep_alive: bool,
    remote: TransportAddress,
    peer_cert: Option<Arc<Vec<u8>>>,
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    /// When the last packet crossed in either direction. Monotonic, so a
    /// wall-clock step cannot skew the idle sweep.
    last_activity: Arc<Mutex<Instant>>,
}

fn touch(activity: &Mutex<Instant>) {
    *activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
}

impl Link {
    /// Take ownership of a transport and spawn its worker task.
    ///
    /// Received packets and the final close notification go to `event_tx`.
    pub fn spawn(
        mut transport: Box<dyn Transport>,
        device_id: impl Into<String>,
        provider_name: impl Into<String>,
        priority: u8,
        keep_alive: bool,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let device_id = device_id.into();
        let provider_name = provider_name.into();
        let remote = transport.remote_address();
        let peer_cert = transport.peer_certificate().map(|c| Arc::new(c.to_vec()));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<LinkCommand>();

        let worker_device_id = device_id.clone();
        let worker_remote = remote.clone();
        let activity = last_activity.clone();
        tokio::spawn(async move {
            let device_id = worker_device_id;
            info!("Link {} to {} established", id, device_id);

            loop {
                tokio::select! {
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(LinkCommand::Send { packet, ack }) => {
                                let result = transport.send_packet(&packet).await;
                                let failed = result.is_err();
                                if failed {
                                    warn!("Send on link {} to {} failed", id, device_id);
                                } else {
                                    touch(&activity);
                                }
                                let _ = ack.send(result);
                                if failed {
                                    break;
                                }
                            }
                            Some(LinkCommand::Close) | None => {
                                debug!("Closing link {} to {}", id, device_id);
                                break;
                            }
                        }
                    }

                    result = transport.receive_packet() => {
                        match result {
                            Ok(mut packet) => {
                                touch(&activity);
                                fill_payload_host(&mut packet, &worker_remote);
                                let _ = event_tx.send(LinkEvent::PacketReceived {
                                    link_id: id,
                                    device_id: device_id.clone(),
                                    packet,
                                });
                            }
                            Err(e) => {
                                debug!("Link {} to {} read ended: {}", id, device_id, e);
                                break;
                            }
                        }
                    }
                }
            }

            let _ = transport.close().await;
            info!("Link {} to {} closed", id, device_id);
            let _ = event_tx.send(LinkEvent::Closed {
                link_id: id,
                device_id,
            });
        });

        Self {
            id,
            device_id,
            provider_name,
            priority,
            keep_alive,
            remote,
            peer_cert,
            command_tx,
            last_activity,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Provider priority; higher wins when a device has several links
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Whether the idle sweep should leave this link alone even unpaired
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn remote_address(&self) -> TransportAddress {
        self.remote.clone()
    }

    /// DER certificate the peer presented on this link, if authenticated
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref().map(|c| c.as_slice())
    }

    /// Time since the last packet crossed this link in either direction
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Whether the worker is still accepting commands
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Send a packet and wait for the transport-level outcome.
    ///
    /// A link whose worker already died reports [`ProtocolError::LinkClosed`]
    /// immediately; an in-flight send on a dying link resolves to an error
    /// rather than hanging.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(LinkCommand::Send {
                packet: packet.clone(),
                ack,
            })
            .map_err(|_| ProtocolError::LinkClosed(format!("link {} is gone", self.id)))?;

        ack_rx
            .await
            .map_err(|_| ProtocolError::LinkClosed(format!("link {} closed mid-send", self.id)))?
    }

    /// Send a packet with an attached payload.
    ///
    /// Stands up a single-use payload server, advertises its port in
    /// `payloadTransferInfo`, sends the frame, then streams the payload to
    /// whoever connects. The payload stream is consumed even on failure.
    pub async fn send_packet_with_payload(
        &self,
        packet: Packet,
        payload: Payload,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let reader = payload.take_reader()?;
        let server = PayloadServer::bind().await?;

        let mut transfer_info = HashMap::new();
        transfer_info.insert("port".to_string(), json!(server.port()));

        let packet = packet
            .with_payload_size(payload.size)
            .with_payload_transfer_info(transfer_info);

        self.send_packet(&packet).await?;
        server.serve(reader, payload.size, progress).await
    }

    /// Ask the worker to shut the link down. The `Closed` event follows.
    pub fn close(&self) {
        let _ = self.command_tx.send(LinkCommand::Close);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("provider", &self.provider_name)
            .field("priority", &self.priority)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Received packets announce only the sender's payload port; fill in the
/// host from the link's remote address so the payload can be dialed.
fn fill_payload_host(packet: &mut Packet, remote: &TransportAddress) {
    let TransportAddress::Tcp(addr) = remote else {
        return;
    };
    if let Some(info) = packet.payload_transfer_info.as_mut() {
        if info.contains_key("port") && !info.contains_key("host") {
            info.insert("host".to_string(), json!(addr.ip().to_string()));
        }
    }
}
