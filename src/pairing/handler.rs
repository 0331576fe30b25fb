//! Pairing state machine
//!
//! One handler exists per remote device. All transitions happen under a
//! single lock, so concurrent packets and user actions are linearized.
//!
//! The peer certificate is always the one captured during the TLS
//! handshake of the link that delivered the pairing packet. Certificates
//! in packet bodies are never trusted.

use crate::certstore::{verification_key, CertificateStore};
use crate::pairing::events::{PairingEvent, PairingFailure};
use crate::{Packet, ProtocolError, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Packet type for pairing negotiation
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Default pairing timeout (30 seconds per protocol)
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing handler configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long an unanswered request stays pending
    pub timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: PAIRING_TIMEOUT,
        }
    }
}

/// Pairing state for one remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// No trust relationship
    NotPaired,
    /// We sent a request and are waiting for the peer
    Requested,
    /// The peer sent a request and is waiting for our user
    RequestedByPeer,
    /// Trusted; the peer certificate is pinned
    Paired,
}

/// The `kdeconnect.pair` packet body
#[derive(Debug, Clone)]
pub struct PairingPacket {
    /// true requests/accepts pairing, false rejects or unpairs
    pub pair: bool,
}

impl PairingPacket {
    pub fn request() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    pub fn accept() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    pub fn reject() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    pub fn unpair() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::InvalidPacket(
                "not a pairing packet".to_string(),
            ));
        }

        let pair = packet
            .boolean("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

struct Inner {
    state: PairState,
    /// Certificate captured when the peer's request arrived; pinned only
    /// if the local user accepts
    pending_peer_cert: Option<Vec<u8>>,
    /// Bumped on every new outgoing request so stale timeout tasks are no-ops
    generation: u64,
}

/// Pairing state machine for one remote device
pub struct PairingHandler {
    device_id: String,
    local_cert: Vec<u8>,
    store: Arc<CertificateStore>,
    inner: Arc<Mutex<Inner>>,
    event_tx: mpsc::UnboundedSender<PairingEvent>,
    /// Outgoing pairing packets; the owning device routes them to its best link
    packet_tx: mpsc::UnboundedSender<Packet>,
    config: PairingConfig,
}

impl PairingHandler {
    /// Create a handler for a remote device.
    ///
    /// A device with a pinned certificate on disk starts out `Paired`.
    pub fn new(
        device_id: impl Into<String>,
        local_cert: Vec<u8>,
        store: Arc<CertificateStore>,
        event_tx: mpsc::UnboundedSender<PairingEvent>,
        packet_tx: mpsc::UnboundedSender<Packet>,
        config: PairingConfig,
    ) -> Self {
        let device_id = device_id.into();
        let state = if store.is_trusted(&device_id) {
            PairState::Paired
        } else {
            PairState::NotPaired
        };

        Self {
            device_id,
            local_cert,
            store,
            inner: Arc::new(Mutex::new(Inner {
                state,
                pending_peer_cert: None,
                generation: 0,
            })),
            event_tx,
            packet_tx,
            config,
        }
    }

    pub async fn state(&self) -> PairState {
        self.inner.lock().await.state
    }

    pub async fn is_paired(&self) -> bool {
        self.inner.lock().await.state == PairState::Paired
    }

    /// Compute the verification key for this device against a presented
    /// certificate, for display while a request is in flight.
    pub fn verification_key_with(&self, peer_cert: &[u8]) -> Result<String> {
        verification_key(&self.local_cert, peer_cert)
    }

    /// Send a pairing request and arm the timeout.
    ///
    /// No-op when already paired or a request is already pending.
    pub async fn request_pairing(&self) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                PairState::Paired => return Ok(()),
                PairState::Requested => {
                    debug!("Pairing request to {} already pending", self.device_id);
                    return Ok(());
                }
                PairState::RequestedByPeer => {
                    // The peer already asked; requesting back means accepting
                    drop(inner);
                    return self.accept_pairing().await;
                }
                PairState::NotPaired => {}
            }

            inner.state = PairState::Requested;
            inner.generation += 1;
            inner.generation
        };

        info!("Sending pairing request to {}", self.device_id);
        self.send(PairingPacket::request());
        self.emit(PairingEvent::RequestSent {
            device_id: self.device_id.clone(),
        });

        self.spawn_timeout(generation);
        Ok(())
    }

    /// Accept the peer's pending pairing request (user confirmed).
    pub async fn accept_pairing(&self) -> Result<()> {
        let peer_cert = {
            let mut inner = self.inner.lock().await;
            if inner.state != PairState::RequestedByPeer {
                return Err(ProtocolError::PairingRejected(format!(
                    "no pending pairing request from {}",
                    self.device_id
                )));
            }

            let cert = inner.pending_peer_cert.take().ok_or_else(|| {
                ProtocolError::PairingRejected(format!(
                    "no certificate captured for {}",
                    self.device_id
                ))
            })?;
            inner.state = PairState::Paired;
            cert
        };

        self.store.trust(&self.device_id, &peer_cert)?;
        info!("Accepted pairing with {}", self.device_id);

        self.send(PairingPacket::accept());
        self.emit(PairingEvent::PairingDone {
            device_id: self.device_id.clone(),
        });
        Ok(())
    }

    /// Reject the peer's pending pairing request (user declined).
    pub async fn reject_pairing(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PairState::RequestedByPeer {
                return Ok(());
            }
            inner.state = PairState::NotPaired;
            inner.pending_peer_cert = None;
        }

        info!("Rejected pairing request from {}", self.device_id);
        self.send(PairingPacket::reject());
        self.emit(PairingEvent::PairingFailed {
            device_id: self.device_id.clone(),
            reason: PairingFailure::RejectedByUser,
        });
        Ok(())
    }

    /// Dissolve an existing pairing (or withdraw a pending request).
    pub async fn unpair(&self) -> Result<()> {
        let was_paired = {
            let mut inner = self.inner.lock().await;
            let was_paired = inner.state == PairState::Paired;
            inner.state = PairState::NotPaired;
            inner.pending_peer_cert = None;
            was_paired
        };

        self.store.revoke_trust(&self.device_id)?;
        self.send(PairingPacket::unpair());

        if was_paired {
            info!("Unpaired from {}", self.device_id);
            self.emit(PairingEvent::Unpaired {
                device_id: self.device_id.clone(),
            });
        }
        Ok(())
    }

    /// Process an incoming `kdeconnect.pair` packet.
    ///
    /// `peer_cert` is the DER certificate the delivering link captured
    /// during its TLS handshake. Malformed pairing packets are logged and
    /// dropped; they never disturb the current state.
    pub async fn handle_packet(&self, packet: &Packet, peer_cert: &[u8]) -> Result<()> {
        let pairing = match PairingPacket::from_packet(packet) {
            Ok(p) => p,
            Err(e) => {
                warn!("Ignoring malformed pairing packet from {}: {}", self.device_id, e);
                return Ok(());
            }
        };

        if pairing.pair {
            self.handle_pair_true(peer_cert).await
        } else {
            self.handle_pair_false().await
        }
    }

    async fn handle_pair_true(&self, peer_cert: &[u8]) -> Result<()> {
        enum Action {
            None,
            RequestReceived,
            Mutual,
            ReAccept,
        }

        let action = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                PairState::NotPaired => {
                    inner.state = PairState::RequestedByPeer;
                    inner.pending_peer_cert = Some(peer_cert.to_vec());
                    Action::RequestReceived
                }
                PairState::Requested => {
                    // Either the peer accepted, or our requests crossed on
                    // the wire. Both complete the pairing.
                    inner.state = PairState::Paired;
                    inner.pending_peer_cert = None;
                    Action::Mutual
                }
                PairState::RequestedByPeer => {
                    debug!("Duplicate pairing request from {}", self.device_id);
                    Action::None
                }
                PairState::Paired => Action::ReAccept,
            }
        };

        match action {
            Action::None => {}
            Action::RequestReceived => {
                info!("Received pairing request from {}", self.device_id);
                let verification_key = self.verification_key_with(peer_cert)?;
                self.emit(PairingEvent::RequestReceived {
                    device_id: self.device_id.clone(),
                    verification_key,
                });
            }
            Action::Mutual => {
                self.store.trust(&self.device_id, peer_cert)?;
                info!("Pairing with {} completed", self.device_id);
                self.emit(PairingEvent::PairingDone {
                    device_id: self.device_id.clone(),
                });
            }
            Action::ReAccept => {
                // An already-paired peer re-requesting gets a fresh accept
                debug!("Pairing request from already paired device {}", self.device_id);
                self.send(PairingPacket::accept());
            }
        }
        Ok(())
    }

    async fn handle_pair_false(&self) -> Result<()> {
        enum Action {
            None,
            Unpaired,
            Rejected,
            Cancelled,
        }

        let action = {
            let mut inner = self.inner.lock().await;
            let action = match inner.state {
                PairState::Paired => Action::Unpaired,
                PairState::Requested => Action::Rejected,
                PairState::RequestedByPeer => Action::Cancelled,
                PairState::NotPaired => Action::None,
            };
            inner.state = PairState::NotPaired;
            inner.pending_peer_cert = None;
            action
        };

        match action {
            Action::None => {}
            Action::Unpaired => {
                self.store.revoke_trust(&self.device_id)?;
                info!("Device {} unpaired from us", self.device_id);
                self.emit(PairingEvent::Unpaired {
                    device_id: self.device_id.clone(),
                });
            }
            Action::Rejected => {
                info!("Pairing rejected by {}", self.device_id);
                self.emit(PairingEvent::PairingFailed {
                    device_id: self.device_id.clone(),
                    reason: PairingFailure::RejectedByPeer,
                });
            }
            Action::Cancelled => {
                info!("Pairing request from {} withdrawn", self.device_id);
                self.emit(PairingEvent::PairingFailed {
                    device_id: self.device_id.clone(),
                    reason: PairingFailure::Cancelled,
                });
            }
        }
        Ok(())
    }

    fn spawn_timeout(&self, generation: u64) {
        let inner = self.inner.clone();
        let event_tx = self.event_tx.clone();
        let device_id = self.device_id.clone();
        let timeout = self.config.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut inner = inner.lock().await;
            if inner.state != PairState::Requested || inner.generation != generation {
                return;
            }

            inner.state = PairState::NotPaired;
            drop(inner);

            warn!("Pairing request to {} timed out", device_id);
            let _ = event_tx.send(PairingEvent::PairingFailed {
                device_id,
                reason: PairingFailure::Timeout,
            });
        });
    }

    fn send(&self, packet: Packet) {
        let _ = self.packet_tx.send(packet);
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.event_tx.send(event);
    }
}
