//! Pairing event system

/// Why a pairing attempt ended without a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    /// No answer within the pairing timeout
    Timeout,
    /// The remote device declined
    RejectedByPeer,
    /// The local user declined
    RejectedByUser,
    /// The remote device withdrew its request
    Cancelled,
}

impl std::fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingFailure::Timeout => write!(f, "timed out"),
            PairingFailure::RejectedByPeer => write!(f, "rejected by peer"),
            PairingFailure::RejectedByUser => write!(f, "rejected by user"),
            PairingFailure::Cancelled => write!(f, "cancelled by peer"),
        }
    }
}

/// Events emitted by a device's pairing handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// We sent a pairing request and are waiting for the peer
    RequestSent { device_id: String },

    /// The peer asked to pair; show `verification_key` and ask the user
    RequestReceived {
        device_id: String,
        verification_key: String,
    },

    /// Pairing completed and the peer certificate is pinned
    PairingDone { device_id: String },

    /// A pairing attempt ended without success
    PairingFailed {
        device_id: String,
        reason: PairingFailure,
    },

    /// An existing pairing was dissolved (locally or by the peer)
    Unpaired { device_id: String },
}

impl PairingEvent {
    /// Device this event concerns
    pub fn device_id(&self) -> &str {
        match self {
            PairingEvent::RequestSent { device_id }
            | PairingEvent::RequestReceived { device_id, .. }
            | PairingEvent::PairingDone { device_id }
            | PairingEvent::PairingFailed { device_id, .. }
            | PairingEvent::Unpaired { device_id } => device_id,
        }
    }
}
