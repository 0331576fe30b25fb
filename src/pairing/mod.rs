//! Device pairing
//!
//! Pairing is the trust ceremony between two devices. Each side shows the
//! user a short verification key derived from both certificates; once both
//! users accept, the peer certificate is pinned and every later connection
//! is authenticated against it.
//!
//! ## Pairing protocol
//!
//! 1. Device A sends `kdeconnect.pair` with `pair: true`
//! 2. Both devices display the verification key for comparison
//! 3. Device B answers `pair: true` (accept) or `pair: false` (reject)
//! 4. Accepted certificates are pinned for future connections
//!
//! An unanswered request expires after 30 seconds. Two requests crossing
//! on the wire count as mutual acceptance.

mod events;
mod handler;

pub use events::{PairingEvent, PairingFailure};
pub use handler::{PairState, PairingConfig, PairingHandler, PairingPacket, PACKET_TYPE_PAIR};
