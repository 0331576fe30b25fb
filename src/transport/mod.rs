//! Transport abstraction
//!
//! A [`Transport`] is an established, framed, bidirectional packet channel.
//! Link providers produce transports (TLS over TCP on the LAN, an in-process
//! duplex pipe for loopback); the link layer consumes them without knowing
//! which kind it got.

mod stream;
mod tcp;
mod tls;
mod tls_config;

pub use stream::StreamTransport;
pub use tcp::{read_packet_plain, write_packet_plain};
pub use tls::{client_handshake, peer_certificate_der, server_handshake};
pub use tls_config::{create_acceptor, create_connector};

use crate::{Packet, Result};
use async_trait::async_trait;

/// Address of the remote end of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    /// TCP/IP socket address
    Tcp(std::net::SocketAddr),

    /// In-process loopback pipe
    Loopback,
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            TransportAddress::Loopback => write!(f, "loopback"),
        }
    }
}

/// An established packet channel to a remote device
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Address of the remote end
    fn remote_address(&self) -> TransportAddress;

    /// DER certificate the peer presented during the handshake, if the
    /// channel is authenticated
    fn peer_certificate(&self) -> Option<&[u8]>;

    /// Send one packet.
    ///
    /// # Errors
    ///
    /// Fails if the packet exceeds the frame limit or the channel broke.
    async fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Receive the next packet, in wire order.
    ///
    /// # Errors
    ///
    /// Fails on malformed frames, read timeout, or a closed channel.
    async fn receive_packet(&mut self) -> Result<Packet>;

    /// Close the channel gracefully
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_address_display() {
        let tcp = TransportAddress::Tcp("192.168.1.100:1716".parse().unwrap());
        assert_eq!(tcp.to_string(), "tcp://192.168.1.100:1716");
        assert_eq!(TransportAddress::Loopback.to_string(), "loopback");
    }
}
