//! Newline-framed packet transport over any async byte stream
//!
//! Works for both TLS streams on the LAN and in-process duplex pipes; the
//! framing is the same newline-delimited JSON either way.

use crate::packet::MAX_PACKET_SIZE;
use crate::transport::{Transport, TransportAddress};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Idle read deadline. No keepalive pings are sent to avoid waking remote
/// devices, so this has to cover normal quiet periods.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

const READ_CHUNK: usize = 8192;

/// A [`Transport`] over any `AsyncRead + AsyncWrite` byte stream
pub struct StreamTransport<S> {
    stream: S,
    remote: TransportAddress,
    peer_cert: Option<Vec<u8>>,
    read_timeout: Duration,
    /// Bytes read past the last complete frame
    buf: Vec<u8>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, remote: TransportAddress, peer_cert: Option<Vec<u8>>) -> Self {
        Self {
            stream,
            remote,
            peer_cert,
            read_timeout: READ_TIMEOUT,
            buf: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Split off one newline-terminated frame from the buffer, if complete
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
        frame.pop();
        Some(frame)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn remote_address(&self) -> TransportAddress {
        self.remote.clone()
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(
                bytes.len(),
                MAX_PACKET_SIZE,
            ));
        }

        debug!(
            "Sending packet '{}' ({} bytes) to {}",
            packet.packet_type,
            bytes.len(),
            self.remote
        );

        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(frame) = self.take_frame() {
                let packet = Packet::from_bytes(&frame)?;
                debug!(
                    "Received packet '{}' from {}",
                    packet.packet_type, self.remote
                );
                return Ok(packet);
            }

            if self.buf.len() > MAX_PACKET_SIZE {
                return Err(ProtocolError::PacketSizeExceeded(
                    self.buf.len(),
                    MAX_PACKET_SIZE,
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = timeout(self.read_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    ProtocolError::Timeout(format!("reading from {}", self.remote))
                })??;

            if n == 0 {
                return Err(ProtocolError::NetworkError(format!(
                    "connection to {} closed",
                    self.remote
                )));
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing transport to {}", self.remote);
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("remote", &self.remote)
            .field("authenticated", &self.peer_cert.is_some())
            .finish()
    }
}
