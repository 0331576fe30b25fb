//! Plaintext packet framing for the connection bootstrap
//!
//! Before TLS is negotiated, exactly one identity packet travels in each
//! direction in the clear. Reads here are byte-at-a-time on purpose: a
//! buffered reader could swallow the start of the TLS ClientHello that
//! follows immediately after the newline.

use crate::packet::MAX_PACKET_SIZE;
use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Write one packet to a raw stream
pub async fn write_packet_plain<S>(stream: &mut S, packet: &Packet) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    debug!("Sent plaintext packet '{}'", packet.packet_type);
    Ok(())
}

/// Read one newline-terminated packet from a raw stream, one byte at a
/// time, leaving everything after the newline untouched.
pub async fn read_packet_plain<S>(stream: &mut S, deadline: Duration) -> Result<Packet>
where
    S: AsyncRead + Unpin,
{
    let mut packet_bytes = Vec::new();
    let mut byte_buf = [0u8; 1];

    loop {
        match timeout(deadline, stream.read_exact(&mut byte_buf)).await {
            Ok(Ok(_)) => {
                if byte_buf[0] == b'\n' {
                    break;
                }
                packet_bytes.push(byte_buf[0]);
                if packet_bytes.len() > MAX_PACKET_SIZE {
                    return Err(ProtocolError::PacketSizeExceeded(
                        packet_bytes.len(),
                        MAX_PACKET_SIZE,
                    ));
                }
            }
            Ok(Err(e)) => return Err(ProtocolError::from_io_error(e, "bootstrap read")),
            Err(_) => {
                return Err(ProtocolError::Timeout(
                    "waiting for bootstrap packet".to_string(),
                ))
            }
        }
    }

    Packet::from_bytes(&packet_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let packet = Packet::new("kdeconnect.identity", json!({"deviceId": "abc"}));
        write_packet_plain(&mut a, &packet).await.unwrap();

        let received = read_packet_plain(&mut b, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.string("deviceId"), Some("abc".to_string()));
    }

    #[tokio::test]
    async fn test_trailing_bytes_left_in_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let packet = Packet::new("kdeconnect.identity", json!({"deviceId": "abc"}));
        let mut bytes = packet.to_bytes().unwrap();
        bytes.extend_from_slice(b"\x16\x03\x01"); // start of a TLS record
        a.write_all(&bytes).await.unwrap();

        read_packet_plain(&mut b, Duration::from_secs(1))
            .await
            .unwrap();

        // The bytes after the newline are still there for the next reader
        let mut rest = [0u8; 3];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_a, mut b) = tokio::io::duplex(4096);
        let result = read_packet_plain(&mut b, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }
}
