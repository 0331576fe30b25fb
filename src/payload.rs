//! Payload side channel
//!
//! Bulk data never travels on the packet link. The sender opens a one-shot
//! TCP listener in the payload port range and advertises the port in the
//! packet's `payloadTransferInfo`; the receiver connects and pulls exactly
//! `payloadSize` bytes.

use crate::packet::PayloadReader;
use crate::{ProtocolError, Result};
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// First port tried for payload transfers
pub const PAYLOAD_PORT_START: u16 = 1739;

/// Last port tried for payload transfers
pub const PAYLOAD_PORT_END: u16 = 1764;

/// Transfer chunk size
const CHUNK_SIZE: usize = 64 * 1024;

/// How long the server waits for the receiver to connect
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-chunk stall deadline
const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Progress callback: `(bytes_transferred, total_size)`, where total is
/// [`PAYLOAD_SIZE_UNKNOWN`](crate::packet::PAYLOAD_SIZE_UNKNOWN) for
/// unbounded streams. Return `false` to cancel.
pub type ProgressCallback = Box<dyn Fn(u64, i64) -> bool + Send + Sync>;

/// One-shot TCP listener serving a single payload stream
pub struct PayloadServer {
    listener: TcpListener,
    port: u16,
}

impl PayloadServer {
    /// Bind the first free port in the payload range
    pub async fn bind() -> Result<Self> {
        for port in PAYLOAD_PORT_START..=PAYLOAD_PORT_END {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    debug!("Payload server bound to port {}", port);
                    return Ok(Self { listener, port });
                }
                Err(_) => continue,
            }
        }

        Err(ProtocolError::NetworkError(format!(
            "no free payload port in {}-{}",
            PAYLOAD_PORT_START, PAYLOAD_PORT_END
        )))
    }

    /// The advertised port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the single receiver and stream the payload to it.
    ///
    /// `size` bounds the transfer when non-negative; a
    /// [`PAYLOAD_SIZE_UNKNOWN`](crate::packet::PAYLOAD_SIZE_UNKNOWN) size
    /// streams until the reader is drained.
    pub async fn serve(
        self,
        mut reader: PayloadReader,
        size: i64,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let (mut socket, peer) = timeout(ACCEPT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::Timeout("receiver never connected for payload".to_string())
            })??;

        info!("Streaming payload ({} bytes) to {}", size, peer);

        let mut sent: u64 = 0;
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let want = if size >= 0 {
                let remaining = (size as u64).saturating_sub(sent);
                if remaining == 0 {
                    break;
                }
                remaining.min(CHUNK_SIZE as u64) as usize
            } else {
                CHUNK_SIZE
            };

            let n = timeout(CHUNK_TIMEOUT, reader.read(&mut chunk[..want]))
                .await
                .map_err(|_| ProtocolError::Timeout("payload source stalled".to_string()))??;
            if n == 0 {
                break;
            }

            timeout(CHUNK_TIMEOUT, socket.write_all(&chunk[..n]))
                .await
                .map_err(|_| ProtocolError::Timeout("payload receiver stalled".to_string()))??;

            sent += n as u64;

            if let Some(ref cb) = progress {
                if !cb(sent, size) {
                    warn!("Payload transfer to {} cancelled at {} bytes", peer, sent);
                    return Err(ProtocolError::Cancelled(
                        "payload send cancelled".to_string(),
                    ));
                }
            }
        }

        if size >= 0 && sent < size as u64 {
            return Err(ProtocolError::NetworkError(format!(
                "payload source ended early: {} of {} bytes",
                sent, size
            )));
        }

        socket.flush().await?;
        socket.shutdown().await?;
        info!("Payload transfer complete ({} bytes)", sent);
        Ok(())
    }
}

/// Receiver side of a payload transfer
pub struct PayloadClient;

impl PayloadClient {
    /// Connect to the advertised port and stream the payload into `writer`.
    ///
    /// With a non-negative `expected_size`, exactly that many bytes must
    /// arrive; a premature close is an error. With
    /// [`PAYLOAD_SIZE_UNKNOWN`](crate::packet::PAYLOAD_SIZE_UNKNOWN),
    /// bytes are consumed until EOF.
    pub async fn receive_into<W>(
        addr: SocketAddr,
        expected_size: i64,
        writer: &mut W,
        progress: Option<ProgressCallback>,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut socket = timeout(ACCEPT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to payload at {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting to payload"))?;

        debug!("Receiving payload ({} bytes) from {}", expected_size, addr);

        let mut received: u64 = 0;
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let want = if expected_size >= 0 {
                let remaining = (expected_size as u64).saturating_sub(received);
                if remaining == 0 {
                    break;
                }
                remaining.min(CHUNK_SIZE as u64) as usize
            } else {
                CHUNK_SIZE
            };

            let n = timeout(CHUNK_TIMEOUT, socket.read(&mut chunk[..want]))
                .await
                .map_err(|_| ProtocolError::Timeout("payload sender stalled".to_string()))??;

            if n == 0 {
                if expected_size >= 0 && received < expected_size as u64 {
                    return Err(ProtocolError::NetworkError(format!(
                        "payload ended early: {} of {} bytes",
                        received, expected_size
                    )));
                }
                break;
            }

            writer.write_all(&chunk[..n]).await?;
            received += n as u64;

            if let Some(ref cb) = progress {
                if !cb(received, expected_size) {
                    return Err(ProtocolError::Cancelled(
                        "payload receive cancelled".to_string(),
                    ));
                }
            }
        }

        writer.flush().await?;
        info!("Payload received ({} bytes) from {}", received, addr);
        Ok(received)
    }

    /// Receive a payload into a file. A failed or cancelled transfer
    /// removes the partial file instead of leaving it behind.
    pub async fn receive_file(
        addr: SocketAddr,
        expected_size: i64,
        path: impl AsRef<Path>,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path).await?;

        match Self::receive_into(addr, expected_size, &mut file, progress).await {
            Ok(received) => {
                file.sync_all().await?;
                Ok(received)
            }
            Err(e) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(path).await {
                    warn!("Failed to remove partial file {:?}: {}", path, cleanup);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PAYLOAD_SIZE_UNKNOWN;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn local_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_payload_roundtrip() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let size = data.len() as i64;

        let server = PayloadServer::bind().await.unwrap();
        let port = server.port();
        assert!((PAYLOAD_PORT_START..=PAYLOAD_PORT_END).contains(&port));

        let send_data = data.clone();
        let sender = tokio::spawn(async move {
            server
                .serve(Box::pin(std::io::Cursor::new(send_data)), size, None)
                .await
        });

        let mut received = Vec::new();
        let n = PayloadClient::receive_into(local_addr(port), size, &mut received, None)
            .await
            .unwrap();

        sender.await.unwrap().unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_progress_callbacks_fire() {
        let data = vec![7u8; 150_000];
        let size = data.len() as i64;

        let server = PayloadServer::bind().await.unwrap();
        let port = server.port();

        let sender =
            tokio::spawn(async move {
                server.serve(Box::pin(std::io::Cursor::new(data)), size, None).await
            });

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let progress: ProgressCallback = Box::new(move |bytes, total| {
            assert_eq!(total, size);
            seen_cb.store(bytes, Ordering::Relaxed);
            true
        });

        let mut sink = Vec::new();
        PayloadClient::receive_into(local_addr(port), size, &mut sink, Some(progress))
            .await
            .unwrap();

        sender.await.unwrap().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), size as u64);
    }

    #[tokio::test]
    async fn test_receive_cancellation() {
        let data = vec![1u8; 500_000];
        let size = data.len() as i64;

        let server = PayloadServer::bind().await.unwrap();
        let port = server.port();

        let sender =
            tokio::spawn(async move {
                server.serve(Box::pin(std::io::Cursor::new(data)), size, None).await
            });

        let progress: ProgressCallback = Box::new(|_bytes, _total| false);
        let mut sink = Vec::new();
        let result =
            PayloadClient::receive_into(local_addr(port), size, &mut sink, Some(progress)).await;

        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
        let _ = sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_file_removed_on_early_close() {
        let data = vec![2u8; 10_000];

        let server = PayloadServer::bind().await.unwrap();
        let port = server.port();

        // Sender claims more bytes than it will deliver
        let sender = tokio::spawn(async move {
            let _ = server
                .serve(Box::pin(std::io::Cursor::new(data)), 10_000, None)
                .await;
        });

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("incoming.bin");
        let result = PayloadClient::receive_file(local_addr(port), 50_000, &path, None).await;

        sender.await.unwrap();
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unknown_size_streams_until_eof() {
        let data = vec![9u8; 30_000];
        let len = data.len() as u64;

        let server = PayloadServer::bind().await.unwrap();
        let port = server.port();

        let sender = tokio::spawn(async move {
            server
                .serve(
                    Box::pin(std::io::Cursor::new(data)),
                    PAYLOAD_SIZE_UNKNOWN,
                    None,
                )
                .await
        });

        let mut sink = Vec::new();
        let n =
            PayloadClient::receive_into(local_addr(port), PAYLOAD_SIZE_UNKNOWN, &mut sink, None)
                .await
                .unwrap();

        sender.await.unwrap().unwrap();
        assert_eq!(n, len);
    }
}
