//! TLS handshakes over established TCP streams
//!
//! The TCP connection already exists when these run; which side plays TLS
//! client is decided by the connection bootstrap, not by who dialed.
//! After the handshake the peer's certificate is extracted once so the
//! application layer can pin or verify it.

use crate::certstore::LocalIdentity;
use crate::transport::tls_config;
use crate::{ProtocolError, Result};
use openssl::ssl::Ssl;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// Handshake deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the client side of the TLS handshake
pub async fn client_handshake(
    stream: TcpStream,
    identity: &LocalIdentity,
) -> Result<SslStream<TcpStream>> {
    let connector = tls_config::create_connector(identity)?;
    let ssl = Ssl::new(connector.context())?;
    let mut tls_stream = SslStream::new(ssl, stream)?;

    timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut tls_stream).connect())
        .await
        .map_err(|_| ProtocolError::Timeout("TLS client handshake".to_string()))?
        .map_err(|e| {
            warn!("TLS client handshake failed: {}", e);
            ProtocolError::Tls(e)
        })?;

    debug!("TLS client handshake complete");
    Ok(tls_stream)
}

/// Run the server side of the TLS handshake
pub async fn server_handshake(
    stream: TcpStream,
    identity: &LocalIdentity,
) -> Result<SslStream<TcpStream>> {
    let acceptor = tls_config::create_acceptor(identity)?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls_stream = SslStream::new(ssl, stream)?;

    timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut tls_stream).accept())
        .await
        .map_err(|_| ProtocolError::Timeout("TLS server handshake".to_string()))?
        .map_err(|e| {
            warn!("TLS server handshake failed: {}", e);
            ProtocolError::Tls(e)
        })?;

    debug!("TLS server handshake complete");
    Ok(tls_stream)
}

/// Extract the peer's DER certificate from a completed handshake
pub fn peer_certificate_der(stream: &SslStream<TcpStream>) -> Result<Vec<u8>> {
    let cert = stream.ssl().peer_certificate().ok_or_else(|| {
        ProtocolError::NetworkError("peer presented no certificate".to_string())
    })?;
    Ok(cert.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_captures_peer_certificates() {
        let server_identity = LocalIdentity::generate("server_device").unwrap();
        let client_identity = LocalIdentity::generate("client_device").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_id_clone = server_identity.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let tls = server_handshake(stream, &server_id_clone).await.unwrap();
            peer_certificate_der(&tls).unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let tls = client_handshake(stream, &client_identity).await.unwrap();
        let server_cert_seen = peer_certificate_der(&tls).unwrap();

        let client_cert_seen = server.await.unwrap();

        assert_eq!(server_cert_seen, server_identity.certificate);
        assert_eq!(client_cert_seen, client_identity.certificate);
    }
}
