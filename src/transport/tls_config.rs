//! TLS configuration
//!
//! Both sides present self-signed certificates, so OpenSSL-level chain
//! verification is disabled. Trust is decided at the application layer by
//! comparing the presented certificate against the pinned one (trust on
//! first use during pairing, exact match afterwards).

use crate::certstore::LocalIdentity;
use crate::Result;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tracing::debug;

/// Cipher suites matching the reference daemon. ECDHE-RSA-AES128-SHA plus
/// SECLEVEL=1 keeps older Android peers on TLS 1.0 working.
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Build the server-side TLS acceptor presenting our certificate
pub fn create_acceptor(identity: &LocalIdentity) -> Result<SslAcceptor> {
    debug!("Creating TLS acceptor for device {}", identity.device_id);

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // Request the client certificate but verify nothing here; pinning
    // happens after the handshake
    builder.set_verify(SslVerifyMode::PEER);
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);

    let cert = identity.x509()?;
    let pkey = identity.pkey()?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

/// Build the client-side TLS connector presenting our certificate
pub fn create_connector(identity: &LocalIdentity) -> Result<SslConnector> {
    debug!("Creating TLS connector for device {}", identity.device_id);

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    builder.set_verify(SslVerifyMode::NONE);

    let cert = identity.x509()?;
    let pkey = identity.pkey()?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_acceptor() {
        let identity = LocalIdentity::generate("test_device").unwrap();
        assert!(create_acceptor(&identity).is_ok());
    }

    #[test]
    fn test_create_connector() {
        let identity = LocalIdentity::generate("test_device").unwrap();
        assert!(create_connector(&identity).is_ok());
    }
}
