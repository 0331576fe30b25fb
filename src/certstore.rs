//! Certificate and trust storage
//!
//! Each device owns a long-lived self-signed certificate whose Common Name
//! is its device id. Trust is established once during pairing and pinned:
//! the peer's certificate is stored on disk and every later connection must
//! present exactly that certificate.
//!
//! ## Certificate parameters
//!
//! - **Algorithm**: RSA 2048-bit, SHA256 signature
//! - **Subject**: O = "KDE", OU = "Kde connect", CN = device id
//! - **Validity**: one year in the past through ten years ahead, so modest
//!   clock skew between devices never invalidates a fresh certificate

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

/// Certificate validity window, relative to generation time
const CERT_BACKDATE_SECS: i64 = 365 * 24 * 60 * 60;
const CERT_VALIDITY_SECS: i64 = 10 * 365 * 24 * 60 * 60;

const LOCAL_CERT_FILE: &str = "device_cert.pem";
const LOCAL_KEY_FILE: &str = "device_key.pem";
const TRUSTED_DIR: &str = "trusted";

/// This device's certificate and private key
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Device id (certificate Common Name)
    pub device_id: String,
    /// DER-encoded certificate
    pub certificate: Vec<u8>,
    /// DER-encoded private key
    pub private_key: Vec<u8>,
    /// Colon-separated SHA256 fingerprint
    pub fingerprint: String,
}

impl LocalIdentity {
    /// Generate a fresh self-signed certificate for a device id
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let now = chrono::Utc::now().timestamp();
        let not_before = Asn1Time::from_unix(now - CERT_BACKDATE_SECS)?;
        let not_after = Asn1Time::from_unix(now + CERT_VALIDITY_SECS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity device certificate, not a CA
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Parsed X509 form of the certificate
    pub fn x509(&self) -> Result<X509> {
        Ok(X509::from_der(&self.certificate)?)
    }

    /// Parsed private key
    pub fn pkey(&self) -> Result<PKey<Private>> {
        Ok(PKey::private_key_from_der(&self.private_key)?)
    }
}

/// Colon-separated SHA256 fingerprint of a DER certificate
pub fn fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Short human-verifiable key derived from both sides' public keys.
///
/// The two keys are hashed smaller-encoding-first, so both devices compute
/// the same value regardless of who initiated. Shown to the user during
/// pairing for out-of-band comparison.
pub fn verification_key(cert_a_der: &[u8], cert_b_der: &[u8]) -> Result<String> {
    let key_a = X509::from_der(cert_a_der)?.public_key()?.public_key_to_der()?;
    let key_b = X509::from_der(cert_b_der)?.public_key()?.public_key_to_der()?;

    let (first, second) = if key_a <= key_b {
        (key_a, key_b)
    } else {
        (key_b, key_a)
    };

    let mut hasher = Sha256::new();
    hasher.update(&first);
    hasher.update(&second);
    let digest = hasher.finalize();

    let full = hex::encode_upper(digest);
    Ok(full[..8].to_string())
}

/// Extract the device id (Common Name) from a certificate
pub fn device_id_from_cert(cert: &X509) -> Result<String> {
    for entry in cert.subject_name().entries() {
        if entry.object().nid() == openssl::nid::Nid::COMMONNAME {
            return Ok(entry.data().to_string()?);
        }
    }
    Err(ProtocolError::InvalidPacket(
        "certificate has no Common Name".to_string(),
    ))
}

/// Durable storage for the local identity and trusted peer certificates.
///
/// Layout under the store directory:
///
/// ```text
/// device_cert.pem / device_key.pem   local identity
/// trusted/<device_id>.pem            one pinned certificate per peer
/// ```
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Open (creating directories as needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join(TRUSTED_DIR))?;
        Ok(Self { dir })
    }

    /// Load the local identity, generating one when missing.
    ///
    /// A stored certificate whose Common Name no longer matches
    /// `device_id` is treated as stale and regenerated; pinned peer trust
    /// is left alone.
    pub fn ensure_local_identity(&self, device_id: &str) -> Result<LocalIdentity> {
        let cert_path = self.dir.join(LOCAL_CERT_FILE);
        let key_path = self.dir.join(LOCAL_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            match self.load_local_identity(&cert_path, &key_path) {
                Ok(identity) if identity.device_id == device_id => {
                    debug!("Loaded existing certificate for device {}", device_id);
                    return Ok(identity);
                }
                Ok(identity) => {
                    warn!(
                        "Stored certificate CN '{}' does not match device id '{}', regenerating",
                        identity.device_id, device_id
                    );
                }
                Err(e) => {
                    warn!("Stored identity unreadable ({}), regenerating", e);
                }
            }
        }

        let identity = LocalIdentity::generate(device_id)?;
        self.save_local_identity(&identity)?;
        Ok(identity)
    }

    fn load_local_identity(&self, cert_path: &Path, key_path: &Path) -> Result<LocalIdentity> {
        let cert_pem = fs::read(cert_path)?;
        let cert = X509::from_pem(&cert_pem)?;
        let certificate = cert.to_der()?;

        let key_pem = fs::read(key_path)?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = device_id_from_cert(&cert)?;
        let fingerprint = fingerprint(&certificate);

        Ok(LocalIdentity {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Write the identity with temp-file + rename so a crash mid-write can
    /// never leave a certificate without its key.
    fn save_local_identity(&self, identity: &LocalIdentity) -> Result<()> {
        let cert_path = self.dir.join(LOCAL_CERT_FILE);
        let key_path = self.dir.join(LOCAL_KEY_FILE);
        let cert_tmp = self.dir.join(format!("{}.tmp", LOCAL_CERT_FILE));
        let key_tmp = self.dir.join(format!("{}.tmp", LOCAL_KEY_FILE));

        let cert_pem = identity.x509()?.to_pem()?;
        let key_pem = identity.pkey()?.private_key_to_pem_pkcs8()?;

        fs::write(&cert_tmp, cert_pem)?;
        fs::write(&key_tmp, key_pem)?;
        fs::rename(&key_tmp, &key_path)?;
        fs::rename(&cert_tmp, &cert_path)?;

        info!("Saved local identity to {:?}", self.dir);
        Ok(())
    }

    /// Path of the pinned certificate for a device id. Ids are remote
    /// input; anything outside the identifier alphabet is refused before
    /// it can name a file.
    fn trusted_path(&self, device_id: &str) -> Result<PathBuf> {
        if !crate::identity::is_valid_device_id(device_id) {
            return Err(ProtocolError::InvalidDeviceId(device_id.to_string()));
        }
        Ok(self.dir.join(TRUSTED_DIR).join(format!("{}.pem", device_id)))
    }

    /// Whether a pinned certificate exists for this device id
    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.trusted_path(device_id)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// The pinned DER certificate for a device, if any
    pub fn trusted_certificate(&self, device_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.trusted_path(device_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let pem_data = fs::read(&path)?;
        let cert = X509::from_pem(&pem_data)?;
        Ok(Some(cert.to_der()?))
    }

    /// Pin a certificate for a device id (on pairing completion)
    pub fn trust(&self, device_id: &str, cert_der: &[u8]) -> Result<()> {
        // Reject garbage before persisting it
        X509::from_der(cert_der)?;

        let path = self.trusted_path(device_id)?;
        let tmp = path.with_extension("pem.tmp");
        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec()));
        fs::write(&tmp, cert_pem)?;
        fs::rename(&tmp, &path)?;

        debug!("Pinned certificate for device {}", device_id);
        Ok(())
    }

    /// Remove the pinned certificate (on unpair). Idempotent.
    pub fn revoke_trust(&self, device_id: &str) -> Result<()> {
        let path = self.trusted_path(device_id)?;
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("Removed pinned certificate for device {}", device_id);
        }
        Ok(())
    }

    /// Device ids with a pinned certificate on disk
    pub fn trusted_device_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.dir.join(TRUSTED_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("pem") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Verify a presented certificate against the pinned one.
    ///
    /// Unknown devices pass (trust is decided by pairing); a known device
    /// with a different certificate is a hard failure.
    pub fn verify_pinned(&self, device_id: &str, presented_der: &[u8]) -> Result<()> {
        match self.trusted_certificate(device_id)? {
            None => Ok(()),
            Some(pinned) if pinned == presented_der => Ok(()),
            Some(pinned) => Err(ProtocolError::CertificateMismatch {
                device_id: device_id.to_string(),
                expected: fingerprint(&pinned),
                actual: fingerprint(presented_der),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_identity() {
        let identity = LocalIdentity::generate("test_device_123").unwrap();

        assert_eq!(identity.device_id, "test_device_123");
        assert!(!identity.certificate.is_empty());
        assert!(!identity.private_key.is_empty());

        // SHA256 fingerprint: 32 colon-separated hex byte pairs
        let parts: Vec<&str> = identity.fingerprint.split(':').collect();
        assert_eq!(parts.len(), 32);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_certificate_validity_tolerates_skew() {
        let identity = LocalIdentity::generate("skew_test").unwrap();
        let cert = identity.x509().unwrap();

        let yesterday = Asn1Time::from_unix(chrono::Utc::now().timestamp() - 86_400).unwrap();
        assert!(cert.not_before() < yesterday);
    }

    #[test]
    fn test_ensure_local_identity_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();

        let first = store.ensure_local_identity("device_a").unwrap();
        let second = store.ensure_local_identity("device_a").unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_cn_mismatch_regenerates() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();

        let old = store.ensure_local_identity("device_a").unwrap();
        let new = store.ensure_local_identity("device_b").unwrap();

        assert_eq!(new.device_id, "device_b");
        assert_ne!(old.fingerprint, new.fingerprint);
    }

    #[test]
    fn test_trust_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();
        let peer = LocalIdentity::generate("peer_device").unwrap();

        assert!(!store.is_trusted("peer_device"));
        store.trust("peer_device", &peer.certificate).unwrap();
        assert!(store.is_trusted("peer_device"));

        let pinned = store.trusted_certificate("peer_device").unwrap().unwrap();
        assert_eq!(pinned, peer.certificate);

        store.revoke_trust("peer_device").unwrap();
        assert!(!store.is_trusted("peer_device"));
        // Second revoke is a no-op
        store.revoke_trust("peer_device").unwrap();
    }

    #[test]
    fn test_trust_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let peer = LocalIdentity::generate("peer_device").unwrap();

        {
            let store = CertificateStore::open(dir.path()).unwrap();
            store.trust("peer_device", &peer.certificate).unwrap();
        }

        let store = CertificateStore::open(dir.path()).unwrap();
        assert!(store.is_trusted("peer_device"));
        assert_eq!(
            store.trusted_certificate("peer_device").unwrap().unwrap(),
            peer.certificate
        );
        assert_eq!(store.trusted_device_ids().unwrap(), vec!["peer_device"]);
    }

    #[test]
    fn test_verify_pinned_detects_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();
        let original = LocalIdentity::generate("peer_device").unwrap();
        let impostor = LocalIdentity::generate("peer_device").unwrap();

        store.trust("peer_device", &original.certificate).unwrap();

        assert!(store.verify_pinned("peer_device", &original.certificate).is_ok());
        assert!(matches!(
            store.verify_pinned("peer_device", &impostor.certificate),
            Err(ProtocolError::CertificateMismatch { .. })
        ));

        // Unknown devices are not pinned yet
        assert!(store.verify_pinned("stranger", &impostor.certificate).is_ok());
    }

    #[test]
    fn test_verification_key_symmetry() {
        let a = LocalIdentity::generate("device_a").unwrap();
        let b = LocalIdentity::generate("device_b").unwrap();

        let ab = verification_key(&a.certificate, &b.certificate).unwrap();
        let ba = verification_key(&b.certificate, &a.certificate).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 8);
        assert!(ab.chars().all(|c| c.is_ascii_hexdigit()));

        // Different pairs produce different keys
        let c = LocalIdentity::generate("device_c").unwrap();
        let ac = verification_key(&a.certificate, &c.certificate).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_trust_refuses_ids_that_escape_the_store() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path().join("store")).unwrap();
        let peer = LocalIdentity::generate("peer_device").unwrap();

        for id in ["../../escaped", "a/b", "a\\b", "..", ""] {
            assert!(
                matches!(
                    store.trust(id, &peer.certificate),
                    Err(ProtocolError::InvalidDeviceId(_))
                ),
                "pinned under {:?}",
                id
            );
            assert!(!store.is_trusted(id));
            assert!(store.revoke_trust(id).is_err());
        }

        // Nothing landed outside trusted/
        assert!(!dir.path().join("escaped.pem").exists());
        assert!(store.trusted_device_ids().unwrap().is_empty());
    }

    #[test]
    fn test_trust_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path()).unwrap();
        assert!(store.trust("peer", b"not a certificate").is_err());
        assert!(!store.is_trusted("peer"));
    }
}
