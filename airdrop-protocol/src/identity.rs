//! Identity & Certificate Store
//!
//! Owns the per-installation identity and the single active self-signed
//! certificate. Key material is generated with OpenSSL on a blocking
//! worker and persisted as PEM pairs under the store directory; the
//! newest valid pair wins on load and renewal happens automatically when
//! the remaining validity drops below the threshold.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AirDropError, Result};

/// RSA modulus size for generated certificates
const RSA_BITS: u32 = 2048;

/// Serial number width; a random prime of this many bits
const SERIAL_BITS: i32 = 120;

/// Hex-encoded SHA-256 over the UTF-8 concatenation of email and phone.
///
/// Used as a weak rendezvous token in the BLE manufacturer frame and the
/// mDNS `id` TXT key. Empty inputs are allowed; the result is always 64
/// lowercase hex characters.
pub fn compute_identity_hash(email: &str, phone: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(phone.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistent per-installation identity
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Stable installation id
    pub device_id: Uuid,
    /// Name shown to peers
    pub display_name: String,
    /// Model string reported over /Discover
    pub model_name: String,
    /// Optional contact inputs feeding the identity hash
    pub email: String,
    pub phone: String,
    /// SHA-256(email ∥ phone), lowercase hex
    pub identity_hash: String,
}

impl LocalIdentity {
    pub fn new(display_name: impl Into<String>, email: impl Into<String>, phone: impl Into<String>) -> Self {
        let email = email.into();
        let phone = phone.into();
        let identity_hash = compute_identity_hash(&email, &phone);
        Self {
            device_id: Uuid::new_v4(),
            display_name: display_name.into(),
            model_name: "Windows-PC".to_string(),
            email,
            phone,
            identity_hash,
        }
    }
}

/// An X.509 certificate with its private key, both DER encoded
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    /// SHA-256 over the certificate DER, lowercase hex
    pub thumbprint: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl Certificate {
    /// Remaining validity from now; zero if already expired
    pub fn remaining(&self) -> Duration {
        self.not_after
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }
}

/// On-disk certificate store
///
/// Each generation writes a `cert-<unix>.pem` / `cert-<unix>.key` pair;
/// the highest timestamp is the active certificate.
pub struct CertificateStore {
    dir: PathBuf,
    validity_days: u32,
    renewal_threshold_days: u32,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>, validity_days: u32, renewal_threshold_days: u32) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            AirDropError::StoreUnavailable(format!("cannot create {}: {e}", dir.display()))
        })?;

        // Probe writability up front so the failure is a clean startup
        // error instead of a surprise during renewal
        let probe = dir.join(".store-probe");
        std::fs::write(&probe, b"").map_err(|e| {
            AirDropError::StoreUnavailable(format!("{} not writable: {e}", dir.display()))
        })?;
        let _ = std::fs::remove_file(&probe);

        Ok(Self {
            dir,
            validity_days,
            renewal_threshold_days,
        })
    }

    /// Yield the active certificate, generating a fresh one when the
    /// store is empty, the stored certificate has expired, or it is
    /// within the renewal window.
    pub async fn get_or_create_certificate(&self, display_name: &str) -> Result<Certificate> {
        if let Some(cert) = self.load_newest()? {
            let threshold = Duration::from_secs(self.renewal_threshold_days as u64 * 86400);
            if cert.remaining() > threshold {
                debug!(
                    thumbprint = %cert.thumbprint,
                    remaining_days = cert.remaining().as_secs() / 86400,
                    "reusing stored certificate"
                );
                return Ok(cert);
            }
            info!(
                thumbprint = %cert.thumbprint,
                "stored certificate expired or inside renewal window, regenerating"
            );
        }

        self.generate_and_persist(display_name).await
    }

    /// Force the renewal check; same logic as `get_or_create_certificate`.
    pub async fn renew_certificate(&self, display_name: &str) -> Result<Certificate> {
        self.get_or_create_certificate(display_name).await
    }

    async fn generate_and_persist(&self, display_name: &str) -> Result<Certificate> {
        let cn = subject_common_name(display_name);
        let validity_days = self.validity_days;

        // RSA keygen is CPU-bound; keep it off the reactor
        let cert = tokio::task::spawn_blocking(move || generate_self_signed(&cn, validity_days))
            .await
            .map_err(|e| AirDropError::StoreUnavailable(format!("keygen task failed: {e}")))??;

        let stamp = cert
            .not_before
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let cert_path = self.dir.join(format!("cert-{stamp}.pem"));
        let key_path = self.dir.join(format!("cert-{stamp}.key"));

        let x509 = X509::from_der(&cert.cert_der)?;
        let pkey = PKey::private_key_from_der(&cert.key_der)?;
        std::fs::write(&cert_path, x509.to_pem()?).map_err(|e| {
            AirDropError::StoreUnavailable(format!("cannot write {}: {e}", cert_path.display()))
        })?;
        std::fs::write(&key_path, pkey.private_key_to_pem_pkcs8()?).map_err(|e| {
            AirDropError::StoreUnavailable(format!("cannot write {}: {e}", key_path.display()))
        })?;

        info!(
            thumbprint = %cert.thumbprint,
            path = %cert_path.display(),
            "generated new certificate"
        );
        Ok(cert)
    }

    fn load_newest(&self) -> Result<Option<Certificate>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            AirDropError::StoreUnavailable(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(stamp) = name
                .strip_prefix("cert-")
                .and_then(|rest| rest.strip_suffix(".pem"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                if newest.as_ref().map_or(true, |(best, _)| stamp > *best) {
                    newest = Some((stamp, path));
                }
            }
        }

        let (stamp, cert_path) = match newest {
            Some(found) => found,
            None => return Ok(None),
        };
        let key_path = self.dir.join(format!("cert-{stamp}.key"));

        match load_pair(&cert_path, &key_path) {
            Ok(cert) => Ok(Some(cert)),
            Err(e) => {
                warn!(
                    "stored certificate {} unreadable ({e}), will regenerate",
                    cert_path.display()
                );
                Ok(None)
            }
        }
    }
}

fn subject_common_name(display_name: &str) -> String {
    let machine = gethostname::gethostname()
        .to_string_lossy()
        .trim()
        .to_string();
    if machine.is_empty() {
        format!("AirDrop-{display_name}")
    } else {
        format!("AirDrop-{machine}")
    }
}

fn generate_self_signed(common_name: &str, validity_days: u32) -> Result<Certificate> {
    let rsa = Rsa::generate(RSA_BITS)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.generate_prime(SERIAL_BITS, false, None, None)?;

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&pkey)?;
    builder.sign(&pkey, MessageDigest::sha256())?;
    let x509 = builder.build();

    certificate_from_parts(&x509, &pkey)
}

fn load_pair(cert_path: &Path, key_path: &Path) -> Result<Certificate> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;
    let x509 = X509::from_pem(&cert_pem)?;
    let pkey = PKey::private_key_from_pem(&key_pem)?;
    certificate_from_parts(&x509, &pkey)
}

fn certificate_from_parts(x509: &X509, pkey: &PKey<Private>) -> Result<Certificate> {
    let cert_der = x509.to_der()?;
    let key_der = pkey.private_key_to_der()?;
    let thumbprint = hex::encode(Sha256::digest(&cert_der));

    Ok(Certificate {
        not_before: asn1_to_system_time(x509.not_before())?,
        not_after: asn1_to_system_time(x509.not_after())?,
        cert_der,
        key_der,
        thumbprint,
    })
}

fn asn1_to_system_time(time: &openssl::asn1::Asn1TimeRef) -> Result<SystemTime> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86400 + diff.secs as i64;
    if secs >= 0 {
        Ok(UNIX_EPOCH + Duration::from_secs(secs as u64))
    } else {
        Ok(UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_hash_shape() {
        let hash = compute_identity_hash("user@example.com", "+15551234");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Matches a straight SHA-256 over the concatenation
        let direct = hex::encode(Sha256::digest(b"user@example.com+15551234"));
        assert_eq!(hash, direct);
    }

    #[test]
    fn test_identity_hash_empty_inputs() {
        let hash = compute_identity_hash("", "");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hex::encode(Sha256::digest(b"")));
    }

    #[tokio::test]
    async fn test_store_generates_then_reuses() {
        let temp = TempDir::new().unwrap();
        let store = CertificateStore::new(temp.path(), 365, 30).unwrap();

        let first = store.get_or_create_certificate("Test").await.unwrap();
        assert!(!first.is_expired());
        assert!(first.remaining() > Duration::from_secs(360 * 86400));

        let second = store.get_or_create_certificate("Test").await.unwrap();
        assert_eq!(first.thumbprint, second.thumbprint);
    }

    #[tokio::test]
    async fn test_renewal_inside_threshold() {
        let temp = TempDir::new().unwrap();

        // Generate a certificate that is already inside the renewal window
        let short = CertificateStore::new(temp.path(), 10, 30).unwrap();
        let old = short.get_or_create_certificate("Test").await.unwrap();

        let store = CertificateStore::new(temp.path(), 365, 30).unwrap();
        let renewed = store.get_or_create_certificate("Test").await.unwrap();

        assert_ne!(old.thumbprint, renewed.thumbprint);
        assert!(renewed.remaining() > Duration::from_secs(360 * 86400));
    }

    #[tokio::test]
    async fn test_certificate_fields() {
        let temp = TempDir::new().unwrap();
        let store = CertificateStore::new(temp.path(), 365, 30).unwrap();
        let cert = store.get_or_create_certificate("Test").await.unwrap();

        assert_eq!(cert.thumbprint.len(), 64);
        assert!(cert.not_after > cert.not_before);

        let x509 = X509::from_der(&cert.cert_der).unwrap();
        let cn = x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert!(cn.starts_with("AirDrop-"));
    }

    #[test]
    fn test_local_identity() {
        let identity = LocalIdentity::new("My Desk", "a@b.c", "");
        assert_eq!(identity.identity_hash, compute_identity_hash("a@b.c", ""));
        assert_eq!(identity.model_name, "Windows-PC");
    }
}
