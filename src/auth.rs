//! TLS credential management and the group-code certificate box.
//!
//! Before any TLS trust exists, peers share only the human group code.
//! Certificates travel over insecure channels sealed under a key derived
//! from that code; once delivered, the certificate is pinned and TLS
//! takes over (trust on first use).

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use log::{debug, info, warn};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::BootstrapError;

const NONCE_LEN: usize = 24;
const CERT_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const KEY_CERT: &str = "cert.pem";
const KEY_PRIVATE: &str = "key.pem";
const KEY_EXPIRY: &str = "cert.expiry";

/// Opaque get/put/delete-by-key storage for credentials. Stands in for
/// a platform keychain.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]) -> std::io::Result<()>;
    fn delete(&self, key: &str);
}

/// Filesystem-backed credential store rooted in the data directory.
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl CredentialStore for FsCredentialStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.root.join(key)).ok()
    }

    fn put(&self, key: &str, value: &[u8]) -> std::io::Result<()> {
        fs::write(self.root.join(key), value)
    }

    fn delete(&self, key: &str) {
        let _ = fs::remove_file(self.root.join(key));
    }
}

/// This node's TLS credential, PEM-encoded.
#[derive(Clone)]
pub struct Credentials {
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct Authenticator {
    store: Box<dyn CredentialStore>,
    group_key: [u8; 32],
    hostname: String,
    address: IpAddr,
    cached: Mutex<Option<Credentials>>,
}

impl Authenticator {
    pub fn new(
        store: Box<dyn CredentialStore>,
        group_code: &str,
        hostname: String,
        address: IpAddr,
    ) -> Self {
        Self {
            store,
            group_key: derive_group_key(group_code),
            hostname,
            address,
            cached: Mutex::new(None),
        }
    }

    /// Return this node's certificate and key, generating and persisting
    /// a fresh self-signed pair if none exists or the stored one expired.
    pub fn credentials(&self) -> Result<Credentials, BootstrapError> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(creds) = cached.as_ref() {
            return Ok(creds.clone());
        }

        if let Some(creds) = self.load_stored() {
            debug!("Loaded stored TLS credential");
            *cached = Some(creds.clone());
            return Ok(creds);
        }

        info!("Generating a new self-signed TLS credential");
        let creds = self.generate()?;
        *cached = Some(creds.clone());
        Ok(creds)
    }

    /// Seal certificate bytes under the group key:
    /// base64( 24-byte nonce ‖ AEAD ciphertext ).
    pub fn box_certificate(&self, cert: &[u8]) -> Result<String, BootstrapError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.group_key)
            .map_err(|e| BootstrapError::Certificate(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), cert)
            .map_err(|_| BootstrapError::Certificate("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Inverse of [`box_certificate`]. Fails with a certificate error on
    /// malformed base64, a short payload, or a failed AEAD open.
    pub fn unbox_certificate(&self, blob: &str) -> Result<Vec<u8>, BootstrapError> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|e| BootstrapError::Certificate(format!("malformed base64: {e}")))?;

        if raw.len() <= NONCE_LEN {
            return Err(BootstrapError::Certificate(
                "boxed certificate is too short".into(),
            ));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.group_key)
            .map_err(|e| BootstrapError::Certificate(e.to_string()))?;

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                BootstrapError::Certificate("decryption failed (wrong group code?)".into())
            })
    }

    fn load_stored(&self) -> Option<Credentials> {
        let expiry = self
            .store
            .get(KEY_EXPIRY)
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now >= expiry {
            warn!("Stored TLS credential expired, discarding it");
            self.store.delete(KEY_CERT);
            self.store.delete(KEY_PRIVATE);
            self.store.delete(KEY_EXPIRY);
            return None;
        }

        let cert_pem = String::from_utf8(self.store.get(KEY_CERT)?).ok()?;
        let key_pem = String::from_utf8(self.store.get(KEY_PRIVATE)?).ok()?;
        Some(Credentials { cert_pem, key_pem })
    }

    fn generate(&self) -> Result<Credentials, BootstrapError> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| BootstrapError::Certificate(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(vec![self.hostname.clone()])
            .map_err(|e| BootstrapError::Certificate(e.to_string()))?;
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            rcgen::DnValue::Utf8String(self.hostname.clone()),
        );
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress(self.address));
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(30);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| BootstrapError::Certificate(e.to_string()))?;

        let creds = Credentials {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        };

        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + CERT_VALIDITY.as_secs();

        self.store
            .put(KEY_CERT, creds.cert_pem.as_bytes())
            .and_then(|_| self.store.put(KEY_PRIVATE, creds.key_pem.as_bytes()))
            .and_then(|_| self.store.put(KEY_EXPIRY, expiry.to_string().as_bytes()))
            .map_err(|e| BootstrapError::Certificate(format!("could not persist: {e}")))?;

        Ok(creds)
    }
}

/// The shared group code is the only pre-existing trust between peers;
/// its SHA-256 digest is the symmetric key that seals certificates.
fn derive_group_key(group_code: &str) -> [u8; 32] {
    Sha256::digest(group_code.as_bytes()).into()
}
