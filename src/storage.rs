//! Durable storage for CA identities, ledgers, the OCSP signer and published CRLs
//!
//! ```text
//! <data_dir>/
//!   root/          ca.key  ca.pem  index.json  crl.pem
//!   intermediate/  ca.key  ca.pem  index.json  crl.pem
//!   ocsp/          signer.key  signer.pem
//! ```
//!
//! Private keys are PKCS#8 DER written with mode 0600, encrypted with AES-256-CBC when a
//! passphrase is configured. Every file is replaced atomically.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use openssl::pkey::PKey;
use openssl::symm::Cipher;
use openssl::x509::X509Crl;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::crypto::{Certificate, KeyPair};
use crate::error::{CaError, CryptoError, Result};
use crate::ledger::{write_atomic, IndexStore, JsonFileStore, MemoryIndexStore};
use crate::policy::CaLevel;

const KEY_FILE_MODE: u32 = 0o600;

/// A private key and the certificate that binds it
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub key: KeyPair,
    pub certificate: Certificate,
}

impl StoredIdentity {
    /// Whether the certificate's public key is the stored key's public key
    pub fn is_consistent(&self) -> Result<bool> {
        let cert_key = self
            .certificate
            .to_x509()?
            .public_key()
            .and_then(|k| k.public_key_to_der())
            .map_err(|e| CryptoError::new("read certificate public key", e))?;
        Ok(cert_key == self.key.public_key_der())
    }
}

pub trait CaStore: Send + Sync {
    fn load_identity(&self, level: CaLevel) -> Result<Option<StoredIdentity>>;
    fn save_identity(&self, level: CaLevel, identity: &StoredIdentity) -> Result<()>;
    /// Backend for the level's serial index
    fn index_store(&self, level: CaLevel) -> Arc<dyn IndexStore>;
    fn load_ocsp_signer(&self) -> Result<Option<StoredIdentity>>;
    fn save_ocsp_signer(&self, identity: &StoredIdentity) -> Result<()>;
    /// Persist the latest CRL for a level (DER in, stored as PEM)
    fn save_crl(&self, level: CaLevel, der: &[u8]) -> Result<()>;
    fn load_crl(&self, level: CaLevel) -> Result<Option<Vec<u8>>>;
}

pub struct FileStore {
    data_dir: PathBuf,
    passphrase: Option<SecretString>,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>, passphrase: Option<SecretString>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .map_err(|e| CaError::storage(format!("create {}", data_dir.display()), e))?;
        Ok(Self {
            data_dir,
            passphrase,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn level_dir(&self, level: CaLevel) -> PathBuf {
        self.data_dir.join(level.to_string())
    }

    fn ocsp_dir(&self) -> PathBuf {
        self.data_dir.join("ocsp")
    }

    fn encode_key(&self, key: &KeyPair) -> Result<Vec<u8>> {
        let der = match &self.passphrase {
            None => key.private_key().expose_pkcs8_der().to_vec(),
            Some(passphrase) => key.private_key().with_pkey(|pkey| {
                pkey.private_key_to_pkcs8_passphrase(
                    Cipher::aes_256_cbc(),
                    passphrase.expose_secret().as_bytes(),
                )
                .map_err(|e| CryptoError::new("encrypt private key", e))
            })?,
        };
        Ok(der)
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<KeyPair> {
        let pkey = match &self.passphrase {
            None => PKey::private_key_from_pkcs8(bytes),
            Some(passphrase) => {
                PKey::private_key_from_pkcs8_passphrase(bytes, passphrase.expose_secret().as_bytes())
            }
        }
        .map_err(|e| CryptoError::new("decrypt private key", e))?;
        Ok(KeyPair::from_pkey(&pkey)?)
    }

    fn save_pair(&self, dir: &Path, stem: &str, identity: &StoredIdentity) -> Result<()> {
        let key_path = dir.join(format!("{}.key", stem));
        let cert_path = dir.join(format!("{}.pem", stem));
        write_atomic(&key_path, &self.encode_key(&identity.key)?, Some(KEY_FILE_MODE))?;
        let pem = identity.certificate.to_pem()?;
        if let Err(e) = write_atomic(&cert_path, pem.as_bytes(), None) {
            // A key without its certificate would be picked up as a broken identity
            let _ = fs::remove_file(&key_path);
            return Err(e);
        }
        Ok(())
    }

    fn load_pair(&self, dir: &Path, stem: &str) -> Result<Option<StoredIdentity>> {
        let key_path = dir.join(format!("{}.key", stem));
        let cert_path = dir.join(format!("{}.pem", stem));
        if !cert_path.exists() {
            return Ok(None);
        }
        let pem = fs::read(&cert_path)
            .map_err(|e| CaError::storage(format!("read {}", cert_path.display()), e))?;
        let key_bytes = fs::read(&key_path)
            .map_err(|e| CaError::storage(format!("read {}", key_path.display()), e))?;
        let identity = StoredIdentity {
            key: self.decode_key(&key_bytes)?,
            certificate: Certificate::from_pem(&pem)?,
        };
        if !identity.is_consistent()? {
            return Err(CaError::storage(
                format!("load {}", dir.display()),
                "stored key does not match stored certificate",
            ));
        }
        Ok(Some(identity))
    }
}

impl CaStore for FileStore {
    fn load_identity(&self, level: CaLevel) -> Result<Option<StoredIdentity>> {
        self.load_pair(&self.level_dir(level), "ca")
    }

    fn save_identity(&self, level: CaLevel, identity: &StoredIdentity) -> Result<()> {
        self.save_pair(&self.level_dir(level), "ca", identity)
    }

    fn index_store(&self, level: CaLevel) -> Arc<dyn IndexStore> {
        Arc::new(JsonFileStore::new(self.level_dir(level).join("index.json")))
    }

    fn load_ocsp_signer(&self) -> Result<Option<StoredIdentity>> {
        self.load_pair(&self.ocsp_dir(), "signer")
    }

    fn save_ocsp_signer(&self, identity: &StoredIdentity) -> Result<()> {
        self.save_pair(&self.ocsp_dir(), "signer", identity)
    }

    fn save_crl(&self, level: CaLevel, der: &[u8]) -> Result<()> {
        let pem = X509Crl::from_der(der)
            .and_then(|crl| crl.to_pem())
            .map_err(|e| CryptoError::new("encode CRL PEM", e))?;
        write_atomic(&self.level_dir(level).join("crl.pem"), &pem, None)
    }

    fn load_crl(&self, level: CaLevel) -> Result<Option<Vec<u8>>> {
        let path = self.level_dir(level).join("crl.pem");
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read(&path)
            .map_err(|e| CaError::storage(format!("read {}", path.display()), e))?;
        let der = X509Crl::from_pem(&pem)
            .and_then(|crl| crl.to_der())
            .map_err(|e| CryptoError::new("decode CRL PEM", e))?;
        Ok(Some(der))
    }
}

/// Volatile store for tests and dry runs
pub struct MemoryStore {
    identities: Mutex<HashMap<CaLevel, StoredIdentity>>,
    indexes: HashMap<CaLevel, Arc<MemoryIndexStore>>,
    ocsp_signer: Mutex<Option<StoredIdentity>>,
    crls: Mutex<HashMap<CaLevel, Vec<u8>>>,
    fail_identity_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let indexes = [CaLevel::Root, CaLevel::Intermediate]
            .into_iter()
            .map(|level| (level, Arc::new(MemoryIndexStore::new())))
            .collect();
        Self {
            identities: Mutex::new(HashMap::new()),
            indexes,
            ocsp_signer: Mutex::new(None),
            crls: Mutex::new(HashMap::new()),
            fail_identity_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_identity_saves(&self, fail: bool) {
        self.fail_identity_saves.store(fail, Ordering::SeqCst);
    }

    /// The in-memory index backend for a level, for fault injection
    pub fn memory_index(&self, level: CaLevel) -> Arc<MemoryIndexStore> {
        self.indexes
            .get(&level)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CaStore for MemoryStore {
    fn load_identity(&self, level: CaLevel) -> Result<Option<StoredIdentity>> {
        Ok(self.identities.lock().get(&level).cloned())
    }

    fn save_identity(&self, level: CaLevel, identity: &StoredIdentity) -> Result<()> {
        if self.fail_identity_saves.load(Ordering::SeqCst) {
            return Err(CaError::storage(
                format!("save {} identity", level),
                "memory store configured to fail",
            ));
        }
        self.identities.lock().insert(level, identity.clone());
        Ok(())
    }

    fn index_store(&self, level: CaLevel) -> Arc<dyn IndexStore> {
        self.memory_index(level)
    }

    fn load_ocsp_signer(&self) -> Result<Option<StoredIdentity>> {
        Ok(self.ocsp_signer.lock().clone())
    }

    fn save_ocsp_signer(&self, identity: &StoredIdentity) -> Result<()> {
        *self.ocsp_signer.lock() = Some(identity.clone());
        Ok(())
    }

    fn save_crl(&self, level: CaLevel, der: &[u8]) -> Result<()> {
        self.crls.lock().insert(level, der.to_vec());
        Ok(())
    }

    fn load_crl(&self, level: CaLevel) -> Result<Option<Vec<u8>>> {
        Ok(self.crls.lock().get(&level).cloned())
    }
}
