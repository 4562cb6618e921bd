//! Operator-facing facade over the hierarchy, issuance and revocation
//!
//! The CLI and the IPC protocol both go through [`CertificateAuthority`]. It owns the
//! [`TrustHierarchy`] behind a lock so bootstrap can run while other handles only read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crl::{CrlArtifact, DEFAULT_CRL_VALIDITY_DAYS};
use crate::crypto::{Certificate, CryptoProvider, KeyPair};
use crate::dn::DistinguishedName;
use crate::error::{ConfigurationError, CryptoError, Result};
use crate::hierarchy::{now_seconds, CaIdentity, HierarchyOptions, HierarchyState, TrustHierarchy};
use crate::issuance::{DistributionPoints, IssueRequest, IssuanceEngine, IssuedCertificate};
use crate::ledger::write_atomic;
use crate::ocsp::{
    signer_problem, status_in, OcspResponder, OcspSignerIdentity, OcspStatus,
    DEFAULT_NEXT_UPDATE_HOURS,
};
use crate::policy::{CaLevel, CertClass};
use crate::revocation::RevocationManager;
use crate::serial_index::{RevocationReason, SerialRecord};
use crate::storage::{CaStore, StoredIdentity};

const KEY_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct AuthorityOptions {
    pub hierarchy: HierarchyOptions,
    pub distribution: DistributionPoints,
    pub crl_validity_days: u32,
    pub ocsp_signer_subject: DistinguishedName,
    pub ocsp_signer_validity_days: u32,
    pub ocsp_next_update: Duration,
}

impl Default for AuthorityOptions {
    fn default() -> Self {
        Self {
            hierarchy: HierarchyOptions::default(),
            distribution: DistributionPoints::default(),
            crl_validity_days: DEFAULT_CRL_VALIDITY_DAYS,
            ocsp_signer_subject: DistinguishedName::with_common_name("OCSP Responder"),
            ocsp_signer_validity_days: 365,
            ocsp_next_update: Duration::hours(DEFAULT_NEXT_UPDATE_HOURS),
        }
    }
}

/// A freshly issued certificate together with the key generated for it
#[derive(Debug, Clone)]
pub struct IssuedBundle {
    pub key: KeyPair,
    pub issued: IssuedCertificate,
}

impl IssuedBundle {
    pub fn key_pem(&self) -> Result<String> {
        let pem = self.key.private_key().with_pkey(|pkey| {
            pkey.private_key_to_pem_pkcs8()
                .map_err(|e| CryptoError::new("encode private key PEM", e))
        })?;
        String::from_utf8(pem)
            .map_err(|e| CryptoError::new("encode private key PEM", e).into())
    }

    /// Leaf followed by the issuing CA and the root
    pub fn chain_pem(&self) -> Result<String> {
        let mut pem = self.issued.certificate.to_pem()?;
        for cert in &self.issued.chain {
            pem.push_str(&cert.to_pem()?);
        }
        Ok(pem)
    }

    /// Write `<stem>.key` (0600), `<stem>.pem` and `<stem>.chain.pem` into `dir`
    pub fn export_pem(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let stem = file_stem(&self.issued.record.subject, self.issued.record.serial);
        let key_path = dir.join(format!("{}.key", stem));
        let cert_path = dir.join(format!("{}.pem", stem));
        let chain_path = dir.join(format!("{}.chain.pem", stem));

        write_atomic(&key_path, self.key_pem()?.as_bytes(), Some(KEY_FILE_MODE))?;
        write_atomic(&cert_path, self.issued.certificate.to_pem()?.as_bytes(), None)?;
        write_atomic(&chain_path, self.chain_pem()?.as_bytes(), None)?;
        Ok(vec![key_path, cert_path, chain_path])
    }
}

fn file_stem(subject: &DistinguishedName, serial: u64) -> String {
    let cn: String = subject
        .cn()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' => c,
            _ => '_',
        })
        .collect();
    if cn.is_empty() {
        format!("{:x}", serial)
    } else {
        cn
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSummary {
    pub level: CaLevel,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issued: usize,
    pub revoked: usize,
    pub next_serial: u64,
    pub crl_number: u64,
}

impl CaSummary {
    fn of(identity: &CaIdentity) -> Self {
        let index = identity.ledger().snapshot();
        Self {
            level: identity.level(),
            subject: identity.subject().to_string(),
            not_before: identity.not_before(),
            not_after: identity.not_after(),
            issued: index.len(),
            revoked: index.revoked().count(),
            next_serial: index.next_serial(),
            crl_number: index.crl_number(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityStatus {
    pub state: HierarchyState,
    pub root: Option<CaSummary>,
    pub intermediate: Option<CaSummary>,
}

pub struct CertificateAuthority {
    hierarchy: RwLock<TrustHierarchy>,
    options: AuthorityOptions,
}

impl CertificateAuthority {
    pub fn open(
        provider: Arc<dyn CryptoProvider>,
        store: Arc<dyn CaStore>,
        options: AuthorityOptions,
    ) -> Result<Self> {
        let hierarchy = TrustHierarchy::open(provider, store, options.hierarchy.clone())?;
        Ok(Self {
            hierarchy: RwLock::new(hierarchy),
            options,
        })
    }

    pub fn options(&self) -> &AuthorityOptions {
        &self.options
    }

    pub fn state(&self) -> HierarchyState {
        self.hierarchy.read().state()
    }

    pub fn init_root(&self, subject: &DistinguishedName, validity_days: u32) -> Result<Certificate> {
        let identity = self.hierarchy.write().bootstrap_root(subject, validity_days)?;
        Ok(identity.certificate().clone())
    }

    pub fn init_intermediate(
        &self,
        subject: &DistinguishedName,
        validity_days: u32,
    ) -> Result<Certificate> {
        let identity = self
            .hierarchy
            .write()
            .bootstrap_intermediate(subject, validity_days)?;
        Ok(identity.certificate().clone())
    }

    fn provider(&self) -> Arc<dyn CryptoProvider> {
        Arc::clone(self.hierarchy.read().provider())
    }

    fn store(&self) -> Arc<dyn CaStore> {
        Arc::clone(self.hierarchy.read().store())
    }

    fn engine(&self) -> Result<IssuanceEngine> {
        let (root, intermediate) = self.hierarchy.read().operational()?;
        Ok(IssuanceEngine::new(
            self.provider(),
            root,
            intermediate,
            self.options.distribution.clone(),
        ))
    }

    /// Identity at `level`, once the hierarchy is operational
    fn issuer(&self, level: CaLevel) -> Result<Arc<CaIdentity>> {
        let (root, intermediate) = self.hierarchy.read().operational()?;
        Ok(match level {
            CaLevel::Root => root,
            CaLevel::Intermediate => intermediate,
        })
    }

    fn revocation(&self, level: CaLevel) -> Result<RevocationManager> {
        Ok(RevocationManager::new(
            self.provider(),
            self.issuer(level)?,
            self.options.crl_validity_days,
        ))
    }

    /// Generate a key for the request's subject and issue a certificate for it
    pub fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle> {
        let engine = self.engine()?;
        let key = self
            .provider()
            .generate_key_pair(self.options.hierarchy.key_algorithm)?;
        let issued = engine.issue(request, &key)?;
        Ok(IssuedBundle { key, issued })
    }

    pub fn issue_with_key(&self, request: &IssueRequest, key: &KeyPair) -> Result<IssuedCertificate> {
        self.engine()?.issue(request, key)
    }

    pub fn revoke(&self, level: CaLevel, serial: u64, reason: RevocationReason) -> Result<SerialRecord> {
        self.revocation(level)?.revoke(serial, reason)
    }

    /// Build, sign and persist a fresh CRL for `level`
    pub fn publish_crl(&self, level: CaLevel) -> Result<CrlArtifact> {
        let artifact = self.revocation(level)?.crl_publisher().publish()?;
        self.store().save_crl(level, &artifact.der)?;
        Ok(artifact)
    }

    /// The persisted OCSP signer if it is still usable, otherwise a newly issued one
    ///
    /// A live ledger entry for the signer subject that is not the stored signer is
    /// revoked as superseded before the replacement is issued.
    pub fn ensure_ocsp_signer(&self) -> Result<OcspSignerIdentity> {
        let intermediate = self.issuer(CaLevel::Intermediate)?;
        let store = self.store();

        if let Some(stored) = store.load_ocsp_signer()? {
            match signer_problem(&intermediate, &stored.certificate, Utc::now())? {
                None => return Ok(stored.into()),
                Some(problem) => warn!(%problem, "stored OCSP signer is unusable, issuing a new one"),
            }
        }

        let subject = &self.options.ocsp_signer_subject;
        let now = now_seconds();
        let stale = intermediate
            .ledger()
            .snapshot()
            .find_live_by_subject(&subject.identity_key(), now)
            .map(|record| record.serial);
        if let Some(serial) = stale {
            self.revoke(CaLevel::Intermediate, serial, RevocationReason::Superseded)?;
        }

        let request = IssueRequest {
            class: CertClass::OcspSigner,
            subject: subject.clone(),
            subject_alt_names: Vec::new(),
            validity_days: self.options.ocsp_signer_validity_days,
        };
        let bundle = self.issue(&request)?;
        let signer = OcspSignerIdentity {
            key: bundle.key,
            certificate: bundle.issued.certificate,
        };
        store.save_ocsp_signer(&StoredIdentity::from(&signer))?;
        info!(serial = bundle.issued.record.serial, "OCSP signer issued");
        Ok(signer)
    }

    pub fn ocsp_responder(&self) -> Result<OcspResponder> {
        let signer = self.ensure_ocsp_signer()?;
        Ok(self
            .revocation(CaLevel::Intermediate)?
            .ocsp_responder(signer)?
            .with_next_update(self.options.ocsp_next_update))
    }

    /// Status of an intermediate-issued serial without signing a response
    pub fn ocsp_status(&self, serial: u64) -> Result<OcspStatus> {
        let intermediate = self.issuer(CaLevel::Intermediate)?;
        Ok(status_in(&intermediate.ledger().snapshot(), serial))
    }

    /// Ledger records of `level`, optionally narrowed to one class
    pub fn list(&self, level: CaLevel, class: Option<CertClass>) -> Result<Vec<SerialRecord>> {
        let identity = {
            let hierarchy = self.hierarchy.read();
            hierarchy
                .identity(level)
                .ok_or(ConfigurationError::NotBootstrapped {
                    state: hierarchy.state(),
                })?
        };
        let index = identity.ledger().snapshot();
        Ok(index
            .records()
            .filter(|r| class.map_or(true, |c| r.class == c))
            .cloned()
            .collect())
    }

    pub fn status(&self) -> AuthorityStatus {
        let hierarchy = self.hierarchy.read();
        AuthorityStatus {
            state: hierarchy.state(),
            root: hierarchy.root().map(|r| CaSummary::of(&r)),
            intermediate: hierarchy.intermediate().map(|i| CaSummary::of(&i)),
        }
    }

    /// `[intermediate, root]` as concatenated PEM
    pub fn chain_pem(&self) -> Result<String> {
        let chain = self.hierarchy.read().chain_of()?;
        let mut pem = String::new();
        for cert in &chain {
            pem.push_str(&cert.to_pem()?);
        }
        Ok(pem)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("hierarchy", &*self.hierarchy.read())
            .finish()
    }
}
