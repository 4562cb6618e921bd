//! Two-level trust hierarchy
//!
//! ```text
//! Uninitialized --bootstrap_root--> RootReady --bootstrap_intermediate--> Operational
//! ```
//!
//! The root is self-signed and only ever signs the intermediate (and its own CRL). The
//! intermediate is created from a PKCS#10 request signed by its own fresh key, checked by
//! the root against the strict `intermediate` policy and issued with `CA:TRUE, pathlen:0`.
//! Each level keeps its own [`Ledger`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{
    Certificate, CertificateExtensions, CertificateTemplate, CryptoProvider, KeyAlgorithm, KeyPair,
};
use crate::dn::DistinguishedName;
use crate::error::{ConfigurationError, CryptoError, Result, StateError, ValidationError};
use crate::ledger::Ledger;
use crate::policy::{validate_subject, CaLevel, CertClass, PolicyCatalog, PolicyRule};
use crate::serial_index::{RecordStatus, RevocationReason, SerialRecord, DEFAULT_FIRST_SERIAL};
use crate::storage::{CaStore, StoredIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HierarchyState {
    Uninitialized,
    RootReady,
    Operational,
}

impl fmt::Display for HierarchyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyState::Uninitialized => write!(f, "uninitialized"),
            HierarchyState::RootReady => write!(f, "root ready"),
            HierarchyState::Operational => write!(f, "operational"),
        }
    }
}

/// Settings applied when CA identities are created or opened
#[derive(Debug, Clone)]
pub struct HierarchyOptions {
    pub key_algorithm: KeyAlgorithm,
    pub first_serial: u64,
    /// DNS patterns server SANs must match; empty allows any name
    pub permitted_server_dns: Vec<String>,
}

impl Default for HierarchyOptions {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            first_serial: DEFAULT_FIRST_SERIAL,
            permitted_server_dns: Vec::new(),
        }
    }
}

/// One CA of the hierarchy: key, certificate, policy and ledger
pub struct CaIdentity {
    level: CaLevel,
    key: KeyPair,
    certificate: Certificate,
    subject: DistinguishedName,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    catalog: PolicyCatalog,
    ledger: Ledger,
}

impl CaIdentity {
    fn from_stored(
        level: CaLevel,
        stored: StoredIdentity,
        catalog: PolicyCatalog,
        ledger: Ledger,
    ) -> Result<Self> {
        let x509 = stored.certificate.to_x509()?;
        let subject = DistinguishedName::from_x509_name(x509.subject_name())?;
        let (not_before, not_after) = stored.certificate.validity()?;
        Ok(Self {
            level,
            key: stored.key,
            certificate: stored.certificate,
            subject,
            not_before,
            not_after,
            catalog,
            ledger,
        })
    }

    pub fn level(&self) -> CaLevel {
        self.level
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Whole days left before this CA's certificate expires
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

impl fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaIdentity")
            .field("level", &self.level)
            .field("subject", &self.subject.to_string())
            .field("not_after", &self.not_after)
            .field("ledger", &self.ledger)
            .finish()
    }
}

/// 9999-12-31T23:59:59Z, the last instant GeneralizedTime can encode
const LATEST_CERTIFICATE_TIMESTAMP: i64 = 253_402_300_799;

/// Current time at the one-second precision certificates carry
pub(crate) fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// `start + days`, or `None` when that lies past what a certificate can encode
pub(crate) fn validity_end(start: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    start
        .checked_add_signed(Duration::days(i64::from(days)))
        .filter(|end| end.timestamp() <= LATEST_CERTIFICATE_TIMESTAMP)
}

/// Revoke a committed CA record whose identity never reached storage
fn retire_unsaved(ledger: &Ledger, serial: u64) {
    let retired = ledger.transact(|index| {
        index.revoke(serial, RevocationReason::CessationOfOperation, now_seconds())?;
        Ok(())
    });
    if let Err(e) = retired {
        warn!(serial, error = %e, "could not retire record of unsaved CA identity");
    }
}

/// Extensions a policy rule prescribes, before per-request additions
pub(crate) fn policy_extensions(rule: &PolicyRule) -> CertificateExtensions {
    CertificateExtensions {
        basic_constraints: Some(rule.basic_constraints),
        key_usage: rule.key_usage.iter().copied().collect(),
        extended_key_usage: rule.extended_key_usage.iter().copied().collect(),
        ..CertificateExtensions::default()
    }
}

/// Ledger entry for a freshly signed certificate
pub(crate) fn new_record(
    certificate: &Certificate,
    template: &CertificateTemplate,
    class: CertClass,
) -> Result<SerialRecord> {
    Ok(SerialRecord {
        serial: template.serial,
        subject_key: template.subject.identity_key(),
        subject: template.subject.clone(),
        class,
        not_before: template.not_before,
        not_after: template.not_after,
        status: RecordStatus::Valid,
        revoked_at: None,
        revocation_reason: None,
        fingerprint: certificate.fingerprint(),
        certificate_pem: certificate.to_pem()?,
    })
}

pub struct TrustHierarchy {
    provider: Arc<dyn CryptoProvider>,
    store: Arc<dyn CaStore>,
    options: HierarchyOptions,
    root: Option<Arc<CaIdentity>>,
    intermediate: Option<Arc<CaIdentity>>,
}

impl TrustHierarchy {
    /// Load whatever part of the hierarchy already exists in `store`
    pub fn open(
        provider: Arc<dyn CryptoProvider>,
        store: Arc<dyn CaStore>,
        options: HierarchyOptions,
    ) -> Result<Self> {
        let mut hierarchy = Self {
            provider,
            store,
            options,
            root: None,
            intermediate: None,
        };
        hierarchy.root = hierarchy.load_level(CaLevel::Root)?;
        hierarchy.intermediate = hierarchy.load_level(CaLevel::Intermediate)?;

        match (&hierarchy.root, &hierarchy.intermediate) {
            (None, Some(_)) => {
                return Err(ConfigurationError::Invalid(
                    "intermediate CA present without a root CA".to_string(),
                )
                .into())
            }
            (Some(root), Some(intermediate)) => {
                let chains = hierarchy.provider.verify_chain(
                    intermediate.certificate(),
                    &[],
                    std::slice::from_ref(root.certificate()),
                )?;
                if !chains {
                    return Err(ConfigurationError::Invalid(
                        "stored intermediate does not chain to the stored root".to_string(),
                    )
                    .into());
                }
            }
            _ => {}
        }
        info!(state = %hierarchy.state(), "trust hierarchy opened");
        Ok(hierarchy)
    }

    fn catalog_for(&self, level: CaLevel) -> PolicyCatalog {
        match level {
            CaLevel::Root => PolicyCatalog::root_default(),
            CaLevel::Intermediate => PolicyCatalog::intermediate_default()
                .with_permitted_server_dns(self.options.permitted_server_dns.clone()),
        }
    }

    fn open_ledger(&self, level: CaLevel) -> Result<Ledger> {
        Ledger::open(self.store.index_store(level), level, self.options.first_serial)
    }

    fn load_level(&self, level: CaLevel) -> Result<Option<Arc<CaIdentity>>> {
        let Some(stored) = self.store.load_identity(level)? else {
            return Ok(None);
        };
        let identity =
            CaIdentity::from_stored(level, stored, self.catalog_for(level), self.open_ledger(level)?)?;
        if identity.not_after <= Utc::now() {
            warn!(%level, not_after = %identity.not_after, "CA certificate has expired");
        }
        Ok(Some(Arc::new(identity)))
    }

    pub fn state(&self) -> HierarchyState {
        match (&self.root, &self.intermediate) {
            (None, _) => HierarchyState::Uninitialized,
            (Some(_), None) => HierarchyState::RootReady,
            (Some(_), Some(_)) => HierarchyState::Operational,
        }
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    pub fn store(&self) -> &Arc<dyn CaStore> {
        &self.store
    }

    pub fn root(&self) -> Option<Arc<CaIdentity>> {
        self.root.clone()
    }

    pub fn intermediate(&self) -> Option<Arc<CaIdentity>> {
        self.intermediate.clone()
    }

    pub fn identity(&self, level: CaLevel) -> Option<Arc<CaIdentity>> {
        match level {
            CaLevel::Root => self.root(),
            CaLevel::Intermediate => self.intermediate(),
        }
    }

    /// `(root, intermediate)`, or `NotBootstrapped` unless the hierarchy is operational
    pub fn operational(&self) -> Result<(Arc<CaIdentity>, Arc<CaIdentity>), ConfigurationError> {
        match (&self.root, &self.intermediate) {
            (Some(root), Some(intermediate)) => Ok((Arc::clone(root), Arc::clone(intermediate))),
            _ => Err(ConfigurationError::NotBootstrapped {
                state: self.state(),
            }),
        }
    }

    /// Create and persist the self-signed root
    pub fn bootstrap_root(
        &mut self,
        subject: &DistinguishedName,
        validity_days: u32,
    ) -> Result<Arc<CaIdentity>> {
        if self.root.is_some() || self.store.load_identity(CaLevel::Root)?.is_some() {
            return Err(StateError::AlreadyInitialized(CaLevel::Root).into());
        }
        if validity_days == 0 {
            return Err(ValidationError::EmptyInput("validity period").into());
        }
        let catalog = self.catalog_for(CaLevel::Root);
        let rule = catalog.resolve(CertClass::Root, subject)?;
        validate_subject(subject, &rule)?;

        let now = now_seconds();
        let not_after = validity_end(now, validity_days)
            .ok_or(ValidationError::ValidityOutOfRange(validity_days))?;

        let key = self.provider.generate_key_pair(self.options.key_algorithm)?;
        let ledger = self.open_ledger(CaLevel::Root)?;

        let certificate = ledger.transact(|index| {
            let template = CertificateTemplate {
                serial: index.allocate(),
                subject: subject.clone(),
                not_before: now,
                not_after,
                subject_public_key: key.public_key_der().to_vec(),
                extensions: policy_extensions(&rule),
            };
            let certificate = self.provider.self_sign(&key, &template)?;
            index.append(new_record(&certificate, &template, CertClass::Root)?)?;
            Ok(certificate)
        })?;
        let stored = StoredIdentity {
            key: key.clone(),
            certificate: certificate.clone(),
        };
        if let Err(e) = self.store.save_identity(CaLevel::Root, &stored) {
            if let Ok(serial) = certificate.serial() {
                retire_unsaved(&ledger, serial);
            }
            return Err(e);
        }

        let identity = Arc::new(CaIdentity::from_stored(
            CaLevel::Root,
            StoredIdentity { key, certificate },
            catalog,
            ledger,
        )?);
        info!(
            subject = %identity.subject(),
            not_after = %identity.not_after(),
            algorithm = %self.options.key_algorithm,
            "root CA bootstrapped"
        );
        self.root = Some(Arc::clone(&identity));
        Ok(identity)
    }

    /// Create the intermediate through a request the root verifies and signs
    pub fn bootstrap_intermediate(
        &mut self,
        subject: &DistinguishedName,
        validity_days: u32,
    ) -> Result<Arc<CaIdentity>> {
        let root = self
            .root
            .clone()
            .ok_or(ConfigurationError::NotBootstrapped {
                state: self.state(),
            })?;
        if self.intermediate.is_some() || self.store.load_identity(CaLevel::Intermediate)?.is_some() {
            return Err(StateError::AlreadyInitialized(CaLevel::Intermediate).into());
        }
        if validity_days == 0 {
            return Err(ValidationError::EmptyInput("validity period").into());
        }

        let rule = root.catalog().resolve(CertClass::Intermediate, root.subject())?;
        validate_subject(subject, &rule)?;

        let now = now_seconds();
        let not_after = match validity_end(now, validity_days) {
            Some(end) if end <= root.not_after() => end,
            _ => {
                return Err(ValidationError::ValidityExceedsIssuer {
                    requested_days: validity_days,
                    remaining_days: root.remaining_days(now),
                }
                .into())
            }
        };

        let key = self.provider.generate_key_pair(self.options.key_algorithm)?;
        let request = self.provider.create_request(&key, subject)?;
        let verified = self.provider.verify_request(&request)?;
        validate_subject(&verified.subject, &rule)?;

        let certificate = root.ledger().transact(|index| {
            let template = CertificateTemplate {
                serial: index.allocate(),
                subject: verified.subject.clone(),
                not_before: now,
                not_after,
                subject_public_key: verified.public_key_der.clone(),
                extensions: policy_extensions(&rule),
            };
            let certificate = self.provider.sign(root.key(), root.certificate(), &template)?;
            let chains = self.provider.verify_chain(
                &certificate,
                &[],
                std::slice::from_ref(root.certificate()),
            )?;
            if !chains {
                return Err(CryptoError::new(
                    "verify intermediate chain",
                    "signed intermediate does not verify against the root",
                )
                .for_subject(template.subject.to_string())
                .into());
            }
            index.append(new_record(&certificate, &template, CertClass::Intermediate)?)?;
            Ok(certificate)
        })?;
        let stored = StoredIdentity {
            key: key.clone(),
            certificate: certificate.clone(),
        };
        if let Err(e) = self.store.save_identity(CaLevel::Intermediate, &stored) {
            if let Ok(serial) = certificate.serial() {
                retire_unsaved(root.ledger(), serial);
            }
            return Err(e);
        }

        let identity = Arc::new(CaIdentity::from_stored(
            CaLevel::Intermediate,
            StoredIdentity { key, certificate },
            self.catalog_for(CaLevel::Intermediate),
            self.open_ledger(CaLevel::Intermediate)?,
        )?);
        info!(
            subject = %identity.subject(),
            not_after = %identity.not_after(),
            "intermediate CA bootstrapped"
        );
        self.intermediate = Some(Arc::clone(&identity));
        Ok(identity)
    }

    /// `[intermediate, root]`
    pub fn chain_of(&self) -> Result<Vec<Certificate>> {
        let (root, intermediate) = self.operational()?;
        Ok(vec![
            intermediate.certificate().clone(),
            root.certificate().clone(),
        ])
    }

    /// `[intermediate]`, for servers that ship the chain without the trust anchor
    pub fn chain_without_root(&self) -> Result<Vec<Certificate>> {
        let (_, intermediate) = self.operational()?;
        Ok(vec![intermediate.certificate().clone()])
    }
}

impl fmt::Debug for TrustHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustHierarchy")
            .field("state", &self.state())
            .field("root", &self.root)
            .field("intermediate", &self.intermediate)
            .finish()
    }
}
