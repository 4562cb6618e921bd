//! Leaf certificate issuance by the intermediate CA

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{Certificate, CertificateTemplate, CryptoProvider, KeyPair};
use crate::dn::DistinguishedName;
use crate::error::{Result, ValidationError};
use crate::hierarchy::{new_record, now_seconds, policy_extensions, validity_end, CaIdentity};
use crate::policy::{validate_subject, validate_subject_alt_names, CertClass};
use crate::serial_index::SerialRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    pub class: CertClass,
    pub subject: DistinguishedName,
    /// Extra DNS names; server certificates always get `[cn, *.cn]` first
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    pub validity_days: u32,
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    pub record: SerialRecord,
    /// `[issuing CA, root]`
    pub chain: Vec<Certificate>,
}

/// Where relying parties find revocation data; copied into every leaf
#[derive(Debug, Clone, Default)]
pub struct DistributionPoints {
    pub crl_url: Option<String>,
    pub ocsp_url: Option<String>,
}

pub struct IssuanceEngine {
    provider: Arc<dyn CryptoProvider>,
    root: Arc<CaIdentity>,
    issuer: Arc<CaIdentity>,
    distribution: DistributionPoints,
}

impl IssuanceEngine {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        root: Arc<CaIdentity>,
        issuer: Arc<CaIdentity>,
        distribution: DistributionPoints,
    ) -> Self {
        Self {
            provider,
            root,
            issuer,
            distribution,
        }
    }

    /// Issue a leaf for `key`'s public half
    ///
    /// Adds exactly one record to the issuer's ledger on success and none on failure.
    pub fn issue(&self, request: &IssueRequest, key: &KeyPair) -> Result<IssuedCertificate> {
        if !request.class.is_leaf() {
            return Err(ValidationError::UnsupportedClass(request.class).into());
        }
        if request.validity_days == 0 {
            return Err(ValidationError::EmptyInput("validity period").into());
        }

        let rule = self
            .issuer
            .catalog()
            .resolve(request.class, self.issuer.subject())?;
        validate_subject(&request.subject, &rule)?;

        let subject_alt_names = subject_alt_names(request);
        validate_subject_alt_names(&subject_alt_names, &rule)?;

        let now = now_seconds();
        if self.issuer.not_after() <= now {
            return Err(ValidationError::ValidityExceedsIssuer {
                requested_days: request.validity_days,
                remaining_days: self.issuer.remaining_days(now),
            }
            .into());
        }
        let not_after = match validity_end(now, request.validity_days) {
            Some(end) if end <= self.issuer.not_after() => end,
            requested => {
                debug!(
                    requested_days = request.validity_days,
                    requested_end = ?requested,
                    clamped = %self.issuer.not_after(),
                    "leaf validity clamped to issuer lifetime"
                );
                self.issuer.not_after()
            }
        };

        let mut extensions = policy_extensions(&rule);
        extensions.subject_alt_names = subject_alt_names;
        extensions.crl_distribution_point = self.distribution.crl_url.clone();
        extensions.ocsp_responder_url = self.distribution.ocsp_url.clone();

        let subject_key = request.subject.identity_key();
        let (certificate, record) = self.issuer.ledger().transact(|index| {
            if let Some(existing) = index.find_live_by_subject(&subject_key, now) {
                return Err(ValidationError::DuplicateSubject {
                    subject: request.subject.to_string(),
                    serial: existing.serial,
                }
                .into());
            }
            let template = CertificateTemplate {
                serial: index.allocate(),
                subject: request.subject.clone(),
                not_before: now,
                not_after,
                subject_public_key: key.public_key_der().to_vec(),
                extensions,
            };
            let certificate =
                self.provider
                    .sign(self.issuer.key(), self.issuer.certificate(), &template)?;
            let record = new_record(&certificate, &template, request.class)?;
            index.append(record.clone())?;
            Ok((certificate, record))
        })?;

        info!(
            serial = record.serial,
            class = %record.class,
            subject = %record.subject,
            not_after = %record.not_after,
            "certificate issued"
        );
        Ok(IssuedCertificate {
            certificate,
            record,
            chain: vec![
                self.issuer.certificate().clone(),
                self.root.certificate().clone(),
            ],
        })
    }
}

/// Server certificates carry `[fqdn, *.fqdn, extras...]`; other classes only the extras.
/// Duplicates (case-insensitive) are dropped, first occurrence wins.
fn subject_alt_names(request: &IssueRequest) -> Vec<String> {
    let mut names = Vec::new();
    if request.class == CertClass::Server {
        let fqdn = request.subject.cn().to_ascii_lowercase();
        names.push(format!("*.{}", fqdn));
        names.insert(0, fqdn);
    }
    names.extend(
        request
            .subject_alt_names
            .iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty()),
    );
    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use crate::error::CaError;
    use crate::hierarchy::{HierarchyOptions, TrustHierarchy};
    use crate::ledger::IndexStore;
    use crate::pki_generator::OpensslProvider;
    use crate::policy::CaLevel;
    use crate::storage::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<OpensslProvider>,
        engine: IssuanceEngine,
        intermediate: Arc<CaIdentity>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(OpensslProvider::new());
        let mut hierarchy = TrustHierarchy::open(
            provider.clone(),
            store.clone(),
            HierarchyOptions {
                key_algorithm: KeyAlgorithm::EcP256,
                ..HierarchyOptions::default()
            },
        )
        .unwrap();
        let base = DistinguishedName::with_common_name("Test Root")
            .organization("Acme")
            .country("US");
        hierarchy.bootstrap_root(&base, 365).unwrap();
        let mut intermediate_dn = base.clone();
        intermediate_dn.common_name = Some("Test Intermediate".to_string());
        hierarchy.bootstrap_intermediate(&intermediate_dn, 180).unwrap();
        let (root, intermediate) = hierarchy.operational().unwrap();
        let engine = IssuanceEngine::new(
            provider.clone(),
            root,
            intermediate.clone(),
            DistributionPoints {
                crl_url: Some("http://pki.example.com/intermediate.crl".to_string()),
                ocsp_url: Some("http://ocsp.example.com".to_string()),
            },
        );
        Fixture {
            store,
            provider,
            engine,
            intermediate,
        }
    }

    fn server_request(cn: &str, days: u32) -> IssueRequest {
        IssueRequest {
            class: CertClass::Server,
            subject: DistinguishedName::with_common_name(cn),
            subject_alt_names: vec![],
            validity_days: days,
        }
    }

    fn leaf_key(f: &Fixture) -> KeyPair {
        f.provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap()
    }

    #[test]
    fn server_certificate_gets_fqdn_and_wildcard() {
        let f = fixture();
        let mut request = server_request("app.example.com", 30);
        request.subject_alt_names = vec!["api.example.com".into(), "APP.example.com".into()];
        let issued = f.engine.issue(&request, &leaf_key(&f)).unwrap();

        let x509 = issued.certificate.to_x509().unwrap();
        let sans: Vec<String> = x509
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(
            sans,
            vec!["app.example.com", "*.app.example.com", "api.example.com"]
        );
        assert_eq!(issued.chain.len(), 2);
        assert!(f
            .provider
            .verify_chain(&issued.certificate, &issued.chain[..1], &issued.chain[1..])
            .unwrap());
    }

    #[test]
    fn validity_is_clamped_to_intermediate() {
        let f = fixture();
        let issued = f
            .engine
            .issue(&server_request("long.example.com", 3650), &leaf_key(&f))
            .unwrap();
        assert_eq!(issued.record.not_after, f.intermediate.not_after());
    }

    #[test]
    fn huge_validity_is_clamped_not_overflowed() {
        let f = fixture();
        let issued = f
            .engine
            .issue(&server_request("forever.example.com", u32::MAX), &leaf_key(&f))
            .unwrap();
        assert_eq!(issued.record.not_after, f.intermediate.not_after());
    }

    #[test]
    fn duplicate_live_subject_is_rejected_until_revoked() {
        let f = fixture();
        let first = f
            .engine
            .issue(&server_request("app.example.com", 30), &leaf_key(&f))
            .unwrap();
        let err = f
            .engine
            .issue(&server_request("App.Example.com", 30), &leaf_key(&f))
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::Validation(ValidationError::DuplicateSubject { serial, .. }) if serial == first.record.serial
        ));

        f.intermediate
            .ledger()
            .transact(|index| {
                index.revoke(
                    first.record.serial,
                    crate::serial_index::RevocationReason::Superseded,
                    now_seconds(),
                )?;
                Ok(())
            })
            .unwrap();
        let second = f
            .engine
            .issue(&server_request("app.example.com", 30), &leaf_key(&f))
            .unwrap();
        assert!(second.record.serial > first.record.serial);
    }

    #[test]
    fn failed_save_consumes_no_serial() {
        let f = fixture();
        let before = f.intermediate.ledger().snapshot();
        f.store.memory_index(CaLevel::Intermediate).set_fail_saves(true);
        assert!(matches!(
            f.engine
                .issue(&server_request("app.example.com", 30), &leaf_key(&f)),
            Err(CaError::Storage { .. })
        ));
        f.store.memory_index(CaLevel::Intermediate).set_fail_saves(false);

        let after = f.intermediate.ledger().snapshot();
        assert_eq!(after.len(), before.len());
        let issued = f
            .engine
            .issue(&server_request("app.example.com", 30), &leaf_key(&f))
            .unwrap();
        assert_eq!(issued.record.serial, before.next_serial());
        let persisted = f
            .store
            .memory_index(CaLevel::Intermediate)
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn ca_classes_are_not_issued_here() {
        let f = fixture();
        let mut request = server_request("sub-ca", 30);
        request.class = CertClass::Intermediate;
        assert!(matches!(
            f.engine.issue(&request, &leaf_key(&f)),
            Err(CaError::Validation(ValidationError::UnsupportedClass(CertClass::Intermediate)))
        ));
    }

    #[test]
    fn user_certificate_keeps_only_extra_names() {
        let f = fixture();
        let request = IssueRequest {
            class: CertClass::User,
            subject: DistinguishedName::with_common_name("alice").email("alice@example.com"),
            subject_alt_names: vec![],
            validity_days: 30,
        };
        let issued = f.engine.issue(&request, &leaf_key(&f)).unwrap();
        assert!(issued.certificate.to_x509().unwrap().subject_alt_names().is_none());
        assert_eq!(issued.record.class, CertClass::User);
    }

    #[test]
    fn nameless_subject_fails_before_signing() {
        let f = fixture();
        let request = IssueRequest {
            class: CertClass::User,
            subject: DistinguishedName::default(),
            subject_alt_names: vec![],
            validity_days: 30,
        };
        assert!(matches!(
            f.engine.issue(&request, &leaf_key(&f)),
            Err(CaError::Validation(ValidationError::MissingRequiredField { .. }))
        ));
        assert!(f.intermediate.ledger().snapshot().is_empty());
    }
}
