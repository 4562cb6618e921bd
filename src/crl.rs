//! CRL compilation (RFC 5280 section 5)
//!
//! Every publication is a full rebuild from the issuer's revoked records. The CRL number
//! is consumed and the list signed inside one ledger transaction, so a failed signature
//! leaves the counter where it was.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use der::asn1::{Any, BitString, GeneralizedTime, ObjectIdentifier, OctetString, UtcTime};
use der::Encode;
use serde::Serialize;
use spki::AlgorithmIdentifierOwned;
use tracing::info;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::AuthorityKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;
use x509_cert::Version;

use crate::crypto::{u64_to_serial_bytes, Certificate, CryptoProvider, DigestAlgorithm, Signature};
use crate::error::{CryptoError, Result};
use crate::hierarchy::{now_seconds, CaIdentity};
use crate::policy::CaLevel;
use crate::serial_index::{RevocationReason, SerialRecord};

pub const DEFAULT_CRL_VALIDITY_DAYS: u32 = 30;

const OID_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
const OID_CRL_REASON: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");
const OID_AUTHORITY_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.35");

/// UTCTime cannot express 2050 or later
const UTC_TIME_LIMIT_SECS: i64 = 2_524_608_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrlEntry {
    pub serial: u64,
    pub revoked_at: DateTime<Utc>,
    pub reason: RevocationReason,
}

impl CrlEntry {
    fn from_record(record: &SerialRecord) -> Option<Self> {
        Some(Self {
            serial: record.serial,
            revoked_at: record.revoked_at?,
            reason: record.revocation_reason.unwrap_or(RevocationReason::Unspecified),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CrlArtifact {
    pub issuer_level: CaLevel,
    pub crl_number: u64,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub entries: Vec<CrlEntry>,
    pub der: Vec<u8>,
}

impl CrlArtifact {
    pub fn to_pem(&self) -> Result<String> {
        let pem = openssl::x509::X509Crl::from_der(&self.der)
            .and_then(|crl| crl.to_pem())
            .map_err(|e| CryptoError::new("encode CRL PEM", e))?;
        String::from_utf8(pem).map_err(|e| CryptoError::new("encode CRL PEM", e).into())
    }
}

pub struct CrlPublisher {
    provider: Arc<dyn CryptoProvider>,
    issuer: Arc<CaIdentity>,
    validity_days: u32,
}

impl CrlPublisher {
    pub fn new(provider: Arc<dyn CryptoProvider>, issuer: Arc<CaIdentity>, validity_days: u32) -> Self {
        Self {
            provider,
            issuer,
            validity_days,
        }
    }

    /// Build and sign a fresh CRL covering every revoked record of the issuer
    pub fn publish(&self) -> Result<CrlArtifact> {
        let this_update = now_seconds();
        let next_update = this_update
            .checked_add_signed(Duration::days(i64::from(self.validity_days)))
            .ok_or_else(|| CryptoError::new("compute CRL nextUpdate", "date out of range"))?;

        let artifact = self.issuer.ledger().transact(|index| {
            let crl_number = index.next_crl_number();
            let entries: Vec<CrlEntry> = index.revoked().filter_map(CrlEntry::from_record).collect();
            let der = self.encode(crl_number, this_update, next_update, &entries)?;
            Ok(CrlArtifact {
                issuer_level: self.issuer.level(),
                crl_number,
                this_update,
                next_update,
                entries,
                der,
            })
        })?;

        info!(
            level = %artifact.issuer_level,
            crl_number = artifact.crl_number,
            entries = artifact.entries.len(),
            next_update = %artifact.next_update,
            "CRL published"
        );
        Ok(artifact)
    }

    fn encode(
        &self,
        crl_number: u64,
        this_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
        entries: &[CrlEntry],
    ) -> Result<Vec<u8>> {
        let fail = |e: der::Error| CryptoError::new("encode CRL", e);
        let issuer_cert = self.issuer.certificate().parsed()?;
        let algorithm = signature_algorithm_identifier(self.issuer.key().algorithm().signature_algorithm())?;

        let revoked = entries
            .iter()
            .map(|entry| -> Result<RevokedCert> {
                Ok(RevokedCert {
                    serial_number: serial_number(entry.serial)?,
                    revocation_date: asn1_time(entry.revoked_at)?,
                    crl_entry_extensions: Some(vec![Extension {
                        extn_id: OID_CRL_REASON,
                        critical: false,
                        // ENUMERATED, single content octet
                        extn_value: OctetString::new(vec![0x0a, 0x01, entry.reason.code()])
                            .map_err(fail)?,
                    }]),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let key_id = authority_key_id(self.provider.as_ref(), self.issuer.certificate())?;
        let aki = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(key_id).map_err(fail)?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };
        let crl_extensions = vec![
            Extension {
                extn_id: OID_AUTHORITY_KEY_ID,
                critical: false,
                extn_value: OctetString::new(aki.to_der().map_err(fail)?).map_err(fail)?,
            },
            Extension {
                extn_id: OID_CRL_NUMBER,
                critical: false,
                extn_value: OctetString::new(serial_number(crl_number)?.to_der().map_err(fail)?)
                    .map_err(fail)?,
            },
        ];

        let tbs_cert_list = TbsCertList {
            version: Version::V2,
            signature: algorithm.clone(),
            issuer: issuer_cert.tbs_certificate.subject,
            this_update: asn1_time(this_update)?,
            next_update: Some(asn1_time(next_update)?),
            revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
            crl_extensions: Some(crl_extensions),
        };

        let tbs_der = tbs_cert_list.to_der().map_err(fail)?;
        let Signature { value, .. } = self.provider.sign_data(self.issuer.key(), &tbs_der)?;
        let crl = CertificateList {
            tbs_cert_list,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&value).map_err(fail)?,
        };
        Ok(crl.to_der().map_err(fail)?)
    }
}

pub(crate) fn signature_algorithm_identifier(
    algorithm: crate::crypto::SignatureAlgorithm,
) -> Result<AlgorithmIdentifierOwned, CryptoError> {
    let oid = ObjectIdentifier::new(algorithm.oid())
        .map_err(|e| CryptoError::new("encode signature algorithm", e))?;
    Ok(AlgorithmIdentifierOwned {
        oid,
        parameters: algorithm.has_null_parameters().then(Any::null),
    })
}

pub(crate) fn serial_number(serial: u64) -> Result<SerialNumber, CryptoError> {
    SerialNumber::new(&u64_to_serial_bytes(serial))
        .map_err(|e| CryptoError::new("encode serial number", e))
}

/// SHA-1 over the subjectPublicKey BIT STRING, as OpenSSL computes key identifiers
pub(crate) fn authority_key_id(
    provider: &dyn CryptoProvider,
    issuer: &Certificate,
) -> Result<Vec<u8>, CryptoError> {
    let parsed = issuer.parsed()?;
    provider.digest(
        DigestAlgorithm::Sha1,
        parsed
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )
}

/// UTCTime through 2049, GeneralizedTime afterwards
pub(crate) fn asn1_time(at: DateTime<Utc>) -> Result<Time, CryptoError> {
    let secs = u64::try_from(at.timestamp())
        .map_err(|_| CryptoError::new("encode time", "time before 1970"))?;
    let duration = StdDuration::from_secs(secs);
    let time = if at.timestamp() < UTC_TIME_LIMIT_SECS {
        UtcTime::from_unix_duration(duration).map(Time::UtcTime)
    } else {
        GeneralizedTime::from_unix_duration(duration).map(Time::GeneralTime)
    };
    time.map_err(|e| CryptoError::new("encode time", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use crate::dn::DistinguishedName;
    use crate::hierarchy::{HierarchyOptions, TrustHierarchy};
    use crate::pki_generator::OpensslProvider;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use openssl::x509::X509Crl;

    fn root_only(algorithm: KeyAlgorithm) -> (Arc<OpensslProvider>, Arc<CaIdentity>) {
        let provider = Arc::new(OpensslProvider::new());
        let mut hierarchy = TrustHierarchy::open(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            HierarchyOptions {
                key_algorithm: algorithm,
                ..HierarchyOptions::default()
            },
        )
        .unwrap();
        let root = hierarchy
            .bootstrap_root(&DistinguishedName::with_common_name("CRL Root"), 30)
            .unwrap();
        (provider, root)
    }

    #[test]
    fn empty_crl_verifies_with_openssl() {
        let (provider, root) = root_only(KeyAlgorithm::EcP256);
        let artifact = CrlPublisher::new(provider, root.clone(), DEFAULT_CRL_VALIDITY_DAYS)
            .publish()
            .unwrap();
        assert_eq!(artifact.crl_number, 1);
        assert!(artifact.entries.is_empty());

        let crl = X509Crl::from_der(&artifact.der).unwrap();
        let issuer_key = root.certificate().to_x509().unwrap().public_key().unwrap();
        assert!(crl.verify(&issuer_key).unwrap());
        assert!(crl.get_revoked().is_none());
        assert!(artifact.to_pem().unwrap().starts_with("-----BEGIN X509 CRL-----"));
    }

    #[test]
    fn revoked_entries_carry_serial_and_reason() {
        let (provider, root) = root_only(KeyAlgorithm::Rsa { bits: 2048 });
        let root_serial = root.ledger().snapshot().records().next().unwrap().serial;
        let revoked_at = now_seconds();
        root.ledger()
            .transact(|index| {
                index.revoke(root_serial, RevocationReason::CaCompromise, revoked_at)?;
                Ok(())
            })
            .unwrap();

        let publisher = CrlPublisher::new(provider, root.clone(), 7);
        let first = publisher.publish().unwrap();
        let second = publisher.publish().unwrap();
        assert!(second.crl_number > first.crl_number);
        assert_eq!(first.entries, second.entries);
        assert_eq!(
            first.entries,
            vec![CrlEntry {
                serial: root_serial,
                revoked_at,
                reason: RevocationReason::CaCompromise
            }]
        );

        let crl = X509Crl::from_der(&second.der).unwrap();
        let issuer_key = root.certificate().to_x509().unwrap().public_key().unwrap();
        assert!(crl.verify(&issuer_key).unwrap());
        let revoked = crl.get_revoked().unwrap();
        assert_eq!(revoked.len(), 1);
        let serial = revoked
            .get(0)
            .unwrap()
            .serial_number()
            .to_bn()
            .unwrap()
            .to_dec_str()
            .unwrap()
            .to_string();
        assert_eq!(serial, root_serial.to_string());
    }

    #[test]
    fn far_future_times_use_generalized_time() {
        let before = Utc.with_ymd_and_hms(2049, 12, 31, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(asn1_time(before).unwrap(), Time::UtcTime(_)));
        assert!(matches!(asn1_time(after).unwrap(), Time::GeneralTime(_)));
    }
}
