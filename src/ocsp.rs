//! OCSP responder (RFC 6960)
//!
//! Status always comes from the issuer's committed ledger, the same records the CRL is
//! compiled from, so OCSP and CRL can never disagree about a serial. Responses are
//! `BasicOCSPResponse`s signed by a delegated signer the intermediate issued under the
//! `ocspSigner` class; the signer certificate is embedded and the responder is identified
//! by key hash.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use der::asn1::{Any, BitString, GeneralizedTime, Null, ObjectIdentifier, OctetString};
use der::{Choice, Decode, Encode, Enumerated, Sequence};
use serde::{Deserialize, Serialize};
use spki::AlgorithmIdentifierOwned;
use tracing::{debug, info, warn};
use x509_cert::ext::{Extension, Extensions};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Version;

use crate::crl::{serial_number, signature_algorithm_identifier};
use crate::crypto::{serial_to_u64, Certificate, CryptoProvider, DigestAlgorithm, KeyPair};
use crate::error::{CryptoError, Result, StateError};
use crate::hierarchy::{now_seconds, CaIdentity};
use crate::policy::CertClass;
use crate::serial_index::{RecordStatus, RevocationReason, SerialIndex};
use crate::storage::StoredIdentity;

const OID_PKIX_OCSP_BASIC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1.1");
const OID_PKIX_OCSP_NONCE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1.2");

/// Encoded `OCSPResponse { responseStatus internalError }`
const INTERNAL_ERROR_RESPONSE: [u8; 5] = [0x30, 0x03, 0x0a, 0x01, 0x02];

pub const DEFAULT_NEXT_UPDATE_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// ASN.1 structures
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OcspRequest {
    pub tbs_request: TbsRequest,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub optional_signature: Option<Any>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TbsRequest {
    #[asn1(context_specific = "0", default = "Default::default", tag_mode = "EXPLICIT")]
    pub version: Version,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    pub requestor_name: Option<Any>,
    pub request_list: Vec<Request>,
    #[asn1(context_specific = "2", optional = "true", tag_mode = "EXPLICIT")]
    pub request_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Request {
    pub req_cert: CertId,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub single_request_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertId {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub issuer_name_hash: OctetString,
    pub issuer_key_hash: OctetString,
    pub serial_number: SerialNumber,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Enumerated)]
#[repr(u32)]
pub enum OcspResponseStatus {
    Successful = 0,
    MalformedRequest = 1,
    InternalError = 2,
    TryLater = 3,
    SigRequired = 5,
    Unauthorized = 6,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OcspResponse {
    pub response_status: OcspResponseStatus,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub response_bytes: Option<ResponseBytes>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseBytes {
    pub response_type: ObjectIdentifier,
    pub response: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct BasicOcspResponse {
    pub tbs_response_data: ResponseData,
    pub signature_algorithm: AlgorithmIdentifierOwned,
    pub signature: BitString,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub certs: Option<Vec<x509_cert::Certificate>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseData {
    #[asn1(context_specific = "0", default = "Default::default", tag_mode = "EXPLICIT")]
    pub version: Version,
    pub responder_id: ResponderId,
    pub produced_at: GeneralizedTime,
    pub responses: Vec<SingleResponse>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    pub response_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum ResponderId {
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", constructed = "true")]
    ByName(Name),
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", constructed = "true")]
    ByKey(OctetString),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SingleResponse {
    pub cert_id: CertId,
    pub cert_status: CertStatus,
    pub this_update: GeneralizedTime,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub next_update: Option<GeneralizedTime>,
    #[asn1(context_specific = "1", optional = "true", tag_mode = "EXPLICIT")]
    pub single_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum CertStatus {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    Good(Null),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", constructed = "true")]
    Revoked(RevokedInfo),
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT")]
    Unknown(Null),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct RevokedInfo {
    pub revocation_time: GeneralizedTime,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub revocation_reason: Option<CrlReason>,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Enumerated)]
#[repr(u32)]
pub enum CrlReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CaCompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    RemoveFromCrl = 8,
    PrivilegeWithdrawn = 9,
    AaCompromise = 10,
}

impl From<RevocationReason> for CrlReason {
    fn from(reason: RevocationReason) -> Self {
        match reason {
            RevocationReason::Unspecified => CrlReason::Unspecified,
            RevocationReason::KeyCompromise => CrlReason::KeyCompromise,
            RevocationReason::CaCompromise => CrlReason::CaCompromise,
            RevocationReason::AffiliationChanged => CrlReason::AffiliationChanged,
            RevocationReason::Superseded => CrlReason::Superseded,
            RevocationReason::CessationOfOperation => CrlReason::CessationOfOperation,
            RevocationReason::CertificateHold => CrlReason::CertificateHold,
            RevocationReason::RemoveFromCrl => CrlReason::RemoveFromCrl,
            RevocationReason::PrivilegeWithdrawn => CrlReason::PrivilegeWithdrawn,
            RevocationReason::AaCompromise => CrlReason::AaCompromise,
        }
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Key and certificate of the delegated OCSP signer
#[derive(Debug, Clone)]
pub struct OcspSignerIdentity {
    pub key: KeyPair,
    pub certificate: Certificate,
}

impl From<StoredIdentity> for OcspSignerIdentity {
    fn from(stored: StoredIdentity) -> Self {
        Self {
            key: stored.key,
            certificate: stored.certificate,
        }
    }
}

impl From<&OcspSignerIdentity> for StoredIdentity {
    fn from(signer: &OcspSignerIdentity) -> Self {
        Self {
            key: signer.key.clone(),
            certificate: signer.certificate.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OcspStatus {
    Good,
    Revoked {
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    },
    Unknown,
}

/// Status of `serial` as recorded in `index`
pub fn status_in(index: &SerialIndex, serial: u64) -> OcspStatus {
    match index.get(serial) {
        None => OcspStatus::Unknown,
        Some(record) => match (record.status, record.revoked_at) {
            (RecordStatus::Revoked, Some(revoked_at)) => OcspStatus::Revoked {
                revoked_at,
                reason: record
                    .revocation_reason
                    .unwrap_or(RevocationReason::Unspecified),
            },
            _ => OcspStatus::Good,
        },
    }
}

/// Issuer name/key hashes for one digest, used to recognise our CertIDs
struct IssuerHashes {
    algorithm: DigestAlgorithm,
    name_hash: Vec<u8>,
    key_hash: Vec<u8>,
}

pub struct OcspResponder {
    provider: Arc<dyn CryptoProvider>,
    issuer: Arc<CaIdentity>,
    signer: OcspSignerIdentity,
    signer_cert: x509_cert::Certificate,
    responder_key_hash: Vec<u8>,
    issuer_hashes: Vec<IssuerHashes>,
    next_update: Duration,
}

/// Why a signer cannot be used, or `None` if it can
pub(crate) fn signer_problem(
    issuer: &CaIdentity,
    signer: &Certificate,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let serial = signer.serial()?;
    let (not_before, not_after) = signer.validity()?;
    let parsed = signer.parsed()?;
    let issuer_name = issuer.certificate().parsed()?.tbs_certificate.subject;

    let problem = if parsed.tbs_certificate.issuer != issuer_name {
        Some(format!("signer {} was not issued by {}", serial, issuer.subject()))
    } else if not_before > now {
        Some(format!("signer {} is not valid until {}", serial, not_before))
    } else if not_after <= now {
        Some(format!("signer {} expired at {}", serial, not_after))
    } else {
        match issuer.ledger().snapshot().get(serial) {
            None => Some(format!("signer {} is not in the {} ledger", serial, issuer.level())),
            Some(record) if record.class != CertClass::OcspSigner => Some(format!(
                "serial {} is a {} certificate, not an OCSP signer",
                serial, record.class
            )),
            Some(record) if record.status == RecordStatus::Revoked => {
                Some(format!("signer {} is revoked", serial))
            }
            Some(_) => None,
        }
    };
    Ok(problem)
}

impl OcspResponder {
    /// Bind a signer to the issuing CA; fails with `SignerUnusable` if the signer
    /// is revoked, expired, not yet valid or foreign to this CA
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        issuer: Arc<CaIdentity>,
        signer: OcspSignerIdentity,
    ) -> Result<Self> {
        if let Some(problem) = signer_problem(&issuer, &signer.certificate, Utc::now())? {
            return Err(StateError::SignerUnusable(problem).into());
        }

        let signer_cert = signer.certificate.parsed()?;
        let responder_key_hash = provider.digest(
            DigestAlgorithm::Sha1,
            signer_cert
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .raw_bytes(),
        )?;

        let issuer_cert = issuer.certificate().parsed()?;
        let issuer_name_der = issuer_cert
            .tbs_certificate
            .subject
            .to_der()
            .map_err(|e| CryptoError::new("encode issuer name", e))?;
        let issuer_key_bits = issuer_cert
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes();
        let issuer_hashes = [DigestAlgorithm::Sha1, DigestAlgorithm::Sha256]
            .into_iter()
            .map(|algorithm| -> Result<IssuerHashes, CryptoError> {
                Ok(IssuerHashes {
                    algorithm,
                    name_hash: provider.digest(algorithm, &issuer_name_der)?,
                    key_hash: provider.digest(algorithm, issuer_key_bits)?,
                })
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;

        Ok(Self {
            provider,
            issuer,
            signer,
            signer_cert,
            responder_key_hash,
            issuer_hashes,
            next_update: Duration::hours(DEFAULT_NEXT_UPDATE_HOURS),
        })
    }

    /// Window advertised as `nextUpdate` in each single response
    pub fn with_next_update(mut self, next_update: Duration) -> Self {
        self.next_update = next_update;
        self
    }

    pub fn signer(&self) -> &OcspSignerIdentity {
        &self.signer
    }

    /// Status of `serial` in the committed ledger
    pub fn query(&self, serial: u64) -> OcspStatus {
        status_in(&self.issuer.ledger().snapshot(), serial)
    }

    /// Answer a DER `OCSPRequest` with a DER `OCSPResponse`
    ///
    /// Undecodable or empty requests get `malformedRequest`; failures while signing, including
    /// a signer revoked or expired since the responder was built, get `internalError`.
    /// This never fails outright, an HTTP front end can always reply.
    pub fn respond(&self, request_der: &[u8]) -> Vec<u8> {
        let request = match OcspRequest::from_der(request_der) {
            Ok(request) if !request.tbs_request.request_list.is_empty() => request,
            Ok(_) => {
                debug!("OCSP request without entries");
                return status_only(OcspResponseStatus::MalformedRequest);
            }
            Err(e) => {
                debug!(error = %e, "malformed OCSP request");
                return status_only(OcspResponseStatus::MalformedRequest);
            }
        };

        let cert_ids: Vec<CertId> = request
            .tbs_request
            .request_list
            .into_iter()
            .map(|r| r.req_cert)
            .collect();
        let nonce = request
            .tbs_request
            .request_extensions
            .and_then(|exts| exts.into_iter().find(|e| e.extn_id == OID_PKIX_OCSP_NONCE));

        match self.sign_response(cert_ids, nonce) {
            Ok(der) => der,
            Err(e) => {
                warn!(error = %e, "failed to build OCSP response");
                status_only(OcspResponseStatus::InternalError)
            }
        }
    }

    /// Signed response for one of our serials, identified with a SHA-1 CertID
    pub fn signed_status(&self, serial: u64) -> Result<Vec<u8>> {
        let hashes = self
            .issuer_hashes
            .iter()
            .find(|h| h.algorithm == DigestAlgorithm::Sha1)
            .ok_or_else(|| CryptoError::new("build CertID", "no SHA-1 issuer hashes"))?;
        let cert_id = CertId {
            hash_algorithm: digest_algorithm_identifier(hashes.algorithm)?,
            issuer_name_hash: octets(hashes.name_hash.clone())?,
            issuer_key_hash: octets(hashes.key_hash.clone())?,
            serial_number: serial_number(serial)?,
        };
        self.sign_response(vec![cert_id], None)
    }

    /// Serial named by `cert_id`, if the CertID refers to our issuer
    fn our_serial(&self, cert_id: &CertId) -> Option<u64> {
        let algorithm = DigestAlgorithm::from_oid(&cert_id.hash_algorithm.oid.to_string())?;
        let hashes = self.issuer_hashes.iter().find(|h| h.algorithm == algorithm)?;
        if cert_id.issuer_name_hash.as_bytes() != hashes.name_hash.as_slice()
            || cert_id.issuer_key_hash.as_bytes() != hashes.key_hash.as_slice()
        {
            return None;
        }
        serial_to_u64(cert_id.serial_number.as_bytes())
    }

    fn sign_response(&self, cert_ids: Vec<CertId>, nonce: Option<Extension>) -> Result<Vec<u8>> {
        let fail = |e: der::Error| CryptoError::new("encode OCSP response", e);
        let now = now_seconds();
        if let Some(problem) = signer_problem(&self.issuer, &self.signer.certificate, now)? {
            warn!(%problem, "refusing to sign with the current OCSP signer");
            return Err(StateError::SignerUnusable(problem).into());
        }
        let this_update = generalized_time(now)?;
        let next_update = now
            .checked_add_signed(self.next_update)
            .ok_or_else(|| CryptoError::new("compute OCSP nextUpdate", "date out of range"))?;
        let next_update = generalized_time(next_update)?;

        let mut responses = Vec::with_capacity(cert_ids.len());
        for cert_id in cert_ids {
            let status = match self.our_serial(&cert_id) {
                Some(serial) => self.query(serial),
                None => OcspStatus::Unknown,
            };
            let cert_status = match status {
                OcspStatus::Good => CertStatus::Good(Null),
                OcspStatus::Unknown => CertStatus::Unknown(Null),
                OcspStatus::Revoked { revoked_at, reason } => CertStatus::Revoked(RevokedInfo {
                    revocation_time: generalized_time(revoked_at)?,
                    revocation_reason: Some(reason.into()),
                }),
            };
            debug!(status = ?status, "OCSP status resolved");
            responses.push(SingleResponse {
                cert_id,
                cert_status,
                this_update,
                next_update: Some(next_update),
                single_extensions: None,
            });
        }

        let response_count = responses.len();
        let tbs_response_data = ResponseData {
            version: Version::V1,
            responder_id: ResponderId::ByKey(octets(self.responder_key_hash.clone())?),
            produced_at: this_update,
            responses,
            response_extensions: nonce.map(|n| vec![n]),
        };
        let tbs_der = tbs_response_data.to_der().map_err(fail)?;
        let signature = self.provider.sign_data(&self.signer.key, &tbs_der)?;

        let basic = BasicOcspResponse {
            tbs_response_data,
            signature_algorithm: signature_algorithm_identifier(signature.algorithm)?,
            signature: BitString::from_bytes(&signature.value).map_err(fail)?,
            certs: Some(vec![self.signer_cert.clone()]),
        };
        let response = OcspResponse {
            response_status: OcspResponseStatus::Successful,
            response_bytes: Some(ResponseBytes {
                response_type: OID_PKIX_OCSP_BASIC,
                response: OctetString::new(basic.to_der().map_err(fail)?).map_err(fail)?,
            }),
        };
        info!(
            responses = response_count,
            issuer = %self.issuer.subject(),
            "OCSP response signed"
        );
        Ok(response.to_der().map_err(fail)?)
    }
}

fn status_only(status: OcspResponseStatus) -> Vec<u8> {
    OcspResponse {
        response_status: status,
        response_bytes: None,
    }
    .to_der()
    .unwrap_or_else(|_| INTERNAL_ERROR_RESPONSE.to_vec())
}

fn octets(bytes: Vec<u8>) -> Result<OctetString, CryptoError> {
    OctetString::new(bytes).map_err(|e| CryptoError::new("encode OCTET STRING", e))
}

fn generalized_time(at: DateTime<Utc>) -> Result<GeneralizedTime, CryptoError> {
    let secs = u64::try_from(at.timestamp())
        .map_err(|_| CryptoError::new("encode time", "time before 1970"))?;
    GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(secs))
        .map_err(|e| CryptoError::new("encode time", e))
}

fn digest_algorithm_identifier(algorithm: DigestAlgorithm) -> Result<AlgorithmIdentifierOwned, CryptoError> {
    let oid = ObjectIdentifier::new(algorithm.oid())
        .map_err(|e| CryptoError::new("encode digest algorithm", e))?;
    Ok(AlgorithmIdentifierOwned {
        oid,
        parameters: Some(Any::null()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_response_is_minimal() {
        assert_eq!(
            status_only(OcspResponseStatus::MalformedRequest),
            vec![0x30, 0x03, 0x0a, 0x01, 0x01]
        );
        assert_eq!(
            status_only(OcspResponseStatus::InternalError),
            INTERNAL_ERROR_RESPONSE.to_vec()
        );
    }

    #[test]
    fn cert_status_tags() {
        assert_eq!(CertStatus::Good(Null).to_der().unwrap(), vec![0x80, 0x00]);
        assert_eq!(CertStatus::Unknown(Null).to_der().unwrap(), vec![0x82, 0x00]);
    }

    #[test]
    fn responder_id_by_key_is_explicit() {
        let id = ResponderId::ByKey(OctetString::new(vec![0xab; 20]).unwrap());
        let der = id.to_der().unwrap();
        assert_eq!(&der[..4], &[0xa2, 22, 0x04, 20]);
    }

    #[test]
    fn reason_codes_line_up() {
        for code in [0u8, 1, 2, 3, 4, 5, 6, 8, 9, 10] {
            let reason = RevocationReason::from_code(code).unwrap();
            assert_eq!(CrlReason::from(reason) as u32, u32::from(code));
        }
    }
}
