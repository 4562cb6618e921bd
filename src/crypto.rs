//! Cryptographic collaborator interface
//!
//! The engine never implements key generation, signing or chain verification itself.
//! It describes what it wants signed with a [`CertificateTemplate`] and hands it to a
//! [`CryptoProvider`]. The production implementation is
//! [`OpensslProvider`](crate::pki_generator::OpensslProvider).

use std::fmt;

use chrono::{DateTime, Utc};
use openssl::pkey::{Id, PKey, Private};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};

use crate::dn::DistinguishedName;
use crate::error::CryptoError;
use crate::policy::{BasicConstraintsRule, ExtendedKeyUsage, KeyUsageFlag};
use crate::secure_key::SecureKey;

/// Asymmetric key families the authority can generate and sign with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    /// NIST P-256 (prime256v1)
    EcP256,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa { bits: 4096 }
    }
}

impl KeyAlgorithm {
    /// Signature scheme used when this key signs
    pub fn signature_algorithm(self) -> SignatureAlgorithm {
        match self {
            KeyAlgorithm::Rsa { .. } => SignatureAlgorithm::Sha256WithRsa,
            KeyAlgorithm::EcP256 => SignatureAlgorithm::EcdsaWithSha256,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeyAlgorithm::EcP256 => write!(f, "EC P-256"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    EcdsaWithSha256,
}

impl SignatureAlgorithm {
    pub fn oid(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256WithRsa => "1.2.840.113549.1.1.11",
            SignatureAlgorithm::EcdsaWithSha256 => "1.2.840.10045.4.3.2",
        }
    }

    /// RSA algorithm identifiers carry an explicit NULL parameter, ECDSA ones none
    pub fn has_null_parameters(self) -> bool {
        matches!(self, SignatureAlgorithm::Sha256WithRsa)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn oid(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "1.3.14.3.2.26",
            DigestAlgorithm::Sha256 => "2.16.840.1.101.3.4.2.1",
        }
    }

    pub fn from_oid(oid: &str) -> Option<Self> {
        [DigestAlgorithm::Sha1, DigestAlgorithm::Sha256]
            .into_iter()
            .find(|d| d.oid() == oid)
    }
}

/// A private key plus its public SubjectPublicKeyInfo
#[derive(Clone)]
pub struct KeyPair {
    algorithm: KeyAlgorithm,
    public_key_der: Vec<u8>,
    private_key: SecureKey,
}

impl KeyPair {
    pub fn new(algorithm: KeyAlgorithm, public_key_der: Vec<u8>, private_key: SecureKey) -> Self {
        Self {
            algorithm,
            public_key_der,
            private_key,
        }
    }

    /// Rebuild a key pair from a loaded OpenSSL key, detecting its algorithm
    pub fn from_pkey(pkey: &PKey<Private>) -> Result<Self, CryptoError> {
        let algorithm = match pkey.id() {
            Id::RSA => KeyAlgorithm::Rsa { bits: pkey.bits() },
            Id::EC => KeyAlgorithm::EcP256,
            other => {
                return Err(CryptoError::new(
                    "load private key",
                    format!("unsupported key type {:?}", other),
                ))
            }
        };
        let public_key_der = pkey
            .public_key_to_der()
            .map_err(|e| CryptoError::new("encode public key", e))?;
        Ok(Self::new(algorithm, public_key_der, SecureKey::from_pkey(pkey)?))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// DER-encoded SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    pub fn private_key(&self) -> &SecureKey {
        &self.private_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// A DER-encoded X.509 certificate
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Result<Self, CryptoError> {
        X509::from_der(&der).map_err(|e| CryptoError::new("parse certificate", e))?;
        Ok(Self { der })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, CryptoError> {
        let x509 = X509::from_pem(pem).map_err(|e| CryptoError::new("parse certificate PEM", e))?;
        Self::from_x509(&x509)
    }

    pub fn from_x509(x509: &X509) -> Result<Self, CryptoError> {
        let der = x509
            .to_der()
            .map_err(|e| CryptoError::new("encode certificate", e))?;
        Ok(Self { der })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_x509(&self) -> Result<X509, CryptoError> {
        X509::from_der(&self.der).map_err(|e| CryptoError::new("parse certificate", e))
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        let pem = self
            .to_x509()?
            .to_pem()
            .map_err(|e| CryptoError::new("encode certificate PEM", e))?;
        String::from_utf8(pem).map_err(|e| CryptoError::new("encode certificate PEM", e))
    }

    /// RustCrypto view of the certificate, used for DER-level field access
    pub fn parsed(&self) -> Result<x509_cert::Certificate, CryptoError> {
        use der::Decode;
        x509_cert::Certificate::from_der(&self.der)
            .map_err(|e| CryptoError::new("decode certificate structure", e))
    }

    /// `(notBefore, notAfter)` of the certificate
    pub fn validity(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), CryptoError> {
        let validity = self.parsed()?.tbs_certificate.validity;
        Ok((
            unix_to_datetime(validity.not_before.to_unix_duration().as_secs())?,
            unix_to_datetime(validity.not_after.to_unix_duration().as_secs())?,
        ))
    }

    pub fn serial(&self) -> Result<u64, CryptoError> {
        let parsed = self.parsed()?;
        serial_to_u64(parsed.tbs_certificate.serial_number.as_bytes())
            .ok_or_else(|| CryptoError::new("read serial number", "serial does not fit in 64 bits"))
    }

    /// Hex SHA-256 over the DER encoding
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        Sha256::digest(&self.der)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn unix_to_datetime(secs: u64) -> Result<DateTime<Utc>, CryptoError> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CryptoError::new("read certificate validity", "time out of range"))
}

/// Interpret DER INTEGER content octets as an unsigned serial
pub(crate) fn serial_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.first().map_or(false, |b| b & 0x80 != 0) {
        return None;
    }
    let significant: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.len() > 8 {
        return None;
    }
    Some(significant.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// DER INTEGER content octets for an unsigned serial (minimal, positive)
pub(crate) fn u64_to_serial_bytes(serial: u64) -> Vec<u8> {
    let mut bytes: Vec<u8> = serial
        .to_be_bytes()
        .into_iter()
        .skip_while(|b| *b == 0)
        .collect();
    if bytes.first().map_or(true, |b| b & 0x80 != 0) {
        bytes.insert(0, 0);
    }
    bytes
}

/// X.509 v3 extensions to place in a certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateExtensions {
    pub basic_constraints: Option<BasicConstraintsRule>,
    pub key_usage: Vec<KeyUsageFlag>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub subject_alt_names: Vec<String>,
    pub crl_distribution_point: Option<String>,
    pub ocsp_responder_url: Option<String>,
}

/// Everything the signer needs to produce a certificate body
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub serial: u64,
    pub subject: DistinguishedName,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DER SubjectPublicKeyInfo of the subject key
    pub subject_public_key: Vec<u8>,
    pub extensions: CertificateExtensions,
}

/// A detached signature plus the scheme that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: SignatureAlgorithm,
    pub value: Vec<u8>,
}

/// Proof-of-possession request (PKCS#10) as verified by the signer
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub subject: DistinguishedName,
    pub public_key_der: Vec<u8>,
}

pub trait CryptoProvider: Send + Sync {
    fn generate_key_pair(&self, algorithm: KeyAlgorithm) -> Result<KeyPair, CryptoError>;

    /// Sign `template` with its own key; issuer equals subject
    fn self_sign(&self, key: &KeyPair, template: &CertificateTemplate) -> Result<Certificate, CryptoError>;

    /// Sign `template` as `issuer_cert` using `issuer_key`
    fn sign(
        &self,
        issuer_key: &KeyPair,
        issuer_cert: &Certificate,
        template: &CertificateTemplate,
    ) -> Result<Certificate, CryptoError>;

    /// DER PKCS#10 request for `subject`, signed by `key`
    fn create_request(&self, key: &KeyPair, subject: &DistinguishedName) -> Result<Vec<u8>, CryptoError>;

    /// Check the request's self-signature and extract its subject and key
    fn verify_request(&self, request_der: &[u8]) -> Result<VerifiedRequest, CryptoError>;

    fn sign_data(&self, key: &KeyPair, data: &[u8]) -> Result<Signature, CryptoError>;

    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Whether `leaf` chains through `intermediates` to one of `roots`
    fn verify_chain(
        &self,
        leaf: &Certificate,
        intermediates: &[Certificate],
        roots: &[Certificate],
    ) -> Result<bool, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_algorithm_follows_key_family() {
        assert_eq!(
            KeyAlgorithm::Rsa { bits: 2048 }.signature_algorithm(),
            SignatureAlgorithm::Sha256WithRsa
        );
        assert_eq!(
            KeyAlgorithm::EcP256.signature_algorithm(),
            SignatureAlgorithm::EcdsaWithSha256
        );
    }

    #[test]
    fn digest_oid_lookup() {
        assert_eq!(DigestAlgorithm::from_oid("1.3.14.3.2.26"), Some(DigestAlgorithm::Sha1));
        assert_eq!(DigestAlgorithm::from_oid("1.2.3"), None);
    }

    #[test]
    fn serial_bytes_are_minimal_and_positive() {
        assert_eq!(u64_to_serial_bytes(0), vec![0]);
        assert_eq!(u64_to_serial_bytes(0x1000), vec![0x10, 0x00]);
        assert_eq!(u64_to_serial_bytes(0x80), vec![0x00, 0x80]);
        assert_eq!(serial_to_u64(&[0x00, 0x80]), Some(0x80));
        assert_eq!(serial_to_u64(&[0xff]), None);
        assert_eq!(serial_to_u64(&u64_to_serial_bytes(u64::MAX)), Some(u64::MAX));
    }

    #[test]
    fn key_algorithm_toml_shape() {
        let alg: KeyAlgorithm = toml::from_str("type = \"rsa\"\nbits = 2048").unwrap();
        assert_eq!(alg, KeyAlgorithm::Rsa { bits: 2048 });
        let alg: KeyAlgorithm = toml::from_str("type = \"ecp256\"").unwrap();
        assert_eq!(alg, KeyAlgorithm::EcP256);
    }
}
