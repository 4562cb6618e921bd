//! OpenSSL-backed [`CryptoProvider`]
//!
//! Turns a [`CertificateTemplate`] into a signed X.509v3 certificate, generates RSA and
//! P-256 key pairs, builds/verifies PKCS#10 requests and verifies chains with an
//! OpenSSL `X509Store`. All signatures use SHA-256.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage as EkuBuilder, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{
    X509Builder, X509Extension, X509NameRef, X509Ref, X509Req, X509StoreContext, X509,
};

use crate::crypto::{
    Certificate, CertificateExtensions, CertificateTemplate, CryptoProvider, DigestAlgorithm,
    KeyAlgorithm, KeyPair, Signature, VerifiedRequest,
};
use crate::dn::DistinguishedName;
use crate::error::CryptoError;
use crate::policy::{ExtendedKeyUsage, KeyUsageFlag};
use crate::secure_key::SecureKey;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const X509_REQ_VERSION_1: i32 = 0;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslProvider;

impl OpensslProvider {
    pub fn new() -> Self {
        Self
    }

    fn build_certificate(
        &self,
        template: &CertificateTemplate,
        issuer_cert: Option<&X509Ref>,
        signing_key: &PKey<Private>,
    ) -> Result<X509, CryptoError> {
        let subject_label = template.subject.to_string();
        let fail = |op: &str, e: openssl::error::ErrorStack| {
            CryptoError::new(op, e).for_subject(subject_label.clone())
        };

        let mut builder = X509::builder().map_err(|e| fail("create X509 builder", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| fail("set version", e))?;

        let serial = BigNum::from_dec_str(&template.serial.to_string())
            .and_then(|bn| bn.to_asn1_integer())
            .map_err(|e| fail("set serial number", e))?;
        builder
            .set_serial_number(&serial)
            .map_err(|e| fail("set serial number", e))?;

        let name = template.subject.to_x509_name()?;
        builder
            .set_subject_name(&name)
            .map_err(|e| fail("set subject", e))?;
        let issuer_name: &X509NameRef = match issuer_cert {
            Some(issuer) => issuer.subject_name(),
            None => &name,
        };
        builder
            .set_issuer_name(issuer_name)
            .map_err(|e| fail("set issuer", e))?;

        let not_before = Asn1Time::from_unix(template.not_before.timestamp())
            .map_err(|e| fail("create not_before", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| fail("set not_before", e))?;
        let not_after = Asn1Time::from_unix(template.not_after.timestamp())
            .map_err(|e| fail("create not_after", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| fail("set not_after", e))?;

        let public_key = PKey::public_key_from_der(&template.subject_public_key)
            .map_err(|e| fail("decode subject public key", e))?;
        builder
            .set_pubkey(&public_key)
            .map_err(|e| fail("set public key", e))?;

        append_extensions(&mut builder, &template.extensions, issuer_cert)
            .map_err(|e| fail("add extensions", e))?;

        builder
            .sign(signing_key, MessageDigest::sha256())
            .map_err(|e| fail("sign certificate", e))?;
        Ok(builder.build())
    }
}

fn append_extensions(
    builder: &mut X509Builder,
    extensions: &CertificateExtensions,
    issuer_cert: Option<&X509Ref>,
) -> Result<(), openssl::error::ErrorStack> {
    if let Some(rule) = extensions.basic_constraints {
        let mut bc = BasicConstraints::new();
        bc.critical();
        if rule.ca {
            bc.ca();
            if let Some(path_len) = rule.path_len {
                bc.pathlen(path_len);
            }
        }
        builder.append_extension(bc.build()?)?;
    }

    if !extensions.key_usage.is_empty() {
        let mut ku = KeyUsage::new();
        ku.critical();
        for flag in &extensions.key_usage {
            match flag {
                KeyUsageFlag::DigitalSignature => ku.digital_signature(),
                KeyUsageFlag::NonRepudiation => ku.non_repudiation(),
                KeyUsageFlag::KeyEncipherment => ku.key_encipherment(),
                KeyUsageFlag::DataEncipherment => ku.data_encipherment(),
                KeyUsageFlag::KeyAgreement => ku.key_agreement(),
                KeyUsageFlag::KeyCertSign => ku.key_cert_sign(),
                KeyUsageFlag::CrlSign => ku.crl_sign(),
            };
        }
        builder.append_extension(ku.build()?)?;
    }

    if !extensions.extended_key_usage.is_empty() {
        let mut eku = EkuBuilder::new();
        for purpose in &extensions.extended_key_usage {
            match purpose {
                ExtendedKeyUsage::ServerAuth => eku.server_auth(),
                ExtendedKeyUsage::ClientAuth => eku.client_auth(),
                ExtendedKeyUsage::EmailProtection => eku.email_protection(),
                ExtendedKeyUsage::CodeSigning => eku.code_signing(),
                ExtendedKeyUsage::OcspSigning => eku.other("OCSPSigning"),
            };
        }
        builder.append_extension(eku.build()?)?;
    }

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(issuer_cert, None))?;
    builder.append_extension(ski)?;

    if issuer_cert.is_some() {
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(issuer_cert, None))?;
        builder.append_extension(aki)?;
    }

    if !extensions.subject_alt_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in &extensions.subject_alt_names {
            san.dns(name);
        }
        let san = san.build(&builder.x509v3_context(issuer_cert, None))?;
        builder.append_extension(san)?;
    }

    if let Some(url) = &extensions.crl_distribution_point {
        #[allow(deprecated)]
        let crl_dp = X509Extension::new_nid(
            None,
            Some(&builder.x509v3_context(issuer_cert, None)),
            Nid::CRL_DISTRIBUTION_POINTS,
            &format!("URI:{}", url),
        )?;
        builder.append_extension(crl_dp)?;
    }

    if let Some(url) = &extensions.ocsp_responder_url {
        #[allow(deprecated)]
        let aia = X509Extension::new_nid(
            None,
            Some(&builder.x509v3_context(issuer_cert, None)),
            Nid::INFO_ACCESS,
            &format!("OCSP;URI:{}", url),
        )?;
        builder.append_extension(aia)?;
    }

    Ok(())
}

impl CryptoProvider for OpensslProvider {
    fn generate_key_pair(&self, algorithm: KeyAlgorithm) -> Result<KeyPair, CryptoError> {
        let private_key = match algorithm {
            KeyAlgorithm::Rsa { bits } => {
                let rsa = Rsa::generate(bits)
                    .map_err(|e| CryptoError::new("generate RSA keypair", e))?;
                PKey::from_rsa(rsa).map_err(|e| CryptoError::new("create private key", e))?
            }
            KeyAlgorithm::EcP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
                    .map_err(|e| CryptoError::new("load P-256 group", e))?;
                let ec = EcKey::generate(&group)
                    .map_err(|e| CryptoError::new("generate EC keypair", e))?;
                PKey::from_ec_key(ec).map_err(|e| CryptoError::new("create private key", e))?
            }
        };
        let public_key_der = private_key
            .public_key_to_der()
            .map_err(|e| CryptoError::new("encode public key", e))?;
        Ok(KeyPair::new(
            algorithm,
            public_key_der,
            SecureKey::from_pkey(&private_key)?,
        ))
    }

    fn self_sign(&self, key: &KeyPair, template: &CertificateTemplate) -> Result<Certificate, CryptoError> {
        if template.subject_public_key != key.public_key_der() {
            return Err(CryptoError::new(
                "self-sign certificate",
                "template public key does not belong to the signing key",
            )
            .for_subject(template.subject.to_string()));
        }
        let x509 = key
            .private_key()
            .with_pkey(|pkey| self.build_certificate(template, None, pkey))?;
        Certificate::from_x509(&x509)
    }

    fn sign(
        &self,
        issuer_key: &KeyPair,
        issuer_cert: &Certificate,
        template: &CertificateTemplate,
    ) -> Result<Certificate, CryptoError> {
        let issuer = issuer_cert.to_x509()?;
        let x509 = issuer_key
            .private_key()
            .with_pkey(|pkey| self.build_certificate(template, Some(&issuer), pkey))?;
        Certificate::from_x509(&x509)
    }

    fn create_request(&self, key: &KeyPair, subject: &DistinguishedName) -> Result<Vec<u8>, CryptoError> {
        let fail = |op: &str, e: openssl::error::ErrorStack| {
            CryptoError::new(op, e).for_subject(subject.to_string())
        };
        let name = subject.to_x509_name()?;
        key.private_key().with_pkey(|pkey| {
            let mut builder = X509Req::builder().map_err(|e| fail("create request builder", e))?;
            builder
                .set_version(X509_REQ_VERSION_1)
                .map_err(|e| fail("set request version", e))?;
            builder
                .set_subject_name(&name)
                .map_err(|e| fail("set request subject", e))?;
            builder
                .set_pubkey(pkey)
                .map_err(|e| fail("set request public key", e))?;
            builder
                .sign(pkey, MessageDigest::sha256())
                .map_err(|e| fail("sign request", e))?;
            builder
                .build()
                .to_der()
                .map_err(|e| fail("encode request", e))
        })
    }

    fn verify_request(&self, request_der: &[u8]) -> Result<VerifiedRequest, CryptoError> {
        let req = X509Req::from_der(request_der)
            .map_err(|e| CryptoError::new("decode request", e))?;
        let public_key = req
            .public_key()
            .map_err(|e| CryptoError::new("read request public key", e))?;
        let valid = req
            .verify(&public_key)
            .map_err(|e| CryptoError::new("verify request signature", e))?;
        let subject = DistinguishedName::from_x509_name(req.subject_name())
            .map_err(|e| CryptoError::new("read request subject", e))?;
        if !valid {
            return Err(CryptoError::new(
                "verify request signature",
                "signature does not match the enclosed public key",
            )
            .for_subject(subject.to_string()));
        }
        let public_key_der = public_key
            .public_key_to_der()
            .map_err(|e| CryptoError::new("encode request public key", e))?;
        Ok(VerifiedRequest {
            subject,
            public_key_der,
        })
    }

    fn sign_data(&self, key: &KeyPair, data: &[u8]) -> Result<Signature, CryptoError> {
        let value = key.private_key().with_pkey(|pkey| {
            let mut signer = Signer::new(MessageDigest::sha256(), pkey)
                .map_err(|e| CryptoError::new("create signer", e))?;
            signer
                .sign_oneshot_to_vec(data)
                .map_err(|e| CryptoError::new("sign data", e))
        })?;
        Ok(Signature {
            algorithm: key.algorithm().signature_algorithm(),
            value,
        })
    }

    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let md = match algorithm {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
        };
        openssl::hash::hash(md, data)
            .map(|d| d.to_vec())
            .map_err(|e| CryptoError::new("digest", e))
    }

    fn verify_chain(
        &self,
        leaf: &Certificate,
        intermediates: &[Certificate],
        roots: &[Certificate],
    ) -> Result<bool, CryptoError> {
        let fail = |e: openssl::error::ErrorStack| CryptoError::new("verify chain", e);
        let mut store = X509StoreBuilder::new().map_err(fail)?;
        for root in roots {
            store.add_cert(root.to_x509()?).map_err(fail)?;
        }
        let store = store.build();

        let mut chain = Stack::new().map_err(fail)?;
        for intermediate in intermediates {
            chain.push(intermediate.to_x509()?).map_err(fail)?;
        }

        let leaf = leaf.to_x509()?;
        let mut context = X509StoreContext::new().map_err(fail)?;
        context
            .init(&store, &leaf, &chain, |c| c.verify_cert())
            .map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BasicConstraintsRule;
    use chrono::{Duration, Utc};

    fn template(serial: u64, cn: &str, key: &KeyPair, ca: bool) -> CertificateTemplate {
        let now = Utc::now();
        CertificateTemplate {
            serial,
            subject: DistinguishedName::with_common_name(cn),
            not_before: now,
            not_after: now + Duration::days(30),
            subject_public_key: key.public_key_der().to_vec(),
            extensions: CertificateExtensions {
                basic_constraints: Some(BasicConstraintsRule {
                    ca,
                    path_len: if ca { Some(0) } else { None },
                }),
                key_usage: if ca {
                    vec![KeyUsageFlag::KeyCertSign, KeyUsageFlag::CrlSign]
                } else {
                    vec![KeyUsageFlag::DigitalSignature]
                },
                ..CertificateExtensions::default()
            },
        }
    }

    #[test]
    fn signs_chain_that_verifies() {
        let provider = OpensslProvider::new();
        let root_key = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let root = provider
            .self_sign(&root_key, &template(1, "Test Root", &root_key, true))
            .unwrap();

        let leaf_key = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let mut leaf_template = template(4096, "app.example.com", &leaf_key, false);
        leaf_template.extensions.subject_alt_names = vec!["app.example.com".to_string()];
        let leaf = provider.sign(&root_key, &root, &leaf_template).unwrap();

        assert!(provider.verify_chain(&leaf, &[], &[root.clone()]).unwrap());

        let x509 = leaf.to_x509().unwrap();
        assert_eq!(
            x509.serial_number().to_bn().unwrap().to_dec_str().unwrap().to_string(),
            "4096"
        );
        let sans: Vec<String> = x509
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, vec!["app.example.com".to_string()]);

        let other_key = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let other_root = provider
            .self_sign(&other_key, &template(1, "Other Root", &other_key, true))
            .unwrap();
        assert!(!provider.verify_chain(&leaf, &[], &[other_root]).unwrap());
    }

    #[test]
    fn self_sign_rejects_foreign_public_key() {
        let provider = OpensslProvider::new();
        let key = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let other = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let err = provider
            .self_sign(&key, &template(1, "Root", &other, true))
            .unwrap_err();
        assert_eq!(err.operation, "self-sign certificate");
    }

    #[test]
    fn request_roundtrip_preserves_subject_and_key() {
        let provider = OpensslProvider::new();
        let key = provider.generate_key_pair(KeyAlgorithm::EcP256).unwrap();
        let subject = DistinguishedName::with_common_name("Issuing CA").organization("Acme");
        let der = provider.create_request(&key, &subject).unwrap();
        let verified = provider.verify_request(&der).unwrap();
        assert_eq!(verified.subject, subject);
        assert_eq!(verified.public_key_der, key.public_key_der());
    }

    #[test]
    fn rsa_signature_verifies() {
        let provider = OpensslProvider::new();
        let key = provider
            .generate_key_pair(KeyAlgorithm::Rsa { bits: 2048 })
            .unwrap();
        let sig = provider.sign_data(&key, b"tbs").unwrap();
        let public = PKey::public_key_from_der(key.public_key_der()).unwrap();
        let mut verifier =
            openssl::sign::Verifier::new(MessageDigest::sha256(), &public).unwrap();
        verifier.update(b"tbs").unwrap();
        assert!(verifier.verify(&sig.value).unwrap());
    }
}
