use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use openssl::hash::MessageDigest;
use openssl::ocsp::{
    OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus,
    OcspRevokedStatus,
};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Crl, X509};

use pki_authority::authority::{AuthorityOptions, CertificateAuthority};
use pki_authority::crypto::KeyAlgorithm;
use pki_authority::dn::DistinguishedName;
use pki_authority::hierarchy::{HierarchyOptions, HierarchyState};
use pki_authority::issuance::IssueRequest;
use pki_authority::ocsp::OcspStatus;
use pki_authority::pki_generator::OpensslProvider;
use pki_authority::policy::{CaLevel, CertClass};
use pki_authority::serial_index::RevocationReason;
use pki_authority::storage::{CaStore, FileStore};

fn options() -> AuthorityOptions {
    AuthorityOptions {
        hierarchy: HierarchyOptions {
            key_algorithm: KeyAlgorithm::EcP256,
            ..HierarchyOptions::default()
        },
        ..AuthorityOptions::default()
    }
}

fn open(dir: &std::path::Path) -> CertificateAuthority {
    let store = FileStore::new(dir, None).unwrap();
    CertificateAuthority::open(Arc::new(OpensslProvider::new()), Arc::new(store), options())
        .unwrap()
}

fn bootstrap(ca: &CertificateAuthority) {
    let root = DistinguishedName::with_common_name("Test Root")
        .organization("Acme")
        .country("US");
    let mut intermediate = root.clone();
    intermediate.common_name = Some("Test Intermediate".to_string());
    ca.init_root(&root, 9215).unwrap();
    ca.init_intermediate(&intermediate, 7300).unwrap();
}

fn server(cn: &str, days: u32) -> IssueRequest {
    IssueRequest {
        class: CertClass::Server,
        subject: DistinguishedName::with_common_name(cn),
        subject_alt_names: vec![],
        validity_days: days,
    }
}

fn crl_serials(der: &[u8]) -> Vec<u64> {
    let crl = X509Crl::from_der(der).unwrap();
    crl.get_revoked()
        .map(|stack| {
            stack
                .iter()
                .map(|entry| {
                    let serial = entry.serial_number().to_bn().unwrap().to_dec_str().unwrap();
                    serial.parse::<u64>().unwrap()
                })
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn issue_revoke_publish_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ca = open(dir.path());
    assert_eq!(ca.state(), HierarchyState::Uninitialized);
    bootstrap(&ca);
    assert_eq!(ca.state(), HierarchyState::Operational);

    let bundle = ca.issue(&server("app.example.com", 3650)).unwrap();
    let serial = bundle.issued.record.serial;
    assert_eq!(ca.ocsp_status(serial).unwrap(), OcspStatus::Good);

    ca.revoke(CaLevel::Intermediate, serial, RevocationReason::KeyCompromise)
        .unwrap();
    assert!(matches!(
        ca.ocsp_status(serial).unwrap(),
        OcspStatus::Revoked {
            reason: RevocationReason::KeyCompromise,
            ..
        }
    ));

    let crl = ca.publish_crl(CaLevel::Intermediate).unwrap();
    assert_eq!(crl.entries.len(), 1);
    assert_eq!(crl.entries[0].serial, serial);
    assert_eq!(crl.entries[0].reason, RevocationReason::KeyCompromise);
    assert_eq!(crl_serials(&crl.der), vec![serial]);

    // The CRL verifies against the intermediate key and was persisted
    let intermediate = X509::from_der(bundle.issued.chain[0].as_der()).unwrap();
    let parsed = X509Crl::from_der(&crl.der).unwrap();
    assert!(parsed.verify(&intermediate.public_key().unwrap()).unwrap());
    let store = FileStore::new(dir.path(), None).unwrap();
    assert_eq!(store.load_crl(CaLevel::Intermediate).unwrap(), Some(crl.der.clone()));
}

#[test]
fn openssl_reads_our_ocsp_responses() {
    let dir = tempfile::tempdir().unwrap();
    let ca = open(dir.path());
    bootstrap(&ca);
    let good = ca.issue(&server("good.example.com", 90)).unwrap();
    let bad = ca.issue(&server("bad.example.com", 90)).unwrap();
    ca.revoke(
        CaLevel::Intermediate,
        bad.issued.record.serial,
        RevocationReason::KeyCompromise,
    )
    .unwrap();
    let responder = ca.ocsp_responder().unwrap();

    let issuer = X509::from_der(good.issued.chain[0].as_der()).unwrap();
    let root = X509::from_der(good.issued.chain[1].as_der()).unwrap();
    let good_leaf = X509::from_der(good.issued.certificate.as_der()).unwrap();
    let bad_leaf = X509::from_der(bad.issued.certificate.as_der()).unwrap();

    let mut request = OcspRequest::new().unwrap();
    request
        .add_id(OcspCertId::from_cert(MessageDigest::sha1(), &good_leaf, &issuer).unwrap())
        .unwrap();
    request
        .add_id(OcspCertId::from_cert(MessageDigest::sha1(), &bad_leaf, &issuer).unwrap())
        .unwrap();
    let response_der = responder.respond(&request.to_der().unwrap());

    let response = OcspResponse::from_der(&response_der).unwrap();
    assert_eq!(response.status(), OcspResponseStatus::SUCCESSFUL);
    let basic = response.basic().unwrap();

    let mut trust = X509StoreBuilder::new().unwrap();
    trust.add_cert(root).unwrap();
    let trust = trust.build();
    let mut untrusted = Stack::new().unwrap();
    untrusted.push(issuer.clone()).unwrap();
    basic.verify(&untrusted, &trust, OcspFlag::empty()).unwrap();

    let good_id = OcspCertId::from_cert(MessageDigest::sha1(), &good_leaf, &issuer).unwrap();
    let good_status = basic.find_status(&good_id).unwrap();
    assert_eq!(good_status.status, OcspCertStatus::GOOD);

    let bad_id = OcspCertId::from_cert(MessageDigest::sha1(), &bad_leaf, &issuer).unwrap();
    let bad_status = basic.find_status(&bad_id).unwrap();
    assert_eq!(bad_status.status, OcspCertStatus::REVOKED);
    assert_eq!(bad_status.reason, OcspRevokedStatus::KEY_COMPROMISE);
    assert!(bad_status.revocation_time.is_some());

    // CertIDs built with SHA-256 are recognised too
    let sha256_id = OcspCertId::from_cert(MessageDigest::sha256(), &good_leaf, &issuer).unwrap();
    let mut request = OcspRequest::new().unwrap();
    request.add_id(sha256_id).unwrap();
    let response = OcspResponse::from_der(&responder.respond(&request.to_der().unwrap())).unwrap();
    let basic = response.basic().unwrap();
    let sha256_id = OcspCertId::from_cert(MessageDigest::sha256(), &good_leaf, &issuer).unwrap();
    assert_eq!(
        basic.find_status(&sha256_id).unwrap().status,
        OcspCertStatus::GOOD
    );
}

#[test]
fn foreign_serials_are_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let ca = open(dir.path());
    bootstrap(&ca);
    let responder = ca.ocsp_responder().unwrap();
    assert_eq!(responder.query(0xdead_beef), OcspStatus::Unknown);
    assert_eq!(ca.ocsp_status(0xdead_beef).unwrap(), OcspStatus::Unknown);

    let der = responder.signed_status(0xdead_beef).unwrap();
    let response = OcspResponse::from_der(&der).unwrap();
    assert_eq!(response.status(), OcspResponseStatus::SUCCESSFUL);
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (serial, signer_serial) = {
        let ca = open(dir.path());
        bootstrap(&ca);
        let bundle = ca.issue(&server("app.example.com", 30)).unwrap();
        ca.revoke(
            CaLevel::Intermediate,
            bundle.issued.record.serial,
            RevocationReason::Superseded,
        )
        .unwrap();
        ca.publish_crl(CaLevel::Intermediate).unwrap();
        let signer = ca.ensure_ocsp_signer().unwrap();
        (bundle.issued.record.serial, signer.certificate.serial().unwrap())
    };

    let ca = open(dir.path());
    assert_eq!(ca.state(), HierarchyState::Operational);
    assert!(matches!(
        ca.ocsp_status(serial).unwrap(),
        OcspStatus::Revoked {
            reason: RevocationReason::Superseded,
            ..
        }
    ));
    // Stored signer is picked up instead of issuing another one
    assert_eq!(
        ca.ensure_ocsp_signer().unwrap().certificate.serial().unwrap(),
        signer_serial
    );

    // CRL numbering and serial allocation continue where they left off
    let next = ca.issue(&server("app.example.com", 30)).unwrap();
    assert!(next.issued.record.serial > signer_serial);
    let crl = ca.publish_crl(CaLevel::Intermediate).unwrap();
    assert_eq!(crl.crl_number, 2);
}

#[test]
fn concurrent_issuance_hands_out_unique_serials() {
    let dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(open(dir.path()));
    bootstrap(&ca);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ca = Arc::clone(&ca);
            thread::spawn(move || {
                (0..5)
                    .map(|i| {
                        ca.issue(&server(&format!("host-{}-{}.example.com", t, i), 30))
                            .unwrap()
                            .issued
                            .record
                            .serial
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();
    let serials: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: BTreeSet<u64> = serials.iter().copied().collect();
    assert_eq!(unique.len(), 40);

    let listed = ca.list(CaLevel::Intermediate, Some(CertClass::Server)).unwrap();
    assert_eq!(listed.len(), 40);

    // Reopened ledger agrees with what was handed out
    drop(ca);
    let reopened = open(dir.path());
    let persisted: BTreeSet<u64> = reopened
        .list(CaLevel::Intermediate, None)
        .unwrap()
        .iter()
        .map(|r| r.serial)
        .collect();
    assert_eq!(persisted, unique);
}

#[test]
fn root_revokes_intermediate_and_publishes_its_own_crl() {
    let dir = tempfile::tempdir().unwrap();
    let ca = open(dir.path());
    bootstrap(&ca);
    let records = ca.list(CaLevel::Root, Some(CertClass::Intermediate)).unwrap();
    assert_eq!(records.len(), 1);

    ca.revoke(CaLevel::Root, records[0].serial, RevocationReason::CaCompromise)
        .unwrap();
    let crl = ca.publish_crl(CaLevel::Root).unwrap();
    assert_eq!(crl.issuer_level, CaLevel::Root);
    assert_eq!(crl_serials(&crl.der), vec![records[0].serial]);
}

#[test]
fn cli_and_daemon_handles_share_one_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open(dir.path());
    bootstrap(&daemon);
    let responder = daemon.ocsp_responder().unwrap();
    let cli = open(dir.path());

    let a = cli.issue(&server("a.example.com", 30)).unwrap();
    let b = daemon.issue(&server("b.example.com", 30)).unwrap();
    let (a, b) = (a.issued.record.serial, b.issued.record.serial);
    assert_ne!(a, b);

    let persisted: Vec<u64> = open(dir.path())
        .list(CaLevel::Intermediate, Some(CertClass::Server))
        .unwrap()
        .iter()
        .map(|r| r.serial)
        .collect();
    assert_eq!(persisted, vec![a, b]);

    // A revocation made from the CLI is visible to the running responder
    cli.revoke(CaLevel::Intermediate, a, RevocationReason::KeyCompromise)
        .unwrap();
    assert!(matches!(
        daemon.ocsp_status(a).unwrap(),
        OcspStatus::Revoked {
            reason: RevocationReason::KeyCompromise,
            ..
        }
    ));
    assert!(matches!(responder.query(a), OcspStatus::Revoked { .. }));
    assert_eq!(responder.query(b), OcspStatus::Good);
}
