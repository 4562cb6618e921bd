//! PKI Authority - Two-tier Certificate Authority Library
//!
//! A root CA and a single intermediate CA with per-level serial ledgers, a policy catalog
//! governing what each level may sign, and revocation published through CRLs and OCSP.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, CA:TRUE)
//!   └── Intermediate CA (signed by Root from a PKCS#10 request, pathlen=0)
//!       ├── server certificates (serverAuth, SAN = [fqdn, *.fqdn, ...])
//!       ├── user certificates (clientAuth, emailProtection)
//!       └── OCSP signer (OCSPSigning)
//! ```
//!
//! Every certificate a CA signs is recorded in that CA's ledger. Serial allocation and the
//! record append happen in one ledger transaction, so a failed signature or a failed save
//! leaves no trace. CRL and OCSP both read the same ledger records.
//!
//! # Quick Start
//!
//! ```bash
//! pki-authority init
//! pki-authority issue --class server --cn app.example.com
//! pki-authority ocsp-serve
//! ```
//!
//! ## As a Library
//!
//! ```no_run
//! use std::sync::Arc;
//! use pki_authority::authority::{AuthorityOptions, CertificateAuthority};
//! use pki_authority::dn::DistinguishedName;
//! use pki_authority::issuance::IssueRequest;
//! use pki_authority::pki_generator::OpensslProvider;
//! use pki_authority::policy::{CaLevel, CertClass};
//! use pki_authority::serial_index::RevocationReason;
//! use pki_authority::storage::FileStore;
//!
//! let store = FileStore::new("ca-data", None)?;
//! let ca = CertificateAuthority::open(
//!     Arc::new(OpensslProvider::new()),
//!     Arc::new(store),
//!     AuthorityOptions::default(),
//! )?;
//!
//! let root = DistinguishedName::with_common_name("Test Root").organization("Acme");
//! let intermediate = DistinguishedName::with_common_name("Test Intermediate").organization("Acme");
//! ca.init_root(&root, 9215)?;
//! ca.init_intermediate(&intermediate, 7300)?;
//!
//! let bundle = ca.issue(&IssueRequest {
//!     class: CertClass::Server,
//!     subject: DistinguishedName::with_common_name("app.example.com"),
//!     subject_alt_names: vec![],
//!     validity_days: 365,
//! })?;
//! ca.revoke(CaLevel::Intermediate, bundle.issued.record.serial, RevocationReason::KeyCompromise)?;
//! let crl = ca.publish_crl(CaLevel::Intermediate)?;
//! assert_eq!(crl.entries.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Module Overview
//!
//! - [`policy`]: per-level catalogs of certificate classes, DN rules and extensions
//! - [`serial_index`] / [`ledger`]: serial allocation, records and transactional persistence
//! - [`hierarchy`]: root and intermediate bootstrap, the hierarchy state machine
//! - [`issuance`]: leaf issuance by the intermediate
//! - [`revocation`], [`crl`], [`ocsp`]: revocation, CRL publication and OCSP responses
//! - [`pki_generator`]: the OpenSSL-backed [`crypto::CryptoProvider`]
//! - [`storage`]: on-disk and in-memory stores for keys, certificates, ledgers and CRLs
//! - [`authority`]: the facade used by the CLI and the IPC [`protocol`]
//! - [`external_interface`] / [`ocsp_server`]: Unix socket IPC and the HTTP OCSP listener

pub mod authority;
pub mod configs;
pub mod crl;
pub mod crypto;
pub mod dn;
pub mod error;
pub mod external_interface;
pub mod hierarchy;
pub mod issuance;
pub mod ledger;
pub mod ocsp;
pub mod ocsp_server;
pub mod pki_generator;
pub mod policy;
pub mod protocol;
pub mod revocation;
pub mod secure_key;
pub mod serial_index;
pub mod storage;

pub use error::{CaError, Result};
