//! Revocation for one issuing CA
//!
//! Revoking only flips the record in the issuer's ledger. CRL publication is a separate,
//! explicit step; OCSP reads the ledger directly and sees a revocation as soon as it
//! commits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::crl::CrlPublisher;
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::hierarchy::{now_seconds, CaIdentity};
use crate::ocsp::{OcspResponder, OcspSignerIdentity};
use crate::serial_index::{RevocationReason, SerialRecord};

pub struct RevocationManager {
    provider: Arc<dyn CryptoProvider>,
    issuer: Arc<CaIdentity>,
    crl_validity_days: u32,
}

impl RevocationManager {
    pub fn new(provider: Arc<dyn CryptoProvider>, issuer: Arc<CaIdentity>, crl_validity_days: u32) -> Self {
        Self {
            provider,
            issuer,
            crl_validity_days,
        }
    }

    pub fn issuer(&self) -> &Arc<CaIdentity> {
        &self.issuer
    }

    pub fn revoke(&self, serial: u64, reason: RevocationReason) -> Result<SerialRecord> {
        self.revoke_at(serial, reason, now_seconds())
    }

    /// Revoke with an explicit revocation time
    pub fn revoke_at(
        &self,
        serial: u64,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<SerialRecord> {
        let record = self
            .issuer
            .ledger()
            .transact(|index| Ok(index.revoke(serial, reason, at)?.clone()))?;
        info!(
            level = %self.issuer.level(),
            serial,
            reason = %reason,
            subject = %record.subject,
            "certificate revoked"
        );
        Ok(record)
    }

    pub fn crl_publisher(&self) -> CrlPublisher {
        CrlPublisher::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.issuer),
            self.crl_validity_days,
        )
    }

    pub fn ocsp_responder(&self, signer: OcspSignerIdentity) -> Result<OcspResponder> {
        OcspResponder::new(Arc::clone(&self.provider), Arc::clone(&self.issuer), signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use crate::dn::DistinguishedName;
    use crate::error::{CaError, NotFoundError, StateError};
    use crate::hierarchy::{HierarchyOptions, TrustHierarchy};
    use crate::pki_generator::OpensslProvider;
    use crate::policy::CaLevel;
    use crate::storage::MemoryStore;

    fn root_manager() -> (RevocationManager, u64) {
        let provider = Arc::new(OpensslProvider::new());
        let mut hierarchy = TrustHierarchy::open(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            HierarchyOptions {
                key_algorithm: KeyAlgorithm::EcP256,
                ..HierarchyOptions::default()
            },
        )
        .unwrap();
        let base = DistinguishedName::with_common_name("Test Root")
            .organization("Acme")
            .country("US");
        let root = hierarchy.bootstrap_root(&base, 60).unwrap();
        let mut intermediate_dn = base.clone();
        intermediate_dn.common_name = Some("Test Intermediate".to_string());
        hierarchy.bootstrap_intermediate(&intermediate_dn, 30).unwrap();
        let intermediate_serial = root.ledger().snapshot().records().last().unwrap().serial;
        (RevocationManager::new(provider, root, 30), intermediate_serial)
    }

    #[test]
    fn root_can_revoke_the_intermediate() {
        let (manager, serial) = root_manager();
        let record = manager.revoke(serial, RevocationReason::CaCompromise).unwrap();
        assert!(record.is_revoked());

        let crl = manager.crl_publisher().publish().unwrap();
        assert_eq!(crl.issuer_level, CaLevel::Root);
        assert_eq!(crl.entries.len(), 1);
        assert_eq!(crl.entries[0].serial, serial);
    }

    #[test]
    fn revoke_errors_surface() {
        let (manager, serial) = root_manager();
        assert!(matches!(
            manager.revoke(1, RevocationReason::Unspecified),
            Err(CaError::NotFound(NotFoundError { serial: 1, .. }))
        ));
        manager.revoke(serial, RevocationReason::Superseded).unwrap();
        assert!(matches!(
            manager.revoke(serial, RevocationReason::KeyCompromise),
            Err(CaError::State(StateError::AlreadyRevoked { .. }))
        ));
    }
}
