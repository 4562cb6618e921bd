//! Serial number allocation and the certificate record index
//!
//! A [`SerialIndex`] belongs to exactly one CA level. It hands out serials, keeps one
//! [`SerialRecord`] per issued certificate and tracks the CRL number. It is a plain value;
//! durability and single-writer access are provided by [`Ledger`](crate::ledger::Ledger).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dn::DistinguishedName;
use crate::error::{CaError, NotFoundError, StateError, ValidationError};
use crate::policy::{CaLevel, CertClass};

/// First serial handed out by a fresh index
pub const DEFAULT_FIRST_SERIAL: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Valid,
    Revoked,
}

/// CRLReason codes (RFC 5280 section 5.3.1); value 7 is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCrl => 8,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use RevocationReason::*;
        [
            Unspecified,
            KeyCompromise,
            CaCompromise,
            AffiliationChanged,
            Superseded,
            CessationOfOperation,
            CertificateHold,
            RemoveFromCrl,
            PrivilegeWithdrawn,
            AaCompromise,
        ]
        .into_iter()
        .find(|r| r.code() == code)
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CaCompromise => "cACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
            RevocationReason::RemoveFromCrl => "removeFromCRL",
            RevocationReason::PrivilegeWithdrawn => "privilegeWithdrawn",
            RevocationReason::AaCompromise => "aACompromise",
        };
        f.write_str(name)
    }
}

impl FromStr for RevocationReason {
    type Err = ValidationError;

    /// Accepts the RFC names case-insensitively, with or without dashes, or the numeric code
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.trim().parse::<u8>() {
            return Self::from_code(code)
                .ok_or_else(|| ValidationError::InvalidName(format!("unknown reason code {}", code)));
        }
        let wanted = s.trim().to_ascii_lowercase().replace(['-', '_'], "");
        (0..=10)
            .filter_map(Self::from_code)
            .find(|r| r.to_string().to_ascii_lowercase() == wanted)
            .ok_or_else(|| ValidationError::InvalidName(format!("unknown revocation reason '{}'", s)))
    }
}

/// One issued certificate as tracked by its issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialRecord {
    pub serial: u64,
    pub subject: DistinguishedName,
    /// Normalized identity used for the duplicate-subject check
    pub subject_key: String,
    pub class: CertClass,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<RevocationReason>,
    /// Hex SHA-256 of the certificate DER
    pub fingerprint: String,
    pub certificate_pem: String,
}

impl SerialRecord {
    /// Valid and inside its validity window
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Valid && self.not_before <= now && now < self.not_after
    }

    pub fn is_revoked(&self) -> bool {
        self.status == RecordStatus::Revoked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialIndex {
    level: CaLevel,
    next_serial: u64,
    crl_number: u64,
    records: BTreeMap<u64, SerialRecord>,
}

impl SerialIndex {
    pub fn new(level: CaLevel, first_serial: u64) -> Self {
        Self {
            level,
            next_serial: first_serial.max(1),
            crl_number: 0,
            records: BTreeMap::new(),
        }
    }

    pub fn level(&self) -> CaLevel {
        self.level
    }

    /// Serial the next `allocate` will return
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Last CRL number handed out, 0 if none has been published
    pub fn crl_number(&self) -> u64 {
        self.crl_number
    }

    /// Reserve the next serial
    pub fn allocate(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    pub fn append(&mut self, record: SerialRecord) -> Result<(), StateError> {
        if self.records.contains_key(&record.serial) {
            return Err(StateError::DuplicateSerial(record.serial));
        }
        if record.serial >= self.next_serial {
            self.next_serial = record.serial + 1;
        }
        self.records.insert(record.serial, record);
        Ok(())
    }

    /// Mark a record revoked; the first revocation time and reason are kept forever
    pub fn revoke(
        &mut self,
        serial: u64,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<&SerialRecord, CaError> {
        let level = self.level;
        let record = self
            .records
            .get_mut(&serial)
            .ok_or(NotFoundError { level, serial })?;
        if let (RecordStatus::Revoked, Some(revoked_at)) = (record.status, record.revoked_at) {
            return Err(StateError::AlreadyRevoked { serial, revoked_at }.into());
        }
        record.status = RecordStatus::Revoked;
        record.revoked_at = Some(at);
        record.revocation_reason = Some(reason);
        Ok(record)
    }

    /// Consume the next CRL number
    pub fn next_crl_number(&mut self) -> u64 {
        self.crl_number += 1;
        self.crl_number
    }

    pub fn get(&self, serial: u64) -> Option<&SerialRecord> {
        self.records.get(&serial)
    }

    pub fn find_live_by_subject(&self, subject_key: &str, now: DateTime<Utc>) -> Option<&SerialRecord> {
        self.records
            .values()
            .find(|r| r.subject_key == subject_key && r.is_live(now))
    }

    /// All records in serial order
    pub fn records(&self) -> impl Iterator<Item = &SerialRecord> {
        self.records.values()
    }

    pub fn revoked(&self) -> impl Iterator<Item = &SerialRecord> {
        self.records.values().filter(|r| r.is_revoked())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn record(serial: u64, cn: &str) -> SerialRecord {
        let now = Utc::now();
        let subject = DistinguishedName::with_common_name(cn);
        SerialRecord {
            serial,
            subject_key: subject.identity_key(),
            subject,
            class: CertClass::Server,
            not_before: now - Duration::minutes(1),
            not_after: now + Duration::days(1),
            status: RecordStatus::Valid,
            revoked_at: None,
            revocation_reason: None,
            fingerprint: String::new(),
            certificate_pem: String::new(),
        }
    }

    #[test]
    fn serials_are_unique_and_increasing() {
        let mut index = SerialIndex::new(CaLevel::Intermediate, DEFAULT_FIRST_SERIAL);
        let mut last = 0;
        for _ in 0..100 {
            let serial = index.allocate();
            assert!(serial > last);
            last = serial;
        }
        assert_eq!(index.allocate(), DEFAULT_FIRST_SERIAL + 100);
    }

    #[test]
    fn append_rejects_duplicate_serial() {
        let mut index = SerialIndex::new(CaLevel::Intermediate, 1);
        index.append(record(5, "a")).unwrap();
        assert_eq!(
            index.append(record(5, "b")),
            Err(StateError::DuplicateSerial(5))
        );
        assert!(index.allocate() > 5);
    }

    #[test]
    fn revoke_unknown_serial_is_not_found() {
        let mut index = SerialIndex::new(CaLevel::Root, 1);
        let err = index
            .revoke(42, RevocationReason::KeyCompromise, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::NotFound(NotFoundError {
                level: CaLevel::Root,
                serial: 42
            })
        ));
    }

    #[test]
    fn second_revoke_keeps_first_timestamp() {
        let mut index = SerialIndex::new(CaLevel::Intermediate, 1);
        index.append(record(7, "a")).unwrap();
        let first = Utc::now();
        index.revoke(7, RevocationReason::Superseded, first).unwrap();

        let err = index
            .revoke(7, RevocationReason::KeyCompromise, first + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(
            err,
            CaError::State(StateError::AlreadyRevoked { serial: 7, revoked_at }) if revoked_at == first
        ));
        let rec = index.get(7).unwrap();
        assert_eq!(rec.revoked_at, Some(first));
        assert_eq!(rec.revocation_reason, Some(RevocationReason::Superseded));
    }

    #[test]
    fn live_lookup_skips_revoked_and_expired() {
        let now = Utc::now();
        let mut index = SerialIndex::new(CaLevel::Intermediate, 1);
        let mut expired = record(1, "app");
        expired.not_after = now - Duration::seconds(1);
        index.append(expired).unwrap();
        assert!(index.find_live_by_subject("app", now).is_none());

        index.append(record(2, "App")).unwrap();
        assert_eq!(index.find_live_by_subject("app", now).unwrap().serial, 2);
        index.revoke(2, RevocationReason::Unspecified, now).unwrap();
        assert!(index.find_live_by_subject("app", now).is_none());
    }

    #[test]
    fn crl_numbers_increase() {
        let mut index = SerialIndex::new(CaLevel::Intermediate, 1);
        assert_eq!(index.next_crl_number(), 1);
        assert_eq!(index.next_crl_number(), 2);
        assert_eq!(index.crl_number(), 2);
    }

    #[test]
    fn reason_names_parse() {
        assert_eq!(
            "key-compromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
        assert_eq!("1".parse::<RevocationReason>().unwrap(), RevocationReason::KeyCompromise);
        assert_eq!(
            "cACompromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::CaCompromise
        );
        assert!("7".parse::<RevocationReason>().is_err());
    }

    #[test]
    fn index_serializes_to_json() {
        let mut index = SerialIndex::new(CaLevel::Intermediate, DEFAULT_FIRST_SERIAL);
        index.append(record(DEFAULT_FIRST_SERIAL, "a")).unwrap();
        let json = serde_json::to_string(&index).unwrap();
        let back: SerialIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, index);
    }
}
