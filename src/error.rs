//! Error taxonomy for the certificate authority engine.
//!
//! Every engine operation returns [`CaError`]. The variants mirror the five failure
//! families the authority distinguishes:
//!
//! - [`ConfigurationError`] - hierarchy not bootstrapped, policy missing a class
//! - [`ValidationError`] - DN field missing/mismatched, duplicate subject, bad input
//! - [`StateError`] - duplicate serial, already revoked, already initialized, unusable signer
//! - [`CryptoError`] - failures delegated from the signing collaborator
//! - [`NotFoundError`] - unknown serial on revoke or query
//!
//! Storage failures are reported separately as [`CaError::Storage`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::hierarchy::HierarchyState;
use crate::policy::{CaLevel, CertClass, DnField};

/// Result alias used throughout the engine
pub type Result<T, E = CaError> = std::result::Result<T, E>;

/// Top-level error returned by every engine operation
#[derive(Error, Debug)]
pub enum CaError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CaError {
    /// Wrap a storage-layer failure with a description of what was being persisted
    pub fn storage<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CaError::Storage {
            context: context.into(),
            source: source.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("hierarchy is not bootstrapped (current state: {state})")]
    NotBootstrapped { state: HierarchyState },

    #[error("{level} policy catalog has no rule for class '{class}'")]
    PolicyMissing { level: CaLevel, class: CertClass },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field {field} is missing")]
    MissingRequiredField { field: DnField },

    #[error("field {field} does not match issuer (expected {expected:?}, got {actual:?})")]
    MismatchedField {
        field: DnField,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("a live certificate for '{subject}' already exists (serial {serial})")]
    DuplicateSubject { subject: String, serial: u64 },

    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    #[error("requested validity of {requested_days} days exceeds issuer's remaining {remaining_days} days")]
    ValidityExceedsIssuer {
        requested_days: u32,
        remaining_days: i64,
    },

    #[error("validity of {0} days runs past the last date a certificate can carry")]
    ValidityOutOfRange(u32),

    #[error("invalid subject alternative name '{0}'")]
    InvalidSubjectAltName(String),

    #[error("subject alternative name '{0}' is not permitted by policy")]
    SanNotPermitted(String),

    #[error("class '{0}' cannot be issued through this operation")]
    UnsupportedClass(CertClass),

    #[error("invalid distinguished name: {0}")]
    InvalidName(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{0} CA is already initialized")]
    AlreadyInitialized(CaLevel),

    #[error("serial {0} already exists in the index")]
    DuplicateSerial(u64),

    #[error("serial {serial} was already revoked at {revoked_at}")]
    AlreadyRevoked {
        serial: u64,
        revoked_at: DateTime<Utc>,
    },

    #[error("OCSP signer is unusable: {0}")]
    SignerUnusable(String),
}

/// A failure reported by the cryptographic collaborator
///
/// Carries the operation and, where known, the subject it was performed for so an
/// operator can tell which step failed. These are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("crypto error during {operation}{}: {message}", subject_suffix(.subject))]
pub struct CryptoError {
    pub operation: String,
    pub subject: Option<String>,
    pub message: String,
}

fn subject_suffix(subject: &Option<String>) -> String {
    subject
        .as_ref()
        .map(|s| format!(" for '{}'", s))
        .unwrap_or_default()
}

impl CryptoError {
    pub fn new(operation: impl Into<String>, message: impl ToString) -> Self {
        Self {
            operation: operation.into(),
            subject: None,
            message: message.to_string(),
        }
    }

    pub fn for_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("serial {serial} not found in {level} index")]
pub struct NotFoundError {
    pub level: CaLevel,
    pub serial: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_mentions_subject() {
        let err = CryptoError::new("sign certificate", "bad key").for_subject("CN=app");
        let text = err.to_string();
        assert!(text.contains("sign certificate"));
        assert!(text.contains("CN=app"));
        assert!(text.contains("bad key"));
    }

    #[test]
    fn nested_errors_convert() {
        let err: CaError = StateError::DuplicateSerial(7).into();
        assert!(matches!(err, CaError::State(StateError::DuplicateSerial(7))));
    }
}
