//! Policy catalog
//!
//! Each CA level owns an immutable [`PolicyCatalog`] describing, per certificate class,
//! which distinguished-name fields are required and which X.509 extensions apply.
//!
//! ```text
//! Root catalog (strict)          Intermediate catalog (loose)
//!   root          self           server      serverAuth + SANs
//!   intermediate  C/ST/O match   user        clientAuth, emailProtection
//!                                ocspSigner  OCSPSigning
//! ```
//!
//! The root catalog has no leaf classes, which is what keeps the root key from ever
//! signing an end-entity certificate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dn::DistinguishedName;
use crate::error::{ConfigurationError, ValidationError};

/// Which CA in the hierarchy a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaLevel {
    Root,
    Intermediate,
}

impl fmt::Display for CaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaLevel::Root => write!(f, "root"),
            CaLevel::Intermediate => write!(f, "intermediate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CertClass {
    Root,
    Intermediate,
    Server,
    User,
    OcspSigner,
}

impl CertClass {
    /// Classes an intermediate may issue to requesters
    pub const LEAF_CLASSES: [CertClass; 3] = [CertClass::Server, CertClass::User, CertClass::OcspSigner];

    pub fn is_leaf(self) -> bool {
        Self::LEAF_CLASSES.contains(&self)
    }
}

impl fmt::Display for CertClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertClass::Root => "root",
            CertClass::Intermediate => "intermediate",
            CertClass::Server => "server",
            CertClass::User => "user",
            CertClass::OcspSigner => "ocspSigner",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CertClass {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "root" => Ok(CertClass::Root),
            "intermediate" => Ok(CertClass::Intermediate),
            "server" => Ok(CertClass::Server),
            "user" => Ok(CertClass::User),
            "ocspsigner" | "ocsp" => Ok(CertClass::OcspSigner),
            other => Err(ValidationError::InvalidName(format!(
                "unknown certificate class '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DnField {
    Country,
    State,
    Locality,
    Organization,
    OrganizationalUnit,
    CommonName,
    Email,
}

impl DnField {
    pub const ALL: [DnField; 7] = [
        DnField::Country,
        DnField::State,
        DnField::Locality,
        DnField::Organization,
        DnField::OrganizationalUnit,
        DnField::CommonName,
        DnField::Email,
    ];

    pub fn short_name(self) -> &'static str {
        match self {
            DnField::Country => "C",
            DnField::State => "ST",
            DnField::Locality => "L",
            DnField::Organization => "O",
            DnField::OrganizationalUnit => "OU",
            DnField::CommonName => "CN",
            DnField::Email => "emailAddress",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.short_name().eq_ignore_ascii_case(name))
            .or(match name.to_ascii_lowercase().as_str() {
                "email" | "e" => Some(DnField::Email),
                "s" => Some(DnField::State),
                _ => None,
            })
    }
}

impl fmt::Display for DnField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// How a DN field is checked against the candidate subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldRequirement {
    /// Must equal the issuer's value for the same field
    Match,
    /// Must be present and non-empty
    Supplied,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyUsageFlag {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    EmailProtection,
    CodeSigning,
    OcspSigning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicConstraintsRule {
    pub ca: bool,
    pub path_len: Option<u32>,
}

/// Per-class policy as stored in a catalog, before it is bound to an issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTemplate {
    pub fields: BTreeMap<DnField, FieldRequirement>,
    pub key_usage: BTreeSet<KeyUsageFlag>,
    pub extended_key_usage: BTreeSet<ExtendedKeyUsage>,
    pub basic_constraints: BasicConstraintsRule,
    /// DNS patterns SANs must match, `None` allows any well-formed name
    pub permitted_dns: Option<Vec<String>>,
}

/// A policy template resolved against a concrete issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub class: CertClass,
    pub issuer: DistinguishedName,
    pub fields: BTreeMap<DnField, FieldRequirement>,
    pub key_usage: BTreeSet<KeyUsageFlag>,
    pub extended_key_usage: BTreeSet<ExtendedKeyUsage>,
    pub basic_constraints: BasicConstraintsRule,
    pub permitted_dns: Option<Vec<String>>,
}

impl PolicyRule {
    pub fn is_ca(&self) -> bool {
        self.basic_constraints.ca
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyCatalog {
    level: CaLevel,
    rules: BTreeMap<CertClass, PolicyTemplate>,
}

fn field_map(entries: &[(DnField, FieldRequirement)]) -> BTreeMap<DnField, FieldRequirement> {
    let mut map: BTreeMap<DnField, FieldRequirement> = DnField::ALL
        .into_iter()
        .map(|f| (f, FieldRequirement::Optional))
        .collect();
    map.extend(entries.iter().copied());
    // No class may leave CN unset
    map.insert(DnField::CommonName, FieldRequirement::Supplied);
    map
}

fn ca_key_usage() -> BTreeSet<KeyUsageFlag> {
    [
        KeyUsageFlag::DigitalSignature,
        KeyUsageFlag::KeyCertSign,
        KeyUsageFlag::CrlSign,
    ]
    .into_iter()
    .collect()
}

impl PolicyCatalog {
    /// Strict catalog governing the root: its own certificate and the intermediate
    pub fn root_default() -> Self {
        use FieldRequirement::*;
        let mut rules = BTreeMap::new();
        rules.insert(
            CertClass::Root,
            PolicyTemplate {
                fields: field_map(&[]),
                key_usage: ca_key_usage(),
                extended_key_usage: BTreeSet::new(),
                basic_constraints: BasicConstraintsRule {
                    ca: true,
                    path_len: None,
                },
                permitted_dns: None,
            },
        );
        rules.insert(
            CertClass::Intermediate,
            PolicyTemplate {
                fields: field_map(&[
                    (DnField::Country, Match),
                    (DnField::State, Match),
                    (DnField::Organization, Match),
                ]),
                key_usage: ca_key_usage(),
                extended_key_usage: BTreeSet::new(),
                basic_constraints: BasicConstraintsRule {
                    ca: true,
                    path_len: Some(0),
                },
                permitted_dns: None,
            },
        );
        Self {
            level: CaLevel::Root,
            rules,
        }
    }

    /// Loose catalog governing leaf issuance by the intermediate
    pub fn intermediate_default() -> Self {
        let leaf = BasicConstraintsRule {
            ca: false,
            path_len: None,
        };
        let mut rules = BTreeMap::new();
        rules.insert(
            CertClass::Server,
            PolicyTemplate {
                fields: field_map(&[]),
                key_usage: [KeyUsageFlag::DigitalSignature, KeyUsageFlag::KeyEncipherment]
                    .into_iter()
                    .collect(),
                extended_key_usage: [ExtendedKeyUsage::ServerAuth].into_iter().collect(),
                basic_constraints: leaf,
                permitted_dns: None,
            },
        );
        rules.insert(
            CertClass::User,
            PolicyTemplate {
                fields: field_map(&[]),
                key_usage: [
                    KeyUsageFlag::DigitalSignature,
                    KeyUsageFlag::NonRepudiation,
                    KeyUsageFlag::KeyEncipherment,
                ]
                .into_iter()
                .collect(),
                extended_key_usage: [ExtendedKeyUsage::ClientAuth, ExtendedKeyUsage::EmailProtection]
                    .into_iter()
                    .collect(),
                basic_constraints: leaf,
                permitted_dns: None,
            },
        );
        rules.insert(
            CertClass::OcspSigner,
            PolicyTemplate {
                fields: field_map(&[]),
                key_usage: [KeyUsageFlag::DigitalSignature].into_iter().collect(),
                extended_key_usage: [ExtendedKeyUsage::OcspSigning].into_iter().collect(),
                basic_constraints: leaf,
                permitted_dns: None,
            },
        );
        Self {
            level: CaLevel::Intermediate,
            rules,
        }
    }

    /// Default catalog for a level
    pub fn for_level(level: CaLevel) -> Self {
        match level {
            CaLevel::Root => Self::root_default(),
            CaLevel::Intermediate => Self::intermediate_default(),
        }
    }

    /// Restrict server SANs to the given DNS patterns (e.g. `*.example.com`)
    pub fn with_permitted_server_dns(mut self, patterns: Vec<String>) -> Self {
        if let Some(server) = self.rules.get_mut(&CertClass::Server) {
            server.permitted_dns = if patterns.is_empty() {
                None
            } else {
                Some(patterns.into_iter().map(|p| p.to_ascii_lowercase()).collect())
            };
        }
        self
    }

    pub fn level(&self) -> CaLevel {
        self.level
    }

    pub fn classes(&self) -> impl Iterator<Item = CertClass> + '_ {
        self.rules.keys().copied()
    }

    /// Bind the class template to an issuer
    pub fn resolve(
        &self,
        class: CertClass,
        issuer: &DistinguishedName,
    ) -> Result<PolicyRule, ConfigurationError> {
        let template = self
            .rules
            .get(&class)
            .ok_or(ConfigurationError::PolicyMissing {
                level: self.level,
                class,
            })?;
        Ok(PolicyRule {
            class,
            issuer: issuer.clone(),
            fields: template.fields.clone(),
            key_usage: template.key_usage.clone(),
            extended_key_usage: template.extended_key_usage.clone(),
            basic_constraints: template.basic_constraints,
            permitted_dns: template.permitted_dns.clone(),
        })
    }
}

/// Check a candidate subject against a resolved rule
///
/// Runs before any key or signature work so a rejected request costs nothing.
pub fn validate_subject(
    candidate: &DistinguishedName,
    rule: &PolicyRule,
) -> Result<(), ValidationError> {
    for (field, requirement) in &rule.fields {
        let actual = candidate.get(*field);
        match requirement {
            FieldRequirement::Optional => {}
            FieldRequirement::Supplied => {
                if actual.is_none() {
                    return Err(ValidationError::MissingRequiredField { field: *field });
                }
            }
            FieldRequirement::Match => {
                let expected = rule.issuer.get(*field);
                match (expected, actual) {
                    (Some(_), None) => {
                        return Err(ValidationError::MissingRequiredField { field: *field })
                    }
                    (e, a) if e != a => {
                        return Err(ValidationError::MismatchedField {
                            field: *field,
                            expected: e.map(str::to_string),
                            actual: a.map(str::to_string),
                        })
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Check SAN syntax and, if the rule carries patterns, that each name is permitted
pub fn validate_subject_alt_names(
    names: &[String],
    rule: &PolicyRule,
) -> Result<(), ValidationError> {
    for name in names {
        if !is_valid_dns_name(name) {
            return Err(ValidationError::InvalidSubjectAltName(name.clone()));
        }
        if let Some(patterns) = &rule.permitted_dns {
            if !patterns.iter().any(|p| dns_matches(p, name)) {
                return Err(ValidationError::SanNotPermitted(name.clone()));
            }
        }
    }
    Ok(())
}

/// Hostname syntax with an optional single leftmost wildcard label
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let mut labels = name.split('.').peekable();
    let mut first = true;
    let mut count = 0;
    while let Some(label) = labels.next() {
        count += 1;
        if first && label == "*" && labels.peek().is_some() {
            first = false;
            continue;
        }
        first = false;
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
    }
    count >= 1
}

/// `*.example.com` matches any name under example.com (at any depth, and the wildcard
/// form itself); a pattern without a wildcard matches only itself.
fn dns_matches(pattern: &str, name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => name == pattern || name.ends_with(&format!(".{}", suffix)),
        None => name == pattern,
    }
}
