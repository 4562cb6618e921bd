//! Distinguished names
//!
//! [`DistinguishedName`] is the subject/issuer identity carried through policy
//! evaluation, the serial ledger and certificate construction. Field order follows
//! the conventional `C, ST, L, O, OU, CN, emailAddress` layout so that names built
//! from the same value always encode identically.

use std::fmt;
use std::str::FromStr;

use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameRef};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, ValidationError};
use crate::policy::DnField;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl DistinguishedName {
    /// A name carrying only a common name
    pub fn with_common_name(cn: impl Into<String>) -> Self {
        Self {
            common_name: Some(cn.into()),
            ..Self::default()
        }
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = Some(ou.into());
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Value of a field, with blank strings treated as absent
    pub fn get(&self, field: DnField) -> Option<&str> {
        let value = match field {
            DnField::Country => &self.country,
            DnField::State => &self.state,
            DnField::Locality => &self.locality,
            DnField::Organization => &self.organization,
            DnField::OrganizationalUnit => &self.organizational_unit,
            DnField::CommonName => &self.common_name,
            DnField::Email => &self.email,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    fn slot_mut(&mut self, field: DnField) -> &mut Option<String> {
        match field {
            DnField::Country => &mut self.country,
            DnField::State => &mut self.state,
            DnField::Locality => &mut self.locality,
            DnField::Organization => &mut self.organization,
            DnField::OrganizationalUnit => &mut self.organizational_unit,
            DnField::CommonName => &mut self.common_name,
            DnField::Email => &mut self.email,
        }
    }

    /// Common name or an empty string
    pub fn cn(&self) -> &str {
        self.get(DnField::CommonName).unwrap_or("")
    }

    /// Normalized identity used for the live-subject uniqueness check
    pub fn identity_key(&self) -> String {
        self.cn().to_ascii_lowercase()
    }

    /// Build an OpenSSL name in canonical field order
    pub fn to_x509_name(&self) -> Result<X509Name, CryptoError> {
        let mut builder = X509Name::builder()
            .map_err(|e| CryptoError::new("create name builder", e))?;
        for field in DnField::ALL {
            if let Some(value) = self.get(field) {
                builder
                    .append_entry_by_nid(field.nid(), value)
                    .map_err(|e| {
                        CryptoError::new(format!("set {}", field.short_name()), e)
                            .for_subject(self.to_string())
                    })?;
            }
        }
        Ok(builder.build())
    }

    /// Read the known fields back out of an OpenSSL name
    pub fn from_x509_name(name: &X509NameRef) -> Result<Self, ValidationError> {
        let mut dn = DistinguishedName::default();
        for field in DnField::ALL {
            if let Some(entry) = name.entries_by_nid(field.nid()).next() {
                let value = entry
                    .data()
                    .to_string()
                    .map_err(|e| ValidationError::InvalidName(e.to_string()))?;
                if value.contains('\0') {
                    return Err(ValidationError::InvalidName(format!(
                        "{} contains a NUL byte",
                        field.short_name()
                    )));
                }
                *dn.slot_mut(field) = Some(value);
            }
        }
        Ok(dn)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = DnField::ALL
            .iter()
            .rev()
            .filter_map(|field| {
                self.get(*field)
                    .map(|v| format!("{}={}", field.short_name(), v.replace(',', "\\,")))
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Parses `CN=app.example.com,O=Acme,C=US` (RFC 4514 style, `\,` escapes a comma)
/// or the OpenSSL `/C=US/O=Acme/CN=app` form.
impl FromStr for DistinguishedName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ValidationError::EmptyInput("distinguished name"));
        }
        let parts = if let Some(rest) = s.strip_prefix('/') {
            rest.split('/').map(str::to_string).collect()
        } else {
            split_escaped(s)
        };

        let mut dn = DistinguishedName::default();
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ValidationError::InvalidName(format!("'{}' is not KEY=VALUE", part)))?;
            let field = DnField::from_short_name(key.trim())
                .ok_or_else(|| ValidationError::InvalidName(format!("unknown attribute '{}'", key)))?;
            *dn.slot_mut(field) = Some(value.trim().to_string());
        }
        Ok(dn)
    }
}

fn split_escaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

impl DnField {
    pub(crate) fn nid(self) -> Nid {
        match self {
            DnField::Country => Nid::COUNTRYNAME,
            DnField::State => Nid::STATEORPROVINCENAME,
            DnField::Locality => Nid::LOCALITYNAME,
            DnField::Organization => Nid::ORGANIZATIONNAME,
            DnField::OrganizationalUnit => Nid::ORGANIZATIONALUNITNAME,
            DnField::CommonName => Nid::COMMONNAME,
            DnField::Email => Nid::PKCS9_EMAILADDRESS,
        }
    }
}
