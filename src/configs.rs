use anyhow::{Context, Result};
use chrono::Duration;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::authority::AuthorityOptions;
use crate::crypto::KeyAlgorithm;
use crate::dn::DistinguishedName;
use crate::hierarchy::HierarchyOptions;
use crate::issuance::DistributionPoints;
use crate::policy::CertClass;
use crate::serial_index::DEFAULT_FIRST_SERIAL;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default = "default_root_ca")]
    pub root_ca: CaDefaults,
    #[serde(default = "default_intermediate_ca")]
    pub intermediate_ca: CaDefaults,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub ocsp: OcspConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Environment variable holding the key passphrase; unset means keys stay unencrypted
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            passphrase_env: default_passphrase_env(),
            export_dir: default_export_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("ca-data")
}

fn default_passphrase_env() -> String {
    "PKI_AUTHORITY_PASSPHRASE".to_string()
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeysConfig {
    #[serde(default = "default_key_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: u32,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            algorithm: default_key_algorithm(),
            rsa_bits: default_rsa_bits(),
        }
    }
}

fn default_key_algorithm() -> String {
    "rsa".to_string()
}

fn default_rsa_bits() -> u32 {
    4096
}

impl KeysConfig {
    pub fn key_algorithm(&self) -> Result<KeyAlgorithm> {
        match self.algorithm.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyAlgorithm::Rsa {
                bits: self.rsa_bits,
            }),
            "ec" | "ecp256" | "p256" | "p-256" => Ok(KeyAlgorithm::EcP256),
            other => anyhow::bail!("Unsupported key algorithm in config: {}", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaDefaults {
    pub common_name: String,
    #[serde(default = "default_organization")]
    pub organization: Option<String>,
    #[serde(default)]
    pub organizational_unit: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "default_country")]
    pub country: Option<String>,
    pub validity_days: u32,
}

impl CaDefaults {
    pub fn distinguished_name(&self) -> DistinguishedName {
        DistinguishedName {
            common_name: Some(self.common_name.clone()),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
            locality: self.locality.clone(),
            state: self.state.clone(),
            country: self.country.clone(),
            ..DistinguishedName::default()
        }
    }
}

fn default_organization() -> Option<String> {
    Some("PKI Authority".to_string())
}

fn default_country() -> Option<String> {
    Some("US".to_string())
}

fn default_root_ca() -> CaDefaults {
    CaDefaults {
        common_name: "PKI Authority Root CA".to_string(),
        organization: default_organization(),
        organizational_unit: None,
        locality: None,
        state: None,
        country: default_country(),
        validity_days: 9215, // ~25 years
    }
}

fn default_intermediate_ca() -> CaDefaults {
    CaDefaults {
        common_name: "PKI Authority Intermediate CA".to_string(),
        validity_days: 7300, // 20 years
        ..default_root_ca()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuanceConfig {
    #[serde(default = "default_first_serial")]
    pub first_serial: u64,
    #[serde(default = "default_server_validity")]
    pub server_validity_days: u32,
    #[serde(default = "default_user_validity")]
    pub user_validity_days: u32,
    #[serde(default)]
    pub permitted_server_dns: Vec<String>,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            first_serial: default_first_serial(),
            server_validity_days: default_server_validity(),
            user_validity_days: default_user_validity(),
            permitted_server_dns: Vec::new(),
        }
    }
}

fn default_first_serial() -> u64 {
    DEFAULT_FIRST_SERIAL
}

fn default_server_validity() -> u32 {
    397
}

fn default_user_validity() -> u32 {
    365
}

impl IssuanceConfig {
    pub fn default_validity_days(&self, class: CertClass) -> u32 {
        match class {
            CertClass::Server => self.server_validity_days,
            _ => self.user_validity_days,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RevocationConfig {
    #[serde(default = "default_crl_validity")]
    pub crl_validity_days: u32,
    #[serde(default)]
    pub crl_url: Option<String>,
    #[serde(default)]
    pub ocsp_url: Option<String>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            crl_validity_days: default_crl_validity(),
            crl_url: None,
            ocsp_url: None,
        }
    }
}

fn default_crl_validity() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcspConfig {
    #[serde(default = "default_ocsp_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_signer_cn")]
    pub signer_common_name: String,
    #[serde(default = "default_signer_validity")]
    pub signer_validity_days: u32,
    #[serde(default = "default_next_update_hours")]
    pub next_update_hours: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for OcspConfig {
    fn default() -> Self {
        Self {
            listen: default_ocsp_listen(),
            signer_common_name: default_signer_cn(),
            signer_validity_days: default_signer_validity(),
            next_update_hours: default_next_update_hours(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_ocsp_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

fn default_signer_cn() -> String {
    "PKI Authority OCSP Responder".to_string()
}

fn default_signer_validity() -> u32 {
    365
}

fn default_next_update_hours() -> u32 {
    24
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/pki_authority.sock")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            keys: KeysConfig::default(),
            root_ca: default_root_ca(),
            intermediate_ca: default_intermediate_ca(),
            issuance: IssuanceConfig::default(),
            revocation: RevocationConfig::default(),
            ocsp: OcspConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Passphrase from the configured environment variable, if set and non-empty
    pub fn passphrase(&self) -> Option<SecretString> {
        std::env::var(&self.storage.passphrase_env)
            .ok()
            .filter(|p| !p.is_empty())
            .map(SecretString::new)
    }

    pub fn authority_options(&self) -> Result<AuthorityOptions> {
        Ok(AuthorityOptions {
            hierarchy: HierarchyOptions {
                key_algorithm: self.keys.key_algorithm()?,
                first_serial: self.issuance.first_serial,
                permitted_server_dns: self.issuance.permitted_server_dns.clone(),
            },
            distribution: DistributionPoints {
                crl_url: self.revocation.crl_url.clone(),
                ocsp_url: self.revocation.ocsp_url.clone(),
            },
            crl_validity_days: self.revocation.crl_validity_days,
            ocsp_signer_subject: DistinguishedName::with_common_name(&self.ocsp.signer_common_name),
            ocsp_signer_validity_days: self.ocsp.signer_validity_days,
            ocsp_next_update: Duration::hours(i64::from(self.ocsp.next_update_hours)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.root_ca.validity_days, 9215);
        assert_eq!(config.intermediate_ca.validity_days, 7300);
        assert_eq!(config.issuance.first_serial, 0x1000);
        assert_eq!(config.revocation.crl_validity_days, 30);
        assert_eq!(config.keys.key_algorithm().unwrap(), KeyAlgorithm::Rsa { bits: 4096 });
    }

    #[test]
    fn sections_override_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [keys]
            algorithm = "ec"

            [root_ca]
            common_name = "Test Root"
            organization = "Acme"
            validity_days = 100

            [issuance]
            permitted_server_dns = ["*.example.com"]

            [revocation]
            crl_url = "http://pki.example.com/int.crl"

            [ocsp]
            listen = "0.0.0.0:9000"
            "#,
        )
        .unwrap();
        let options = config.authority_options().unwrap();
        assert_eq!(options.hierarchy.key_algorithm, KeyAlgorithm::EcP256);
        assert_eq!(options.hierarchy.permitted_server_dns, vec!["*.example.com"]);
        assert_eq!(
            options.distribution.crl_url.as_deref(),
            Some("http://pki.example.com/int.crl")
        );
        assert_eq!(config.root_ca.distinguished_name().cn(), "Test Root");
        assert_eq!(config.root_ca.country.as_deref(), Some("US"));
        assert_eq!(config.ocsp.listen.port(), 9000);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let config: AppConfig = toml::from_str("[keys]\nalgorithm = \"dsa\"").unwrap();
        assert!(config.keys.key_algorithm().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.root_ca.common_name, "PKI Authority Root CA");
        assert_eq!(config.intermediate_ca.common_name, "PKI Authority Intermediate CA");
    }
}
