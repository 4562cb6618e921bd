//! PKI Authority - two-tier certificate authority
//!
//! Operator CLI over [`pki_authority::authority::CertificateAuthority`]. Every subcommand
//! opens the on-disk store named in the config file, performs one operation and exits,
//! except `serve` (Unix socket IPC) and `ocsp-serve` (HTTP OCSP responder).
//!
//! ```bash
//! pki-authority init
//! pki-authority issue --class server --cn app.example.com
//! pki-authority revoke --serial 0x1001 --reason keyCompromise
//! pki-authority gen-crl
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pki_authority::authority::CertificateAuthority;
use pki_authority::configs::{AppConfig, CaDefaults};
use pki_authority::dn::DistinguishedName;
use pki_authority::external_interface::SocketServer;
use pki_authority::issuance::IssueRequest;
use pki_authority::ocsp::OcspStatus;
use pki_authority::ocsp_server::OcspServer;
use pki_authority::pki_generator::OpensslProvider;
use pki_authority::policy::{CaLevel, CertClass};
use pki_authority::protocol::Protocol;
use pki_authority::serial_index::RevocationReason;
use pki_authority::storage::FileStore;

#[derive(Debug, Parser)]
#[command(name = "pki-authority", version, about = "Two-tier certificate authority")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the root and intermediate CAs from the configured defaults
    Init,
    /// Create the self-signed root CA
    InitRoot {
        #[command(flatten)]
        name: NameArgs,
    },
    /// Create the intermediate CA, signed by the root
    InitIntermediate {
        #[command(flatten)]
        name: NameArgs,
    },
    /// Issue a certificate and export key, certificate and chain as PEM
    Issue {
        #[arg(long, default_value = "server")]
        class: CertClass,
        #[arg(long)]
        cn: String,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Extra DNS names
        #[arg(long = "san")]
        sans: Vec<String>,
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Revoke a serial; publish a CRL afterwards with gen-crl
    Revoke {
        #[arg(long, value_parser = parse_serial)]
        serial: u64,
        #[arg(long, default_value = "unspecified")]
        reason: RevocationReason,
        #[arg(long, default_value = "intermediate", value_parser = parse_level)]
        level: CaLevel,
    },
    /// Build, sign and store a fresh CRL
    GenCrl {
        #[arg(long, default_value = "intermediate", value_parser = parse_level)]
        level: CaLevel,
        /// Also write the PEM here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Revocation status of an intermediate-issued serial
    OcspStatus {
        #[arg(long, value_parser = parse_serial)]
        serial: u64,
    },
    /// List ledger records
    List {
        #[arg(long, default_value = "intermediate", value_parser = parse_level)]
        level: CaLevel,
        #[arg(long)]
        class: Option<CertClass>,
    },
    /// Print hierarchy state and ledger counters
    Status,
    /// Serve the JSON IPC protocol on the configured Unix socket
    Serve,
    /// Serve OCSP over HTTP
    OcspServe {
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,
    },
}

#[derive(Debug, clap::Args)]
struct NameArgs {
    #[arg(long)]
    cn: Option<String>,
    #[arg(long)]
    org: Option<String>,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    days: Option<u32>,
}

impl NameArgs {
    fn empty() -> Self {
        Self {
            cn: None,
            org: None,
            country: None,
            days: None,
        }
    }

    /// Command line values over config defaults
    fn resolve(&self, defaults: &CaDefaults) -> (DistinguishedName, u32) {
        let mut dn = defaults.distinguished_name();
        if let Some(cn) = &self.cn {
            dn.common_name = Some(cn.clone());
        }
        if let Some(org) = &self.org {
            dn.organization = Some(org.clone());
        }
        if let Some(country) = &self.country {
            dn.country = Some(country.clone());
        }
        (dn, self.days.unwrap_or(defaults.validity_days))
    }
}

fn parse_serial(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid serial '{}': {}", s, e))
}

fn parse_level(s: &str) -> Result<CaLevel, String> {
    match s.to_ascii_lowercase().as_str() {
        "root" => Ok(CaLevel::Root),
        "intermediate" => Ok(CaLevel::Intermediate),
        other => Err(format!("unknown CA level '{}'", other)),
    }
}

fn open_authority(config: &AppConfig) -> Result<Arc<CertificateAuthority>> {
    let store = FileStore::new(&config.storage.data_dir, config.passphrase())
        .context("Failed to open CA data directory")?;
    let authority = CertificateAuthority::open(
        Arc::new(OpensslProvider::new()),
        Arc::new(store),
        config.authority_options()?,
    )
    .context("Failed to open certificate authority")?;
    Ok(Arc::new(authority))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    let ca = open_authority(&config)?;

    match cli.command {
        Command::Init => {
            let (root_dn, root_days) = NameArgs::empty().resolve(&config.root_ca);
            let root = ca.init_root(&root_dn, root_days).context("Failed to create root CA")?;
            println!("✓ Root CA created: {} (serial {:#x})", root_dn, root.serial()?);
            let (int_dn, int_days) = NameArgs::empty().resolve(&config.intermediate_ca);
            let intermediate = ca
                .init_intermediate(&int_dn, int_days)
                .context("Failed to create intermediate CA")?;
            println!(
                "✓ Intermediate CA created: {} (serial {:#x})",
                int_dn,
                intermediate.serial()?
            );
        }
        Command::InitRoot { name } => {
            let (dn, days) = name.resolve(&config.root_ca);
            let root = ca.init_root(&dn, days).context("Failed to create root CA")?;
            println!("✓ Root CA created: {} (serial {:#x})", dn, root.serial()?);
        }
        Command::InitIntermediate { name } => {
            let (dn, days) = name.resolve(&config.intermediate_ca);
            let cert = ca
                .init_intermediate(&dn, days)
                .context("Failed to create intermediate CA")?;
            println!("✓ Intermediate CA created: {} (serial {:#x})", dn, cert.serial()?);
        }
        Command::Issue {
            class,
            cn,
            org,
            email,
            sans,
            days,
            out,
        } => {
            let mut subject = DistinguishedName::with_common_name(cn);
            subject.organization = org;
            subject.email = email;
            let request = IssueRequest {
                class,
                subject,
                subject_alt_names: sans,
                validity_days: days.unwrap_or(config.issuance.default_validity_days(class)),
            };
            let bundle = ca.issue(&request).context("Failed to issue certificate")?;
            let dir = out.unwrap_or_else(|| config.storage.export_dir.clone());
            let paths = bundle.export_pem(&dir)?;
            println!(
                "✓ Issued {} certificate {:#x} for {}, valid until {}",
                bundle.issued.record.class,
                bundle.issued.record.serial,
                bundle.issued.record.subject,
                bundle.issued.record.not_after
            );
            for path in paths {
                println!("   {}", path.display());
            }
        }
        Command::Revoke {
            serial,
            reason,
            level,
        } => {
            let record = ca
                .revoke(level, serial, reason)
                .context(format!("Failed to revoke serial {:#x}", serial))?;
            println!("✓ Revoked {:#x} ({}): {}", serial, reason, record.subject);
            println!("  Run gen-crl to publish the updated CRL");
        }
        Command::GenCrl { level, out } => {
            let crl = ca.publish_crl(level).context("Failed to publish CRL")?;
            println!(
                "✓ {} CRL #{} published with {} entries, next update {}",
                level,
                crl.crl_number,
                crl.entries.len(),
                crl.next_update
            );
            if let Some(path) = out {
                write_pem(&path, &crl.to_pem()?)?;
                println!("   {}", path.display());
            }
        }
        Command::OcspStatus { serial } => match ca.ocsp_status(serial)? {
            OcspStatus::Good => println!("{:#x}: good", serial),
            OcspStatus::Unknown => println!("{:#x}: unknown", serial),
            OcspStatus::Revoked { revoked_at, reason } => {
                println!("{:#x}: revoked at {} ({})", serial, revoked_at, reason)
            }
        },
        Command::List { level, class } => {
            let records = ca.list(level, class)?;
            println!("{} certificates: {}", level, records.len());
            for record in records {
                println!(
                    "  {:#x}  {:<12} {:<8} {}  {}",
                    record.serial,
                    record.class.to_string(),
                    format!("{:?}", record.status).to_lowercase(),
                    record.not_after.format("%Y-%m-%d"),
                    record.subject
                );
            }
        }
        Command::Status => {
            let status = ca.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Serve => {
            let protocol = Arc::new(Protocol::new(
                Arc::clone(&ca),
                config.issuance.server_validity_days,
                config.issuance.user_validity_days,
            ));
            let server = SocketServer::bind(&config.server.socket_path, protocol)?;
            println!("✓ Listening on {}", server.path().display());
            server.run()?;
        }
        Command::OcspServe { listen } => {
            let responder = Arc::new(ca.ocsp_responder().context("Failed to prepare OCSP responder")?);
            let addr = listen.unwrap_or(config.ocsp.listen);
            let timeout = Duration::from_secs(config.ocsp.request_timeout_secs);
            let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            rt.block_on(async {
                let server = OcspServer::start(addr, responder, timeout).await?;
                println!("✓ OCSP responder on http://{}", server.local_addr());
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for shutdown signal")?;
                info!("shutdown requested");
                server.stop().await
            })?;
        }
    }
    Ok(())
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, pem).context(format!("Failed to write {}", path.display()))
}
