//! Protocol Module
//!
//! IPC protocol for the authority: request/response types, length-prefixed JSON framing
//! and [`Protocol`], which maps requests onto [`CertificateAuthority`] calls.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::authority::{AuthorityStatus, CertificateAuthority};
use crate::dn::DistinguishedName;
use crate::issuance::IssueRequest;
use crate::ocsp::OcspStatus;
use crate::policy::{CaLevel, CertClass};
use crate::serial_index::{RecordStatus, RevocationReason, SerialRecord};

/// Frames larger than this are refused before allocating
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

fn default_level() -> CaLevel {
    CaLevel::Intermediate
}

/// Request types from external applications
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    IssueCertificate {
        class: CertClass,
        subject: DistinguishedName,
        #[serde(default)]
        subject_alt_names: Vec<String>,
        /// Falls back to the configured per-class default
        #[serde(default)]
        validity_days: Option<u32>,
    },
    Revoke {
        #[serde(default = "default_level")]
        level: CaLevel,
        serial: u64,
        reason: RevocationReason,
    },
    PublishCrl {
        #[serde(default = "default_level")]
        level: CaLevel,
    },
    OcspQuery {
        serial: u64,
    },
    ListCertificates {
        #[serde(default = "default_level")]
        level: CaLevel,
        #[serde(default)]
        class: Option<CertClass>,
    },
    Status,
    SocketTest,
}

/// Row of a certificate listing; the PEM stays in the ledger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateSummary {
    pub serial: u64,
    pub subject: String,
    pub class: CertClass,
    pub status: RecordStatus,
    pub not_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<&SerialRecord> for CertificateSummary {
    fn from(record: &SerialRecord) -> Self {
        Self {
            serial: record.serial,
            subject: record.subject.to_string(),
            class: record.class,
            status: record.status,
            not_after: record.not_after,
            revoked_at: record.revoked_at,
        }
    }
}

/// Response types sent back to clients
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Response {
    IssueCertificateResponse {
        message: String,
        serial: u64,
        certificate: String,
        private_key: String,
        certificate_chain: Vec<String>,
        not_after: DateTime<Utc>,
    },
    RevokeResponse {
        message: String,
        serial: u64,
        revoked_at: Option<DateTime<Utc>>,
    },
    PublishCrlResponse {
        message: String,
        crl_number: u64,
        revoked_count: usize,
        crl: String,
    },
    OcspQueryResponse {
        message: String,
        serial: u64,
        status: OcspStatus,
    },
    ListCertificatesResponse {
        message: String,
        certificates: Vec<CertificateSummary>,
        count: usize,
    },
    StatusResponse {
        message: String,
        status: AuthorityStatus,
    },
    SocketTestResponse {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Serialize a Request to a length-prefixed byte array
///
/// # Returns
/// * `Result<(u32, Vec<u8>)>` - Tuple of (length, bytes) where bytes includes 4-byte length prefix
///
/// # Example
/// ```no_run
/// use pki_authority::protocol::{Request, serialize_request};
///
/// let request = Request::SocketTest;
/// let (size, bytes) = serialize_request(&request)?;
/// // bytes = [4-byte length] + [JSON data]
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn serialize_request(request: &Request) -> Result<(u32, Vec<u8>)> {
    let json = serde_json::to_vec(request).context("Failed to serialize request to JSON")?;
    frame(json)
}

/// Deserialize a byte array (without the length prefix) to a Request
pub fn deserialize_request(bytes: &[u8]) -> Result<Request> {
    let json_str = std::str::from_utf8(bytes).context("Failed to decode request bytes as UTF-8")?;
    serde_json::from_str(json_str).context("Failed to deserialize JSON to Request")
}

/// Serialize a Response to a length-prefixed byte array
pub fn serialize_response(response: &Response) -> Result<(u32, Vec<u8>)> {
    let json = serde_json::to_vec(response).context("Failed to serialize response to JSON")?;
    frame(json)
}

/// Deserialize a byte array (without the length prefix) to a Response
///
/// # Example
/// ```no_run
/// use pki_authority::protocol::deserialize_response;
///
/// let response_bytes = b"{\"type\":\"SocketTestResponse\",\"message\":\"test\"}";
/// let response = deserialize_response(response_bytes)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn deserialize_response(bytes: &[u8]) -> Result<Response> {
    let json_str =
        std::str::from_utf8(bytes).context("Failed to decode response bytes as UTF-8")?;
    serde_json::from_str(json_str).context("Failed to deserialize JSON to Response")
}

fn frame(json: Vec<u8>) -> Result<(u32, Vec<u8>)> {
    let length = u32::try_from(json.len()).context("Message too large to frame")?;
    let mut buffer = Vec::with_capacity(4 + json.len());
    buffer.extend_from_slice(&length.to_le_bytes());
    buffer.extend_from_slice(&json);
    Ok((length, buffer))
}

/// Read one length-prefixed frame
pub fn read_frame(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .context("Failed to read frame length")?;
    let length = u32::from_le_bytes(len_buf);
    if length > MAX_FRAME_LEN {
        anyhow::bail!("Frame of {} bytes exceeds limit of {}", length, MAX_FRAME_LEN);
    }
    let mut buf = vec![0u8; length as usize];
    reader
        .read_exact(&mut buf)
        .context("Failed to read frame body")?;
    Ok(buf)
}

pub fn write_frame(writer: &mut impl Write, framed: &[u8]) -> Result<()> {
    writer.write_all(framed).context("Failed to write frame")?;
    writer.flush().context("Failed to flush frame")
}

/// Dispatches IPC requests to the authority
pub struct Protocol {
    authority: Arc<CertificateAuthority>,
    server_validity_days: u32,
    user_validity_days: u32,
}

impl Protocol {
    pub fn new(
        authority: Arc<CertificateAuthority>,
        server_validity_days: u32,
        user_validity_days: u32,
    ) -> Self {
        Self {
            authority,
            server_validity_days,
            user_validity_days,
        }
    }

    /// Like [`Protocol::process_request`], with failures turned into `Response::Error`
    pub fn handle(&self, request: Request) -> Response {
        match self.process_request(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "IPC request failed");
                Response::Error {
                    message: format!("{:#}", e),
                }
            }
        }
    }

    pub fn process_request(&self, request: Request) -> Result<Response> {
        match request {
            Request::IssueCertificate {
                class,
                subject,
                subject_alt_names,
                validity_days,
            } => {
                let default_days = match class {
                    CertClass::Server => self.server_validity_days,
                    _ => self.user_validity_days,
                };
                let request = IssueRequest {
                    class,
                    subject,
                    subject_alt_names,
                    validity_days: validity_days.unwrap_or(default_days),
                };
                let bundle = self
                    .authority
                    .issue(&request)
                    .context("Failed to issue certificate")?;
                let record = &bundle.issued.record;
                info!(serial = record.serial, class = %record.class, "issued over IPC");
                Ok(Response::IssueCertificateResponse {
                    message: format!("Issued {} certificate for {}", record.class, record.subject),
                    serial: record.serial,
                    certificate: bundle.issued.certificate.to_pem()?,
                    private_key: bundle.key_pem()?,
                    certificate_chain: bundle
                        .issued
                        .chain
                        .iter()
                        .map(|c| c.to_pem())
                        .collect::<Result<Vec<_>, _>>()?,
                    not_after: record.not_after,
                })
            }
            Request::Revoke {
                level,
                serial,
                reason,
            } => {
                let record = self
                    .authority
                    .revoke(level, serial, reason)
                    .context(format!("Failed to revoke serial {}", serial))?;
                Ok(Response::RevokeResponse {
                    message: format!("Revoked {} ({})", record.subject, reason),
                    serial,
                    revoked_at: record.revoked_at,
                })
            }
            Request::PublishCrl { level } => {
                let crl = self
                    .authority
                    .publish_crl(level)
                    .context("Failed to publish CRL")?;
                Ok(Response::PublishCrlResponse {
                    message: format!("Published {} CRL #{}", level, crl.crl_number),
                    crl_number: crl.crl_number,
                    revoked_count: crl.entries.len(),
                    crl: crl.to_pem()?,
                })
            }
            Request::OcspQuery { serial } => {
                let status = self.authority.ocsp_status(serial)?;
                Ok(Response::OcspQueryResponse {
                    message: format!("Status of serial {}", serial),
                    serial,
                    status,
                })
            }
            Request::ListCertificates { level, class } => {
                let certificates: Vec<CertificateSummary> = self
                    .authority
                    .list(level, class)?
                    .iter()
                    .map(CertificateSummary::from)
                    .collect();
                Ok(Response::ListCertificatesResponse {
                    message: format!("{} certificates", level),
                    count: certificates.len(),
                    certificates,
                })
            }
            Request::Status => {
                let status = self.authority.status();
                Ok(Response::StatusResponse {
                    message: format!("Hierarchy is {}", status.state),
                    status,
                })
            }
            Request::SocketTest => Ok(Response::SocketTestResponse {
                message: "Socket is working".to_string(),
            }),
        }
    }
}
