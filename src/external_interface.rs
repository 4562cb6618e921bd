//! External Interface Module
//!
//! Unix socket server through which external applications drive the authority. Each
//! connection carries one length-prefixed JSON request and gets one response back.

use std::fs;
use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::protocol::{
    deserialize_request, read_frame, serialize_response, write_frame, Protocol, Response,
};

/// Bound listener; call [`SocketServer::run`] to start accepting
pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    protocol: Arc<Protocol>,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file left by a previous run
    pub fn bind(path: &Path, protocol: Arc<Protocol>) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path).context(format!(
                "Failed to remove existing socket at {}",
                path.display()
            ))?;
        }
        let listener = UnixListener::bind(path)
            .context(format!("Failed to bind Unix socket at {}", path.display()))?;
        info!(path = %path.display(), "Unix socket server started");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            protocol,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections forever, one thread per client
    pub fn run(self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let protocol = Arc::clone(&self.protocol);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, &protocol) {
                            error!(error = %format!("{:#}", e), "Error handling client request");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Error accepting connection"),
            }
        }
        Ok(())
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Handle an individual client connection
fn handle_client(mut stream: UnixStream, protocol: &Protocol) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone().context("Failed to clone client stream")?);
    let response = match read_frame(&mut reader).and_then(|body| deserialize_request(&body)) {
        Ok(request) => {
            debug!(?request, "Received request");
            protocol.handle(request)
        }
        Err(e) => Response::Error {
            message: format!("Malformed request: {:#}", e),
        },
    };
    let (_, bytes) = serialize_response(&response)?;
    write_frame(&mut stream, &bytes)
}

/// Send one request to a running server and wait for the response
pub fn send_request(path: &Path, request: &crate::protocol::Request) -> Result<Response> {
    let mut stream = UnixStream::connect(path)
        .context(format!("Failed to connect to {}", path.display()))?;
    let (_, bytes) = crate::protocol::serialize_request(request)?;
    write_frame(&mut stream, &bytes)?;
    let body = read_frame(&mut stream)?;
    crate::protocol::deserialize_response(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityOptions, CertificateAuthority};
    use crate::crypto::KeyAlgorithm;
    use crate::hierarchy::{HierarchyOptions, HierarchyState};
    use crate::pki_generator::OpensslProvider;
    use crate::protocol::Request;
    use crate::storage::MemoryStore;
    use std::io::Write;

    fn server(dir: &Path) -> PathBuf {
        let options = AuthorityOptions {
            hierarchy: HierarchyOptions {
                key_algorithm: KeyAlgorithm::EcP256,
                ..HierarchyOptions::default()
            },
            ..AuthorityOptions::default()
        };
        let ca = CertificateAuthority::open(
            Arc::new(OpensslProvider::new()),
            Arc::new(MemoryStore::new()),
            options,
        )
        .unwrap();
        let protocol = Arc::new(Protocol::new(Arc::new(ca), 90, 30));
        let path = dir.join("pki.sock");
        let server = SocketServer::bind(&path, protocol).unwrap();
        thread::spawn(move || server.run());
        path
    }

    #[test]
    fn answers_requests_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = server(dir.path());

        match send_request(&path, &Request::SocketTest).unwrap() {
            Response::SocketTestResponse { message } => assert_eq!(message, "Socket is working"),
            other => panic!("unexpected {:?}", other),
        }
        match send_request(&path, &Request::Status).unwrap() {
            Response::StatusResponse { status, .. } => {
                assert_eq!(status.state, HierarchyState::Uninitialized)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_gets_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = server(dir.path());

        let mut stream = UnixStream::connect(&path).unwrap();
        let body = b"not json";
        stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .unwrap();
        stream.write_all(body).unwrap();
        let response = crate::protocol::deserialize_response(&read_frame(&mut stream).unwrap())
            .unwrap();
        assert!(matches!(response, Response::Error { .. }));
    }
}
