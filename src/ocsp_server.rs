//! HTTP front end for the OCSP responder
//!
//! `POST /` with an `application/ocsp-request` body, answered with
//! `application/ocsp-response`. Signing runs on the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::ocsp::OcspResponder;

pub const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";
pub const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

pub fn router(responder: Arc<OcspResponder>, timeout: Duration) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .layer(TimeoutLayer::new(timeout))
        .with_state(responder)
}

async fn handle_request(
    State(responder): State<Arc<OcspResponder>>,
    body: Bytes,
) -> Response {
    match tokio::task::spawn_blocking(move || responder.respond(&body)).await {
        Ok(der) => ([(header::CONTENT_TYPE, OCSP_RESPONSE_CONTENT_TYPE)], der).into_response(),
        Err(e) => {
            error!(error = %e, "OCSP worker failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Running listener; dropped handles keep serving until [`OcspServer::stop`]
pub struct OcspServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl OcspServer {
    pub async fn start(
        addr: SocketAddr,
        responder: Arc<OcspResponder>,
        timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind OCSP listener on {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read OCSP listener address")?;
        let (tx, rx) = oneshot::channel::<()>();
        let app = router(responder, timeout);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });
        info!(%local_addr, "OCSP responder listening");
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for in-flight ones to finish
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .context("OCSP server task panicked")?
            .context("OCSP server failed")?;
        info!(local_addr = %self.local_addr, "OCSP responder stopped");
        Ok(())
    }
}
