//! Listener lifecycle: one task per configured address, over plain HTTP or
//! TLS.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Directory holding `<n>_server.crt` / `<n>_server.key` for the n-th
    /// address. Plain HTTP when unset.
    pub cert_dir: Option<PathBuf>,
}

/// Certificate and key files for the listener at `index`.
pub fn tls_files(cert_dir: &Path, index: usize) -> (PathBuf, PathBuf) {
    (
        cert_dir.join(format!("{index}_server.crt")),
        cert_dir.join(format!("{index}_server.key")),
    )
}

/// Starts one listener task per configured address. A listener that fails
/// is logged and stops on its own; the others keep serving.
pub fn spawn_listeners(app: Router, config: &ListenerConfig) -> Vec<JoinHandle<()>> {
    config
        .addresses
        .iter()
        .enumerate()
        .map(|(index, ip)| {
            let addr = SocketAddr::new(*ip, config.port);
            let tls = config
                .cert_dir
                .as_deref()
                .map(|dir| tls_files(dir, index));
            tokio::spawn(run_listener(addr, app.clone(), tls))
        })
        .collect()
}

async fn run_listener(addr: SocketAddr, app: Router, tls: Option<(PathBuf, PathBuf)>) {
    info!("Server listens on {}", addr);
    let result = match tls {
        Some((cert, key)) => serve_tls(addr, app, &cert, &key).await,
        None => match bind_listener(addr).await {
            Ok(listener) => serve(listener, app).await,
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(()) => warn!("Listener on {} stopped", addr),
        Err(err) => error!("Listener on {} failed: {:#}", addr, err),
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind storage listener on {addr}"))
}

/// Serves plain HTTP on an already bound listener.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("storage server terminated unexpectedly")
}

async fn serve_tls(addr: SocketAddr, app: Router, cert: &Path, key: &Path) -> Result<()> {
    let config = RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| {
            format!(
                "failed to load certificate {} and key {}",
                cert.display(),
                key.display()
            )
        })?;

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("storage server terminated unexpectedly")
}
