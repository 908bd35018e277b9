//! HTTPS server for the admission webhooks

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use kube::Client;
use tracing::info;

use machine_api_webhook::{router, ClusterInfo, KubeSecretLookup, WebhookState};

use crate::config::WebhookArgs;
use crate::infrastructure;

/// Certificate file name inside the cert directory
pub const CERT_FILE: &str = "tls.crt";

/// Private key file name inside the cert directory
pub const KEY_FILE: &str = "tls.key";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Load the serving certificate and key from `cert_dir`
pub async fn load_tls(cert_dir: &Path) -> anyhow::Result<RustlsConfig> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);
    let cert = tokio::fs::read(&cert_path)
        .await
        .with_context(|| format!("reading {}", cert_path.display()))?;
    let key = tokio::fs::read(&key_path)
        .await
        .with_context(|| format!("reading {}", key_path.display()))?;
    RustlsConfig::from_pem(cert, key)
        .await
        .context("TLS config error")
}

/// Resolve cluster facts, then serve until SIGINT/SIGTERM
pub async fn run(client: Client, args: &WebhookArgs) -> anyhow::Result<()> {
    let cluster = infrastructure::resolve(&client, args).await?;
    serve(client, cluster, args).await
}

/// Serve the admission routes with `cluster` as defaulting input
pub async fn serve(client: Client, cluster: ClusterInfo, args: &WebhookArgs) -> anyhow::Result<()> {
    let tls = load_tls(&args.cert_dir).await?;
    let state = Arc::new(WebhookState::new(
        cluster,
        Arc::new(KubeSecretLookup::new(client)),
    ));
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.webhook_port));

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!(%addr, "Starting admission webhook server");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("webhook server error")?;
    info!("Admission webhook server stopped");
    Ok(())
}

async fn shutdown_on_signal(handle: Handle) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, draining webhook connections");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_certificates_name_the_file() {
        let dir = std::env::temp_dir().join(format!("mao-no-certs-{}", std::process::id()));
        let err = load_tls(&dir).await.unwrap_err();
        assert!(format!("{err:#}").contains(CERT_FILE));
    }
}
