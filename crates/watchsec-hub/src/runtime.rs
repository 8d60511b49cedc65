//! Process wiring: open collaborators, start every listener, stop on signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use watchsec_core::config::HubConfig;

use crate::admin::AdminServer;
use crate::frames::FsFrameStore;
use crate::hub::{Collaborators, Hub};
use crate::icap::IcapListener;
use crate::mail::{MailListener, MailSettings};
use crate::store::SqliteBackend;
use crate::ws_server::HubServer;

/// How long listeners get to wind down after cancellation.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the sqlite store named by the config, creating its directory.
pub fn open_backend(config: &HubConfig) -> anyhow::Result<SqliteBackend> {
    let path = &config.storage.database;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }
    SqliteBackend::open(path).with_context(|| format!("opening database {}", path.display()))
}

/// Run every listener until `cancel` fires. A listener that cannot bind is
/// logged and left stopped; the rest keep serving.
pub async fn serve(config: HubConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let backend = Arc::new(open_backend(&config)?);
    let frames = Arc::new(FsFrameStore::new(&config.capture.screenshots_dir));
    let hub = Hub::new(
        &config,
        Collaborators {
            tenants: backend.clone(),
            sessions: backend.clone(),
            audit: backend.clone(),
            events: backend.clone(),
            frames,
        },
    );

    let mut tasks = JoinSet::new();

    let hub_server = HubServer::new(config.hub_addr()?, hub.clone(), cancel.clone())
        .with_max_connections(config.hub.max_connections);
    tasks.spawn(supervise("hub", async move { hub_server.run().await }));

    if config.mail.enabled {
        let mail = MailListener::new(
            config.mail_addr()?,
            backend.clone(),
            MailSettings::from(&config.mail),
            cancel.clone(),
        );
        tasks.spawn(supervise("mail", async move { mail.run().await }));
    } else {
        tracing::info!("mail interceptor disabled");
    }

    if config.icap.enabled {
        let icap = IcapListener::from_config(&config.icap, config.icap_addr()?, cancel.clone());
        tasks.spawn(supervise("icap", async move { icap.run().await }));
    } else {
        tracing::info!("icap responder disabled");
    }

    let admin = AdminServer::new(&config.admin.socket, hub, backend, cancel.clone());
    tasks.spawn(supervise("admin", async move { admin.run().await }));

    cancel.cancelled().await;
    tracing::info!("shutting down listeners");

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("listeners did not stop in time, aborting");
        tasks.abort_all();
    }
    Ok(())
}

async fn supervise<F>(name: &'static str, listener: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = listener.await {
        tracing::error!(listener = name, error = %e, "listener failed, continuing without it");
    }
}

/// Resolve on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(dir: &std::path::Path) -> HubConfig {
        let mut config = HubConfig::default();
        config.hub.listen = format!("127.0.0.1:{}", free_port());
        config.mail.listen = format!("127.0.0.1:{}", free_port());
        config.icap.listen = format!("127.0.0.1:{}", free_port());
        config.storage.database = dir.join("db/hub.db");
        config.capture.screenshots_dir = dir.join("shots");
        config.admin.socket = dir.join("admin/admin.sock");
        config
    }

    async fn icap_options(port: u16) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                stream.write_all(b"OPTIONS icap://x ICAP/1.0\r\n\r\n").await.unwrap();
                let mut out = String::new();
                stream.read_to_string(&mut out).await.unwrap();
                return out;
            }
            assert!(tokio::time::Instant::now() < deadline, "icap never came up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn failed_listener_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Occupy the mail port.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.mail.listen = blocker.local_addr().unwrap().to_string();
        let icap_port: u16 = config.icap_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(serve(config, cancel.clone()));

        let reply = icap_options(icap_port).await;
        assert!(reply.contains("Methods: RESPMOD, REQMOD"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("runtime did not stop")
            .unwrap()
            .unwrap();
        assert!(dir.path().join("db/hub.db").exists());
    }

    #[tokio::test]
    async fn disabled_listeners_are_not_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.icap.enabled = false;
        let icap_port = config.icap_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(serve(config, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(TcpStream::connect(("127.0.0.1", icap_port)).await.is_err());

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
