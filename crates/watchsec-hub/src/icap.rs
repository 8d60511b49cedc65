//! TCP listener answering ICAP requests with a fixed always-allow reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use watchsec_core::config::IcapSection;
use watchsec_core::icap::{IcapCapabilities, IcapMethod};

/// Longest header line accepted before the session is dropped.
const MAX_HEADER_LINE: usize = 8192;

pub struct IcapListener {
    addr: SocketAddr,
    capabilities: Arc<IcapCapabilities>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl IcapListener {
    pub fn new(
        addr: SocketAddr,
        capabilities: IcapCapabilities,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            capabilities: Arc::new(capabilities),
            idle_timeout,
            cancel,
        }
    }

    pub fn from_config(section: &IcapSection, addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self::new(
            addr,
            IcapCapabilities {
                service: section.service.clone(),
                istag: section.istag.clone(),
            },
            Duration::from_secs(section.idle_timeout_secs),
            cancel,
        )
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let (listener, _) = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "icap responder listening");
        Ok((listener, local_addr))
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let caps = Arc::clone(&self.capabilities);
                            let idle = self.idle_timeout;
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_icap_session(stream, peer, caps, idle, cancel).await {
                                    tracing::debug!(peer = %peer, error = %e, "icap session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "icap: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("icap responder: cancellation requested, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_icap_session(
    stream: TcpStream,
    peer: SocketAddr,
    caps: Arc<IcapCapabilities>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_HEADER_LINE));
    let mut first_line: Option<String> = None;

    // Read the header block; only the request line matters.
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, lines.next()) => next,
            _ = cancel.cancelled() => return Ok(()),
        };
        match next {
            Err(_) => {
                tracing::debug!(peer = %peer, "icap: idle timeout");
                return Ok(());
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(std::io::Error::other(e)),
            Ok(Some(Ok(line))) => {
                if line.is_empty() {
                    break;
                }
                if first_line.is_none() {
                    first_line = Some(line);
                }
            }
        }
    }

    let Some(method) = first_line.as_deref().and_then(IcapMethod::classify) else {
        tracing::debug!(peer = %peer, line = ?first_line, "icap: unrecognised request, closing");
        return Ok(());
    };

    tracing::debug!(peer = %peer, method = ?method, "icap: request answered");
    writer.write_all(caps.respond(method).as_bytes()).await?;
    writer.shutdown().await
}
