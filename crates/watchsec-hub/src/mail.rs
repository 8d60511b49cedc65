//! TCP listener driving one [`MailSession`] per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use watchsec_core::config::MailSection;
use watchsec_core::smtp::{self, MailEffect, MailSession};
use watchsec_core::types::MailLogRecord;

use crate::ports::MailStore;

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub greeting: String,
    pub idle_timeout: Duration,
    pub max_line_len: usize,
    pub max_body_bytes: usize,
}

impl From<&MailSection> for MailSettings {
    fn from(section: &MailSection) -> Self {
        Self {
            greeting: section.greeting.clone(),
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
            max_line_len: section.max_line_len,
            max_body_bytes: section.max_body_bytes,
        }
    }
}

impl Default for MailSettings {
    fn default() -> Self {
        Self::from(&MailSection::default())
    }
}

pub struct MailListener {
    addr: SocketAddr,
    store: Arc<dyn MailStore>,
    settings: Arc<MailSettings>,
    cancel: CancellationToken,
}

impl MailListener {
    pub fn new(
        addr: SocketAddr,
        store: Arc<dyn MailStore>,
        settings: MailSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            store,
            settings: Arc::new(settings),
            cancel,
        }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let (listener, _) = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "mail interceptor listening");
        Ok((listener, local_addr))
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let store = Arc::clone(&self.store);
                            let settings = Arc::clone(&self.settings);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_mail_session(stream, peer, store, settings, cancel).await {
                                    tracing::debug!(peer = %peer, error = %e, "mail session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "mail: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("mail interceptor: cancellation requested, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: &str) -> std::io::Result<()> {
    writer.write_all(reply.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn handle_mail_session(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<dyn MailStore>,
    settings: Arc<MailSettings>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(settings.max_line_len));
    let mut session = MailSession::new(settings.max_body_bytes);

    tracing::debug!(peer = %peer, "mail: session opened");
    write_reply(&mut writer, &smtp::greeting(&settings.greeting)).await?;

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(settings.idle_timeout, lines.next()) => next,
            _ = cancel.cancelled() => return Ok(()),
        };

        let line = match next {
            Err(_) => {
                tracing::debug!(peer = %peer, "mail: idle timeout");
                write_reply(&mut writer, smtp::REPLY_IDLE_TIMEOUT).await?;
                return Ok(());
            }
            Ok(None) => {
                tracing::debug!(peer = %peer, "mail: client disconnected");
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(std::io::Error::other(e)),
            Ok(Some(Ok(line))) => line,
        };

        let step = session.feed(&line);
        if let Some(reply) = step.reply {
            write_reply(&mut writer, reply).await?;
        }

        match step.effect {
            Some(MailEffect::Deliver(envelope)) => {
                let record = MailLogRecord {
                    sender: envelope.sender,
                    recipient: envelope.recipient,
                    subject: envelope.subject,
                    body_preview: envelope.body_preview,
                    timestamp: Utc::now(),
                };
                tracing::info!(
                    peer = %peer,
                    sender = %record.sender,
                    recipient = %record.recipient,
                    "mail: message intercepted"
                );
                if let Err(e) = store.insert_mail_log(record).await {
                    tracing::warn!(peer = %peer, error = %e, "mail: failed to persist mail log");
                }
            }
            Some(MailEffect::Close) => {
                writer.shutdown().await?;
                return Ok(());
            }
            None => {}
        }
    }
}
