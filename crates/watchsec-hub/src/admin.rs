//! Local command API: newline-delimited JSON-RPC over a Unix socket.
//!
//! Supported methods:
//!   - `execute_command`  -- audit and deliver an operator command
//!   - `list_connections` -- registry counts
//!   - `latest_frame`     -- most recent frame for one agent
//!   - `recent_events`    -- stored security events for one agent, newest first
//!
//! Access control is the socket's file mode (dir 0700, socket 0600).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::commands::CommandRequest;
use crate::hub::Hub;
use crate::ports::EventStore;
use crate::protocol::{
    DISPATCH_FAILED, INVALID_PARAMS, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    PARSE_ERROR,
};

/// Events returned by `recent_events` when no limit is given.
pub const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentParams {
    agent_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Clone)]
struct AdminContext {
    hub: Hub,
    history: Arc<dyn EventStore>,
}

pub struct AdminServer {
    socket_path: PathBuf,
    ctx: AdminContext,
    cancel: CancellationToken,
}

impl AdminServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        hub: Hub,
        history: Arc<dyn EventStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            ctx: AdminContext { hub, history },
            cancel,
        }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Prepare the socket directory, clear a stale socket and bind.
    pub async fn bind(&self) -> std::io::Result<UnixListener> {
        if let Some(dir) = self.socket_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("another hub is already serving {}", self.socket_path.display()),
                ));
            }
            std::fs::remove_file(&self.socket_path)?;
            tracing::info!(path = %self.socket_path.display(), "admin: removed stale socket");
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(path = %self.socket_path.display(), "admin server listening");
        Ok(listener)
    }

    pub async fn serve(&self, listener: UnixListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, ctx).await {
                                    tracing::debug!(error = %e, "admin client handler finished with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "admin: accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("admin server: cancellation requested, shutting down");
                    break;
                }
            }
        }
        remove_socket(&self.socket_path);
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "admin: could not remove socket");
        }
    }
}

async fn handle_client(stream: UnixStream, ctx: AdminContext) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => {
                tracing::debug!(method = %req.method, id = ?req.id, "admin: request received");
                handle_request(&ctx, req).await
            }
            Err(e) => JsonRpcResponse::err(None, PARSE_ERROR, format!("parse error: {e}")),
        };
        write_json(&mut writer, &resp).await?;
    }
    Ok(())
}

async fn handle_request(ctx: &AdminContext, req: JsonRpcRequest) -> JsonRpcResponse {
    let id = req.id;
    match req.method.as_str() {
        "execute_command" => {
            let cmd: CommandRequest = match serde_json::from_value(req.params) {
                Ok(c) => c,
                Err(e) => return invalid_params(id, e),
            };
            let agent_id = cmd.agent_id.clone();
            let command = cmd.command.clone();
            match ctx.hub.commands.dispatch(cmd).await {
                Ok(receipt) => JsonRpcResponse::ok(
                    id,
                    serde_json::json!({
                        "status": "Sent",
                        "message": format!("Command {command} sent to {agent_id}"),
                        "delivered": receipt.delivered,
                        "delivery": receipt.delivery,
                    }),
                ),
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, command = %command, error = %e, "admin: command not dispatched");
                    JsonRpcResponse::err(id, DISPATCH_FAILED, e.to_string())
                }
            }
        }

        "list_connections" => match serde_json::to_value(ctx.hub.gateway.snapshot()) {
            Ok(v) => JsonRpcResponse::ok(id, v),
            Err(e) => JsonRpcResponse::err(id, DISPATCH_FAILED, e.to_string()),
        },

        "latest_frame" => {
            let params: AgentParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return invalid_params(id, e),
            };
            let image = ctx.hub.capture.latest_frame(&params.agent_id);
            JsonRpcResponse::ok(
                id,
                serde_json::json!({
                    "agentId": params.agent_id,
                    "image": image.as_deref(),
                }),
            )
        }

        "recent_events" => {
            let params: AgentParams = match serde_json::from_value(req.params) {
                Ok(p) => p,
                Err(e) => return invalid_params(id, e),
            };
            let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
            match ctx.history.recent_security_events(&params.agent_id, limit).await {
                Ok(events) => JsonRpcResponse::ok(id, serde_json::json!({ "events": events })),
                Err(e) => JsonRpcResponse::err(id, DISPATCH_FAILED, e.to_string()),
            }
        }

        other => JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    }
}

fn invalid_params(id: Option<u64>, e: serde_json::Error) -> JsonRpcResponse {
    JsonRpcResponse::err(id, INVALID_PARAMS, format!("invalid params: {e}"))
}

/// Serialize a value as a single JSON line terminated by `\n` and flush.
async fn write_json<T: serde::Serialize>(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}
