use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use watchsec_core::types::ConnectionRole;

use crate::gateway::{Admission, ConnectionId, HandshakeRequest};
use crate::hub::Hub;
use crate::protocol::{
    ConnectedPush, FORBIDDEN, HubCall, HubPush, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    PARSE_ERROR,
};

// ---------------------------------------------------------------------------
// HubServer
// ---------------------------------------------------------------------------

/// Default maximum number of concurrent hub connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// WebSocket server carrying the hub's JSON-RPC traffic.
///
/// Every text frame is one JSON-RPC message. Agents and dashboards share the
/// endpoint; the role is fixed by the handshake.
pub struct HubServer {
    addr: SocketAddr,
    hub: Hub,
    cancel: CancellationToken,
    max_connections: usize,
}

impl HubServer {
    pub fn new(addr: SocketAddr, hub: Hub, cancel: CancellationToken) -> Self {
        Self {
            addr,
            hub,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Set the maximum number of concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Bind TCP, then accept connections until the cancellation token fires.
    pub async fn run(&self) -> std::io::Result<()> {
        let (listener, _) = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind to the configured address and return the actual local address.
    /// Useful when binding to port 0 to get an OS-assigned ephemeral port.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "hub server listening");
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    tracing::warn!(
                                        peer = %peer,
                                        max = self.max_connections,
                                        "hub: connection limit reached, rejecting"
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };
                            tracing::debug!(peer = %peer, "hub: TCP connection accepted");
                            let hub = self.hub.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_hub_client(stream, peer, hub, cancel).await {
                                    tracing::debug!(peer = %peer, error = %e, "hub client handler finished with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "hub: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("hub server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-client handler
// ---------------------------------------------------------------------------

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn handle_hub_client(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Hub,
    cancel: CancellationToken,
) -> HandlerResult {
    let mut handshake = HandshakeRequest::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        handshake = HandshakeRequest::from_http(req);
        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;

    let admission = match hub.gateway.authenticate(&handshake).await {
        Ok(admission) => admission,
        Err(reason) => {
            // Dropping the stream aborts the connection without a reply.
            tracing::warn!(
                peer = %peer,
                agent_id = %handshake.agent_label(),
                reason = %reason,
                "hub: connection rejected"
            );
            return Ok(());
        }
    };

    let (id, push_rx) = hub.gateway.register(&admission);
    tracing::info!(
        peer = %peer,
        connection_id = id,
        role = admission.role.label(),
        agent_id = %handshake.agent_label(),
        "hub: client connected"
    );
    let result = run_connection(ws_stream, id, &admission, &hub, push_rx, cancel).await;
    hub.disconnect(id);
    tracing::info!(peer = %peer, connection_id = id, "hub: client disconnected");
    result
}

async fn run_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    id: ConnectionId,
    admission: &Admission,
    hub: &Hub,
    mut push_rx: tokio::sync::mpsc::Receiver<Arc<str>>,
    cancel: CancellationToken,
) -> HandlerResult {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let connected = HubPush::Connected(ConnectedPush {
        connection_id: id,
        role: admission.role.label(),
    });
    ws_tx.send(Message::Text(connected.to_frame()?)).await?;

    loop {
        tokio::select! {
            // --- incoming WebSocket message ---
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = id, error = %e, "hub read error, dropping client");
                        return Err(e.into());
                    }
                    None => {
                        tracing::debug!(connection_id = id, "hub client disconnected (stream ended)");
                        return Ok(());
                    }
                };

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => {
                        tracing::debug!(connection_id = id, "hub client sent close frame");
                        return Ok(());
                    }
                    Message::Ping(data) => {
                        ws_tx.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };

                if let Some(resp) = handle_text(hub, &admission.role, &text) {
                    ws_tx.send(Message::Text(serde_json::to_string(&resp)?)).await?;
                }
            }

            // --- queued push for this connection ---
            frame = push_rx.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                ws_tx.send(Message::Text(frame.to_string())).await?;
            }

            _ = cancel.cancelled() => {
                tracing::debug!(connection_id = id, "hub: shutting down client");
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Handle one text frame. Returns the response to write, if the request
/// carried an id or could not be parsed.
fn handle_text(hub: &Hub, role: &ConnectionRole, text: &str) -> Option<JsonRpcResponse> {
    let req: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return Some(JsonRpcResponse::err(None, PARSE_ERROR, format!("parse error: {e}")));
        }
    };

    tracing::debug!(method = %req.method, id = ?req.id, "hub: request received");
    let id = req.id;

    let result = match HubCall::decode(&req.method, req.params) {
        Ok(call) => dispatch_call(hub, role, call),
        Err(e) => Err(e),
    };

    let id = id?;
    Some(match result {
        Ok(()) => JsonRpcResponse::ok(Some(id), serde_json::json!({ "ok": true })),
        Err(e) => JsonRpcResponse::err(Some(id), e.code, e.message),
    })
}

fn dispatch_call(
    hub: &Hub,
    role: &ConnectionRole,
    call: HubCall,
) -> Result<(), JsonRpcError> {
    match call {
        HubCall::SendScreen(p) => {
            hub.capture.on_frame(&p.agent_id, p.image);
        }
        HubCall::SendEvent(p) => {
            hub.events
                .on_security_event(&p.agent_id, &p.event_type, &p.details);
        }
        HubCall::KillProcess(p) => {
            if !role.is_dashboard() {
                tracing::warn!(agent_id = %p.target_agent_id, "hub: KillProcess refused for agent connection");
                return Err(JsonRpcError {
                    code: FORBIDDEN,
                    message: "only dashboard users may kill processes".into(),
                });
            }
            hub.commands.kill_process(&p.target_agent_id, p.pid);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
