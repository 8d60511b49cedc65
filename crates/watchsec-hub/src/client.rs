use std::path::Path;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use watchsec_core::types::SecurityEvent;

use crate::commands::CommandRequest;
use crate::gateway::GatewaySnapshot;
use crate::protocol::JsonRpcResponse;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("admin socket io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("missing result in response")]
    MissingResult,
    #[error("hub closed the connection")]
    Closed,
}

/// Minimal client for the hub's admin socket.
pub struct AdminClient {
    stream: BufReader<UnixStream>,
    next_id: u64,
}

/// Extract `result` from a raw response line.
fn parse_response(line: &str) -> Result<serde_json::Value, ClientError> {
    let resp: JsonRpcResponse = serde_json::from_str(line)?;
    if let Some(err) = resp.error {
        return Err(ClientError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    resp.result.ok_or(ClientError::MissingResult)
}

#[derive(Debug, Deserialize)]
struct LatestFrame {
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentEvents {
    events: Vec<SecurityEvent>,
}

impl AdminClient {
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream: BufReader::new(stream),
            next_id: 1,
        })
    }

    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        request.push(b'\n');

        let writer = self.stream.get_mut();
        writer.write_all(&request).await?;
        writer.flush().await?;

        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        parse_response(&line)
    }

    pub async fn execute_command(
        &mut self,
        req: &CommandRequest,
    ) -> Result<serde_json::Value, ClientError> {
        self.call("execute_command", serde_json::to_value(req)?).await
    }

    pub async fn list_connections(&mut self) -> Result<GatewaySnapshot, ClientError> {
        let v = self.call("list_connections", serde_json::json!({})).await?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn latest_frame(&mut self, agent_id: &str) -> Result<Option<String>, ClientError> {
        let v = self
            .call("latest_frame", serde_json::json!({ "agentId": agent_id }))
            .await?;
        Ok(serde_json::from_value::<LatestFrame>(v)?.image)
    }

    pub async fn recent_events(
        &mut self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SecurityEvent>, ClientError> {
        let v = self
            .call(
                "recent_events",
                serde_json::json!({ "agentId": agent_id, "limit": limit }),
            )
            .await?;
        Ok(serde_json::from_value::<RecentEvents>(v)?.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_success() {
        let v = parse_response(r#"{"jsonrpc":"2.0","id":1,"result":{"status":"Sent"}}"#).unwrap();
        assert_eq!(v["status"], "Sent");
    }

    #[test]
    fn parse_response_error() {
        let err = parse_response(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"audit append failed"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Rpc { code: -32000, .. }));
        assert!(err.to_string().contains("audit append failed"));
    }

    #[test]
    fn parse_response_missing_result() {
        let err = parse_response(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, ClientError::MissingResult));
    }

    #[test]
    fn parse_response_invalid_json() {
        assert!(matches!(
            parse_response("not json at all"),
            Err(ClientError::Json(_))
        ));
    }
}
