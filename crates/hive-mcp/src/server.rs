//! Newline-delimited JSON-RPC loop over a reader/writer pair.
//!
//! Requests are handled one at a time in arrival order. A line that fails to
//! parse gets an error response and the loop keeps reading.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use hive_hub::Hub;

use crate::protocol::{
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PromptGetParams,
    ResourceReadParams, ToolCallParams, ToolResult,
};
use crate::{resources, tools};

#[derive(Debug, Clone)]
pub struct McpServer {
    hub: Arc<Hub>,
}

impl McpServer {
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Serve until `reader` reaches EOF.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
        info!("Input closed, MCP loop finished");
        Ok(())
    }

    /// Handle one line of input. Notifications produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparseable request");
                return Some(JsonRpcResponse::failure(Value::Null, JsonRpcError::parse_error(e)));
            }
        };

        let id = raw.get("id").cloned();
        let req: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(req) => req,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    id.unwrap_or(Value::Null),
                    JsonRpcError::invalid_request(e),
                ));
            }
        };
        if let Some(version) = req.jsonrpc.as_deref()
            && version != crate::protocol::JSONRPC_VERSION
        {
            return Some(JsonRpcResponse::failure(
                req.id.unwrap_or(Value::Null),
                JsonRpcError::invalid_request(format!("unsupported jsonrpc version {version}")),
            ));
        }

        let notification = req.is_notification();
        let method = req.method.clone();
        let outcome = self.dispatch(&method, req.params).await;
        if notification {
            if let Err(e) = outcome {
                debug!(method = %method, error = %e.message, "Notification failed");
            }
            return None;
        }

        let id = req.id.unwrap_or(Value::Null);
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                debug!(method = %method, code = error.code, error = %error.message, "Request failed");
                JsonRpcResponse::failure(id, error)
            }
        })
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => {
                if let Some(client) = params.as_ref().and_then(|p| p.get("clientInfo")) {
                    info!(client = %client, "MCP client connected");
                }
                encode(InitializeResult::current())
            }
            "notifications/initialized" | "initialized" | "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::definitions() })),
            "tools/call" => {
                let call: ToolCallParams = params_of(params)?;
                let args = call.arguments.unwrap_or(Value::Null);
                match tools::call(&self.hub, &call.name, args).await {
                    Ok(value) => encode(ToolResult::json(&value)),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool call failed");
                        Err(e.into_rpc(&call.name))
                    }
                }
            }
            "resources/list" => Ok(json!({ "resources": resources::resource_definitions() })),
            "resources/read" => {
                let read: ResourceReadParams = params_of(params)?;
                let content = resources::read_resource(&self.hub, &read.uri).await?;
                Ok(json!({ "contents": [content] }))
            }
            "prompts/list" => Ok(json!({ "prompts": resources::prompt_definitions() })),
            "prompts/get" => {
                let get: PromptGetParams = params_of(params)?;
                let messages = resources::get_prompt(&self.hub, &get.name, &get.arguments).await?;
                Ok(json!({ "messages": messages }))
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

fn params_of<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(JsonRpcError::invalid_params)
}

fn encode(value: impl serde::Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(JsonRpcError::internal)
}
