//! JSON-RPC 2.0 client for the tool gateway (`tools/call`, `tools/list`).
//!
//! Mirrors the shared pooled-client convention used elsewhere in this
//! codebase: one `reqwest::Client` per role, built once and cloned cheaply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Deserialize, Default)]
struct McpContentItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct McpResult {
    #[serde(default)]
    content: Vec<McpContentItem>,
}

/// A single gateway tool invocation outcome: either the concatenated text
/// content of the tool's response, or a local failure message.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Ok(String),
    Err(String),
}

impl ToolOutcome {
    pub fn byte_len(&self) -> u64 {
        match self {
            ToolOutcome::Ok(s) => s.len() as u64,
            ToolOutcome::Err(s) => s.len() as u64,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, ToolOutcome::Err(_))
    }

    pub fn text(&self) -> &str {
        match self {
            ToolOutcome::Ok(s) | ToolOutcome::Err(s) => s,
        }
    }
}

pub struct GatewayClient {
    base_url: String,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build gateway HTTP client");
        GatewayClient { base_url: base_url.into(), client }
    }

    /// Invokes `tools/call` for `name` with `arguments`, returning the
    /// concatenated `text` fields of the MCP-style content envelope.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolOutcome {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        match self.rpc("tools/call", params).await {
            Ok(value) => {
                match serde_json::from_value::<McpResult>(value) {
                    Ok(mcp) => {
                        let text: String = mcp
                            .content
                            .iter()
                            .filter(|c| c.kind == "text" || c.kind.is_empty())
                            .map(|c| c.text.as_str())
                            .collect();
                        ToolOutcome::Ok(text)
                    }
                    Err(_) => ToolOutcome::Ok(String::new()),
                }
            }
            Err(msg) => ToolOutcome::Err(msg),
        }
    }

    pub async fn list_tools(&self) -> Result<Value, String> {
        self.rpc("tools/list", serde_json::json!({})).await
    }

    /// Convenience wrapper over the secret-store-get/put tools the
    /// collector and kill switch depend on.
    pub async fn secret_get(&self, key: &str) -> Result<Option<String>, String> {
        let outcome = self
            .call_tool("secret-store-get", serde_json::json!({ "name": key }))
            .await;
        match outcome {
            ToolOutcome::Ok(text) if text.is_empty() => Ok(None),
            ToolOutcome::Ok(text) => Ok(Some(text)),
            ToolOutcome::Err(msg) => Err(msg),
        }
    }

    pub async fn secret_put(&self, key: &str, value: &str) -> Result<(), String> {
        let outcome = self
            .call_tool(
                "secret-store-put",
                serde_json::json!({ "name": key, "value": value }),
            )
            .await;
        match outcome {
            ToolOutcome::Err(msg) => Err(msg),
            ToolOutcome::Ok(_) => Ok(()),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = RpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let resp = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let parsed: RpcResponse = resp.json().await.map_err(|e| e.to_string())?;
        if let Some(err) = parsed.error {
            if !err.message.is_empty() {
                return Err(err.message);
            }
            return Err(format!("rpc error code {}", err.code));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_outcome_byte_len_counts_text() {
        let ok = ToolOutcome::Ok("0123456789".to_string());
        assert_eq!(ok.byte_len(), 10);
        assert!(!ok.is_err());
    }

    #[test]
    fn tool_outcome_err_is_err() {
        let err = ToolOutcome::Err("boom".to_string());
        assert!(err.is_err());
        assert_eq!(err.byte_len(), 4);
    }
}
