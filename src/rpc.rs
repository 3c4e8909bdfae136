//! Remote node client
//!
//! The handful of ledger operations the coordinator needs, behind the
//! [`NodeRpc`] trait, and an HTTP implementation speaking the node's
//! action-style JSON RPC.

use crate::types::{Amount, BlockHash, Node};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Remote node communication error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Request never produced a response body
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    /// Node answered with an error
    #[error("{method} rejected by node: {message}")]
    Node { method: String, message: String },

    /// Node answered with something we cannot interpret
    #[error("unexpected {method} response: {detail}")]
    Malformed { method: String, detail: String },
}

/// Ledger operations against one node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn balance(&self, address: &str) -> Result<Amount, RpcError>;

    async fn wallet_contains(&self, wallet: &str, address: &str) -> Result<bool, RpcError>;

    async fn frontier(&self, address: &str) -> Result<BlockHash, RpcError>;

    /// Idempotent per `id`: a repeated id never moves funds twice
    async fn send(
        &self,
        wallet: &str,
        source: &str,
        destination: &str,
        amount: &Amount,
        work: &str,
        id: &str,
    ) -> Result<BlockHash, RpcError>;

    async fn republish(&self, hash: &str) -> Result<(), RpcError>;

    async fn search_pending_all(&self) -> Result<(), RpcError>;

    async fn pending(&self, address: &str) -> Result<Vec<BlockHash>, RpcError>;

    async fn receive(
        &self,
        wallet: &str,
        address: &str,
        block: &str,
        work: Option<&str>,
    ) -> Result<BlockHash, RpcError>;
}

/// Hands out clients for nodes
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, RpcError>;
}

/// JSON RPC client for one node
pub struct HttpNodeClient {
    url: String,
    client: Client,
}

impl HttpNodeClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let url = url.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, RpcError> {
        let mut body = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("action".to_string(), Value::String(action.to_string()));

        debug!("{} -> {}", action, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let json: Value = response.json().await.map_err(|e| RpcError::Malformed {
            method: action.to_string(),
            detail: format!("failed to parse response: {}", e),
        })?;

        check_error(action, json)
    }
}

fn check_error(method: &str, json: Value) -> Result<Value, RpcError> {
    if let Some(error) = json.get("error") {
        return Err(RpcError::Node {
            method: method.to_string(),
            message: error.as_str().unwrap_or("Unknown error").to_string(),
        });
    }
    Ok(json)
}

fn malformed(method: &str, detail: impl Into<String>) -> RpcError {
    RpcError::Malformed {
        method: method.to_string(),
        detail: detail.into(),
    }
}

fn string_field<'a>(method: &str, json: &'a Value, field: &str) -> Result<&'a str, RpcError> {
    json.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(method, format!("missing string field '{}'", field)))
}

/// Balances travel as decimal strings
pub(crate) fn parse_amount(method: &str, raw: &str) -> Result<Amount, RpcError> {
    Amount::from_str(raw).map_err(|e| malformed(method, format!("bad amount '{}': {}", raw, e)))
}

/// Pending blocks come back as `""` when empty, otherwise an array of
/// hashes or an object keyed by hash.
pub(crate) fn parse_pending_blocks(json: &Value) -> Result<Vec<BlockHash>, RpcError> {
    match json.get("blocks") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) if s.is_empty() => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("pending", "non-string block hash"))
            })
            .collect(),
        Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
        Some(other) => Err(malformed("pending", format!("unexpected blocks value {}", other))),
    }
}

pub(crate) fn parse_frontier(json: &Value, address: &str) -> Result<BlockHash, RpcError> {
    json.get("frontiers")
        .and_then(|f| f.get(address))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed("frontiers", format!("no frontier for {}", address)))
}

#[async_trait]
impl NodeRpc for HttpNodeClient {
    async fn balance(&self, address: &str) -> Result<Amount, RpcError> {
        let json = self
            .call("account_balance", json!({ "account": address }))
            .await?;
        parse_amount("account_balance", string_field("account_balance", &json, "balance")?)
    }

    async fn wallet_contains(&self, wallet: &str, address: &str) -> Result<bool, RpcError> {
        let json = self
            .call("wallet_contains", json!({ "wallet": wallet, "account": address }))
            .await?;
        Ok(string_field("wallet_contains", &json, "exists")? == "1")
    }

    async fn frontier(&self, address: &str) -> Result<BlockHash, RpcError> {
        let json = self
            .call("frontiers", json!({ "account": address, "count": "1" }))
            .await?;
        parse_frontier(&json, address)
    }

    async fn send(
        &self,
        wallet: &str,
        source: &str,
        destination: &str,
        amount: &Amount,
        work: &str,
        id: &str,
    ) -> Result<BlockHash, RpcError> {
        let json = self
            .call(
                "send",
                json!({
                    "wallet": wallet,
                    "source": source,
                    "destination": destination,
                    "amount": amount.to_string(),
                    "work": work,
                    "id": id,
                }),
            )
            .await?;
        Ok(string_field("send", &json, "block")?.to_string())
    }

    async fn republish(&self, hash: &str) -> Result<(), RpcError> {
        self.call("republish", json!({ "hash": hash })).await?;
        Ok(())
    }

    async fn search_pending_all(&self) -> Result<(), RpcError> {
        self.call("search_pending_all", json!({})).await?;
        Ok(())
    }

    async fn pending(&self, address: &str) -> Result<Vec<BlockHash>, RpcError> {
        let json = self
            .call("pending", json!({ "account": address, "count": "16" }))
            .await?;
        parse_pending_blocks(&json)
    }

    async fn receive(
        &self,
        wallet: &str,
        address: &str,
        block: &str,
        work: Option<&str>,
    ) -> Result<BlockHash, RpcError> {
        let mut params = json!({ "wallet": wallet, "account": address, "block": block });
        if let Some(work) = work {
            params["work"] = Value::String(work.to_string());
        }
        let json = self.call("receive", params).await?;
        Ok(string_field("receive", &json, "block")?.to_string())
    }
}

/// Connector that keeps one HTTP client per node URL
pub struct HttpConnector {
    timeout: Duration,
    clients: DashMap<String, Arc<HttpNodeClient>>,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: DashMap::new(),
        }
    }
}

impl NodeConnector for HttpConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, RpcError> {
        if let Some(client) = self.clients.get(&node.url) {
            let client: Arc<dyn NodeRpc> = client.value().clone();
            return Ok(client);
        }
        if !node.enabled {
            warn!("Connecting to disabled node {}", node.url);
        }
        let client = Arc::new(HttpNodeClient::new(node.url.clone(), self.timeout)?);
        let client: Arc<dyn NodeRpc> = self
            .clients
            .entry(node.url.clone())
            .or_insert(client)
            .value()
            .clone();
        Ok(client)
    }
}
