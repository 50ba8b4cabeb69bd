use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use std::time::Duration;

use super::amount::Raw;
use super::block::{Block, BlockSubtype};
use super::crypto::Address;
use super::work::WorkResult;

const ACCOUNT_NOT_FOUND: &str = "Account not found";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Node error: {0}")]
    Node(String),

    #[error("Invalid response to {action}: {reason}")]
    InvalidResponse { action: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Confirmed and receivable balance of an account
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "BalanceFields")]
pub struct AccountBalance {
    pub balance: Raw,
    pub pending: Raw,
}

// Newer nodes send both `pending` and `receivable`, older ones only `pending`
#[derive(Deserialize)]
struct BalanceFields {
    balance: Raw,
    #[serde(default)]
    pending: Option<Raw>,
    #[serde(default)]
    receivable: Option<Raw>,
}

impl From<BalanceFields> for AccountBalance {
    fn from(fields: BalanceFields) -> Self {
        AccountBalance {
            balance: fields.balance,
            pending: fields.receivable.or(fields.pending).unwrap_or_else(Raw::zero),
        }
    }
}

/// Chain head of an opened account
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountInfo {
    pub frontier: String,
    pub balance: Raw,
    #[serde(default)]
    pub representative: Option<Address>,
}

/// An incoming send not yet received
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBlock {
    pub hash: String,
    pub amount: Raw,
    pub source: Option<Address>,
}

/// Request/response calls to the ledger node
///
/// Every call is a JSON POST of `{"action": ..., ...}`, answered with either
/// the result object or `{"error": "..."}`.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn account_balance(&self, address: &Address) -> Result<AccountBalance, RpcError>;

    /// `None` when the account has never been opened
    async fn account_info(&self, address: &Address) -> Result<Option<AccountInfo>, RpcError>;

    /// The account owning a block
    async fn block_account(&self, hash: &str) -> Result<Address, RpcError>;

    /// Publishes a block, returning its hash
    async fn process(&self, block: &Block, subtype: BlockSubtype) -> Result<String, RpcError>;

    async fn accounts_pending(&self, address: &Address, count: usize) -> Result<Vec<PendingBlock>, RpcError>;

    async fn representatives_online(&self) -> Result<Vec<Address>, RpcError>;

    async fn work_generate(&self, hash: &str, difficulty: &str) -> Result<WorkResult, RpcError>;

    /// Where requests go, for log lines
    fn endpoint(&self) -> &str;
}

/// `NodeRpc` over HTTP
#[derive(Debug, Clone)]
pub struct HttpNodeRpc {
    http_client: reqwest::Client,
    url: String,
}

fn invalid(action: &str, reason: impl ToString) -> RpcError {
    RpcError::InvalidResponse {
        action: action.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T: DeserializeOwned>(action: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| invalid(action, e))
}

impl HttpNodeRpc {
    /// Creates a client for one node
    ///
    /// # Arguments
    ///
    /// * `url` - The node's RPC URL
    /// * `api_key` - Sent verbatim as the `Authorization` header when present
    /// * `timeout` - Per-request timeout
    pub fn new(url: impl Into<String>, api_key: Option<&str>, timeout: Duration) -> Result<Self, RpcError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| RpcError::Config(format!("invalid API key header: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;

        Ok(HttpNodeRpc {
            http_client,
            url: url.into(),
        })
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, RpcError> {
        let mut body = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert("action".to_string(), Value::String(action.to_string()));
        debug!("{} {}: {}", self.url, action, Value::Object(body.clone()));

        let response = self.http_client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response.json().await?;
        if let Some(error) = value.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(RpcError::Node(message));
        }

        Ok(value)
    }
}

/// Entries of an `accounts_pending` response for one account
fn pending_blocks_of(address: &Address, response: &Value) -> Result<Vec<PendingBlock>, RpcError> {
    // An account without receivables comes back as "" rather than {}
    let entries = match response.get("blocks").and_then(|b| b.get(&address.0)) {
        Some(Value::Object(entries)) => entries,
        _ => return Ok(Vec::new()),
    };

    entries
        .iter()
        .map(|(hash, info)| {
            let amount = info
                .get("amount")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("accounts_pending", format!("missing amount for {}", hash)))?
                .parse()
                .map_err(|e| invalid("accounts_pending", e))?;
            let source = info
                .get("source")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok());

            Ok(PendingBlock {
                hash: hash.clone(),
                amount,
                source,
            })
        })
        .collect()
}

/// Representatives come back either as a list or, with weights, as a map
fn representatives_of(response: &Value) -> Result<Vec<Address>, RpcError> {
    let names: Vec<&str> = match response.get("representatives") {
        Some(Value::Array(list)) => list.iter().filter_map(Value::as_str).collect(),
        Some(Value::Object(map)) => map.keys().map(String::as_str).collect(),
        Some(Value::String(s)) if s.is_empty() => Vec::new(),
        _ => return Err(invalid("representatives_online", "missing representatives")),
    };

    names
        .into_iter()
        .map(|name| name.parse().map_err(|e| invalid("representatives_online", e)))
        .collect()
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn account_balance(&self, address: &Address) -> Result<AccountBalance, RpcError> {
        let response = self.call("account_balance", json!({ "account": address })).await?;
        parse("account_balance", response)
    }

    async fn account_info(&self, address: &Address) -> Result<Option<AccountInfo>, RpcError> {
        let result = self
            .call("account_info", json!({ "account": address, "representative": "true" }))
            .await;

        match result {
            Ok(response) => parse("account_info", response).map(Some),
            Err(RpcError::Node(message)) if message.contains(ACCOUNT_NOT_FOUND) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn block_account(&self, hash: &str) -> Result<Address, RpcError> {
        let response = self.call("block_account", json!({ "hash": hash })).await?;
        response
            .get("account")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("block_account", "missing account"))?
            .parse()
            .map_err(|e| invalid("block_account", e))
    }

    async fn process(&self, block: &Block, subtype: BlockSubtype) -> Result<String, RpcError> {
        let response = self
            .call(
                "process",
                json!({
                    "json_block": "true",
                    "subtype": subtype.as_str(),
                    "block": block,
                }),
            )
            .await?;

        response
            .get("hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid("process", "missing hash"))
    }

    async fn accounts_pending(&self, address: &Address, count: usize) -> Result<Vec<PendingBlock>, RpcError> {
        let response = self
            .call(
                "accounts_pending",
                json!({
                    "accounts": [address],
                    "count": count.to_string(),
                    "source": "true",
                }),
            )
            .await?;

        pending_blocks_of(address, &response)
    }

    async fn representatives_online(&self) -> Result<Vec<Address>, RpcError> {
        let response = self.call("representatives_online", json!({})).await?;
        representatives_of(&response)
    }

    async fn work_generate(&self, hash: &str, difficulty: &str) -> Result<WorkResult, RpcError> {
        let response = self
            .call(
                "work_generate",
                json!({
                    "json_block": "true",
                    "hash": hash,
                    "difficulty": difficulty,
                }),
            )
            .await?;

        let field = |name: &str| response.get(name).and_then(Value::as_str).map(str::to_string);
        Ok(WorkResult {
            hash: field("hash").unwrap_or_else(|| hash.to_string()),
            work: field("work").ok_or_else(|| invalid("work_generate", "missing work"))?,
            difficulty: field("difficulty").unwrap_or_else(|| difficulty.to_string()),
            multiplier: field("multiplier").unwrap_or_default(),
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}
