//! Ledger access layer
//!
//! The remote ledger is an opaque read/write contract. `Ledger` is the
//! request/response surface the engine consumes; `JsonRpcLedger` speaks it
//! over JSON-RPC 2.0.
//!
//! # Features
//! - Single-match, bulk-results and ranked-results reads
//! - Auxiliary reads (recorded rewards, inventory, open matches, event logs)
//! - Transaction submission returning a handle
//! - Classification of raw failures into the engine's `ErrorKind`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::engine_error::{EngineError, ErrorKind};
use crate::models::{DecodedEvent, MatchId, MatchResult, MatchSnapshot, Quantity, SizeClass, TxHandle};

/// Raw failure from the ledger transport, before classification.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LedgerError::Timeout
        } else if err.is_decode() {
            LedgerError::InvalidResponse(err.to_string())
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::InvalidResponse(err.to_string())
    }
}

/// Map a raw ledger failure onto the engine taxonomy.
pub fn classify_ledger_error(err: LedgerError) -> EngineError {
    let kind = match &err {
        LedgerError::Http { status, .. } => match *status {
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::ServerError,
            400..=499 => ErrorKind::BadRequest,
            _ => ErrorKind::Unknown,
        },
        LedgerError::Rpc { code, message } => classify_rpc(*code, message),
        LedgerError::Timeout => ErrorKind::Timeout,
        LedgerError::Transport(_) => ErrorKind::Network,
        LedgerError::InvalidResponse(_) => ErrorKind::Unknown,
    };
    EngineError::new(kind, err.to_string())
}

fn classify_rpc(code: i64, message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if code == 4001 || mentions(&["user rejected", "user denied"]) {
        ErrorKind::UserRejected
    } else if mentions(&["insufficient funds", "insufficient balance"]) {
        ErrorKind::InsufficientFunds
    } else if code == -32005 || code == 429 || mentions(&["rate limit", "too many requests"]) {
        ErrorKind::RateLimited
    } else if mentions(&["not ended", "not finished", "results not", "not settled", "not yet computed"]) {
        ErrorKind::ResultsPending
    } else if mentions(&["not found", "does not exist"]) {
        ErrorKind::NotFound
    } else if matches!(code, -32602 | -32601 | -32600 | 3) || mentions(&["execution reverted"]) {
        ErrorKind::BadRequest
    } else if (-32099..=-32000).contains(&code) || code == -32603 {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    }
}

/// Read/write surface of the remote ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn read_match(&self, id: MatchId) -> Result<MatchSnapshot, LedgerError>;

    /// Bulk settlement results, one list per requested id, in request order.
    async fn read_batch_results(&self, ids: &[MatchId]) -> Result<Vec<Vec<MatchResult>>, LedgerError>;

    async fn read_leaderboard(&self, id: MatchId) -> Result<Vec<MatchResult>, LedgerError>;

    /// Total reward recorded as paid out for a match.
    async fn read_recorded_rewards(&self, id: MatchId) -> Result<Quantity, LedgerError>;

    async fn read_player_inventory(&self, wallet: &str) -> Result<u64, LedgerError>;

    async fn read_active_matches(&self, size: SizeClass) -> Result<Vec<MatchId>, LedgerError>;

    async fn read_events(&self, from_block: u64) -> Result<Vec<DecodedEvent>, LedgerError>;

    async fn submit_create(&self, wallet: &str, size: SizeClass) -> Result<TxHandle, LedgerError>;

    async fn submit_join(
        &self,
        wallet: &str,
        match_id: MatchId,
        entity_id: u64,
        boost: u32,
        value: Quantity,
    ) -> Result<TxHandle, LedgerError>;

    async fn submit_start(&self, wallet: &str, match_id: MatchId) -> Result<TxHandle, LedgerError>;

    async fn submit_settle(&self, wallet: &str, match_id: MatchId) -> Result<TxHandle, LedgerError>;

    async fn submit_purchase_boosts(&self, wallet: &str, amount: u32) -> Result<TxHandle, LedgerError>;
}

/// RPC request/response types
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(flatten)]
    result: RpcResult,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResult {
    Success { result: serde_json::Value },
    Error { error: RpcErrorBody },
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

fn decode_response<T>(text: &str) -> Result<T, LedgerError>
where
    T: for<'de> Deserialize<'de>,
{
    let response: RpcResponse = serde_json::from_str(text)?;
    match response.result {
        RpcResult::Success { result } => Ok(serde_json::from_value(result)?),
        RpcResult::Error { error } => Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        }),
    }
}

/// JSON-RPC implementation of `Ledger`.
pub struct JsonRpcLedger {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            contract: config.contract_address.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc_call<T>(&self, method: &str, params: serde_json::Value) -> Result<T, LedgerError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method = method, id = request.id, "Ledger RPC call");

        let response = self.client.post(&self.rpc_url).json(&request).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        decode_response(&text)
    }

    async fn submit(&self, method: &str, params: serde_json::Value) -> Result<TxHandle, LedgerError> {
        let handle: TxHandle = self.rpc_call(method, params).await?;
        info!(method = method, tx_hash = %handle.hash, "Transaction submitted");
        Ok(handle)
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    async fn read_match(&self, id: MatchId) -> Result<MatchSnapshot, LedgerError> {
        self.rpc_call(
            "clash_getMatch",
            serde_json::json!({ "contract": self.contract, "matchId": id }),
        )
        .await
    }

    async fn read_batch_results(&self, ids: &[MatchId]) -> Result<Vec<Vec<MatchResult>>, LedgerError> {
        self.rpc_call(
            "clash_getBatchResults",
            serde_json::json!({ "contract": self.contract, "matchIds": ids }),
        )
        .await
    }

    async fn read_leaderboard(&self, id: MatchId) -> Result<Vec<MatchResult>, LedgerError> {
        self.rpc_call(
            "clash_getLeaderboard",
            serde_json::json!({ "contract": self.contract, "matchId": id }),
        )
        .await
    }

    async fn read_recorded_rewards(&self, id: MatchId) -> Result<Quantity, LedgerError> {
        self.rpc_call(
            "clash_getRecordedRewards",
            serde_json::json!({ "contract": self.contract, "matchId": id }),
        )
        .await
    }

    async fn read_player_inventory(&self, wallet: &str) -> Result<u64, LedgerError> {
        self.rpc_call(
            "clash_getInventory",
            serde_json::json!({ "contract": self.contract, "wallet": wallet }),
        )
        .await
    }

    async fn read_active_matches(&self, size: SizeClass) -> Result<Vec<MatchId>, LedgerError> {
        self.rpc_call(
            "clash_getActiveMatches",
            serde_json::json!({ "contract": self.contract, "size": size }),
        )
        .await
    }

    async fn read_events(&self, from_block: u64) -> Result<Vec<DecodedEvent>, LedgerError> {
        self.rpc_call(
            "clash_getEvents",
            serde_json::json!({ "contract": self.contract, "fromBlock": from_block }),
        )
        .await
    }

    async fn submit_create(&self, wallet: &str, size: SizeClass) -> Result<TxHandle, LedgerError> {
        self.submit(
            "clash_submitCreate",
            serde_json::json!({ "contract": self.contract, "from": wallet, "size": size }),
        )
        .await
    }

    async fn submit_join(
        &self,
        wallet: &str,
        match_id: MatchId,
        entity_id: u64,
        boost: u32,
        value: Quantity,
    ) -> Result<TxHandle, LedgerError> {
        self.submit(
            "clash_submitJoin",
            serde_json::json!({
                "contract": self.contract,
                "from": wallet,
                "matchId": match_id,
                "entityId": entity_id,
                "boost": boost,
                "value": value,
            }),
        )
        .await
    }

    async fn submit_start(&self, wallet: &str, match_id: MatchId) -> Result<TxHandle, LedgerError> {
        self.submit(
            "clash_submitStart",
            serde_json::json!({ "contract": self.contract, "from": wallet, "matchId": match_id }),
        )
        .await
    }

    async fn submit_settle(&self, wallet: &str, match_id: MatchId) -> Result<TxHandle, LedgerError> {
        self.submit(
            "clash_submitSettle",
            serde_json::json!({ "contract": self.contract, "from": wallet, "matchId": match_id }),
        )
        .await
    }

    async fn submit_purchase_boosts(&self, wallet: &str, amount: u32) -> Result<TxHandle, LedgerError> {
        self.submit(
            "clash_purchaseBoosts",
            serde_json::json!({ "contract": self.contract, "from": wallet, "amount": amount }),
        )
        .await
    }
}
