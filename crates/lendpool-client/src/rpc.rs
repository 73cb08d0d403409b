//! json-rpc lending gateway client

use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use lendpool_core::{PoolSnapshot, UserPosition};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ClientError, RemoteError};
use crate::intent::Action;
use crate::ledger::{OperationHandle, Receipt, RemoteLedger};

/// delay between receipt polls when the gateway answers `null`
const RECEIPT_POLL: Duration = Duration::from_secs(1);

/// json-rpc code some nodes use for reverted calls
const REVERT_CODE: i64 = 3;

/// gateway client acting for one account in one pool
#[derive(Clone)]
pub struct RpcLedger {
    url: String,
    client: Client,
    pool: Address,
    account: Address,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolInfo {
    total_supply: Value,
    total_borrow: Value,
    #[serde(default)]
    utilization_rate: Option<Value>,
    #[serde(default)]
    supply_rate: Option<Value>,
    #[serde(default)]
    borrow_rate: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionInfo {
    supplied: Value,
    borrowed: Value,
    collateral_value: Value,
    health_factor: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptInfo {
    transaction_hash: B256,
    block_number: Value,
    status: Value,
}

impl RpcLedger {
    pub fn new(url: &str, pool: Address, account: Address, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
            pool,
            account,
        })
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RemoteError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": "lendpool",
            "method": method,
            "params": params,
        });
        debug!(method, "rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let json: RpcResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;

        if let Some(error) = json.error {
            return Err(rpc_error(error.code, error.message));
        }
        Ok(json.result.unwrap_or(Value::Null))
    }

    async fn call_quantity(&self, method: &str, params: Vec<Value>) -> Result<U256, RemoteError> {
        let result = self.call(method, params).await?;
        parse_quantity(&result)
    }

    async fn call_handle(&self, method: &str, params: Vec<Value>) -> Result<OperationHandle, RemoteError> {
        let result = self.call(method, params).await?;
        let hash: B256 = serde_json::from_value(result).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(OperationHandle { hash })
    }
}

#[async_trait]
impl RemoteLedger for RpcLedger {
    async fn read_pool(&self) -> Result<PoolSnapshot, RemoteError> {
        let result = self.call("lending_getPoolInfo", vec![json!(self.pool)]).await?;
        parse_pool(result)
    }

    async fn read_position(&self, owner: Address) -> Result<UserPosition, RemoteError> {
        let result = self
            .call("lending_getUserPosition", vec![json!(self.pool), json!(owner)])
            .await?;
        parse_position(result)
    }

    async fn read_allowance(&self, owner: Address, spender: Address) -> Result<U256, RemoteError> {
        self.call_quantity("token_allowance", vec![json!(self.pool), json!(owner), json!(spender)])
            .await
    }

    async fn read_balance(&self, owner: Address) -> Result<U256, RemoteError> {
        self.call_quantity("token_balanceOf", vec![json!(self.pool), json!(owner)])
            .await
    }

    async fn approve(&self, spender: Address, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.call_handle(
            "token_approve",
            vec![json!({
                "pool": self.pool,
                "from": self.account,
                "spender": spender,
                "amount": amount.to_string(),
            })],
        )
        .await
    }

    async fn submit(&self, action: Action, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.call_handle(
            "lending_submit",
            vec![json!({
                "pool": self.pool,
                "from": self.account,
                "action": action.as_str(),
                "amount": amount.to_string(),
            })],
        )
        .await
    }

    async fn await_finality(&self, handle: &OperationHandle) -> Result<Receipt, RemoteError> {
        loop {
            let result = self.call("tx_waitForReceipt", vec![json!(handle.hash)]).await?;
            if !result.is_null() {
                return parse_receipt(result);
            }
            debug!(tx = %handle, "receipt not available yet");
            tokio::time::sleep(RECEIPT_POLL).await;
        }
    }
}

/// reverts travel as plain rpc errors; pull them out by code or message
/// a refused connection never delivered the request; anything later might have
fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_connect() {
        RemoteError::Unreachable(e.to_string())
    } else {
        RemoteError::Transport(e.to_string())
    }
}

fn rpc_error(code: i64, message: String) -> RemoteError {
    if code == REVERT_CODE || message.contains("execution reverted") {
        RemoteError::Reverted { reason: message }
    } else {
        RemoteError::Rpc { code, message }
    }
}

/// decimal or 0x-prefixed hex string, or a json integer
fn parse_quantity(value: &Value) -> Result<U256, RemoteError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) if hex.is_empty() => Ok(U256::ZERO),
                Some(hex) => U256::from_str_radix(hex, 16),
                None => U256::from_str_radix(s, 10),
            };
            parsed.map_err(|e| RemoteError::Malformed(format!("bad quantity {:?}: {}", s, e)))
        }
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| RemoteError::Malformed(format!("bad quantity {}", n))),
        other => Err(RemoteError::Malformed(format!("expected quantity, got {}", other))),
    }
}

fn parse_optional(value: &Option<Value>) -> Result<U256, RemoteError> {
    match value {
        Some(v) if !v.is_null() => parse_quantity(v),
        _ => Ok(U256::ZERO),
    }
}

fn parse_pool(result: Value) -> Result<PoolSnapshot, RemoteError> {
    let info: PoolInfo = serde_json::from_value(result).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    Ok(PoolSnapshot {
        total_supply: parse_quantity(&info.total_supply)?,
        total_borrow: parse_quantity(&info.total_borrow)?,
        utilization_rate: parse_optional(&info.utilization_rate)?,
        supply_rate: parse_optional(&info.supply_rate)?,
        borrow_rate: parse_optional(&info.borrow_rate)?,
    })
}

fn parse_position(result: Value) -> Result<UserPosition, RemoteError> {
    let info: PositionInfo = serde_json::from_value(result).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    Ok(UserPosition {
        supplied: parse_quantity(&info.supplied)?,
        borrowed: parse_quantity(&info.borrowed)?,
        collateral_value: parse_quantity(&info.collateral_value)?,
        health_factor: parse_quantity(&info.health_factor)?,
    })
}

fn parse_receipt(result: Value) -> Result<Receipt, RemoteError> {
    let info: ReceiptInfo = serde_json::from_value(result).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    let block_number = parse_quantity(&info.block_number)?;
    let success = match &info.status {
        Value::Bool(b) => *b,
        other => parse_quantity(other)? == U256::from(1),
    };
    Ok(Receipt {
        hash: info.transaction_hash,
        block_number: block_number
            .try_into()
            .map_err(|_| RemoteError::Malformed(format!("block number {} out of range", block_number)))?,
        success,
    })
}
