//! ICON JSON-RPC v3 client.

use crate::error::RpcError;
use crate::signer::SignedTransaction;
use crate::types::IcxAddress;
use crate::utils;
use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError as _};
use ethers::types::U256;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const METHOD_GET_BALANCE: &str = "icx_getBalance";
pub const METHOD_CALL: &str = "icx_call";
pub const METHOD_SEND_TRANSACTION: &str = "icx_sendTransaction";

/// Remote ledger operations the wallet core needs.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Liquid balance in loop.
    async fn get_balance(&self, address: &IcxAddress) -> Result<U256, RpcError>;

    /// Read-only contract call. `params` of `Value::Null` sends no params.
    async fn call(&self, target: &IcxAddress, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Submit a signed transaction and return its hash.
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, RpcError>;
}

pub fn balance_params(address: &IcxAddress) -> Value {
    json!({ "address": address.as_str() })
}

pub fn call_params(target: &IcxAddress, method: &str, params: Value) -> Value {
    let mut data = json!({ "method": method });
    if !params.is_null() {
        data["params"] = params;
    }
    json!({
        "to": target.as_str(),
        "dataType": "call",
        "data": data,
    })
}

/// Map a provider failure onto the RPC taxonomy. JSON-RPC error objects are
/// passed through verbatim.
pub fn map_provider_error(err: ProviderError) -> RpcError {
    if let Some(resp) = err.as_error_response() {
        return RpcError::RejectedByNetwork {
            code: resp.code,
            message: resp.message.clone(),
        };
    }
    if let Some(serde_err) = err.as_serde_error() {
        return RpcError::MalformedResponse(serde_err.to_string());
    }
    RpcError::NetworkUnreachable(err.to_string())
}

pub struct IconRpcClient {
    provider: Arc<Provider<Http>>,
}

impl IconRpcClient {
    pub fn new(provider: Arc<Provider<Http>>) -> Self {
        Self { provider }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        debug!("{} {}", method, params);
        self.provider
            .request::<Value, Value>(method, params)
            .await
            .map_err(|e| {
                let mapped = map_provider_error(e);
                warn!("{} failed: {}", method, mapped);
                mapped
            })
    }
}

#[async_trait]
impl LedgerRpc for IconRpcClient {
    async fn get_balance(&self, address: &IcxAddress) -> Result<U256, RpcError> {
        let result = self.request(METHOD_GET_BALANCE, balance_params(address)).await?;
        parse_quantity(&result)
    }

    async fn call(&self, target: &IcxAddress, method: &str, params: Value) -> Result<Value, RpcError> {
        self.request(METHOD_CALL, call_params(target, method, params)).await
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        let result = self.request(METHOD_SEND_TRANSACTION, tx.to_payload()).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::MalformedResponse(format!("expected a tx hash, got {}", result)))
    }
}

/// Decode a `0x` hex quantity from a JSON string.
pub fn parse_quantity(value: &Value) -> Result<U256, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::MalformedResponse(format!("expected a hex string, got {}", value)))?;
    utils::parse_hex_u256(raw).map_err(|e| RpcError::MalformedResponse(e.to_string()))
}
