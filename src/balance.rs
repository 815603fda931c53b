use crate::error::RpcError;
use crate::rpc::{parse_quantity, LedgerRpc};
use crate::types::{AccountBalance, Amount, IcxAddress, StakeInfo};
use ethers::types::U256;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// System method on the zero contract that reports delegated stake.
pub const GET_STAKE_METHOD: &str = "getStake";

/// Liquid, staked and unstaking amounts for an address.
pub struct BalanceAggregator {
    rpc: Arc<dyn LedgerRpc>,
}

impl BalanceAggregator {
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self { rpc }
    }

    pub async fn get_balance(&self, address: &IcxAddress) -> Result<Amount, RpcError> {
        let liquid = self.rpc.get_balance(address).await?;
        Ok(Amount::from_loop(liquid))
    }

    pub async fn get_stake(&self, address: &IcxAddress) -> Result<StakeInfo, RpcError> {
        let result = self
            .rpc
            .call(
                &IcxAddress::zero_contract(),
                GET_STAKE_METHOD,
                json!({ "address": address.as_str() }),
            )
            .await?;
        parse_stake_result(&result)
    }

    /// Liquid and stake queries run concurrently; the total is composed
    /// only after both have answered.
    pub async fn get_total(&self, address: &IcxAddress) -> Result<AccountBalance, RpcError> {
        let (liquid, stake) = tokio::try_join!(self.get_balance(address), self.get_stake(address))?;
        let balance = AccountBalance::compose(address.clone(), liquid, stake);
        debug!(
            "{}: liquid={} staked={} unstaking={:?} total={}",
            address,
            balance.liquid,
            balance.staked,
            balance.unstaking.map(|u| u.to_icx_string()),
            balance.total
        );
        Ok(balance)
    }

    /// Totals for many addresses, at most `concurrency` in flight, in input order.
    pub async fn get_totals(
        &self,
        addresses: &[IcxAddress],
        concurrency: usize,
    ) -> Result<Vec<AccountBalance>, RpcError> {
        info!("Fetching balances for {} addresses", addresses.len());
        stream::iter(addresses)
            .map(|address| self.get_total(address))
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }
}

/// Parse a `getStake` result.
///
/// Older nodes answer `{stake, unstake?, remainingBlocks?}`; newer ones carry a
/// list `{stake, unstakes: [{unstake, remainingBlocks, ...}]}`. A missing
/// unstake (or an empty list) is `None`; an explicit `0x0` stays `Some(0)`.
pub fn parse_stake_result(result: &Value) -> Result<StakeInfo, RpcError> {
    let obj = result
        .as_object()
        .ok_or_else(|| RpcError::MalformedResponse(format!("getStake returned {}", result)))?;

    let staked = match obj.get("stake") {
        Some(v) => Amount::from_loop(parse_quantity(v)?),
        None => return Err(RpcError::MalformedResponse("getStake result has no stake".into())),
    };

    let (unstaking, remaining_unstake_blocks) = match obj.get("unstakes") {
        Some(Value::Array(entries)) => {
            let mut total: Option<Amount> = None;
            let mut remaining: Option<u64> = None;
            for entry in entries {
                let amount = entry
                    .get("unstake")
                    .ok_or_else(|| RpcError::MalformedResponse("unstakes entry has no unstake".into()))?;
                total = Some(total.unwrap_or_default() + Amount::from_loop(parse_quantity(amount)?));
                if let Some(blocks) = entry.get("remainingBlocks") {
                    let blocks = parse_blocks(blocks)?;
                    remaining = Some(remaining.map_or(blocks, |r| r.max(blocks)));
                }
            }
            (total, remaining)
        }
        Some(other) => {
            return Err(RpcError::MalformedResponse(format!("unstakes is not a list: {}", other)))
        }
        None => {
            let unstake = obj
                .get("unstake")
                .map(|v| parse_quantity(v).map(Amount::from_loop))
                .transpose()?;
            let remaining = obj.get("remainingBlocks").map(parse_blocks).transpose()?;
            (unstake, remaining)
        }
    };

    Ok(StakeInfo {
        staked,
        unstaking,
        remaining_unstake_blocks,
    })
}

fn parse_blocks(value: &Value) -> Result<u64, RpcError> {
    let blocks = parse_quantity(value)?;
    if blocks > U256::from(u64::MAX) {
        return Err(RpcError::MalformedResponse(format!("remainingBlocks out of range: {}", value)));
    }
    Ok(blocks.as_u64())
}
