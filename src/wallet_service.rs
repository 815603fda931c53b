//! Session context the user-facing layer talks to.
//!
//! One `WalletSession` owns everything a running wallet needs (network config,
//! the device session, the RPC client, the clock) so nothing lives in globals.

use crate::balance::BalanceAggregator;
use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::device::{AppVersion, DeviceSession, LedgerStatus};
use crate::enumerator::AddressEnumerator;
use crate::error::{IntentError, Result, WalletError};
use crate::operation_log::OperationLog;
use crate::rpc::LedgerRpc;
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::tx_builder::{Clock, MonotonicClock, TransactionBuilder, TransactionIntent};
use crate::types::{DerivedAddress, IcxAddress, Wallet, WalletEntry};
use ethers::types::U256;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct WalletSession {
    config: Config,
    device: Arc<DeviceSession>,
    rpc: Arc<dyn LedgerRpc>,
    clock: MonotonicClock,
    enumerator: AddressEnumerator,
    aggregator: BalanceAggregator,
    signer: TransactionSigner,
    broadcaster: Broadcaster,
}

impl WalletSession {
    pub fn new(config: Config, device: Arc<DeviceSession>, rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            enumerator: AddressEnumerator::new(device.clone(), config.confirm_on_device),
            aggregator: BalanceAggregator::new(rpc.clone()),
            signer: TransactionSigner::new(device.clone()),
            broadcaster: Broadcaster::new(rpc.clone()),
            clock: MonotonicClock::default(),
            config,
            device,
            rpc,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = MonotonicClock::new(clock);
        self
    }

    /// Record every accepted submission in `journal`.
    pub fn with_journal(mut self, journal: OperationLog) -> Self {
        self.broadcaster = Broadcaster::new(self.rpc.clone()).with_journal(journal);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Probe the device. With `suppress_error` a failure is logged and
    /// reported as a status instead of an error (startup auto-connect).
    pub async fn connect(&self, suppress_error: bool) -> Result<LedgerStatus> {
        match self.enumerator.derive_one(0).await {
            Ok(first) => {
                info!("Ledger connected, first address {}", first.address);
                Ok(LedgerStatus::Connected { address: first.address })
            }
            Err(WalletError::Device(e)) if suppress_error => {
                warn!("Ledger not ready: {}", e);
                Ok(LedgerStatus::from_error(&e))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self) -> LedgerStatus {
        self.device.check_status().await
    }

    /// Version of the ICX app open on the device.
    pub async fn app_version(&self) -> Result<AppVersion> {
        Ok(self.device.app_version().await?)
    }

    /// Derive one page of addresses, then fetch their balances.
    pub async fn load_page(&self, page: u32) -> Result<Vec<WalletEntry>> {
        let page_size = self.config.page_size;
        let derived = self.enumerator.enumerate(page, page_size).await?;
        let addresses: Vec<IcxAddress> = derived.iter().map(|d| d.address.clone()).collect();
        let balances = self.aggregator.get_totals(&addresses, page_size as usize).await?;

        Ok(derived
            .into_iter()
            .zip(balances)
            .map(|(derived, balance)| WalletEntry { derived, balance })
            .collect())
    }

    pub fn select(&self, derived: &DerivedAddress) -> Wallet {
        info!("Selected {} at {}", derived.address, derived.path);
        Wallet::from(derived)
    }

    /// Derive the address at `index` and select it.
    pub async fn wallet_at(&self, index: u32) -> Result<Wallet> {
        let derived = self.enumerator.derive_one(index).await?;
        Ok(self.select(&derived))
    }

    /// Transfer `amount_icx` (decimal ICX) from `wallet` to `to`; returns the tx hash.
    pub async fn send_icx(&self, wallet: &Wallet, to: &str, amount_icx: &str) -> Result<String> {
        let timestamp = self.clock.next_for(wallet.address());
        let intent = TransactionBuilder::transfer(self.config.nid, self.clock.now_micros())
            .from(wallet.address().as_str())
            .to(to)
            .value_icx(amount_icx)
            .step_limit(self.step_limit())
            .timestamp(timestamp)
            .build()?;
        self.sign_and_submit(intent, wallet).await
    }

    /// Invoke `method` on contract `target` from `wallet`; returns the tx hash.
    pub async fn call_contract(
        &self,
        wallet: &Wallet,
        target: &str,
        method: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<String> {
        let timestamp = self.clock.next_for(wallet.address());
        let mut builder = TransactionBuilder::call(self.config.nid, self.clock.now_micros())
            .from(wallet.address().as_str())
            .to(target)
            .value_loop(U256::zero())
            .step_limit(self.step_limit())
            .timestamp(timestamp)
            .method(method);
        if let Some(params) = params {
            builder = builder.params(params);
        }
        let intent = builder.build()?;
        self.sign_and_submit(intent, wallet).await
    }

    pub async fn sign(&self, intent: TransactionIntent, wallet: &Wallet) -> Result<SignedTransaction> {
        Ok(self.signer.sign(intent, wallet).await?)
    }

    pub async fn submit(&self, signed: &SignedTransaction) -> Result<String> {
        Ok(self.broadcaster.submit(signed).await?)
    }

    /// Read-only contract call; nothing is signed.
    pub async fn read_contract(&self, target: &str, method: &str, params: Option<Value>) -> Result<Value> {
        let target: IcxAddress = target
            .trim()
            .parse()
            .map_err(|e: String| IntentError::invalid("to", e))?;
        if method.trim().is_empty() {
            return Err(IntentError::invalid("method", "must not be empty").into());
        }
        Ok(self.rpc.call(&target, method, params.unwrap_or(Value::Null)).await?)
    }

    async fn sign_and_submit(&self, intent: TransactionIntent, wallet: &Wallet) -> Result<String> {
        let signed = self.sign(intent, wallet).await?;
        self.submit(&signed).await
    }

    fn step_limit(&self) -> i64 {
        i64::try_from(self.config.step_limit).unwrap_or(i64::MAX)
    }
}
