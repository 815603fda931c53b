//! Scripted device and RPC doubles shared by the unit tests.

use crate::device::{AppVersion, DeviceSession, SigningDevice};
use crate::error::{DeviceError, RpcError};
use crate::rpc::LedgerRpc;
use crate::signer::{SignedTransaction, TxDigest, SIGNATURE_LEN};
use crate::tx_builder::{Clock, TransactionIntent, ICX_TX_VERSION};
use crate::types::{DerivationPath, DerivedAddress, IcxAddress, Wallet, ICX_COIN_TYPE};
use async_trait::async_trait;
use ethers::types::U256;
use serde_json::Value;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SENDER: &str = "hx3f945d146a87552487ad70a050eebfa2564e8e5c";
pub const TARGET_CONTRACT: &str = "cxd9d1950dfdaad7fcc73a1803d1ea0fa0f6993a04";
const RECEIVER: &str = "hxb6b5791be0b5ef67063b3c10b840fb81514db2fd";
const NOW: i64 = 1_700_000_000_000_000;

pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_micros(&self) -> i64 {
        self.0
    }
}

pub fn sample_digest() -> TxDigest {
    TxDigest::compute(b"icx_sendTransaction.from.hx00.nid.0x1".to_vec())
}

/// A plain transfer whose sender is derived from `n`.
pub fn transfer_intent(n: u8) -> TransactionIntent {
    TransactionIntent {
        version: ICX_TX_VERSION,
        from: format!("hx{:040x}", n as u32 + 1).parse().unwrap(),
        to: RECEIVER.parse().unwrap(),
        value: Some(U256::one()),
        step_limit: U256::from(1_000_000u64),
        nid: 0x2,
        timestamp: NOW,
        nonce: None,
        data: None,
    }
}

/// Session over `device` that has already derived `index`, plus the wallet for it.
pub async fn derived_session(device: MockDevice, index: u32) -> (Arc<DeviceSession>, Wallet, DeviceCounters) {
    let counters = device.counters();
    let session = Arc::new(DeviceSession::new(Box::new(device), ICX_COIN_TYPE, Duration::from_secs(1)));
    let path = DerivationPath::for_index(ICX_COIN_TYPE, index).unwrap();
    let address = session.derive_address(&path, false).await.unwrap();
    let wallet = Wallet::from(&DerivedAddress { address, path, index });
    (session, wallet, counters)
}

/// Tracks how many calls are running at once.
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current: current.clone() }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct DeviceCounterState {
    derives: AtomicUsize,
    signs: AtomicUsize,
    resets: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct DeviceCounters(Arc<DeviceCounterState>);

impl DeviceCounters {
    pub fn derives(&self) -> usize {
        self.0.derives.load(Ordering::SeqCst)
    }

    pub fn signs(&self) -> usize {
        self.0.signs.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.derives() + self.signs()
    }

    pub fn resets(&self) -> usize {
        self.0.resets.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.0.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Deterministic stand-in for a hardware wallet: the address at a path is a
/// hash of the seed and the path bytes.
pub struct MockDevice {
    seed: u8,
    delay: Option<Duration>,
    sign_delay: Option<Duration>,
    derive_error: Option<(Option<u32>, DeviceError)>,
    sign_error: Option<DeviceError>,
    signature_len: usize,
    counters: DeviceCounters,
}

impl MockDevice {
    pub fn new(seed: u8) -> Self {
        Self {
            seed,
            delay: None,
            sign_delay: None,
            derive_error: None,
            sign_error: None,
            signature_len: SIGNATURE_LEN,
            counters: DeviceCounters::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Extra wait on signing only (a user who never confirms).
    pub fn with_sign_delay(mut self, delay: Duration) -> Self {
        self.sign_delay = Some(delay);
        self
    }

    pub fn failing_derive(mut self, err: DeviceError) -> Self {
        self.derive_error = Some((None, err));
        self
    }

    pub fn failing_derive_at(mut self, index: u32, err: DeviceError) -> Self {
        self.derive_error = Some((Some(index), err));
        self
    }

    pub fn failing_sign(mut self, err: DeviceError) -> Self {
        self.sign_error = Some(err);
        self
    }

    pub fn with_signature_len(mut self, len: usize) -> Self {
        self.signature_len = len;
        self
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters.clone()
    }

    pub fn address_at(&self, path: &DerivationPath) -> IcxAddress {
        let mut hasher = Sha3_256::new();
        hasher.update([self.seed]);
        hasher.update(path.to_bytes());
        let hash = hasher.finalize();
        format!("hx{}", hex::encode(&hash[12..])).parse().unwrap()
    }

    pub fn signature_for(&self, path: &DerivationPath, digest: &TxDigest) -> Vec<u8> {
        let mut hasher = Sha3_256::new();
        hasher.update([self.seed]);
        hasher.update(path.to_bytes());
        hasher.update(digest.as_bytes());
        let hash = hasher.finalize();
        hash.iter().chain(hash.iter()).chain(hash.iter()).copied().take(self.signature_len).collect()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SigningDevice for MockDevice {
    async fn derive_address(&self, path: &DerivationPath, _confirm: bool) -> Result<IcxAddress, DeviceError> {
        let state = &self.counters.0;
        state.derives.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&state.in_flight, &state.max_in_flight);
        self.pause().await;
        match &self.derive_error {
            Some((None, err)) => Err(err.clone()),
            Some((Some(index), err)) if *index == path.index() => Err(err.clone()),
            _ => Ok(self.address_at(path)),
        }
    }

    async fn sign_digest(&self, path: &DerivationPath, digest: &TxDigest) -> Result<Vec<u8>, DeviceError> {
        let state = &self.counters.0;
        state.signs.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&state.in_flight, &state.max_in_flight);
        self.pause().await;
        if let Some(delay) = self.sign_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.sign_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.signature_for(path, digest)),
        }
    }

    async fn app_version(&self) -> Result<AppVersion, DeviceError> {
        Ok(AppVersion { major: 1, minor: 0, patch: 0 })
    }

    async fn reset(&self) {
        self.counters.0.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RpcCounterState {
    balance_calls: AtomicUsize,
    calls: AtomicUsize,
    sends: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct RpcCounters(Arc<RpcCounterState>);

impl RpcCounters {
    pub fn balance_calls(&self) -> usize {
        self.0.balance_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.0.sends.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.balance_calls() + self.calls() + self.sends()
    }

    pub fn max_in_flight(&self) -> usize {
        self.0.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Scripted ledger node.
#[derive(Default)]
pub struct MockRpc {
    balances: Mutex<HashMap<IcxAddress, U256>>,
    stakes: Mutex<HashMap<String, Value>>,
    call_results: Mutex<HashMap<String, Value>>,
    sent: Mutex<Vec<Value>>,
    send_error: Option<RpcError>,
    balance_delay: Option<Duration>,
    call_delay: Option<Duration>,
    counters: RpcCounters,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delays(mut self, balance_delay: Duration, call_delay: Duration) -> Self {
        self.balance_delay = Some(balance_delay);
        self.call_delay = Some(call_delay);
        self
    }

    pub fn failing_send(mut self, err: RpcError) -> Self {
        self.send_error = Some(err);
        self
    }

    pub fn set_balance(&self, address: &IcxAddress, loop_amount: U256) {
        self.balances.lock().unwrap().insert(address.clone(), loop_amount);
    }

    /// Result returned by `getStake` for `address`.
    pub fn set_stake(&self, address: &IcxAddress, result: Value) {
        self.stakes.lock().unwrap().insert(address.to_string(), result);
    }

    /// Result returned by any other read-only `method`.
    pub fn set_call_result(&self, method: &str, result: Value) {
        self.call_results.lock().unwrap().insert(method.to_string(), result);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn counters(&self) -> RpcCounters {
        self.counters.clone()
    }
}

fn not_scripted(what: String) -> RpcError {
    RpcError::RejectedByNetwork {
        code: -32602,
        message: format!("nothing scripted for {}", what),
    }
}

#[async_trait]
impl LedgerRpc for MockRpc {
    async fn get_balance(&self, address: &IcxAddress) -> Result<U256, RpcError> {
        let state = &self.counters.0;
        state.balance_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&state.in_flight, &state.max_in_flight);
        if let Some(delay) = self.balance_delay {
            tokio::time::sleep(delay).await;
        }
        let balance = self.balances.lock().unwrap().get(address).copied();
        balance.ok_or_else(|| not_scripted(format!("balance of {}", address)))
    }

    async fn call(&self, _target: &IcxAddress, method: &str, params: Value) -> Result<Value, RpcError> {
        let state = &self.counters.0;
        state.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&state.in_flight, &state.max_in_flight);
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        let result = if method == "getStake" {
            let address = params["address"].as_str().unwrap_or_default().to_string();
            self.stakes.lock().unwrap().get(&address).cloned()
        } else {
            self.call_results.lock().unwrap().get(method).cloned()
        };
        result.ok_or_else(|| not_scripted(format!("{}({})", method, params)))
    }

    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        self.counters.0.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.send_error {
            return Err(err.clone());
        }
        self.sent.lock().unwrap().push(tx.to_payload());
        Ok(tx.tx_hash())
    }
}
