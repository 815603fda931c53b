//! Transaction assembly for ICX transfers and contract calls.
//!
//! The builder is pure: it does no I/O and never talks to the device. It
//! either returns a well-formed [`TransactionIntent`] or an
//! [`IntentError`] naming the offending field.

use crate::error::IntentError;
use crate::types::IcxAddress;
use crate::utils::{self, to_hex};
use ethers::types::U256;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// ICON transaction protocol version.
pub const ICX_TX_VERSION: u64 = 3;

/// Nodes reject timestamps further than this from their own clock.
pub const TIMESTAMP_WINDOW_MICROS: i64 = 5 * 60 * 1_000_000;

/// `dataType = "call"` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallData {
    pub method: String,
    pub params: Option<Map<String, Value>>,
}

/// Chain-facing transaction fields, before any signature exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionIntent {
    pub version: u64,
    pub from: IcxAddress,
    pub to: IcxAddress,
    pub value: Option<U256>,
    pub step_limit: U256,
    pub nid: u64,
    pub timestamp: i64,
    pub nonce: Option<U256>,
    pub data: Option<CallData>,
}

impl TransactionIntent {
    pub fn is_call(&self) -> bool {
        self.data.is_some()
    }

    /// JSON field map in the node's wire format (hex quantities).
    pub fn to_raw(&self) -> Map<String, Value> {
        let mut raw = Map::new();
        raw.insert("version".into(), Value::String(format!("{:#x}", self.version)));
        raw.insert("from".into(), Value::String(self.from.to_string()));
        raw.insert("to".into(), Value::String(self.to.to_string()));
        if let Some(value) = self.value {
            raw.insert("value".into(), Value::String(to_hex(value)));
        }
        raw.insert("stepLimit".into(), Value::String(to_hex(self.step_limit)));
        raw.insert("timestamp".into(), Value::String(format!("{:#x}", self.timestamp)));
        raw.insert("nid".into(), Value::String(format!("{:#x}", self.nid)));
        if let Some(nonce) = self.nonce {
            raw.insert("nonce".into(), Value::String(to_hex(nonce)));
        }
        if let Some(data) = &self.data {
            raw.insert("dataType".into(), Value::String("call".into()));
            let mut body = Map::new();
            body.insert("method".into(), Value::String(data.method.clone()));
            if let Some(params) = &data.params {
                body.insert("params".into(), Value::Object(params.clone()));
            }
            raw.insert("data".into(), Value::Object(body));
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentKind {
    Transfer,
    Call,
}

#[derive(Debug, Clone)]
enum ValueInput {
    Icx(String),
    Loop(U256),
}

/// Fluent builder for a [`TransactionIntent`].
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    kind: IntentKind,
    active_nid: u64,
    now_micros: i64,
    from: Option<String>,
    to: Option<String>,
    value: Option<ValueInput>,
    step_limit: Option<i64>,
    nid: Option<u64>,
    timestamp: Option<i64>,
    nonce: Option<U256>,
    method: Option<String>,
    params: Option<Map<String, Value>>,
}

impl TransactionBuilder {
    fn new(kind: IntentKind, active_nid: u64, now_micros: i64) -> Self {
        Self {
            kind,
            active_nid,
            now_micros,
            from: None,
            to: None,
            value: None,
            step_limit: None,
            nid: None,
            timestamp: None,
            nonce: None,
            method: None,
            params: None,
        }
    }

    /// Value transfer on the network identified by `active_nid`.
    pub fn transfer(active_nid: u64, now_micros: i64) -> Self {
        Self::new(IntentKind::Transfer, active_nid, now_micros)
    }

    /// Contract method invocation on the network identified by `active_nid`.
    pub fn call(active_nid: u64, now_micros: i64) -> Self {
        Self::new(IntentKind::Call, active_nid, now_micros)
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Value as an ICX decimal string, e.g. `"0.0001"`.
    pub fn value_icx(mut self, value: impl Into<String>) -> Self {
        self.value = Some(ValueInput::Icx(value.into()));
        self
    }

    pub fn value_loop(mut self, value: U256) -> Self {
        self.value = Some(ValueInput::Loop(value));
        self
    }

    pub fn step_limit(mut self, step_limit: i64) -> Self {
        self.step_limit = Some(step_limit);
        self
    }

    pub fn nid(mut self, nid: u64) -> Self {
        self.nid = Some(nid);
        self
    }

    pub fn timestamp(mut self, timestamp_micros: i64) -> Self {
        self.timestamp = Some(timestamp_micros);
        self
    }

    pub fn nonce(mut self, nonce: U256) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn build(self) -> Result<TransactionIntent, IntentError> {
        let from = parse_address("from", self.from.as_deref())?;
        if from.is_contract() {
            return Err(IntentError::invalid("from", "must be an hx account address"));
        }

        let to = parse_address("to", self.to.as_deref())?;
        if self.kind == IntentKind::Call && !to.is_contract() {
            return Err(IntentError::invalid("to", "must be a cx contract address for a call"));
        }

        let value = match self.value {
            Some(ValueInput::Icx(raw)) => Some(
                utils::icx_to_loop(&raw).map_err(|e| IntentError::invalid("value", e.to_string()))?,
            ),
            Some(ValueInput::Loop(v)) => Some(v),
            None if self.kind == IntentKind::Transfer => {
                return Err(IntentError::invalid("value", "is required for a transfer"))
            }
            None => None,
        };

        let step_limit = match self.step_limit {
            Some(limit) if limit > 0 => U256::from(limit as u64),
            Some(limit) => {
                return Err(IntentError::invalid(
                    "stepLimit",
                    format!("must be a positive integer, got {}", limit),
                ))
            }
            None => return Err(IntentError::invalid("stepLimit", "is required")),
        };

        let nid = self.nid.unwrap_or(self.active_nid);
        if nid != self.active_nid {
            return Err(IntentError::invalid(
                "nid",
                format!("{:#x} does not match the active network {:#x}", nid, self.active_nid),
            ));
        }

        let timestamp = self.timestamp.unwrap_or(self.now_micros);
        if timestamp <= 0 {
            return Err(IntentError::invalid("timestamp", "must be positive"));
        }
        if (timestamp - self.now_micros).abs() > TIMESTAMP_WINDOW_MICROS {
            return Err(IntentError::invalid(
                "timestamp",
                format!("{} is not the current time in microseconds", timestamp),
            ));
        }

        let data = match self.kind {
            IntentKind::Transfer => None,
            IntentKind::Call => {
                let method = self.method.unwrap_or_default();
                if method.trim().is_empty() {
                    return Err(IntentError::invalid("method", "must not be empty"));
                }
                if let Some(params) = &self.params {
                    check_params(params)?;
                }
                Some(CallData {
                    method,
                    params: self.params,
                })
            }
        };

        Ok(TransactionIntent {
            version: ICX_TX_VERSION,
            from,
            to,
            value,
            step_limit,
            nid,
            timestamp,
            nonce: self.nonce,
            data,
        })
    }
}

fn parse_address(field: &'static str, raw: Option<&str>) -> Result<IcxAddress, IntentError> {
    let raw = raw.ok_or_else(|| IntentError::invalid(field, "is required"))?;
    raw.trim().parse().map_err(|e: String| IntentError::invalid(field, e))
}

/// Call parameters travel as strings; numbers and booleans must be encoded by the caller.
fn check_params(params: &Map<String, Value>) -> Result<(), IntentError> {
    fn leaf_ok(value: &Value) -> bool {
        match value {
            Value::Null | Value::String(_) => true,
            Value::Array(items) => items.iter().all(leaf_ok),
            Value::Object(map) => map.values().all(leaf_ok),
            Value::Bool(_) | Value::Number(_) => false,
        }
    }
    match params.iter().find(|(_, v)| !leaf_ok(v)) {
        Some((key, _)) => Err(IntentError::invalid(
            "params",
            format!("'{}' must be a string, list, map or null", key),
        )),
        None => Ok(()),
    }
}

/// Source of the current time in microseconds.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

/// Hands out timestamps that strictly increase per sender, even when two
/// submissions land in the same microsecond.
pub struct MonotonicClock {
    inner: Box<dyn Clock>,
    last: Mutex<HashMap<IcxAddress, i64>>,
}

impl MonotonicClock {
    pub fn new(inner: Box<dyn Clock>) -> Self {
        Self {
            inner,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn now_micros(&self) -> i64 {
        self.inner.now_micros()
    }

    pub fn next_for(&self, sender: &IcxAddress) -> i64 {
        let now = self.inner.now_micros();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let timestamp = match last.get(sender) {
            Some(previous) if *previous >= now => previous + 1,
            _ => now,
        };
        last.insert(sender.clone(), timestamp);
        timestamp
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new(Box::new(SystemClock))
    }
}
