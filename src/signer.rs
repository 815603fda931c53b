//! Canonicalization, digest and device signing of ICX transactions.
//!
//! A submission moves through
//! `Built → Canonicalized → DigestComputed → AwaitingDeviceSignature → Signed`
//! and stops at `Failed` on the first error. Device errors are passed through
//! unchanged and never retried.

use crate::device::DeviceSession;
use crate::error::{DeviceError, SignError};
use crate::tx_builder::TransactionIntent;
use crate::types::Wallet;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Method name prefixed to the serialized transaction before hashing.
const TX_METHOD_PREFIX: &str = "icx_sendTransaction";

/// Fields that never take part in the canonical encoding.
const EXCLUDED_FIELDS: [&str; 2] = ["signature", "txHash"];

/// Length of a recoverable secp256k1 signature (r, s, v).
pub const SIGNATURE_LEN: usize = 65;

/// Deterministic byte encoding of a raw transaction (without its signature).
///
/// Keys are sorted; each entry is `key.value` and entries are joined with `.`.
/// Nested maps are wrapped in `{}`, lists in `[]`, `null` becomes `\0`, and the
/// characters `\ . { } [ ]` inside strings are escaped with a backslash.
pub fn canonicalize(raw: &Map<String, Value>) -> Result<Vec<u8>, SignError> {
    let mut out = String::from(TX_METHOD_PREFIX);
    out.push('.');
    write_entries(raw, true, &mut out)?;
    Ok(out.into_bytes())
}

fn write_entries(map: &Map<String, Value>, top_level: bool, out: &mut String) -> Result<(), SignError> {
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| !(top_level && EXCLUDED_FIELDS.contains(&k.as_str())))
        .collect();
    keys.sort();

    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(key);
        out.push('.');
        write_value(key, &map[key.as_str()], out)?;
    }
    Ok(())
}

fn write_value(key: &str, value: &Value, out: &mut String) -> Result<(), SignError> {
    match value {
        Value::Null => out.push_str("\\0"),
        Value::String(s) => escape_into(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push('.');
                }
                write_value(key, item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            write_entries(map, false, out)?;
            out.push('}');
        }
        Value::Bool(_) | Value::Number(_) => {
            return Err(SignError::Canonicalization(format!(
                "field '{}' holds a non-string value {}",
                key, value
            )))
        }
    }
    Ok(())
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        if matches!(c, '\\' | '.' | '{' | '}' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// SHA3-256 of a canonical encoding, kept together with its preimage.
///
/// The preimage travels with the hash because the Ledger ICX app hashes the
/// serialized transaction itself and echoes the hash back for comparison.
#[derive(Clone, PartialEq, Eq)]
pub struct TxDigest {
    hash: [u8; 32],
    preimage: Vec<u8>,
}

impl TxDigest {
    pub fn compute(canonical: Vec<u8>) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha3_256::digest(&canonical));
        Self {
            hash,
            preimage: canonical,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn preimage(&self) -> &[u8] {
        &self.preimage
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

impl fmt::Debug for TxDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxDigest({})", self.to_hex())
    }
}

/// A transaction with the device signature attached.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    intent: TransactionIntent,
    raw: Map<String, Value>,
    digest: TxDigest,
    signature: String,
}

impl SignedTransaction {
    pub fn intent(&self) -> &TransactionIntent {
        &self.intent
    }

    pub fn digest(&self) -> &TxDigest {
        &self.digest
    }

    /// Base64 of the 65 signature bytes exactly as the device returned them.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Hash the node will assign to this transaction.
    pub fn tx_hash(&self) -> String {
        format!("0x{}", self.digest.to_hex())
    }

    /// Parameters for `icx_sendTransaction`.
    pub fn to_payload(&self) -> Value {
        let mut payload = self.raw.clone();
        payload.insert("signature".into(), Value::String(self.signature.clone()));
        Value::Object(payload)
    }

    /// Re-canonicalize the intent and check it still hashes to the signed digest.
    pub fn verify_integrity(&self) -> bool {
        let raw = self.intent.to_raw();
        if raw != self.raw {
            return false;
        }
        match canonicalize(&raw) {
            Ok(canonical) => TxDigest::compute(canonical).hash == self.digest.hash,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningState {
    Built,
    Canonicalized,
    DigestComputed,
    AwaitingDeviceSignature,
    Signed,
    Failed(String),
}

/// Per-submission record of the states a signing attempt went through.
#[derive(Debug, Clone, Default)]
pub struct SigningTrail {
    states: Vec<SigningState>,
}

impl SigningTrail {
    fn enter(&mut self, state: SigningState) {
        self.states.push(state);
    }

    pub fn states(&self) -> &[SigningState] {
        &self.states
    }

    pub fn last(&self) -> Option<&SigningState> {
        self.states.last()
    }

    /// True if the attempt got as far as asking the device.
    pub fn reached_device(&self) -> bool {
        self.states.contains(&SigningState::AwaitingDeviceSignature)
    }
}

pub struct TransactionSigner {
    session: Arc<DeviceSession>,
}

impl TransactionSigner {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Self { session }
    }

    pub async fn sign(
        &self,
        intent: TransactionIntent,
        wallet: &Wallet,
    ) -> Result<SignedTransaction, SignError> {
        self.sign_traced(intent, wallet).await.1
    }

    /// Sign and also return the state trail of this attempt.
    pub async fn sign_traced(
        &self,
        intent: TransactionIntent,
        wallet: &Wallet,
    ) -> (SigningTrail, Result<SignedTransaction, SignError>) {
        let mut trail = SigningTrail::default();
        trail.enter(SigningState::Built);
        let result = self.run(intent, wallet, &mut trail).await;
        match &result {
            Ok(signed) => info!("Signed transaction {} from {}", signed.tx_hash(), wallet.address()),
            Err(e) => {
                error!("Signing failed: {}", e);
                trail.enter(SigningState::Failed(e.to_string()));
            }
        }
        (trail, result)
    }

    async fn run(
        &self,
        intent: TransactionIntent,
        wallet: &Wallet,
        trail: &mut SigningTrail,
    ) -> Result<SignedTransaction, SignError> {
        let raw = intent.to_raw();
        let canonical = canonicalize(&raw)?;
        trail.enter(SigningState::Canonicalized);

        let digest = TxDigest::compute(canonical);
        trail.enter(SigningState::DigestComputed);

        self.check_binding(&intent, wallet).await?;

        trail.enter(SigningState::AwaitingDeviceSignature);
        let signature = self.session.sign_digest(wallet.path(), &digest).await?;
        if signature.len() != SIGNATURE_LEN {
            return Err(SignError::Device(DeviceError::MalformedResponse(format!(
                "signature is {} bytes, expected {}",
                signature.len(),
                SIGNATURE_LEN
            ))));
        }
        trail.enter(SigningState::Signed);

        Ok(SignedTransaction {
            intent,
            raw,
            digest,
            signature: STANDARD.encode(&signature),
        })
    }

    /// The wallet path must be one this session derived, and it must have
    /// yielded the intent's sender.
    async fn check_binding(&self, intent: &TransactionIntent, wallet: &Wallet) -> Result<(), SignError> {
        let bound = self.session.bound_address(wallet.path()).await;
        match bound {
            Some(address) if &address == wallet.address() && address == intent.from => Ok(()),
            Some(address) => Err(SignError::PathBindingMismatch {
                path: wallet.path().to_string(),
                expected: intent.from.to_string(),
                actual: address.to_string(),
            }),
            None => Err(SignError::PathBindingMismatch {
                path: wallet.path().to_string(),
                expected: intent.from.to_string(),
                actual: "nothing derived in this session".to_string(),
            }),
        }
    }
}
