//! Error taxonomy for the device, builder, signer and network layers.
//!
//! Nothing here is retried automatically. Device errors in particular have
//! human-visible side effects (on-screen prompts), so callers decide whether a
//! failure is suppressed and logged or surfaced to the user.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the signing device adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Ledger device unavailable: {0}")]
    Unavailable(String),

    #[error("Request was rejected on the Ledger device.")]
    Rejected,

    #[error("Ledger did not respond within {}s.", .0.as_secs())]
    Timeout(Duration),

    #[error("Device refused the digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("Unexpected device response: {0}")]
    MalformedResponse(String),
}

/// Local validation failure while assembling a transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("Invalid transaction intent: field `{field}` {reason}")]
    InvalidIntent { field: &'static str, reason: String },
}

impl IntentError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        IntentError::InvalidIntent {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            IntentError::InvalidIntent { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("Could not canonicalize transaction: {0}")]
    Canonicalization(String),

    #[error("Path {path} is bound to {actual}, not to sender {expected}")]
    PathBindingMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors from the remote ledger's JSON-RPC surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Rejected by network ({code}): {message}")]
    RejectedByNetwork { code: i64, message: String },

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Malformed RPC response: {0}")]
    MalformedResponse(String),
}

/// Umbrella error for the session façade.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Intent(#[from] IntentError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Page and page size must both be positive (got page={page}, page_size={page_size})")]
    InvalidPage { page: u32, page_size: u32 },
}

pub type Result<T, E = WalletError> = std::result::Result<T, E>;
