//! Signing device adapter.
//!
//! [`SigningDevice`] is the seam to the physical device (or a simulator);
//! [`DeviceSession`] is the one handle the rest of the crate holds. It owns the
//! device exclusively, serializes every derive/sign round trip, enforces the
//! per-call timeout, and remembers which address it derived at which path.

use crate::error::DeviceError;
use crate::signer::TxDigest;
use crate::types::{DerivationPath, IcxAddress};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Version triple reported by the device app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Operations a signing device exposes. Implementations may assume calls never overlap.
#[async_trait]
pub trait SigningDevice: Send + Sync {
    /// Read the address at `path`, optionally asking the user to confirm it on screen.
    async fn derive_address(
        &self,
        path: &DerivationPath,
        confirm: bool,
    ) -> Result<IcxAddress, DeviceError>;

    /// Sign the canonical transaction digest with the key at `path`.
    /// Returns the 65-byte recoverable signature.
    async fn sign_digest(
        &self,
        path: &DerivationPath,
        digest: &TxDigest,
    ) -> Result<Vec<u8>, DeviceError>;

    async fn app_version(&self) -> Result<AppVersion, DeviceError>;

    /// Drop any open channel after an abandoned call so the next one reopens it.
    async fn reset(&self) {}
}

/// Status of the device connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerStatus {
    Connected { address: IcxAddress },
    Locked,
    Disconnected,
    Unknown(String),
}

impl LedgerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, LedgerStatus::Connected { .. })
    }

    /// Classify a failed probe.
    pub fn from_error(err: &DeviceError) -> Self {
        match err {
            DeviceError::Rejected => LedgerStatus::Locked,
            DeviceError::Unavailable(msg) if is_locked_message(msg) => LedgerStatus::Locked,
            DeviceError::Unavailable(_) | DeviceError::Timeout(_) => LedgerStatus::Disconnected,
            other => LedgerStatus::Unknown(other.to_string().chars().take(40).collect()),
        }
    }

    pub fn display_text(&self) -> String {
        match self {
            LedgerStatus::Connected { address } => {
                let addr = address.as_str();
                format!("Connected: {}...{}", &addr[..8], &addr[addr.len() - 4..])
            }
            LedgerStatus::Locked => "Locked / ICX app closed".to_string(),
            LedgerStatus::Disconnected => "Not connected".to_string(),
            LedgerStatus::Unknown(msg) => msg.clone(),
        }
    }
}

fn is_locked_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("locked") || lower.contains("not open")
}

/// Exclusive, serialized access to one signing device.
pub struct DeviceSession {
    device: Mutex<Box<dyn SigningDevice>>,
    coin_type: u32,
    call_timeout: Duration,
    bindings: Mutex<HashMap<DerivationPath, IcxAddress>>,
}

impl DeviceSession {
    pub fn new(device: Box<dyn SigningDevice>, coin_type: u32, call_timeout: Duration) -> Self {
        Self {
            device: Mutex::new(device),
            coin_type,
            call_timeout,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn coin_type(&self) -> u32 {
        self.coin_type
    }

    fn check_path(&self, path: &DerivationPath) -> Result<(), DeviceError> {
        if path.coin_type() != self.coin_type {
            return Err(DeviceError::InvalidPath(format!(
                "{} is outside this session's prefix 44'/{}'/0'/0'",
                path, self.coin_type
            )));
        }
        Ok(())
    }

    /// Derive the address at `path`. The binding is remembered for the signer.
    pub async fn derive_address(
        &self,
        path: &DerivationPath,
        confirm: bool,
    ) -> Result<IcxAddress, DeviceError> {
        self.check_path(path)?;

        let device = self.device.lock().await;
        debug!("Deriving address at {} (confirm={})", path, confirm);
        let address = match timeout(self.call_timeout, device.derive_address(path, confirm)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Device timed out deriving {}", path);
                self.abandon(&**device).await;
                return Err(DeviceError::Timeout(self.call_timeout));
            }
        };
        drop(device);

        self.bindings.lock().await.insert(*path, address.clone());
        info!("Got address {} at path {}", address, path);
        Ok(address)
    }

    /// Sign `digest` with the key at `path`. No retry on failure: a retry
    /// would show the user a second confirmation prompt.
    pub async fn sign_digest(
        &self,
        path: &DerivationPath,
        digest: &TxDigest,
    ) -> Result<Vec<u8>, DeviceError> {
        self.check_path(path)?;

        let device = self.device.lock().await;
        info!("Requesting signature at {} for digest {}", path, digest.to_hex());
        match timeout(self.call_timeout, device.sign_digest(path, digest)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Device timed out signing at {}", path);
                self.abandon(&**device).await;
                Err(DeviceError::Timeout(self.call_timeout))
            }
        }
    }

    pub async fn app_version(&self) -> Result<AppVersion, DeviceError> {
        let device = self.device.lock().await;
        match timeout(self.call_timeout, device.app_version()).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon(&**device).await;
                Err(DeviceError::Timeout(self.call_timeout))
            }
        }
    }

    /// Drop the channel after an abandoned call. The reopened channel may reach
    /// a different device, so every binding is forgotten with it.
    async fn abandon(&self, device: &dyn SigningDevice) {
        device.reset().await;
        let mut bindings = self.bindings.lock().await;
        if !bindings.is_empty() {
            info!("Forgetting {} derived address binding(s)", bindings.len());
            bindings.clear();
        }
    }

    /// Address this session derived at `path`, if any.
    pub async fn bound_address(&self, path: &DerivationPath) -> Option<IcxAddress> {
        self.bindings.lock().await.get(path).cloned()
    }

    /// Probe the device by deriving the first address.
    pub async fn check_status(&self) -> LedgerStatus {
        let path = match DerivationPath::for_index(self.coin_type, 0) {
            Ok(path) => path,
            Err(e) => return LedgerStatus::Unknown(e.to_string()),
        };
        match self.derive_address(&path, false).await {
            Ok(address) => LedgerStatus::Connected { address },
            Err(e) => LedgerStatus::from_error(&e),
        }
    }
}
