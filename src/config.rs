use anyhow::{anyhow, Result};
use ethers::providers::{Http, Provider};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::types::ICX_COIN_TYPE;

/// A predefined ICON deployment with label, network id, and default endpoint.
#[derive(Clone, Debug)]
pub struct IconNetwork {
    pub label: &'static str,
    pub nid: u64,
    pub endpoint: &'static str,
    pub tracker: &'static str,
    pub is_testnet: bool,
}

impl IconNetwork {
    pub const fn new(
        label: &'static str,
        nid: u64,
        endpoint: &'static str,
        tracker: &'static str,
        is_testnet: bool,
    ) -> Self {
        Self {
            label,
            nid,
            endpoint,
            tracker,
            is_testnet,
        }
    }
}

pub const NETWORKS: &[IconNetwork] = &[
    IconNetwork::new("Mainnet", 0x1, "https://ctz.solidwallet.io/api/v3", "https://tracker.icon.community", false),
    IconNetwork::new("Lisbon", 0x2, "https://lisbon.net.solidwallet.io/api/v3", "https://tracker.lisbon.icon.community", true),
    IconNetwork::new("Berlin", 0x7, "https://berlin.net.solidwallet.io/api/v3", "https://tracker.berlin.icon.community", true),
];

/// Addresses shown per wallet page.
pub const DEFAULT_PAGE_SIZE: u32 = 5;

/// Fee ceiling used when the caller does not pick one.
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// How long a single device round trip may take (includes on-screen confirmation).
pub const DEFAULT_DEVICE_TIMEOUT_SECS: u64 = 120;

pub fn find_network_by_nid(nid: u64) -> Option<&'static IconNetwork> {
    NETWORKS.iter().find(|n| n.nid == nid)
}

pub fn find_network_by_label(label: &str) -> Option<&'static IconNetwork> {
    NETWORKS.iter().find(|n| n.label.eq_ignore_ascii_case(label))
}

/// Link to a transaction on the network's tracker.
pub fn get_tx_tracker_url(nid: u64, tx_hash: &str) -> Option<String> {
    find_network_by_nid(nid).map(|n| format!("{}/transaction/{}", n.tracker, tx_hash))
}

/// Session configuration. Built once at startup and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct Config {
    pub network_label: String,
    pub endpoint: String,
    pub nid: u64,
    pub coin_type: u32,
    pub page_size: u32,
    pub step_limit: u64,
    pub device_timeout: Duration,
    /// Ask the device to show each derived address on screen.
    pub confirm_on_device: bool,
}

impl Config {
    pub fn new(endpoint: String, nid: u64) -> Self {
        let network_label = find_network_by_nid(nid)
            .map(|n| n.label.to_string())
            .unwrap_or_else(|| "Custom".to_string());

        Self {
            network_label,
            endpoint,
            nid,
            coin_type: ICX_COIN_TYPE,
            page_size: DEFAULT_PAGE_SIZE,
            step_limit: DEFAULT_STEP_LIMIT,
            device_timeout: Duration::from_secs(DEFAULT_DEVICE_TIMEOUT_SECS),
            confirm_on_device: false,
        }
    }

    pub fn from_network(network: &IconNetwork) -> Self {
        Self::new(network.endpoint.to_string(), network.nid)
    }

    /// Read the configuration from the environment (after `.env` has been loaded).
    ///
    /// `ICX_NETWORK` selects a built-in deployment; `ICX_ENDPOINT` + `ICX_NID`
    /// describe a custom one. Everything else falls back to the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("ICX_NETWORK") {
            Ok(label) => {
                let network = find_network_by_label(&label)
                    .ok_or_else(|| anyhow!("Unknown ICX_NETWORK '{}'", label))?;
                Self::from_network(network)
            }
            Err(_) => Self::default(),
        };

        if let Ok(endpoint) = env::var("ICX_ENDPOINT") {
            let nid = env::var("ICX_NID")
                .map_err(|_| anyhow!("ICX_ENDPOINT requires ICX_NID"))?;
            let nid = parse_nid(&nid)?;
            let label = config.network_label.clone();
            config = Self::new(endpoint, nid);
            if find_network_by_nid(nid).is_none() {
                config.network_label = format!("Custom ({})", label);
            }
        }

        if let Some(step_limit) = env::var("ICX_STEP_LIMIT").ok().and_then(|v| v.parse().ok()) {
            config.step_limit = step_limit;
        }
        if let Some(secs) = env::var("ICX_DEVICE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) {
            config.device_timeout = Duration::from_secs(secs);
        }
        if let Ok(flag) = env::var("ICX_CONFIRM_ON_DEVICE") {
            config.confirm_on_device = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.endpoint).map_err(|e| anyhow!("Invalid endpoint '{}': {}", self.endpoint, e))?;
        if self.nid == 0 {
            return Err(anyhow!("Network id must be positive"));
        }
        if self.page_size == 0 {
            return Err(anyhow!("Page size must be positive"));
        }
        if self.step_limit == 0 {
            return Err(anyhow!("Step limit must be positive"));
        }
        Ok(())
    }

    pub fn derivation_prefix(&self) -> String {
        format!("44'/{}'/0'/0'", self.coin_type)
    }

    pub async fn get_provider(&self) -> Result<Arc<Provider<Http>>> {
        let url = Url::parse(&self.endpoint)?;
        let provider = Provider::<Http>::try_from(url.as_str())?;
        Ok(Arc::new(provider))
    }
}

fn parse_nid(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|e| anyhow!("Invalid network id '{}': {}", value, e))
}

impl Default for Config {
    fn default() -> Self {
        // Lisbon testnet until the user picks otherwise
        if let Some(lisbon) = find_network_by_nid(0x2) {
            Self::from_network(lisbon)
        } else {
            Self::new("https://lisbon.net.solidwallet.io/api/v3".to_string(), 0x2)
        }
    }
}
