//! Common types shared across modules.

use crate::error::DeviceError;
use crate::utils;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// BIP-44 purpose segment.
pub const BIP44_PURPOSE: u32 = 44;

/// SLIP-44 coin type registered for ICX.
pub const ICX_COIN_TYPE: u32 = 4801368;

/// Bit marking a BIP-32 segment as hardened.
pub const HARDENED: u32 = 0x8000_0000;

/// `purpose' / coin_type' / account' / change' / index'`, every segment hardened.
///
/// Only the last segment varies between derived addresses; the first four are
/// fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationPath {
    segments: [u32; 5],
}

impl DerivationPath {
    /// `44'/<coin_type>'/0'/0'/<index>'`
    pub fn for_index(coin_type: u32, index: u32) -> Result<Self, DeviceError> {
        Self::from_segments([BIP44_PURPOSE, coin_type, 0, 0, index])
    }

    fn from_segments(segments: [u32; 5]) -> Result<Self, DeviceError> {
        if let Some(bad) = segments.iter().find(|s| **s >= HARDENED) {
            return Err(DeviceError::InvalidPath(format!(
                "segment {} cannot be hardened (must be below 2^31)",
                bad
            )));
        }
        if segments[0] != BIP44_PURPOSE || segments[2] != 0 || segments[3] != 0 {
            return Err(DeviceError::InvalidPath(format!(
                "expected prefix 44'/<coin>'/0'/0', got {}'/{}'/{}'/{}'",
                segments[0], segments[1], segments[2], segments[3]
            )));
        }
        Ok(Self { segments })
    }

    pub fn coin_type(&self) -> u32 {
        self.segments[1]
    }

    pub fn index(&self) -> u32 {
        self.segments[4]
    }

    /// The fixed four-segment prefix rendered as `44'/4801368'/0'/0'`.
    pub fn prefix_string(&self) -> String {
        self.segments[..4]
            .iter()
            .map(|s| format!("{}'", s))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Device encoding: segment count followed by big-endian hardened segments.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 * self.segments.len());
        out.push(self.segments.len() as u8);
        for segment in self.segments {
            out.extend_from_slice(&(segment | HARDENED).to_be_bytes());
        }
        out
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}'", self.prefix_string(), self.index())
    }
}

impl FromStr for DerivationPath {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim().trim_start_matches("m/");
        let parts: Vec<&str> = body.split('/').collect();
        if parts.len() != 5 {
            return Err(DeviceError::InvalidPath(format!(
                "'{}' must have exactly 5 segments",
                s
            )));
        }
        let mut segments = [0u32; 5];
        for (slot, part) in segments.iter_mut().zip(parts) {
            let digits = part.strip_suffix('\'').ok_or_else(|| {
                DeviceError::InvalidPath(format!("segment '{}' in '{}' is not hardened", part, s))
            })?;
            *slot = digits.parse().map_err(|_| {
                DeviceError::InvalidPath(format!("segment '{}' in '{}' is not a number", part, s))
            })?;
        }
        Self::from_segments(segments)
    }
}

/// ICON address: `hx` (externally owned) or `cx` (contract) plus 40 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IcxAddress(String);

impl IcxAddress {
    /// Governance/system contract that answers `getStake`.
    pub const ZERO_CONTRACT: &'static str = "cx0000000000000000000000000000000000000000";

    pub fn zero_contract() -> Self {
        IcxAddress(Self::ZERO_CONTRACT.to_string())
    }

    pub fn is_contract(&self) -> bool {
        self.0.starts_with("cx")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IcxAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let prefix = s.get(..2).unwrap_or_default();
        let body = s.get(2..).unwrap_or_default();
        if prefix != "hx" && prefix != "cx" {
            return Err(format!("'{}' must start with hx or cx", s));
        }
        if body.len() != 40 || !body.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(format!("'{}' must be followed by 40 lowercase hex digits", s));
        }
        Ok(IcxAddress(s.to_string()))
    }
}

impl TryFrom<String> for IcxAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IcxAddress> for String {
    fn from(value: IcxAddress) -> Self {
        value.0
    }
}

impl fmt::Display for IcxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An address read from the device together with the path it was derived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: IcxAddress,
    pub path: DerivationPath,
    pub index: u32,
}

/// Exact amount held as an integer number of loop; displays as ICX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(U256);

impl Amount {
    pub fn zero() -> Self {
        Amount(U256::zero())
    }

    pub fn from_loop(loop_amount: U256) -> Self {
        Amount(loop_amount)
    }

    pub fn as_loop(&self) -> U256 {
        self.0
    }

    pub fn to_icx_string(&self) -> String {
        utils::loop_to_icx(self.0)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ICX", self.to_icx_string())
    }
}

/// Result of the `getStake` system call.
///
/// `unstaking` is tri-state: `None` means no unstake is in progress, while
/// `Some(zero)` is a degenerate unstake the node reported explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeInfo {
    pub staked: Amount,
    pub unstaking: Option<Amount>,
    pub remaining_unstake_blocks: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub address: IcxAddress,
    pub liquid: Amount,
    pub staked: Amount,
    pub unstaking: Option<Amount>,
    pub remaining_unstake_blocks: Option<u64>,
    pub total: Amount,
}

impl AccountBalance {
    /// `total = liquid + staked + (unstaking or 0)`
    pub fn compose(address: IcxAddress, liquid: Amount, stake: StakeInfo) -> Self {
        let total = liquid + stake.staked + stake.unstaking.unwrap_or_default();
        Self {
            address,
            liquid,
            staked: stake.staked,
            unstaking: stake.unstaking,
            remaining_unstake_blocks: stake.remaining_unstake_blocks,
            total,
        }
    }

    pub fn is_unstaking(&self) -> bool {
        self.unstaking.is_some()
    }
}

/// One row of a wallet page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletEntry {
    pub derived: DerivedAddress,
    pub balance: AccountBalance,
}

/// Handle for the wallet the user picked; only built from a derived address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    address: IcxAddress,
    path: DerivationPath,
}

impl Wallet {
    pub fn address(&self) -> &IcxAddress {
        &self.address
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }
}

impl From<&DerivedAddress> for Wallet {
    fn from(derived: &DerivedAddress) -> Self {
        Wallet {
            address: derived.address.clone(),
            path: derived.path,
        }
    }
}
