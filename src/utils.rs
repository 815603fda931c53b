use ethers::types::U256;
use anyhow::{anyhow, Result};

/// ICX native precision: 1 ICX = 10^18 loop.
pub const ICX_DECIMALS: u32 = 18;

/// Format a loop amount as an ICX decimal string, without trailing zeros.
///
/// The conversion is exact: it goes through `format_units` on the integer,
/// never through floating point.
pub fn loop_to_icx(loop_amount: U256) -> String {
    let formatted = ethers::utils::format_units(loop_amount, ICX_DECIMALS)
        .unwrap_or_else(|_| "0.0".to_string());
    trim_decimal(&formatted)
}

fn trim_decimal(formatted: &str) -> String {
    if !formatted.contains('.') {
        return formatted.to_string();
    }
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a user-supplied ICX decimal string into loop.
///
/// # Errors
/// Returns an error for empty input, signs, malformed numbers, or more than
/// 18 fractional digits (which could not be represented exactly).
pub fn icx_to_loop(input: &str) -> Result<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ICX amount cannot be empty"));
    }
    if trimmed.starts_with('-') {
        return Err(anyhow!("ICX amount cannot be negative: {}", trimmed));
    }

    let (integer, fraction) = match trimmed.split_once('.') {
        Some((i, f)) => (i, f),
        None => (trimmed, ""),
    };
    let well_formed = !(integer.is_empty() && fraction.is_empty())
        && integer.chars().all(|c| c.is_ascii_digit())
        && fraction.chars().all(|c| c.is_ascii_digit());
    if !well_formed {
        return Err(anyhow!("Invalid ICX amount '{}'", trimmed));
    }
    if fraction.len() > ICX_DECIMALS as usize {
        return Err(anyhow!(
            "ICX amount '{}' has more than {} decimal places",
            trimmed,
            ICX_DECIMALS
        ));
    }

    let normalized = format!(
        "{}.{}",
        if integer.is_empty() { "0" } else { integer },
        if fraction.is_empty() { "0" } else { fraction }
    );
    ethers::utils::parse_units(normalized.as_str(), ICX_DECIMALS)
        .map(|pu| pu.into())
        .map_err(|e| anyhow!("Invalid ICX amount '{}': {}", trimmed, e))
}

/// Encode a quantity the way the ICON JSON-RPC expects (`0x`-prefixed, lowercase, minimal).
pub fn to_hex(value: U256) -> String {
    format!("{:#x}", value)
}

/// Decode a `0x`-prefixed hex quantity returned by the node.
pub fn parse_hex_u256(value: &str) -> Result<U256> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| anyhow!("Expected 0x-prefixed quantity, got '{}'", value))?;
    if digits.is_empty() {
        return Err(anyhow!("Empty hex quantity"));
    }
    U256::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex quantity '{}': {:?}", value, e))
}
