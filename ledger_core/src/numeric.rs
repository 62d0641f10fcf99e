use crate::{CoreError, Result};
use rust_decimal::Decimal;

/// Wei per ETH as a decimal scale.
const NATIVE_DECIMALS: u32 = 18;

/// Parse a 0x-prefixed hex quantity ("0x5208") into an integer. An empty
/// or bare "0x" quantity parses as zero.
pub fn parse_hex_quantity(raw: &str) -> Result<u128> {
    let digits = raw
        .trim()
        .strip_prefix("0x")
        .or_else(|| raw.trim().strip_prefix("0X"))
        .unwrap_or_else(|| raw.trim());

    if digits.is_empty() {
        return Ok(0);
    }

    u128::from_str_radix(digits, 16)
        .map_err(|e| CoreError::InvalidQuantity(format!("'{}': {}", raw, e)))
}

/// Scale an integer amount of base units down by `decimals` places.
pub fn units_to_decimal(raw: u128, decimals: u32) -> Result<Decimal> {
    let signed = i128::try_from(raw)
        .map_err(|_| CoreError::InvalidQuantity(format!("amount {} out of range", raw)))?;
    Decimal::try_from_i128_with_scale(signed, decimals)
        .map_err(|e| CoreError::InvalidQuantity(e.to_string()))
}

/// Transaction fee in ETH: gasUsed x gasPrice / 10^18, kept at full
/// 18-decimal precision.
pub fn gas_cost_eth(gas_used_hex: &str, gas_price_hex: &str) -> Result<Decimal> {
    let gas_used = parse_hex_quantity(gas_used_hex)?;
    let gas_price = parse_hex_quantity(gas_price_hex)?;

    let wei = gas_used.checked_mul(gas_price).ok_or_else(|| {
        CoreError::InvalidQuantity(format!(
            "gas cost overflow: {} x {}",
            gas_used_hex, gas_price_hex
        ))
    })?;

    units_to_decimal(wei, NATIVE_DECIMALS)
}

/// Fee valuation in fiat, rounded to cents.
pub fn gas_cost_usd(eth_cost: Decimal, eth_price: Decimal) -> Decimal {
    (eth_cost * eth_price).round_dp(2)
}

/// Holding valuation: balance x price at 5 decimal places.
pub fn token_value(balance: Decimal, price: Decimal) -> Decimal {
    (balance * price).round_dp(5)
}

/// Shorten an address for display: "0x1234…cdef".
pub fn shorten_address(address: &str) -> String {
    if address.len() <= 12 {
        return address.to_string();
    }
    format!("{}…{}", &address[..6], &address[address.len() - 4..])
}
