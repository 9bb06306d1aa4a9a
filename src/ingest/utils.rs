use serde::{Deserialize, Serialize};

/// Address encodings recognised from their prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressType {
    P2pkh,
    P2sh,
    Bech32,
    Eth,
    Unknown,
}

/// Transaction size buckets by USD value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SizeCategory {
    Micro,
    Small,
    Medium,
    Large,
    Whale,
}

/// Classifies an address by its prefix
pub fn classify_address(address: &str) -> AddressType {
    if address.starts_with("bc1") {
        AddressType::Bech32
    } else if address.starts_with("0x") {
        AddressType::Eth
    } else if address.starts_with('1') {
        AddressType::P2pkh
    } else if address.starts_with('3') {
        AddressType::P2sh
    } else {
        AddressType::Unknown
    }
}

/// Static USD rate for a currency symbol. Unknown currencies are taken at par.
pub fn usd_rate(currency: &str) -> f64 {
    match currency.to_uppercase().as_str() {
        "BTC" => 45_000.0,
        "ETH" => 3_000.0,
        "LTC" => 100.0,
        "BCH" => 300.0,
        "XRP" => 0.6,
        _ => 1.0,
    }
}

/// Estimates the USD value of an amount, rounded to cents
pub fn estimate_usd_value(amount: f64, currency: &str) -> f64 {
    (amount * usd_rate(currency) * 100.0).round() / 100.0
}

pub fn categorize_size(amount_usd: f64) -> SizeCategory {
    if amount_usd < 100.0 {
        SizeCategory::Micro
    } else if amount_usd < 1_000.0 {
        SizeCategory::Small
    } else if amount_usd < 10_000.0 {
        SizeCategory::Medium
    } else if amount_usd < 100_000.0 {
        SizeCategory::Large
    } else {
        SizeCategory::Whale
    }
}

/// Hour of day in UTC, 0-23
pub fn hour_of_day(timestamp: i64) -> u8 {
    (timestamp.rem_euclid(86_400) / 3_600) as u8
}

/// Day of week in UTC, 0 = Monday
pub fn day_of_week(timestamp: i64) -> u8 {
    // 1970-01-01 was a Thursday
    ((timestamp.div_euclid(86_400) + 3).rem_euclid(7)) as u8
}
