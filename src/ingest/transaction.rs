use serde::{Deserialize, Serialize};
use tracing::debug;

use super::utils::{
    categorize_size, classify_address, day_of_week, estimate_usd_value, hour_of_day, AddressType,
    SizeCategory,
};
use crate::error::{RaidError, Result};

pub const MIN_ADDRESS_LEN: usize = 26;

/// Transaction as it arrives from a caller, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default)]
    pub amount: f64,
    pub timestamp: Option<i64>,
    pub currency: Option<String>,
    pub block_height: Option<u64>,
    pub gas_price: Option<u64>,
    pub gas_used: Option<u64>,
}

/// Validated and enriched transaction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub timestamp: i64,
    pub currency: String,
    pub block_height: u64,
    pub gas_price: u64,
    pub gas_used: u64,

    // Derived
    pub amount_usd: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub size_category: SizeCategory,
    pub from_address_type: AddressType,
    pub to_address_type: AddressType,
}

impl Transaction {
    /// Validates a request and derives the enrichment fields.
    pub fn from_request(request: TransactionRequest) -> Result<Self> {
        let id = request.id.trim().to_string();
        let from_address = request.from_address.trim().to_string();
        let to_address = request.to_address.trim().to_string();
        let currency = request
            .currency
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "BTC".to_string());
        let timestamp = request
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        validate_fields(&id, &from_address, &to_address, request.amount)?;

        let amount_usd = estimate_usd_value(request.amount, &currency);

        let transaction = Self {
            from_address_type: classify_address(&from_address),
            to_address_type: classify_address(&to_address),
            id,
            from_address,
            to_address,
            amount: request.amount,
            timestamp,
            currency,
            block_height: request.block_height.unwrap_or(0),
            gas_price: request.gas_price.unwrap_or(0),
            gas_used: request.gas_used.unwrap_or(0),
            amount_usd,
            hour_of_day: hour_of_day(timestamp),
            day_of_week: day_of_week(timestamp),
            size_category: categorize_size(amount_usd),
        };

        debug!(
            transaction_id = %transaction.id,
            amount_usd = transaction.amount_usd,
            size_category = ?transaction.size_category,
            "Transaction validated"
        );

        Ok(transaction)
    }

    /// Re-checks the invariants of an already built transaction.
    ///
    /// A transaction can reach the pipeline through deserialization rather
    /// than `from_request`, so stages call this before trusting its fields.
    pub fn check(&self) -> Result<()> {
        validate_fields(&self.id, &self.from_address, &self.to_address, self.amount)?;

        if self.hour_of_day > 23 || self.day_of_week > 6 {
            return Err(RaidError::validation_error("derived time fields out of range"));
        }

        Ok(())
    }
}

fn validate_fields(id: &str, from_address: &str, to_address: &str, amount: f64) -> Result<()> {
    if id.is_empty() {
        return Err(RaidError::validation_error("transaction id is required"));
    }

    if from_address.is_empty() || to_address.is_empty() {
        return Err(RaidError::validation_error("missing required address fields"));
    }

    if from_address.chars().count() < MIN_ADDRESS_LEN || to_address.chars().count() < MIN_ADDRESS_LEN {
        return Err(RaidError::validation_error(format!(
            "invalid address format: addresses must be at least {} characters",
            MIN_ADDRESS_LEN
        )));
    }

    if !amount.is_finite() || amount <= 0.0 {
        return Err(RaidError::validation_error(format!("invalid transaction amount: {}", amount)));
    }

    Ok(())
}

/// Deterministic demo transaction used when the caller supplies none
pub fn sample_transaction() -> TransactionRequest {
    TransactionRequest {
        id: "sample-0001".to_string(),
        from_address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
        to_address: "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy".to_string(),
        amount: 0.5,
        timestamp: Some(1_700_000_000),
        currency: Some("BTC".to_string()),
        ..Default::default()
    }
}
