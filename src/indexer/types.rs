use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;

use crate::config::ChainConfig;
use crate::indexer::block_cache::BlockEntry;

/// Fixed scale of the human-readable `amount` column.
pub const AMOUNT_SCALE: i64 = 18;

/// Token decimals assumed when an event payload does not carry the field.
pub const DEFAULT_TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deposit,
    Withdraw,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deposit => "deposit",
            Operation::Withdraw => "withdraw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Failed => "FAILED",
        }
    }

    /// Status is a pure function of the confirmation count.
    pub fn derive(confirmations: u64, required: u64) -> Self {
        if confirmations >= required {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }
}

/// A decoded vault event, combined with the log's chain metadata.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub operation: Operation,
    pub user: Address,
    pub token_address: Option<Address>,
    pub raw_amount: U256,
    pub decimals: u8,
    pub amount: BigDecimal,
    pub contract_address: Address,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub log_index: u64,
}

/// A row ready for insertion into `vault_transactions`.
#[derive(Debug, Clone)]
pub struct VaultTransaction {
    pub transaction_hash: String,
    pub chain_id: String,
    pub address: String,
    pub operation: Operation,
    pub raw_amount: BigDecimal,
    pub amount: BigDecimal,
    pub token_decimals: i16,
    pub token_address: Option<String>,
    pub contract_address: String,
    pub block_number: i64,
    pub block_hash: String,
    pub block_time: DateTime<Utc>,
    pub confirmations: i64,
    pub require_confirmations: i64,
    pub status: TxStatus,
}

impl VaultTransaction {
    /// Build the persisted projection of one parsed event.
    ///
    /// `confirmations` is `head - block + 1`, never negative, capped at the
    /// chain's confirmation threshold; the threshold itself is copied onto
    /// the row so later config changes do not reclassify it.
    pub fn from_event(
        event: &ParsedEvent,
        block: &BlockEntry,
        head: u64,
        config: &ChainConfig,
    ) -> eyre::Result<Self> {
        let confirmations = confirmations_at(head, event.block_number, config.required_confirmations);
        Ok(Self {
            transaction_hash: lower_hex_b256(event.transaction_hash),
            chain_id: config.chain_id.clone(),
            address: lower_hex_address(event.user),
            operation: event.operation,
            raw_amount: BigDecimal::from_str(&event.raw_amount.to_string())?,
            amount: event.amount.clone(),
            token_decimals: i16::from(event.decimals),
            token_address: event.token_address.map(lower_hex_address),
            contract_address: lower_hex_address(event.contract_address),
            block_number: event.block_number as i64,
            block_hash: lower_hex_b256(block.hash),
            block_time: block.time,
            confirmations: confirmations as i64,
            require_confirmations: config.required_confirmations as i64,
            status: TxStatus::derive(confirmations, config.required_confirmations),
        })
    }
}

/// A `vault_transactions` row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub transaction_hash: String,
    pub chain_id: String,
    pub address: String,
    pub operation: String,
    pub raw_amount: BigDecimal,
    pub amount: BigDecimal,
    pub token_decimals: i16,
    pub token_address: Option<String>,
    pub contract_address: String,
    pub block_number: i64,
    pub block_hash: String,
    pub block_time: DateTime<Utc>,
    pub confirmations: i64,
    pub require_confirmations: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `head - block + 1`, floored at zero and capped at `required`.
pub fn confirmations_at(head: u64, block_number: u64, required: u64) -> u64 {
    let raw = head.saturating_add(1).saturating_sub(block_number);
    raw.min(required)
}

/// `raw / 10^decimals` as an exact decimal, normalized to scale 18.
pub fn format_amount(raw: U256, decimals: u8) -> eyre::Result<BigDecimal> {
    let digits = BigInt::from_str(&raw.to_string())
        .map_err(|e| eyre::eyre!("Unparseable raw amount '{}': {}", raw, e))?;
    Ok(BigDecimal::new(digits, i64::from(decimals)).with_scale(AMOUNT_SCALE))
}

/// Canonical storage form for addresses: 0x-prefixed lower-case hex.
pub fn lower_hex_address(address: Address) -> String {
    format!("{address:#x}")
}

/// Canonical storage form for hashes: 0x-prefixed lower-case hex.
pub fn lower_hex_b256(hash: B256) -> String {
    format!("{hash:#x}")
}

/// Canonicalize an operator-supplied hex string (address or hash) for
/// lookups against stored rows.
pub fn canonicalize_hex(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        format!("0x{}", trimmed[2..].to_ascii_lowercase())
    } else {
        format!("0x{}", trimmed.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        assert_eq!(TxStatus::derive(0, 12), TxStatus::Pending);
        assert_eq!(TxStatus::derive(11, 12), TxStatus::Pending);
        assert_eq!(TxStatus::derive(12, 12), TxStatus::Confirmed);
        assert_eq!(TxStatus::derive(100, 12), TxStatus::Confirmed);
    }

    #[test]
    fn test_confirmations_never_negative_and_capped() {
        // Event in a block the head has not reached (clock skew between nodes).
        assert_eq!(confirmations_at(1000, 1005, 12), 0);
        // Head == block: one confirmation.
        assert_eq!(confirmations_at(1005, 1005, 12), 1);
        // Six deep.
        assert_eq!(confirmations_at(1010, 1005, 12), 6);
        // Deep history caps at the threshold.
        assert_eq!(confirmations_at(1025, 1008, 12), 12);
    }

    #[test]
    fn test_format_amount_one_token() {
        let raw = U256::from_str("1000000000000000000").unwrap();
        let amount = format_amount(raw, 18).unwrap();
        assert_eq!(amount.to_string(), "1.000000000000000000");
    }

    #[test]
    fn test_format_amount_six_decimals() {
        let raw = U256::from(1_500_000u64);
        let amount = format_amount(raw, 6).unwrap();
        assert_eq!(amount.to_string(), "1.500000000000000000");
    }

    #[test]
    fn test_format_amount_zero_decimals() {
        let amount = format_amount(U256::from(42u64), 0).unwrap();
        assert_eq!(amount.to_string(), "42.000000000000000000");
    }

    #[test]
    fn test_format_amount_78_digit_raw() {
        // U256::MAX is 78 decimal digits; the division must stay exact.
        let amount = format_amount(U256::MAX, 18).unwrap();
        assert_eq!(
            amount.to_string(),
            "115792089237316195423570985008687907853269984665640564039457.584007913129639935"
        );
    }

    #[test]
    fn test_lower_hex_forms() {
        let addr = Address::from_str("0xCcCCcCCcCCCCcCCCcCccCcccCCCccCcCCCCcCccC").unwrap();
        assert_eq!(
            lower_hex_address(addr),
            "0xcccccccccccccccccccccccccccccccccccccccc"
        );
        assert_eq!(
            canonicalize_hex("0XDEADbeef"),
            "0xdeadbeef"
        );
        assert_eq!(canonicalize_hex("deadBEEF"), "0xdeadbeef");
    }
}
