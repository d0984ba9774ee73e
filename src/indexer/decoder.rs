use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;

use super::types::{
    format_amount, Operation, ParsedEvent, DEFAULT_TOKEN_DECIMALS,
};

// Generate the vault event ABI using alloy's sol! macro.
// This gives us SIGNATURE_HASH constants for the log filter and registry.
sol! {
    event Deposit(address indexed user, address indexed tokenAddress, uint256 amount, uint8 decimals);
    event Withdraw(address indexed user, address indexed tokenAddress, uint256 amount, uint8 decimals);
}

/// The event-shaped part of a log, before chain metadata is attached.
#[derive(Debug)]
pub struct DecodedPayload {
    pub user: Address,
    pub token_address: Option<Address>,
    pub raw_amount: U256,
    pub decimals: u8,
}

type DecodeFn = fn(&Log) -> eyre::Result<DecodedPayload>;

struct RegisteredEvent {
    name: &'static str,
    topic0: B256,
    operation: Operation,
    decode: DecodeFn,
}

/// Flat dispatch table keyed by event signature hash.
///
/// New event kinds plug in through `register`; the crawler only ever sees
/// `ParsedEvent`s and does not change.
pub struct EventRegistry {
    events: Vec<RegisteredEvent>,
}

impl EventRegistry {
    /// The registry with the two vault events this system tracks.
    pub fn standard() -> Self {
        let mut registry = Self { events: Vec::new() };
        registry.register(
            "Deposit",
            Deposit::SIGNATURE_HASH,
            Operation::Deposit,
            decode_amount_payload,
        );
        registry.register(
            "Withdraw",
            Withdraw::SIGNATURE_HASH,
            Operation::Withdraw,
            decode_amount_payload,
        );
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        topic0: B256,
        operation: Operation,
        decode: DecodeFn,
    ) {
        self.events.push(RegisteredEvent {
            name,
            topic0,
            operation,
            decode,
        });
    }

    /// Signature hashes for the log filter's topic0 set.
    pub fn event_signatures(&self) -> Vec<B256> {
        self.events.iter().map(|e| e.topic0).collect()
    }

    pub fn contains(&self, topic0: &B256) -> bool {
        self.events.iter().any(|e| e.topic0 == *topic0)
    }

    /// Decode every log that matches a registered event.
    ///
    /// Unknown event signatures are skipped with a warning; decode failures
    /// are skipped with an error log. A bad log never aborts the batch.
    pub fn parse_all(&self, logs: &[Log]) -> Vec<ParsedEvent> {
        let mut parsed = Vec::with_capacity(logs.len());
        for log in logs {
            match self.parse(log) {
                Ok(Some(event)) => parsed.push(event),
                Ok(None) => {
                    tracing::warn!(
                        contract = %log.inner.address,
                        tx_hash = ?log.transaction_hash,
                        "Log does not match any registered event, skipping"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        contract = %log.inner.address,
                        tx_hash = ?log.transaction_hash,
                        error = %e,
                        "Failed to decode log, skipping"
                    );
                }
            }
        }
        parsed
    }

    /// Decode a single log. `Ok(None)` means no registered event matched.
    pub fn parse(&self, log: &Log) -> eyre::Result<Option<ParsedEvent>> {
        let topics = log.inner.data.topics();
        let Some(topic0) = topics.first() else {
            return Err(eyre::eyre!("log has no topics"));
        };
        let Some(entry) = self.events.iter().find(|e| e.topic0 == *topic0) else {
            return Ok(None);
        };

        let payload = (entry.decode)(log)
            .map_err(|e| eyre::eyre!("{} event: {}", entry.name, e))?;

        let block_number = log
            .block_number
            .ok_or_else(|| eyre::eyre!("{} log is missing block number", entry.name))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| eyre::eyre!("{} log is missing transaction hash", entry.name))?;

        Ok(Some(ParsedEvent {
            operation: entry.operation,
            user: payload.user,
            token_address: payload.token_address,
            raw_amount: payload.raw_amount,
            decimals: payload.decimals,
            amount: format_amount(payload.raw_amount, payload.decimals)?,
            contract_address: log.inner.address,
            block_number,
            transaction_hash,
            block_hash: log.block_hash.unwrap_or_default(),
            log_index: log.log_index.unwrap_or(0),
        }))
    }
}

/// Shared payload decoder for `(user indexed, tokenAddress indexed,
/// uint256 amount, uint8 decimals)` shaped events.
///
/// `decimals` defaults to 18 when the data segment only carries the amount.
fn decode_amount_payload(log: &Log) -> eyre::Result<DecodedPayload> {
    let topics = log.inner.data.topics();
    if topics.len() != 3 {
        return Err(eyre::eyre!("expected 3 topics, got {}", topics.len()));
    }

    let user = Address::from_word(topics[1]);
    let token = Address::from_word(topics[2]);
    // The zero address means no token payload (native-asset events).
    let token_address = (token != Address::ZERO).then_some(token);

    let data = log.inner.data.data.as_ref();
    if data.len() < 32 {
        return Err(eyre::eyre!("data segment too short for amount: {} bytes", data.len()));
    }
    let raw_amount = U256::from_be_slice(&data[..32]);

    let decimals = if data.len() >= 64 {
        let word = U256::from_be_slice(&data[32..64]);
        u8::try_from(word)
            .map_err(|_| eyre::eyre!("decimals word out of range: {}", word))?
    } else {
        DEFAULT_TOKEN_DECIMALS
    };

    Ok(DecodedPayload {
        user,
        token_address,
        raw_amount,
        decimals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};
    use std::str::FromStr;

    const CONTRACT: &str = "0xCcCCcCCcCCCCcCCCcCccCcccCCCccCcCCCCcCccC";
    const USER: &str = "0x1111111111111111111111111111111111111111";
    const TOKEN: &str = "0x2222222222222222222222222222222222222222";

    fn address_word(addr: Address) -> B256 {
        addr.into_word()
    }

    fn make_log(topic0: B256, user: Address, token: Address, data: Vec<u8>) -> Log {
        let inner = alloy::primitives::Log {
            address: Address::from_str(CONTRACT).unwrap(),
            data: LogData::new_unchecked(
                vec![topic0, address_word(user), address_word(token)],
                Bytes::from(data),
            ),
        };
        Log {
            inner,
            block_hash: Some(B256::repeat_byte(0xbb)),
            block_number: Some(1005),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(0xde)),
            transaction_index: Some(0),
            log_index: Some(7),
            removed: false,
        }
    }

    fn amount_data(amount: U256, decimals: Option<u8>) -> Vec<u8> {
        let mut data = amount.to_be_bytes::<32>().to_vec();
        if let Some(d) = decimals {
            data.extend_from_slice(&U256::from(d).to_be_bytes::<32>());
        }
        data
    }

    #[test]
    fn test_parse_deposit_log() {
        let user = Address::from_str(USER).unwrap();
        let token = Address::from_str(TOKEN).unwrap();
        let amount = U256::from_str("1000000000000000000").unwrap();
        let log = make_log(
            Deposit::SIGNATURE_HASH,
            user,
            token,
            amount_data(amount, Some(18)),
        );

        let registry = EventRegistry::standard();
        let events = registry.parse_all(&[log]);
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.operation, Operation::Deposit);
        assert_eq!(event.user, user);
        assert_eq!(event.token_address, Some(token));
        assert_eq!(event.raw_amount.to_string(), "1000000000000000000");
        assert_eq!(event.decimals, 18);
        assert_eq!(event.amount.to_string(), "1.000000000000000000");
        assert_eq!(event.block_number, 1005);
        assert_eq!(event.log_index, 7);
    }

    #[test]
    fn test_parse_withdraw_log() {
        let user = Address::from_str(USER).unwrap();
        let token = Address::from_str(TOKEN).unwrap();
        let log = make_log(
            Withdraw::SIGNATURE_HASH,
            user,
            token,
            amount_data(U256::from(2_500_000u64), Some(6)),
        );

        let registry = EventRegistry::standard();
        let event = registry.parse(&log).unwrap().unwrap();
        assert_eq!(event.operation, Operation::Withdraw);
        assert_eq!(event.decimals, 6);
        assert_eq!(event.amount.to_string(), "2.500000000000000000");
    }

    #[test]
    fn test_decimals_default_when_absent() {
        let user = Address::from_str(USER).unwrap();
        let token = Address::from_str(TOKEN).unwrap();
        let log = make_log(
            Deposit::SIGNATURE_HASH,
            user,
            token,
            amount_data(U256::from(5u64), None),
        );

        let registry = EventRegistry::standard();
        let event = registry.parse(&log).unwrap().unwrap();
        assert_eq!(event.decimals, DEFAULT_TOKEN_DECIMALS);
    }

    #[test]
    fn test_zero_token_address_is_absent() {
        let user = Address::from_str(USER).unwrap();
        let log = make_log(
            Deposit::SIGNATURE_HASH,
            user,
            Address::ZERO,
            amount_data(U256::from(1u64), Some(18)),
        );

        let registry = EventRegistry::standard();
        let event = registry.parse(&log).unwrap().unwrap();
        assert_eq!(event.token_address, None);
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        let user = Address::from_str(USER).unwrap();
        let token = Address::from_str(TOKEN).unwrap();
        let log = make_log(
            B256::repeat_byte(0x99),
            user,
            token,
            amount_data(U256::from(1u64), Some(18)),
        );

        let registry = EventRegistry::standard();
        assert!(registry.parse(&log).unwrap().is_none());
        assert!(registry.parse_all(&[log]).is_empty());
    }

    #[test]
    fn test_short_data_is_skipped_not_fatal() {
        let user = Address::from_str(USER).unwrap();
        let token = Address::from_str(TOKEN).unwrap();
        let bad = make_log(Deposit::SIGNATURE_HASH, user, token, vec![0u8; 8]);
        let good = make_log(
            Withdraw::SIGNATURE_HASH,
            user,
            token,
            amount_data(U256::from(1u64), Some(18)),
        );

        let registry = EventRegistry::standard();
        let events = registry.parse_all(&[bad, good]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Withdraw);
    }

    #[test]
    fn test_event_signature_set() {
        let registry = EventRegistry::standard();
        let signatures = registry.event_signatures();
        assert_eq!(signatures.len(), 2);
        assert!(registry.contains(&Deposit::SIGNATURE_HASH));
        assert!(registry.contains(&Withdraw::SIGNATURE_HASH));
        assert!(!registry.contains(&B256::repeat_byte(0x99)));
    }
}
