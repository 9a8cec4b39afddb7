use alloy::primitives::{Address, B256, Bytes, U256};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::numeric::{numeric_to_u128, numeric_to_u256};

/// A signing identity. Created out-of-band; the engine only reads the
/// address and increments `next_nonce`.
#[derive(Debug, Clone)]
pub struct Key {
    pub id: i32,
    pub address: Address,
    pub next_nonce: i64,
}

/// Derived lifecycle state of a transaction row (§ state machine). Not
/// stored; computed from field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unbroadcast,
    InProgress,
    Unconfirmed,
    Confirmed,
    FatallyErrored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "eth_transactions_attempt_state", rename_all = "lowercase")]
pub enum AttemptState {
    Unconfirmed,
    Confirmed,
}

/// A logical transaction intent, as inserted by the upstream job runtime
/// and driven to confirmation by the engine.
#[derive(Debug, Clone)]
pub struct EthTransaction {
    pub id: i64,
    pub nonce: Option<i64>,
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub gas_limit: i64,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub attempt_state: AttemptState,
}

impl EthTransaction {
    pub fn state(&self) -> TxState {
        if self.error.is_some() {
            TxState::FatallyErrored
        } else if self.attempt_state == AttemptState::Confirmed {
            TxState::Confirmed
        } else if self.broadcast_at.is_some() {
            TxState::Unconfirmed
        } else if self.nonce.is_some() {
            TxState::InProgress
        } else {
            TxState::Unbroadcast
        }
    }
}

/// One signed, broadcastable version of a transaction at a specific gas
/// price. Never deleted; replacements pile up as further rows.
#[derive(Debug, Clone)]
pub struct EthTransactionAttempt {
    pub id: i64,
    pub eth_transaction_id: i64,
    pub gas_price: u128,
    pub signed_raw_tx: Bytes,
    pub hash: B256,
    /// The last head height at which this attempt was known to be still
    /// unconfirmed. NULL until the confirmer sees a head after broadcast.
    pub broadcast_before_block_num: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EthReceipt {
    pub id: i64,
    pub eth_transaction_attempt_id: i64,
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: i64,
    pub transaction_index: i64,
    pub receipt: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Upstream input: a new transaction intent with all lifecycle fields
/// unset.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub task_run_id: Uuid,
}

/// An attempt produced by signing, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub eth_transaction_id: i64,
    pub gas_price: u128,
    pub signed_raw_tx: Bytes,
    pub hash: B256,
}

/// The chain node's proof of inclusion, ready for persistence. `receipt`
/// holds the node's response verbatim.
#[derive(Debug, Clone)]
pub struct ReceiptData {
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: i64,
    pub transaction_index: i64,
    pub receipt: serde_json::Value,
}

/// An unconfirmed transaction with its attempts eagerly loaded, ordered by
/// gas price descending, so the first attempt is the current one.
#[derive(Debug, Clone)]
pub struct TransactionWithAttempts {
    pub transaction: EthTransaction,
    pub attempts: Vec<EthTransactionAttempt>,
}

impl TransactionWithAttempts {
    /// The attempt at the highest gas price: the one the mempool would
    /// keep if all of them were known.
    pub fn current_attempt(&self) -> Option<&EthTransactionAttempt> {
        self.attempts.first()
    }
}

fn decode_err(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn address_from_column(column: &str, bytes: Vec<u8>) -> Result<Address, sqlx::Error> {
    if bytes.len() != 20 {
        return Err(decode_err(format!(
            "column {column} holds {} bytes, expected a 20 byte address",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

fn hash_from_column(column: &str, bytes: Vec<u8>) -> Result<B256, sqlx::Error> {
    if bytes.len() != 32 {
        return Err(decode_err(format!(
            "column {column} holds {} bytes, expected a 32 byte hash",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

fn store_to_sqlx(error: StoreError) -> sqlx::Error {
    decode_err(error.to_string())
}

impl FromRow<'_, PgRow> for Key {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            address: address_from_column("address", row.try_get("address")?)?,
            next_nonce: row.try_get("next_nonce")?,
        })
    }
}

impl FromRow<'_, PgRow> for EthTransaction {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let payload: Vec<u8> = row.try_get("encoded_payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            nonce: row.try_get("nonce")?,
            from_address: address_from_column("from_address", row.try_get("from_address")?)?,
            to_address: address_from_column("to_address", row.try_get("to_address")?)?,
            encoded_payload: payload.into(),
            value: numeric_to_u256(&row.try_get("value")?).map_err(store_to_sqlx)?,
            gas_limit: row.try_get("gas_limit")?,
            error: row.try_get("error")?,
            broadcast_at: row.try_get("broadcast_at")?,
            created_at: row.try_get("created_at")?,
            attempt_state: row.try_get("attempt_state")?,
        })
    }
}

impl FromRow<'_, PgRow> for EthTransactionAttempt {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let raw: Vec<u8> = row.try_get("signed_raw_tx")?;
        Ok(Self {
            id: row.try_get("id")?,
            eth_transaction_id: row.try_get("eth_transaction_id")?,
            gas_price: numeric_to_u128(&row.try_get("gas_price")?).map_err(store_to_sqlx)?,
            signed_raw_tx: raw.into(),
            hash: hash_from_column("hash", row.try_get("hash")?)?,
            broadcast_before_block_num: row.try_get("broadcast_before_block_num")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl FromRow<'_, PgRow> for EthReceipt {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            eth_transaction_attempt_id: row.try_get("eth_transaction_attempt_id")?,
            transaction_hash: hash_from_column("transaction_hash", row.try_get("transaction_hash")?)?,
            block_hash: hash_from_column("block_hash", row.try_get("block_hash")?)?,
            block_number: row.try_get("block_number")?,
            transaction_index: row.try_get("transaction_index")?,
            receipt: row.try_get("receipt")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn base_tx() -> EthTransaction {
        EthTransaction {
            id: 1,
            nonce: None,
            from_address: address!("3cb8e3fd9d27e39bd02d965a5a1ec177a5dd5b24"),
            to_address: address!("6c03dda95a2aed917eecc6eddd4b9d16e6380411"),
            encoded_payload: Bytes::from(vec![1, 2, 3]),
            value: U256::from(142u64),
            gas_limit: 242,
            error: None,
            broadcast_at: None,
            created_at: Utc::now(),
            attempt_state: AttemptState::Unconfirmed,
        }
    }

    #[test]
    fn state_derivation_follows_the_lifecycle() {
        let mut tx = base_tx();
        assert_eq!(tx.state(), TxState::Unbroadcast);

        tx.nonce = Some(0);
        assert_eq!(tx.state(), TxState::InProgress);

        tx.broadcast_at = Some(Utc::now());
        assert_eq!(tx.state(), TxState::Unconfirmed);

        tx.attempt_state = AttemptState::Confirmed;
        assert_eq!(tx.state(), TxState::Confirmed);
    }

    #[test]
    fn fatally_errored_is_terminal_and_nonce_free() {
        let mut tx = base_tx();
        tx.error = Some("exceeds block gas limit".to_string());
        assert_eq!(tx.state(), TxState::FatallyErrored);
    }
}
