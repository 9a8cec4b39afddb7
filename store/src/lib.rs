//! Durable state for the transaction engine.
//!
//! The database is the single source of truth: nonce counters, transaction
//! intents, signed attempts and receipts all live here, and every
//! cross-row invariant is enforced by constraints and indexes rather than
//! application code. All multi-row writes go through database
//! transactions so either loop can crash at any point without losing
//! transactions or duplicating nonces.

pub mod error;
pub mod lock;
pub mod models;
mod numeric;

use alloy::primitives::Address;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

pub use error::StoreError;
pub use lock::AdvisoryLock;
pub use models::{
    AttemptState, EthReceipt, EthTransaction, EthTransactionAttempt, Key, NewAttempt,
    NewTransaction, ReceiptData, TransactionWithAttempts, TxState,
};

use numeric::{u128_to_numeric, u256_to_numeric};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---------- keys ----------

    pub async fn keys(&self) -> Result<Vec<Key>, StoreError> {
        let keys = sqlx::query_as::<_, Key>("SELECT * FROM keys ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    /// Provision a key row for an address the key store can sign for.
    /// Idempotent. Keys are normally created out-of-band; the engine
    /// itself only reads and increments them.
    pub async fn register_key(&self, address: Address) -> Result<Key, StoreError> {
        let key = sqlx::query_as::<_, Key>(
            "INSERT INTO keys (address, next_nonce, created_at, updated_at)
             VALUES ($1, 0, now(), now())
             ON CONFLICT (address) DO UPDATE SET updated_at = now()
             RETURNING *",
        )
        .bind(address.as_slice())
        .fetch_one(&self.pool)
        .await?;
        Ok(key)
    }

    pub async fn get_next_nonce(&self, address: Address) -> Result<i64, StoreError> {
        let nonce: Option<i64> = sqlx::query_scalar("SELECT next_nonce FROM keys WHERE address = $1")
            .bind(address.as_slice())
            .fetch_optional(&self.pool)
            .await?;
        nonce.ok_or_else(|| StoreError::Validation {
            message: format!("no key found for address {address}"),
        })
    }

    /// Take the cluster-wide advisory lock `(class_id, key_id)` if free.
    /// Returns `None` when another process holds it.
    pub async fn try_advisory_lock(
        &self,
        class_id: i32,
        key_id: i32,
    ) -> Result<Option<AdvisoryLock>, StoreError> {
        AdvisoryLock::try_acquire(&self.pool, class_id, key_id).await
    }

    // ---------- upstream input ----------

    /// Insert a transaction intent together with its task-run link, in one
    /// database transaction. Idempotent on the task-run id: a repeated
    /// call returns the already-linked transaction untouched.
    pub async fn create_transaction(
        &self,
        new: &NewTransaction,
    ) -> Result<EthTransaction, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = transaction_for_task_run_on(&mut *tx, new.task_run_id).await? {
            tx.commit().await?;
            return Ok(existing);
        }

        let etx = sqlx::query_as::<_, EthTransaction>(
            "INSERT INTO eth_transactions
                 (from_address, to_address, encoded_payload, value, gas_limit, created_at)
             VALUES ($1, $2, $3, $4, $5, now())
             RETURNING *",
        )
        .bind(new.from_address.as_slice())
        .bind(new.to_address.as_slice())
        .bind(new.encoded_payload.to_vec())
        .bind(u256_to_numeric(new.value))
        .bind(new.gas_limit as i64)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO eth_task_run_transactions (task_run_id, eth_transaction_id) VALUES ($1, $2)",
        )
        .bind(new.task_run_id)
        .bind(etx.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(etx)
    }

    pub async fn transaction_for_task_run(
        &self,
        task_run_id: Uuid,
    ) -> Result<Option<EthTransaction>, StoreError> {
        transaction_for_task_run_on(&self.pool, task_run_id).await
    }

    // ---------- broadcaster reads ----------

    pub async fn find_transaction(&self, id: i64) -> Result<Option<EthTransaction>, StoreError> {
        let etx = sqlx::query_as::<_, EthTransaction>("SELECT * FROM eth_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(etx)
    }

    pub async fn transactions_for_address(
        &self,
        from_address: Address,
    ) -> Result<Vec<EthTransaction>, StoreError> {
        let etxs = sqlx::query_as::<_, EthTransaction>(
            "SELECT * FROM eth_transactions WHERE from_address = $1 ORDER BY id",
        )
        .bind(from_address.as_slice())
        .fetch_all(&self.pool)
        .await?;
        Ok(etxs)
    }

    /// The unique row with a nonce assigned but no broadcast timestamp:
    /// the crash-recovery anchor. The partial unique index guarantees at
    /// most one per address.
    pub async fn find_in_progress_transaction(
        &self,
        from_address: Address,
    ) -> Result<Option<EthTransaction>, StoreError> {
        let etx = sqlx::query_as::<_, EthTransaction>(
            "SELECT * FROM eth_transactions
             WHERE from_address = $1 AND nonce IS NOT NULL AND broadcast_at IS NULL",
        )
        .bind(from_address.as_slice())
        .fetch_optional(&self.pool)
        .await?;
        Ok(etx)
    }

    /// The oldest intent that has not been touched yet, in creation order.
    pub async fn next_unbroadcast_transaction(
        &self,
        from_address: Address,
    ) -> Result<Option<EthTransaction>, StoreError> {
        let etx = sqlx::query_as::<_, EthTransaction>(
            "SELECT * FROM eth_transactions
             WHERE from_address = $1
               AND nonce IS NULL AND error IS NULL AND broadcast_at IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(from_address.as_slice())
        .fetch_optional(&self.pool)
        .await?;
        Ok(etx)
    }

    // ---------- broadcaster writes ----------

    /// Assign a nonce to the row, making it the in-progress transaction
    /// for its address. The partial unique index forbids a second one.
    pub async fn assign_nonce(
        &self,
        etx: &mut EthTransaction,
        nonce: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE eth_transactions SET nonce = $1 WHERE id = $2")
            .bind(nonce)
            .bind(etx.id)
            .execute(&self.pool)
            .await?;
        etx.nonce = Some(nonce);
        Ok(())
    }

    /// Persist a successful broadcast: bump the key's nonce counter
    /// (conditioned on its current value), write the row, insert the
    /// attempt. One database transaction.
    pub async fn save_broadcast_transaction(
        &self,
        etx: &EthTransaction,
        attempt: &NewAttempt,
    ) -> Result<EthTransactionAttempt, StoreError> {
        let mut tx = self.begin_broadcast_save(etx).await?;
        let saved = insert_attempt_on(&mut *tx, attempt).await?;
        tx.commit().await?;
        Ok(saved)
    }

    /// Like [`save_broadcast_transaction`], but additionally re-queues the
    /// intent as a fresh unbroadcast clone in the same database
    /// transaction. Used when the nonce turned out to be already used: the
    /// sent transaction may still succeed, and the clone makes sure the
    /// caller's intent gets a later nonce either way.
    ///
    /// [`save_broadcast_transaction`]: Store::save_broadcast_transaction
    pub async fn save_broadcast_with_clone(
        &self,
        etx: &EthTransaction,
        attempt: &NewAttempt,
    ) -> Result<EthTransactionAttempt, StoreError> {
        let mut tx = self.begin_broadcast_save(etx).await?;
        let saved = insert_attempt_on(&mut *tx, attempt).await?;

        sqlx::query(
            "INSERT INTO eth_transactions
                 (from_address, to_address, encoded_payload, value, gas_limit, created_at)
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(etx.from_address.as_slice())
        .bind(etx.to_address.as_slice())
        .bind(etx.encoded_payload.to_vec())
        .bind(u256_to_numeric(etx.value))
        .bind(etx.gas_limit)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(saved)
    }

    async fn begin_broadcast_save(
        &self,
        etx: &EthTransaction,
    ) -> Result<Transaction<'_, Postgres>, StoreError> {
        let nonce = etx.nonce.ok_or_else(|| StoreError::Validation {
            message: "nonce must be set".to_string(),
        })?;
        if etx.broadcast_at.is_none() {
            return Err(StoreError::Validation {
                message: "broadcast_at must be set".to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        increment_next_nonce_on(&mut *tx, etx.from_address, nonce).await?;
        update_transaction_on(&mut *tx, etx).await?;
        Ok(tx)
    }

    /// Record a fatal send error: the message is persisted for upstream
    /// reporting and the nonce is released so the sequence has no gap.
    pub async fn save_fatally_errored_transaction(
        &self,
        etx: &mut EthTransaction,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE eth_transactions SET nonce = NULL, error = $1 WHERE id = $2")
            .bind(error)
            .bind(etx.id)
            .execute(&self.pool)
            .await?;
        etx.nonce = None;
        etx.error = Some(error.to_string());
        Ok(())
    }

    // ---------- confirmer ----------

    /// Stamp every attempt that has not yet seen a head with the given
    /// height. Returns how many attempts were stamped.
    pub async fn set_broadcast_before_block_num(&self, block_num: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE eth_transaction_attempts
             SET broadcast_before_block_num = $1
             WHERE broadcast_before_block_num IS NULL",
        )
        .bind(block_num)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All broadcast-but-unconfirmed transactions with their attempts,
    /// nonce ascending; attempts gas price descending.
    pub async fn find_unconfirmed_transactions(
        &self,
    ) -> Result<Vec<TransactionWithAttempts>, StoreError> {
        let etxs = sqlx::query_as::<_, EthTransaction>(
            "SELECT * FROM eth_transactions
             WHERE attempt_state = 'unconfirmed' AND broadcast_at IS NOT NULL
             ORDER BY nonce ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        self.with_attempts(etxs).await
    }

    /// Unconfirmed transactions whose current attempt was last seen
    /// unconfirmed strictly before `broadcast_before`, nonce ascending so
    /// the most blocking transaction is re-sent first.
    pub async fn find_transactions_requiring_bump(
        &self,
        broadcast_before: i64,
    ) -> Result<Vec<TransactionWithAttempts>, StoreError> {
        let etxs = sqlx::query_as::<_, EthTransaction>(
            "SELECT t.* FROM eth_transactions t
             WHERE t.attempt_state = 'unconfirmed' AND t.broadcast_at IS NOT NULL
               AND (
                   SELECT a.broadcast_before_block_num
                   FROM eth_transaction_attempts a
                   WHERE a.eth_transaction_id = t.id
                   ORDER BY a.gas_price DESC, a.id DESC
                   LIMIT 1
               ) < $1
             ORDER BY t.nonce ASC",
        )
        .bind(broadcast_before)
        .fetch_all(&self.pool)
        .await?;
        self.with_attempts(etxs).await
    }

    async fn with_attempts(
        &self,
        etxs: Vec<EthTransaction>,
    ) -> Result<Vec<TransactionWithAttempts>, StoreError> {
        if etxs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = etxs.iter().map(|etx| etx.id).collect();
        let attempts = sqlx::query_as::<_, EthTransactionAttempt>(
            "SELECT * FROM eth_transaction_attempts
             WHERE eth_transaction_id = ANY($1)
             ORDER BY gas_price DESC, id DESC",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_tx: std::collections::HashMap<i64, Vec<EthTransactionAttempt>> =
            std::collections::HashMap::new();
        for attempt in attempts {
            by_tx.entry(attempt.eth_transaction_id).or_default().push(attempt);
        }

        Ok(etxs
            .into_iter()
            .map(|transaction| {
                let attempts = by_tx.remove(&transaction.id).unwrap_or_default();
                TransactionWithAttempts {
                    transaction,
                    attempts,
                }
            })
            .collect())
    }

    pub async fn insert_attempt(
        &self,
        attempt: &NewAttempt,
    ) -> Result<EthTransactionAttempt, StoreError> {
        insert_attempt_on(&self.pool, attempt).await
    }

    pub async fn attempts_for_transaction(
        &self,
        eth_transaction_id: i64,
    ) -> Result<Vec<EthTransactionAttempt>, StoreError> {
        let attempts = sqlx::query_as::<_, EthTransactionAttempt>(
            "SELECT * FROM eth_transaction_attempts
             WHERE eth_transaction_id = $1
             ORDER BY gas_price DESC, id DESC",
        )
        .bind(eth_transaction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Record a mined receipt for an attempt and flip its transaction to
    /// confirmed, atomically. Idempotent on `(block_hash,
    /// transaction_hash)`.
    pub async fn save_receipt(
        &self,
        attempt: &EthTransactionAttempt,
        receipt: &ReceiptData,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_receipt_and_confirm_on(&mut tx, attempt.id, attempt.eth_transaction_id, receipt)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a freshly signed attempt together with its receipt. Used
    /// when a replacement send learns its nonce is already mined and the
    /// replacement itself turns out to be the included transaction.
    pub async fn save_attempt_with_receipt(
        &self,
        attempt: &NewAttempt,
        receipt: &ReceiptData,
    ) -> Result<EthTransactionAttempt, StoreError> {
        let mut tx = self.pool.begin().await?;
        let saved = insert_attempt_on(&mut *tx, attempt).await?;
        insert_receipt_and_confirm_on(&mut tx, saved.id, saved.eth_transaction_id, receipt).await?;
        tx.commit().await?;
        Ok(saved)
    }

    pub async fn receipt_for_attempt(
        &self,
        eth_transaction_attempt_id: i64,
    ) -> Result<Option<EthReceipt>, StoreError> {
        let receipt = sqlx::query_as::<_, EthReceipt>(
            "SELECT * FROM eth_receipts WHERE eth_transaction_attempt_id = $1",
        )
        .bind(eth_transaction_attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(receipt)
    }
}

async fn transaction_for_task_run_on<'e, E: PgExecutor<'e>>(
    executor: E,
    task_run_id: Uuid,
) -> Result<Option<EthTransaction>, StoreError> {
    let etx = sqlx::query_as::<_, EthTransaction>(
        "SELECT t.* FROM eth_transactions t
         JOIN eth_task_run_transactions l ON l.eth_transaction_id = t.id
         WHERE l.task_run_id = $1",
    )
    .bind(task_run_id)
    .fetch_optional(executor)
    .await?;
    Ok(etx)
}

/// Increment `keys.next_nonce` by exactly one, conditioned on its current
/// value. Zero affected rows means the key is gone or the counter was
/// moved by an external process, which the engine cannot recover from.
async fn increment_next_nonce_on<'e, E: PgExecutor<'e>>(
    executor: E,
    address: Address,
    current_nonce: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE keys SET next_nonce = next_nonce + 1, updated_at = now()
         WHERE address = $1 AND next_nonce = $2",
    )
    .bind(address.as_slice())
    .bind(current_nonce)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::InvariantViolation {
            message: format!(
                "could not increment next_nonce for {address}: no rows matched; either the key \
                 is missing or the nonce has been modified by an external process"
            ),
        });
    }
    Ok(())
}

async fn update_transaction_on<'e, E: PgExecutor<'e>>(
    executor: E,
    etx: &EthTransaction,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE eth_transactions SET nonce = $1, error = $2, broadcast_at = $3 WHERE id = $4",
    )
    .bind(etx.nonce)
    .bind(&etx.error)
    .bind(etx.broadcast_at)
    .bind(etx.id)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_attempt_on<'e, E: PgExecutor<'e>>(
    executor: E,
    attempt: &NewAttempt,
) -> Result<EthTransactionAttempt, StoreError> {
    let saved = sqlx::query_as::<_, EthTransactionAttempt>(
        "INSERT INTO eth_transaction_attempts
             (eth_transaction_id, gas_price, signed_raw_tx, hash, created_at)
         VALUES ($1, $2, $3, $4, now())
         RETURNING *",
    )
    .bind(attempt.eth_transaction_id)
    .bind(u128_to_numeric(attempt.gas_price))
    .bind(attempt.signed_raw_tx.to_vec())
    .bind(attempt.hash.as_slice())
    .fetch_one(executor)
    .await?;
    Ok(saved)
}

async fn insert_receipt_and_confirm_on(
    tx: &mut Transaction<'_, Postgres>,
    attempt_id: i64,
    eth_transaction_id: i64,
    receipt: &ReceiptData,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO eth_receipts
             (eth_transaction_attempt_id, transaction_hash, block_hash, block_number,
              transaction_index, receipt, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, now())
         ON CONFLICT (block_hash, transaction_hash) DO NOTHING",
    )
    .bind(attempt_id)
    .bind(receipt.transaction_hash.as_slice())
    .bind(receipt.block_hash.as_slice())
    .bind(receipt.block_number)
    .bind(receipt.transaction_index)
    .bind(&receipt.receipt)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE eth_transactions SET attempt_state = 'confirmed' WHERE id = $1")
        .bind(eth_transaction_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use alloy::primitives::{B256, Bytes, U256, address};

    // Validation paths that never reach the database.
    #[tokio::test]
    async fn broadcast_save_requires_nonce_and_broadcast_at() {
        let store = Store::with_pool(PgPool::connect_lazy("postgres://localhost/unused").unwrap());

        let mut etx = EthTransaction {
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
        };
        let attempt = NewAttempt {
            eth_transaction_id: 1,
            gas_price: 20_000_000_000,
            signed_raw_tx: Bytes::from(vec![0xf8]),
            hash: B256::ZERO,
        };

        let err = store
            .save_broadcast_transaction(&etx, &attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        etx.nonce = Some(0);
        let err = store
            .save_broadcast_transaction(&etx, &attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }
}
