use std::sync::Arc;

use alloy::primitives::B256;
use alloy::rpc::types::TransactionReceipt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use txengine_core::chain::{Chain, Head};
use txengine_core::config::EngineConfig;
use txengine_core::keystore::KeyStore;
use txengine_store::{ReceiptData, Store, StoreError, TransactionWithAttempts};

use crate::gas::bump_gas;
use crate::metrics;
use crate::send::{SendFailure, SendOutcomeKind, send_transaction};

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("RPC error: {message}")]
    Rpc { message: String },

    #[error("transient send error: {message}")]
    TransientSend { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Drives broadcast transactions to confirmation.
///
/// Consumes the head stream one head at a time (the head source is
/// single-consumer; nothing here is safe to run against itself). Each head
/// stamps the height on fresh attempts, attaches any mined receipts, and
/// re-sends stalled transactions at a bumped gas price.
pub struct Confirmer<C: Chain> {
    store: Store,
    chain: Arc<C>,
    keystore: Arc<KeyStore>,
    config: Arc<EngineConfig>,
}

pub struct ConfirmerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ConfirmerHandle {
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!("confirmer was already shutting down");
        }
        if let Err(e) = self.join_handle.await {
            tracing::error!(error = %e, "confirmer task panicked during shutdown");
        }
    }
}

impl<C: Chain + 'static> Confirmer<C> {
    pub fn new(
        store: Store,
        chain: Arc<C>,
        keystore: Arc<KeyStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            chain,
            keystore,
            config,
        }
    }

    /// Start processing the head stream. Runs until the stream closes or
    /// the handle is shut down.
    pub fn spawn(self, heads: mpsc::Receiver<Head>) -> ConfirmerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(self.run(heads, shutdown_rx));

        ConfirmerHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(self, mut heads: mpsc::Receiver<Head>, mut shutdown_rx: oneshot::Receiver<()>) {
        tracing::info!("confirmer started");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("confirmer stopped");
                    return;
                }
                head = heads.recv() => {
                    let Some(head) = head else {
                        tracing::info!("head stream closed, confirmer exiting");
                        return;
                    };
                    if let Err(e) = self.process_head(&head).await {
                        // Nothing is lost: whatever this pass did not get
                        // to is re-examined on the next head.
                        tracing::error!(head = head.number, error = %e, "error processing head");
                    }
                }
            }
        }
    }

    pub async fn process_head(&self, head: &Head) -> Result<(), ConfirmError> {
        tracing::debug!(head = head.number, "processing head");

        // Step 1: record the height at which fresh attempts were first
        // seen still unconfirmed.
        self.store
            .set_broadcast_before_block_num(head.number as i64 - 1)
            .await?;

        // Step 2: attach receipts for anything that got mined.
        self.check_for_receipts().await?;

        // Step 3: re-send whatever has been stuck for too long.
        self.bump_gas_where_necessary(head).await
    }

    async fn check_for_receipts(&self) -> Result<(), ConfirmError> {
        let unconfirmed = self.store.find_unconfirmed_transactions().await?;

        for etx in unconfirmed {
            // Only one attempt can be mined; checking in descending fee
            // order surfaces it fastest in practice.
            for attempt in &etx.attempts {
                match self.fetch_receipt(attempt.hash).await {
                    Ok(Some(receipt)) => {
                        self.store.save_receipt(attempt, &receipt).await?;
                        metrics::record_confirmed(self.chain.chain_id());
                        tracing::info!(
                            eth_transaction_id = etx.transaction.id,
                            hash = %attempt.hash,
                            block_number = receipt.block_number,
                            "transaction confirmed"
                        );
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Per-attempt trouble must not abort the whole
                        // pass; this hash is retried on the next head.
                        tracing::warn!(hash = %attempt.hash, error = %e, "failed to fetch receipt");
                    }
                }
            }
        }
        Ok(())
    }

    async fn bump_gas_where_necessary(&self, head: &Head) -> Result<(), ConfirmError> {
        // An attempt first seen unconfirmed at head H carries
        // broadcast_before_block_num = H - 1 and has sat through
        // `head.number - 1 - broadcast_before_block_num` full heads since;
        // it becomes bumpable only once that exceeds the threshold.
        let cutoff = head.number as i64 - self.config.gas.bump_threshold as i64 - 1;
        let stalled = self.store.find_transactions_requiring_bump(cutoff).await?;

        for etx in stalled {
            self.bump_transaction(&etx).await?;
        }
        Ok(())
    }

    async fn bump_transaction(&self, etx: &TransactionWithAttempts) -> Result<(), ConfirmError> {
        let Some(current) = etx.current_attempt() else {
            return Err(ConfirmError::Internal {
                message: format!(
                    "unconfirmed transaction {} has no attempts",
                    etx.transaction.id
                ),
            });
        };

        let bumped = bump_gas(&self.config.gas, current.gas_price);
        if bumped <= current.gas_price {
            // Already at the ceiling. A replacement at the same price
            // would be byte-identical to the current attempt, so there is
            // nothing to send; wait for inclusion instead.
            tracing::debug!(
                eth_transaction_id = etx.transaction.id,
                gas_price = current.gas_price,
                "gas price is at the configured ceiling, waiting for inclusion"
            );
            return Ok(());
        }

        tracing::info!(
            eth_transaction_id = etx.transaction.id,
            previous_gas_price = current.gas_price,
            bumped_gas_price = bumped,
            "re-sending stalled transaction at a higher gas price"
        );

        match send_transaction(
            self.chain.as_ref(),
            &self.keystore,
            &self.config.gas,
            &etx.transaction,
            bumped,
        )
        .await
        {
            Ok(outcome) => match outcome.kind {
                // Even when the node claims to already know the hash, our
                // attempt row is the authoritative replacement record.
                SendOutcomeKind::Broadcast | SendOutcomeKind::AlreadyInMempool => {
                    self.store.insert_attempt(&outcome.attempt).await?;
                    metrics::record_gas_bump(self.chain.chain_id());
                }
                SendOutcomeKind::NonceAlreadyUsed => {
                    // The nonce is spent, so something at it is mined. If
                    // it was this replacement, persist it with its
                    // receipt; otherwise a prior attempt's receipt will
                    // surface on a later head.
                    match self.fetch_receipt(outcome.attempt.hash).await {
                        Ok(Some(receipt)) => {
                            self.store
                                .save_attempt_with_receipt(&outcome.attempt, &receipt)
                                .await?;
                            metrics::record_confirmed(self.chain.chain_id());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(
                                hash = %outcome.attempt.hash,
                                error = %e,
                                "failed to fetch receipt for replacement attempt"
                            );
                        }
                    }
                }
            },
            Err(SendFailure::Fatal { message }) => {
                // The broadcaster never persists an attempt that can
                // fatally error, so a fatal rejection of its replacement
                // is an invariant violation. Log and move on.
                tracing::error!(
                    eth_transaction_id = etx.transaction.id,
                    message = %message,
                    "replacement attempt fatally errored for a previously accepted transaction"
                );
            }
            Err(SendFailure::Transient { message }) => {
                return Err(ConfirmError::TransientSend { message });
            }
        }
        Ok(())
    }

    async fn fetch_receipt(&self, hash: B256) -> Result<Option<ReceiptData>, ConfirmError> {
        let receipt = self
            .chain
            .transaction_receipt(hash)
            .await
            .map_err(|e| ConfirmError::Rpc {
                message: e.to_string(),
            })?;

        match receipt {
            Some(receipt) => receipt_data(&receipt),
            None => Ok(None),
        }
    }
}

/// Convert the node's receipt into its persistable form, keeping the
/// response verbatim as JSON. A receipt without a block is not mined yet
/// and treated as absent.
fn receipt_data(receipt: &TransactionReceipt) -> Result<Option<ReceiptData>, ConfirmError> {
    let (Some(block_hash), Some(block_number)) = (receipt.block_hash, receipt.block_number) else {
        return Ok(None);
    };

    let raw = serde_json::to_value(receipt).map_err(|e| ConfirmError::Internal {
        message: format!("failed to serialize receipt: {e}"),
    })?;

    Ok(Some(ReceiptData {
        transaction_hash: receipt.transaction_hash,
        block_hash,
        block_number: block_number as i64,
        transaction_index: receipt.transaction_index.unwrap_or_default() as i64,
        receipt: raw,
    }))
}
