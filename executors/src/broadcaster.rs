use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use txengine_core::chain::Chain;
use txengine_core::config::EngineConfig;
use txengine_core::keystore::KeyStore;
use txengine_store::{EthTransaction, Key, Store, StoreError};

use crate::metrics;
use crate::send::{SendFailure, SendOutcomeKind, send_transaction};

/// How long to wait between polls of the database for new transactions to
/// send.
const DATABASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Advisory lock class under which per-key broadcast work is serialized
/// across the whole cluster.
pub const ADVISORY_LOCK_CLASS_ID: i32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("store error: {0}")]
    Store(StoreError),

    /// The database no longer matches what this engine wrote. The
    /// affected key is halted until an operator investigates.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("transient send error: {message}")]
    TransientSend { message: String },
}

impl From<StoreError> for BroadcastError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvariantViolation { message } => {
                BroadcastError::InvariantViolation { message }
            }
            other => BroadcastError::Store(other),
        }
    }
}

/// Watches `eth_transactions` for rows that need to be broadcast, assigns
/// nonces and makes sure the chain node has received each transaction at
/// least once.
///
/// This does not guarantee inclusion; transactions can still be evicted
/// from the mempool or sit below the market price. Eventual confirmation
/// is the [confirmer]'s job. What the broadcaster does guarantee is a
/// gapless monotonic nonce sequence per key and a persisted attempt for
/// everything it handed to the node.
///
/// [confirmer]: crate::confirmer::Confirmer
pub struct Broadcaster<C: Chain> {
    store: Store,
    chain: Arc<C>,
    keystore: Arc<KeyStore>,
    config: Arc<EngineConfig>,

    /// Keys taken out of rotation after an invariant violation. Cleared
    /// only by a restart.
    halted: Mutex<HashSet<Address>>,
}

/// Handle for a running broadcaster supervisor.
pub struct BroadcasterHandle {
    shutdown_tx: oneshot::Sender<()>,
    wake_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl BroadcasterHandle {
    /// Nudge the supervisor into running a round now instead of waiting
    /// for the next poll tick.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!("broadcaster was already shutting down");
        }
        if let Err(e) = self.join_handle.await {
            tracing::error!(error = %e, "broadcaster task panicked during shutdown");
        }
    }
}

impl<C: Chain + 'static> Broadcaster<C> {
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
            halted: Mutex::new(HashSet::new()),
        }
    }

    /// Start the supervisor loop. Workers observe the shutdown signal at
    /// round boundaries; an RPC in flight is allowed to finish within its
    /// deadline.
    pub fn spawn(self) -> BroadcasterHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let join_handle = tokio::spawn(self.monitor(shutdown_rx, wake_rx));

        BroadcasterHandle {
            shutdown_tx,
            wake_tx,
            join_handle,
        }
    }

    async fn monitor(self, mut shutdown_rx: oneshot::Receiver<()>, mut wake_rx: mpsc::Receiver<()>) {
        tracing::info!("broadcaster started");
        loop {
            self.run_once().await;

            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("broadcaster stopped");
                    return;
                }
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(DATABASE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run one broadcast round: a concurrent worker pass over every key.
    /// Separate keys are independent nonce sequences, so they progress in
    /// parallel; same-key work is serialized by the advisory lock.
    pub async fn run_once(&self) {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "failed to load keys");
                return;
            }
        };

        let halted = self.halted.lock().expect("halted set poisoned").clone();

        let mut rounds = Vec::new();
        for key in keys {
            if halted.contains(&key.address) {
                continue;
            }

            let worker = KeyWorker {
                store: self.store.clone(),
                chain: self.chain.clone(),
                keystore: self.keystore.clone(),
                config: self.config.clone(),
            };
            rounds.push(tokio::spawn(async move {
                let address = key.address;
                (address, worker.process_unbroadcast_transactions(key).await)
            }));
        }

        for result in futures::future::join_all(rounds).await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((address, Err(BroadcastError::InvariantViolation { message }))) => {
                    tracing::error!(
                        address = %address,
                        message = %message,
                        "invariant violation; halting broadcasts for this key until restart"
                    );
                    self.halted
                        .lock()
                        .expect("halted set poisoned")
                        .insert(address);
                }
                Ok((address, Err(error))) => {
                    // Retries are unbounded: transient errors are absorbed
                    // here and the next tick starts over.
                    tracing::error!(
                        address = %address,
                        error = %error,
                        "error processing unbroadcast transactions"
                    );
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "broadcaster key worker panicked");
                }
            }
        }
    }
}

struct KeyWorker<C: Chain> {
    store: Store,
    chain: Arc<C>,
    keystore: Arc<KeyStore>,
    config: Arc<EngineConfig>,
}

impl<C: Chain> KeyWorker<C> {
    /// One worker round for one key, under the cluster-wide advisory
    /// lock. If another process holds the lock this round is skipped; the
    /// other holder is doing the same work.
    async fn process_unbroadcast_transactions(&self, key: Key) -> Result<(), BroadcastError> {
        let Some(lock) = self
            .store
            .try_advisory_lock(ADVISORY_LOCK_CLASS_ID, key.id)
            .await?
        else {
            tracing::debug!(
                address = %key.address,
                "another process holds the broadcast lock for this key, skipping this round"
            );
            return Ok(());
        };

        let outcome = self.process_for_address(key.address).await;

        if let Err(e) = lock.release().await {
            tracing::error!(address = %key.address, error = %e, "failed to release advisory lock");
        }
        outcome
    }

    async fn process_for_address(&self, from_address: Address) -> Result<(), BroadcastError> {
        self.handle_any_in_progress_transaction(from_address).await?;

        loop {
            let Some(mut etx) = self.store.next_unbroadcast_transaction(from_address).await? else {
                tracing::debug!(address = %from_address, "no unbroadcast transactions left");
                return Ok(());
            };

            let nonce = self.store.get_next_nonce(from_address).await?;
            self.store.assign_nonce(&mut etx, nonce).await?;

            // From here the row is the in-progress transaction for this
            // key; if anything below is interrupted, the recovery pass on
            // the next round picks it up.
            if self.broadcast_assigned(etx, false).await? == RoundControl::Done {
                return Ok(());
            }
        }
    }

    /// Crash recovery: at most one row per key can have a nonce assigned
    /// without a broadcast timestamp. A previous run assigned the nonce
    /// and died somewhere before marking the send, which may or may not
    /// have reached the node. Resending is safe: the node deduplicates an
    /// identical transaction as already-in-mempool.
    async fn handle_any_in_progress_transaction(
        &self,
        from_address: Address,
    ) -> Result<(), BroadcastError> {
        let Some(etx) = self.store.find_in_progress_transaction(from_address).await? else {
            return Ok(());
        };

        tracing::warn!(
            eth_transaction_id = etx.id,
            address = %from_address,
            "found an in-progress transaction left over from a previous run, resending"
        );
        self.broadcast_assigned(etx, true).await?;
        Ok(())
    }

    async fn broadcast_assigned(
        &self,
        mut etx: EthTransaction,
        recovered: bool,
    ) -> Result<RoundControl, BroadcastError> {
        let gas = &self.config.gas;

        match send_transaction(
            self.chain.as_ref(),
            &self.keystore,
            gas,
            &etx,
            gas.price_default,
        )
        .await
        {
            Ok(outcome) => match outcome.kind {
                SendOutcomeKind::Broadcast | SendOutcomeKind::AlreadyInMempool => {
                    etx.broadcast_at = Some(Utc::now());
                    self.store
                        .save_broadcast_transaction(&etx, &outcome.attempt)
                        .await?;
                    metrics::record_broadcast(self.chain.chain_id());
                    Ok(RoundControl::Continue)
                }
                SendOutcomeKind::NonceAlreadyUsed => {
                    // We cannot know when (or whether) the competing send
                    // actually happened; created_at is the best estimate
                    // available for the broadcast timestamp.
                    etx.broadcast_at = Some(etx.created_at);

                    if recovered {
                        tracing::warn!(
                            nonce = etx.nonce,
                            address = %etx.from_address,
                            "a transaction with this nonce was already confirmed or pending; either \
                             the node crashed on a previous run or the address has been used by \
                             another wallet; assuming it was sent successfully"
                        );
                        self.store
                            .save_broadcast_transaction(&etx, &outcome.attempt)
                            .await?;
                    } else {
                        tracing::error!(
                            nonce = etx.nonce,
                            eth_transaction_id = etx.id,
                            address = %etx.from_address,
                            "nonce was too low; this address has been used by another wallet, which \
                             is NOT SUPPORTED and can lead to missing or reverted transactions; \
                             re-queuing the intent for a later nonce"
                        );
                        self.store
                            .save_broadcast_with_clone(&etx, &outcome.attempt)
                            .await?;
                    }
                    metrics::record_broadcast(self.chain.chain_id());

                    // End the round here: the clone (when one was queued)
                    // stays unbroadcast until the next tick, giving the
                    // confirmer a chance to observe what actually occupies
                    // this nonce before we consume the next one.
                    Ok(RoundControl::Done)
                }
            },
            Err(SendFailure::Fatal { message }) => {
                tracing::warn!(
                    eth_transaction_id = etx.id,
                    message = %message,
                    "transaction can never be mined, recording the error and releasing its nonce"
                );
                self.store
                    .save_fatally_errored_transaction(&mut etx, &message)
                    .await?;
                metrics::record_fatal_error(self.chain.chain_id());
                Ok(RoundControl::Continue)
            }
            Err(SendFailure::Transient { message }) => {
                // Leave the row as-is and let the next round retry.
                Err(BroadcastError::TransientSend { message })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundControl {
    /// Keep draining the unbroadcast queue.
    Continue,
    /// Stop this round; remaining work waits for the next tick.
    Done,
}
