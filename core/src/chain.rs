use std::future::Future;
use std::time::Duration;

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{B256, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionReceipt,
    transports::{RpcError, TransportErrorKind, http::reqwest::Url},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The worst case time we will wait for a response from the chain node
/// before the call is treated as failed. A deadline overrun surfaces as a
/// transport error, which the send-error classifier treats as transient.
pub const MAX_RPC_REQUEST_TIME: Duration = Duration::from_secs(120);

const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A chain head as delivered by the head subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Façade over the remote chain node.
///
/// The engine only ever needs three operations: broadcast raw bytes, look
/// up a receipt, and observe new heads. Everything else (gas estimation,
/// contract calls, ...) belongs to upstream collaborators.
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Broadcast canonical signed transaction bytes via
    /// `eth_sendRawTransaction`.
    fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> impl Future<Output = Result<B256, RpcError<TransportErrorKind>>> + Send;

    /// Look up the receipt for a previously broadcast hash. `None` means
    /// the node does not know the hash, or the transaction is not mined
    /// yet.
    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<TransactionReceipt>, RpcError<TransportErrorKind>>> + Send;

    /// Subscribe to new chain heads. The subscription stays alive until
    /// the receiver is dropped.
    fn subscribe_heads(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Head>, RpcError<TransportErrorKind>>> + Send;
}

/// HTTP-transport implementation of [`Chain`] over an alloy provider.
#[derive(Clone)]
pub struct HttpChain {
    chain_id: u64,
    provider: RootProvider,
}

impl HttpChain {
    pub fn new(chain_id: u64, rpc_url: Url) -> Self {
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(rpc_url);

        Self { chain_id, provider }
    }

    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

async fn with_deadline<T>(
    fut: impl Future<Output = Result<T, RpcError<TransportErrorKind>>>,
) -> Result<T, RpcError<TransportErrorKind>> {
    match tokio::time::timeout(MAX_RPC_REQUEST_TIME, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportErrorKind::custom_str(
            "chain node request exceeded the two minute deadline",
        )),
    }
}

impl Chain for HttpChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> Result<B256, RpcError<TransportErrorKind>> {
        let pending =
            with_deadline(async { self.provider.send_raw_transaction(&raw).await }).await?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError<TransportErrorKind>> {
        with_deadline(async { self.provider.get_transaction_receipt(hash).await }).await
    }

    /// The HTTP transport has no native subscription, so heads are polled
    /// once per second and every observed advance is emitted. Reorged
    /// heads at the same or lower height are not re-emitted; the consumer
    /// only cares that the chain moved forward.
    async fn subscribe_heads(&self) -> Result<mpsc::Receiver<Head>, RpcError<TransportErrorKind>> {
        let (head_tx, head_rx) = mpsc::channel(16);
        let provider = self.provider.clone();

        tokio::spawn(async move {
            let mut last_seen: Option<u64> = None;
            let mut tick = tokio::time::interval(HEAD_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;

                let block = match provider.get_block_by_number(BlockNumberOrTag::Latest).await {
                    Ok(Some(block)) => block,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to poll latest block for head subscription");
                        continue;
                    }
                };

                let number = block.header.number;
                if last_seen.is_some_and(|seen| number <= seen) {
                    continue;
                }
                last_seen = Some(number);

                let head = Head {
                    number,
                    hash: block.header.hash,
                    parent_hash: block.header.parent_hash,
                };
                if head_tx.send(head).await.is_err() {
                    // Receiver dropped, subscription is over.
                    return;
                }
            }
        });

        Ok(head_rx)
    }
}
