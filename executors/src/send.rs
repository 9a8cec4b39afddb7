use alloy::consensus::TxLegacy;
use alloy::primitives::TxKind;
use txengine_core::chain::Chain;
use txengine_core::config::GasConfig;
use txengine_core::error::EngineError;
use txengine_core::keystore::KeyStore;
use txengine_store::{EthTransaction, NewAttempt};

use crate::error_classifier::{SendError, SendErrorKind};
use crate::gas::bump_gas;

/// How a broadcast attempt ended up in the node's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcomeKind {
    /// The node accepted the raw transaction.
    Broadcast,
    /// The node already had this hash; same thing as far as we care.
    AlreadyInMempool,
    /// Something else occupies this nonce. The attempt may or may not be
    /// the transaction that gets mined.
    NonceAlreadyUsed,
}

#[derive(Debug, Clone)]
pub(crate) struct SendOutcome {
    pub attempt: NewAttempt,
    pub kind: SendOutcomeKind,
}

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum SendFailure {
    /// Can never succeed; persist the message and release the nonce.
    #[error("fatal send error: {message}")]
    Fatal { message: String },

    /// Worth retrying on a later round, row state untouched.
    #[error("transient send error: {message}")]
    Transient { message: String },
}

/// Sign `etx` at `initial_gas_price` and hand it to the chain node,
/// classifying the response. A terminally-underpriced rejection is
/// retried in place at successively bumped prices (same nonce, unbounded)
/// until the node takes it or fails differently; only the attempt that
/// finally left the building is returned.
pub(crate) async fn send_transaction<C: Chain>(
    chain: &C,
    keystore: &KeyStore,
    gas: &GasConfig,
    etx: &EthTransaction,
    initial_gas_price: u128,
) -> Result<SendOutcome, SendFailure> {
    let Some(nonce) = etx.nonce else {
        return Err(SendFailure::Fatal {
            message: "cannot send transaction without nonce".to_string(),
        });
    };

    let mut gas_price = initial_gas_price;

    loop {
        let tx = TxLegacy {
            chain_id: Some(chain.chain_id()),
            nonce: nonce as u64,
            gas_price,
            gas_limit: etx.gas_limit as u64,
            to: TxKind::Call(etx.to_address),
            value: etx.value,
            input: etx.encoded_payload.clone(),
        };

        let signed = keystore
            .sign_transaction(etx.from_address, tx)
            .map_err(|e| match e {
                // Signing failures are deterministic; a retry cannot help.
                EngineError::KeyNotFound { .. } => SendFailure::Fatal {
                    message: e.to_string(),
                },
                other => SendFailure::Fatal {
                    message: other.to_string(),
                },
            })?;

        let attempt = NewAttempt {
            eth_transaction_id: etx.id,
            gas_price,
            signed_raw_tx: signed.raw.clone(),
            hash: signed.hash,
        };

        let rpc_error = match chain.send_raw_transaction(signed.raw).await {
            Ok(_) => {
                return Ok(SendOutcome {
                    attempt,
                    kind: SendOutcomeKind::Broadcast,
                });
            }
            Err(rpc_error) => rpc_error,
        };

        let send_error = SendError::from_rpc_error(&rpc_error);
        match send_error.kind {
            SendErrorKind::Fatal => {
                return Err(SendFailure::Fatal {
                    message: send_error.message,
                });
            }
            SendErrorKind::TerminallyUnderpriced => {
                tracing::error!(
                    eth_transaction_id = etx.id,
                    gas_price,
                    "transaction was underpriced; you should increase the configured default gas price"
                );
                let bumped = bump_gas(gas, gas_price);
                if bumped <= gas_price {
                    // The ceiling is below the node's acceptance floor;
                    // re-signing at the same price would spin on an
                    // identical transaction. Back off to the poll loop.
                    return Err(SendFailure::Transient {
                        message: "terminally underpriced at the configured maximum gas price"
                            .to_string(),
                    });
                }
                gas_price = bumped;
                tracing::info!(
                    eth_transaction_id = etx.id,
                    gas_price,
                    "retrying underpriced transaction at a higher gas price"
                );
            }
            SendErrorKind::AlreadyInMempool => {
                tracing::debug!(eth_transaction_id = etx.id, "transaction already in mempool");
                return Ok(SendOutcome {
                    attempt,
                    kind: SendOutcomeKind::AlreadyInMempool,
                });
            }
            SendErrorKind::NonceAlreadyUsed => {
                return Ok(SendOutcome {
                    attempt,
                    kind: SendOutcomeKind::NonceAlreadyUsed,
                });
            }
            SendErrorKind::Transient => {
                return Err(SendFailure::Transient {
                    message: send_error.message,
                });
            }
        }
    }
}
