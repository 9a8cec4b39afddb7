use std::collections::HashMap;
use std::sync::RwLock;

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, B256, Bytes},
    signers::local::PrivateKeySigner,
};

use crate::error::EngineError;

/// A signed canonical transaction: the broadcastable bytes plus their
/// hash, exactly as the chain node will see them.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}

/// In-memory map of unlocked signing keys.
///
/// Key material at rest is decrypted by an external key store; this type
/// only holds already-unlocked signers. Unlocking and forgetting take the
/// write lock; signing takes the read lock so concurrent per-key workers
/// do not serialize on each other.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Address, PrivateKeySigner>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `signer` available for signing. Returns its address.
    pub fn unlock(&self, signer: PrivateKeySigner) -> Address {
        let address = signer.address();
        self.keys
            .write()
            .expect("keystore lock poisoned")
            .insert(address, signer);
        address
    }

    /// Drop the unlocked key for `address`, if any.
    pub fn forget(&self, address: &Address) {
        self.keys
            .write()
            .expect("keystore lock poisoned")
            .remove(address);
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys
            .read()
            .expect("keystore lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Sign `tx` with the key for `from`. Deterministic for a given
    /// transaction; the private key never leaves the store.
    pub fn sign_transaction(
        &self,
        from: Address,
        mut tx: TxLegacy,
    ) -> Result<SignedTransaction, EngineError> {
        let keys = self.keys.read().expect("keystore lock poisoned");
        let signer = keys
            .get(&from)
            .ok_or(EngineError::KeyNotFound { address: from })?;

        let signature =
            signer
                .sign_transaction_sync(&mut tx)
                .map_err(|e| EngineError::InternalError {
                    message: format!("failed to sign transaction: {e}"),
                })?;

        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw = TxEnvelope::Legacy(signed).encoded_2718();

        Ok(SignedTransaction {
            hash,
            raw: raw.into(),
        })
    }
}
