use std::sync::Arc;

use tokio::sync::mpsc;
use txengine_core::chain::{Chain, Head};
use txengine_core::config::EngineConfig;
use txengine_core::keystore::KeyStore;
use txengine_store::Store;

use crate::broadcaster::{Broadcaster, BroadcasterHandle};
use crate::confirmer::{Confirmer, ConfirmerHandle};

/// Wires the engine's collaborators together and owns their lifecycles.
/// All collaborators are held explicitly; there is no process-wide
/// registry.
pub struct Engine<C: Chain> {
    pub store: Store,
    pub chain: Arc<C>,
    pub keystore: Arc<KeyStore>,
    pub config: Arc<EngineConfig>,
}

pub struct EngineHandle {
    broadcaster: Option<BroadcasterHandle>,
    confirmer: ConfirmerHandle,
}

impl EngineHandle {
    /// Nudge the broadcaster into a round now, if it is running.
    pub fn wake_broadcaster(&self) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.wake();
        }
    }

    /// Signal both loops and wait for them to exit.
    pub async fn shutdown(self) {
        if let Some(broadcaster) = self.broadcaster {
            broadcaster.shutdown().await;
        }
        self.confirmer.shutdown().await;
    }
}

impl<C: Chain + 'static> Engine<C> {
    /// Start the broadcaster (unless disabled by configuration) and the
    /// confirmer, feeding the confirmer from `heads`.
    pub fn start(self, heads: mpsc::Receiver<Head>) -> EngineHandle {
        let broadcaster = if self.config.enable_tx_engine {
            Some(
                Broadcaster::new(
                    self.store.clone(),
                    self.chain.clone(),
                    self.keystore.clone(),
                    self.config.clone(),
                )
                .spawn(),
            )
        } else {
            tracing::info!("transaction engine disabled by configuration, broadcaster will not start");
            None
        };

        let confirmer = Confirmer::new(self.store, self.chain, self.keystore, self.config).spawn(heads);

        EngineHandle {
            broadcaster,
            confirmer,
        }
    }
}
