//! Confirmer integration tests: receipt attachment and gas bumping across
//! successive heads. See `fixtures.rs` for the database requirements.

mod fixtures;

use std::sync::Arc;

use alloy::primitives::B256;
use fixtures::*;
use txengine_core::keystore::KeyStore;
use txengine_executors::{Broadcaster, Confirmer};
use txengine_store::{Store, TxState};

const CHAIN_ID: u64 = 3;

struct Setup {
    store: Store,
    chain: Arc<MockChain>,
    confirmer: Confirmer<MockChain>,
    eth_transaction_id: i64,
}

/// Broadcast one transaction so the confirmer has something to watch.
async fn broadcast_one() -> Setup {
    setup_tracing();
    let store = test_store().await;
    let keystore = Arc::new(KeyStore::new());
    let chain = MockChain::new(CHAIN_ID);
    let config = Arc::new(test_config(CHAIN_ID));

    let (_key, address) = provision_key(&store, &keystore).await;
    let etx = store
        .create_transaction(&new_transaction(address))
        .await
        .unwrap();

    Broadcaster::new(
        store.clone(),
        chain.clone(),
        keystore.clone(),
        config.clone(),
    )
    .run_once()
    .await;

    let confirmer = Confirmer::new(store.clone(), chain.clone(), keystore, config);

    Setup {
        store,
        chain,
        confirmer,
        eth_transaction_id: etx.id,
    }
}

#[tokio::test]
#[ignore = "requires postgres (TXENGINE_TEST_DATABASE_URL), run with --test-threads=1"]
async fn records_broadcast_height_on_the_first_head() {
    let setup = broadcast_one().await;

    setup.confirmer.process_head(&head(100)).await.unwrap();

    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts[0].broadcast_before_block_num, Some(99));

    // Later heads do not move an already recorded height.
    setup.confirmer.process_head(&head(101)).await.unwrap();
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts[0].broadcast_before_block_num, Some(99));
}

#[tokio::test]
#[ignore = "requires postgres (TXENGINE_TEST_DATABASE_URL), run with --test-threads=1"]
async fn bumps_only_after_the_threshold_is_strictly_exceeded() {
    let setup = broadcast_one().await;

    // Height recorded as 99 at head 100; with a threshold of 3 the
    // transaction has sat through exactly threshold + 1 heads at 103,
    // which is not yet past the boundary.
    setup.confirmer.process_head(&head(100)).await.unwrap();
    setup.confirmer.process_head(&head(103)).await.unwrap();
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1, "no bump at the boundary");

    // One head later the attempt is stalled and gets replaced at
    // max(20 gwei * 1.2, 20 gwei + 5 gwei, 20 gwei) = 25 gwei.
    setup.confirmer.process_head(&head(104)).await.unwrap();
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].gas_price, 25 * GWEI);
    assert!(attempts[0].gas_price > attempts[1].gas_price);
    assert_ne!(attempts[0].hash, attempts[1].hash);
}

#[tokio::test]
#[ignore = "requires postgres (TXENGINE_TEST_DATABASE_URL), run with --test-threads=1"]
async fn attaches_the_receipt_and_confirms_the_transaction() {
    let setup = broadcast_one().await;

    setup.confirmer.process_head(&head(100)).await.unwrap();
    setup.confirmer.process_head(&head(104)).await.unwrap();

    // The bumped attempt gets mined in block 105.
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    let bumped = &attempts[0];
    let block_hash = B256::repeat_byte(0xbb);
    setup
        .chain
        .put_receipt(bumped.hash, mined_receipt(bumped.hash, block_hash, 105, 7));

    setup.confirmer.process_head(&head(105)).await.unwrap();

    let etx = setup
        .store
        .find_transaction(setup.eth_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(etx.state(), TxState::Confirmed);

    let receipt = setup
        .store
        .receipt_for_attempt(bumped.id)
        .await
        .unwrap()
        .expect("receipt row exists");
    assert_eq!(receipt.transaction_hash, bumped.hash);
    assert_eq!(receipt.block_hash, block_hash);
    assert_eq!(receipt.block_number, 105);
    assert_eq!(receipt.transaction_index, 7);
    assert!(receipt.receipt.is_object(), "node response stored verbatim");

    // A confirmed transaction is left alone on later heads.
    let sends_before = setup.chain.sent_count();
    setup.confirmer.process_head(&head(120)).await.unwrap();
    assert_eq!(setup.chain.sent_count(), sends_before);
}

#[tokio::test]
#[ignore = "requires postgres (TXENGINE_TEST_DATABASE_URL), run with --test-threads=1"]
async fn replacement_that_lost_to_a_mined_attempt_is_retried_on_later_heads() {
    let setup = broadcast_one().await;

    setup.confirmer.process_head(&head(100)).await.unwrap();

    // The replacement send is rejected because the nonce is already
    // mined, and the replacement's own hash has no receipt: nothing to do
    // on this head.
    setup.chain.enqueue_send_error("nonce too low");
    setup.confirmer.process_head(&head(104)).await.unwrap();

    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1, "losing replacement is not persisted");

    // On a later head the original attempt's receipt surfaces.
    let original = &attempts[0];
    setup.chain.put_receipt(
        original.hash,
        mined_receipt(original.hash, B256::repeat_byte(0xcc), 104, 0),
    );
    setup.confirmer.process_head(&head(105)).await.unwrap();

    let etx = setup
        .store
        .find_transaction(setup.eth_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(etx.state(), TxState::Confirmed);
}

#[tokio::test]
#[ignore = "requires postgres (TXENGINE_TEST_DATABASE_URL), run with --test-threads=1"]
async fn transient_failure_during_bumping_is_retried_on_the_next_head() {
    let setup = broadcast_one().await;

    setup.confirmer.process_head(&head(100)).await.unwrap();

    setup.chain.enqueue_transport_error("connection reset by peer");
    let result = setup.confirmer.process_head(&head(104)).await;
    assert!(result.is_err(), "transient bump failure surfaces to the loop");

    // Nothing was persisted for the failed replacement, and the next head
    // simply tries again.
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);

    setup.confirmer.process_head(&head(105)).await.unwrap();
    let attempts = setup
        .store
        .attempts_for_transaction(setup.eth_transaction_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
}
