mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use alloy::primitives::U256;

use common::{harness, harness_with, test_config};
use xsd_sim::address::{low_address, Address};
use xsd_sim::chain::mock::MockChain;
use xsd_sim::chain::{ChainClient, ContractCall, TxRequest};
use xsd_sim::error::{ActionError, ChainError};
use xsd_sim::nonce::NonceCoordinator;
use xsd_sim::store::{CoordinationStore, MemoryStore, SqliteStore};

fn approve(spender: u64) -> ContractCall {
    ContractCall::Approve {
        spender: low_address(spender),
        amount: U256::from(1u64),
    }
}

fn nonces_of(chain: &MockChain, account: Address) -> Vec<u64> {
    chain
        .submitted()
        .iter()
        .filter(|tx| tx.from == account)
        .map(|tx| tx.nonce)
        .collect()
}

#[test]
fn test_concurrent_acquires_are_gap_free() {
    let h = harness(1);
    let account = h.accounts[0];
    let nonces = h.ctx.nonces();

    let taken: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    (0..10)
                        .map(|_| {
                            let lease = nonces.acquire(account).unwrap();
                            let n = lease.nonce();
                            lease.commit().unwrap();
                            n
                        })
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: BTreeSet<u64> = taken.iter().copied().collect();
    assert_eq!(unique.len(), 80, "no nonce handed out twice");
    assert_eq!(unique, (0..80).collect::<BTreeSet<u64>>(), "no gaps");
}

#[test]
fn test_concurrent_submissions_are_accepted_in_order() {
    let h = harness(1);
    let account = h.accounts[0];
    let token = h.usd_address();
    let gas = h.config.chain.tx_gas;
    let nonces = h.ctx.nonces();

    thread::scope(|s| {
        for t in 0..6u64 {
            s.spawn(move || {
                for i in 0..5u64 {
                    nonces.submit(account, token, gas, approve(t * 100 + i)).unwrap();
                }
            });
        }
    });

    let mut sent = nonces_of(&h.chain, account);
    sent.sort_unstable();
    assert_eq!(sent, (0..30).collect::<Vec<u64>>());
    assert_eq!(h.chain.transaction_count(account).unwrap(), 30);
}

#[test]
fn test_workers_on_separate_sqlite_handles_share_one_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonces.db");
    let path = path.to_str().unwrap().to_string();

    let h = harness(1);
    let account = h.accounts[0];
    let token = h.usd_address();
    let gas = h.config.chain.tx_gas;
    let client: Arc<dyn ChainClient> = h.chain.clone();

    thread::scope(|s| {
        for w in 0..3u64 {
            let client = client.clone();
            let path = path.clone();
            let settings = h.config.store.clone();
            s.spawn(move || {
                let store: Arc<dyn CoordinationStore> = Arc::new(SqliteStore::open(&path).unwrap());
                let coordinator = NonceCoordinator::new(client, store, &settings);
                for i in 0..4u64 {
                    coordinator.submit(account, token, gas, approve(w * 10 + i)).unwrap();
                }
            });
        }
    });

    let mut sent = nonces_of(&h.chain, account);
    sent.sort_unstable();
    assert_eq!(sent, (0..12).collect::<Vec<u64>>());

    let store = SqliteStore::open(&path).unwrap();
    let rec = store.nonce_record(account).unwrap().unwrap();
    assert_eq!(rec.next_nonce, 12);
    assert!(!rec.locked);
}

#[test]
fn test_nonce_conflict_is_retried_with_next_nonce() {
    let store = Arc::new(MemoryStore::new());
    let h = harness_with(test_config(), 1, store.clone());
    let account = h.accounts[0];
    let token = h.usd_address();
    let gas = h.config.chain.tx_gas;

    // Someone outside the coordinator uses nonce 0...
    h.chain
        .send_transaction(&TxRequest {
            from: account,
            to: token,
            nonce: 0,
            gas,
            call: approve(1),
        })
        .unwrap();
    // ...while our record still claims 0 is free at the current block.
    let block = h.chain.block_number().unwrap();
    store.try_lock_nonce(account, 7, 0, 1).unwrap().unwrap();
    assert!(store.write_nonce(account, 7, 0, Some(block)).unwrap());
    assert!(store.unlock_nonce(account, 7, None).unwrap());

    h.ctx.nonces().submit(account, token, gas, approve(2)).unwrap();

    assert_eq!(nonces_of(&h.chain, account), vec![0, 1]);
    let rec = store.nonce_record(account).unwrap().unwrap();
    assert_eq!(rec.next_nonce, 2);
    assert!(!rec.locked);
}

#[test]
fn test_retries_are_bounded() {
    let mut config = test_config();
    config.store.max_nonce_retries = 2;
    let h = harness_with(config, 1, Arc::new(MemoryStore::new()));
    let account = h.accounts[0];
    for _ in 0..3 {
        h.chain.inject_submit_error("nonce too low");
    }

    let err = h
        .ctx
        .nonces()
        .submit(account, h.usd_address(), 21_000, approve(1))
        .unwrap_err();
    match err {
        ActionError::Chain(ref e) => assert!(e.is_nonce_conflict()),
        other => panic!("expected a chain error, got {:?}", other),
    }
    assert!(h.chain.submitted().is_empty());
    assert!(!h.ctx.store().nonce_record(account).unwrap().unwrap().locked);
}

#[test]
fn test_failed_submission_releases_without_consuming() {
    let h = harness(1);
    let account = h.accounts[0];
    h.chain.inject_submit_error("insufficient funds for gas * price + value");

    let err = h
        .ctx
        .nonces()
        .submit(account, h.usd_address(), 21_000, approve(1))
        .unwrap_err();
    assert!(matches!(err, ActionError::Chain(ChainError::Rpc { .. })));
    assert!(err.is_recoverable());

    let rec = h.ctx.store().nonce_record(account).unwrap().unwrap();
    assert_eq!(rec.next_nonce, 0);
    assert!(!rec.locked);

    h.ctx
        .nonces()
        .submit(account, h.usd_address(), 21_000, approve(1))
        .unwrap();
    assert_eq!(nonces_of(&h.chain, account), vec![0]);
}

#[test]
fn test_dropped_lease_does_not_consume() {
    let h = harness(1);
    let account = h.accounts[0];
    let first = h.ctx.nonces().acquire(account).unwrap().nonce();
    let again = h.ctx.nonces().acquire(account).unwrap();
    assert_eq!(again.nonce(), first);
    again.release().unwrap();
    assert!(!h.ctx.store().nonce_record(account).unwrap().unwrap().locked);
}

#[test]
fn test_abandoned_lock_is_taken_over_after_lease() {
    let mut config = test_config();
    config.store.lock_lease_ms = 1_000;
    let h = harness_with(config, 1, Arc::new(MemoryStore::new()));
    let account = h.accounts[0];

    // A holder that died ten seconds ago
    let now = chrono::Utc::now().timestamp_millis();
    h.ctx
        .store()
        .try_lock_nonce(account, 1, now - 10_000, 1_000)
        .unwrap()
        .unwrap();

    let lease = h.ctx.nonces().acquire(account).unwrap();
    assert_eq!(lease.nonce(), 0);
    lease.commit().unwrap();
    assert_eq!(h.ctx.store().nonce_record(account).unwrap().unwrap().next_nonce, 1);
}

#[test]
fn test_expired_holder_cannot_unlock_for_the_next_holder() {
    let mut config = test_config();
    config.store.lock_lease_ms = 20;
    let h = harness_with(config, 1, Arc::new(MemoryStore::new()));
    let account = h.accounts[0];
    let nonces = h.ctx.nonces();

    let slow = nonces.acquire(account).unwrap();
    thread::sleep(Duration::from_millis(30));
    let taker = nonces.acquire(account).unwrap();
    assert_eq!(taker.nonce(), slow.nonce());

    slow.commit().unwrap();
    let rec = h.ctx.store().nonce_record(account).unwrap().unwrap();
    assert!(rec.locked, "the taker still holds the lock");
    let now = chrono::Utc::now().timestamp_millis();
    assert!(h
        .ctx
        .store()
        .try_lock_nonce(account, 3, now, 60_000)
        .unwrap()
        .is_none());

    taker.commit().unwrap();
    let rec = h.ctx.store().nonce_record(account).unwrap().unwrap();
    assert!(!rec.locked);
    assert_eq!(rec.next_nonce, 1);
}

#[test]
fn test_live_lock_blocks_until_released() {
    let h = harness(1);
    let account = h.accounts[0];
    let store = h.ctx.store();
    let now = chrono::Utc::now().timestamp_millis();
    store.try_lock_nonce(account, 99, now, 60_000).unwrap().unwrap();

    let started = Instant::now();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(30));
            assert!(store.unlock_nonce(account, 99, None).unwrap());
        });
        let lease = h.ctx.nonces().acquire(account).unwrap();
        assert_eq!(lease.nonce(), 0);
    });
    assert!(started.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_reverted_transaction_still_consumes_its_nonce() {
    let h = harness(1);
    let account = h.accounts[0];
    h.chain.revert_next("approve", 1);

    let err = h.ctx.transact(account, h.usd_address(), approve(1)).unwrap_err();
    assert!(matches!(err, ActionError::Reverted { .. }));
    assert!(err.is_recoverable());

    let receipt = h.ctx.transact(account, h.usd_address(), approve(1)).unwrap();
    assert!(receipt.status);
    assert_eq!(nonces_of(&h.chain, account), vec![0, 1]);
}

#[test]
fn test_missing_receipt_times_out_recoverably() {
    let h = harness(1);
    let account = h.accounts[0];
    h.chain.set_receipts_visible(false);

    let err = h.ctx.transact(account, h.usd_address(), approve(1)).unwrap_err();
    assert!(matches!(err, ActionError::ReceiptTimeout { .. }));
    assert!(err.is_recoverable());
    assert_eq!(h.ctx.store().nonce_record(account).unwrap().unwrap().next_nonce, 1);
}
