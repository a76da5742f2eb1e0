use xsd_sim::address::{low_address, Address};
use xsd_sim::store::{CoordinationStore, MemoryStore, SqliteStore};

const LEASE_MS: i64 = 1_000;
const TOKEN: u64 = 0x5eed;

fn account() -> Address {
    low_address(0xabc)
}

fn check_lock_semantics(store: &dyn CoordinationStore) {
    let a = account();
    assert_eq!(store.nonce_record(a).unwrap(), None);

    let first = store.try_lock_nonce(a, TOKEN, 10_000, LEASE_MS).unwrap();
    let first = first.expect("free lock must be granted");
    assert_eq!(first.next_nonce, 0);
    assert_eq!(first.last_seen_block, None);
    assert_eq!(first.lock_token, TOKEN);

    // Held and within its lease
    assert!(store.try_lock_nonce(a, 1, 10_500, LEASE_MS).unwrap().is_none());

    assert!(store.write_nonce(a, TOKEN, 7, Some(42)).unwrap());
    assert!(store.unlock_nonce(a, TOKEN, Some(9)).unwrap());

    let rec = store.nonce_record(a).unwrap().unwrap();
    assert!(!rec.locked);
    assert_eq!(rec.next_nonce, 9);
    assert_eq!(rec.last_seen_block, Some(42));

    // A consumed nonce never lowers the counter
    store.try_lock_nonce(a, TOKEN, 11_000, LEASE_MS).unwrap().unwrap();
    store.unlock_nonce(a, TOKEN, Some(3)).unwrap();
    assert_eq!(store.nonce_record(a).unwrap().unwrap().next_nonce, 9);

    // Releasing without consuming leaves the counter alone
    store.try_lock_nonce(a, TOKEN, 12_000, LEASE_MS).unwrap().unwrap();
    store.unlock_nonce(a, TOKEN, None).unwrap();
    assert_eq!(store.nonce_record(a).unwrap().unwrap().next_nonce, 9);

    // Nothing to write or release once unlocked
    assert!(!store.write_nonce(a, TOKEN, 1, Some(50)).unwrap());
    assert!(!store.unlock_nonce(a, TOKEN, None).unwrap());
    assert_eq!(store.nonce_record(a).unwrap().unwrap().last_seen_block, Some(42));
}

fn check_lease_takeover(store: &dyn CoordinationStore) {
    let a = account();
    let (stale, fresh) = (1, 2);
    store.try_lock_nonce(a, stale, 0, LEASE_MS).unwrap().unwrap();
    assert!(
        store.try_lock_nonce(a, fresh, LEASE_MS - 1, LEASE_MS).unwrap().is_none(),
        "lease still valid"
    );
    let taken = store.try_lock_nonce(a, fresh, LEASE_MS, LEASE_MS).unwrap();
    let taken = taken.expect("expired lease must be taken over");
    assert_eq!(taken.locked_at_ms, LEASE_MS);
    assert_eq!(taken.lock_token, fresh);

    // The previous holder can neither write nor unlock any more, but the
    // nonce it consumed is still counted
    assert!(!store.write_nonce(a, stale, 0, Some(1)).unwrap());
    assert!(!store.unlock_nonce(a, stale, Some(5)).unwrap());
    let rec = store.nonce_record(a).unwrap().unwrap();
    assert!(rec.locked);
    assert_eq!(rec.lock_token, fresh);
    assert_eq!(rec.next_nonce, 5);
    assert!(
        store.try_lock_nonce(a, 3, LEASE_MS + 1, LEASE_MS).unwrap().is_none(),
        "the new holder keeps the lock"
    );

    assert!(store.unlock_nonce(a, fresh, None).unwrap());
    assert!(!store.nonce_record(a).unwrap().unwrap().locked);
}

fn check_approvals(store: &dyn CoordinationStore) {
    let (token, owner, spender) = (
        low_address(1),
        low_address(2),
        low_address(3),
    );
    assert!(!store.is_approved(token, owner, spender).unwrap());
    store.record_approval(token, owner, spender).unwrap();
    store.record_approval(token, owner, spender).unwrap();
    assert!(store.is_approved(token, owner, spender).unwrap());
    assert!(
        !store.is_approved(token, spender, owner).unwrap(),
        "approvals are directional"
    );
}

#[test]
fn test_memory_store_lock_semantics() {
    check_lock_semantics(&MemoryStore::new());
}

#[test]
fn test_sqlite_store_lock_semantics() {
    check_lock_semantics(&SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_memory_store_lease_takeover() {
    check_lease_takeover(&MemoryStore::new());
}

#[test]
fn test_sqlite_store_lease_takeover() {
    check_lease_takeover(&SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_approval_ledger() {
    check_approvals(&MemoryStore::new());
    check_approvals(&SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_sqlite_store_is_shared_between_handles_and_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coord.db");
    let path = path.to_str().unwrap();

    let a = account();
    {
        let first = SqliteStore::open(path).unwrap();
        let second = SqliteStore::open(path).unwrap();

        first.try_lock_nonce(a, TOKEN, 5_000, LEASE_MS).unwrap().unwrap();
        assert!(
            second.try_lock_nonce(a, 1, 5_001, LEASE_MS).unwrap().is_none(),
            "a lock taken through one handle is visible through another"
        );
        assert!(!second.unlock_nonce(a, 1, None).unwrap());
        assert!(first.unlock_nonce(a, TOKEN, Some(4)).unwrap());
        second.record_approval(a, a, a).unwrap();
    }

    let reopened = SqliteStore::open(path).unwrap();
    let rec = reopened.nonce_record(a).unwrap().unwrap();
    assert_eq!(rec.next_nonce, 4);
    assert!(!rec.locked);
    assert!(reopened.is_approved(a, a, a).unwrap());
}
