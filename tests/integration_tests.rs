//! Integration tests for complete referral storage workflows
//!
//! These tests run against the RocksDB backend and verify:
//! - Genesis bootstrap and chain growth
//! - ANV propagation across confirmed ancestor chains
//! - Block batch ordering followed by insertion
//! - Durability across close and reopen
//! - Mempool lifecycle alongside the confirmed set

use referral_storage::{
    Address, DatabaseOptions, MempoolListener, RefMempoolEntry, Referral, ReferralCache,
    ReferralHash, ReferralMempool, ReferralRef, ReferralStore, RemovalReason, KEY_ADDRESS_TYPE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Test helper to open a store in a temporary directory
fn create_test_store() -> (TempDir, Arc<ReferralStore>) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let store = ReferralStore::open(temp_dir.path().join("referrals"), &DatabaseOptions::default())
        .expect("Failed to open test store");
    (temp_dir, Arc::new(store))
}

/// Test helper to build a genesis root beaconing `[seed; 20]`
fn root_referral(seed: u8) -> Referral {
    let address = Address::new([seed; 20]);
    Referral::new(
        1,
        address,
        KEY_ADDRESS_TYPE,
        address,
        ReferralHash::null(),
        Address::null(),
        vec![],
    )
}

/// Test helper to build a child of `parent` beaconing `[seed; 20]`
fn child_referral(seed: u8, parent: &Referral) -> Referral {
    let address = Address::new([seed; 20]);
    Referral::new(
        1,
        address,
        KEY_ADDRESS_TYPE,
        address,
        parent.code_hash,
        parent.address,
        vec![],
    )
}

#[test]
fn test_complete_workflow_genesis_to_rewards() {
    let (_temp_dir, store) = create_test_store();

    // Step 1: genesis bootstrap, then a referral chain
    let genesis = root_referral(1);
    store
        .insert_referral(&genesis, true)
        .expect("Failed to insert genesis referral");

    let r2 = child_referral(2, &genesis);
    let r3 = child_referral(3, &r2);
    store.insert_referral(&r2, false).expect("Failed to insert r2");
    store.insert_referral(&r3, false).expect("Failed to insert r3");

    // Step 2: bidirectional integrity along the chain
    assert_eq!(store.get_children(&genesis.address).unwrap(), vec![r2.address]);
    assert_eq!(store.get_children(&r2.address).unwrap(), vec![r3.address]);
    assert_eq!(store.get_referrer(&r3.address).unwrap(), Some(r2.address));
    assert_eq!(store.get_referrer(&r2.address).unwrap(), Some(genesis.address));
    assert_eq!(store.get_referrer(&genesis.address).unwrap(), None);

    // Step 3: ANV accrues up the whole chain, then a partial debit
    store
        .update_anv(KEY_ADDRESS_TYPE, &r3.address, 100)
        .expect("Failed to credit ANV");
    store
        .update_anv(KEY_ADDRESS_TYPE, &r3.address, -40)
        .expect("Failed to debit ANV");

    for address in [&genesis.address, &r2.address, &r3.address] {
        let anv = store.get_anv(address).unwrap().expect("ANV record missing");
        assert_eq!(anv.amount, 60);
    }

    // Step 4: the rewardable enumeration sees the whole chain
    let rewardable = store.get_all_rewardable_anvs().unwrap();
    assert_eq!(rewardable.len(), 3);
    assert!(!store.is_corrupt());
}

#[test]
fn test_order_then_insert_block_batch() {
    let (_temp_dir, store) = create_test_store();

    let genesis = root_referral(1);
    store.insert_referral(&genesis, true).unwrap();

    let r2 = Arc::new(child_referral(2, &genesis));
    let r3 = Arc::new(child_referral(3, &r2));
    let r4 = Arc::new(child_referral(4, &r3));

    // The candidate block carries the chain in reverse.
    let mut batch: Vec<ReferralRef> = vec![r4.clone(), r3.clone(), r2.clone()];
    store
        .order_referrals(&mut batch)
        .expect("Failed to order batch");
    assert_eq!(batch, vec![r2, r3, r4]);

    // The ordered batch inserts cleanly parent-first.
    for referral in &batch {
        store.insert_referral(referral, false).unwrap();
    }
    assert_eq!(
        store.get_referrer(&Address::new([4u8; 20])).unwrap(),
        Some(Address::new([3u8; 20]))
    );
}

#[test]
fn test_orphan_batch_is_rejected() {
    let (_temp_dir, store) = create_test_store();

    let never_confirmed = root_referral(1);
    let orphan = Arc::new(child_referral(2, &never_confirmed));

    let mut batch: Vec<ReferralRef> = vec![orphan];
    assert!(store.order_referrals(&mut batch).is_err());
}

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("referrals");

    let genesis = root_referral(1);
    let r2 = child_referral(2, &genesis);

    {
        let store = ReferralStore::open(&path, &DatabaseOptions::default()).unwrap();
        store.insert_referral(&genesis, true).unwrap();
        store.insert_referral(&r2, false).unwrap();
        store.update_anv(KEY_ADDRESS_TYPE, &r2.address, 75).unwrap();
    }

    let store = ReferralStore::open(&path, &DatabaseOptions::default()).unwrap();
    assert_eq!(store.get_referral(&r2.address).unwrap(), Some(r2.clone()));
    assert_eq!(store.get_referrer(&r2.address).unwrap(), Some(genesis.address));
    assert_eq!(store.get_anv(&genesis.address).unwrap().unwrap().amount, 75);
}

#[test]
fn test_wipe_on_open_discards_data() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("referrals");

    let genesis = root_referral(1);
    {
        let store = ReferralStore::open(&path, &DatabaseOptions::default()).unwrap();
        store.insert_referral(&genesis, true).unwrap();
    }

    let options = DatabaseOptions {
        wipe: true,
        ..DatabaseOptions::default()
    };
    let store = ReferralStore::open(&path, &options).unwrap();
    assert_eq!(store.get_referral(&genesis.address).unwrap(), None);
}

#[test]
fn test_cache_and_store_agree() {
    let (_temp_dir, store) = create_test_store();
    let cache = ReferralCache::new(store.clone());

    let genesis = root_referral(1);
    store.insert_referral(&genesis, true).unwrap();

    let r2 = child_referral(2, &genesis);
    store.insert_referral(&r2, false).unwrap();

    assert_eq!(cache.get_referral(&r2.address).unwrap(), Some(r2.clone()));
    assert!(cache.wallet_id_exists(&r2.address).unwrap());
    assert_eq!(cache.get_referrer(&r2.address).unwrap(), Some(genesis.address));

    // A referral buffered in the cache reaches the store on flush.
    let r3 = child_referral(3, &r2);
    cache.insert_referral_into_cache(r3.clone());
    cache.flush().unwrap();
    assert_eq!(store.get_referral(&r3.address).unwrap(), Some(r3));
}

/// Counts mempool removal notifications by reason
#[derive(Default)]
struct RemovalCounter {
    expired: AtomicUsize,
    confirmed: AtomicUsize,
}

impl MempoolListener for RemovalCounter {
    fn entry_removed(&self, _referral: &ReferralRef, reason: RemovalReason) {
        match reason {
            RemovalReason::Expiry => self.expired.fetch_add(1, Ordering::SeqCst),
            RemovalReason::Block => self.confirmed.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }
}

#[test]
fn test_mempool_lifecycle_against_confirmed_set() {
    let (_temp_dir, store) = create_test_store();
    let cache = ReferralCache::new(store.clone());
    let pool = ReferralMempool::new();
    let counter = Arc::new(RemovalCounter::default());
    pool.add_listener(counter.clone());

    let genesis = root_referral(1);
    store.insert_referral(&genesis, true).unwrap();

    // A pending chain hanging off the confirmed genesis
    let pending_a: ReferralRef = Arc::new(child_referral(2, &genesis));
    let pending_b: ReferralRef = Arc::new(child_referral(3, &pending_a));
    pool.add_unchecked(
        pending_a.code_hash,
        RefMempoolEntry::new(pending_a.clone(), 100, 10),
    );
    pool.add_unchecked(
        pending_b.code_hash,
        RefMempoolEntry::new(pending_b.clone(), 150, 10),
    );
    assert_eq!(pool.len(), 2);

    // Transaction outputs: one confirmed address, one pending beacon
    let outputs = vec![genesis.address, pending_a.address];
    // Genesis roots carry no parent pointer, so wallet_id_exists is false
    // for them and the genesis output is not filtered out; it simply has
    // no pooled referral. Only the pending beacon is returned.
    let needed = pool
        .get_referrals_for_transaction(&outputs, &cache)
        .unwrap();
    assert_eq!(needed, vec![pending_a.clone()]);

    // The block confirms pending_a: single-entry removal, no cascade.
    store.insert_referral(&pending_a, false).unwrap();
    pool.remove_for_block(&[pending_a.clone()]);
    assert_eq!(pool.len(), 1);
    assert_eq!(counter.confirmed.load(Ordering::SeqCst), 1);

    // The straggler expires later.
    assert_eq!(pool.expire(1_000), 1);
    assert!(pool.is_empty());
    assert_eq!(counter.expired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_forest_walks_terminate() {
    let (_temp_dir, store) = create_test_store();

    // A small two-branch tree under one root
    let root = root_referral(1);
    store.insert_referral(&root, true).unwrap();
    let mut confirmed = vec![root.clone()];

    let left = child_referral(2, &root);
    let right = child_referral(3, &root);
    let leaf = child_referral(4, &left);
    for referral in [&left, &right, &leaf] {
        store.insert_referral(referral, false).unwrap();
        confirmed.push((*referral).clone());
    }

    // Following referrer pointers from any node reaches a root within
    // the confirmed count, and every hop is bidirectionally linked.
    for referral in &confirmed {
        let mut current = referral.address;
        let mut steps = 0;
        while let Some(parent) = store.get_referrer(&current).unwrap() {
            assert!(
                store.get_children(&parent).unwrap().contains(&current),
                "child {} missing from parent {} listing",
                current,
                parent
            );
            current = parent;
            steps += 1;
            assert!(steps <= confirmed.len(), "referrer walk did not terminate");
        }
        assert_eq!(current, root.address);
    }
}
