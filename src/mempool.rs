//! Unconfirmed referral pool
//!
//! In-memory multi-indexed set of referrals waiting for a block:
//! - Primary index by referral hash
//! - Secondary index by entry time, for expiry scans
//! - Parent -> children links, for descendant-cascade removal
//!
//! All indexes sit behind a single mutex. Child links are one-directional
//! and keyed by referral hash; a removed entry may linger in its parent's
//! link set until the parent itself is removed, and lookups resolve the
//! hash to a live entry at use time.

use crate::cache::ReferralCache;
use crate::error::Result;
use crate::referral::{Address, Referral, ReferralHash, ReferralRef};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// Scale factor between referral weight and virtual size
const WEIGHT_SCALE_FACTOR: u64 = 4;

/// Why an entry left the mempool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Entry outlived its time in the pool
    Expiry,
    /// Entry was confirmed in a block
    Block,
    /// Entry was removed during a chain reorganization
    Reorg,
    /// Entry conflicted with an accepted referral
    Conflict,
    /// Entry was replaced by another referral
    Replaced,
    /// No specific reason recorded
    Unknown,
}

/// Observer for mempool entry lifecycle events
///
/// Default methods are no-ops so implementations can subscribe to a
/// single event.
pub trait MempoolListener: Send + Sync {
    /// A referral entered the pool
    fn entry_added(&self, _referral: &ReferralRef) {}

    /// A referral left the pool
    fn entry_removed(&self, _referral: &ReferralRef, _reason: RemovalReason) {}
}

/// A pending referral with its pool bookkeeping
#[derive(Debug, Clone)]
pub struct RefMempoolEntry {
    /// The pending referral
    pub referral: ReferralRef,
    /// Unix time the entry was accepted
    pub time: i64,
    /// Chain height at acceptance
    pub entry_height: u32,
    /// Referral weight used for size accounting
    pub weight: u64,
    /// Approximate heap usage of the entry
    pub usage_size: usize,
}

impl RefMempoolEntry {
    /// Create an entry, deriving weight and usage from the referral
    pub fn new(referral: ReferralRef, time: i64, entry_height: u32) -> Self {
        let weight = referral_weight(&referral);
        let usage_size = mem::size_of::<Self>() + referral.signature.len();
        Self {
            referral,
            time,
            entry_height,
            weight,
            usage_size,
        }
    }

    /// Virtual size derived from the weight
    pub fn size(&self) -> usize {
        ((self.weight + WEIGHT_SCALE_FACTOR - 1) / WEIGHT_SCALE_FACTOR) as usize
    }
}

/// Weight of a referral for block accounting
pub fn referral_weight(referral: &Referral) -> u64 {
    // serialized_size only fails on unserializable types, which the
    // referral record is not
    bincode::serialized_size(referral).unwrap_or(0) * WEIGHT_SCALE_FACTOR
}

#[derive(Default)]
struct MempoolInner {
    entries: HashMap<ReferralHash, RefMempoolEntry>,
    by_entry_time: BTreeSet<(i64, ReferralHash)>,
    links: HashMap<ReferralHash, HashSet<ReferralHash>>,
}

impl MempoolInner {
    /// Collect `start` and everything reachable through child links
    fn calculate_descendants(&self, start: ReferralHash, descendants: &mut HashSet<ReferralHash>) {
        let mut stage = Vec::new();
        if !descendants.contains(&start) {
            stage.push(start);
        }

        while let Some(hash) = stage.pop() {
            descendants.insert(hash);
            if let Some(children) = self.links.get(&hash) {
                for child in children {
                    if !descendants.contains(child) {
                        stage.push(*child);
                    }
                }
            }
        }
    }
}

/// Pool of unconfirmed referrals
pub struct ReferralMempool {
    inner: Mutex<MempoolInner>,
    listeners: RwLock<Vec<Arc<dyn MempoolListener>>>,
}

impl Default for ReferralMempool {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferralMempool {
    /// Create an empty mempool
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MempoolInner::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to entry lifecycle events
    pub fn add_listener(&self, listener: Arc<dyn MempoolListener>) {
        self.listeners.write().push(listener);
    }

    /// Add an already-validated referral to the pool
    ///
    /// Links the entry under its in-pool parent if one is present.
    /// Returns false if the hash is already pooled.
    pub fn add_unchecked(&self, hash: ReferralHash, entry: RefMempoolEntry) -> bool {
        self.notify_entry_added(&entry.referral);

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&hash) {
            debug!("Referral {} already in mempool", hash);
            return false;
        }

        // An in-pool entry beaconing the parent address adopts this one.
        let parent_hash = inner
            .entries
            .iter()
            .find(|(_, candidate)| candidate.referral.address == entry.referral.parent_address)
            .map(|(parent_hash, _)| *parent_hash);

        inner.by_entry_time.insert((entry.time, hash));
        inner.entries.insert(hash, entry);
        inner.links.entry(hash).or_default();

        if let Some(parent_hash) = parent_hash {
            inner.links.entry(parent_hash).or_default().insert(hash);
        }

        true
    }

    /// Remove an entry and its in-pool descendants
    pub fn remove_recursive(&self, referral: &Referral, reason: RemovalReason) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&referral.code_hash) {
            return;
        }

        let mut to_remove = HashSet::new();
        inner.calculate_descendants(referral.code_hash, &mut to_remove);
        self.remove_staged(&mut inner, &to_remove, reason);
    }

    /// Remove exactly the referrals confirmed in a block
    ///
    /// No descendant cascade: children of a confirmed referral stay
    /// pending.
    pub fn remove_for_block(&self, refs: &[ReferralRef]) {
        let mut inner = self.inner.lock();
        for referral in refs {
            if inner.entries.contains_key(&referral.code_hash) {
                self.remove_unchecked(&mut inner, referral.code_hash, RemovalReason::Block);
            }
        }
    }

    /// Remove everything that entered the pool before `time`, along with
    /// descendants; returns how many entries were removed
    pub fn expire(&self, time: i64) -> usize {
        let mut inner = self.inner.lock();

        let expired: Vec<ReferralHash> = inner
            .by_entry_time
            .iter()
            .take_while(|(entry_time, _)| *entry_time < time)
            .map(|(_, hash)| *hash)
            .collect();

        let mut stage = HashSet::new();
        for hash in expired {
            inner.calculate_descendants(hash, &mut stage);
        }

        let removed = stage.len();
        self.remove_staged(&mut inner, &stage, RemovalReason::Expiry);

        if removed > 0 {
            debug!("Expired {} referrals from mempool", removed);
        }
        removed
    }

    /// Get a pooled referral by hash
    pub fn get(&self, hash: &ReferralHash) -> Option<ReferralRef> {
        let inner = self.inner.lock();
        inner.entries.get(hash).map(|entry| entry.referral.clone())
    }

    /// Get the pooled referral beaconing an address, if any
    ///
    /// Linear scan; the pool stays small enough that an address index
    /// isn't warranted.
    pub fn get_with_address(&self, address: &Address) -> Option<ReferralRef> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .find(|entry| entry.referral.address == *address)
            .map(|entry| entry.referral.clone())
    }

    /// Whether any pooled referral beacons the address
    pub fn exists_with_address(&self, address: &Address) -> bool {
        self.get_with_address(address).is_some()
    }

    /// Pooled referrals beaconing a transaction's output addresses
    ///
    /// Addresses already beaconed in the confirmed set (per the cache)
    /// are skipped; for the rest, the pooled referral beaconing that
    /// address is collected, if one exists. Script parsing is external:
    /// callers pass the extracted output destinations.
    pub fn get_referrals_for_transaction(
        &self,
        output_addresses: &[Address],
        view: &ReferralCache,
    ) -> Result<Vec<ReferralRef>> {
        let mut unbeaconed = Vec::new();
        for address in output_addresses {
            if !view.wallet_id_exists(address)? {
                unbeaconed.push(*address);
            }
        }

        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut referrals = Vec::new();
        for address in unbeaconed {
            let found = inner
                .entries
                .iter()
                .find(|(_, entry)| entry.referral.address == address);
            if let Some((hash, entry)) = found {
                if seen.insert(*hash) {
                    referrals.push(entry.referral.clone());
                }
            }
        }
        Ok(referrals)
    }

    /// All pooled referrals
    pub fn get_referrals(&self) -> Vec<ReferralRef> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .map(|entry| entry.referral.clone())
            .collect()
    }

    /// Number of pooled referrals
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every entry and link
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_entry_time.clear();
        inner.links.clear();
    }

    /// Approximate heap usage of the pool
    pub fn dynamic_memory_usage(&self) -> usize {
        let inner = self.inner.lock();
        let entry_usage: usize = inner.entries.values().map(|entry| entry.usage_size).sum();
        let link_usage: usize = inner
            .links
            .values()
            .map(|children| mem::size_of::<ReferralHash>() * (children.len() + 1))
            .sum();
        entry_usage + link_usage
    }

    fn remove_staged(
        &self,
        inner: &mut MempoolInner,
        stage: &HashSet<ReferralHash>,
        reason: RemovalReason,
    ) {
        for hash in stage {
            self.remove_unchecked(inner, *hash, reason);
        }
    }

    /// Remove a single entry; stale hashes (already removed through an
    /// earlier cascade) are ignored.
    fn remove_unchecked(&self, inner: &mut MempoolInner, hash: ReferralHash, reason: RemovalReason) {
        if let Some(entry) = inner.entries.remove(&hash) {
            self.notify_entry_removed(&entry.referral, reason);
            inner.by_entry_time.remove(&(entry.time, hash));
            inner.links.remove(&hash);
        }
    }

    fn notify_entry_added(&self, referral: &ReferralRef) {
        for listener in self.listeners.read().iter() {
            listener.entry_added(referral);
        }
    }

    fn notify_entry_removed(&self, referral: &ReferralRef, reason: RemovalReason) {
        for listener in self.listeners.read().iter() {
            listener.entry_removed(referral, reason);
        }
    }
}
