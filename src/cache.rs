//! Write-through cache over the referral store
//!
//! Short-lived in-memory view used on the hot validation paths: referral
//! lookups by address and wallet -> referrer resolution. Reads populate
//! the cache on miss; inserts buffer in the cache until [`ReferralCache::flush`]
//! transfers them to the store.

use crate::error::Result;
use crate::referral::{Address, Referral};
use crate::referral_store::ReferralStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Cache hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    referrals: HashMap<Address, Referral>,
    wallet_to_referrer: HashMap<Address, Address>,
    stats: CacheStats,
}

/// Write-through referral cache
///
/// Both maps are guarded by a single mutex. Read paths release it before
/// calling into the store and reacquire it to populate; a racing reader
/// may populate the same entry twice with equal values, which is
/// harmless.
pub struct ReferralCache {
    store: Arc<ReferralStore>,
    inner: Mutex<CacheInner>,
}

impl ReferralCache {
    /// Create a cache fronting the given store
    pub fn new(store: Arc<ReferralStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Get a referral, populating the cache from the store on miss
    pub fn get_referral(&self, address: &Address) -> Result<Option<Referral>> {
        {
            let mut inner = self.inner.lock();
            if let Some(referral) = inner.referrals.get(address).cloned() {
                inner.stats.hits += 1;
                return Ok(Some(referral));
            }
            inner.stats.misses += 1;
        }

        if let Some(referral) = self.store.get_referral(address)? {
            self.insert_referral_into_cache(referral.clone());
            return Ok(Some(referral));
        }
        Ok(None)
    }

    /// Buffer a referral in the cache
    pub fn insert_referral_into_cache(&self, referral: Referral) {
        let mut inner = self.inner.lock();
        inner.referrals.insert(referral.address, referral);
    }

    /// Whether an address is beaconed, consulting the store on miss
    pub fn referral_address_exists(&self, address: &Address) -> Result<bool> {
        {
            let inner = self.inner.lock();
            if inner.referrals.contains_key(address) {
                return Ok(true);
            }
        }

        if let Some(referral) = self.store.get_referral(address)? {
            self.insert_referral_into_cache(referral);
            return Ok(true);
        }
        Ok(false)
    }

    /// Get an address's referrer, populating the cache on miss
    pub fn get_referrer(&self, address: &Address) -> Result<Option<Address>> {
        {
            let mut inner = self.inner.lock();
            if let Some(parent) = inner.wallet_to_referrer.get(address).copied() {
                inner.stats.hits += 1;
                return Ok(Some(parent));
            }
            inner.stats.misses += 1;
        }

        if let Some(parent) = self.store.get_referrer(address)? {
            self.insert_wallet_relationship_into_cache(*address, parent);
            return Ok(Some(parent));
        }
        Ok(None)
    }

    /// Buffer a wallet -> referrer relationship in the cache
    pub fn insert_wallet_relationship_into_cache(&self, child: Address, parent: Address) {
        let mut inner = self.inner.lock();
        inner.wallet_to_referrer.insert(child, parent);
    }

    /// Whether an address has a confirmed referrer
    ///
    /// Like [`ReferralStore::wallet_id_exists`], genesis roots return
    /// false: they carry no parent pointer.
    pub fn wallet_id_exists(&self, address: &Address) -> Result<bool> {
        {
            let inner = self.inner.lock();
            if inner.wallet_to_referrer.contains_key(address) {
                return Ok(true);
            }
        }

        if let Some(parent) = self.store.get_referrer(address)? {
            self.insert_wallet_relationship_into_cache(*address, parent);
            return Ok(true);
        }
        Ok(false)
    }

    /// Transfer buffered referrals to the store and clear the buffer
    ///
    /// Iteration order is unspecified, so parent-before-child ordering is
    /// not enforced here: a buffered child whose parent is also still
    /// buffered may reach the store first and fail. Callers must only
    /// buffer referrals whose parents are already persisted.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        debug!("Flushing {} cached referrals", inner.referrals.len());

        for referral in inner.referrals.values() {
            self.store.insert_referral(referral, false)?;
        }
        inner.referrals.clear();
        Ok(())
    }

    /// Evict a referral from the cache and remove it from the store
    pub fn remove_referral(&self, referral: &Referral) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.referrals.remove(&referral.address);
        }
        self.store.remove_referral(referral)
    }

    /// Snapshot of the hit/miss counters
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}
