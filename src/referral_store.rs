//! Persistent referral graph storage
//!
//! Production implementation of the confirmed referral set:
//! - Referral records keyed by beacon address
//! - Child-address -> parent-address pointers for O(1) ancestor walks
//! - Ordered child lists for downward traversal
//! - Per-address ANV accumulators with signed delta propagation
//! - Breadth-first ordering of referral batches from candidate blocks
//!
//! The parent relation over confirmed referrals must form a forest. A
//! violation observed at runtime (missing parent, missing ANV, ancestry
//! cycle) marks the store corrupt; higher layers poll [`ReferralStore::is_corrupt`]
//! and trigger a reindex.

use crate::db::{Column, DatabaseOptions, KeyValueStore, MemoryDatabase, ReferralDatabase};
use crate::error::{Error, Result};
use crate::referral::{is_rewardable, Address, AnvRecord, Referral, ReferralHash, ReferralRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cycle guard for ancestor walks; reaching it means the parent relation
/// on disk is no longer a forest.
const MAX_ANV_LEVELS: usize = usize::MAX;

/// Persistent referral store
///
/// Provides the confirmed-referral queries consumed by the validator and
/// wallet:
/// - Record, parent, and child lookups
/// - Insertion and removal with bidirectional link maintenance
/// - ANV reads, enumeration, and ancestor-chain updates
/// - Topological ordering of block batches
pub struct ReferralStore {
    db: Arc<dyn KeyValueStore>,
    corrupt: AtomicBool,
}

impl ReferralStore {
    /// Create a store over an existing backend
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        info!("Initializing ReferralStore");
        Self {
            db,
            corrupt: AtomicBool::new(false),
        }
    }

    /// Open a store at the given path
    ///
    /// With `options.in_memory` set, the path is ignored and nothing
    /// touches disk.
    pub fn open<P: AsRef<Path>>(path: P, options: &DatabaseOptions) -> Result<Self> {
        let db: Arc<dyn KeyValueStore> = if options.in_memory {
            info!("Initializing ReferralStore with in-memory backend");
            Arc::new(MemoryDatabase::new())
        } else {
            Arc::new(ReferralDatabase::open(path, options)?)
        };
        Ok(Self::new(db))
    }

    /// Whether an invariant violation has been observed
    ///
    /// Once set, the on-disk state should be treated as unreliable until
    /// reindexed.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::SeqCst)
    }

    /// Get the referral beaconing an address
    pub fn get_referral(&self, address: &Address) -> Result<Option<Referral>> {
        self.read(Column::Referrals, address.as_bytes())
    }

    /// Get the parent address of a confirmed non-root referral
    pub fn get_referrer(&self, address: &Address) -> Result<Option<Address>> {
        self.read(Column::Parents, address.as_bytes())
    }

    /// Get the children of an address, in insertion order
    ///
    /// Empty if the address has no recorded children.
    pub fn get_children(&self, address: &Address) -> Result<Vec<Address>> {
        Ok(self
            .read(Column::Children, address.as_bytes())?
            .unwrap_or_default())
    }

    /// Whether an address has a confirmed referral record
    pub fn referral_address_exists(&self, address: &Address) -> Result<bool> {
        self.db.exists(Column::Referrals, address.as_bytes())
    }

    /// Whether an address has a confirmed parent pointer
    ///
    /// Roots inserted with `allow_no_parent` carry no parent pointer and
    /// return false here; genesis addresses need special handling
    /// downstream.
    pub fn wallet_id_exists(&self, address: &Address) -> Result<bool> {
        self.db.exists(Column::Parents, address.as_bytes())
    }

    /// Insert a confirmed referral
    ///
    /// Writes the record, a zero ANV for its key id, and the parent/child
    /// linkage. The parent must already be in the store; `allow_no_parent`
    /// skips that requirement for the genesis bootstrap only.
    ///
    /// # Errors
    /// `Error::MissingParent` (and the corruption latch) if the parent is
    /// absent and `allow_no_parent` is false. Storage failures abort
    /// mid-sequence; earlier writes are not rolled back.
    pub fn insert_referral(&self, referral: &Referral, allow_no_parent: bool) -> Result<()> {
        debug!(
            "Inserting referral {} code {} parent {}",
            referral.address, referral.code_hash, referral.previous_referral
        );

        self.write(Column::Referrals, referral.address.as_bytes(), referral)?;

        let anv = AnvRecord {
            address_type: referral.address_type,
            pub_key_id: referral.pub_key_id,
            amount: 0,
        };
        self.write(Column::Anvs, referral.pub_key_id.as_bytes(), &anv)?;

        // Referrals arrive parent-first, so the parent record is normally
        // resolvable already and the bidirectional linkage can be written.
        match self.get_referral(&referral.parent_address)? {
            Some(parent) => {
                debug!(
                    "Linking referral {} to parent {}",
                    referral.address, parent.address
                );

                self.write(Column::Parents, referral.address.as_bytes(), &parent.address)?;

                let mut children = self.get_children(&parent.address)?;
                children.push(referral.address);
                self.write(Column::Children, parent.address.as_bytes(), &children)?;
            }
            None if allow_no_parent => {
                warn!(
                    "Parent missing for referral code {}",
                    referral.previous_referral
                );
            }
            None => {
                return Err(self.flag_corruption(Error::MissingParent(
                    referral.parent_address.to_string(),
                )));
            }
        }

        Ok(())
    }

    /// Remove a confirmed referral
    ///
    /// Children must be removed before their parent; the parent's record
    /// has to still be present for its child list to be rewritten.
    /// Accrued ANV along the ancestor chain is not rolled back here.
    pub fn remove_referral(&self, referral: &Referral) -> Result<()> {
        debug!("Removing referral {}", referral.address);

        self.db.delete(Column::Referrals, referral.address.as_bytes())?;

        let parent_address = self
            .get_referral(&referral.parent_address)?
            .map(|parent| parent.address);

        self.db.delete(Column::Parents, referral.address.as_bytes())?;

        if let Some(parent_address) = parent_address {
            let mut children = self.get_children(&parent_address)?;
            children.retain(|child| child != &referral.address);
            self.write(Column::Children, parent_address.as_bytes(), &children)?;
        }

        Ok(())
    }

    /// Get the ANV record for an address
    pub fn get_anv(&self, address: &Address) -> Result<Option<AnvRecord>> {
        self.read(Column::Anvs, address.as_bytes())
    }

    /// All ANV records in the store
    pub fn get_all_anvs(&self) -> Result<Vec<AnvRecord>> {
        let mut anvs = Vec::new();
        for (key, value) in self.db.iter_column(Column::Anvs)? {
            match bincode::deserialize::<AnvRecord>(&value) {
                Ok(anv) => anvs.push(anv),
                Err(e) => {
                    debug!("Skipping undecodable ANV record {}: {}", hex::encode(key), e);
                }
            }
        }
        Ok(anvs)
    }

    /// ANV records whose address type participates in rewards
    pub fn get_all_rewardable_anvs(&self) -> Result<Vec<AnvRecord>> {
        let mut anvs = self.get_all_anvs()?;
        anvs.retain(|anv| is_rewardable(anv.address_type));
        Ok(anvs)
    }

    /// Apply a signed ANV delta to an address and all its ancestors
    ///
    /// The full `delta` lands at every level of the chain, no decay.
    /// Negative deltas are debits; a record going negative, a malformed
    /// record, or a cycle in the ancestry marks the store corrupt, while
    /// a missing record is a plain failure. A failure mid-walk leaves
    /// earlier levels updated; callers run this inside a higher-level
    /// atomic context.
    pub fn update_anv(&self, address_type: u8, start_address: &Address, delta: i64) -> Result<()> {
        debug!(
            "Updating ANV type {} start {} delta {}",
            address_type, start_address, delta
        );

        let mut address = Some(*start_address);
        let mut level: usize = 0;

        while let Some(current) = address {
            if level >= MAX_ANV_LEVELS {
                return Err(self.flag_corruption(Error::Corruption(
                    "referral ancestry cycle detected".to_string(),
                )));
            }

            let mut anv: AnvRecord = match self.read(Column::Anvs, current.as_bytes())? {
                Some(anv) => anv,
                None => {
                    debug!("Failed to read ANV for {}", current);
                    return Err(Error::NotFound(format!("ANV record for {}", current)));
                }
            };

            if anv.address_type == 0 || anv.pub_key_id.is_null() {
                return Err(self.flag_corruption(Error::Corruption(format!(
                    "malformed ANV record for {}",
                    current
                ))));
            }

            debug!("  level {} address {} {} + {}", level, current, anv.amount, delta);

            anv.amount += delta;
            if anv.amount < 0 {
                return Err(self.flag_corruption(Error::Corruption(format!(
                    "ANV for {} debited below zero",
                    current
                ))));
            }

            self.write(Column::Anvs, current.as_bytes(), &anv)?;

            address = self.get_referrer(&current)?;
            level += 1;
        }

        Ok(())
    }

    /// Reorder a block batch so every referral follows its parent
    ///
    /// Partitions the batch into roots (parent already confirmed) and
    /// interior referrals (parent expected within the batch), then walks
    /// the induced forest breadth-first, rewriting `refs` in place.
    /// Relative order is preserved within each partition, so sibling ties
    /// keep their original order.
    ///
    /// # Errors
    /// `Error::InvalidData` if the batch has no roots, or if any referral
    /// is left unplaced after the walk (its claimed parent is neither
    /// confirmed nor in the batch). On failure `refs` may be partially
    /// permuted and must be discarded.
    pub fn order_referrals(&self, refs: &mut Vec<ReferralRef>) -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }

        let mut roots: Vec<ReferralRef> = Vec::new();
        let mut interior: Vec<ReferralRef> = Vec::new();
        for referral in refs.iter() {
            if self.get_referral(&referral.parent_address)?.is_some() {
                roots.push(referral.clone());
            } else {
                interior.push(referral.clone());
            }
        }

        // No anchor into the confirmed set means an invalid block.
        if roots.is_empty() {
            debug!("Referral batch of {} has no anchored roots", refs.len());
            return Err(Error::InvalidData(
                "referral batch has no anchored roots".to_string(),
            ));
        }

        let mut graph: HashMap<ReferralHash, Vec<ReferralRef>> = HashMap::new();
        for root in &roots {
            graph.entry(root.code_hash).or_default();
        }
        for referral in &interior {
            graph
                .entry(referral.previous_referral)
                .or_default()
                .push(referral.clone());
        }

        let mut to_process: VecDeque<ReferralRef> = roots.into_iter().collect();
        let mut slot = 0;

        while let Some(next) = to_process.pop_front() {
            if let Some(children) = graph.get(&next.code_hash) {
                to_process.extend(children.iter().cloned());
            }
            refs[slot] = next;
            slot += 1;
            if slot == refs.len() {
                break;
            }
        }

        // Leftover slots mean disconnected referrals; a non-empty queue
        // means more refs were reachable than the batch holds.
        if slot != refs.len() || !to_process.is_empty() {
            debug!(
                "Referral batch failed ordering: {} of {} placed, {} queued",
                slot,
                refs.len(),
                to_process.len()
            );
            return Err(Error::InvalidData(
                "referral batch contains unresolvable dependencies".to_string(),
            ));
        }

        Ok(())
    }

    fn read<V: DeserializeOwned>(&self, column: Column, key: &[u8]) -> Result<Option<V>> {
        match self.db.get(column, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<V: Serialize>(&self, column: Column, key: &[u8], value: &V) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.db.put(column, key, &bytes)
    }

    fn flag_corruption(&self, err: Error) -> Error {
        self.corrupt.store(true, Ordering::SeqCst);
        error!("Referral database marked corrupt: {}", err);
        err
    }
}
