//! # Referral Storage
//!
//! Persistent storage for the node's referral graph. Every wallet address
//! must be beaconed by a referral before it can transact; this crate
//! maintains that invitation forest and the queries built on it.
//!
//! This crate provides:
//! - Referral records with parent pointers and child lists (RocksDB)
//! - Aggregate Network Value accumulators with ancestor propagation
//! - Breadth-first ordering of referral batches from candidate blocks
//! - A write-through cache for the hot validation paths
//! - A multi-indexed mempool for unconfirmed referrals with
//!   descendant-cascade removal and time-based expiry

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod db;
pub mod error;
pub mod mempool;
pub mod referral;
pub mod referral_store;

pub use cache::{CacheStats, ReferralCache};
pub use db::{Column, DatabaseOptions, KeyValueStore, MemoryDatabase, ReferralDatabase};
pub use error::{Error, Result};
pub use mempool::{
    MempoolListener, RefMempoolEntry, ReferralMempool, RemovalReason,
};
pub use referral::{
    is_rewardable, Address, AnvRecord, Referral, ReferralHash, ReferralRef, KEY_ADDRESS_TYPE,
    SCRIPT_ADDRESS_TYPE,
};
pub use referral_store::ReferralStore;
