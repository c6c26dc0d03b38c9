//! Referral value types
//!
//! A referral (or "beacon") is the on-chain record establishing that a
//! wallet address has been invited into the network. Every address must
//! carry one before it can transact. The types here are shared by the
//! persistent store, the write-through cache, and the referral mempool:
//! - Fixed-width `Address` and `ReferralHash` identifiers
//! - The immutable `Referral` record with its parent linkage
//! - The per-address `AnvRecord` accumulator

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::sync::Arc;

/// Address type for pay-to-key beacons
pub const KEY_ADDRESS_TYPE: u8 = 1;

/// Address type for pay-to-script beacons
pub const SCRIPT_ADDRESS_TYPE: u8 = 2;

/// Whether an address type participates in reward enumeration
///
/// Key and script beacons are rewardable; other types exist on chain but
/// are excluded from the rewardable set.
pub fn is_rewardable(address_type: u8) -> bool {
    address_type == KEY_ADDRESS_TYPE || address_type == SCRIPT_ADDRESS_TYPE
}

/// 20-byte wallet/script address
///
/// Opaque bytes; equality and ordering are bytewise.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address([u8; 20]);

impl Address {
    /// Create an address from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// The all-zero sentinel address
    pub fn null() -> Self {
        Self([0u8; 20])
    }

    /// Whether this is the all-zero sentinel
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Raw bytes of the address
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 32-byte content hash identifying a referral record
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReferralHash([u8; 32]);

impl ReferralHash {
    /// Create a hash from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero sentinel hash (used by genesis roots)
    pub fn null() -> Self {
        Self([0u8; 32])
    }

    /// Whether this is the all-zero sentinel
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Raw bytes of the hash
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ReferralHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// An immutable referral record
///
/// Links the beaconed `address` to its inviter: `previous_referral` is the
/// parent record's `code_hash`, and `parent_address` is the parent's beacon
/// address, stored redundantly so parent lookups stay keyed by address.
/// `version` and `signature` are transaction-level fields carried through
/// opaquely; this subsystem never validates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    /// Record format version
    pub version: u32,
    /// The beacon being created
    pub address: Address,
    /// Kind of address being beaconed (1 = key, 2 = script, ...)
    pub address_type: u8,
    /// 20-byte key id the beacon is bound to
    pub pub_key_id: Address,
    /// This referral's own identifier, used for child linking
    pub code_hash: ReferralHash,
    /// The parent referral's `code_hash` (null for a genesis root)
    pub previous_referral: ReferralHash,
    /// The parent's beacon address
    pub parent_address: Address,
    /// Opaque signature bytes
    pub signature: Vec<u8>,
}

/// Shared handle to an in-memory referral
///
/// The mempool and the batch orderer traffic in shared references; the
/// store owns the persistent copy.
pub type ReferralRef = Arc<Referral>;

impl Referral {
    /// Create a referral, deriving `code_hash` from the identity fields
    ///
    /// The hash covers everything except the signature, so re-signing does
    /// not change a referral's identity.
    pub fn new(
        version: u32,
        address: Address,
        address_type: u8,
        pub_key_id: Address,
        previous_referral: ReferralHash,
        parent_address: Address,
        signature: Vec<u8>,
    ) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(version.to_le_bytes());
        hasher.update([address_type]);
        hasher.update(address.as_bytes());
        hasher.update(pub_key_id.as_bytes());
        hasher.update(previous_referral.as_bytes());
        hasher.update(parent_address.as_bytes());
        let code_hash = ReferralHash::new(hasher.finalize().into());

        Self {
            version,
            address,
            address_type,
            pub_key_id,
            code_hash,
            previous_referral,
            parent_address,
            signature,
        }
    }
}

/// Per-address Aggregate Network Value record
///
/// `amount` sums contributions from all descendants' events. It is signed:
/// debits pass through during batched updates, but a settled record is
/// never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnvRecord {
    /// Kind of the recorded address; never zero for a settled record
    pub address_type: u8,
    /// Key id the amount accrues to; never the null address
    pub pub_key_id: Address,
    /// Accumulated network value
    pub amount: i64,
}
