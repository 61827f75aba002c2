//! Account and delegate records.

use crate::{
    AccountId, Address, BlockNumber, PublicKey, SecretHash, ShareAmount, SlateId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered account.
///
/// The active key history is ordered by activation time; the most recent
/// entry signs for the account. Delegates additionally carry production
/// statistics and a pay balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Compact identifier assigned at registration.
    pub id: AccountId,
    /// Globally unique name.
    pub name: String,
    /// The key that owns the account.
    pub owner_key: PublicKey,
    /// Active key history, keyed by activation time.
    pub active_keys: BTreeMap<Timestamp, PublicKey>,
    /// When the account was registered.
    pub registration_date: Timestamp,
    /// When the account was last modified.
    pub last_update: Timestamp,
    /// Present iff the account is a delegate.
    pub delegate_info: Option<DelegateStats>,
}

impl AccountRecord {
    /// The currently active signing key.
    pub fn active_key(&self) -> PublicKey {
        self.active_keys.values().next_back().copied().unwrap_or(self.owner_key)
    }

    /// The address of the currently active key.
    pub fn active_address(&self) -> Address {
        self.active_key().address()
    }

    /// The address of the owner key, the account's stable address.
    pub fn owner_address(&self) -> Address {
        self.owner_key.address()
    }

    /// Sets the active key as of `time`.
    pub fn set_active_key(&mut self, time: Timestamp, key: PublicKey) {
        self.active_keys.insert(time, key);
    }

    /// `true` iff the account is a delegate.
    pub fn is_delegate(&self) -> bool {
        self.delegate_info.is_some()
    }

    /// The delegate's current net votes; zero for non-delegates.
    pub fn net_votes(&self) -> ShareAmount {
        self.delegate_info.as_ref().map(|info| info.votes_for).unwrap_or(0)
    }
}

/// Production statistics and pay state of a delegate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateStats {
    /// Percentage (0..=100) of the available pay the delegate accepts.
    pub pay_rate: u8,
    /// Total blocks this delegate has produced.
    pub blocks_produced: u32,
    /// Total scheduled slots this delegate has missed.
    pub blocks_missed: u32,
    /// The highest block number this delegate produced.
    pub last_block_num_produced: BlockNumber,
    /// Commitment to the secret the delegate will reveal with its next block.
    pub next_secret_hash: Option<SecretHash>,
    /// Unwithdrawn pay, in base-asset units.
    pub pay_balance: ShareAmount,
    /// Total pay ever credited, in base-asset units.
    pub total_paid: ShareAmount,
    /// Net votes currently cast for this delegate.
    pub votes_for: ShareAmount,
}

impl DelegateStats {
    /// Fresh statistics for a delegate accepting `pay_rate` percent.
    pub fn with_pay_rate(pay_rate: u8) -> Self {
        Self { pay_rate, ..Default::default() }
    }
}

/// An entry of the in-memory delegate vote index: ordered by descending
/// votes, then ascending account id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoteIndexEntry {
    /// Negated net votes, so the natural ascending order is by descending
    /// votes.
    pub negated_votes: i128,
    /// The delegate account.
    pub delegate_id: AccountId,
}

impl VoteIndexEntry {
    /// Index entry for a delegate with `votes` net votes.
    pub fn new(votes: ShareAmount, delegate_id: AccountId) -> Self {
        Self { negated_votes: -(votes as i128), delegate_id }
    }
}

/// A delegate vote slate referenced by balances.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlateEntry {
    /// The delegates this slate supports.
    pub supported_delegates: Vec<AccountId>,
}

/// Derives a slate id from the supported delegate list.
pub fn slate_id(supported_delegates: &[AccountId]) -> SlateId {
    let packed = crate::packing::pack(&supported_delegates);
    let digest = crate::crypto::ripemd160_sha512(&packed);
    u64::from_le_bytes(digest.0[..8].try_into().expect("digest is at least 8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_secret(&SecretKey::from_slice(&[fill; 32]).unwrap())
    }

    fn account(id: AccountId) -> AccountRecord {
        AccountRecord {
            id,
            name: format!("account{id}"),
            owner_key: key(1),
            active_keys: BTreeMap::new(),
            registration_date: Timestamp(0),
            last_update: Timestamp(0),
            delegate_info: None,
        }
    }

    #[test]
    fn active_key_falls_back_to_owner() {
        let mut record = account(1);
        assert_eq!(record.active_key(), key(1));

        record.set_active_key(Timestamp(10), key(2));
        record.set_active_key(Timestamp(20), key(3));
        assert_eq!(record.active_key(), key(3));
    }

    #[test]
    fn vote_index_orders_by_descending_votes() {
        let a = VoteIndexEntry::new(100, 2);
        let b = VoteIndexEntry::new(50, 1);
        let c = VoteIndexEntry::new(100, 3);
        let mut entries = [b, c, a];
        entries.sort();
        assert_eq!(entries, [a, c, b]);
    }
}
