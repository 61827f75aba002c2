//! Balance records and their claim conditions.

use crate::{crypto, packing, Address, AssetId, Hash160, ShareAmount, SlateId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a balance, derived from its withdraw condition so that
/// deposits under the same condition accumulate into one record.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BalanceId(pub Hash160);

impl fmt::Display for BalanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for BalanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BalanceId({})", self.0)
    }
}

/// How the funds held under a condition may be claimed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimCondition {
    /// Spendable with the owner's signature.
    Signature {
        /// The owning address.
        owner: Address,
    },
    /// Linearly vesting funds, spendable with the owner's signature up to
    /// the vested fraction.
    Vesting {
        /// The owning address.
        owner: Address,
        /// When vesting begins.
        start_time: Timestamp,
        /// Vesting duration in seconds.
        duration_secs: u32,
        /// The amount the schedule covers.
        original_balance: ShareAmount,
    },
    /// Spendable with `required` of the listed owners' signatures.
    Multisig {
        /// Number of signatures required.
        required: u8,
        /// The owning addresses.
        owners: Vec<Address>,
    },
}

impl ClaimCondition {
    /// The primary owner, when the condition has a single one.
    pub fn owner(&self) -> Option<Address> {
        match self {
            ClaimCondition::Signature { owner } | ClaimCondition::Vesting { owner, .. } => {
                Some(*owner)
            }
            ClaimCondition::Multisig { .. } => None,
        }
    }
}

/// The full withdraw condition a balance is held under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WithdrawCondition {
    /// The asset held.
    pub asset_id: AssetId,
    /// The vote slate the held amount supports; `0` votes for no one.
    pub slate_id: SlateId,
    /// The claim condition.
    pub condition: ClaimCondition,
}

impl WithdrawCondition {
    /// The balance id of this condition: `ripemd160(sha512(pack(condition)))`.
    pub fn balance_id(&self) -> BalanceId {
        BalanceId(crypto::ripemd160_sha512(&packing::pack(self)))
    }
}

/// Snapshot provenance of balances imported from another chain at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The address on the originating chain.
    pub original_address: String,
    /// The imported amount.
    pub original_balance: ShareAmount,
}

/// Funds held under one withdraw condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// The condition the funds are held under.
    pub condition: WithdrawCondition,
    /// Current amount, in the condition's asset base units.
    pub balance: ShareAmount,
    /// When the record was last modified.
    pub last_update: Timestamp,
    /// Provenance for genesis-imported balances.
    pub snapshot_info: Option<SnapshotRecord>,
}

impl BalanceRecord {
    /// A new signature balance owned by `owner`.
    pub fn new_signature(
        owner: Address,
        amount: ShareAmount,
        asset_id: AssetId,
        slate_id: SlateId,
        time: Timestamp,
    ) -> Self {
        Self {
            condition: WithdrawCondition {
                asset_id,
                slate_id,
                condition: ClaimCondition::Signature { owner },
            },
            balance: amount,
            last_update: time,
            snapshot_info: None,
        }
    }

    /// The id of this balance.
    pub fn id(&self) -> BalanceId {
        self.condition.balance_id()
    }

    /// The asset held.
    pub fn asset_id(&self) -> AssetId {
        self.condition.asset_id
    }

    /// The vote slate the held amount supports.
    pub fn slate_id(&self) -> SlateId {
        self.condition.slate_id
    }

    /// The primary owner, when the condition has one.
    pub fn owner(&self) -> Option<Address> {
        self.condition.condition.owner()
    }

    /// The amount spendable at `now`, accounting for vesting.
    pub fn spendable_balance(&self, now: Timestamp) -> ShareAmount {
        match &self.condition.condition {
            ClaimCondition::Signature { .. } | ClaimCondition::Multisig { .. } => self.balance,
            ClaimCondition::Vesting { start_time, duration_secs, original_balance, .. } => {
                if now <= *start_time {
                    return 0;
                }
                let elapsed = now.saturating_secs_since(*start_time) as i64;
                let vested = if elapsed >= *duration_secs as i64 {
                    *original_balance
                } else {
                    (*original_balance as i128 * elapsed as i128 / (*duration_secs).max(1) as i128)
                        as ShareAmount
                };
                // Withdrawals spend from the vested tranche first.
                let already_spent = original_balance - self.balance;
                (vested - already_spent).max(0).min(self.balance)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Address {
        Address(Hash160([9; 20]))
    }

    #[test]
    fn balance_id_depends_on_condition_only() {
        let a = BalanceRecord::new_signature(owner(), 10, 0, 0, Timestamp(1));
        let b = BalanceRecord::new_signature(owner(), 999, 0, 0, Timestamp(2));
        assert_eq!(a.id(), b.id());

        let other_asset = BalanceRecord::new_signature(owner(), 10, 1, 0, Timestamp(1));
        assert_ne!(a.id(), other_asset.id());
    }

    #[test]
    fn vesting_unlocks_linearly() {
        let record = BalanceRecord {
            condition: WithdrawCondition {
                asset_id: 0,
                slate_id: 0,
                condition: ClaimCondition::Vesting {
                    owner: owner(),
                    start_time: Timestamp(1_000),
                    duration_secs: 100,
                    original_balance: 1_000,
                },
            },
            balance: 1_000,
            last_update: Timestamp(1_000),
            snapshot_info: None,
        };

        assert_eq!(record.spendable_balance(Timestamp(999)), 0);
        assert_eq!(record.spendable_balance(Timestamp(1_050)), 500);
        assert_eq!(record.spendable_balance(Timestamp(1_100)), 1_000);
        assert_eq!(record.spendable_balance(Timestamp(2_000)), 1_000);
    }
}
