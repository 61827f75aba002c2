//! The singleton property store's keys and values.

use crate::{AccountId, ChainId, RandomSeed};
use serde::{Deserialize, Serialize};

/// Keys of the singleton chain property map.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ChainProperty {
    /// On-disk index layout version.
    DatabaseVersion = 0,
    /// The chain id derived from the genesis state.
    ChainId = 1,
    /// The current active delegate list, in slot order.
    ActiveDelegateList = 2,
    /// The rolling random seed.
    LastRandomSeed = 3,
    /// Highest asset id assigned so far.
    LastAssetId = 4,
    /// Highest account id assigned so far.
    LastAccountId = 5,
    /// Highest auxiliary object id assigned so far.
    LastObjectId = 6,
    /// Confirmations currently required before a transaction is final.
    RequiredConfirmations = 7,
}

/// A value stored under a [`ChainProperty`] key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// A signed integer property.
    Int(i64),
    /// A chain id.
    ChainId(ChainId),
    /// A random seed.
    Seed(RandomSeed),
    /// An ordered delegate list.
    DelegateList(Vec<AccountId>),
}

impl PropertyValue {
    /// The integer value, if this is an integer property.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The chain id, if this is a chain id property.
    pub fn as_chain_id(&self) -> Option<ChainId> {
        match self {
            PropertyValue::ChainId(id) => Some(*id),
            _ => None,
        }
    }

    /// The seed, if this is a seed property.
    pub fn as_seed(&self) -> Option<RandomSeed> {
        match self {
            PropertyValue::Seed(seed) => Some(*seed),
            _ => None,
        }
    }

    /// The delegate list, if this is a delegate list property.
    pub fn as_delegate_list(&self) -> Option<&[AccountId]> {
        match self {
            PropertyValue::DelegateList(list) => Some(list),
            _ => None,
        }
    }
}
