//! Price feeds and delegate slot records.

use crate::{AccountId, AssetId, BlockId, Price, Timestamp};
use serde::{Deserialize, Serialize};

/// Key of the feed index: one feed per (quote asset, delegate).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FeedIndex {
    /// The quoted asset.
    pub quote_asset_id: AssetId,
    /// The publishing delegate.
    pub delegate_id: AccountId,
}

/// A published price feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// The feed's index key.
    pub index: FeedIndex,
    /// The published price.
    pub value: Price,
    /// When the feed was last refreshed. Feeds older than the configured
    /// maximum age stop counting toward the median.
    pub last_update: Timestamp,
}

/// A production slot and who was scheduled for it. Present only when
/// statistics tracking is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Start of the slot.
    pub start_time: Timestamp,
    /// The delegate that was scheduled.
    pub delegate_id: AccountId,
    /// The block produced in the slot, or `None` if it was missed.
    pub block_id: Option<BlockId>,
}

impl SlotRecord {
    /// A slot that was filled with `block_id`.
    pub fn produced(start_time: Timestamp, delegate_id: AccountId, block_id: BlockId) -> Self {
        Self { start_time, delegate_id, block_id: Some(block_id) }
    }

    /// A slot the scheduled delegate missed.
    pub fn missed(start_time: Timestamp, delegate_id: AccountId) -> Self {
        Self { start_time, delegate_id, block_id: None }
    }
}
