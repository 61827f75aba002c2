//! The serializable write-set of a pending chain state.
//!
//! A [`StateDelta`] maps every typed store to its pending writes; a `None`
//! value marks a deletion. Applied to the state it was diffed against, a
//! delta produced by the undo builder reverts exactly one block, which is
//! the form persisted under the undo horizon.

use crate::{
    AccountId, AccountRecord, AssetId, AssetRecord, BalanceId, BalanceRecord, BlockNumber,
    BurnRecord, ChainProperty, CollateralRecord, FeedIndex, FeedRecord, MarketHistoryKey,
    MarketHistoryRecord, MarketIndexKey, MarketStatus, MarketTransaction, OrderRecord,
    PropertyValue, SlateEntry, SlateId, SlotRecord, Timestamp, TransactionId, TransactionRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pending writes per typed store; `None` marks a deletion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Chain property writes.
    pub properties: BTreeMap<ChainProperty, Option<PropertyValue>>,
    /// Account record writes.
    pub accounts: BTreeMap<AccountId, Option<AccountRecord>>,
    /// Asset record writes.
    pub assets: BTreeMap<AssetId, Option<AssetRecord>>,
    /// Balance record writes.
    pub balances: BTreeMap<BalanceId, Option<BalanceRecord>>,
    /// Included transaction record writes.
    pub transactions: BTreeMap<TransactionId, Option<TransactionRecord>>,
    /// Vote slate writes.
    pub slates: BTreeMap<SlateId, Option<SlateEntry>>,
    /// Feed writes.
    pub feeds: BTreeMap<FeedIndex, Option<FeedRecord>>,
    /// Slot record writes.
    pub slots: BTreeMap<Timestamp, Option<SlotRecord>>,
    /// Absolute bid order writes.
    pub bids: BTreeMap<MarketIndexKey, Option<OrderRecord>>,
    /// Absolute ask order writes.
    pub asks: BTreeMap<MarketIndexKey, Option<OrderRecord>>,
    /// Relative bid order writes.
    pub relative_bids: BTreeMap<MarketIndexKey, Option<OrderRecord>>,
    /// Relative ask order writes.
    pub relative_asks: BTreeMap<MarketIndexKey, Option<OrderRecord>>,
    /// Short order writes.
    pub shorts: BTreeMap<MarketIndexKey, Option<OrderRecord>>,
    /// Collateral position writes.
    pub collateral: BTreeMap<MarketIndexKey, Option<CollateralRecord>>,
    /// Market status writes.
    pub market_statuses: BTreeMap<(AssetId, AssetId), Option<MarketStatus>>,
    /// Market history bucket writes.
    pub market_history: BTreeMap<MarketHistoryKey, Option<MarketHistoryRecord>>,
    /// Per-block market transaction list writes.
    pub market_transactions: BTreeMap<BlockNumber, Option<Vec<MarketTransaction>>>,
    /// Burn record writes.
    pub burns: BTreeMap<(AccountId, TransactionId), Option<BurnRecord>>,
}

impl StateDelta {
    /// `true` when the delta writes nothing.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.accounts.is_empty()
            && self.assets.is_empty()
            && self.balances.is_empty()
            && self.transactions.is_empty()
            && self.slates.is_empty()
            && self.feeds.is_empty()
            && self.slots.is_empty()
            && self.bids.is_empty()
            && self.asks.is_empty()
            && self.relative_bids.is_empty()
            && self.relative_asks.is_empty()
            && self.shorts.is_empty()
            && self.collateral.is_empty()
            && self.market_statuses.is_empty()
            && self.market_history.is_empty()
            && self.market_transactions.is_empty()
            && self.burns.is_empty()
    }

    /// Merges `other`'s writes over this delta's.
    pub fn absorb(&mut self, other: StateDelta) {
        self.properties.extend(other.properties);
        self.accounts.extend(other.accounts);
        self.assets.extend(other.assets);
        self.balances.extend(other.balances);
        self.transactions.extend(other.transactions);
        self.slates.extend(other.slates);
        self.feeds.extend(other.feeds);
        self.slots.extend(other.slots);
        self.bids.extend(other.bids);
        self.asks.extend(other.asks);
        self.relative_bids.extend(other.relative_bids);
        self.relative_asks.extend(other.relative_asks);
        self.shorts.extend(other.shorts);
        self.collateral.extend(other.collateral);
        self.market_statuses.extend(other.market_statuses);
        self.market_history.extend(other.market_history);
        self.market_transactions.extend(other.market_transactions);
        self.burns.extend(other.burns);
    }
}
