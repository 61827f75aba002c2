//! The chain state view and its copy-on-write overlays.
//!
//! [`ChainRead`] is the typed read surface shared by the persistent database
//! and every overlay stacked on top of it. [`PendingState`] collects writes
//! against a parent view; committing merges its delta into the parent, and
//! [`PendingState::build_undo_state`] produces the delta that reverts it.

mod pending;
pub use pending::{DeltaView, PendingState};

use crate::error::ChainResult;
use calder_primitives::{
    AccountId, AccountRecord, Address, AssetId, AssetRecord, BalanceId, BalanceRecord,
    BlockNumber, BurnRecord, ChainProperty, CollateralRecord, FeedIndex, FeedRecord,
    MarketHistoryKey, MarketHistoryRecord, MarketIndexKey, MarketStatus, MarketTransaction,
    OrderKind, OrderRecord, PropertyValue, SlateEntry, SlateId, SlotRecord, TransactionId,
    TransactionRecord,
};

/// Typed read access to a chain state, either the persistent view or a
/// pending overlay stacked on one.
pub trait ChainRead {
    /// A chain property, if set.
    fn get_property(&self, key: ChainProperty) -> ChainResult<Option<PropertyValue>>;

    /// An account by id.
    fn get_account(&self, id: AccountId) -> ChainResult<Option<AccountRecord>>;

    /// An account by unique name.
    fn get_account_by_name(&self, name: &str) -> ChainResult<Option<AccountRecord>>;

    /// An account by owner address.
    fn get_account_by_address(&self, address: &Address) -> ChainResult<Option<AccountRecord>>;

    /// An asset by id.
    fn get_asset(&self, id: AssetId) -> ChainResult<Option<AssetRecord>>;

    /// An asset by unique symbol.
    fn get_asset_by_symbol(&self, symbol: &str) -> ChainResult<Option<AssetRecord>>;

    /// A balance by id, whether empty or not.
    fn get_balance(&self, id: &BalanceId) -> ChainResult<Option<BalanceRecord>>;

    /// An included transaction's record.
    fn get_transaction_record(&self, id: &TransactionId)
        -> ChainResult<Option<TransactionRecord>>;

    /// A vote slate by id.
    fn get_slate(&self, id: SlateId) -> ChainResult<Option<SlateEntry>>;

    /// A feed by index.
    fn get_feed(&self, index: &FeedIndex) -> ChainResult<Option<FeedRecord>>;

    /// All feeds for a quote asset.
    fn get_feeds_for_asset(&self, quote_asset_id: AssetId) -> ChainResult<Vec<FeedRecord>>;

    /// A slot record by start time.
    fn get_slot(&self, start_time: calder_primitives::Timestamp)
        -> ChainResult<Option<SlotRecord>>;

    /// A resting order by book and key.
    fn get_order(&self, kind: OrderKind, key: &MarketIndexKey)
        -> ChainResult<Option<OrderRecord>>;

    /// A collateral position by key.
    fn get_collateral(&self, key: &MarketIndexKey) -> ChainResult<Option<CollateralRecord>>;

    /// The whole book of one pair, ascending by key.
    fn market_orders(
        &self,
        kind: OrderKind,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>>;

    /// All collateral positions of one pair, ascending by key.
    fn market_collateral(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, CollateralRecord)>>;

    /// The rolling status of one pair.
    fn get_market_status(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<MarketStatus>>;

    /// A market history bucket.
    fn get_market_history(
        &self,
        key: &MarketHistoryKey,
    ) -> ChainResult<Option<MarketHistoryRecord>>;

    /// Market transactions recorded for a block.
    fn get_market_transactions(
        &self,
        block_num: BlockNumber,
    ) -> ChainResult<Option<Vec<MarketTransaction>>>;

    /// A burn record by (account, transaction).
    fn get_burn(&self, key: &(AccountId, TransactionId)) -> ChainResult<Option<BurnRecord>>;

    /// Height of the head block underlying this view.
    fn head_block_num(&self) -> ChainResult<BlockNumber>;

    /// `true` when the transaction id was already included or is visible in
    /// this view's overlay chain.
    fn is_known_transaction(&self, id: &TransactionId) -> ChainResult<bool>;
}

/// Convenience lookups shared by every [`ChainRead`].
pub trait ChainReadExt: ChainRead {
    /// The chain property as an integer, if set and integral.
    fn get_property_int(&self, key: ChainProperty) -> ChainResult<Option<i64>> {
        Ok(self.get_property(key)?.and_then(|value| value.as_int()))
    }

    /// The current active delegate list, in slot order.
    fn get_active_delegates(&self) -> ChainResult<Vec<AccountId>> {
        Ok(self
            .get_property(ChainProperty::ActiveDelegateList)?
            .and_then(|value| value.as_delegate_list().map(<[AccountId]>::to_vec))
            .unwrap_or_default())
    }

    /// The rolling random seed.
    fn get_current_random_seed(&self) -> ChainResult<calder_primitives::RandomSeed> {
        Ok(self
            .get_property(ChainProperty::LastRandomSeed)?
            .and_then(|value| value.as_seed())
            .unwrap_or_default())
    }
}

impl<T: ChainRead + ?Sized> ChainReadExt for T {}
