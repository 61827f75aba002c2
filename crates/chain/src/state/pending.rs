//! Copy-on-write overlays over a [`ChainRead`] parent.

use super::ChainRead;
use crate::error::ChainResult;
use calder_primitives::{
    AccountId, AccountRecord, Address, AssetId, AssetRecord, BalanceId, BalanceRecord,
    BlockNumber, BurnRecord, ChainProperty, CollateralRecord, FeedIndex, FeedRecord,
    MarketHistoryKey, MarketHistoryRecord, MarketIndexKey, MarketStatus, MarketTransaction,
    OrderKind, OrderRecord, Price, PropertyValue, SlateEntry, SlateId, SlotRecord, StateDelta,
    Timestamp, TransactionId, TransactionRecord,
};
use std::collections::{BTreeMap, BTreeSet};

/// A read-only view of a [`StateDelta`] stacked on a parent view.
///
/// This is the value-typed link of the overlay chain: overlays reference
/// their parent by borrow, never by shared ownership.
pub struct DeltaView<'a> {
    delta: &'a StateDelta,
    parent: &'a dyn ChainRead,
}

impl<'a> DeltaView<'a> {
    /// A view of `delta` over `parent`.
    pub fn new(delta: &'a StateDelta, parent: &'a dyn ChainRead) -> Self {
        Self { delta, parent }
    }
}

fn overlay_get<K: Ord, V: Clone>(
    map: &BTreeMap<K, Option<V>>,
    key: &K,
    parent: impl FnOnce() -> ChainResult<Option<V>>,
) -> ChainResult<Option<V>> {
    match map.get(key) {
        Some(entry) => Ok(entry.clone()),
        None => parent(),
    }
}

/// The inclusive/exclusive key bounds of one pair's range in a market index.
fn pair_bounds(
    quote_asset_id: AssetId,
    base_asset_id: AssetId,
) -> (MarketIndexKey, Option<MarketIndexKey>) {
    let lower = MarketIndexKey {
        order_price: Price::pair_floor(quote_asset_id, base_asset_id),
        owner: Address::default(),
        expiration: Timestamp(0),
    };
    let upper = base_asset_id.checked_add(1).map(|next_base| MarketIndexKey {
        order_price: Price::pair_floor(quote_asset_id, next_base),
        owner: Address::default(),
        expiration: Timestamp(0),
    });
    (lower, upper)
}

fn overlay_book<V: Clone>(
    parent: Vec<(MarketIndexKey, V)>,
    overlay: &BTreeMap<MarketIndexKey, Option<V>>,
    quote_asset_id: AssetId,
    base_asset_id: AssetId,
) -> Vec<(MarketIndexKey, V)> {
    let mut merged: BTreeMap<MarketIndexKey, V> = parent.into_iter().collect();
    let (lower, upper) = pair_bounds(quote_asset_id, base_asset_id);
    let range: Box<dyn Iterator<Item = (&MarketIndexKey, &Option<V>)> + '_> = match &upper {
        Some(upper) => Box::new(overlay.range(lower..*upper)),
        None => Box::new(overlay.range(lower..)),
    };
    for (key, entry) in range {
        match entry {
            Some(value) => {
                merged.insert(*key, value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged.into_iter().collect()
}

impl ChainRead for DeltaView<'_> {
    fn get_property(&self, key: ChainProperty) -> ChainResult<Option<PropertyValue>> {
        overlay_get(&self.delta.properties, &key, || self.parent.get_property(key))
    }

    fn get_account(&self, id: AccountId) -> ChainResult<Option<AccountRecord>> {
        overlay_get(&self.delta.accounts, &id, || self.parent.get_account(id))
    }

    fn get_account_by_name(&self, name: &str) -> ChainResult<Option<AccountRecord>> {
        for entry in self.delta.accounts.values().flatten() {
            if entry.name == name {
                return Ok(Some(entry.clone()));
            }
        }
        match self.parent.get_account_by_name(name)? {
            Some(parent_hit) => match self.delta.accounts.get(&parent_hit.id) {
                // Renamed or retired in this overlay.
                Some(Some(updated)) => Ok((updated.name == name).then(|| updated.clone())),
                Some(None) => Ok(None),
                None => Ok(Some(parent_hit)),
            },
            None => Ok(None),
        }
    }

    fn get_account_by_address(&self, address: &Address) -> ChainResult<Option<AccountRecord>> {
        let matches = |record: &AccountRecord| {
            record.owner_address() == *address || record.active_address() == *address
        };
        for entry in self.delta.accounts.values().flatten() {
            if matches(entry) {
                return Ok(Some(entry.clone()));
            }
        }
        match self.parent.get_account_by_address(address)? {
            Some(parent_hit) => match self.delta.accounts.get(&parent_hit.id) {
                Some(Some(updated)) => Ok(matches(updated).then(|| updated.clone())),
                Some(None) => Ok(None),
                None => Ok(Some(parent_hit)),
            },
            None => Ok(None),
        }
    }

    fn get_asset(&self, id: AssetId) -> ChainResult<Option<AssetRecord>> {
        overlay_get(&self.delta.assets, &id, || self.parent.get_asset(id))
    }

    fn get_asset_by_symbol(&self, symbol: &str) -> ChainResult<Option<AssetRecord>> {
        for entry in self.delta.assets.values().flatten() {
            if entry.symbol == symbol {
                return Ok(Some(entry.clone()));
            }
        }
        match self.parent.get_asset_by_symbol(symbol)? {
            Some(parent_hit) => match self.delta.assets.get(&parent_hit.id) {
                Some(Some(updated)) => Ok((updated.symbol == symbol).then(|| updated.clone())),
                Some(None) => Ok(None),
                None => Ok(Some(parent_hit)),
            },
            None => Ok(None),
        }
    }

    fn get_balance(&self, id: &BalanceId) -> ChainResult<Option<BalanceRecord>> {
        overlay_get(&self.delta.balances, id, || self.parent.get_balance(id))
    }

    fn get_transaction_record(
        &self,
        id: &TransactionId,
    ) -> ChainResult<Option<TransactionRecord>> {
        overlay_get(&self.delta.transactions, id, || self.parent.get_transaction_record(id))
    }

    fn get_slate(&self, id: SlateId) -> ChainResult<Option<SlateEntry>> {
        overlay_get(&self.delta.slates, &id, || self.parent.get_slate(id))
    }

    fn get_feed(&self, index: &FeedIndex) -> ChainResult<Option<FeedRecord>> {
        overlay_get(&self.delta.feeds, index, || self.parent.get_feed(index))
    }

    fn get_feeds_for_asset(&self, quote_asset_id: AssetId) -> ChainResult<Vec<FeedRecord>> {
        let mut merged: BTreeMap<FeedIndex, FeedRecord> = self
            .parent
            .get_feeds_for_asset(quote_asset_id)?
            .into_iter()
            .map(|record| (record.index, record))
            .collect();
        let lower = FeedIndex { quote_asset_id, delegate_id: 0 };
        let upper = FeedIndex { quote_asset_id, delegate_id: AccountId::MAX };
        for (index, entry) in self.delta.feeds.range(lower..=upper) {
            match entry {
                Some(record) => {
                    merged.insert(*index, record.clone());
                }
                None => {
                    merged.remove(index);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn get_slot(&self, start_time: Timestamp) -> ChainResult<Option<SlotRecord>> {
        overlay_get(&self.delta.slots, &start_time, || self.parent.get_slot(start_time))
    }

    fn get_order(
        &self,
        kind: OrderKind,
        key: &MarketIndexKey,
    ) -> ChainResult<Option<OrderRecord>> {
        let map = match kind {
            OrderKind::Bid => &self.delta.bids,
            OrderKind::Ask => &self.delta.asks,
            OrderKind::RelativeBid => &self.delta.relative_bids,
            OrderKind::RelativeAsk => &self.delta.relative_asks,
            OrderKind::Short => &self.delta.shorts,
            OrderKind::Cover => return Ok(None),
        };
        overlay_get(map, key, || self.parent.get_order(kind, key))
    }

    fn get_collateral(&self, key: &MarketIndexKey) -> ChainResult<Option<CollateralRecord>> {
        overlay_get(&self.delta.collateral, key, || self.parent.get_collateral(key))
    }

    fn market_orders(
        &self,
        kind: OrderKind,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        let parent = self.parent.market_orders(kind, quote_asset_id, base_asset_id)?;
        let map = match kind {
            OrderKind::Bid => &self.delta.bids,
            OrderKind::Ask => &self.delta.asks,
            OrderKind::RelativeBid => &self.delta.relative_bids,
            OrderKind::RelativeAsk => &self.delta.relative_asks,
            OrderKind::Short => &self.delta.shorts,
            OrderKind::Cover => return Ok(Vec::new()),
        };
        Ok(overlay_book(parent, map, quote_asset_id, base_asset_id))
    }

    fn market_collateral(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, CollateralRecord)>> {
        let parent = self.parent.market_collateral(quote_asset_id, base_asset_id)?;
        Ok(overlay_book(parent, &self.delta.collateral, quote_asset_id, base_asset_id))
    }

    fn get_market_status(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<MarketStatus>> {
        overlay_get(&self.delta.market_statuses, &(quote_asset_id, base_asset_id), || {
            self.parent.get_market_status(quote_asset_id, base_asset_id)
        })
    }

    fn get_market_history(
        &self,
        key: &MarketHistoryKey,
    ) -> ChainResult<Option<MarketHistoryRecord>> {
        overlay_get(&self.delta.market_history, key, || self.parent.get_market_history(key))
    }

    fn get_market_transactions(
        &self,
        block_num: BlockNumber,
    ) -> ChainResult<Option<Vec<MarketTransaction>>> {
        overlay_get(&self.delta.market_transactions, &block_num, || {
            self.parent.get_market_transactions(block_num)
        })
    }

    fn get_burn(&self, key: &(AccountId, TransactionId)) -> ChainResult<Option<BurnRecord>> {
        overlay_get(&self.delta.burns, key, || self.parent.get_burn(key))
    }

    fn head_block_num(&self) -> ChainResult<BlockNumber> {
        self.parent.head_block_num()
    }

    fn is_known_transaction(&self, id: &TransactionId) -> ChainResult<bool> {
        if self.delta.transactions.contains_key(id) {
            return Ok(true);
        }
        self.parent.is_known_transaction(id)
    }
}

/// A pending chain state: a write set over a parent view.
///
/// Overlays nest by constructing a child whose parent is this state; a
/// failed child is simply dropped, a successful one is merged back with
/// [`PendingState::absorb`].
pub struct PendingState<'a> {
    parent: &'a dyn ChainRead,
    delta: StateDelta,
    dirty_markets: BTreeSet<(AssetId, AssetId)>,
}

impl<'a> PendingState<'a> {
    /// An empty overlay over `parent`.
    pub fn new(parent: &'a dyn ChainRead) -> Self {
        Self { parent, delta: StateDelta::default(), dirty_markets: BTreeSet::new() }
    }

    /// The accumulated write set.
    pub fn delta(&self) -> &StateDelta {
        &self.delta
    }

    /// The pairs whose order books this overlay touched.
    pub fn dirty_markets(&self) -> &BTreeSet<(AssetId, AssetId)> {
        &self.dirty_markets
    }

    /// Consumes the overlay into its write set and dirty pair set.
    pub fn into_parts(self) -> (StateDelta, BTreeSet<(AssetId, AssetId)>) {
        (self.delta, self.dirty_markets)
    }

    /// Merges a committed child overlay's parts into this one.
    pub fn absorb(&mut self, delta: StateDelta, dirty_markets: BTreeSet<(AssetId, AssetId)>) {
        self.delta.absorb(delta);
        self.dirty_markets.extend(dirty_markets);
    }

    /// Builds the delta that reverts this overlay when applied to `parent`.
    ///
    /// Must be called before the overlay is committed, against the same
    /// parent it will be committed to.
    pub fn build_undo_state(&self, parent: &dyn ChainRead) -> ChainResult<StateDelta> {
        let mut undo = StateDelta::default();
        for key in self.delta.properties.keys() {
            undo.properties.insert(*key, parent.get_property(*key)?);
        }
        for id in self.delta.accounts.keys() {
            undo.accounts.insert(*id, parent.get_account(*id)?);
        }
        for id in self.delta.assets.keys() {
            undo.assets.insert(*id, parent.get_asset(*id)?);
        }
        for id in self.delta.balances.keys() {
            undo.balances.insert(*id, parent.get_balance(id)?);
        }
        for id in self.delta.transactions.keys() {
            undo.transactions.insert(*id, parent.get_transaction_record(id)?);
        }
        for id in self.delta.slates.keys() {
            undo.slates.insert(*id, parent.get_slate(*id)?);
        }
        for index in self.delta.feeds.keys() {
            undo.feeds.insert(*index, parent.get_feed(index)?);
        }
        for time in self.delta.slots.keys() {
            undo.slots.insert(*time, parent.get_slot(*time)?);
        }
        for (key, map) in [
            (OrderKind::Bid, &self.delta.bids),
            (OrderKind::Ask, &self.delta.asks),
            (OrderKind::RelativeBid, &self.delta.relative_bids),
            (OrderKind::RelativeAsk, &self.delta.relative_asks),
            (OrderKind::Short, &self.delta.shorts),
        ] {
            let undo_map = match key {
                OrderKind::Bid => &mut undo.bids,
                OrderKind::Ask => &mut undo.asks,
                OrderKind::RelativeBid => &mut undo.relative_bids,
                OrderKind::RelativeAsk => &mut undo.relative_asks,
                OrderKind::Short => &mut undo.shorts,
                OrderKind::Cover => unreachable!("cover orders live in the collateral map"),
            };
            for order_key in map.keys() {
                undo_map.insert(*order_key, parent.get_order(key, order_key)?);
            }
        }
        for key in self.delta.collateral.keys() {
            undo.collateral.insert(*key, parent.get_collateral(key)?);
        }
        for (quote, base) in self.delta.market_statuses.keys() {
            undo.market_statuses
                .insert((*quote, *base), parent.get_market_status(*quote, *base)?);
        }
        for key in self.delta.market_history.keys() {
            undo.market_history.insert(*key, parent.get_market_history(key)?);
        }
        for block_num in self.delta.market_transactions.keys() {
            undo.market_transactions
                .insert(*block_num, parent.get_market_transactions(*block_num)?);
        }
        for key in self.delta.burns.keys() {
            undo.burns.insert(*key, parent.get_burn(key)?);
        }
        Ok(undo)
    }

    fn view(&self) -> DeltaView<'_> {
        DeltaView::new(&self.delta, self.parent)
    }

    // --- typed stores ---

    /// Sets a chain property.
    pub fn set_property(&mut self, key: ChainProperty, value: PropertyValue) {
        self.delta.properties.insert(key, Some(value));
    }

    /// Stores an account record.
    pub fn store_account(&mut self, record: AccountRecord) {
        self.delta.accounts.insert(record.id, Some(record));
    }

    /// Stores an asset record.
    pub fn store_asset(&mut self, record: AssetRecord) {
        self.delta.assets.insert(record.id, Some(record));
    }

    /// Stores a balance record (empty records are kept; the persistent layer
    /// splits them out on commit).
    pub fn store_balance(&mut self, record: BalanceRecord) {
        self.delta.balances.insert(record.id(), Some(record));
    }

    /// Stores an included transaction's record.
    pub fn store_transaction(&mut self, id: TransactionId, record: TransactionRecord) {
        self.delta.transactions.insert(id, Some(record));
    }

    /// Stores a vote slate.
    pub fn store_slate(&mut self, id: SlateId, entry: SlateEntry) {
        self.delta.slates.insert(id, Some(entry));
    }

    /// Stores a feed record.
    pub fn store_feed(&mut self, record: FeedRecord) {
        self.delta.feeds.insert(record.index, Some(record));
    }

    /// Stores a slot record.
    pub fn store_slot(&mut self, record: SlotRecord) {
        self.delta.slots.insert(record.start_time, Some(record));
    }

    /// Stores or removes a resting order and marks its pair dirty.
    pub fn store_order(
        &mut self,
        kind: OrderKind,
        key: MarketIndexKey,
        record: Option<OrderRecord>,
    ) {
        self.dirty_markets.insert(key.pair());
        let record = record.filter(|r| !r.is_null());
        let map = match kind {
            OrderKind::Bid => &mut self.delta.bids,
            OrderKind::Ask => &mut self.delta.asks,
            OrderKind::RelativeBid => &mut self.delta.relative_bids,
            OrderKind::RelativeAsk => &mut self.delta.relative_asks,
            OrderKind::Short => &mut self.delta.shorts,
            OrderKind::Cover => unreachable!("cover orders live in the collateral map"),
        };
        map.insert(key, record);
    }

    /// Stores or removes a collateral position and marks its pair dirty.
    pub fn store_collateral(&mut self, key: MarketIndexKey, record: Option<CollateralRecord>) {
        self.dirty_markets.insert(key.pair());
        self.delta.collateral.insert(key, record.filter(|r| !r.is_null()));
    }

    /// Stores a pair's rolling market status.
    pub fn store_market_status(&mut self, status: MarketStatus) {
        self.delta
            .market_statuses
            .insert((status.quote_asset_id, status.base_asset_id), Some(status));
    }

    /// Stores a market history bucket.
    pub fn store_market_history(&mut self, key: MarketHistoryKey, record: MarketHistoryRecord) {
        self.delta.market_history.insert(key, Some(record));
    }

    /// Stores the market transactions recorded for a block.
    pub fn set_market_transactions(
        &mut self,
        block_num: BlockNumber,
        transactions: Vec<MarketTransaction>,
    ) {
        let entry = if transactions.is_empty() { None } else { Some(transactions) };
        self.delta.market_transactions.insert(block_num, entry);
    }

    /// Stores a burn record.
    pub fn store_burn(&mut self, key: (AccountId, TransactionId), record: BurnRecord) {
        self.delta.burns.insert(key, Some(record));
    }
}

impl ChainRead for PendingState<'_> {
    fn get_property(&self, key: ChainProperty) -> ChainResult<Option<PropertyValue>> {
        self.view().get_property(key)
    }

    fn get_account(&self, id: AccountId) -> ChainResult<Option<AccountRecord>> {
        self.view().get_account(id)
    }

    fn get_account_by_name(&self, name: &str) -> ChainResult<Option<AccountRecord>> {
        self.view().get_account_by_name(name)
    }

    fn get_account_by_address(&self, address: &Address) -> ChainResult<Option<AccountRecord>> {
        self.view().get_account_by_address(address)
    }

    fn get_asset(&self, id: AssetId) -> ChainResult<Option<AssetRecord>> {
        self.view().get_asset(id)
    }

    fn get_asset_by_symbol(&self, symbol: &str) -> ChainResult<Option<AssetRecord>> {
        self.view().get_asset_by_symbol(symbol)
    }

    fn get_balance(&self, id: &BalanceId) -> ChainResult<Option<BalanceRecord>> {
        self.view().get_balance(id)
    }

    fn get_transaction_record(
        &self,
        id: &TransactionId,
    ) -> ChainResult<Option<TransactionRecord>> {
        self.view().get_transaction_record(id)
    }

    fn get_slate(&self, id: SlateId) -> ChainResult<Option<SlateEntry>> {
        self.view().get_slate(id)
    }

    fn get_feed(&self, index: &FeedIndex) -> ChainResult<Option<FeedRecord>> {
        self.view().get_feed(index)
    }

    fn get_feeds_for_asset(&self, quote_asset_id: AssetId) -> ChainResult<Vec<FeedRecord>> {
        self.view().get_feeds_for_asset(quote_asset_id)
    }

    fn get_slot(&self, start_time: Timestamp) -> ChainResult<Option<SlotRecord>> {
        self.view().get_slot(start_time)
    }

    fn get_order(
        &self,
        kind: OrderKind,
        key: &MarketIndexKey,
    ) -> ChainResult<Option<OrderRecord>> {
        self.view().get_order(kind, key)
    }

    fn get_collateral(&self, key: &MarketIndexKey) -> ChainResult<Option<CollateralRecord>> {
        self.view().get_collateral(key)
    }

    fn market_orders(
        &self,
        kind: OrderKind,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        self.view().market_orders(kind, quote_asset_id, base_asset_id)
    }

    fn market_collateral(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, CollateralRecord)>> {
        self.view().market_collateral(quote_asset_id, base_asset_id)
    }

    fn get_market_status(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<MarketStatus>> {
        self.view().get_market_status(quote_asset_id, base_asset_id)
    }

    fn get_market_history(
        &self,
        key: &MarketHistoryKey,
    ) -> ChainResult<Option<MarketHistoryRecord>> {
        self.view().get_market_history(key)
    }

    fn get_market_transactions(
        &self,
        block_num: BlockNumber,
    ) -> ChainResult<Option<Vec<MarketTransaction>>> {
        self.view().get_market_transactions(block_num)
    }

    fn get_burn(&self, key: &(AccountId, TransactionId)) -> ChainResult<Option<BurnRecord>> {
        self.view().get_burn(key)
    }

    fn head_block_num(&self) -> ChainResult<BlockNumber> {
        self.parent.head_block_num()
    }

    fn is_known_transaction(&self, id: &TransactionId) -> ChainResult<bool> {
        self.view().is_known_transaction(id)
    }
}
