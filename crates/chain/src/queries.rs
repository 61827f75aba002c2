//! Read-side queries: range scans, market books, audit computations and
//! fork introspection.

use crate::{
    chain::ChainDatabase,
    error::{ChainError, ChainResult},
    market::median_delegate_price,
    state::{ChainRead, ChainReadExt},
};
use calder_primitives::{
    AccountId, AccountRecord, Address, AssetAmount, AssetId, AssetRecord, BalanceId,
    BalanceRecord, BlockId, BlockNumber, ClaimCondition, CollateralRecord, MarketHistoryKey,
    MarketHistoryRecord, MarketIndexKey, MarketTransaction, OrderKind, OrderRecord, Price,
    PublicKey, ShareAmount, SlotRecord, TimeGranularity, Timestamp, TransactionRecord,
};
use std::{collections::BTreeMap, io::Write, path::Path};

/// One sibling in a fork-point listing.
#[derive(Clone, Debug)]
pub struct ForkEntry {
    /// The sibling block.
    pub block_id: BlockId,
    /// Observed receipt latency in seconds.
    pub latency_secs: u32,
    /// The producing delegate, when recoverable.
    pub signing_delegate: Option<AccountId>,
    /// Number of contained transactions.
    pub transaction_count: usize,
    /// Packed size in bytes.
    pub size: u64,
    /// Production timestamp.
    pub timestamp: Timestamp,
    /// Validation verdict, if any.
    pub is_valid: Option<bool>,
    /// Why the block is invalid, if it is.
    pub invalid_reason: Option<String>,
    /// Whether the block is on the main chain.
    pub is_current_fork: bool,
}

impl ChainDatabase {
    /// Balances starting at `first`, at most `limit`.
    pub fn get_balances(
        &self,
        first: &BalanceId,
        limit: usize,
    ) -> ChainResult<BTreeMap<BalanceId, BalanceRecord>> {
        let mut records = BTreeMap::new();
        for item in self.balances.iter_from(first) {
            if records.len() >= limit {
                break;
            }
            let (id, record) = item?;
            records.insert(id, record);
        }
        Ok(records)
    }

    /// All balances owned by `address`.
    pub fn get_balances_for_address(
        &self,
        address: &Address,
    ) -> ChainResult<BTreeMap<BalanceId, BalanceRecord>> {
        let mut records = BTreeMap::new();
        self.scan_balances(false, &mut |record: &BalanceRecord| {
            if record.owner() == Some(*address) {
                records.insert(record.id(), record.clone());
            }
        })?;
        Ok(records)
    }

    /// All balances owned by the address of `key`.
    pub fn get_balances_for_key(
        &self,
        key: &PublicKey,
    ) -> ChainResult<BTreeMap<BalanceId, BalanceRecord>> {
        self.get_balances_for_address(&key.address())
    }

    /// Visits every balance; `include_empty` adds the empty-balance index.
    pub fn scan_balances(
        &self,
        include_empty: bool,
        callback: &mut dyn FnMut(&BalanceRecord),
    ) -> ChainResult<()> {
        for item in self.balances.iter() {
            callback(&item?.1);
        }
        if include_empty {
            for item in self.empty_balances.iter() {
                callback(&item?.1);
            }
        }
        Ok(())
    }

    /// Visits every account.
    pub fn scan_accounts(&self, callback: &mut dyn FnMut(&AccountRecord)) -> ChainResult<()> {
        for item in self.accounts.iter() {
            callback(&item?.1);
        }
        Ok(())
    }

    /// Visits every asset.
    pub fn scan_assets(&self, callback: &mut dyn FnMut(&AssetRecord)) -> ChainResult<()> {
        for item in self.assets.iter() {
            callback(&item?.1);
        }
        Ok(())
    }

    /// Accounts ordered by name, starting at `first`, at most `limit`.
    pub fn get_accounts(&self, first: &str, limit: usize) -> ChainResult<Vec<AccountRecord>> {
        let mut records = Vec::new();
        for item in self.account_name_to_id.iter_from(&first.to_string()) {
            if records.len() >= limit {
                break;
            }
            let (_, id) = item?;
            if let Some(record) = self.get_account(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Assets ordered by symbol, starting at `first`, at most `limit`.
    pub fn get_assets(&self, first: &str, limit: usize) -> ChainResult<Vec<AssetRecord>> {
        let mut records = Vec::new();
        for item in self.asset_symbol_to_id.iter_from(&first.to_string()) {
            if records.len() >= limit {
                break;
            }
            let (_, id) = item?;
            if let Some(record) = self.get_asset(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// An included transaction's record.
    pub fn get_transaction(
        &self,
        id: &calder_primitives::TransactionId,
    ) -> ChainResult<Option<TransactionRecord>> {
        self.get_transaction_record(id)
    }

    /// All transaction records of a main-chain block, in block order.
    pub fn get_transactions_for_block(
        &self,
        block_id: &BlockId,
    ) -> ChainResult<Vec<TransactionRecord>> {
        let record = self
            .get_block_record(block_id)?
            .ok_or(crate::error::ForkTreeError::UnknownBlock(*block_id))?;
        let mut records = Vec::with_capacity(record.user_transaction_ids.len());
        for trx_id in &record.user_transaction_ids {
            let trx = self
                .get_transaction_record(trx_id)?
                .ok_or_else(|| ChainError::Internal(format!("unknown transaction {trx_id}")))?;
            records.push(trx);
        }
        Ok(records)
    }

    /// Transactions that involved `address`, when statistics are tracked.
    pub fn fetch_address_transactions(
        &self,
        address: &Address,
    ) -> ChainResult<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        let lower = (*address, calder_primitives::TransactionId::default());
        for item in self.address_transactions.iter_from(&lower) {
            let ((addr, trx_id), ()) = item?;
            if addr != *address {
                break;
            }
            if let Some(record) = self.get_transaction_record(&trx_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Burn records of an account, when statistics are tracked.
    pub fn fetch_burn_records(
        &self,
        account_id: AccountId,
    ) -> ChainResult<Vec<calder_primitives::BurnRecord>> {
        let mut records = Vec::new();
        let lower = (account_id, calder_primitives::TransactionId::default());
        for item in self.burns.iter_from(&lower) {
            let ((id, _), record) = item?;
            if id != account_id {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    // --- market queries ---

    /// Bids of a pair, best (highest) price first.
    pub fn get_market_bids(
        &self,
        quote_symbol: &str,
        base_symbol: &str,
        limit: usize,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        let (quote, base) = self.resolve_pair(quote_symbol, base_symbol)?;
        let mut bids = self.market_orders(OrderKind::Bid, quote, base)?;
        bids.extend(self.market_orders(OrderKind::RelativeBid, quote, base)?);
        bids.sort_by(|a, b| b.0.cmp(&a.0));
        bids.truncate(limit);
        Ok(bids)
    }

    /// Asks of a pair, best (lowest) price first.
    pub fn get_market_asks(
        &self,
        quote_symbol: &str,
        base_symbol: &str,
        limit: usize,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        let (quote, base) = self.resolve_pair(quote_symbol, base_symbol)?;
        let mut asks = self.market_orders(OrderKind::Ask, quote, base)?;
        asks.extend(self.market_orders(OrderKind::RelativeAsk, quote, base)?);
        asks.sort_by(|a, b| a.0.cmp(&b.0));
        asks.truncate(limit);
        Ok(asks)
    }

    /// The lowest resting ask of a pair.
    pub fn get_lowest_ask_record(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<(MarketIndexKey, OrderRecord)>> {
        Ok(self.market_orders(OrderKind::Ask, quote_asset_id, base_asset_id)?.into_iter().next())
    }

    /// Shorts of a market-issued asset, highest offered interest first.
    pub fn get_market_shorts(
        &self,
        quote_symbol: &str,
        limit: usize,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        let quote = self.resolve_asset_id(quote_symbol)?;
        let mut shorts = self.market_orders(OrderKind::Short, quote, 0)?;
        shorts.sort_by(|a, b| b.0.cmp(&a.0));
        shorts.truncate(limit);
        Ok(shorts)
    }

    /// Open collateral positions of a market-issued asset.
    pub fn get_market_covers(
        &self,
        quote_symbol: &str,
        limit: usize,
    ) -> ChainResult<Vec<(MarketIndexKey, CollateralRecord)>> {
        let quote = self.resolve_asset_id(quote_symbol)?;
        let mut covers = self.market_collateral(quote, 0)?;
        covers.truncate(limit);
        Ok(covers)
    }

    /// Total locked collateral backing a market-issued asset.
    pub fn get_asset_collateral(&self, quote_symbol: &str) -> ChainResult<ShareAmount> {
        let quote = self.resolve_asset_id(quote_symbol)?;
        Ok(self
            .market_collateral(quote, 0)?
            .iter()
            .map(|(_, record)| record.collateral_balance)
            .sum())
    }

    /// Visits resting orders of every book (or one kind), applying `filter`
    /// until `limit` matches accumulate.
    pub fn scan_market_orders(
        &self,
        filter: &mut dyn FnMut(OrderKind, &MarketIndexKey, &OrderRecord) -> bool,
        limit: usize,
        kind: Option<OrderKind>,
    ) -> ChainResult<Vec<(OrderKind, MarketIndexKey, OrderRecord)>> {
        let mut matches = Vec::new();
        let kinds = [
            OrderKind::Ask,
            OrderKind::Bid,
            OrderKind::RelativeAsk,
            OrderKind::RelativeBid,
            OrderKind::Short,
        ];
        for book in kinds {
            if kind.is_some_and(|k| k != book) {
                continue;
            }
            macro_rules! scan_book {
                ($store:expr) => {{
                    for item in $store.iter() {
                        let (key, record) = item?;
                        if filter(book, &key, &record) {
                            matches.push((book, key, record));
                            if matches.len() >= limit {
                                return Ok(matches);
                            }
                        }
                    }
                }};
            }
            match book {
                OrderKind::Bid => scan_book!(self.bids),
                OrderKind::Ask => scan_book!(self.asks),
                OrderKind::RelativeBid => scan_book!(self.relative_bids),
                OrderKind::RelativeAsk => scan_book!(self.relative_asks),
                OrderKind::Short => scan_book!(self.shorts),
                OrderKind::Cover => continue,
            }
        }
        Ok(matches)
    }

    /// Every pair that has ever had a market status.
    pub fn get_market_pairs(&self) -> ChainResult<Vec<(AssetId, AssetId)>> {
        let mut pairs = Vec::new();
        for item in self.market_statuses.iter() {
            pairs.push(item?.0);
        }
        Ok(pairs)
    }

    /// The median feed of a pair from the current active delegates.
    pub fn get_median_delegate_price(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<Price>> {
        let active = self.get_active_delegates()?;
        median_delegate_price(
            self,
            &self.config,
            &active,
            self.chain_time(),
            quote_asset_id,
            base_asset_id,
        )
    }

    /// Feeds published by one delegate.
    pub fn get_feeds_from_delegate(
        &self,
        delegate_id: AccountId,
    ) -> ChainResult<Vec<calder_primitives::FeedRecord>> {
        let mut records = Vec::new();
        for item in self.feeds.iter() {
            let (index, record) = item?;
            if index.delegate_id == delegate_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// History buckets of a pair within `[start_time, start_time + duration)`.
    pub fn get_market_price_history(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        start_time: Timestamp,
        duration_secs: u32,
        granularity: TimeGranularity,
    ) -> ChainResult<Vec<(Timestamp, MarketHistoryRecord)>> {
        let end_time = start_time + duration_secs;
        let lower = MarketHistoryKey {
            quote_asset_id,
            base_asset_id,
            granularity,
            timestamp: start_time,
        };
        let mut points = Vec::new();
        for item in self.market_history.iter_from(&lower) {
            let (key, record) = item?;
            if key.quote_asset_id != quote_asset_id
                || key.base_asset_id != base_asset_id
                || key.granularity != granularity
                || key.timestamp > end_time
            {
                break;
            }
            points.push((key.timestamp, record));
        }
        Ok(points)
    }

    /// Walks market transactions backwards from the head, newest first,
    /// filtered to one pair and optionally one owner.
    pub fn market_order_history(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        skip_count: usize,
        limit: usize,
        owner: Option<Address>,
    ) -> ChainResult<Vec<(Timestamp, MarketTransaction)>> {
        let mut results = Vec::new();
        let mut to_skip = skip_count;
        let mut block_num = self.get_head_block_num();

        while block_num >= 1 && results.len() < limit {
            if let Some(transactions) = self.get_market_transactions(block_num)? {
                let timestamp = self
                    .get_block_record(&self.get_block_id(block_num)?)?
                    .map(|record| record.signed_header.header.timestamp)
                    .unwrap_or_default();
                for mtrx in transactions.into_iter().rev() {
                    let interesting = mtrx.base_received.asset_id == base_asset_id
                        && mtrx.quote_paid.asset_id == quote_asset_id
                        && owner
                            .map(|addr| mtrx.bid_owner == addr || mtrx.ask_owner == addr)
                            .unwrap_or(true);
                    if !interesting {
                        continue;
                    }
                    if to_skip > 0 {
                        to_skip -= 1;
                        continue;
                    }
                    results.push((timestamp, mtrx));
                    if results.len() >= limit {
                        break;
                    }
                }
            }
            block_num -= 1;
        }
        Ok(results)
    }

    // --- audit queries ---

    /// Recomputes an asset's supply by exhaustive scan over balances,
    /// orders, collateral, pay balances and collected fees.
    pub fn calculate_supply(&self, asset_id: AssetId) -> ChainResult<AssetAmount> {
        let record = self
            .get_asset(asset_id)?
            .ok_or(crate::error::TransactionError::UnknownAsset(asset_id))?;
        let mut total = AssetAmount::new(record.collected_fees, asset_id);

        self.scan_balances(true, &mut |balance: &BalanceRecord| {
            if balance.asset_id() == asset_id {
                total.amount += balance.balance;
            }
        })?;

        // Ask-side escrows are held in the base asset of their pair.
        for item in self.asks.iter() {
            let (key, order) = item?;
            if key.order_price.base_asset_id == asset_id {
                total.amount += order.balance;
            }
        }
        for item in self.relative_asks.iter() {
            let (key, order) = item?;
            if key.order_price.base_asset_id == asset_id {
                total.amount += order.balance;
            }
        }

        if asset_id == 0 {
            for item in self.shorts.iter() {
                total.amount += item?.1.balance;
            }
            for item in self.collateral.iter() {
                total.amount += item?.1.collateral_balance;
            }
            self.scan_accounts(&mut |account: &AccountRecord| {
                if let Some(info) = &account.delegate_info {
                    total.amount += info.pay_balance;
                }
            })?;
        } else {
            for item in self.bids.iter() {
                let (key, order) = item?;
                if key.order_price.quote_asset_id == asset_id {
                    total.amount += order.balance;
                }
            }
            for item in self.relative_bids.iter() {
                let (key, order) = item?;
                if key.order_price.quote_asset_id == asset_id {
                    total.amount += order.balance;
                }
            }
        }
        Ok(total)
    }

    /// Recomputes a market-issued asset's outstanding debt.
    pub fn calculate_debt(
        &self,
        asset_id: AssetId,
        include_interest: bool,
    ) -> ChainResult<AssetAmount> {
        let record = self
            .get_asset(asset_id)?
            .ok_or(crate::error::TransactionError::UnknownAsset(asset_id))?;
        if !record.is_market_issued() {
            return Err(ChainError::Internal(format!(
                "asset {asset_id} is not market-issued"
            )));
        }

        let now = self.chain_time();
        let mut total = AssetAmount::new(0, asset_id);
        for item in self.collateral.iter() {
            let (key, position) = item?;
            if key.order_price.quote_asset_id != asset_id {
                continue;
            }
            total.amount += position.payoff_balance;
            if include_interest {
                let start =
                    position.expiration.0.saturating_sub(self.config.max_short_period_secs);
                let age = now.0.saturating_sub(start);
                total.amount += CollateralRecord::interest_owed(
                    position.payoff_balance,
                    position.interest_rate_ppm,
                    age,
                );
            }
        }
        Ok(total)
    }

    /// A claimer → spendable base amount map over signature balances, pay
    /// balances and market escrows, for accounting audits.
    pub fn generate_snapshot(&self) -> ChainResult<BTreeMap<String, ShareAmount>> {
        let mut snapshot: BTreeMap<String, ShareAmount> = BTreeMap::new();
        let now = self.chain_time();

        self.scan_balances(false, &mut |balance: &BalanceRecord| {
            if balance.asset_id() != 0 {
                return;
            }
            if !matches!(balance.condition.condition, ClaimCondition::Signature { .. }) {
                return;
            }
            let claimer = match &balance.snapshot_info {
                Some(info) => info.original_address.clone(),
                None => match balance.owner() {
                    Some(owner) => owner.to_string(),
                    None => return,
                },
            };
            *snapshot.entry(claimer).or_default() += balance.spendable_balance(now);
        })?;

        self.scan_accounts(&mut |account: &AccountRecord| {
            if let Some(info) = &account.delegate_info {
                *snapshot.entry(account.active_address().to_string()).or_default() +=
                    info.pay_balance;
            }
        })?;

        for item in self.asks.iter() {
            let (key, order) = item?;
            if key.order_price.base_asset_id == 0 {
                *snapshot.entry(key.owner.to_string()).or_default() += order.balance;
            }
        }
        for item in self.relative_asks.iter() {
            let (key, order) = item?;
            if key.order_price.base_asset_id == 0 {
                *snapshot.entry(key.owner.to_string()).or_default() += order.balance;
            }
        }
        for item in self.shorts.iter() {
            let (key, order) = item?;
            *snapshot.entry(key.owner.to_string()).or_default() += order.balance;
        }
        for item in self.collateral.iter() {
            let (key, position) = item?;
            *snapshot.entry(key.owner.to_string()).or_default() += position.collateral_balance;
        }
        Ok(snapshot)
    }

    /// Reconciles every asset's stored supply against an exhaustive recount
    /// and its hard cap, failing on the first discrepancy.
    pub fn sanity_check(&self) -> ChainResult<()> {
        let mut assets = Vec::new();
        self.scan_assets(&mut |record: &AssetRecord| assets.push(record.clone()))?;
        for asset in assets {
            let computed = self.calculate_supply(asset.id)?;
            if computed.amount != asset.current_supply {
                return Err(ChainError::SupplyMismatch {
                    asset_id: asset.id,
                    stored: asset.current_supply,
                    computed: computed.amount,
                });
            }
            if asset.current_supply > asset.maximum_supply {
                return Err(ChainError::SupplyCapViolated {
                    asset_id: asset.id,
                    current: asset.current_supply,
                    maximum: asset.maximum_supply,
                });
            }
        }
        Ok(())
    }

    /// Genesis-imported balances that have never been touched.
    pub fn unclaimed_genesis(&self) -> ChainResult<AssetAmount> {
        let genesis_date = self
            .get_asset(0)?
            .map(|asset| asset.registration_date)
            .unwrap_or_default();
        let mut unclaimed = AssetAmount::new(0, 0);
        self.scan_balances(false, &mut |balance: &BalanceRecord| {
            if balance.snapshot_info.is_some() && balance.last_update <= genesis_date {
                unclaimed.amount += balance.balance;
            }
        })?;
        Ok(unclaimed)
    }

    // --- delegate statistics ---

    /// Slot records of one delegate, from `start_block_num` on, at most
    /// `count`. Negative start counts back from the head.
    pub fn get_delegate_slot_records(
        &self,
        delegate_id: AccountId,
        start_block_num: i64,
        count: usize,
    ) -> ChainResult<Vec<SlotRecord>> {
        let start_block_num = if start_block_num < 0 {
            (self.get_head_block_num() as i64 + start_block_num).max(1) as BlockNumber
        } else {
            start_block_num as BlockNumber
        };
        let min_timestamp = self
            .get_block_record(&self.get_block_id(start_block_num)?)?
            .map(|record| record.signed_header.header.timestamp)
            .unwrap_or_default();

        let mut records = Vec::new();
        for item in self.slots.iter_from(&min_timestamp) {
            let (_, record) = item?;
            if record.delegate_id != delegate_id {
                continue;
            }
            records.push(record);
            if records.len() >= count {
                break;
            }
        }
        Ok(records)
    }

    /// Percentage of expected blocks actually produced over the last round.
    pub fn get_average_delegate_participation(&self) -> ChainResult<f64> {
        let head_num = self.get_head_block_num();
        let now = self.clock.now();
        let interval = self.config.block_interval_secs;
        if head_num < 1 {
            return Ok(0.0);
        }
        let round = self.config.num_delegates as BlockNumber;
        if head_num <= round {
            let first = self.get_block_record(&self.get_block_id(1)?)?;
            let elapsed = now
                .saturating_secs_since(
                    first.map(|r| r.signed_header.header.timestamp).unwrap_or_default(),
                )
                .max(interval);
            let expected = elapsed / interval;
            Ok(100.0 * head_num as f64 / expected as f64)
        } else {
            let starting = self.get_block_record(&self.get_block_id(head_num - round)?)?;
            let elapsed = now
                .saturating_secs_since(
                    starting.map(|r| r.signed_header.header.timestamp).unwrap_or_default(),
                )
                .max(interval);
            let expected = elapsed / interval;
            Ok(100.0 * round as f64 / expected as f64)
        }
    }

    /// Reconciles the in-memory vote index against balances and pay
    /// balances, reporting delegates whose numbers disagree.
    pub fn find_delegate_vote_discrepancies(
        &self,
    ) -> ChainResult<BTreeMap<String, (ShareAmount, ShareAmount)>> {
        let mut calculated: BTreeMap<AccountId, ShareAmount> = BTreeMap::new();
        let mut slate_errors = false;

        let mut balances = Vec::new();
        self.scan_balances(false, &mut |record: &BalanceRecord| balances.push(record.clone()))?;
        for balance in balances {
            if balance.asset_id() != 0 || balance.slate_id() == 0 {
                continue;
            }
            match self.get_slate(balance.slate_id())? {
                Some(slate) => {
                    for delegate in slate.supported_delegates {
                        *calculated.entry(delegate).or_default() += balance.balance;
                    }
                }
                None => slate_errors = true,
            }
        }
        if slate_errors {
            return Err(ChainError::Internal("unknown slate id referenced by balance".into()));
        }

        let mut discrepancies = BTreeMap::new();
        self.scan_accounts(&mut |account: &AccountRecord| {
            if let Some(info) = &account.delegate_info {
                let expected = calculated.get(&account.id).copied().unwrap_or(0) + info.pay_balance;
                if expected != info.votes_for {
                    discrepancies.insert(account.name.clone(), (expected, info.votes_for));
                }
            }
        })?;
        Ok(discrepancies)
    }

    // --- fork introspection ---

    /// Parent-pointer walk from `id` to the first included ancestor.
    pub fn get_fork_history(&self, id: &BlockId) -> ChainResult<Vec<BlockId>> {
        self.fork_db.fork_history(id)
    }

    /// Groups sibling forks by height, for every height with more than one
    /// child.
    pub fn get_forks_list(&self) -> ChainResult<BTreeMap<BlockNumber, Vec<ForkEntry>>> {
        let mut forks = BTreeMap::new();
        for (_, node) in self.fork_db.all_fork_nodes()? {
            if node.next_blocks.len() <= 1 {
                continue;
            }
            let mut entries = Vec::new();
            let mut height = 0;
            for block_id in &node.next_blocks {
                let Some(record) = self.get_block_record(block_id)? else { continue };
                let fork_data = self.fork_db.fetch(block_id)?;
                height = record.block_num();
                entries.push(ForkEntry {
                    block_id: *block_id,
                    latency_secs: record.latency_secs,
                    signing_delegate: self.get_block_signee(block_id).ok().map(|d| d.id),
                    transaction_count: record.user_transaction_ids.len(),
                    size: record.block_size,
                    timestamp: record.signed_header.header.timestamp,
                    is_valid: fork_data.is_valid,
                    invalid_reason: fork_data.invalid_reason,
                    is_current_fork: fork_data.is_included,
                });
            }
            if !entries.is_empty() {
                forks.insert(height, entries);
            }
        }
        Ok(forks)
    }

    /// Emits the fork graph between two heights as a DOT digraph. With no
    /// path the rendering is returned instead of written.
    pub fn export_fork_graph(
        &self,
        start_block: BlockNumber,
        end_block: BlockNumber,
        path: Option<&Path>,
    ) -> ChainResult<String> {
        let mut nodes_by_rank: BTreeMap<u32, Vec<calder_primitives::BlockRecord>> =
            BTreeMap::new();
        let mut start_time: Option<Timestamp> = None;

        for record in self.fork_db.all_block_records()? {
            let timestamp = record.signed_header.header.timestamp;
            let start = *start_time.get_or_insert(timestamp);
            if record.block_num() < start_block || record.block_num() > end_block {
                continue;
            }
            let rank = timestamp.saturating_secs_since(start) / self.config.block_interval_secs;
            nodes_by_rank.entry(rank).or_default().push(record);
        }

        let mut out = String::new();
        out.push_str("digraph G {\nrankdir=LR;\n");
        for (rank, records) in &nodes_by_rank {
            out.push_str(&format!("{{rank=same l{rank}[style=invis, shape=point] "));
            for record in records {
                out.push_str(&format!("; \"{}\"", record.id()));
            }
            out.push_str(";}\n");
        }
        for (rank, records) in &nodes_by_rank {
            for record in records {
                let producer = self
                    .get_block_signee(&record.id())
                    .map(|delegate| delegate.name)
                    .unwrap_or_else(|_| "?".into());
                let id = record.id().to_string();
                out.push_str(&format!(
                    "\"{id}\" [label=<{}<br/>{rank}<br/>{}<br/>{producer}>,style=filled,rank={rank}];\n",
                    &id[..5],
                    record.block_num(),
                ));
                out.push_str(&format!(
                    "\"{id}\" -> \"{}\";\n",
                    record.signed_header.header.previous
                ));
            }
        }
        out.push_str("edge[style=invis];\n");
        let ranks: Vec<String> =
            nodes_by_rank.keys().map(|rank| format!("l{rank}")).collect();
        out.push_str(&ranks.join("->"));
        out.push_str(";\n}");

        if let Some(path) = path {
            let mut file = std::fs::File::create(path)?;
            file.write_all(out.as_bytes())?;
        }
        Ok(out)
    }

    /// JSON-exports the major indexes into `dir` for offline inspection.
    pub fn dump_state(&self, dir: &Path) -> ChainResult<()> {
        std::fs::create_dir_all(dir)?;
        self.properties.export_to_json(&dir.join("property_db.json"))?;
        self.accounts.export_to_json(&dir.join("account_id_to_record.json"))?;
        self.assets.export_to_json(&dir.join("asset_id_to_record.json"))?;
        self.balances.export_to_json(&dir.join("balance_id_to_record.json"))?;
        self.transactions.export_to_json(&dir.join("id_to_transaction_record_db.json"))?;
        self.slates.export_to_json(&dir.join("slate_db.json"))?;
        self.slots.export_to_json(&dir.join("slot_record_db.json"))?;
        self.feeds.export_to_json(&dir.join("feed_index_to_record.json"))?;
        self.bids.export_to_json(&dir.join("bid_db.json"))?;
        self.asks.export_to_json(&dir.join("ask_db.json"))?;
        self.relative_bids.export_to_json(&dir.join("relative_bid_db.json"))?;
        self.relative_asks.export_to_json(&dir.join("relative_ask_db.json"))?;
        self.shorts.export_to_json(&dir.join("short_db.json"))?;
        self.collateral.export_to_json(&dir.join("collateral_db.json"))?;
        self.market_statuses.export_to_json(&dir.join("market_status_db.json"))?;
        self.market_history.export_to_json(&dir.join("market_history_db.json"))?;
        self.market_transactions.export_to_json(&dir.join("market_transactions_db.json"))?;
        self.burns.export_to_json(&dir.join("burn_db.json"))?;
        Ok(())
    }

    /// `true` if the symbol names a registered asset.
    pub fn is_valid_symbol(&self, symbol: &str) -> ChainResult<bool> {
        Ok(self.get_asset_by_symbol(symbol)?.is_some())
    }

    /// The asset id of a symbol.
    pub fn get_asset_id(&self, symbol: &str) -> ChainResult<AssetId> {
        self.resolve_asset_id(symbol)
    }

    fn resolve_asset_id(&self, symbol: &str) -> ChainResult<AssetId> {
        self.get_asset_by_symbol(symbol)?
            .map(|asset| asset.id)
            .ok_or_else(|| ChainError::Internal(format!("unknown asset symbol {symbol:?}")))
    }

    fn resolve_pair(
        &self,
        quote_symbol: &str,
        base_symbol: &str,
    ) -> ChainResult<(AssetId, AssetId)> {
        let quote = self.resolve_asset_id(quote_symbol)?;
        let base = self.resolve_asset_id(base_symbol)?;
        if base >= quote {
            return Err(ChainError::Internal(format!(
                "invalid market pair {quote_symbol}/{base_symbol}"
            )));
        }
        Ok((quote, base))
    }
}
