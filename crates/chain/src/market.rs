//! The per-pair double-auction market engine.
//!
//! Executed once per block per dirty pair, against the block's pending
//! overlay. Order flow: bids escrow the quote asset and buy base; asks
//! escrow the base asset and sell it for quote. Shorts join the ask side at
//! the feed-derived call price, minting the market-issued quote they sell
//! and locking the received base plus an equal amount of their own escrow as
//! collateral. Expired collateral positions liquidate into the bid side.
//!
//! Determinism: pairs execute in descending quote id; inside a pair, ties in
//! price break by ascending (owner, expiration), with shorts ahead of equal
//! priced asks.

use crate::{
    error::{ChainResult, TransactionError},
    evaluator::deposit_into,
    state::{ChainRead, ChainReadExt, PendingState},
};
use calder_primitives::{
    AccountId, AssetAmount, AssetId, ChainConfig, ClaimCondition, CollateralRecord,
    MarketHistoryKey, MarketHistoryRecord, MarketIndexKey, MarketStatus, MarketTransaction,
    OrderKind, OrderRecord, Price, ShareAmount, TimeGranularity, Timestamp,
};
use tracing::{debug, trace, warn};

/// One side-entry of the matching pass, with its feed-adjusted price.
#[derive(Clone, Debug)]
struct SideEntry {
    kind: OrderKind,
    key: MarketIndexKey,
    record: OrderRecord,
    effective: Price,
}

impl SideEntry {
    /// Base-asset capacity still representable by this entry's escrow.
    fn base_remaining(&self) -> ShareAmount {
        match self.kind {
            // Bid escrow is quote; convert at the effective price.
            OrderKind::Bid | OrderKind::RelativeBid => {
                self.effective.base_for_quote(self.record.balance)
            }
            // Ask and short escrow is base.
            _ => self.record.balance,
        }
    }
}

/// A double-auction pass over one (quote, base) pair.
pub(crate) struct MarketEngine<'a> {
    config: &'a ChainConfig,
    /// The block timestamp the pass runs at.
    timestamp: Timestamp,
    /// Whether market history buckets are recorded.
    record_history: bool,
    /// Fills produced by this pass, in execution order.
    pub(crate) market_transactions: Vec<MarketTransaction>,
}

impl<'a> MarketEngine<'a> {
    pub(crate) fn new(config: &'a ChainConfig, timestamp: Timestamp, record_history: bool) -> Self {
        Self { config, timestamp, record_history, market_transactions: Vec::new() }
    }

    /// Executes one pair. Errors inside the pass are recorded on the pair's
    /// market status instead of failing the block.
    pub(crate) fn execute(
        &mut self,
        pending: &mut PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<bool> {
        let fills_before = self.market_transactions.len();
        let feed = self.median_feed(pending, quote_asset_id, base_asset_id)?;

        let outcome = self.execute_inner(pending, quote_asset_id, base_asset_id, feed);
        let mut status = pending.get_market_status(quote_asset_id, base_asset_id)?.unwrap_or(
            MarketStatus {
                quote_asset_id,
                base_asset_id,
                current_feed_price: None,
                last_valid_feed_price: None,
                last_error: None,
            },
        );
        status.current_feed_price = feed;
        if feed.is_some() {
            status.last_valid_feed_price = feed;
        }
        status.last_error = match &outcome {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    target: "market",
                    quote = quote_asset_id,
                    base = base_asset_id,
                    %err,
                    "market execution error"
                );
                Some(err.to_string())
            }
        };
        pending.store_market_status(status);

        Ok(self.market_transactions.len() > fills_before)
    }

    fn execute_inner(
        &mut self,
        pending: &mut PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        feed: Option<Price>,
    ) -> ChainResult<()> {
        if pending.get_asset(quote_asset_id)?.is_none() {
            return Err(TransactionError::UnknownAsset(quote_asset_id).into());
        }
        let quote_is_market_issued =
            pending.get_asset(quote_asset_id)?.is_some_and(|asset| asset.is_market_issued());

        let mut bids = self.collect_bid_side(pending, quote_asset_id, base_asset_id, feed)?;
        let mut asks = self.collect_ask_side(
            pending,
            quote_asset_id,
            base_asset_id,
            feed,
            quote_is_market_issued && base_asset_id == 0,
        )?;

        let best_bid_price = bids.first().map(|entry| entry.effective);
        let lowest_ask_price = asks.first().map(|entry| entry.effective);

        let mut trades_volume: ShareAmount = 0;
        let mut first_trade: Option<Price> = None;
        let mut last_trade: Option<Price> = None;
        let mut collected_fees: ShareAmount = 0;

        let mut bid_pos = 0usize;
        let mut ask_pos = 0usize;
        while bid_pos < bids.len() && ask_pos < asks.len() {
            let bid_remaining = bids[bid_pos].base_remaining();
            if bid_remaining <= 0 {
                self.cancel_dust(pending, &mut bids[bid_pos])?;
                bid_pos += 1;
                continue;
            }
            let ask_remaining = asks[ask_pos].base_remaining();
            if ask_remaining <= 0 {
                self.cancel_dust(pending, &mut asks[ask_pos])?;
                ask_pos += 1;
                continue;
            }

            let bid = bids[bid_pos].clone();
            let ask = asks[ask_pos].clone();
            if bid.effective.ratio < ask.effective.ratio {
                break;
            }

            let base_fill = bid_remaining.min(ask_remaining);
            // The trade executes at the bid price; the spread over the ask
            // price is collected as fees.
            let quote_paid = bid.effective.quote_for_base(base_fill);
            let quote_received = ask.effective.quote_for_base(base_fill);
            let fees = quote_paid - quote_received;
            debug_assert!(fees >= 0);

            trace!(
                target: "market",
                quote = quote_asset_id,
                base = base_asset_id,
                base_fill,
                quote_paid,
                "order fill"
            );

            // Bid side: spend quote escrow, receive base.
            {
                let entry = &mut bids[bid_pos];
                entry.record.balance -= quote_paid;
                let updated = entry.record;
                pending.store_order(entry.kind, entry.key, Some(updated));
            }
            deposit_into(
                pending,
                self.timestamp,
                base_fill,
                base_asset_id,
                0,
                &ClaimCondition::Signature { owner: bid.key.owner },
            )?;

            // Ask side: spend base escrow, receive quote (or mint it, for a
            // short, locking collateral instead).
            match ask.kind {
                OrderKind::Short => {
                    let entry = &mut asks[ask_pos];
                    entry.record.balance -= base_fill;
                    let updated = entry.record;
                    pending.store_order(OrderKind::Short, entry.key, Some(updated));

                    let mut asset = pending
                        .get_asset(quote_asset_id)?
                        .ok_or(TransactionError::UnknownAsset(quote_asset_id))?;
                    asset.current_supply += quote_received;
                    pending.store_asset(asset);

                    let position_key = MarketIndexKey {
                        order_price: ask.effective,
                        owner: ask.key.owner,
                        expiration: self.timestamp + self.config.max_short_period_secs,
                    };
                    let mut position =
                        pending.get_collateral(&position_key)?.unwrap_or_default();
                    position.collateral_balance += 2 * base_fill;
                    position.payoff_balance += quote_received;
                    position.interest_rate_ppm = ask.record.interest_rate_ppm;
                    position.expiration = position_key.expiration;
                    pending.store_collateral(position_key, Some(position));
                }
                _ => {
                    let entry = &mut asks[ask_pos];
                    entry.record.balance -= base_fill;
                    let updated = entry.record;
                    pending.store_order(entry.kind, entry.key, Some(updated));
                    deposit_into(
                        pending,
                        self.timestamp,
                        quote_received,
                        quote_asset_id,
                        0,
                        &ClaimCondition::Signature { owner: ask.key.owner },
                    )?;
                }
            }

            collected_fees += fees;
            trades_volume += base_fill;
            first_trade.get_or_insert(bid.effective);
            last_trade = Some(bid.effective);

            self.market_transactions.push(MarketTransaction {
                bid_owner: bid.key.owner,
                ask_owner: ask.key.owner,
                bid_price: bid.effective,
                ask_price: ask.effective,
                quote_paid: AssetAmount::new(quote_paid, quote_asset_id),
                base_received: AssetAmount::new(base_fill, base_asset_id),
                fees_collected: fees,
            });
        }

        // Expired collateral liquidates into the remaining bid depth.
        if quote_is_market_issued && base_asset_id == 0 {
            collected_fees += self.settle_expired_covers(
                pending,
                quote_asset_id,
                base_asset_id,
                &mut bids,
                bid_pos,
            )?;
        }

        if collected_fees > 0 {
            let mut asset = pending
                .get_asset(quote_asset_id)?
                .ok_or(TransactionError::UnknownAsset(quote_asset_id))?;
            asset.collected_fees += collected_fees;
            pending.store_asset(asset);
        }

        if self.record_history && trades_volume > 0 {
            self.record_market_history(
                pending,
                quote_asset_id,
                base_asset_id,
                best_bid_price,
                lowest_ask_price,
                first_trade,
                last_trade,
                trades_volume,
            )?;
        }
        Ok(())
    }

    /// Returns an escrow too small to represent one base unit to its owner
    /// and removes the order.
    fn cancel_dust(
        &mut self,
        pending: &mut PendingState<'_>,
        entry: &mut SideEntry,
    ) -> ChainResult<()> {
        if entry.record.balance > 0 {
            let refund_asset = match entry.kind {
                OrderKind::Bid | OrderKind::RelativeBid => entry.key.order_price.quote_asset_id,
                OrderKind::Short => 0,
                _ => entry.key.order_price.base_asset_id,
            };
            deposit_into(
                pending,
                self.timestamp,
                entry.record.balance,
                refund_asset,
                0,
                &ClaimCondition::Signature { owner: entry.key.owner },
            )?;
            entry.record.balance = 0;
        }
        pending.store_order(entry.kind, entry.key, None);
        Ok(())
    }

    /// Sells the collateral of expired positions to the remaining bids until
    /// the accrued debt is repaid. Exhausted collateral forces settlement.
    fn settle_expired_covers(
        &mut self,
        pending: &mut PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        bids: &mut [SideEntry],
        mut bid_pos: usize,
    ) -> ChainResult<ShareAmount> {
        let expired: Vec<(MarketIndexKey, CollateralRecord)> = pending
            .market_collateral(quote_asset_id, base_asset_id)?
            .into_iter()
            .filter(|(_, position)| position.expiration <= self.timestamp)
            .collect();
        let mut fees_total = 0;

        for (key, position) in expired {
            let age =
                self.timestamp.0.saturating_sub(
                    position.expiration.0.saturating_sub(self.config.max_short_period_secs),
                );
            let interest = CollateralRecord::interest_owed(
                position.payoff_balance,
                position.interest_rate_ppm,
                age,
            );
            let principal = position.payoff_balance;
            let mut debt_due = principal + interest;
            let mut collateral_left = position.collateral_balance;
            let mut repaid: ShareAmount = 0;

            while debt_due > 0 && collateral_left > 0 && bid_pos < bids.len() {
                let bid_remaining = bids[bid_pos].base_remaining();
                if bid_remaining <= 0 {
                    self.cancel_dust(pending, &mut bids[bid_pos])?;
                    bid_pos += 1;
                    continue;
                }
                let bid = bids[bid_pos].clone();

                let base_for_debt = bid.effective.base_for_quote(debt_due);
                let base_sold = collateral_left.min(bid_remaining).min(base_for_debt);
                if base_sold <= 0 {
                    // Remaining debt is worth less than one base unit at the
                    // best bid; leave it for the next pass.
                    break;
                }
                let quote_received = bid.effective.quote_for_base(base_sold);

                {
                    let entry = &mut bids[bid_pos];
                    entry.record.balance -= quote_received;
                    let updated = entry.record;
                    pending.store_order(entry.kind, entry.key, Some(updated));
                }
                deposit_into(
                    pending,
                    self.timestamp,
                    base_sold,
                    base_asset_id,
                    0,
                    &ClaimCondition::Signature { owner: bid.key.owner },
                )?;

                collateral_left -= base_sold;
                debt_due -= quote_received;
                repaid += quote_received;

                self.market_transactions.push(MarketTransaction {
                    bid_owner: bid.key.owner,
                    ask_owner: key.owner,
                    bid_price: bid.effective,
                    ask_price: bid.effective,
                    quote_paid: AssetAmount::new(quote_received, quote_asset_id),
                    base_received: AssetAmount::new(base_sold, base_asset_id),
                    fees_collected: 0,
                });
            }

            let principal_paid = repaid.min(principal);
            let interest_paid = repaid - principal_paid;
            fees_total += interest_paid;

            let mut asset = pending
                .get_asset(quote_asset_id)?
                .ok_or(TransactionError::UnknownAsset(quote_asset_id))?;

            if debt_due <= 0 {
                // Fully settled; leftover collateral returns to the owner.
                asset.current_supply -= principal_paid;
                pending.store_asset(asset);
                if collateral_left > 0 {
                    deposit_into(
                        pending,
                        self.timestamp,
                        collateral_left,
                        base_asset_id,
                        0,
                        &ClaimCondition::Signature { owner: key.owner },
                    )?;
                }
                pending.store_collateral(key, None);
            } else if collateral_left <= 0 {
                // Collateral exhausted: forced settlement writes off the
                // remaining principal.
                debug!(
                    target: "market",
                    owner = %key.owner,
                    remaining = debt_due,
                    "forced settlement of undercollateralized position"
                );
                asset.current_supply -= principal;
                pending.store_asset(asset);
                pending.store_collateral(key, None);
            } else {
                // Bid depth exhausted: keep the position, principal reduced
                // by what was repaid, and retry next execution.
                asset.current_supply -= principal_paid;
                pending.store_asset(asset);
                let mut updated = position;
                updated.collateral_balance = collateral_left;
                updated.payoff_balance = principal - principal_paid;
                pending.store_collateral(key, Some(updated));
            }
        }
        Ok(fees_total)
    }

    /// Collects the bid side, best price first. Relative bids re-price
    /// against the feed and are skipped when no feed has formed.
    fn collect_bid_side(
        &self,
        pending: &PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        feed: Option<Price>,
    ) -> ChainResult<Vec<SideEntry>> {
        let mut entries = Vec::new();
        for (key, record) in pending.market_orders(OrderKind::Bid, quote_asset_id, base_asset_id)? {
            entries.push(SideEntry { kind: OrderKind::Bid, key, record, effective: key.order_price });
        }
        if let Some(feed) = feed {
            for (key, record) in
                pending.market_orders(OrderKind::RelativeBid, quote_asset_id, base_asset_id)?
            {
                entries.push(SideEntry {
                    kind: OrderKind::RelativeBid,
                    key,
                    record,
                    effective: reprice_relative(key.order_price, feed),
                });
            }
        }
        entries.sort_by(|a, b| {
            b.effective
                .ratio
                .cmp(&a.effective.ratio)
                .then_with(|| a.key.owner.cmp(&b.key.owner))
                .then_with(|| a.key.expiration.cmp(&b.key.expiration))
        });
        Ok(entries)
    }

    /// Collects the ask side, best price first. Shorts join at the feed call
    /// price, ahead of equally priced asks.
    fn collect_ask_side(
        &self,
        pending: &PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        feed: Option<Price>,
        include_shorts: bool,
    ) -> ChainResult<Vec<SideEntry>> {
        let mut entries = Vec::new();
        for (key, record) in pending.market_orders(OrderKind::Ask, quote_asset_id, base_asset_id)? {
            entries.push(SideEntry { kind: OrderKind::Ask, key, record, effective: key.order_price });
        }
        if let Some(feed) = feed {
            for (key, record) in
                pending.market_orders(OrderKind::RelativeAsk, quote_asset_id, base_asset_id)?
            {
                entries.push(SideEntry {
                    kind: OrderKind::RelativeAsk,
                    key,
                    record,
                    effective: reprice_relative(key.order_price, feed),
                });
            }
            if include_shorts {
                // Shorts sort by descending offered interest rate, encoded
                // in their key's ratio.
                let mut shorts: Vec<(MarketIndexKey, OrderRecord)> =
                    pending.market_orders(OrderKind::Short, quote_asset_id, base_asset_id)?;
                shorts.sort_by(|a, b| {
                    b.0.order_price
                        .ratio
                        .cmp(&a.0.order_price.ratio)
                        .then_with(|| a.0.owner.cmp(&b.0.owner))
                });
                for (key, record) in shorts {
                    entries.push(SideEntry { kind: OrderKind::Short, key, record, effective: feed });
                }
            }
        }
        entries.sort_by(|a, b| {
            a.effective
                .ratio
                .cmp(&b.effective.ratio)
                .then_with(|| ask_kind_rank(a.kind).cmp(&ask_kind_rank(b.kind)))
                .then_with(|| a.key.owner.cmp(&b.key.owner))
                .then_with(|| a.key.expiration.cmp(&b.key.expiration))
        });
        Ok(entries)
    }

    /// The median of active delegates' fresh feeds, if enough exist.
    fn median_feed(
        &self,
        pending: &PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<Price>> {
        let active = pending.get_active_delegates()?;
        median_delegate_price(
            pending,
            self.config,
            &active,
            self.timestamp,
            quote_asset_id,
            base_asset_id,
        )
    }

    /// Appends this pass to the market history at every granularity.
    #[allow(clippy::too_many_arguments)]
    fn record_market_history(
        &self,
        pending: &mut PendingState<'_>,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
        best_bid: Option<Price>,
        lowest_ask: Option<Price>,
        first_trade: Option<Price>,
        last_trade: Option<Price>,
        volume: ShareAmount,
    ) -> ChainResult<()> {
        for granularity in TimeGranularity::ALL {
            let key = MarketHistoryKey {
                quote_asset_id,
                base_asset_id,
                granularity,
                timestamp: granularity.bucket_start(self.timestamp),
            };
            let mut record = pending.get_market_history(&key)?.unwrap_or(MarketHistoryRecord {
                highest_bid: best_bid.unwrap_or_default(),
                lowest_ask: lowest_ask.unwrap_or_default(),
                opening_price: first_trade.unwrap_or_default(),
                closing_price: last_trade.unwrap_or_default(),
                volume: 0,
            });
            if let Some(bid) = best_bid {
                if bid.ratio > record.highest_bid.ratio || record.volume == 0 {
                    record.highest_bid = bid;
                }
            }
            if let Some(ask) = lowest_ask {
                if ask.ratio < record.lowest_ask.ratio || record.volume == 0 {
                    record.lowest_ask = ask;
                }
            }
            if record.volume == 0 {
                if let Some(open) = first_trade {
                    record.opening_price = open;
                }
            }
            if let Some(close) = last_trade {
                record.closing_price = close;
            }
            record.volume += volume;
            pending.store_market_history(key, record);
        }
        Ok(())
    }
}

/// Executes the pre-fork market pass: absolute orders only, no feeds, no
/// shorts, no interest.
pub(crate) fn execute_markets_v1(
    config: &ChainConfig,
    timestamp: Timestamp,
    pending: &mut PendingState<'_>,
    quote_asset_id: AssetId,
    base_asset_id: AssetId,
) -> ChainResult<Vec<MarketTransaction>> {
    let mut engine = MarketEngine::new(config, timestamp, false);
    // The v1 pass never saw feeds, so relative orders and shorts are inert.
    let mut bids = engine.collect_bid_side(pending, quote_asset_id, base_asset_id, None)?;
    let mut asks = engine.collect_ask_side(pending, quote_asset_id, base_asset_id, None, false)?;

    let mut bid_pos = 0usize;
    let mut ask_pos = 0usize;
    while bid_pos < bids.len() && ask_pos < asks.len() {
        let bid_remaining = bids[bid_pos].base_remaining();
        if bid_remaining <= 0 {
            engine.cancel_dust(pending, &mut bids[bid_pos])?;
            bid_pos += 1;
            continue;
        }
        let ask_remaining = asks[ask_pos].base_remaining();
        if ask_remaining <= 0 {
            engine.cancel_dust(pending, &mut asks[ask_pos])?;
            ask_pos += 1;
            continue;
        }
        let bid = bids[bid_pos].clone();
        let ask = asks[ask_pos].clone();
        if bid.effective.ratio < ask.effective.ratio {
            break;
        }

        let base_fill = bid_remaining.min(ask_remaining);
        let quote_paid = bid.effective.quote_for_base(base_fill);
        let quote_received = ask.effective.quote_for_base(base_fill);

        bids[bid_pos].record.balance -= quote_paid;
        let updated_bid = bids[bid_pos].record;
        pending.store_order(bid.kind, bid.key, Some(updated_bid));
        asks[ask_pos].record.balance -= base_fill;
        let updated_ask = asks[ask_pos].record;
        pending.store_order(ask.kind, ask.key, Some(updated_ask));

        deposit_into(
            pending,
            timestamp,
            base_fill,
            base_asset_id,
            0,
            &ClaimCondition::Signature { owner: bid.key.owner },
        )?;
        deposit_into(
            pending,
            timestamp,
            quote_received,
            quote_asset_id,
            0,
            &ClaimCondition::Signature { owner: ask.key.owner },
        )?;

        engine.market_transactions.push(MarketTransaction {
            bid_owner: bid.key.owner,
            ask_owner: ask.key.owner,
            bid_price: bid.effective,
            ask_price: ask.effective,
            quote_paid: AssetAmount::new(quote_paid, quote_asset_id),
            base_received: AssetAmount::new(base_fill, base_asset_id),
            fees_collected: quote_paid - quote_received,
        });
    }
    Ok(engine.market_transactions)
}

/// Re-prices a relative order: its key ratio is a multiplier on the feed.
fn reprice_relative(relative: Price, feed: Price) -> Price {
    Price {
        ratio: relative.ratio * feed.ratio / calder_primitives::PRICE_ONE,
        quote_asset_id: relative.quote_asset_id,
        base_asset_id: relative.base_asset_id,
    }
}

/// Shorts first among equally priced ask-side entries.
fn ask_kind_rank(kind: OrderKind) -> u8 {
    match kind {
        OrderKind::Short => 0,
        OrderKind::Ask => 1,
        OrderKind::RelativeAsk => 2,
        _ => 3,
    }
}

/// The median of active delegates' fresh feeds, for queries outside a
/// market pass.
pub(crate) fn median_delegate_price(
    state: &dyn ChainRead,
    config: &ChainConfig,
    active_delegates: &[AccountId],
    now: Timestamp,
    quote_asset_id: AssetId,
    base_asset_id: AssetId,
) -> ChainResult<Option<Price>> {
    let mut ratios: Vec<u128> = Vec::new();
    for record in state.get_feeds_for_asset(quote_asset_id)? {
        if !active_delegates.contains(&record.index.delegate_id) {
            continue;
        }
        if record.last_update + config.max_feed_age_secs <= now {
            continue;
        }
        if record.value.is_pair(quote_asset_id, base_asset_id) {
            ratios.push(record.value.ratio);
        }
    }
    if ratios.len() < config.min_feeds {
        return Ok(None);
    }
    ratios.sort_unstable();
    Ok(Some(Price { ratio: ratios[ratios.len() / 2], quote_asset_id, base_asset_id }))
}
