//! Market order records, market transactions, status and history.

use crate::{Address, AssetAmount, AssetId, BlockNumber, Price, ShareAmount, Timestamp};
use serde::{Deserialize, Serialize};

/// Which order book a record rests in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    /// Absolute-priced bid.
    Bid,
    /// Absolute-priced ask.
    Ask,
    /// Feed-relative bid.
    RelativeBid,
    /// Feed-relative ask.
    RelativeAsk,
    /// Short offer.
    Short,
    /// Open collateral (cover) position.
    Cover,
}

/// Composite key of every order index: sorted by price, then owner, then
/// expiration, which is also the matching tie-break order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MarketIndexKey {
    /// The order's limit price; its pair selects the book range.
    pub order_price: Price,
    /// The order owner.
    pub owner: Address,
    /// Expiration component; zero for non-expiring orders.
    pub expiration: Timestamp,
}

impl MarketIndexKey {
    /// A key for `owner`'s order at `price` with no expiration.
    pub fn new(order_price: Price, owner: Address) -> Self {
        Self { order_price, owner, expiration: Timestamp(0) }
    }

    /// The market pair of this key.
    pub fn pair(&self) -> (AssetId, AssetId) {
        (self.order_price.quote_asset_id, self.order_price.base_asset_id)
    }
}

/// A resting bid, ask or short order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// The escrowed balance: quote units for bids, base units for asks and
    /// shorts.
    pub balance: ShareAmount,
    /// For shorts, the annual interest rate offered in parts per million.
    pub interest_rate_ppm: u32,
}

impl OrderRecord {
    /// An order escrowing `balance`.
    pub fn new(balance: ShareAmount) -> Self {
        Self { balance, interest_rate_ppm: 0 }
    }

    /// `true` once the escrow is exhausted; the record is then removed.
    pub fn is_null(&self) -> bool {
        self.balance <= 0
    }
}

/// An open short position: debt plus locked collateral.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralRecord {
    /// Locked base-asset collateral.
    pub collateral_balance: ShareAmount,
    /// Outstanding debt in the quote asset.
    pub payoff_balance: ShareAmount,
    /// Annual interest rate, in parts per million.
    pub interest_rate_ppm: u32,
    /// When the position must be settled.
    pub expiration: Timestamp,
}

impl CollateralRecord {
    /// `true` once the debt is repaid; the record is then removed.
    pub fn is_null(&self) -> bool {
        self.payoff_balance <= 0
    }

    /// Interest owed on `principal` at `rate_ppm` after `age_secs`.
    pub fn interest_owed(
        principal: ShareAmount,
        rate_ppm: u32,
        age_secs: u32,
    ) -> ShareAmount {
        const SECS_PER_YEAR: i128 = 365 * 24 * 60 * 60;
        (principal as i128 * rate_ppm as i128 * age_secs as i128
            / (1_000_000 * SECS_PER_YEAR)) as ShareAmount
    }
}

/// One fill produced by the market engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTransaction {
    /// The bid side owner.
    pub bid_owner: Address,
    /// The ask side owner.
    pub ask_owner: Address,
    /// The bid's limit price, which the trade executes at.
    pub bid_price: Price,
    /// The ask's limit price.
    pub ask_price: Price,
    /// Quote amount the bid paid.
    pub quote_paid: AssetAmount,
    /// Base amount the bid received.
    pub base_received: AssetAmount,
    /// The spread collected as fees, in the quote asset.
    pub fees_collected: ShareAmount,
}

/// Rolling status of one market pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
    /// The quote asset.
    pub quote_asset_id: AssetId,
    /// The base asset.
    pub base_asset_id: AssetId,
    /// The median feed at the last execution, if one formed.
    pub current_feed_price: Option<Price>,
    /// The last median feed that ever formed.
    pub last_valid_feed_price: Option<Price>,
    /// The error that aborted the last execution, if any.
    pub last_error: Option<String>,
}

/// Aggregation buckets of market history.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TimeGranularity {
    /// Per-slot buckets.
    Second,
    /// Per-minute buckets.
    Minute,
    /// Per-hour buckets.
    Hour,
    /// Per-day buckets.
    Day,
}

impl TimeGranularity {
    /// All granularities recorded per execution.
    pub const ALL: [TimeGranularity; 4] = [
        TimeGranularity::Second,
        TimeGranularity::Minute,
        TimeGranularity::Hour,
        TimeGranularity::Day,
    ];

    /// Bucket width in seconds.
    pub const fn bucket_secs(&self) -> u32 {
        match self {
            TimeGranularity::Second => 1,
            TimeGranularity::Minute => 60,
            TimeGranularity::Hour => 60 * 60,
            TimeGranularity::Day => 24 * 60 * 60,
        }
    }

    /// The bucket start for `time`.
    pub const fn bucket_start(&self, time: Timestamp) -> Timestamp {
        time.slot_start(self.bucket_secs())
    }
}

/// Key of the market history index.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MarketHistoryKey {
    /// The quote asset.
    pub quote_asset_id: AssetId,
    /// The base asset.
    pub base_asset_id: AssetId,
    /// Bucket granularity.
    pub granularity: TimeGranularity,
    /// Bucket start time.
    pub timestamp: Timestamp,
}

/// One OHLC-style bucket of market history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketHistoryRecord {
    /// Highest bid price seen in the bucket.
    pub highest_bid: Price,
    /// Lowest ask price seen in the bucket.
    pub lowest_ask: Price,
    /// First trade price in the bucket.
    pub opening_price: Price,
    /// Last trade price in the bucket.
    pub closing_price: Price,
    /// Base-asset volume traded in the bucket.
    pub volume: ShareAmount,
}

/// Market transactions of one block, stored when statistics are tracked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMarketTransactions {
    /// The block the fills happened in.
    pub block_num: BlockNumber,
    /// The fills, in execution order.
    pub transactions: Vec<MarketTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_keys_sort_by_price_then_owner_then_expiration() {
        let pair = |ratio: u128| Price { ratio, quote_asset_id: 1, base_asset_id: 0 };
        let a = MarketIndexKey {
            order_price: pair(10),
            owner: Address::default(),
            expiration: Timestamp(0),
        };
        let b = MarketIndexKey {
            order_price: pair(10),
            owner: Address(crate::Hash160([1; 20])),
            expiration: Timestamp(0),
        };
        let c = MarketIndexKey {
            order_price: pair(20),
            owner: Address::default(),
            expiration: Timestamp(0),
        };
        let mut keys = [c, b, a];
        keys.sort();
        assert_eq!(keys, [a, b, c]);
    }

    #[test]
    fn interest_accrues_pro_rata() {
        // 10% APR over half a year on 1_000_000 units.
        let owed = CollateralRecord::interest_owed(1_000_000, 100_000, 365 * 24 * 60 * 60 / 2);
        assert_eq!(owed, 50_000);
        assert_eq!(CollateralRecord::interest_owed(1_000_000, 100_000, 0), 0);
    }

    #[test]
    fn history_buckets_align() {
        let g = TimeGranularity::Hour;
        assert_eq!(g.bucket_start(Timestamp(7_250)), Timestamp(7_200));
    }
}
