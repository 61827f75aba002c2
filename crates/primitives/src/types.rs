//! Identifier aliases, share amounts and fixed-point prices.

use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// Compact account identifier assigned in registration order.
pub type AccountId = u32;

/// Compact asset identifier; the base asset is always id `0`.
pub type AssetId = u32;

/// Identifier of a delegate vote slate, derived from its digest.
pub type SlateId = u64;

/// Height of a block in the chain; genesis content applies at height `0`.
pub type BlockNumber = u32;

/// A signed share count in an asset's base units.
pub type ShareAmount = i64;

/// Fixed-point scale of [`Price`] ratios: one whole quote-unit-per-base-unit.
pub const PRICE_ONE: u128 = 1_000_000_000_000;

/// An amount of a specific asset, in base units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetAmount {
    /// Amount in the asset's base units.
    pub amount: ShareAmount,
    /// The asset the amount is denominated in.
    pub asset_id: AssetId,
}

impl AssetAmount {
    /// A new amount of `asset_id`.
    pub const fn new(amount: ShareAmount, asset_id: AssetId) -> Self {
        Self { amount, asset_id }
    }
}

impl fmt::Display for AssetAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.amount, self.asset_id)
    }
}

/// An exchange rate between a quote and a base asset.
///
/// The ratio is quote base-units per base base-unit, scaled by [`PRICE_ONE`].
/// Ordering compares the market pair first and the ratio second, which is the
/// sort order of all market order indexes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    /// Fixed-point ratio scaled by [`PRICE_ONE`].
    pub ratio: u128,
    /// The asset being paid.
    pub quote_asset_id: AssetId,
    /// The asset being bought or sold.
    pub base_asset_id: AssetId,
}

impl Price {
    /// The zero price of a pair, the lower bound of its order-book range.
    pub const fn pair_floor(quote_asset_id: AssetId, base_asset_id: AssetId) -> Self {
        Self { ratio: 0, quote_asset_id, base_asset_id }
    }

    /// A price expressed as a quote/base ratio of base-unit amounts.
    pub fn from_amounts(
        quote_amount: ShareAmount,
        base_amount: ShareAmount,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> Self {
        debug_assert!(base_amount > 0);
        let ratio = (quote_amount as u128) * PRICE_ONE / (base_amount as u128);
        Self { ratio, quote_asset_id, base_asset_id }
    }

    /// `true` when quote and base ids match this price's pair.
    pub const fn is_pair(&self, quote_asset_id: AssetId, base_asset_id: AssetId) -> bool {
        self.quote_asset_id == quote_asset_id && self.base_asset_id == base_asset_id
    }

    /// The quote amount bought by `base` base-units at this price, truncating.
    pub fn quote_for_base(&self, base: ShareAmount) -> ShareAmount {
        ((base as u128) * self.ratio / PRICE_ONE) as ShareAmount
    }

    /// The base amount `quote` quote-units pay for at this price, truncating.
    pub fn base_for_quote(&self, quote: ShareAmount) -> ShareAmount {
        if self.ratio == 0 {
            return 0;
        }
        ((quote as u128) * PRICE_ONE / self.ratio) as ShareAmount
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.quote_asset_id, self.base_asset_id, self.ratio).cmp(&(
            other.quote_asset_id,
            other.base_asset_id,
            other.ratio,
        ))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.ratio / PRICE_ONE;
        let frac = self.ratio % PRICE_ONE;
        write!(f, "{whole}.{frac:012} {}/{}", self.quote_asset_id, self.base_asset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_conversions_truncate() {
        // 2.9 quote units per base unit.
        let price = Price::from_amounts(29, 10, 1, 0);
        assert_eq!(price.quote_for_base(100), 290);
        assert_eq!(price.base_for_quote(290), 100);
        assert_eq!(price.quote_for_base(1), 2);
    }

    #[test]
    fn price_orders_within_pair() {
        let low = Price::from_amounts(1, 1, 1, 0);
        let high = Price::from_amounts(3, 1, 1, 0);
        assert!(low < high);

        // Pair dominates ratio so order books stay contiguous.
        let other_pair = Price::from_amounts(1, 100, 2, 0);
        assert!(other_pair > high);
    }
}
