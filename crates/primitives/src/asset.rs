//! Asset records.

use crate::{AccountId, AssetId, ShareAmount, Timestamp};
use serde::{Deserialize, Serialize};

/// Who may issue new supply of an asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetIssuer {
    /// A user asset issued by the named account.
    Account(AccountId),
    /// A market-issued asset whose supply is created by short positions.
    Market,
}

impl AssetIssuer {
    /// `true` for market-issued assets.
    pub const fn is_market(&self) -> bool {
        matches!(self, AssetIssuer::Market)
    }
}

/// A registered asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Compact identifier; the base asset is id `0`.
    pub id: AssetId,
    /// Globally unique ticker symbol.
    pub symbol: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Issuer, or the market for feed-priced assets.
    pub issuer: AssetIssuer,
    /// Base units per whole display unit.
    pub precision: u64,
    /// When the asset was registered.
    pub registration_date: Timestamp,
    /// When the asset was last modified.
    pub last_update: Timestamp,
    /// Outstanding supply, in base units. Always within
    /// `0..=maximum_supply`.
    pub current_supply: ShareAmount,
    /// Hard supply cap, in base units.
    pub maximum_supply: ShareAmount,
    /// Fees collected in this asset and not yet released.
    pub collected_fees: ShareAmount,
    /// Issuer-set behaviour flags.
    pub flags: u32,
    /// Flags the issuer may still enable.
    pub issuer_permissions: u32,
}

impl AssetRecord {
    /// `true` for market-issued assets.
    pub fn is_market_issued(&self) -> bool {
        self.issuer.is_market()
    }

    /// Whole display units for a base-unit amount, with the fractional rest.
    pub fn to_display(&self, amount: ShareAmount) -> (i64, u64) {
        let precision = self.precision.max(1) as i64;
        (amount / precision, amount.rem_euclid(precision) as u64)
    }
}
