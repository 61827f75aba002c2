//! Chain-wide consensus parameters.

use crate::{ShareAmount, Timestamp};
use serde::{Deserialize, Serialize};

/// Seconds in a production slot.
pub const DEFAULT_BLOCK_INTERVAL_SECS: u32 = 10;

/// Blocks per day at the default slot interval.
pub const DEFAULT_BLOCKS_PER_DAY: u32 = 24 * 60 * 60 / DEFAULT_BLOCK_INTERVAL_SECS;

/// Version stamp of the on-disk index layout. Bumping it forces a reindex on
/// the next open.
pub const DATABASE_VERSION: i64 = 3;

/// Consensus parameters fixed at genesis.
///
/// The original implementation bakes these into compile-time defines; they
/// are carried as a value here so tests can run a small five-delegate chain
/// while production uses [`ChainConfig::default`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Number of active delegates per round.
    pub num_delegates: usize,
    /// Length of a production slot in seconds.
    pub block_interval_secs: u32,
    /// Maximum number of undo states retained; forks deeper than this are
    /// rejected.
    pub max_undo_history: u32,
    /// Base relay fee required of pending transactions, in base-asset units.
    pub relay_fee: ShareAmount,
    /// Pool size above which the relay fee backs off quadratically.
    pub max_pending_queue_size: usize,
    /// Base-asset shares a delegate may mint per produced block at a 100%
    /// pay rate.
    pub max_delegate_pay_per_block: ShareAmount,
    /// Fee burned into the collected-fee pool when registering a new asset.
    pub asset_registration_fee: ShareAmount,
    /// Display precision of the base asset (base units per whole unit).
    pub base_precision: u64,
    /// Ticker symbol of the base asset.
    pub base_symbol: String,
    /// Display name of the base asset.
    pub base_name: String,
    /// Maximum base-asset shares that may ever exist.
    pub max_shares: ShareAmount,
    /// Longest lifetime of a short position, in seconds.
    pub max_short_period_secs: u32,
    /// Minimum number of qualifying feeds for a median price to form.
    pub min_feeds: usize,
    /// Maximum age of a feed before it stops counting toward the median.
    pub max_feed_age_secs: u32,
}

impl ChainConfig {
    /// Blocks per day at this chain's slot interval.
    pub const fn blocks_per_day(&self) -> u32 {
        24 * 60 * 60 / self.block_interval_secs
    }

    /// Upper clamp of the required-confirmation count.
    pub const fn max_required_confirmations(&self) -> u64 {
        3 * self.num_delegates as u64
    }

    /// The start of the slot that should be produced at or after `now`.
    pub const fn next_slot_start(&self, now: Timestamp) -> Timestamp {
        let start = now.slot_start(self.block_interval_secs);
        if start.0 <= now.0 {
            Timestamp(start.0 + self.block_interval_secs)
        } else {
            start
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            num_delegates: 101,
            block_interval_secs: DEFAULT_BLOCK_INTERVAL_SECS,
            max_undo_history: DEFAULT_BLOCKS_PER_DAY,
            relay_fee: 10_000,
            max_pending_queue_size: 10_000,
            max_delegate_pay_per_block: 5_000_000,
            asset_registration_fee: 50_000_000_000,
            base_precision: 100_000,
            base_symbol: "XTS".into(),
            base_name: "calder test shares".into(),
            max_shares: 2_000_000_000_000_000,
            max_short_period_secs: 365 * 24 * 60 * 60,
            min_feeds: 1,
            max_feed_age_secs: 24 * 60 * 60,
        }
    }
}
