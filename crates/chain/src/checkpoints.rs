//! Hard-coded checkpoints and hard-fork activation heights.
//!
//! Checkpoints pin a block id at a height: signee recovery is skipped below
//! the last checkpoint, and a block arriving at a pinned height must match.
//! Hard forks are named activation heights; the pre-fork behaviour of each
//! rule is preserved as a `_v1` strategy selected by head block number.

use calder_primitives::{BlockId, BlockNumber};

/// Pinned `(height, id)` pairs, ascending by height.
pub const CHECKPOINTS: &[(BlockNumber, BlockId)] = &[];

/// The height of the last checkpoint, or zero when there are none.
pub fn last_checkpoint_num() -> BlockNumber {
    CHECKPOINTS.last().map(|(num, _)| *num).unwrap_or(0)
}

/// The pinned id at `block_num`, if that height is checkpointed.
pub fn checkpoint_id(block_num: BlockNumber) -> Option<BlockId> {
    CHECKPOINTS
        .binary_search_by_key(&block_num, |(num, _)| *num)
        .ok()
        .map(|idx| CHECKPOINTS[idx].1)
}

/// Blocks below this height apply transactions before executing markets;
/// from this height on, markets execute first.
pub const MARKETS_BEFORE_TRANSACTIONS_FORK: BlockNumber = 0;

/// Blocks below this height pay delegates with the v1 rule (pay is minted
/// in full, the fee pool is untouched).
pub const DELEGATE_PAY_V2_FORK: BlockNumber = 0;

/// Blocks below this height run the v1 market engine (absolute orders only,
/// no interest accrual).
pub const MARKET_ENGINE_V2_FORK: BlockNumber = 0;

/// Heights at which every asset's supply is recomputed by exhaustive scan
/// and its collected fees reconciled against market debt.
pub const SUPPLY_RECALCULATION_FORKS: &[BlockNumber] = &[];

/// Height at which every delegate's pay rate is reset, with the new rate.
pub const PAY_RATE_RESET_FORK: Option<(BlockNumber, u8)> = None;
