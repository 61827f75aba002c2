//! Observer callbacks and canonical state notifications.
//!
//! Observers never run inside the engine's critical sections: callbacks are
//! enqueued on the background worker with a snapshot of what happened, and
//! subscribers of the broadcast channel receive the same snapshots.

use calder_primitives::{FullBlock, StateDelta};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Snapshot handed to observers after a block extends the chain.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    /// The applied block.
    pub block: FullBlock,
    /// The state changes the block committed.
    pub applied_changes: StateDelta,
}

/// A chain observer. Callbacks are delivered from background tasks, never
/// while the chain is in an intermediate state.
pub trait ChainObserver: Send + Sync {
    /// A block was applied to the main chain.
    fn block_applied(&self, summary: &BlockSummary);

    /// The head moved backwards; `undo` is the delta that was applied.
    fn state_changed(&self, undo: &StateDelta);
}

/// A notification mirrored onto the broadcast channel.
#[derive(Debug, Clone)]
pub enum ChainNotification {
    /// A block was applied.
    BlockApplied(Arc<BlockSummary>),
    /// A block was popped; carries the applied undo delta.
    StateChanged(Arc<StateDelta>),
}

/// Sender half of the chain notification channel.
pub type ChainNotificationSender = broadcast::Sender<ChainNotification>;

/// Receiver half of the chain notification channel.
pub type ChainNotifications = broadcast::Receiver<ChainNotification>;

/// Capacity of the notification channel; slow receivers observe a lag error
/// rather than blocking the engine.
pub(crate) const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;
