#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! The chain state engine of a delegated-proof-of-stake blockchain.
//!
//! [`ChainDatabase`] ingests candidate blocks, maintains a fork tree of
//! everything it has seen, validates and applies blocks against a persistent
//! indexed state, reorganises onto the longest validated fork within the
//! undo horizon, and runs a built-in double-auction market at every block.
//! It also maintains the pending transaction pool and assembles candidate
//! blocks for a producing delegate.
//!
//! The engine's critical path (block push, reorg, block application) never
//! yields; observers and pending-pool revalidation run on a background
//! worker after the critical path releases.

mod error;
pub use error::{
    ChainError, ChainResult, ForkTreeError, GenesisError, HeaderError, TransactionError,
};

pub mod state;
pub use state::{ChainRead, ChainReadExt, PendingState};

mod evaluator;
pub use evaluator::{EvaluationFlags, TransactionEvaluationState, TransactionEvaluator};

mod market;

mod fork_db;
pub use fork_db::ForkDatabase;

mod chain;
pub use chain::ChainDatabase;

mod processor;

mod pool;

mod producer;
pub use producer::{BlockTemplate, DelegateConfig};

pub mod genesis;
pub use genesis::GenesisSource;

mod queries;
pub use queries::ForkEntry;

pub mod checkpoints;

mod observer;
pub use observer::{
    BlockSummary, ChainNotification, ChainNotificationSender, ChainNotifications, ChainObserver,
};

mod tasks;
pub use tasks::{BackgroundWorker, TaskSpawner};
