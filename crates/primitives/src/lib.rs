#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Commonly used types for the calder chain state engine.
//!
//! This crate defines the value types shared by every other crate in the
//! workspace: hashes and identifiers, amounts and prices, the record types
//! persisted by the chain state (accounts, assets, balances, blocks,
//! transactions, market orders, feeds, slots), the bit-exact wire packing
//! used for digests, and the genesis description.

mod hash;
pub use hash::{Hash160, Hash256};

pub mod crypto;
pub use crypto::{Address, PublicKey, Signature};

pub mod time;
pub use time::{Clock, Timestamp};

mod types;
pub use types::{
    AccountId, AssetAmount, AssetId, BlockNumber, Price, ShareAmount, SlateId, PRICE_ONE,
};

pub mod config;
pub use config::ChainConfig;

mod account;
pub use account::{slate_id, AccountRecord, DelegateStats, SlateEntry, VoteIndexEntry};

mod asset;
pub use asset::{AssetIssuer, AssetRecord};

mod balance;
pub use balance::{BalanceId, BalanceRecord, ClaimCondition, SnapshotRecord, WithdrawCondition};

mod transaction;
pub use transaction::{
    BurnRecord, Operation, SignedTransaction, Transaction, TransactionId, TransactionLocation,
    TransactionRecord,
};

mod block;
pub use block::{
    hash_secret, BlockForkData, BlockHeader, BlockId, BlockRecord, FullBlock, SecretHash,
    SignedBlockHeader,
};

mod delta;
pub use delta::StateDelta;

pub mod market;
pub use market::{
    BlockMarketTransactions, CollateralRecord, MarketHistoryKey, MarketHistoryRecord,
    MarketIndexKey, MarketStatus, MarketTransaction, OrderKind, OrderRecord, TimeGranularity,
};

mod feed;
pub use feed::{FeedIndex, FeedRecord, SlotRecord};

mod genesis;
pub use genesis::{
    convert_raw_address, GenesisAsset, GenesisBalance, GenesisDelegate, GenesisState,
    GenesisVesting,
};

mod property;
pub use property::{ChainProperty, PropertyValue};

pub mod packing;

/// The digest identifying a chain, derived from its packed genesis state.
pub type ChainId = Hash256;

/// The rolling seed mixed from revealed delegate secrets.
pub type RandomSeed = Hash160;
