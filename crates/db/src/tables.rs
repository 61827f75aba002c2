//! The table catalog of the chain state engine.
//!
//! Table names double as on-disk tree names; the split between the `index/`
//! environment (rebuildable from the raw chain) and `raw_chain/` (the block
//! archive) is the caller's concern.

use crate::Table;
use calder_primitives::{
    AccountId, AccountRecord, Address, AssetId, AssetRecord, BalanceId, BalanceRecord,
    BlockForkData, BlockId, BlockNumber, BlockRecord, BurnRecord, ChainProperty,
    CollateralRecord, FeedIndex, FeedRecord, FullBlock, MarketHistoryKey, MarketHistoryRecord,
    MarketIndexKey, MarketStatus, MarketTransaction, OrderRecord, PropertyValue, SignedTransaction,
    SlateEntry, SlateId, SlotRecord, StateDelta, Timestamp, TransactionId, TransactionRecord,
};

macro_rules! table {
    ($(#[$doc:meta])* $name:ident: $key:ty => $value:ty, $tree:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Table for $name {
            const NAME: &'static str = $tree;
            type Key = $key;
            type Value = $value;
        }
    };
}

// --- raw_chain/ ---

table!(
    /// Full block bodies by id. The only table the whole index can be rebuilt
    /// from.
    BlockData: BlockId => FullBlock, "block_id_to_block_data_db"
);

table!(
    /// Snapshot of block bodies taken at the start of a reindex.
    BlockDataOrig: BlockId => FullBlock, "id_to_data_orig"
);

table!(
    /// Main-chain block ids by height.
    BlockNumToId: BlockNumber => BlockId, "block_num_to_id_db"
);

// --- index/ ---

table!(
    /// The singleton chain property map.
    Properties: ChainProperty => PropertyValue, "property_db"
);

table!(
    /// Fork-tree nodes by block id.
    ForkData: BlockId => BlockForkData, "fork_db"
);

table!(
    /// All known block ids per height, including sidechains.
    ForkNumber: BlockNumber => Vec<BlockId>, "fork_number_db"
);

table!(
    /// Undo deltas of the most recent main-chain blocks.
    UndoStates: BlockId => StateDelta, "block_id_to_undo_state"
);

table!(
    /// Stored block records by id.
    BlockRecords: BlockId => BlockRecord, "block_id_to_block_record_db"
);

table!(
    /// Blocks quarantined with a future timestamp, retried later.
    FutureBlocks: BlockId => (), "future_blocks_db"
);

table!(
    /// Account records by id.
    Accounts: AccountId => AccountRecord, "account_id_to_record"
);

table!(
    /// Account ids by unique name.
    AccountNameToId: String => AccountId, "account_name_to_id"
);

table!(
    /// Account ids by owner address.
    AccountAddressToId: Address => AccountId, "account_address_to_id"
);

table!(
    /// Asset records by id.
    Assets: AssetId => AssetRecord, "asset_id_to_record"
);

table!(
    /// Asset ids by unique symbol.
    AssetSymbolToId: String => AssetId, "asset_symbol_to_id"
);

table!(
    /// Non-empty balance records by id.
    Balances: BalanceId => BalanceRecord, "balance_id_to_record"
);

table!(
    /// Empty balance records, split out so the main index stays dense.
    EmptyBalances: BalanceId => BalanceRecord, "empty_balance_id_to_record"
);

table!(
    /// Included transaction records by id.
    Transactions: TransactionId => TransactionRecord, "id_to_transaction_record_db"
);

table!(
    /// The persistent half of the pending transaction pool.
    PendingTransactions: TransactionId => SignedTransaction, "pending_transaction_db"
);

table!(
    /// Transaction ids by involved address, kept when statistics are on.
    AddressTransactions: (Address, TransactionId) => (), "address_to_trx_db"
);

table!(
    /// Burn records by (account, transaction), kept when statistics are on.
    Burns: (AccountId, TransactionId) => BurnRecord, "burn_db"
);

table!(
    /// Delegate vote slates by id.
    Slates: SlateId => SlateEntry, "slate_db"
);

table!(
    /// Production slot records, kept when statistics are on.
    Slots: Timestamp => SlotRecord, "slot_record_db"
);

table!(
    /// Published price feeds.
    Feeds: FeedIndex => FeedRecord, "feed_index_to_record"
);

table!(
    /// Absolute bid orders, sorted by (price, owner, expiration).
    Bids: MarketIndexKey => OrderRecord, "bid_db"
);

table!(
    /// Absolute ask orders, sorted by (price, owner, expiration).
    Asks: MarketIndexKey => OrderRecord, "ask_db"
);

table!(
    /// Feed-relative bid orders.
    RelativeBids: MarketIndexKey => OrderRecord, "relative_bid_db"
);

table!(
    /// Feed-relative ask orders.
    RelativeAsks: MarketIndexKey => OrderRecord, "relative_ask_db"
);

table!(
    /// Short offers.
    Shorts: MarketIndexKey => OrderRecord, "short_db"
);

table!(
    /// Open collateral positions.
    Collateral: MarketIndexKey => CollateralRecord, "collateral_db"
);

table!(
    /// Rolling per-pair market status.
    MarketStatuses: (AssetId, AssetId) => MarketStatus, "market_status_db"
);

table!(
    /// Market history buckets, kept when statistics are on.
    MarketHistory: MarketHistoryKey => MarketHistoryRecord, "market_history_db"
);

table!(
    /// Market transactions per block, kept when statistics are on.
    MarketTransactionsTable: BlockNumber => Vec<MarketTransaction>, "market_transactions_db"
);
