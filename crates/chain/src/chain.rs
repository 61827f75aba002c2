//! The chain state database: persistent indexes plus the in-memory caches
//! rebuilt from them.

use crate::{
    error::{ChainError, ChainResult, GenesisError},
    fork_db::ForkDatabase,
    genesis::{self, GenesisSource},
    observer::{
        ChainNotification, ChainNotificationSender, ChainObserver, NOTIFICATION_CHANNEL_CAPACITY,
    },
    pool::PoolState,
    state::ChainRead,
    tasks::{BackgroundWorker, TaskSpawner},
};
use calder_db::{tables, DatabaseError, IndexStore, StoreEnv, Table};
use calder_primitives::{
    config::DATABASE_VERSION, AccountId, AccountRecord, Address, AssetId, AssetRecord, BalanceId,
    BalanceRecord, BlockId, BlockNumber, BurnRecord, ChainConfig, ChainId, ChainProperty, Clock,
    CollateralRecord, FeedIndex, FeedRecord, FullBlock, MarketHistoryKey, MarketHistoryRecord,
    MarketIndexKey, MarketStatus, MarketTransaction, Operation, OrderKind, OrderRecord, Price,
    PropertyValue, SignedBlockHeader, SlateEntry, SlateId, SlotRecord, StateDelta, Timestamp,
    TransactionId, TransactionRecord, VoteIndexEntry,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Weak,
    },
};
use tracing::{error, info, warn};

/// Bounded length of each per-kind recent operation queue.
const MAX_RECENT_OPERATIONS: usize = 20;

/// The current head, tracked in memory.
#[derive(Debug, Default)]
pub(crate) struct HeadState {
    /// Id of the head block; the genesis parent when the chain is empty.
    pub(crate) id: BlockId,
    /// Header of the head block, `None` when the chain is empty.
    pub(crate) header: Option<SignedBlockHeader>,
}

impl HeadState {
    pub(crate) fn block_num(&self) -> BlockNumber {
        self.header.as_ref().map(|h| h.header.block_num).unwrap_or(0)
    }

    pub(crate) fn timestamp(&self) -> Timestamp {
        self.header.as_ref().map(|h| h.header.timestamp).unwrap_or(Timestamp(0))
    }
}

/// The in-memory unique transaction set keyed by id, purgeable by
/// expiration.
#[derive(Debug, Default)]
pub(crate) struct UniqueTransactionSet {
    by_expiration: BTreeSet<(Timestamp, TransactionId)>,
    ids: HashMap<TransactionId, Timestamp>,
}

impl UniqueTransactionSet {
    pub(crate) fn insert(&mut self, id: TransactionId, expiration: Timestamp) {
        if let Some(old) = self.ids.insert(id, expiration) {
            self.by_expiration.remove(&(old, id));
        }
        self.by_expiration.insert((expiration, id));
    }

    pub(crate) fn remove(&mut self, id: &TransactionId) {
        if let Some(expiration) = self.ids.remove(id) {
            self.by_expiration.remove(&(expiration, *id));
        }
    }

    pub(crate) fn contains(&self, id: &TransactionId) -> bool {
        self.ids.contains_key(id)
    }

    /// Drops every entry whose expiration is at or before `now`.
    pub(crate) fn purge_expired(&mut self, now: Timestamp) {
        while let Some((expiration, id)) = self.by_expiration.first().copied() {
            if expiration > now {
                break;
            }
            self.by_expiration.remove(&(expiration, id));
            self.ids.remove(&id);
        }
    }
}

/// The delegated-proof-of-stake chain state engine.
///
/// Owns every persistent index exclusively. All consensus-relevant state
/// lives in the indexes; the in-memory members are caches rebuilt on open.
pub struct ChainDatabase {
    pub(crate) weak_self: Weak<ChainDatabase>,
    pub(crate) config: ChainConfig,
    pub(crate) clock: Clock,
    pub(crate) data_dir: PathBuf,
    pub(crate) index_env: StoreEnv,
    pub(crate) raw_chain_env: StoreEnv,

    pub(crate) fork_db: ForkDatabase,
    pub(crate) properties: IndexStore<tables::Properties>,
    pub(crate) undo_states: IndexStore<tables::UndoStates>,
    pub(crate) block_num_to_id: IndexStore<tables::BlockNumToId>,
    pub(crate) future_blocks: IndexStore<tables::FutureBlocks>,
    pub(crate) accounts: IndexStore<tables::Accounts>,
    pub(crate) account_name_to_id: IndexStore<tables::AccountNameToId>,
    pub(crate) account_address_to_id: IndexStore<tables::AccountAddressToId>,
    pub(crate) assets: IndexStore<tables::Assets>,
    pub(crate) asset_symbol_to_id: IndexStore<tables::AssetSymbolToId>,
    pub(crate) balances: IndexStore<tables::Balances>,
    pub(crate) empty_balances: IndexStore<tables::EmptyBalances>,
    pub(crate) transactions: IndexStore<tables::Transactions>,
    pub(crate) pending_transactions: IndexStore<tables::PendingTransactions>,
    pub(crate) address_transactions: IndexStore<tables::AddressTransactions>,
    pub(crate) burns: IndexStore<tables::Burns>,
    pub(crate) slates: IndexStore<tables::Slates>,
    pub(crate) slots: IndexStore<tables::Slots>,
    pub(crate) feeds: IndexStore<tables::Feeds>,
    pub(crate) bids: IndexStore<tables::Bids>,
    pub(crate) asks: IndexStore<tables::Asks>,
    pub(crate) relative_bids: IndexStore<tables::RelativeBids>,
    pub(crate) relative_asks: IndexStore<tables::RelativeAsks>,
    pub(crate) shorts: IndexStore<tables::Shorts>,
    pub(crate) collateral: IndexStore<tables::Collateral>,
    pub(crate) market_statuses: IndexStore<tables::MarketStatuses>,
    pub(crate) market_history: IndexStore<tables::MarketHistory>,
    pub(crate) market_transactions: IndexStore<tables::MarketTransactionsTable>,

    pub(crate) head: RwLock<HeadState>,
    pub(crate) chain_id: RwLock<ChainId>,
    pub(crate) delegate_votes: RwLock<BTreeSet<VoteIndexEntry>>,
    pub(crate) unique_transactions: RwLock<UniqueTransactionSet>,
    pub(crate) collateral_expiration: RwLock<BTreeSet<(AssetId, Timestamp, MarketIndexKey)>>,
    pub(crate) dirty_markets: Mutex<BTreeSet<(AssetId, AssetId)>>,
    pub(crate) pool: Mutex<PoolState>,
    pub(crate) recent_operations: Mutex<HashMap<&'static str, VecDeque<Operation>>>,
    pub(crate) track_stats: AtomicBool,
    pub(crate) skip_signatures: AtomicBool,
    pub(crate) relay_fee: AtomicI64,
    pub(crate) push_mutex: Mutex<()>,
    pub(crate) observers: RwLock<Vec<Arc<dyn ChainObserver>>>,
    pub(crate) notification_sender: ChainNotificationSender,
    pub(crate) task_spawner: Arc<dyn TaskSpawner>,
}

impl std::fmt::Debug for ChainDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDatabase")
            .field("data_dir", &self.data_dir)
            .field("head", &*self.head.read())
            .finish_non_exhaustive()
    }
}

impl ChainDatabase {
    /// Opens (or creates) the chain at `data_dir`.
    ///
    /// A missing or outdated `index/` directory triggers a full reindex:
    /// the block archive is snapshotted, genesis is re-initialized, and all
    /// blocks are replayed in block-number order with deferred flushing on
    /// the cache-heavy indexes. `progress` (0..=100) is reported while
    /// reindexing.
    pub fn open(
        data_dir: &Path,
        config: ChainConfig,
        clock: Clock,
        genesis: GenesisSource,
        progress: Option<Box<dyn Fn(f32)>>,
    ) -> ChainResult<Arc<Self>> {
        // The clock's first read is the only legal suspension point before
        // the critical path; take it now.
        let _ = clock.now();

        std::fs::create_dir_all(data_dir)?;
        let index_path = data_dir.join("index");
        let rebuild = Self::detect_rebuild(&index_path)?;

        let index_env = StoreEnv::open(&index_path)?;
        let raw_chain_env = StoreEnv::open(&data_dir.join("raw_chain"))?;
        let fork_db = ForkDatabase::open(&index_env, &raw_chain_env)?;

        let (notification_sender, _) =
            tokio::sync::broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let properties = index_env.store()?;
        let undo_states = index_env.store()?;
        let future_blocks = index_env.store()?;
        let accounts = index_env.store()?;
        let account_name_to_id = index_env.store()?;
        let account_address_to_id = index_env.store()?;
        let assets = index_env.store()?;
        let asset_symbol_to_id = index_env.store()?;
        let balances = index_env.store()?;
        let empty_balances = index_env.store()?;
        let transactions = index_env.store()?;
        let pending_transactions = index_env.store()?;
        let address_transactions = index_env.store()?;
        let burns = index_env.store()?;
        let slates = index_env.store()?;
        let slots = index_env.store()?;
        let feeds = index_env.store()?;
        let bids = index_env.store()?;
        let asks = index_env.store()?;
        let relative_bids = index_env.store()?;
        let relative_asks = index_env.store()?;
        let shorts = index_env.store()?;
        let collateral = index_env.store()?;
        let market_statuses = index_env.store()?;
        let market_history = index_env.store()?;
        let market_transactions = index_env.store()?;
        let block_num_to_id = raw_chain_env.store()?;

        let chain = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            properties,
            undo_states,
            future_blocks,
            accounts,
            account_name_to_id,
            account_address_to_id,
            assets,
            asset_symbol_to_id,
            balances,
            empty_balances,
            transactions,
            pending_transactions,
            address_transactions,
            burns,
            slates,
            slots,
            feeds,
            bids,
            asks,
            relative_bids,
            relative_asks,
            shorts,
            collateral,
            market_statuses,
            market_history,
            market_transactions,
            block_num_to_id,
            fork_db,
            index_env,
            raw_chain_env,
            config,
            clock,
            data_dir: data_dir.to_path_buf(),
            head: RwLock::new(HeadState::default()),
            chain_id: RwLock::new(ChainId::default()),
            delegate_votes: RwLock::new(BTreeSet::new()),
            unique_transactions: RwLock::new(UniqueTransactionSet::default()),
            collateral_expiration: RwLock::new(BTreeSet::new()),
            dirty_markets: Mutex::new(BTreeSet::new()),
            pool: Mutex::new(PoolState::default()),
            recent_operations: Mutex::new(HashMap::new()),
            track_stats: AtomicBool::new(true),
            skip_signatures: AtomicBool::new(true),
            relay_fee: AtomicI64::new(0),
            push_mutex: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            notification_sender,
            task_spawner: BackgroundWorker::new(),
        });
        chain.relay_fee.store(chain.config.relay_fee, Ordering::Relaxed);
        chain
            .properties
            .insert(&ChainProperty::DatabaseVersion, &PropertyValue::Int(DATABASE_VERSION))?;

        match chain.bootstrap(rebuild, genesis, progress) {
            Ok(()) => Ok(chain),
            Err(err) => {
                error!(target: "chain", %err, "error opening database, wiping index");
                drop(chain);
                let _ = std::fs::remove_dir_all(&index_path);
                Err(err)
            }
        }
    }

    /// Checks the on-disk index version, wiping `index/` when it is older
    /// than this build. Returns `true` when a reindex is required.
    fn detect_rebuild(index_path: &Path) -> ChainResult<bool> {
        if !index_path.exists() {
            info!(target: "chain", "no index directory, rebuilding database index");
            return Ok(true);
        }
        let rebuild = {
            let env = StoreEnv::open(index_path)?;
            let properties: IndexStore<tables::Properties> = env.store()?;
            let version = properties
                .get(&ChainProperty::DatabaseVersion)?
                .and_then(|value| value.as_int());
            match version {
                Some(on_disk) if on_disk > DATABASE_VERSION => {
                    return Err(GenesisError::NewDatabaseVersion {
                        on_disk,
                        supported: DATABASE_VERSION,
                    }
                    .into())
                }
                Some(on_disk) if on_disk < DATABASE_VERSION => {
                    warn!(target: "chain", on_disk, "old database version, reindexing");
                    true
                }
                Some(_) => false,
                None => {
                    warn!(target: "chain", "index has no version stamp, reindexing");
                    true
                }
            }
        };
        if rebuild {
            std::fs::remove_dir_all(index_path)?;
        }
        Ok(rebuild)
    }

    fn bootstrap(
        &self,
        rebuild: bool,
        genesis: GenesisSource,
        progress: Option<Box<dyn Fn(f32)>>,
    ) -> ChainResult<()> {
        let head_entry = self.block_num_to_id.last()?;
        let replay = rebuild || head_entry.is_none();

        if replay {
            self.replay_chain(genesis, progress)?;
        } else {
            let chain_id = self
                .properties
                .get(&ChainProperty::ChainId)?
                .and_then(|value| value.as_chain_id())
                .ok_or_else(|| ChainError::Internal("chain id property missing".into()))?;
            *self.chain_id.write() = chain_id;

            let (_, head_id) = head_entry.expect("checked above");
            let record = self
                .fork_db
                .get_block_record(&head_id)?
                .ok_or_else(|| ChainError::Internal("head block record missing".into()))?;
            *self.head.write() = HeadState { id: head_id, header: Some(record.signed_header) };

            self.populate_indexes()?;
            self.clear_invalidation_of_future_blocks()?;
        }

        self.reload_pending_pool()?;
        metrics::gauge!("chain_head_height", self.head.read().block_num() as f64);
        Ok(())
    }

    /// Replays every archived block through `push_block`, rebuilding all
    /// indexes from scratch.
    fn replay_chain(
        &self,
        genesis: GenesisSource,
        progress: Option<Box<dyn Fn(f32)>>,
    ) -> ChainResult<()> {
        self.raw_chain_env
            .rename_tree(tables::BlockData::NAME, tables::BlockDataOrig::NAME)?;
        let orig: IndexStore<tables::BlockDataOrig> = self.raw_chain_env.store()?;

        let chain_id = genesis::initialize_genesis(self, genesis)?;
        *self.chain_id.write() = chain_id;

        // Load the number index into memory and clear it; replay rebuilds it.
        let mut num_to_id: BTreeMap<BlockNumber, BlockId> = BTreeMap::new();
        for item in self.block_num_to_id.iter() {
            let (num, id) = item?;
            num_to_id.insert(num, id);
        }
        self.block_num_to_id.clear()?;

        // Deferred flushing on the cache-heavy indexes for the duration.
        self.set_deferred_flush(true)?;

        let total = num_to_id.len();
        let mut indexed = 0usize;

        let blocks: Box<dyn Iterator<Item = ChainResult<FullBlock>> + '_> =
            if num_to_id.is_empty() {
                Box::new(orig.iter().map(|item| item.map(|(_, block)| block).map_err(Into::into)))
            } else {
                Box::new(num_to_id.into_values().filter_map(|id| {
                    orig.get(&id).map_err(ChainError::from).transpose()
                }))
            };

        for block in blocks {
            let block = block?;
            if indexed % 200 == 0 {
                if let Some(report) = &progress {
                    let fraction = if total > 0 { indexed as f32 / total as f32 } else { 0.0 };
                    report(fraction * 100.0);
                }
            }
            self.push_block(block)?;
            indexed += 1;
            if indexed % 1000 == 0 {
                self.set_deferred_flush(false)?;
                self.set_deferred_flush(true)?;
            }
        }

        self.set_deferred_flush(false)?;
        drop(orig);
        self.raw_chain_env.drop_tree(tables::BlockDataOrig::NAME)?;
        if let Some(report) = &progress {
            report(100.0);
        }
        info!(target: "chain", blocks = indexed, "reindex complete");
        Ok(())
    }

    /// Toggles deferred flushing on the index subset that benefits from it
    /// during reindex.
    fn set_deferred_flush(&self, deferred: bool) -> ChainResult<()> {
        let write_through = !deferred;
        self.properties.set_write_through(write_through)?;
        self.accounts.set_write_through(write_through)?;
        self.account_name_to_id.set_write_through(write_through)?;
        self.account_address_to_id.set_write_through(write_through)?;
        self.assets.set_write_through(write_through)?;
        self.asset_symbol_to_id.set_write_through(write_through)?;
        self.balances.set_write_through(write_through)?;
        self.empty_balances.set_write_through(write_through)?;
        self.slates.set_write_through(write_through)?;
        self.burns.set_write_through(write_through)?;
        self.feeds.set_write_through(write_through)?;
        self.bids.set_write_through(write_through)?;
        self.asks.set_write_through(write_through)?;
        self.relative_bids.set_write_through(write_through)?;
        self.relative_asks.set_write_through(write_through)?;
        self.shorts.set_write_through(write_through)?;
        self.collateral.set_write_through(write_through)?;
        self.market_statuses.set_write_through(write_through)?;
        self.market_transactions.set_write_through(write_through)?;
        self.market_history.set_write_through(write_through)?;
        Ok(())
    }

    /// Rebuilds the in-memory caches from persistent state.
    fn populate_indexes(&self) -> ChainResult<()> {
        let mut votes = self.delegate_votes.write();
        for item in self.accounts.iter() {
            let (_, record) = item?;
            if record.is_delegate() {
                votes.insert(VoteIndexEntry::new(record.net_votes(), record.id));
            }
        }
        drop(votes);

        let now = self.chain_time();
        let mut unique = self.unique_transactions.write();
        for item in self.transactions.iter() {
            let (id, record) = item?;
            if record.trx.transaction.expiration > now {
                unique.insert(id, record.trx.transaction.expiration);
            }
        }
        drop(unique);

        let mut expirations = self.collateral_expiration.write();
        for item in self.collateral.iter() {
            let (key, record) = item?;
            expirations.insert((key.order_price.quote_asset_id, record.expiration, key));
        }
        Ok(())
    }

    /// Clears the validity verdict of blocks previously quarantined with a
    /// future timestamp, so they are retried.
    pub(crate) fn clear_invalidation_of_future_blocks(&self) -> ChainResult<()> {
        for item in self.future_blocks.iter() {
            let (id, ()) = item?;
            if self.fork_db.get(&id)?.is_some() {
                self.fork_db.mark_as_unchecked(&id)?;
            }
        }
        Ok(())
    }

    // --- basic accessors ---

    /// This chain's id.
    pub fn chain_id(&self) -> ChainId {
        *self.chain_id.read()
    }

    /// The consensus parameters.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The engine's clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Height of the current head block.
    pub fn get_head_block_num(&self) -> BlockNumber {
        self.head.read().block_num()
    }

    /// Id of the current head block.
    pub fn get_head_block_id(&self) -> BlockId {
        self.head.read().id
    }

    /// Header of the current head block, `None` before the first block.
    pub fn get_head_block(&self) -> Option<SignedBlockHeader> {
        self.head.read().header.clone()
    }

    /// The chain's notion of "now": the head timestamp, or the previous slot
    /// boundary before any block exists.
    pub fn chain_time(&self) -> Timestamp {
        let head = self.head.read();
        if head.block_num() == 0 {
            let interval = self.config.block_interval_secs;
            let slot_start = self.clock.now().slot_start(interval);
            Timestamp(slot_start.0.saturating_sub(interval))
        } else {
            head.timestamp()
        }
    }

    /// Main-chain block id at `block_num`.
    pub fn get_block_id(&self, block_num: BlockNumber) -> ChainResult<BlockId> {
        self.block_num_to_id
            .get(&block_num)?
            .ok_or_else(|| ChainError::Internal(format!("no main-chain block #{block_num}")))
    }

    /// Full block body by id.
    pub fn get_block(&self, id: &BlockId) -> ChainResult<FullBlock> {
        self.fork_db.fetch_block(id)
    }

    /// Full block body by height.
    pub fn get_block_by_num(&self, block_num: BlockNumber) -> ChainResult<FullBlock> {
        self.get_block(&self.get_block_id(block_num)?)
    }

    /// Stored block record by id.
    pub fn get_block_record(
        &self,
        id: &BlockId,
    ) -> ChainResult<Option<calder_primitives::BlockRecord>> {
        self.fork_db.get_block_record(id)
    }

    /// Signed header by id.
    pub fn get_block_header(&self, id: &BlockId) -> ChainResult<SignedBlockHeader> {
        Ok(self
            .fork_db
            .get_block_record(id)?
            .ok_or(crate::error::ForkTreeError::UnknownBlock(*id))?
            .signed_header)
    }

    /// Fork data of a block, if the tree knows it.
    pub fn get_block_fork_data(
        &self,
        id: &BlockId,
    ) -> ChainResult<Option<calder_primitives::BlockForkData>> {
        self.fork_db.get(id)
    }

    /// `true` when the full block body is known.
    pub fn is_known_block(&self, id: &BlockId) -> ChainResult<bool> {
        Ok(self.get_block_fork_data(id)?.is_some_and(|data| data.is_known))
    }

    /// `true` when the block is on the main chain.
    pub fn is_included_block(&self, id: &BlockId) -> ChainResult<bool> {
        Ok(self.get_block_fork_data(id)?.is_some_and(|data| data.is_included))
    }

    /// Toggles transaction signature verification.
    pub fn skip_signature_verification(&self, skip: bool) {
        self.skip_signatures.store(skip, Ordering::Relaxed);
    }

    /// Sets the base relay fee required of pending transactions.
    pub fn set_relay_fee(&self, fee: calder_primitives::ShareAmount) {
        self.relay_fee.store(fee, Ordering::Relaxed);
    }

    /// The base relay fee.
    pub fn get_relay_fee(&self) -> calder_primitives::ShareAmount {
        self.relay_fee.load(Ordering::Relaxed)
    }

    /// Toggles statistics tracking (slot records, market history, address
    /// and burn indexes).
    pub fn track_chain_statistics(&self, enabled: bool) {
        self.track_stats.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn stats_tracked(&self) -> bool {
        self.track_stats.load(Ordering::Relaxed)
    }

    /// Flushes both store environments to disk.
    pub fn flush(&self) -> ChainResult<()> {
        self.index_env.flush()?;
        self.raw_chain_env.flush()?;
        Ok(())
    }

    /// Blocks until every background task enqueued so far has run. A
    /// diagnostic barrier; the engine itself never waits on the worker.
    pub fn wait_for_background_tasks(&self) {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.task_spawner.spawn(
            "barrier",
            Box::new(move || {
                let _ = sender.send(());
            }),
        );
        let _ = receiver.recv_timeout(std::time::Duration::from_secs(10));
    }

    /// Registers a chain observer.
    pub fn add_observer(&self, observer: Arc<dyn ChainObserver>) {
        self.observers.write().push(observer);
    }

    /// Subscribes to canonical state notifications.
    pub fn subscribe(&self) -> crate::observer::ChainNotifications {
        self.notification_sender.subscribe()
    }

    /// Records a recently applied operation in the bounded per-kind queue.
    pub(crate) fn store_recent_operation(&self, operation: &Operation) {
        let mut recents = self.recent_operations.lock();
        let queue = recents.entry(operation.kind_name()).or_default();
        queue.push_back(operation.clone());
        if queue.len() > MAX_RECENT_OPERATIONS {
            queue.pop_front();
        }
    }

    /// Recently applied operations of one kind, oldest first.
    pub fn get_recent_operations(&self, kind_name: &str) -> Vec<Operation> {
        self.recent_operations
            .lock()
            .get(kind_name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn notify(&self, notification: ChainNotification) {
        let _ = self.notification_sender.send(notification.clone());
        let observers: Vec<Arc<dyn ChainObserver>> = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        self.task_spawner.spawn(
            "notify_observers",
            Box::new(move || {
                for observer in &observers {
                    match &notification {
                        ChainNotification::BlockApplied(summary) => {
                            observer.block_applied(summary)
                        }
                        ChainNotification::StateChanged(undo) => observer.state_changed(undo),
                    }
                }
            }),
        );
    }

    // --- delta application ---

    /// Applies a committed write set to the persistent indexes, keeping all
    /// secondary indexes and in-memory caches consistent.
    pub(crate) fn apply_delta(&self, delta: &StateDelta) -> ChainResult<()> {
        for (key, value) in &delta.properties {
            match value {
                Some(value) => self.properties.insert(key, value)?,
                None => self.properties.remove(key)?,
            }
        }

        for (id, record) in &delta.accounts {
            self.apply_account(*id, record.as_ref())?;
        }
        for (id, record) in &delta.assets {
            self.apply_asset(*id, record.as_ref())?;
        }
        for (id, record) in &delta.balances {
            self.apply_balance(id, record.as_ref())?;
        }
        for (id, record) in &delta.transactions {
            self.apply_transaction_record(id, record.as_ref())?;
        }

        for (id, entry) in &delta.slates {
            match entry {
                Some(entry) if !entry.supported_delegates.is_empty() => {
                    self.slates.insert(id, entry)?
                }
                _ => self.slates.remove(id)?,
            }
        }
        for (index, record) in &delta.feeds {
            match record {
                Some(record) => self.feeds.insert(index, record)?,
                None => self.feeds.remove(index)?,
            }
        }
        for (time, record) in &delta.slots {
            match record {
                Some(record) => self.slots.insert(time, record)?,
                None => self.slots.remove(time)?,
            }
        }

        let mut dirty = self.dirty_markets.lock();
        for (key, record) in &delta.bids {
            dirty.insert(key.pair());
            match record {
                Some(record) if !record.is_null() => self.bids.insert(key, record)?,
                _ => self.bids.remove(key)?,
            }
        }
        for (key, record) in &delta.asks {
            dirty.insert(key.pair());
            match record {
                Some(record) if !record.is_null() => self.asks.insert(key, record)?,
                _ => self.asks.remove(key)?,
            }
        }
        for (key, record) in &delta.relative_bids {
            dirty.insert(key.pair());
            match record {
                Some(record) if !record.is_null() => self.relative_bids.insert(key, record)?,
                _ => self.relative_bids.remove(key)?,
            }
        }
        for (key, record) in &delta.relative_asks {
            dirty.insert(key.pair());
            match record {
                Some(record) if !record.is_null() => self.relative_asks.insert(key, record)?,
                _ => self.relative_asks.remove(key)?,
            }
        }
        for (key, record) in &delta.shorts {
            dirty.insert(key.pair());
            match record {
                Some(record) if !record.is_null() => self.shorts.insert(key, record)?,
                _ => self.shorts.remove(key)?,
            }
        }
        for (key, record) in &delta.collateral {
            dirty.insert(key.pair());
            self.apply_collateral(key, record.as_ref())?;
        }
        drop(dirty);

        for ((quote, base), status) in &delta.market_statuses {
            match status {
                Some(status) => self.market_statuses.insert(&(*quote, *base), status)?,
                None => self.market_statuses.remove(&(*quote, *base))?,
            }
        }
        for (key, record) in &delta.market_history {
            match record {
                Some(record) if record.volume != 0 => self.market_history.insert(key, record)?,
                _ => self.market_history.remove(key)?,
            }
        }
        for (block_num, transactions) in &delta.market_transactions {
            match transactions {
                Some(list) if !list.is_empty() => {
                    self.market_transactions.insert(block_num, list)?
                }
                _ => self.market_transactions.remove(block_num)?,
            }
        }
        for (key, record) in &delta.burns {
            match record {
                Some(record) => self.burns.insert(key, record)?,
                None => self.burns.remove(key)?,
            }
        }
        Ok(())
    }

    fn apply_account(&self, id: AccountId, record: Option<&AccountRecord>) -> ChainResult<()> {
        let old = self.accounts.get(&id)?;
        if let Some(old) = &old {
            if record.map(|new| new.name != old.name).unwrap_or(true) {
                self.account_name_to_id.remove(&old.name)?;
            }
            // Both the owner and the active signing address resolve to the
            // account; drop stale mappings on key rotation.
            for address in [old.owner_address(), old.active_address()] {
                let still_mapped = record
                    .map(|new| new.owner_address() == address || new.active_address() == address)
                    .unwrap_or(false);
                if !still_mapped {
                    self.account_address_to_id.remove(&address)?;
                }
            }
            if old.is_delegate() {
                self.delegate_votes
                    .write()
                    .remove(&VoteIndexEntry::new(old.net_votes(), old.id));
            }
        }
        match record {
            Some(record) => {
                self.accounts.insert(&id, record)?;
                self.account_name_to_id.insert(&record.name, &id)?;
                self.account_address_to_id.insert(&record.owner_address(), &id)?;
                self.account_address_to_id.insert(&record.active_address(), &id)?;
                if record.is_delegate() {
                    self.delegate_votes
                        .write()
                        .insert(VoteIndexEntry::new(record.net_votes(), record.id));
                }
            }
            None => self.accounts.remove(&id)?,
        }
        Ok(())
    }

    fn apply_asset(&self, id: AssetId, record: Option<&AssetRecord>) -> ChainResult<()> {
        if let Some(old) = self.assets.get(&id)? {
            let symbol_changed = record.map(|new| new.symbol != old.symbol).unwrap_or(true);
            if symbol_changed {
                self.asset_symbol_to_id.remove(&old.symbol)?;
            }
        }
        match record {
            Some(record) => {
                self.assets.insert(&id, record)?;
                self.asset_symbol_to_id.insert(&record.symbol, &id)?;
            }
            None => self.assets.remove(&id)?,
        }
        Ok(())
    }

    fn apply_balance(&self, id: &BalanceId, record: Option<&BalanceRecord>) -> ChainResult<()> {
        match record {
            Some(record) if record.balance != 0 => {
                self.empty_balances.remove(id)?;
                self.balances.insert(id, record)?;
            }
            Some(record) => {
                self.balances.remove(id)?;
                self.empty_balances.insert(id, record)?;
            }
            None => {
                self.balances.remove(id)?;
                self.empty_balances.remove(id)?;
            }
        }
        Ok(())
    }

    fn apply_transaction_record(
        &self,
        id: &TransactionId,
        record: Option<&TransactionRecord>,
    ) -> ChainResult<()> {
        match record {
            Some(record) => {
                self.transactions.insert(id, record)?;
                let expiration = record.trx.transaction.expiration;
                if expiration > self.chain_time() {
                    self.unique_transactions.write().insert(*id, expiration);
                }
                if self.stats_tracked() {
                    for address in operation_addresses(&record.trx.transaction.operations) {
                        self.address_transactions.insert(&(address, *id), &())?;
                    }
                }
            }
            None => {
                if let Some(record) = self.transactions.get(id)? {
                    for address in operation_addresses(&record.trx.transaction.operations) {
                        self.address_transactions.remove(&(address, *id))?;
                    }
                }
                self.transactions.remove(id)?;
                // Popped transactions may be re-included on another branch.
                self.unique_transactions.write().remove(id);
            }
        }
        Ok(())
    }

    fn apply_collateral(
        &self,
        key: &MarketIndexKey,
        record: Option<&CollateralRecord>,
    ) -> ChainResult<()> {
        let quote = key.order_price.quote_asset_id;
        let mut expirations = self.collateral_expiration.write();
        if let Some(old) = self.collateral.get(key)? {
            expirations.remove(&(quote, old.expiration, *key));
        }
        match record {
            Some(record) if !record.is_null() => {
                expirations.insert((quote, record.expiration, *key));
                drop(expirations);
                self.collateral.insert(key, record)?;
            }
            _ => {
                drop(expirations);
                self.collateral.remove(key)?;
            }
        }
        Ok(())
    }
}

/// Addresses statically referenced by a list of operations, used for the
/// address → transaction index.
pub(crate) fn operation_addresses(operations: &[Operation]) -> BTreeSet<Address> {
    let mut addresses = BTreeSet::new();
    for operation in operations {
        match operation {
            Operation::Deposit { condition, .. } => {
                if let Some(owner) = condition.owner() {
                    addresses.insert(owner);
                }
            }
            Operation::IssueAsset { condition, .. } => {
                if let Some(owner) = condition.owner() {
                    addresses.insert(owner);
                }
            }
            Operation::SubmitBid { owner, .. }
            | Operation::SubmitAsk { owner, .. }
            | Operation::SubmitShort { owner, .. }
            | Operation::CancelOrder { owner, .. } => {
                addresses.insert(*owner);
            }
            Operation::Cover { cover_owner, .. }
            | Operation::AddCollateral { cover_owner, .. } => {
                addresses.insert(*cover_owner);
            }
            _ => {}
        }
    }
    addresses
}

fn scan_pair<T>(
    store: &IndexStore<T>,
    quote_asset_id: AssetId,
    base_asset_id: AssetId,
) -> Result<Vec<(MarketIndexKey, T::Value)>, DatabaseError>
where
    T: Table<Key = MarketIndexKey>,
{
    let lower = MarketIndexKey {
        order_price: Price::pair_floor(quote_asset_id, base_asset_id),
        owner: Address::default(),
        expiration: Timestamp(0),
    };
    let mut entries = Vec::new();
    for item in store.iter_from(&lower) {
        let (key, value) = item?;
        if key.pair() != (quote_asset_id, base_asset_id) {
            break;
        }
        entries.push((key, value));
    }
    Ok(entries)
}

impl ChainRead for ChainDatabase {
    fn get_property(&self, key: ChainProperty) -> ChainResult<Option<PropertyValue>> {
        Ok(self.properties.get(&key)?)
    }

    fn get_account(&self, id: AccountId) -> ChainResult<Option<AccountRecord>> {
        Ok(self.accounts.get(&id)?)
    }

    fn get_account_by_name(&self, name: &str) -> ChainResult<Option<AccountRecord>> {
        match self.account_name_to_id.get(&name.to_string())? {
            Some(id) => self.get_account(id),
            None => Ok(None),
        }
    }

    fn get_account_by_address(&self, address: &Address) -> ChainResult<Option<AccountRecord>> {
        match self.account_address_to_id.get(address)? {
            Some(id) => self.get_account(id),
            None => Ok(None),
        }
    }

    fn get_asset(&self, id: AssetId) -> ChainResult<Option<AssetRecord>> {
        Ok(self.assets.get(&id)?)
    }

    fn get_asset_by_symbol(&self, symbol: &str) -> ChainResult<Option<AssetRecord>> {
        match self.asset_symbol_to_id.get(&symbol.to_string())? {
            Some(id) => self.get_asset(id),
            None => Ok(None),
        }
    }

    fn get_balance(&self, id: &BalanceId) -> ChainResult<Option<BalanceRecord>> {
        if let Some(record) = self.balances.get(id)? {
            return Ok(Some(record));
        }
        Ok(self.empty_balances.get(id)?)
    }

    fn get_transaction_record(
        &self,
        id: &TransactionId,
    ) -> ChainResult<Option<TransactionRecord>> {
        Ok(self.transactions.get(id)?)
    }

    fn get_slate(&self, id: SlateId) -> ChainResult<Option<SlateEntry>> {
        Ok(self.slates.get(&id)?)
    }

    fn get_feed(&self, index: &FeedIndex) -> ChainResult<Option<FeedRecord>> {
        Ok(self.feeds.get(index)?)
    }

    fn get_feeds_for_asset(&self, quote_asset_id: AssetId) -> ChainResult<Vec<FeedRecord>> {
        let lower = FeedIndex { quote_asset_id, delegate_id: 0 };
        let mut records = Vec::new();
        for item in self.feeds.iter_from(&lower) {
            let (index, record) = item?;
            if index.quote_asset_id != quote_asset_id {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    fn get_slot(&self, start_time: Timestamp) -> ChainResult<Option<SlotRecord>> {
        Ok(self.slots.get(&start_time)?)
    }

    fn get_order(
        &self,
        kind: OrderKind,
        key: &MarketIndexKey,
    ) -> ChainResult<Option<OrderRecord>> {
        let result = match kind {
            OrderKind::Bid => self.bids.get(key)?,
            OrderKind::Ask => self.asks.get(key)?,
            OrderKind::RelativeBid => self.relative_bids.get(key)?,
            OrderKind::RelativeAsk => self.relative_asks.get(key)?,
            OrderKind::Short => self.shorts.get(key)?,
            OrderKind::Cover => return Ok(None),
        };
        Ok(result)
    }

    fn get_collateral(&self, key: &MarketIndexKey) -> ChainResult<Option<CollateralRecord>> {
        Ok(self.collateral.get(key)?)
    }

    fn market_orders(
        &self,
        kind: OrderKind,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, OrderRecord)>> {
        let result = match kind {
            OrderKind::Bid => scan_pair(&self.bids, quote_asset_id, base_asset_id)?,
            OrderKind::Ask => scan_pair(&self.asks, quote_asset_id, base_asset_id)?,
            OrderKind::RelativeBid => {
                scan_pair(&self.relative_bids, quote_asset_id, base_asset_id)?
            }
            OrderKind::RelativeAsk => {
                scan_pair(&self.relative_asks, quote_asset_id, base_asset_id)?
            }
            OrderKind::Short => scan_pair(&self.shorts, quote_asset_id, base_asset_id)?,
            OrderKind::Cover => return Ok(Vec::new()),
        };
        Ok(result)
    }

    fn market_collateral(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Vec<(MarketIndexKey, CollateralRecord)>> {
        Ok(scan_pair(&self.collateral, quote_asset_id, base_asset_id)?)
    }

    fn get_market_status(
        &self,
        quote_asset_id: AssetId,
        base_asset_id: AssetId,
    ) -> ChainResult<Option<MarketStatus>> {
        Ok(self.market_statuses.get(&(quote_asset_id, base_asset_id))?)
    }

    fn get_market_history(
        &self,
        key: &MarketHistoryKey,
    ) -> ChainResult<Option<MarketHistoryRecord>> {
        Ok(self.market_history.get(key)?)
    }

    fn get_market_transactions(
        &self,
        block_num: BlockNumber,
    ) -> ChainResult<Option<Vec<MarketTransaction>>> {
        Ok(self.market_transactions.get(&block_num)?)
    }

    fn get_burn(&self, key: &(AccountId, TransactionId)) -> ChainResult<Option<BurnRecord>> {
        Ok(self.burns.get(key)?)
    }

    fn head_block_num(&self) -> ChainResult<BlockNumber> {
        Ok(self.get_head_block_num())
    }

    fn is_known_transaction(&self, id: &TransactionId) -> ChainResult<bool> {
        Ok(self.unique_transactions.read().contains(id))
    }
}

/// Debug-level per-table entry counts, the analogue of the original's
/// database statistics dump.
impl ChainDatabase {
    /// Entry counts of every table, keyed by table name.
    pub fn get_stats(&self) -> ChainResult<BTreeMap<&'static str, usize>> {
        let mut stats = BTreeMap::new();
        stats.insert(tables::Accounts::NAME, self.accounts.len()?);
        stats.insert(tables::Assets::NAME, self.assets.len()?);
        stats.insert(tables::Balances::NAME, self.balances.len()?);
        stats.insert(tables::EmptyBalances::NAME, self.empty_balances.len()?);
        stats.insert(tables::Transactions::NAME, self.transactions.len()?);
        stats.insert(tables::PendingTransactions::NAME, self.pending_transactions.len()?);
        stats.insert(tables::Bids::NAME, self.bids.len()?);
        stats.insert(tables::Asks::NAME, self.asks.len()?);
        stats.insert(tables::RelativeBids::NAME, self.relative_bids.len()?);
        stats.insert(tables::RelativeAsks::NAME, self.relative_asks.len()?);
        stats.insert(tables::Shorts::NAME, self.shorts.len()?);
        stats.insert(tables::Collateral::NAME, self.collateral.len()?);
        stats.insert(tables::Slates::NAME, self.slates.len()?);
        stats.insert(tables::Slots::NAME, self.slots.len()?);
        stats.insert(tables::Feeds::NAME, self.feeds.len()?);
        stats.insert(tables::MarketStatuses::NAME, self.market_statuses.len()?);
        stats.insert(tables::MarketHistory::NAME, self.market_history.len()?);
        stats.insert(tables::Burns::NAME, self.burns.len()?);
        stats.insert(tables::UndoStates::NAME, self.undo_states.len()?);
        Ok(stats)
    }
}
