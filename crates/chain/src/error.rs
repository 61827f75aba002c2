//! Error taxonomy of the chain state engine.

use calder_primitives::{BlockId, BlockNumber, ShareAmount, Timestamp, TransactionId};

/// Result alias for [`ChainError`].
pub type ChainResult<T> = Result<T, ChainError>;

/// Header verification failures. A block raising one of these is marked
/// invalid on its fork node (except [`HeaderError::TimeInFuture`], which is
/// quarantined for later revalidation).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The block number does not follow the head.
    #[error("block number {got} does not follow head block number {head}")]
    BlockNumbersNotSequential {
        /// The received block's number.
        got: BlockNumber,
        /// The current head number.
        head: BlockNumber,
    },
    /// The previous id does not match the head.
    #[error("previous block id {got} does not match head {head}")]
    InvalidPreviousBlockId {
        /// The received block's previous id.
        got: BlockId,
        /// The current head id.
        head: BlockId,
    },
    /// The timestamp is not aligned to the slot interval.
    #[error("block timestamp {0} is not aligned to the slot interval")]
    InvalidBlockTime(Timestamp),
    /// The timestamp does not advance past the head.
    #[error("block timestamp {got} is not after head timestamp {head}")]
    TimeInPast {
        /// The received block's timestamp.
        got: Timestamp,
        /// The head timestamp.
        head: Timestamp,
    },
    /// The timestamp is too far in the future; retried later.
    #[error("block timestamp {got} is more than two slots past local time {now}")]
    TimeInFuture {
        /// The received block's timestamp.
        got: Timestamp,
        /// Local wall-clock time at verification.
        now: Timestamp,
    },
    /// The transaction digest does not match the body.
    #[error("block transaction digest does not match its transactions")]
    InvalidBlockDigest,
    /// Two contained transactions share an id.
    #[error("block contains duplicate transactions")]
    DuplicateTransactionsInBlock,
    /// The signee is not the delegate scheduled for the slot.
    #[error("block signee is not the delegate scheduled for slot {0}")]
    InvalidDelegateSignee(Timestamp),
    /// The signature did not yield a recoverable key.
    #[error("block signature recovery failed")]
    UnrecoverableSignee,
    /// The revealed secret does not hash to the previous commitment.
    #[error("revealed producer secret does not match its commitment")]
    InvalidPreviousSecret,
    /// A checkpoint pins a different block id at this height.
    #[error("checkpoint at block {block_num} requires {expected}, got {got}")]
    FailedCheckpointVerification {
        /// The checkpointed height.
        block_num: BlockNumber,
        /// The pinned id.
        expected: BlockId,
        /// The received id.
        got: BlockId,
    },
}

/// Fork-tree failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkTreeError {
    /// The block forks below the undo horizon and can never be switched to.
    #[error(
        "block {id} at height {block_num} is older than the undo history \
         (head {head}, horizon {horizon})"
    )]
    BlockOlderThanUndoHistory {
        /// The rejected block.
        id: BlockId,
        /// Its height.
        block_num: BlockNumber,
        /// The current head height.
        head: BlockNumber,
        /// The undo horizon.
        horizon: BlockNumber,
    },
    /// The block (or one the query needs) is not known.
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),
    /// A block body was requested that only exists as a placeholder.
    #[error("block {0} is only known as a placeholder")]
    PlaceholderBlock(BlockId),
    /// The same block was pushed twice.
    #[error("block {0} is already known")]
    DuplicateBlock(BlockId),
    /// A fork walk hit an unlinked ancestor; the tree is inconsistent.
    #[error("fork history of {0} dead-ends in an unlinked ancestor")]
    BrokenForkHistory(BlockId),
}

/// Transaction-level failures. Non-fatal during block assembly, fatal for
/// the containing block during apply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The fee does not cover the required relay fee.
    #[error("transaction fee {fees} is below the required relay fee {required}")]
    InsufficientRelayFee {
        /// Fees the transaction pays.
        fees: ShareAmount,
        /// Fees required for relay.
        required: ShareAmount,
    },
    /// The transaction expired relative to the head time.
    #[error("transaction expired at {expiration}, chain time is {now}")]
    ExpiredTransaction {
        /// The transaction's expiration.
        expiration: Timestamp,
        /// The chain time it was checked against.
        now: Timestamp,
    },
    /// The transaction was already included or is already pending.
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(TransactionId),
    /// A signature failed to recover or was not canonical.
    #[error("invalid signature")]
    InvalidSignature,
    /// A required owner signature is missing.
    #[error("missing signature of {0}")]
    MissingSignature(calder_primitives::Address),
    /// The referenced balance does not exist.
    #[error("unknown balance {0}")]
    UnknownBalance(calder_primitives::BalanceId),
    /// The balance cannot cover the withdrawal.
    #[error("insufficient funds: balance holds {available}, needed {required}")]
    InsufficientFunds {
        /// Spendable amount at chain time.
        available: ShareAmount,
        /// Requested amount.
        required: ShareAmount,
    },
    /// Withdrawals do not cover deposits for an asset.
    #[error("operations deposit more of asset {asset_id} than they withdraw")]
    MissingDeposit {
        /// The over-deposited asset.
        asset_id: calder_primitives::AssetId,
    },
    /// An account name is already taken.
    #[error("account name {0:?} is already registered")]
    AccountAlreadyRegistered(String),
    /// The referenced account does not exist.
    #[error("unknown account {0}")]
    UnknownAccount(calder_primitives::AccountId),
    /// An asset symbol is already taken.
    #[error("asset symbol {0:?} is already registered")]
    AssetAlreadyRegistered(String),
    /// The referenced asset does not exist.
    #[error("unknown asset {0}")]
    UnknownAsset(calder_primitives::AssetId),
    /// Issuance would exceed the asset's maximum supply.
    #[error("issuing {amount} of asset {asset_id} would exceed its maximum supply")]
    SupplyCapExceeded {
        /// The asset.
        asset_id: calder_primitives::AssetId,
        /// The requested amount.
        amount: ShareAmount,
    },
    /// Only the issuer may perform the operation.
    #[error("account {0} is not the asset issuer")]
    NotAssetIssuer(calder_primitives::AccountId),
    /// Only a delegate may perform the operation.
    #[error("account {0} is not a delegate")]
    NotADelegate(calder_primitives::AccountId),
    /// The referenced order does not exist.
    #[error("unknown market order")]
    UnknownOrder,
    /// The referenced cover position does not exist.
    #[error("unknown cover position")]
    UnknownCover,
    /// The referenced vote slate does not exist.
    #[error("unknown slate {0}")]
    UnknownSlate(calder_primitives::SlateId),
    /// The operation's parameters are malformed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Genesis bootstrap failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenesisError {
    /// The on-disk index was produced by a newer engine.
    #[error("database version {on_disk} is newer than this build supports ({supported})")]
    NewDatabaseVersion {
        /// Version found in the property store.
        on_disk: i64,
        /// Version this build writes.
        supported: i64,
    },
    /// A raw genesis address failed to parse.
    #[error("invalid raw address in genesis state: {0:?}")]
    InvalidLegacyAddress(String),
    /// The genesis description is malformed.
    #[error("invalid genesis state: {0}")]
    InvalidGenesisState(String),
    /// The genesis file could not be read or parsed.
    #[error("failed to load genesis file: {0}")]
    UnreadableGenesisFile(String),
}

/// Top-level error of the chain state engine.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Header verification failed.
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// A fork-tree operation failed.
    #[error(transparent)]
    ForkTree(#[from] ForkTreeError),
    /// Transaction evaluation failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// Genesis bootstrap failed.
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    /// The persistent index layer failed.
    #[error(transparent)]
    Database(#[from] calder_db::DatabaseError),
    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A supply audit found the stored supply out of sync with the indexes.
    #[error(
        "asset {asset_id} supply audit failed: stored {stored}, recomputed {computed}"
    )]
    SupplyMismatch {
        /// The audited asset.
        asset_id: calder_primitives::AssetId,
        /// Supply recorded on the asset.
        stored: ShareAmount,
        /// Supply recomputed by exhaustive scan.
        computed: ShareAmount,
    },
    /// A supply audit found an asset above its hard cap.
    #[error("asset {asset_id} supply {current} exceeds its maximum {maximum}")]
    SupplyCapViolated {
        /// The audited asset.
        asset_id: calder_primitives::AssetId,
        /// Outstanding supply.
        current: ShareAmount,
        /// The hard cap.
        maximum: ShareAmount,
    },
    /// Internal invariant violation.
    #[error("{0}")]
    Internal(String),
}

impl ChainError {
    /// `true` when the error is the future-timestamp case that is quarantined
    /// instead of marked permanently invalid.
    pub fn is_time_in_future(&self) -> bool {
        matches!(self, ChainError::Header(HeaderError::TimeInFuture { .. }))
    }

    /// A one-line reason string stored on invalid fork nodes.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
