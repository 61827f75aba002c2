//! Block production: assembling a candidate block from the pool.

use crate::{
    chain::ChainDatabase,
    checkpoints,
    error::ChainResult,
    evaluator::{EvaluationFlags, TransactionEvaluator},
    state::PendingState,
};
use calder_primitives::{
    crypto, packing, BlockHeader, BlockId, FullBlock, SecretHash, ShareAmount,
    SignedBlockHeader, SignedTransaction, Timestamp, TransactionId,
};
use std::{
    collections::HashSet,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Per-delegate production limits and filters.
#[derive(Clone, Debug)]
pub struct DelegateConfig {
    /// Maximum packed block size in bytes.
    pub block_max_size: usize,
    /// Maximum number of transactions per block.
    pub block_max_transaction_count: usize,
    /// Wall-clock budget for assembling a block.
    pub block_max_production_time: Duration,
    /// Maximum packed size of one transaction.
    pub transaction_max_size: usize,
    /// Minimum fee a transaction must pay to be included.
    pub transaction_min_fee: ShareAmount,
    /// Require canonical (low-s) signatures.
    pub transaction_canonical_signatures_required: bool,
    /// Transactions never included by this delegate.
    pub transaction_blacklist: HashSet<TransactionId>,
    /// Operation kinds never included by this delegate.
    pub operation_blacklist: HashSet<String>,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            block_max_size: 1024 * 1024,
            block_max_transaction_count: 1_000,
            block_max_production_time: Duration::from_secs(3),
            transaction_max_size: 64 * 1024,
            transaction_min_fee: 0,
            transaction_canonical_signatures_required: false,
            transaction_blacklist: HashSet::new(),
            operation_blacklist: HashSet::new(),
        }
    }
}

/// An assembled but unsigned candidate block.
///
/// The producing delegate seals it by supplying its secret chain values and
/// signing key.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    /// The header, with the secret fields still blank.
    pub header: BlockHeader,
    /// The included transactions, in application order.
    pub user_transactions: Vec<SignedTransaction>,
}

impl BlockTemplate {
    /// Fills in the producer's secret chain and signs the header.
    pub fn seal(
        mut self,
        previous_secret: SecretHash,
        next_secret_hash: SecretHash,
        signing_key: &secp256k1::SecretKey,
    ) -> FullBlock {
        self.header.previous_secret = previous_secret;
        self.header.next_secret_hash = next_secret_hash;
        FullBlock {
            signed_header: SignedBlockHeader::sign(self.header, signing_key),
            user_transactions: self.user_transactions,
        }
    }
}

impl ChainDatabase {
    /// Assembles a candidate block for `block_timestamp` from the pending
    /// pool, under the delegate's limits.
    ///
    /// Excluded transactions are logged and skipped; only running out of the
    /// production time budget stops assembly early.
    pub fn generate_block(
        &self,
        block_timestamp: Timestamp,
        config: &DelegateConfig,
    ) -> ChainResult<BlockTemplate> {
        let start_time = Instant::now();

        let mut pending = PendingState::new(self);

        // Pre-execute markets so the assembled block agrees with the market
        // engine's effect on the same state.
        if self.get_head_block_num() >= checkpoints::MARKETS_BEFORE_TRANSACTIONS_FORK {
            let _ = self.execute_markets_at(
                block_timestamp,
                self.get_head_block_num() + 1,
                &mut pending,
            )?;
        }

        let mut user_transactions: Vec<SignedTransaction> = Vec::new();
        let mut block_size = packing::pack(&BlockHeader::default()).len();

        if config.block_max_transaction_count > 0 && config.block_max_size > block_size {
            let flags = EvaluationFlags {
                skip_signatures: self.skip_signatures.load(std::sync::atomic::Ordering::Relaxed),
                require_canonical: config.transaction_canonical_signatures_required,
            };
            let evaluator = TransactionEvaluator::new(
                self.chain_id(),
                &self.config,
                self.chain_time(),
                flags,
            );

            for item in self.get_pending_transactions() {
                if start_time.elapsed() >= config.block_max_production_time {
                    warn!(target: "producer", "production time limit reached");
                    break;
                }

                let trx = &item.trx;
                let trx_id = trx.id();

                let transaction_size = trx.data_size();
                if transaction_size > config.transaction_max_size {
                    warn!(
                        target: "producer",
                        %trx_id,
                        size = transaction_size,
                        limit = config.transaction_max_size,
                        "excluding transaction over the size limit"
                    );
                    continue;
                }
                if block_size + transaction_size > config.block_max_size {
                    warn!(
                        target: "producer",
                        %trx_id,
                        "excluding transaction that would overflow the block"
                    );
                    continue;
                }
                if config.transaction_blacklist.contains(&trx_id) {
                    warn!(target: "producer", %trx_id, "excluding blacklisted transaction");
                    continue;
                }
                if let Some(operation) = trx
                    .transaction
                    .operations
                    .iter()
                    .find(|op| config.operation_blacklist.contains(op.kind_name()))
                {
                    warn!(
                        target: "producer",
                        %trx_id,
                        kind = operation.kind_name(),
                        "excluding transaction with blacklisted operation"
                    );
                    continue;
                }

                // Validate in a child overlay so a failure costs nothing.
                let outcome = {
                    let mut child = PendingState::new(&pending);
                    match evaluator.evaluate(trx, &mut child) {
                        Ok(eval_state) => {
                            if eval_state.relay_fees() < config.transaction_min_fee {
                                warn!(
                                    target: "producer",
                                    %trx_id,
                                    fees = eval_state.relay_fees(),
                                    limit = config.transaction_min_fee,
                                    "excluding transaction below the fee limit"
                                );
                                None
                            } else {
                                Some(child.into_parts())
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: "producer",
                                %trx_id,
                                %err,
                                "pending transaction invalid in block context"
                            );
                            None
                        }
                    }
                };

                if let Some((delta, dirty)) = outcome {
                    pending.absorb(delta, dirty);
                    user_transactions.push(trx.clone());
                    block_size += transaction_size;
                    if user_transactions.len() >= config.block_max_transaction_count {
                        break;
                    }
                }
            }
        }

        let head = self.get_head_block();
        let previous =
            head.as_ref().map(|header| header.id()).unwrap_or(BlockId::GENESIS_PARENT);
        let block_num = head.as_ref().map(|header| header.header.block_num).unwrap_or(0) + 1;

        debug!(
            target: "producer",
            block_num,
            transactions = user_transactions.len(),
            "assembled block template"
        );

        Ok(BlockTemplate {
            header: BlockHeader {
                previous,
                block_num,
                timestamp: block_timestamp,
                transaction_digest: crypto::sha256(&packing::pack(&user_transactions)),
                previous_secret: SecretHash::default(),
                next_secret_hash: SecretHash::default(),
            },
            user_transactions,
        })
    }
}
