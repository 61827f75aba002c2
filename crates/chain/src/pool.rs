//! The pending transaction pool.
//!
//! Pending transactions persist in their own table; the fee-ordered index
//! and the cumulative pool overlay are in-memory and rebuilt by
//! revalidation, which is scheduled off the critical path after every head
//! change.

use crate::{
    chain::ChainDatabase,
    checkpoints,
    error::{ChainResult, TransactionError},
    evaluator::{EvaluationFlags, FeeIndexKey, TransactionEvaluationState, TransactionEvaluator},
    state::{DeltaView, PendingState},
};
use calder_primitives::{FullBlock, ShareAmount, SignedTransaction, StateDelta, TransactionId};
use std::{collections::BTreeMap, sync::atomic::Ordering, sync::Arc};
use tracing::{debug, info, warn};

/// In-memory half of the pool: the cumulative overlay every pending
/// transaction has been applied to, plus the fee-ordered index.
#[derive(Default)]
pub(crate) struct PoolState {
    /// Cumulative writes of all currently pending transactions.
    pub(crate) delta: StateDelta,
    /// Evaluation results ordered by descending fee.
    pub(crate) fee_index: BTreeMap<FeeIndexKey, Arc<TransactionEvaluationState>>,
}

impl PoolState {
    fn reset(&mut self) {
        self.delta = StateDelta::default();
        self.fee_index.clear();
    }
}

impl ChainDatabase {
    /// Evaluates a transaction against the pool's cumulative state and, on
    /// success, commits its effects into the pool so later transactions see
    /// them.
    pub fn evaluate_transaction(
        &self,
        trx: &SignedTransaction,
        required_fees: ShareAmount,
    ) -> ChainResult<TransactionEvaluationState> {
        let flags = EvaluationFlags {
            skip_signatures: self.skip_signatures.load(Ordering::Relaxed),
            require_canonical: false,
        };
        let evaluator =
            TransactionEvaluator::new(self.chain_id(), &self.config, self.chain_time(), flags);

        let mut pool = self.pool.lock();
        let (eval_state, delta) = {
            let view = DeltaView::new(&pool.delta, self);
            let mut child = PendingState::new(&view);
            let eval_state = evaluator.evaluate(trx, &mut child)?;
            if eval_state.relay_fees() < required_fees {
                warn!(
                    target: "txpool",
                    trx = %trx.id(),
                    fees = eval_state.relay_fees(),
                    required = required_fees,
                    "transaction does not cover the relay fee"
                );
                return Err(TransactionError::InsufficientRelayFee {
                    fees: eval_state.relay_fees(),
                    required: required_fees,
                }
                .into());
            }
            let (delta, _) = child.into_parts();
            (eval_state, delta)
        };
        pool.delta.absorb(delta);
        Ok(eval_state)
    }

    /// Evaluates a transaction without touching the pool, returning the
    /// failure (if any) instead of raising it.
    pub fn get_transaction_error(
        &self,
        trx: &SignedTransaction,
        min_fee: ShareAmount,
    ) -> Option<crate::error::ChainError> {
        let flags = EvaluationFlags {
            skip_signatures: self.skip_signatures.load(Ordering::Relaxed),
            require_canonical: false,
        };
        let evaluator =
            TransactionEvaluator::new(self.chain_id(), &self.config, self.chain_time(), flags);
        let mut scratch = PendingState::new(self);
        match evaluator.evaluate(trx, &mut scratch) {
            Ok(eval_state) if eval_state.relay_fees() < min_fee => Some(
                TransactionError::InsufficientRelayFee {
                    fees: eval_state.relay_fees(),
                    required: min_fee,
                }
                .into(),
            ),
            Ok(_) => None,
            Err(err) => Some(err),
        }
    }

    /// Adds a transaction to the pool.
    ///
    /// Returns `None` when the transaction is already pending. Without
    /// `override_limits`, a pool past its size limit demands a relay fee
    /// scaled by the square of the overage.
    pub fn store_pending_transaction(
        &self,
        trx: &SignedTransaction,
        override_limits: bool,
    ) -> ChainResult<Option<Arc<TransactionEvaluationState>>> {
        let trx_id = trx.id();
        if self.pending_transactions.contains(&trx_id)? {
            return Ok(None);
        }

        let mut required_fee = self.get_relay_fee();
        if !override_limits {
            let pool_size = self.pool.lock().fee_index.len();
            if pool_size > self.config.max_pending_queue_size {
                let overage = (pool_size - self.config.max_pending_queue_size) as ShareAmount;
                required_fee = required_fee.saturating_mul(overage.saturating_mul(overage));
            }
        }

        let eval_state = Arc::new(self.evaluate_transaction(trx, required_fee)?);
        let fees = eval_state.relay_fees();

        self.pending_transactions.insert(&trx_id, trx)?;
        self.pool.lock().fee_index.insert(FeeIndexKey { fees, trx_id }, eval_state.clone());
        metrics::gauge!("txpool_pending", self.pool.lock().fee_index.len() as f64);
        Ok(Some(eval_state))
    }

    /// All pending transactions, highest fee first.
    pub fn get_pending_transactions(&self) -> Vec<Arc<TransactionEvaluationState>> {
        self.pool.lock().fee_index.values().cloned().collect()
    }

    /// Removes a block's transactions from the pool and schedules a full
    /// revalidation against the new head state.
    pub(crate) fn clear_pending(&self, block: &FullBlock) -> ChainResult<()> {
        for trx in &block.user_transactions {
            self.pending_transactions.remove(&trx.id())?;
        }
        self.pool.lock().reset();

        // Revalidation runs in the background once the push releases; there
        // is no point below the last checkpoint, where blocks only replay.
        if self.get_head_block_num() >= checkpoints::last_checkpoint_num() {
            if let Some(chain) = self.weak_self.upgrade() {
                self.task_spawner.spawn(
                    "revalidate_pending",
                    Box::new(move || {
                        if let Err(err) = chain.revalidate_pending() {
                            warn!(target: "txpool", %err, "pending revalidation failed");
                        }
                    }),
                );
            }
        }
        Ok(())
    }

    /// Re-evaluates every persisted pending transaction against the current
    /// head state, dropping the permanently invalid and rebuilding the fee
    /// index.
    pub fn revalidate_pending(&self) -> ChainResult<()> {
        self.pool.lock().reset();

        let mut to_discard: Vec<TransactionId> = Vec::new();
        let mut considered = 0usize;
        let mut pending: Vec<(TransactionId, SignedTransaction)> = Vec::new();
        for item in self.pending_transactions.iter() {
            pending.push(item?);
        }

        for (trx_id, trx) in pending {
            considered += 1;
            match self.store_pending_revalidated(&trx) {
                Ok(()) => {
                    debug!(target: "txpool", %trx_id, "revalidated pending transaction");
                }
                Err(err) => {
                    warn!(target: "txpool", %trx_id, %err, "discarding invalid transaction");
                    to_discard.push(trx_id);
                }
            }
        }
        for trx_id in &to_discard {
            self.pending_transactions.remove(trx_id)?;
        }

        let pool = self.pool.lock();
        info!(
            target: "txpool",
            valid = pool.fee_index.len(),
            considered,
            "pending revalidation complete"
        );
        metrics::gauge!("txpool_pending", pool.fee_index.len() as f64);
        Ok(())
    }

    fn store_pending_revalidated(&self, trx: &SignedTransaction) -> ChainResult<()> {
        let eval_state = Arc::new(self.evaluate_transaction(trx, self.get_relay_fee())?);
        let fees = eval_state.relay_fees();
        self.pool.lock().fee_index.insert(FeeIndexKey { fees, trx_id: trx.id() }, eval_state);
        Ok(())
    }

    /// Reloads the fee index from the persistent pending table on open.
    pub(crate) fn reload_pending_pool(&self) -> ChainResult<()> {
        self.revalidate_pending()
    }
}
