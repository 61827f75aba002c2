//! Block processing and reorganisation: `push_block`, `extend_chain`,
//! `switch_to_fork` and `pop_block`.

use crate::{
    chain::{ChainDatabase, HeadState},
    checkpoints,
    error::{ChainError, ChainResult, ForkTreeError, HeaderError},
    evaluator::{EvaluationFlags, TransactionEvaluator},
    market::{execute_markets_v1, MarketEngine},
    observer::{BlockSummary, ChainNotification},
    state::{ChainRead, ChainReadExt, PendingState},
};
use calder_primitives::{
    crypto, hash_secret, packing, AccountId, AccountRecord, AssetId, BlockForkData, BlockId,
    BlockNumber, BlockRecord, ChainProperty, FullBlock, Hash256, PropertyValue, PublicKey,
    ShareAmount, SlotRecord, Timestamp, TransactionLocation, TransactionRecord,
};
use std::{
    collections::BTreeSet,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tracing::{debug, info, warn};

impl ChainDatabase {
    /// Adds a block to the database and performs any reorganisation it makes
    /// possible. Returns the fork data of the pushed block.
    ///
    /// Blocks forking below the undo horizon are rejected outright and not
    /// stored. Blocks whose chain fails with a future timestamp are recorded
    /// for revalidation instead of being marked permanently invalid.
    pub fn push_block(&self, block: FullBlock) -> ChainResult<BlockForkData> {
        let head_block_num = self.get_head_block_num();
        let horizon = self.config.max_undo_history;
        if head_block_num > horizon && block.block_num() <= head_block_num - horizon {
            return Err(ForkTreeError::BlockOlderThanUndoHistory {
                id: block.id(),
                block_num: block.block_num(),
                head: head_block_num,
                horizon,
            }
            .into());
        }

        // Only one task may push at a time; everything below runs without
        // yielding so no reader observes a partially applied block.
        let _guard = self.push_mutex.lock();

        let block_id = block.id();
        let latency = self.clock.now().saturating_secs_since(block.timestamp());
        let (longest_tip, longest_fork) = self.fork_db.store_and_index(&block, latency)?;

        if longest_fork.can_link() {
            let tip_num = self
                .fork_db
                .get_block_record(&longest_tip)?
                .map(|record| record.block_num())
                .unwrap_or(0);
            if tip_num > head_block_num {
                // Walk candidate heights downward; at each height try every
                // linkable sibling until one fork switch sticks.
                let mut height = tip_num;
                'search: while height > 0 {
                    for sibling in self.fork_db.blocks_at_number(height)? {
                        let fork_data = self.fork_db.fetch(&sibling)?;
                        if !fork_data.can_link() {
                            continue;
                        }
                        match self.switch_to_fork(&sibling) {
                            Ok(()) => break 'search,
                            Err(err) if err.is_time_in_future() => {
                                // Record the tip we were switching to; the
                                // whole fork is retried when the clock
                                // advances or on the next startup.
                                warn!(
                                    target: "chain",
                                    tip = %sibling,
                                    "fork rejected for a future-dated block, queued for revalidation"
                                );
                                self.future_blocks.insert(&sibling, &())?;
                            }
                            Err(err) => {
                                debug!(
                                    target: "chain",
                                    tip = %sibling,
                                    %err,
                                    "fork permanently rejected"
                                );
                            }
                        }
                    }
                    height -= 1;
                }
            }
        } else {
            debug!(target: "chain", tip = %longest_tip, "longest fork is not linkable yet");
        }

        self.fork_db.fetch(&block_id)
    }

    /// Pops head blocks back to the common ancestor of `target`, then
    /// extends along the target branch.
    pub(crate) fn switch_to_fork(&self, target: &BlockId) -> ChainResult<()> {
        if *target == self.get_head_block_id() {
            return Ok(());
        }
        info!(
            target: "chain",
            from = %self.get_head_block_id(),
            to = %target,
            "switching forks"
        );

        let history = self.fork_db.fork_history(target)?;
        let common_ancestor = *history.last().expect("fork history is never empty");

        let mut popped = 0u64;
        while self.get_head_block_id() != common_ancestor {
            self.pop_block()?;
            popped += 1;
        }
        if popped > 0 {
            metrics::counter!("chain_reorgs_total", 1);
            metrics::gauge!("chain_latest_reorg_depth", popped as f64);
        }

        for block_id in history[..history.len() - 1].iter().rev() {
            let block = self.fork_db.fetch_block(block_id)?;
            self.extend_chain(&block)?;
        }
        Ok(())
    }

    /// Applies a block on top of the current head. On any failure the block
    /// (and its descendants) are marked invalid and the error propagates.
    pub(crate) fn extend_chain(&self, block: &FullBlock) -> ChainResult<()> {
        let started = Instant::now();
        let block_id = block.id();

        match self.extend_chain_inner(block, &block_id, started) {
            Ok(()) => {
                // Purge expired ids from the unique transaction set.
                self.unique_transactions.write().purge_expired(self.chain_time());
                Ok(())
            }
            Err(err) => {
                warn!(target: "chain", block = %block_id, %err, "error applying block");
                // A future-dated block is quarantined by the caller, not
                // condemned; it may validate once the clock catches up.
                if !err.is_time_in_future() {
                    self.fork_db.mark_invalid(&block_id, &err.reason())?;
                }
                Err(err)
            }
        }
    }

    /// Retries blocks previously quarantined with a future timestamp whose
    /// time has come. Called when the wall clock is known to have advanced.
    pub fn retry_future_blocks(&self) -> ChainResult<()> {
        let mut candidates = Vec::new();
        for item in self.future_blocks.iter() {
            candidates.push(item?.0);
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let _guard = self.push_mutex.lock();
        for block_id in candidates {
            let Some(record) = self.fork_db.get_block_record(&block_id)? else {
                self.future_blocks.remove(&block_id)?;
                continue;
            };
            let timestamp = record.signed_header.header.timestamp;
            if timestamp > now + 2 * self.config.block_interval_secs {
                continue;
            }
            self.fork_db.mark_as_unchecked(&block_id)?;
            match self.switch_to_fork(&block_id) {
                Ok(()) => {
                    info!(target: "chain", block = %block_id, "revalidated future-dated block");
                    self.future_blocks.remove(&block_id)?;
                }
                Err(err) if err.is_time_in_future() => {}
                Err(err) => {
                    warn!(target: "chain", block = %block_id, %err, "quarantined block is invalid");
                    self.future_blocks.remove(&block_id)?;
                }
            }
        }
        Ok(())
    }

    fn extend_chain_inner(
        &self,
        block: &FullBlock,
        block_id: &BlockId,
        started: Instant,
    ) -> ChainResult<()> {
        let block_signee = self.resolve_signee(block)?;

        if let Some(expected) = checkpoints::checkpoint_id(block.block_num()) {
            if expected != *block_id {
                return Err(HeaderError::FailedCheckpointVerification {
                    block_num: block.block_num(),
                    expected,
                    got: *block_id,
                }
                .into());
            }
        }

        self.verify_header(block, &block_signee)?;

        let mut pending = PendingState::new(self);

        // Production counters must update before anything else; they depend
        // on the active delegate order of the parent block.
        self.update_delegate_production_info(block, &mut pending, &block_signee)?;

        let mut block_record = self
            .fork_db
            .get_block_record(block_id)?
            .ok_or_else(|| ChainError::Internal("block record missing during apply".into()))?;

        self.pay_delegate(&mut pending, &block_signee, &mut block_record)?;

        let executed_pairs;
        if block.block_num() < checkpoints::MARKETS_BEFORE_TRANSACTIONS_FORK {
            self.apply_transactions(block, &mut pending)?;
            executed_pairs =
                self.execute_markets_at(block.timestamp(), block.block_num(), &mut pending)?;
        } else {
            executed_pairs =
                self.execute_markets_at(block.timestamp(), block.block_num(), &mut pending)?;
            self.apply_transactions(block, &mut pending)?;
        }

        self.update_active_delegate_list(block, &mut pending)?;
        self.update_random_seed(block, &mut pending, &mut block_record)?;
        self.save_undo_state(block_id, block.block_num(), &pending)?;

        // Commit: executed pairs stop being dirty, the delta re-marks any
        // pair its own order writes touched.
        {
            let mut dirty = self.dirty_markets.lock();
            for pair in &executed_pairs {
                dirty.remove(pair);
            }
        }
        let (delta, _touched) = pending.into_parts();
        self.apply_delta(&delta)?;

        self.fork_db.mark_included(block_id, true)?;
        *self.head.write() =
            HeadState { id: *block_id, header: Some(block.signed_header.clone()) };
        metrics::gauge!("chain_head_height", block.block_num() as f64);

        self.clear_pending(block)?;
        self.block_num_to_id.insert(&block.block_num(), block_id)?;

        block_record.processing_time_ms = started.elapsed().as_millis() as u64;
        self.fork_db.store_block_record(block_id, &block_record)?;

        self.run_hard_fork_rewrites(block.block_num())?;

        // Observers only hear about reasonably fresh blocks; replay stays
        // quiet.
        if self.clock.now().saturating_secs_since(block.timestamp())
            < self.config.block_interval_secs
        {
            let summary =
                Arc::new(BlockSummary { block: block.clone(), applied_changes: delta });
            self.notify(ChainNotification::BlockApplied(summary));
        }
        Ok(())
    }

    /// Reverts the head block by applying its stored undo delta.
    pub fn pop_block(&self) -> ChainResult<()> {
        let (head_id, previous) = {
            let head = self.head.read();
            if head.block_num() == 0 {
                warn!(target: "chain", "attempting to pop the empty chain");
                return Ok(());
            }
            let previous = head
                .header
                .as_ref()
                .map(|header| header.header.previous)
                .expect("non-zero head has a header");
            (head.id, previous)
        };

        self.fork_db.mark_included(&head_id, false)?;
        self.block_num_to_id.remove(&self.get_head_block_num())?;

        let undo = self
            .undo_states
            .get(&head_id)?
            .ok_or_else(|| ChainError::Internal(format!("no undo state for head {head_id}")))?;
        self.apply_delta(&undo)?;

        let new_head = if previous.is_genesis_parent() {
            HeadState::default()
        } else {
            let record = self
                .fork_db
                .get_block_record(&previous)?
                .ok_or(ForkTreeError::UnknownBlock(previous))?;
            HeadState { id: previous, header: Some(record.signed_header) }
        };
        *self.head.write() = new_head;
        metrics::gauge!("chain_head_height", self.get_head_block_num() as f64);

        self.notify(ChainNotification::StateChanged(Arc::new(undo)));
        Ok(())
    }

    /// Resolves the producing delegate's key, skipping signature recovery
    /// below the last checkpoint.
    fn resolve_signee(&self, block: &FullBlock) -> ChainResult<PublicKey> {
        if checkpoints::last_checkpoint_num() > block.block_num() {
            let active = self.get_active_delegates()?;
            let delegate = self.get_slot_signee(block.timestamp(), &active)?;
            Ok(delegate.active_key())
        } else {
            block.signed_header.signee().map_err(|_| HeaderError::UnrecoverableSignee.into())
        }
    }

    /// Header validation against the current head and local clock.
    fn verify_header(&self, block: &FullBlock, block_signee: &PublicKey) -> ChainResult<()> {
        let head = self.head.read();
        let header = &block.signed_header.header;

        if header.block_num > 1 && header.block_num != head.block_num() + 1 {
            return Err(HeaderError::BlockNumbersNotSequential {
                got: header.block_num,
                head: head.block_num(),
            }
            .into());
        }
        if header.previous != head.id {
            return Err(HeaderError::InvalidPreviousBlockId {
                got: header.previous,
                head: head.id,
            }
            .into());
        }
        if !header.timestamp.is_slot_aligned(self.config.block_interval_secs) {
            return Err(HeaderError::InvalidBlockTime(header.timestamp).into());
        }
        if header.block_num > 1 && header.timestamp <= head.timestamp() {
            return Err(HeaderError::TimeInPast {
                got: header.timestamp,
                head: head.timestamp(),
            }
            .into());
        }
        drop(head);

        let now = self.clock.now();
        if header.timestamp > now + 2 * self.config.block_interval_secs {
            return Err(HeaderError::TimeInFuture { got: header.timestamp, now }.into());
        }

        if block.calculate_transaction_digest() != header.transaction_digest {
            return Err(HeaderError::InvalidBlockDigest.into());
        }
        if !block.validate_unique_transactions() {
            return Err(HeaderError::DuplicateTransactionsInBlock.into());
        }

        let active = self.get_active_delegates()?;
        let expected = self.get_slot_signee(header.timestamp, &active)?;
        if *block_signee != expected.active_key() {
            return Err(HeaderError::InvalidDelegateSignee(header.timestamp).into());
        }
        Ok(())
    }

    /// Credits the producer, charges the missed, validates the revealed
    /// secret, and adjusts the required confirmation count.
    fn update_delegate_production_info(
        &self,
        block: &FullBlock,
        pending: &mut PendingState<'_>,
        block_signee: &PublicKey,
    ) -> ChainResult<()> {
        let header = &block.signed_header.header;
        let delegate_id = self.get_delegate_record_for_signee(block_signee)?.id;
        let mut delegate = pending
            .get_account(delegate_id)?
            .ok_or_else(|| ChainError::Internal("signee delegate record missing".into()))?;
        {
            let info = delegate
                .delegate_info
                .as_mut()
                .ok_or_else(|| ChainError::Internal("signee is not a delegate".into()))?;

            if let Some(committed) = info.next_secret_hash {
                if hash_secret(&header.previous_secret) != committed {
                    return Err(HeaderError::InvalidPreviousSecret.into());
                }
            }
            info.blocks_produced += 1;
            info.next_secret_hash = Some(header.next_secret_hash);
            info.last_block_num_produced = header.block_num;
        }
        pending.store_account(delegate);

        if self.stats_tracked() {
            pending.store_slot(SlotRecord::produced(header.timestamp, delegate_id, block.id()));
        }

        // Every slot between the parent and this block was missed by the
        // delegate scheduled for it.
        let mut required_confirmations = pending
            .get_property_int(ChainProperty::RequiredConfirmations)?
            .unwrap_or(2 * self.config.num_delegates as i64) as u64;

        let head = self.head.read();
        let mut slot_time = if head.block_num() > 0 {
            head.timestamp() + self.config.block_interval_secs
        } else {
            header.timestamp
        };
        drop(head);

        let active = self.get_active_delegates()?;
        while slot_time < header.timestamp {
            let missed_id = self.get_slot_signee(slot_time, &active)?.id;
            let mut missed = pending
                .get_account(missed_id)?
                .ok_or_else(|| ChainError::Internal("scheduled delegate missing".into()))?;
            if let Some(info) = missed.delegate_info.as_mut() {
                info.blocks_missed += 1;
            }
            pending.store_account(missed);

            if self.stats_tracked() {
                pending.store_slot(SlotRecord::missed(slot_time, missed_id));
            }

            required_confirmations += 2;
            slot_time += self.config.block_interval_secs;
        }

        required_confirmations = required_confirmations.saturating_sub(1);
        required_confirmations =
            required_confirmations.clamp(1, self.config.max_required_confirmations());
        pending.set_property(
            ChainProperty::RequiredConfirmations,
            PropertyValue::Int(required_confirmations as i64),
        );
        Ok(())
    }

    /// Pays the producing delegate: newly minted shares plus a slice of the
    /// fee pool, with the unaccepted slice destroyed.
    fn pay_delegate(
        &self,
        pending: &mut PendingState<'_>,
        block_signee: &PublicKey,
        block_record: &mut BlockRecord,
    ) -> ChainResult<()> {
        if pending.head_block_num()? < checkpoints::DELEGATE_PAY_V2_FORK {
            return self.pay_delegate_v1(pending, block_signee, block_record);
        }

        let mut base_asset = pending
            .get_asset(0)?
            .ok_or_else(|| ChainError::Internal("base asset missing".into()))?;
        let delegate_id = self.get_delegate_record_for_signee(block_signee)?.id;
        let mut delegate = pending
            .get_account(delegate_id)?
            .ok_or_else(|| ChainError::Internal("signee delegate record missing".into()))?;
        let pay_rate = delegate
            .delegate_info
            .as_ref()
            .map(|info| info.pay_rate)
            .ok_or_else(|| ChainError::Internal("signee is not a delegate".into()))?
            as ShareAmount;

        let max_new_shares = self.config.max_delegate_pay_per_block;
        let accepted_new_shares = max_new_shares * pay_rate / 100;
        base_asset.current_supply += accepted_new_shares;

        let blocks_per_two_weeks = 14 * self.config.blocks_per_day() as ShareAmount;
        let max_collected_fees = base_asset.collected_fees / blocks_per_two_weeks;
        let accepted_collected_fees = max_collected_fees * pay_rate / 100;
        let destroyed_collected_fees = max_collected_fees - accepted_collected_fees;
        base_asset.collected_fees -= max_collected_fees;
        base_asset.current_supply -= destroyed_collected_fees;

        let accepted_paycheck = accepted_new_shares + accepted_collected_fees;
        if let Some(info) = delegate.delegate_info.as_mut() {
            info.votes_for += accepted_paycheck;
            info.pay_balance += accepted_paycheck;
            info.total_paid += accepted_paycheck;
        }

        pending.store_account(delegate);
        pending.store_asset(base_asset);

        block_record.signee_shares_issued = accepted_new_shares;
        block_record.signee_fees_collected = accepted_collected_fees;
        block_record.signee_fees_destroyed = destroyed_collected_fees;
        Ok(())
    }

    /// The pre-fork pay rule: the full pay is minted, the fee pool is left
    /// alone.
    fn pay_delegate_v1(
        &self,
        pending: &mut PendingState<'_>,
        block_signee: &PublicKey,
        block_record: &mut BlockRecord,
    ) -> ChainResult<()> {
        let mut base_asset = pending
            .get_asset(0)?
            .ok_or_else(|| ChainError::Internal("base asset missing".into()))?;
        let delegate_id = self.get_delegate_record_for_signee(block_signee)?.id;
        let mut delegate = pending
            .get_account(delegate_id)?
            .ok_or_else(|| ChainError::Internal("signee delegate record missing".into()))?;
        let pay_rate = delegate
            .delegate_info
            .as_ref()
            .map(|info| info.pay_rate)
            .unwrap_or(0) as ShareAmount;

        let pay = self.config.max_delegate_pay_per_block * pay_rate / 100;
        base_asset.current_supply += pay;
        if let Some(info) = delegate.delegate_info.as_mut() {
            info.pay_balance += pay;
            info.total_paid += pay;
        }
        pending.store_account(delegate);
        pending.store_asset(base_asset);

        block_record.signee_shares_issued = pay;
        block_record.signee_fees_collected = 0;
        block_record.signee_fees_destroyed = 0;
        Ok(())
    }

    /// Runs the market engine for every dirty pair, in descending quote id
    /// order. Returns the pairs that were executed.
    pub(crate) fn execute_markets_at(
        &self,
        timestamp: Timestamp,
        block_num: BlockNumber,
        pending: &mut PendingState<'_>,
    ) -> ChainResult<BTreeSet<(AssetId, AssetId)>> {
        let pairs: BTreeSet<(AssetId, AssetId)> = self.dirty_markets.lock().clone();
        if pairs.is_empty() {
            return Ok(pairs);
        }

        let mut all_transactions = Vec::new();

        if pending.head_block_num()? < checkpoints::MARKET_ENGINE_V2_FORK {
            for &(quote, base) in pairs.iter().rev() {
                let mut trades =
                    execute_markets_v1(&self.config, timestamp, pending, quote, base)?;
                all_transactions.append(&mut trades);
            }
        } else {
            let mut engine = MarketEngine::new(&self.config, timestamp, self.stats_tracked());
            for &(quote, base) in pairs.iter().rev() {
                debug_assert!(quote > base, "market pairs are always quote > base");
                engine.execute(pending, quote, base)?;
            }
            all_transactions = engine.market_transactions;
        }

        if self.stats_tracked() {
            pending.set_market_transactions(block_num, all_transactions);
        }
        Ok(pairs)
    }

    /// On every round boundary, recompute and shuffle the active delegate
    /// list from the vote index.
    fn update_active_delegate_list(
        &self,
        block: &FullBlock,
        pending: &mut PendingState<'_>,
    ) -> ChainResult<()> {
        if block.block_num() as usize % self.config.num_delegates != 0 {
            return Ok(());
        }

        let mut active = self.next_round_active_delegates();
        let count = active.len();

        // Four swaps per seed word, re-hashing the seed as words run out.
        let mut seed = crypto::sha256(&packing::pack(&pending.get_current_random_seed()?));
        let mut i = 0usize;
        while i < count {
            for word in seed_words(&seed) {
                if i >= count {
                    break;
                }
                active.swap(i, (word % count as u64) as usize);
                i += 1;
            }
            seed = crypto::sha256(seed.as_bytes());
        }

        pending
            .set_property(ChainProperty::ActiveDelegateList, PropertyValue::DelegateList(active));
        Ok(())
    }

    /// Folds the revealed secret into the rolling random seed.
    fn update_random_seed(
        &self,
        block: &FullBlock,
        pending: &mut PendingState<'_>,
        block_record: &mut BlockRecord,
    ) -> ChainResult<()> {
        let current = pending.get_current_random_seed()?;
        let mut preimage = packing::pack(&block.signed_header.header.previous_secret);
        preimage.extend_from_slice(&packing::pack(&current));
        let new_seed = crypto::ripemd160_sha512(&preimage);
        pending.set_property(ChainProperty::LastRandomSeed, PropertyValue::Seed(new_seed));
        block_record.random_seed = new_seed;
        Ok(())
    }

    /// Persists the block's undo delta and evicts the one that fell off the
    /// horizon.
    fn save_undo_state(
        &self,
        block_id: &BlockId,
        block_num: BlockNumber,
        pending: &PendingState<'_>,
    ) -> ChainResult<()> {
        if self.get_head_block_num() < checkpoints::last_checkpoint_num() {
            // Not worth saving below the last checkpoint; those blocks can
            // never be popped.
            return Ok(());
        }

        let undo = pending.build_undo_state(self)?;

        if block_num > self.config.max_undo_history {
            let evicted_num = block_num - self.config.max_undo_history;
            if let Some(evicted_id) = self.block_num_to_id.get(&evicted_num)? {
                self.undo_states.remove(&evicted_id)?;
            }
        }
        self.undo_states.insert(block_id, &undo)?;
        Ok(())
    }

    /// Applies the block's transactions in order; any failure fails the
    /// block.
    fn apply_transactions(
        &self,
        block: &FullBlock,
        pending: &mut PendingState<'_>,
    ) -> ChainResult<()> {
        let flags = EvaluationFlags {
            skip_signatures: self.skip_signatures.load(Ordering::Relaxed),
            require_canonical: false,
        };
        let evaluator =
            TransactionEvaluator::new(self.chain_id(), &self.config, self.chain_time(), flags);

        for (trx_num, trx) in block.user_transactions.iter().enumerate() {
            let eval_state = evaluator.evaluate(trx, pending)?;
            let record = TransactionRecord {
                location: TransactionLocation {
                    block_num: block.block_num(),
                    trx_num: trx_num as u32,
                },
                trx: trx.clone(),
                fees: eval_state.fees,
            };
            pending.store_transaction(trx.id(), record);
            for operation in &trx.transaction.operations {
                self.store_recent_operation(operation);
            }
        }
        Ok(())
    }

    /// Hard-fork rewrites triggered exactly at a height.
    fn run_hard_fork_rewrites(&self, block_num: BlockNumber) -> ChainResult<()> {
        if checkpoints::SUPPLY_RECALCULATION_FORKS.contains(&block_num) {
            warn!(target: "chain", block_num, "recalculating asset supplies");
            let mut records = Vec::new();
            for item in self.assets.iter() {
                records.push(item?.1);
            }
            for mut record in records {
                let supply = self.calculate_supply(record.id)?;
                let mut fees = record.collected_fees;
                let mut amount = supply.amount;
                if record.is_market_issued() {
                    let debt = self.calculate_debt(record.id, false)?;
                    if debt.amount != amount {
                        let difference = debt.amount - amount;
                        amount += difference;
                        fees += difference;
                    }
                }
                record.current_supply = amount;
                record.collected_fees = fees;
                self.assets.insert(&record.id, &record)?;
            }
        }

        if let Some((fork_num, new_rate)) = checkpoints::PAY_RATE_RESET_FORK {
            if fork_num == block_num {
                warn!(target: "chain", block_num, new_rate, "resetting delegate pay rates");
                let mut delta = calder_primitives::StateDelta::default();
                for item in self.accounts.iter() {
                    let (_, mut record) = item?;
                    if let Some(info) = record.delegate_info.as_mut() {
                        info.pay_rate = new_rate;
                        delta.accounts.insert(record.id, Some(record));
                    }
                }
                self.apply_delta(&delta)?;
            }
        }
        Ok(())
    }

    // --- delegate scheduling ---

    /// The delegate scheduled for the slot containing `timestamp`.
    pub fn get_slot_signee(
        &self,
        timestamp: Timestamp,
        active_delegates: &[AccountId],
    ) -> ChainResult<AccountRecord> {
        let slot_number = timestamp.slot_number(self.config.block_interval_secs);
        let position = slot_number as usize % self.config.num_delegates;
        let delegate_id = active_delegates.get(position).copied().ok_or_else(|| {
            ChainError::Internal(format!("no active delegate for slot position {position}"))
        })?;
        let record = self
            .get_account(delegate_id)?
            .ok_or_else(|| ChainError::Internal("active delegate record missing".into()))?;
        if !record.is_delegate() {
            return Err(ChainError::Internal("active list entry is not a delegate".into()));
        }
        Ok(record)
    }

    /// The delegate account owning the producing key.
    pub fn get_delegate_record_for_signee(
        &self,
        block_signee: &PublicKey,
    ) -> ChainResult<AccountRecord> {
        let record = self
            .get_account_by_address(&block_signee.address())?
            .ok_or_else(|| ChainError::Internal("unknown block signee".into()))?;
        if !record.is_delegate() {
            return Err(ChainError::Internal("block signee is not a delegate".into()));
        }
        Ok(record)
    }

    /// The delegate that signed the block with the given id.
    pub fn get_block_signee(&self, block_id: &BlockId) -> ChainResult<AccountRecord> {
        let header = self.get_block_header(block_id)?;
        let key =
            header.signee().map_err(|_| ChainError::Header(HeaderError::UnrecoverableSignee))?;
        self.get_delegate_record_for_signee(&key)
    }

    /// The top delegates by net votes for the next round, unshuffled.
    pub fn next_round_active_delegates(&self) -> Vec<AccountId> {
        self.get_delegates_by_vote(0, self.config.num_delegates)
    }

    /// Delegates ordered by descending net votes, skipping `first`.
    pub fn get_delegates_by_vote(&self, first: usize, count: usize) -> Vec<AccountId> {
        self.delegate_votes
            .read()
            .iter()
            .skip(first)
            .take(count)
            .map(|entry| entry.delegate_id)
            .collect()
    }

    /// The next slot at which one of `delegate_ids` may produce, if any in
    /// the upcoming round.
    pub fn get_next_producible_block_timestamp(
        &self,
        delegate_ids: &[AccountId],
    ) -> ChainResult<Option<Timestamp>> {
        let interval = self.config.block_interval_secs;
        let mut next_block_time = self.config.next_slot_start(self.clock.now());
        if next_block_time <= self.chain_time() {
            next_block_time += interval;
        }
        let last_block_time =
            next_block_time + self.config.num_delegates as u32 * interval;

        let active = self.get_active_delegates()?;
        while next_block_time < last_block_time {
            let scheduled = self.get_slot_signee(next_block_time, &active)?;
            if delegate_ids.contains(&scheduled.id) {
                return Ok(Some(next_block_time));
            }
            next_block_time += interval;
        }
        Ok(None)
    }
}

/// The four u64 words of a shuffle seed.
fn seed_words(seed: &Hash256) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (i, chunk) in seed.0.chunks_exact(8).enumerate() {
        words[i] = u64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes"));
    }
    words
}
