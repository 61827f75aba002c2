//! Transaction evaluation: signature and expiration checks plus the
//! per-operation handlers.
//!
//! Handlers write only through the provided pending state. Funds move on a
//! per-asset delta ledger: withdrawals (and mints) credit it, deposits (and
//! escrows) debit it, and whatever remains positive at the end is collected
//! as fees into the asset's fee pool. A negative remainder means operations
//! deposited more than they withdrew, which fails the transaction.

use crate::{
    error::{ChainResult, TransactionError},
    state::{ChainRead, PendingState},
};
use calder_primitives::{
    slate_id, AccountId, AccountRecord, Address, AssetId, AssetIssuer, AssetRecord,
    BalanceRecord, BurnRecord, ChainConfig, ChainId, ClaimCondition, CollateralRecord,
    DelegateStats, FeedIndex, FeedRecord, MarketIndexKey, Operation, OrderKind, Price,
    PropertyValue, ShareAmount, SignedTransaction, SlateEntry, SlateId, Timestamp,
    WithdrawCondition,
};
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

/// Evaluation switches derived from engine state and producer config.
#[derive(Clone, Copy, Debug, Default)]
pub struct EvaluationFlags {
    /// Skip signature recovery and ownership checks.
    pub skip_signatures: bool,
    /// Require every signature to be in canonical (low-s) form.
    pub require_canonical: bool,
}

/// The outcome of a successful evaluation.
#[derive(Clone, Debug)]
pub struct TransactionEvaluationState {
    /// The evaluated transaction.
    pub trx: SignedTransaction,
    /// Fees collected per asset.
    pub fees: BTreeMap<AssetId, ShareAmount>,
    /// Addresses whose signatures were recovered.
    pub signed_addresses: HashSet<Address>,
}

impl TransactionEvaluationState {
    /// Fees collected in the base asset.
    pub fn base_fees(&self) -> ShareAmount {
        self.fees.get(&0).copied().unwrap_or(0)
    }

    /// Fees collected in assets other than the base asset.
    pub fn alt_fees(&self) -> ShareAmount {
        self.fees.iter().filter(|(asset, _)| **asset != 0).map(|(_, fee)| *fee).sum()
    }

    /// The fee total compared against relay requirements.
    pub fn relay_fees(&self) -> ShareAmount {
        self.base_fees() + self.alt_fees()
    }
}

/// Evaluates signed transactions against a pending state.
pub struct TransactionEvaluator<'a> {
    chain_id: ChainId,
    config: &'a ChainConfig,
    /// Chain time expiration and record timestamps are checked against.
    now: Timestamp,
    flags: EvaluationFlags,
}

/// Working state of one evaluation.
struct EvalRun {
    trx_id: calder_primitives::TransactionId,
    signed_addresses: HashSet<Address>,
    /// Per-asset funds ledger: positive means withdrawn-but-unspent.
    deltas: BTreeMap<AssetId, i128>,
    /// Minimum base-asset fee the contained operations demand.
    required_base_fee: ShareAmount,
}

impl EvalRun {
    fn credit(&mut self, asset_id: AssetId, amount: ShareAmount) {
        *self.deltas.entry(asset_id).or_insert(0) += amount as i128;
    }

    fn debit(&mut self, asset_id: AssetId, amount: ShareAmount) {
        *self.deltas.entry(asset_id).or_insert(0) -= amount as i128;
    }
}

impl<'a> TransactionEvaluator<'a> {
    /// An evaluator bound to one chain and point in time.
    pub fn new(
        chain_id: ChainId,
        config: &'a ChainConfig,
        now: Timestamp,
        flags: EvaluationFlags,
    ) -> Self {
        Self { chain_id, config, now, flags }
    }

    /// Evaluates `trx`, writing its effects into `pending`.
    ///
    /// On error `pending` may hold partial writes; callers evaluating
    /// speculatively must hand in a discardable child overlay.
    pub fn evaluate(
        &self,
        trx: &SignedTransaction,
        pending: &mut PendingState<'_>,
    ) -> ChainResult<TransactionEvaluationState> {
        let trx_id = trx.id();
        trace!(target: "chain", %trx_id, "evaluating transaction");

        if trx.transaction.expiration <= self.now {
            return Err(TransactionError::ExpiredTransaction {
                expiration: trx.transaction.expiration,
                now: self.now,
            }
            .into());
        }
        if pending.is_known_transaction(&trx_id)? {
            return Err(TransactionError::DuplicateTransaction(trx_id).into());
        }

        let mut run = EvalRun {
            trx_id,
            signed_addresses: HashSet::new(),
            deltas: BTreeMap::new(),
            required_base_fee: 0,
        };

        if !self.flags.skip_signatures {
            if self.flags.require_canonical
                && trx.signatures.iter().any(|sig| !sig.is_canonical())
            {
                return Err(TransactionError::InvalidSignature.into());
            }
            let keys = trx
                .recover_signers(&self.chain_id)
                .map_err(|_| TransactionError::InvalidSignature)?;
            run.signed_addresses = keys.into_iter().map(|key| key.address()).collect();
        }

        for operation in &trx.transaction.operations {
            self.apply_operation(pending, &mut run, operation)?;
        }

        self.finalize(pending, run, trx)
    }

    /// Settles the funds ledger: positive remainders become collected fees.
    fn finalize(
        &self,
        pending: &mut PendingState<'_>,
        run: EvalRun,
        trx: &SignedTransaction,
    ) -> ChainResult<TransactionEvaluationState> {
        let mut fees = BTreeMap::new();
        for (asset_id, delta) in &run.deltas {
            if *delta < 0 {
                return Err(TransactionError::MissingDeposit { asset_id: *asset_id }.into());
            }
            if *delta == 0 {
                continue;
            }
            let fee = *delta as ShareAmount;
            let mut asset = pending
                .get_asset(*asset_id)?
                .ok_or(TransactionError::UnknownAsset(*asset_id))?;
            asset.collected_fees += fee;
            pending.store_asset(asset);
            fees.insert(*asset_id, fee);
        }

        let base_fees = fees.get(&0).copied().unwrap_or(0);
        if base_fees < run.required_base_fee {
            return Err(TransactionError::InsufficientRelayFee {
                fees: base_fees,
                required: run.required_base_fee,
            }
            .into());
        }

        Ok(TransactionEvaluationState {
            trx: trx.clone(),
            fees,
            signed_addresses: run.signed_addresses,
        })
    }

    fn check_signature(&self, run: &EvalRun, owner: &Address) -> ChainResult<()> {
        if self.flags.skip_signatures || run.signed_addresses.contains(owner) {
            Ok(())
        } else {
            Err(TransactionError::MissingSignature(*owner).into())
        }
    }

    /// Requires a signature of the account's owner or active key.
    fn check_account_signature(&self, run: &EvalRun, account: &AccountRecord) -> ChainResult<()> {
        if self.flags.skip_signatures
            || run.signed_addresses.contains(&account.owner_address())
            || run.signed_addresses.contains(&account.active_address())
        {
            Ok(())
        } else {
            Err(TransactionError::MissingSignature(account.owner_address()).into())
        }
    }

    fn apply_operation(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        operation: &Operation,
    ) -> ChainResult<()> {
        match operation {
            Operation::RegisterAccount { name, owner_key, delegate_pay_rate } => {
                self.register_account(pending, name, owner_key, *delegate_pay_rate)
            }
            Operation::UpdateAccount { account_id, pay_rate, active_key } => {
                self.update_account(pending, run, *account_id, *pay_rate, active_key.as_ref())
            }
            Operation::Withdraw { balance_id, amount } => {
                self.withdraw(pending, run, balance_id, *amount)
            }
            Operation::Deposit { amount, asset_id, slate_id, condition } => {
                self.deposit(pending, run, *amount, *asset_id, *slate_id, condition)
            }
            Operation::CreateAsset { symbol, name, description, precision, maximum_supply } => {
                self.create_asset(pending, run, symbol, name, description, *precision, *maximum_supply)
            }
            Operation::IssueAsset { amount, condition } => {
                self.issue_asset(pending, run, amount, condition)
            }
            Operation::SubmitBid { owner, amount, price } => {
                self.submit_order(pending, run, OrderKind::Bid, *owner, *amount, *price)
            }
            Operation::SubmitAsk { owner, amount, price } => {
                self.submit_order(pending, run, OrderKind::Ask, *owner, *amount, *price)
            }
            Operation::SubmitShort { owner, collateral, interest_rate_ppm, quote_asset_id } => {
                self.submit_short(pending, run, *owner, *collateral, *interest_rate_ppm, *quote_asset_id)
            }
            Operation::Cover { amount, cover_owner, cover_price, cover_expiration } => {
                self.cover(pending, run, *amount, *cover_owner, *cover_price, *cover_expiration)
            }
            Operation::AddCollateral { amount, cover_owner, cover_price, cover_expiration } => {
                self.add_collateral(pending, run, *amount, *cover_owner, *cover_price, *cover_expiration)
            }
            Operation::CancelOrder { kind, owner, price, expiration } => {
                self.cancel_order(pending, run, *kind, *owner, *price, *expiration)
            }
            Operation::DefineSlate { supported_delegates } => {
                self.define_slate(pending, supported_delegates)
            }
            Operation::PublishFeed { delegate_id, price } => {
                self.publish_feed(pending, run, *delegate_id, *price)
            }
            Operation::Burn { amount, account_id, message } => {
                self.burn(pending, run, amount, *account_id, message)
            }
        }
    }

    fn register_account(
        &self,
        pending: &mut PendingState<'_>,
        name: &str,
        owner_key: &calder_primitives::PublicKey,
        delegate_pay_rate: Option<u8>,
    ) -> ChainResult<()> {
        if name.is_empty() || name.len() > 63 {
            return Err(TransactionError::InvalidOperation("invalid account name".into()).into());
        }
        if pending.get_account_by_name(name)?.is_some() {
            return Err(TransactionError::AccountAlreadyRegistered(name.to_string()).into());
        }
        if pending.get_account_by_address(&owner_key.address())?.is_some() {
            return Err(TransactionError::InvalidOperation(
                "owner key address already registered".into(),
            )
            .into());
        }
        if let Some(pay_rate) = delegate_pay_rate {
            if pay_rate > 100 {
                return Err(
                    TransactionError::InvalidOperation("pay rate above 100".into()).into()
                );
            }
        }

        let id = pending
            .get_property(calder_primitives::ChainProperty::LastAccountId)?
            .and_then(|value| value.as_int())
            .unwrap_or(0) as AccountId
            + 1;
        pending.set_property(
            calder_primitives::ChainProperty::LastAccountId,
            PropertyValue::Int(id as i64),
        );

        pending.store_account(AccountRecord {
            id,
            name: name.to_string(),
            owner_key: *owner_key,
            active_keys: BTreeMap::new(),
            registration_date: self.now,
            last_update: self.now,
            delegate_info: delegate_pay_rate.map(DelegateStats::with_pay_rate),
        });
        Ok(())
    }

    fn update_account(
        &self,
        pending: &mut PendingState<'_>,
        run: &EvalRun,
        account_id: AccountId,
        pay_rate: Option<u8>,
        active_key: Option<&calder_primitives::PublicKey>,
    ) -> ChainResult<()> {
        let mut account =
            pending.get_account(account_id)?.ok_or(TransactionError::UnknownAccount(account_id))?;
        self.check_account_signature(run, &account)?;

        if let Some(pay_rate) = pay_rate {
            if pay_rate > 100 {
                return Err(
                    TransactionError::InvalidOperation("pay rate above 100".into()).into()
                );
            }
            let info = account
                .delegate_info
                .as_mut()
                .ok_or(TransactionError::NotADelegate(account_id))?;
            info.pay_rate = pay_rate;
        }
        if let Some(key) = active_key {
            account.set_active_key(self.now, *key);
        }
        account.last_update = self.now;
        pending.store_account(account);
        Ok(())
    }

    fn withdraw(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        balance_id: &calder_primitives::BalanceId,
        amount: ShareAmount,
    ) -> ChainResult<()> {
        if amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("withdraw amount not positive".into()).into()
            );
        }
        let mut balance =
            pending.get_balance(balance_id)?.ok_or(TransactionError::UnknownBalance(*balance_id))?;

        match &balance.condition.condition {
            ClaimCondition::Signature { owner } | ClaimCondition::Vesting { owner, .. } => {
                self.check_signature(run, owner)?;
            }
            ClaimCondition::Multisig { required, owners } => {
                let signed = owners
                    .iter()
                    .filter(|owner| run.signed_addresses.contains(owner))
                    .count();
                if !self.flags.skip_signatures && signed < *required as usize {
                    return Err(TransactionError::MissingSignature(
                        owners.first().copied().unwrap_or_default(),
                    )
                    .into());
                }
            }
        }

        let available = balance.spendable_balance(self.now);
        if available < amount {
            return Err(
                TransactionError::InsufficientFunds { available, required: amount }.into()
            );
        }

        if balance.asset_id() == 0 && balance.slate_id() != 0 {
            adjust_slate_votes(pending, balance.slate_id(), -amount)?;
        }

        balance.balance -= amount;
        balance.last_update = self.now;
        pending.store_balance(balance.clone());
        run.credit(balance.asset_id(), amount);
        Ok(())
    }

    fn deposit(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        amount: ShareAmount,
        asset_id: AssetId,
        slate: SlateId,
        condition: &ClaimCondition,
    ) -> ChainResult<()> {
        if amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("deposit amount not positive".into()).into()
            );
        }
        deposit_into(pending, self.now, amount, asset_id, slate, condition)?;
        run.debit(asset_id, amount);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_asset(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        symbol: &str,
        name: &str,
        description: &str,
        precision: u64,
        maximum_supply: ShareAmount,
    ) -> ChainResult<()> {
        if !is_valid_symbol(symbol) {
            return Err(TransactionError::InvalidOperation("invalid asset symbol".into()).into());
        }
        if pending.get_asset_by_symbol(symbol)?.is_some() {
            return Err(TransactionError::AssetAlreadyRegistered(symbol.to_string()).into());
        }
        if precision == 0 || maximum_supply <= 0 || maximum_supply > self.config.max_shares {
            return Err(
                TransactionError::InvalidOperation("invalid precision or supply cap".into())
                    .into(),
            );
        }

        // The registering account is the one whose signature is present.
        let issuer = self.resolve_signer_account(pending, run)?;

        let id = pending
            .get_property(calder_primitives::ChainProperty::LastAssetId)?
            .and_then(|value| value.as_int())
            .unwrap_or(0) as AssetId
            + 1;
        pending.set_property(
            calder_primitives::ChainProperty::LastAssetId,
            PropertyValue::Int(id as i64),
        );

        pending.store_asset(AssetRecord {
            id,
            symbol: symbol.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            issuer: AssetIssuer::Account(issuer),
            precision,
            registration_date: self.now,
            last_update: self.now,
            current_supply: 0,
            maximum_supply,
            collected_fees: 0,
            flags: 0,
            issuer_permissions: 0,
        });

        run.required_base_fee += self.config.asset_registration_fee;
        Ok(())
    }

    fn issue_asset(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        amount: &calder_primitives::AssetAmount,
        condition: &ClaimCondition,
    ) -> ChainResult<()> {
        if amount.amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("issue amount not positive".into()).into()
            );
        }
        let mut asset = pending
            .get_asset(amount.asset_id)?
            .ok_or(TransactionError::UnknownAsset(amount.asset_id))?;
        let issuer_id = match asset.issuer {
            AssetIssuer::Account(id) => id,
            AssetIssuer::Market => {
                return Err(TransactionError::InvalidOperation(
                    "market-issued assets cannot be issued directly".into(),
                )
                .into())
            }
        };
        let issuer = pending
            .get_account(issuer_id)?
            .ok_or(TransactionError::UnknownAccount(issuer_id))?;
        self.check_account_signature(run, &issuer)?;

        if asset.current_supply + amount.amount > asset.maximum_supply {
            return Err(TransactionError::SupplyCapExceeded {
                asset_id: amount.asset_id,
                amount: amount.amount,
            }
            .into());
        }
        asset.current_supply += amount.amount;
        asset.last_update = self.now;
        pending.store_asset(asset);

        // Mint, then immediately deposit the minted shares.
        run.credit(amount.asset_id, amount.amount);
        deposit_into(pending, self.now, amount.amount, amount.asset_id, 0, condition)?;
        run.debit(amount.asset_id, amount.amount);
        Ok(())
    }

    fn submit_order(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        kind: OrderKind,
        owner: Address,
        amount: ShareAmount,
        price: Price,
    ) -> ChainResult<()> {
        if amount <= 0 || price.ratio == 0 {
            return Err(TransactionError::InvalidOperation("invalid order".into()).into());
        }
        if price.base_asset_id >= price.quote_asset_id {
            return Err(
                TransactionError::InvalidOperation("market pair must be quote > base".into())
                    .into(),
            );
        }
        for asset_id in [price.quote_asset_id, price.base_asset_id] {
            if pending.get_asset(asset_id)?.is_none() {
                return Err(TransactionError::UnknownAsset(asset_id).into());
            }
        }

        // Bids escrow the quote asset, asks the base asset.
        let escrow_asset = match kind {
            OrderKind::Bid | OrderKind::RelativeBid => price.quote_asset_id,
            OrderKind::Ask | OrderKind::RelativeAsk => price.base_asset_id,
            _ => unreachable!("submit_order only handles bid/ask kinds"),
        };

        let key = MarketIndexKey::new(price, owner);
        let mut order = pending.get_order(kind, &key)?.unwrap_or_default();
        order.balance += amount;
        pending.store_order(kind, key, Some(order));
        run.debit(escrow_asset, amount);
        Ok(())
    }

    fn submit_short(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        owner: Address,
        collateral: ShareAmount,
        interest_rate_ppm: u32,
        quote_asset_id: AssetId,
    ) -> ChainResult<()> {
        if collateral <= 0 {
            return Err(TransactionError::InvalidOperation("invalid collateral".into()).into());
        }
        let asset = pending
            .get_asset(quote_asset_id)?
            .ok_or(TransactionError::UnknownAsset(quote_asset_id))?;
        if !asset.is_market_issued() {
            return Err(TransactionError::InvalidOperation(
                "shorts only exist against market-issued assets".into(),
            )
            .into());
        }

        // Shorts sort by offered interest rate: the rate is the price ratio.
        let price = Price {
            ratio: interest_rate_ppm as u128 * calder_primitives::PRICE_ONE / 1_000_000,
            quote_asset_id,
            base_asset_id: 0,
        };
        let key = MarketIndexKey::new(price, owner);
        let mut order = pending.get_order(OrderKind::Short, &key)?.unwrap_or_default();
        order.balance += collateral;
        order.interest_rate_ppm = interest_rate_ppm;
        pending.store_order(OrderKind::Short, key, Some(order));
        run.debit(0, collateral);
        Ok(())
    }

    fn cover(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        amount: ShareAmount,
        cover_owner: Address,
        cover_price: Price,
        cover_expiration: Timestamp,
    ) -> ChainResult<()> {
        if amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("cover amount not positive".into()).into()
            );
        }
        let key = MarketIndexKey {
            order_price: cover_price,
            owner: cover_owner,
            expiration: cover_expiration,
        };
        let mut position = pending.get_collateral(&key)?.ok_or(TransactionError::UnknownCover)?;
        self.check_signature(run, &cover_owner)?;

        // Interest accrued since the position opened is settled first and
        // lands in the asset's fee pool; only the principal part destroys
        // market-issued supply.
        let position_start =
            position.expiration.0.saturating_sub(self.config.max_short_period_secs);
        let age = self.now.0.saturating_sub(position_start);
        let interest_due = CollateralRecord::interest_owed(
            position.payoff_balance,
            position.interest_rate_ppm,
            age,
        );

        let quote_asset_id = cover_price.quote_asset_id;
        let repaid = amount.min(position.payoff_balance + interest_due);
        let interest_paid = repaid.min(interest_due);
        let principal_paid = repaid - interest_paid;
        position.payoff_balance -= principal_paid;
        run.debit(quote_asset_id, repaid);

        let mut asset = pending
            .get_asset(quote_asset_id)?
            .ok_or(TransactionError::UnknownAsset(quote_asset_id))?;
        asset.current_supply -= principal_paid;
        asset.collected_fees += interest_paid;
        pending.store_asset(asset);

        if position.is_null() {
            // Fully covered: the locked collateral returns to the owner.
            let released = position.collateral_balance;
            run.credit(0, released);
            deposit_into(
                pending,
                self.now,
                released,
                0,
                0,
                &ClaimCondition::Signature { owner: cover_owner },
            )?;
            run.debit(0, released);
            pending.store_collateral(key, None);
        } else {
            pending.store_collateral(key, Some(position));
        }
        Ok(())
    }

    fn add_collateral(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        amount: ShareAmount,
        cover_owner: Address,
        cover_price: Price,
        cover_expiration: Timestamp,
    ) -> ChainResult<()> {
        if amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("collateral amount not positive".into())
                    .into(),
            );
        }
        let key = MarketIndexKey {
            order_price: cover_price,
            owner: cover_owner,
            expiration: cover_expiration,
        };
        let mut position = pending.get_collateral(&key)?.ok_or(TransactionError::UnknownCover)?;
        position.collateral_balance += amount;
        pending.store_collateral(key, Some(position));
        run.debit(0, amount);
        Ok(())
    }

    fn cancel_order(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        kind: OrderKind,
        owner: Address,
        price: Price,
        expiration: Timestamp,
    ) -> ChainResult<()> {
        let key = MarketIndexKey { order_price: price, owner, expiration };
        let order = pending.get_order(kind, &key)?.ok_or(TransactionError::UnknownOrder)?;
        self.check_signature(run, &owner)?;

        let escrow_asset = match kind {
            OrderKind::Bid | OrderKind::RelativeBid => price.quote_asset_id,
            OrderKind::Ask | OrderKind::RelativeAsk => price.base_asset_id,
            OrderKind::Short => 0,
            OrderKind::Cover => {
                return Err(TransactionError::InvalidOperation(
                    "cover positions are closed by covering".into(),
                )
                .into())
            }
        };

        run.credit(escrow_asset, order.balance);
        deposit_into(
            pending,
            self.now,
            order.balance,
            escrow_asset,
            0,
            &ClaimCondition::Signature { owner },
        )?;
        run.debit(escrow_asset, order.balance);
        pending.store_order(kind, key, None);
        Ok(())
    }

    fn define_slate(
        &self,
        pending: &mut PendingState<'_>,
        supported_delegates: &[AccountId],
    ) -> ChainResult<()> {
        if supported_delegates.is_empty()
            || supported_delegates.len() > self.config.num_delegates
        {
            return Err(TransactionError::InvalidOperation("invalid slate size".into()).into());
        }
        for delegate_id in supported_delegates {
            let account = pending
                .get_account(*delegate_id)?
                .ok_or(TransactionError::UnknownAccount(*delegate_id))?;
            if !account.is_delegate() {
                return Err(TransactionError::NotADelegate(*delegate_id).into());
            }
        }
        let id = slate_id(supported_delegates);
        if pending.get_slate(id)?.is_none() {
            pending
                .store_slate(id, SlateEntry { supported_delegates: supported_delegates.to_vec() });
        }
        Ok(())
    }

    fn publish_feed(
        &self,
        pending: &mut PendingState<'_>,
        run: &EvalRun,
        delegate_id: AccountId,
        price: Price,
    ) -> ChainResult<()> {
        let account = pending
            .get_account(delegate_id)?
            .ok_or(TransactionError::UnknownAccount(delegate_id))?;
        if !account.is_delegate() {
            return Err(TransactionError::NotADelegate(delegate_id).into());
        }
        self.check_account_signature(run, &account)?;
        if price.base_asset_id != 0 {
            return Err(
                TransactionError::InvalidOperation("feeds quote the base asset".into()).into()
            );
        }
        pending.store_feed(FeedRecord {
            index: FeedIndex { quote_asset_id: price.quote_asset_id, delegate_id },
            value: price,
            last_update: self.now,
        });
        Ok(())
    }

    fn burn(
        &self,
        pending: &mut PendingState<'_>,
        run: &mut EvalRun,
        amount: &calder_primitives::AssetAmount,
        account_id: AccountId,
        message: &str,
    ) -> ChainResult<()> {
        if amount.amount <= 0 {
            return Err(
                TransactionError::InvalidOperation("burn amount not positive".into()).into()
            );
        }
        if pending.get_account(account_id)?.is_none() {
            return Err(TransactionError::UnknownAccount(account_id).into());
        }
        let mut asset = pending
            .get_asset(amount.asset_id)?
            .ok_or(TransactionError::UnknownAsset(amount.asset_id))?;
        asset.current_supply -= amount.amount;
        pending.store_asset(asset);

        pending.store_burn(
            (account_id, run.trx_id),
            BurnRecord { amount: *amount, message: message.to_string() },
        );
        run.debit(amount.asset_id, amount.amount);
        Ok(())
    }

    /// The registered account owning one of the recovered signatures.
    fn resolve_signer_account(
        &self,
        pending: &PendingState<'_>,
        run: &EvalRun,
    ) -> ChainResult<AccountId> {
        for address in &run.signed_addresses {
            if let Some(account) = pending.get_account_by_address(address)? {
                return Ok(account.id);
            }
        }
        if self.flags.skip_signatures {
            // Without signatures the operation cannot name its issuer; fall
            // back to the first registered account after the god account.
            if let Some(account) = pending.get_account(1)? {
                return Ok(account.id);
            }
        }
        Err(TransactionError::InvalidOperation("no registered signer account".into()).into())
    }
}

/// Accumulates `amount` into the balance record implied by the condition.
pub(crate) fn deposit_into(
    pending: &mut PendingState<'_>,
    now: Timestamp,
    amount: ShareAmount,
    asset_id: AssetId,
    slate: SlateId,
    condition: &ClaimCondition,
) -> ChainResult<()> {
    if slate != 0 && pending.get_slate(slate)?.is_none() {
        return Err(TransactionError::UnknownSlate(slate).into());
    }
    let withdraw_condition =
        WithdrawCondition { asset_id, slate_id: slate, condition: condition.clone() };
    let id = withdraw_condition.balance_id();
    let mut record = pending.get_balance(&id)?.unwrap_or(BalanceRecord {
        condition: withdraw_condition,
        balance: 0,
        last_update: now,
        snapshot_info: None,
    });
    record.balance += amount;
    record.last_update = now;
    pending.store_balance(record);

    if asset_id == 0 && slate != 0 {
        adjust_slate_votes(pending, slate, amount)?;
    }
    Ok(())
}

/// Moves `delta` votes on every delegate a slate supports.
fn adjust_slate_votes(
    pending: &mut PendingState<'_>,
    slate: SlateId,
    delta: ShareAmount,
) -> ChainResult<()> {
    let entry = pending.get_slate(slate)?.ok_or(TransactionError::UnknownSlate(slate))?;
    for delegate_id in entry.supported_delegates {
        let mut account = pending
            .get_account(delegate_id)?
            .ok_or(TransactionError::UnknownAccount(delegate_id))?;
        if let Some(info) = account.delegate_info.as_mut() {
            info.votes_for += delta;
            pending.store_account(account);
        }
    }
    Ok(())
}

/// Asset symbols are 3 to 8 upper-case letters.
fn is_valid_symbol(symbol: &str) -> bool {
    (3..=8).contains(&symbol.len()) && symbol.bytes().all(|b| b.is_ascii_uppercase())
}

/// Sort key of the pending pool's fee index: highest fee first, ties by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FeeIndexKey {
    /// Fee paid, in relay-comparable units.
    pub(crate) fees: ShareAmount,
    /// The transaction.
    pub(crate) trx_id: calder_primitives::TransactionId,
}

impl PartialOrd for FeeIndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeeIndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.fees.cmp(&self.fees).then_with(|| self.trx_id.cmp(&other.trx_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_validation() {
        assert!(is_valid_symbol("XMO"));
        assert!(is_valid_symbol("LONGGOLD"));
        assert!(!is_valid_symbol("XM"));
        assert!(!is_valid_symbol("xmo"));
        assert!(!is_valid_symbol("TOOLONGSYM"));
    }

    #[test]
    fn fee_index_orders_highest_fee_first() {
        let id = |b: u8| calder_primitives::TransactionId(calder_primitives::Hash160([b; 20]));
        let mut keys = [
            FeeIndexKey { fees: 10, trx_id: id(3) },
            FeeIndexKey { fees: 30, trx_id: id(1) },
            FeeIndexKey { fees: 10, trx_id: id(2) },
        ];
        keys.sort();
        assert_eq!(keys[0].fees, 30);
        assert_eq!(keys[1].trx_id, id(2));
    }
}
