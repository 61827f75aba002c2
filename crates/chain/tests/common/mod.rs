//! A five-delegate test network with a manually driven clock.
#![allow(dead_code)]

use calder_chain::{ChainDatabase, ChainRead, ChainReadExt, DelegateConfig, GenesisSource};
use calder_primitives::{
    crypto, hash_secret, packing, Address, BalanceId, BlockHeader, BlockId, ChainConfig,
    ClaimCondition, Clock, FullBlock, GenesisBalance, GenesisDelegate, GenesisState, Operation,
    PublicKey, SecretHash, ShareAmount, SignedBlockHeader, SignedTransaction, Timestamp,
    Transaction, WithdrawCondition,
};
use secp256k1::SecretKey;
use std::sync::Arc;
use tempfile::TempDir;

/// Slot interval of the test chain.
pub const INTERVAL: u32 = 10;

/// Genesis timestamp, slot aligned.
pub const GENESIS_TIME: Timestamp = Timestamp(1_000_000);

/// Initial balance of delegate0's address, in base units.
pub const INITIAL_BALANCE: ShareAmount = 1_000_000_000_000;

pub struct TestNet {
    pub chain: Arc<ChainDatabase>,
    pub clock: Clock,
    pub keys: Vec<SecretKey>,
    pub dir: TempDir,
}

pub fn test_config() -> ChainConfig {
    ChainConfig {
        num_delegates: 5,
        block_interval_secs: INTERVAL,
        max_undo_history: 100,
        relay_fee: 0,
        max_pending_queue_size: 100,
        max_delegate_pay_per_block: 5_000_000,
        asset_registration_fee: 1_000,
        base_precision: 100_000,
        base_symbol: "XTS".into(),
        base_name: "test shares".into(),
        max_shares: 2_000_000_000_000_000,
        max_short_period_secs: 7 * 24 * 60 * 60,
        min_feeds: 1,
        max_feed_age_secs: 24 * 60 * 60,
    }
}

pub fn delegate_keys() -> Vec<SecretKey> {
    (0..5u8).map(|i| SecretKey::from_slice(&[0x10 + i; 32]).unwrap()).collect()
}

pub fn genesis_state(keys: &[SecretKey]) -> GenesisState {
    let delegates = keys
        .iter()
        .enumerate()
        .map(|(i, key)| GenesisDelegate {
            name: format!("delegate{i}"),
            owner: PublicKey::from_secret(key),
        })
        .collect();
    let funded = PublicKey::from_secret(&keys[0]).address();
    GenesisState {
        timestamp: GENESIS_TIME,
        delegates,
        initial_balances: vec![GenesisBalance {
            raw_address: funded.to_string(),
            balance: INITIAL_BALANCE,
        }],
        vesting_balances: Default::default(),
        market_assets: vec![],
    }
}

impl TestNet {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let keys = delegate_keys();
        let clock = Clock::fixed(GENESIS_TIME);
        let chain = ChainDatabase::open(
            dir.path(),
            config,
            clock.clone(),
            GenesisSource::State(genesis_state(&keys)),
            None,
        )
        .unwrap();
        Self { chain, clock, keys, dir }
    }

    /// Each delegate reveals the same secret forever and commits to it
    /// again, so production works on any fork without bookkeeping.
    pub fn delegate_secret(&self, delegate_name: &str) -> SecretHash {
        crypto::ripemd160(delegate_name.as_bytes())
    }

    pub fn delegate_address(&self, index: usize) -> Address {
        PublicKey::from_secret(&self.keys[index]).address()
    }

    pub fn signature_balance_id(owner: Address, asset_id: u32) -> BalanceId {
        WithdrawCondition {
            asset_id,
            slate_id: 0,
            condition: ClaimCondition::Signature { owner },
        }
        .balance_id()
    }

    /// The balance held by `owner` in `asset_id`, zero when absent.
    pub fn balance_of(&self, owner: Address, asset_id: u32) -> ShareAmount {
        self.chain
            .get_balance(&Self::signature_balance_id(owner, asset_id))
            .unwrap()
            .map(|record| record.balance)
            .unwrap_or(0)
    }

    /// Produces, signs and pushes the next block containing `trxs`.
    pub fn produce_block(&self, trxs: Vec<SignedTransaction>) -> FullBlock {
        for trx in &trxs {
            self.chain.store_pending_transaction(trx, true).unwrap();
        }

        let head = self.chain.get_head_block();
        let timestamp = match &head {
            Some(header) => header.header.timestamp + INTERVAL,
            None => GENESIS_TIME + INTERVAL,
        };
        self.clock.set(timestamp);

        let template =
            self.chain.generate_block(timestamp, &DelegateConfig::default()).unwrap();
        let block = self.seal(template.header, template.user_transactions, timestamp);
        let fork_data = self.chain.push_block(block.clone()).unwrap();
        assert!(fork_data.is_valid(), "produced block must validate");
        assert_eq!(self.chain.get_head_block_id(), block.id());
        // Let the scheduled pool revalidation settle so the next block's
        // pool interactions are deterministic.
        self.chain.wait_for_background_tasks();
        self.assert_supply_consistent();
        block
    }

    /// Builds a (possibly fork) block by hand and signs it for the slot's
    /// scheduled delegate. Does not push it.
    pub fn build_block(
        &self,
        previous: BlockId,
        block_num: u32,
        timestamp: Timestamp,
        trxs: Vec<SignedTransaction>,
    ) -> FullBlock {
        let header = BlockHeader {
            previous,
            block_num,
            timestamp,
            transaction_digest: crypto::sha256(&packing::pack(&trxs)),
            previous_secret: SecretHash::default(),
            next_secret_hash: SecretHash::default(),
        };
        self.seal(header, trxs, timestamp)
    }

    fn seal(
        &self,
        mut header: BlockHeader,
        trxs: Vec<SignedTransaction>,
        timestamp: Timestamp,
    ) -> FullBlock {
        let active = self.chain.get_active_delegates().unwrap();
        let delegate = self.chain.get_slot_signee(timestamp, &active).unwrap();
        let index: usize = delegate.name.strip_prefix("delegate").unwrap().parse().unwrap();
        let secret = self.delegate_secret(&delegate.name);

        header.previous_secret = secret;
        header.next_secret_hash = hash_secret(&secret);
        FullBlock {
            signed_header: SignedBlockHeader::sign(header, &self.keys[index]),
            user_transactions: trxs,
        }
    }

    /// Every asset's stored supply must equal its recomputed supply.
    pub fn assert_supply_consistent(&self) {
        self.chain.sanity_check().unwrap();
    }
}

/// An unsigned transaction around `ops`; signature checks are skipped by
/// default in tests.
pub fn trx(ops: Vec<Operation>) -> SignedTransaction {
    SignedTransaction {
        transaction: Transaction { expiration: Timestamp(2_000_000), operations: ops },
        signatures: vec![],
    }
}
