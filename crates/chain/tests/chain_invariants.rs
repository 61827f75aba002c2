//! Structural invariants: head integrity, undo horizon, pending pool
//! idempotence, duplicate rejection and reindex equivalence.

mod common;

use calder_chain::{ChainDatabase, ChainError, ChainRead, ForkTreeError, GenesisSource};
use calder_primitives::{BlockId, ClaimCondition, Operation};
use common::{genesis_state, test_config, trx, TestNet};

#[test]
fn head_links_back_to_genesis() {
    let net = TestNet::new();
    for _ in 0..6 {
        net.produce_block(vec![]);
    }

    let mut current = net.chain.get_head_block_id();
    let mut steps = 0;
    while !current.is_genesis_parent() {
        let header = net.chain.get_block_header(&current).unwrap();
        current = header.header.previous;
        steps += 1;
        assert!(steps <= 6, "head chain must terminate at genesis");
    }
    assert_eq!(steps, 6);
}

#[test]
fn fork_linkage_follows_parents() {
    let net = TestNet::new();
    for _ in 0..3 {
        net.produce_block(vec![]);
    }
    for num in 1..=3u32 {
        let id = net.chain.get_block_id(num).unwrap();
        let data = net.chain.get_block_fork_data(&id).unwrap().unwrap();
        assert!(data.is_linked);
        assert!(data.is_included);
        assert!(data.is_valid());
    }
}

#[test]
fn undo_horizon_limits_pops_and_deep_forks() {
    let mut config = test_config();
    config.max_undo_history = 3;
    let net = TestNet::with_config(config);

    let mut blocks = Vec::new();
    for _ in 0..6 {
        blocks.push(net.produce_block(vec![]));
    }

    // A block forking below the horizon is rejected outright.
    let stale = net.build_block(
        blocks[0].id(),
        2,
        blocks[0].timestamp() + common::INTERVAL,
        vec![],
    );
    let err = net.chain.push_block(stale).unwrap_err();
    assert!(matches!(
        err,
        ChainError::ForkTree(ForkTreeError::BlockOlderThanUndoHistory { .. })
    ));

    // Only the last `max_undo_history` blocks can be popped.
    for _ in 0..3 {
        net.chain.pop_block().unwrap();
    }
    assert_eq!(net.chain.get_head_block_num(), 3);
    assert!(net.chain.pop_block().is_err(), "undo state beyond the horizon is evicted");
}

#[test]
fn storing_a_pending_transaction_twice_is_idempotent() {
    let net = TestNet::new();
    let d0 = net.delegate_address(0);
    let d0_balance = TestNet::signature_balance_id(d0, 0);
    let target = net.delegate_address(1);

    let transfer = trx(vec![
        Operation::Withdraw { balance_id: d0_balance, amount: 5_000 },
        Operation::Deposit {
            amount: 5_000,
            asset_id: 0,
            slate_id: 0,
            condition: ClaimCondition::Signature { owner: target },
        },
    ]);

    let first = net.chain.store_pending_transaction(&transfer, true).unwrap();
    assert!(first.is_some());
    let pool_after_first = net.chain.get_pending_transactions().len();

    let second = net.chain.store_pending_transaction(&transfer, true).unwrap();
    assert!(second.is_none(), "an already-pending transaction is a no-op");
    assert_eq!(net.chain.get_pending_transactions().len(), pool_after_first);

    // Once included, the transaction leaves the pool.
    let block = net.produce_block(vec![]);
    assert_eq!(block.user_transactions.len(), 1);
    assert_eq!(net.balance_of(target, 0), 5_000);
}

#[test]
fn included_transactions_cannot_repeat() {
    let net = TestNet::new();
    let d0 = net.delegate_address(0);
    let d0_balance = TestNet::signature_balance_id(d0, 0);
    let target = net.delegate_address(2);

    let transfer = trx(vec![
        Operation::Withdraw { balance_id: d0_balance, amount: 7_000 },
        Operation::Deposit {
            amount: 7_000,
            asset_id: 0,
            slate_id: 0,
            condition: ClaimCondition::Signature { owner: target },
        },
    ]);
    net.produce_block(vec![transfer.clone()]);
    assert!(net.chain.is_known_transaction(&transfer.id()).unwrap());

    // The duplicate is rejected at evaluation time.
    let err = net.chain.store_pending_transaction(&transfer, true).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Transaction(calder_chain::TransactionError::DuplicateTransaction(_))
    ));
}

#[test]
fn pushing_the_same_block_twice_is_rejected() {
    let net = TestNet::new();
    let block = net.produce_block(vec![]);
    let err = net.chain.push_block(block).unwrap_err();
    assert!(matches!(err, ChainError::ForkTree(ForkTreeError::DuplicateBlock(_))));
}

#[test]
fn orphan_blocks_and_their_children_stay_unlinked() {
    let net = TestNet::new();
    let b1 = net.produce_block(vec![]);

    // A block claiming a bogus parent id at the next height links nowhere.
    let orphan_parent = BlockId(calder_primitives::Hash160([0xaa; 20]));
    let orphan = net.build_block(orphan_parent, 2, b1.timestamp() + common::INTERVAL, vec![]);
    let fork_data = net.chain.push_block(orphan.clone()).unwrap();
    assert!(!fork_data.is_linked);
    assert_eq!(net.chain.get_head_block_id(), b1.id());

    // Its child inherits the unlinked state.
    let child =
        net.build_block(orphan.id(), 3, b1.timestamp() + 2 * common::INTERVAL, vec![]);
    let child_data = net.chain.push_block(child).unwrap();
    assert!(!child_data.is_linked);
}

#[test]
fn reopening_replays_to_identical_state() {
    let net = TestNet::new();

    let d0 = net.delegate_address(0);
    let d0_balance = TestNet::signature_balance_id(d0, 0);
    let target = net.delegate_address(3);
    net.produce_block(vec![trx(vec![
        Operation::Withdraw { balance_id: d0_balance, amount: 11_000 },
        Operation::Deposit {
            amount: 11_000,
            asset_id: 0,
            slate_id: 0,
            condition: ClaimCondition::Signature { owner: target },
        },
    ])]);
    for _ in 0..3 {
        net.produce_block(vec![]);
    }

    let head_before = net.chain.get_head_block_id();
    let snapshot_before = net.chain.generate_snapshot().unwrap();
    net.chain.flush().unwrap();

    // Drain the background queue so no task still references the engine.
    net.chain.wait_for_background_tasks();
    let TestNet { chain, clock, keys, dir } = net;
    drop(chain);

    // Wipe the rebuildable index; the block archive must restore the state.
    std::fs::remove_dir_all(dir.path().join("index")).unwrap();
    let reopened = ChainDatabase::open(
        dir.path(),
        test_config(),
        clock,
        GenesisSource::State(genesis_state(&keys)),
        None,
    )
    .unwrap();

    assert_eq!(reopened.get_head_block_id(), head_before);
    assert_eq!(reopened.generate_snapshot().unwrap(), snapshot_before);
    assert_eq!(reopened.get_head_block_num(), 4);
}
