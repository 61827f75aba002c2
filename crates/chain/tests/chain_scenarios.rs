//! End-to-end scenarios: asset lifecycle, market fills, pops, fork
//! switches and future-block quarantine.

mod common;

use calder_chain::ChainRead;
use calder_primitives::{MarketIndexKey, Operation, OrderKind, Price, PublicKey};
use common::{trx, TestNet, GENESIS_TIME, INITIAL_BALANCE, INTERVAL};
use secp256k1::SecretKey;

fn user_key(fill: u8) -> SecretKey {
    SecretKey::from_slice(&[fill; 32]).unwrap()
}

/// 3 XMO per XTS, in base units of each (XMO precision 100, XTS 100_000).
fn xmo_per_xts(hundredths: i64) -> Price {
    Price::from_amounts(hundredths, 100_000, 1, 0)
}

/// Runs the shared S1/S2 prologue: asset creation, funding, issuance, and
/// the crossing bid/ask. Returns (net, t1, t2) with head at block 9.
fn market_fixture() -> (TestNet, calder_primitives::Address, calder_primitives::Address) {
    let net = TestNet::new();
    let d0 = net.delegate_address(0);
    let d0_balance = TestNet::signature_balance_id(d0, 0);
    let t1 = PublicKey::from_secret(&user_key(0x51)).address();
    let t2 = PublicKey::from_secret(&user_key(0x52)).address();

    // Block 1: delegate0 registers asset XMO, paying the registration fee.
    net.produce_block(vec![trx(vec![
        Operation::Withdraw { balance_id: d0_balance, amount: 1_000 },
        Operation::CreateAsset {
            symbol: "XMO".into(),
            name: "test market asset".into(),
            description: String::new(),
            precision: 100,
            maximum_supply: 1_000_000_000_000,
        },
    ])]);

    // Block 2: register and fund testaccount1 with 100 XTS.
    net.produce_block(vec![
        trx(vec![Operation::RegisterAccount {
            name: "testaccount1".into(),
            owner_key: PublicKey::from_secret(&user_key(0x51)),
            delegate_pay_rate: None,
        }]),
        trx(vec![
            Operation::Withdraw { balance_id: d0_balance, amount: 10_000_000 },
            Operation::Deposit {
                amount: 10_000_000,
                asset_id: 0,
                slate_id: 0,
                condition: calder_primitives::ClaimCondition::Signature { owner: t1 },
            },
        ]),
    ]);

    // Block 3: register and fund testaccount2 with 200 XTS.
    net.produce_block(vec![
        trx(vec![Operation::RegisterAccount {
            name: "testaccount2".into(),
            owner_key: PublicKey::from_secret(&user_key(0x52)),
            delegate_pay_rate: None,
        }]),
        trx(vec![
            Operation::Withdraw { balance_id: d0_balance, amount: 20_000_000 },
            Operation::Deposit {
                amount: 20_000_000,
                asset_id: 0,
                slate_id: 0,
                condition: calder_primitives::ClaimCondition::Signature { owner: t2 },
            },
        ]),
    ]);

    // Block 4: empty.
    net.produce_block(vec![]);

    // Block 5: issue 10,000.00 XMO to testaccount1.
    net.produce_block(vec![trx(vec![Operation::IssueAsset {
        amount: calder_primitives::AssetAmount::new(1_000_000, 1),
        condition: calder_primitives::ClaimCondition::Signature { owner: t1 },
    }])]);

    // S1 assertions: supplies after issuance.
    let xmo = net.chain.get_asset_by_symbol("XMO").unwrap().unwrap();
    assert_eq!(xmo.current_supply, 1_000_000);
    let xts = net.chain.get_asset(0).unwrap().unwrap();
    assert!(xts.current_supply >= INITIAL_BALANCE, "delegate pay only mints");
    assert_eq!(net.chain.calculate_supply(1).unwrap().amount, 1_000_000);

    // Block 6: testaccount1 bids for 500 XTS at 3 XMO/XTS (escrows 1500 XMO).
    let t1_xmo = TestNet::signature_balance_id(t1, 1);
    net.produce_block(vec![trx(vec![
        Operation::Withdraw { balance_id: t1_xmo, amount: 150_000 },
        Operation::SubmitBid { owner: t1, amount: 150_000, price: xmo_per_xts(300) },
    ])]);

    // Block 7: the lone bid crosses nothing.
    net.produce_block(vec![]);
    assert_eq!(net.chain.get_market_transactions(7).unwrap(), None);

    // Block 8: testaccount2 asks 100 XTS at 2.9 XMO/XTS.
    let t2_xts = TestNet::signature_balance_id(t2, 0);
    net.produce_block(vec![trx(vec![
        Operation::Withdraw { balance_id: t2_xts, amount: 10_000_000 },
        Operation::SubmitAsk { owner: t2, amount: 10_000_000, price: xmo_per_xts(290) },
    ])]);

    // Block 9: the market engine fills 100 XTS at the bid price.
    net.produce_block(vec![]);

    (net, t1, t2)
}

#[test]
fn s1_s2_asset_creation_issuance_and_partial_fill() {
    let (net, t1, t2) = market_fixture();

    // The asker is credited 290.00 XMO (its own price); the spread of
    // 10.00 XMO is collected as fees.
    assert_eq!(net.balance_of(t2, 1), 29_000);
    // The bidder received the 100 XTS on top of its prior funding.
    assert_eq!(net.balance_of(t1, 0), 20_000_000);

    // Remaining bid escrow represents 400 XTS at the bid price.
    let bid_key = MarketIndexKey::new(xmo_per_xts(300), t1);
    let bid = net.chain.get_order(OrderKind::Bid, &bid_key).unwrap().unwrap();
    assert_eq!(bid.balance, 120_000);
    assert_eq!(xmo_per_xts(300).base_for_quote(bid.balance), 40_000_000);

    // The ask is fully consumed.
    let ask_key = MarketIndexKey::new(xmo_per_xts(290), t2);
    assert_eq!(net.chain.get_order(OrderKind::Ask, &ask_key).unwrap(), None);

    // The fill is recorded as a market transaction of block 9.
    let fills = net.chain.get_market_transactions(9).unwrap().unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].bid_owner, t1);
    assert_eq!(fills[0].ask_owner, t2);
    assert_eq!(fills[0].quote_paid.amount, 30_000);
    assert_eq!(fills[0].base_received.amount, 10_000_000);
    assert_eq!(fills[0].fees_collected, 1_000);

    net.assert_supply_consistent();
}

#[test]
fn s3_non_crossing_ask_stays_in_book() {
    let (net, t1, t2) = market_fixture();
    let t1_xts_before = net.balance_of(t1, 0);
    let t2_xmo_before = net.balance_of(t2, 1);

    // Block 10: an ask above the best bid must not match.
    let t2_xts = TestNet::signature_balance_id(t2, 0);
    net.produce_block(vec![trx(vec![
        Operation::Withdraw { balance_id: t2_xts, amount: 10_000_000 },
        Operation::SubmitAsk { owner: t2, amount: 10_000_000, price: xmo_per_xts(310) },
    ])]);
    // Block 11: the market executes and leaves both orders resting.
    net.produce_block(vec![]);

    let bid_key = MarketIndexKey::new(xmo_per_xts(300), t1);
    let ask_key = MarketIndexKey::new(xmo_per_xts(310), t2);
    assert_eq!(net.chain.get_order(OrderKind::Bid, &bid_key).unwrap().unwrap().balance, 120_000);
    assert_eq!(
        net.chain.get_order(OrderKind::Ask, &ask_key).unwrap().unwrap().balance,
        10_000_000
    );
    assert_eq!(net.balance_of(t1, 0), t1_xts_before);
    assert_eq!(net.balance_of(t2, 1), t2_xmo_before);
}

#[test]
fn s4_pop_block_restores_orders_and_balances() {
    let (net, t1, t2) = market_fixture();

    net.chain.pop_block().unwrap();
    assert_eq!(net.chain.get_head_block_num(), 8);

    // Pre-match quantities are restored exactly.
    let bid_key = MarketIndexKey::new(xmo_per_xts(300), t1);
    let ask_key = MarketIndexKey::new(xmo_per_xts(290), t2);
    assert_eq!(net.chain.get_order(OrderKind::Bid, &bid_key).unwrap().unwrap().balance, 150_000);
    assert_eq!(
        net.chain.get_order(OrderKind::Ask, &ask_key).unwrap().unwrap().balance,
        10_000_000
    );
    assert_eq!(net.balance_of(t1, 0), 10_000_000);
    assert_eq!(net.balance_of(t2, 1), 0);
    assert_eq!(net.chain.get_market_transactions(9).unwrap(), None);

    net.assert_supply_consistent();
}

#[test]
fn s5_fork_switch_to_longer_branch() {
    let (net, _, _) = market_fixture();
    let b8_id = net.chain.get_block_id(8).unwrap();
    let b9a_id = net.chain.get_head_block_id();
    let b9a_time = net.chain.get_head_block().unwrap().header.timestamp;

    // A sibling of block 9 on the next slot. Equal height: the earlier-seen
    // head stays.
    let b9b = net.build_block(b8_id, 9, b9a_time + INTERVAL, vec![]);
    net.clock.set(b9b.timestamp());
    net.chain.push_block(b9b.clone()).unwrap();
    assert_eq!(net.chain.get_head_block_id(), b9a_id);

    // A child of the sibling outgrows the current head and forces a switch.
    let b10 = net.build_block(b9b.id(), 10, b9b.timestamp() + INTERVAL, vec![]);
    net.clock.set(b10.timestamp());
    net.chain.push_block(b10.clone()).unwrap();
    assert_eq!(net.chain.get_head_block_id(), b10.id());

    // The abandoned branch is no longer included, the new one is.
    assert!(!net.chain.is_included_block(&b9a_id).unwrap());
    assert!(net.chain.is_included_block(&b9b.id()).unwrap());
    net.assert_supply_consistent();

    // A fresh engine fed {1..8, B9b, B10} directly reaches identical state.
    let replayed = TestNet::new();
    for num in 1..=8u32 {
        let block = net.chain.get_block_by_num(num).unwrap();
        replayed.clock.set(block.timestamp());
        replayed.chain.push_block(block).unwrap();
    }
    replayed.clock.set(b10.timestamp());
    replayed.chain.push_block(b9b).unwrap();
    replayed.chain.push_block(b10).unwrap();

    assert_eq!(replayed.chain.get_head_block_id(), net.chain.get_head_block_id());
    assert_eq!(
        replayed.chain.generate_snapshot().unwrap(),
        net.chain.generate_snapshot().unwrap()
    );
    assert_eq!(
        replayed.chain.calculate_supply(0).unwrap(),
        net.chain.calculate_supply(0).unwrap()
    );
}

#[test]
fn s6_future_dated_block_is_quarantined_and_retried() {
    let net = TestNet::new();
    net.produce_block(vec![]);
    let head_id = net.chain.get_head_block_id();
    let head_time = net.chain.get_head_block().unwrap().header.timestamp;

    // Three slots ahead of the wall clock: past the two-slot tolerance.
    let future_time = head_time + 3 * INTERVAL;
    let future = net.build_block(head_id, 2, future_time, vec![]);
    let fork_data = net.chain.push_block(future.clone()).unwrap();

    // Quarantined, not condemned.
    assert_eq!(fork_data.is_valid, None);
    assert_eq!(net.chain.get_head_block_id(), head_id);

    // Once the clock reaches the slot, the retry adopts the block.
    net.clock.set(future_time);
    net.chain.retry_future_blocks().unwrap();
    assert_eq!(net.chain.get_head_block_id(), future.id());
    assert!(net.chain.is_included_block(&future.id()).unwrap());
}

#[test]
fn market_execution_is_deterministic_across_engines() {
    let (net, _, _) = market_fixture();

    let replayed = TestNet::new();
    for num in 1..=9u32 {
        let block = net.chain.get_block_by_num(num).unwrap();
        replayed.clock.set(block.timestamp());
        replayed.chain.push_block(block).unwrap();
    }

    assert_eq!(replayed.chain.get_head_block_id(), net.chain.get_head_block_id());
    assert_eq!(
        replayed.chain.get_market_transactions(9).unwrap(),
        net.chain.get_market_transactions(9).unwrap()
    );
    assert_eq!(
        replayed.chain.generate_snapshot().unwrap(),
        net.chain.generate_snapshot().unwrap()
    );
}

#[test]
fn delegate_rounds_shuffle_and_pay() {
    let net = TestNet::new();
    for _ in 0..12 {
        net.produce_block(vec![]);
    }
    assert_eq!(net.chain.get_head_block_num(), 12);

    // Twelve blocks cross two round boundaries; every block paid its
    // producer.
    let mut produced_total = 0;
    for id in 1..=5u32 {
        let delegate = net.chain.get_account(id).unwrap().unwrap();
        let info = delegate.delegate_info.unwrap();
        produced_total += info.blocks_produced;
        assert_eq!(info.pay_balance, info.total_paid);
        if info.blocks_produced > 0 {
            assert!(info.pay_balance > 0);
        }
    }
    assert_eq!(produced_total, 12);
    net.assert_supply_consistent();
}

#[test]
fn genesis_time_starts_the_clock() {
    let net = TestNet::new();
    assert_eq!(net.chain.get_head_block_num(), 0);
    assert!(net.chain.chain_time() < GENESIS_TIME + INTERVAL);
    assert!(!net.chain.chain_id().is_zero());
}
