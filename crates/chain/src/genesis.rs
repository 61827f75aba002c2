//! Genesis bootstrap: building block-zero state from a description record.

use crate::{
    chain::ChainDatabase,
    error::{ChainResult, GenesisError},
    state::{ChainRead, PendingState},
};
use calder_primitives::{
    convert_raw_address, crypto, packing, AccountRecord, AssetIssuer, AssetRecord,
    BalanceRecord, ChainId, ChainProperty, ClaimCondition, DelegateStats, GenesisState, Hash256,
    PropertyValue, PublicKey, ShareAmount, SnapshotRecord, WithdrawCondition,
};
use std::{collections::BTreeMap, path::PathBuf};
use tracing::{info, warn};

/// Digest of the packed mainnet genesis description.
///
/// The chain id was announced (and baked into peers and seed nodes) before
/// the description was frozen in its final packed form; a genesis hashing to
/// this value is therefore pinned to [`DESIRED_CHAIN_ID`] instead of the
/// digest itself.
pub const EXPECTED_CHAIN_ID: ChainId = Hash256([
    0x8f, 0x2b, 0xd2, 0x41, 0x5b, 0x0c, 0x9e, 0xa6, 0x33, 0x7a, 0x0d, 0x5e, 0xc1, 0x44, 0x9a,
    0x0f, 0x7c, 0x62, 0x8b, 0xd0, 0x25, 0x19, 0xee, 0x41, 0xa8, 0x06, 0x57, 0xf2, 0x4c, 0xa3,
    0x19, 0x6d,
]);

/// The pre-agreed mainnet chain id substituted for [`EXPECTED_CHAIN_ID`].
pub const DESIRED_CHAIN_ID: ChainId = Hash256([
    0x41, 0x8a, 0xc0, 0x4e, 0x78, 0x2d, 0x1a, 0x14, 0x96, 0xf3, 0x5d, 0x86, 0x4f, 0x0b, 0x5a,
    0xe8, 0x09, 0x17, 0x3e, 0x5c, 0xd1, 0x2a, 0x90, 0xbf, 0x6a, 0xc2, 0x74, 0x88, 0x1e, 0x03,
    0xcb, 0x52,
]);

/// The chain id of a genesis description, with the mainnet pinning applied.
pub fn resolve_chain_id(state: &GenesisState) -> ChainId {
    let chain_id = state.chain_id();
    if chain_id == EXPECTED_CHAIN_ID {
        DESIRED_CHAIN_ID
    } else {
        chain_id
    }
}

/// Where the genesis description comes from.
#[derive(Clone, Debug)]
pub enum GenesisSource {
    /// An in-memory description.
    State(GenesisState),
    /// A file: `.json` documents or `.dat` binary packings.
    File(PathBuf),
}

impl GenesisSource {
    fn load(self) -> ChainResult<GenesisState> {
        match self {
            GenesisSource::State(state) => Ok(state),
            GenesisSource::File(path) => {
                let bytes = std::fs::read(&path).map_err(|err| {
                    GenesisError::UnreadableGenesisFile(format!("{}: {err}", path.display()))
                })?;
                match path.extension().and_then(|ext| ext.to_str()) {
                    Some("json") => serde_json::from_slice(&bytes).map_err(|err| {
                        GenesisError::UnreadableGenesisFile(format!(
                            "{}: {err}",
                            path.display()
                        ))
                        .into()
                    }),
                    Some("dat") => packing::unpack(&bytes).map_err(|err| {
                        GenesisError::UnreadableGenesisFile(format!(
                            "{}: {err}",
                            path.display()
                        ))
                        .into()
                    }),
                    _ => Err(GenesisError::UnreadableGenesisFile(format!(
                        "unknown genesis format {}",
                        path.display()
                    ))
                    .into()),
                }
            }
        }
    }
}

/// The well-known key owning the god account; it controls nothing.
pub(crate) fn god_key() -> PublicKey {
    let secret = secp256k1::SecretKey::from_slice(&[1u8; 32]).expect("valid key bytes");
    PublicKey::from_secret(&secret)
}

/// Builds genesis state into an empty chain, returning the chain id.
pub(crate) fn initialize_genesis(
    chain: &ChainDatabase,
    source: GenesisSource,
) -> ChainResult<ChainId> {
    if let Some(existing) =
        chain.get_property(ChainProperty::ChainId)?.and_then(|value| value.as_chain_id())
    {
        warn!(target: "chain", "genesis state already initialized");
        return Ok(existing);
    }

    let state = source.load()?;
    let chain_id = resolve_chain_id(&state);

    let config = chain.config();
    if state.delegates.len() < config.num_delegates {
        return Err(GenesisError::InvalidGenesisState(format!(
            "genesis names {} delegates, at least {} required",
            state.delegates.len(),
            config.num_delegates
        ))
        .into());
    }

    let timestamp = state.timestamp;
    let mut pending = PendingState::new(chain);

    // The god account holds the base asset's issuer slot.
    pending.store_account(AccountRecord {
        id: 0,
        name: "god".into(),
        owner_key: god_key(),
        active_keys: BTreeMap::new(),
        registration_date: timestamp,
        last_update: timestamp,
        delegate_info: None,
    });

    for (position, delegate) in state.delegates.iter().enumerate() {
        let id = position as u32 + 1;
        let mut record = AccountRecord {
            id,
            name: delegate.name.clone(),
            owner_key: delegate.owner,
            active_keys: BTreeMap::new(),
            registration_date: timestamp,
            last_update: timestamp,
            delegate_info: Some(DelegateStats::with_pay_rate(100)),
        };
        record.set_active_key(timestamp, delegate.owner);
        pending.store_account(record);
    }

    let mut total_base_supply: ShareAmount = 0;

    for genesis_balance in &state.initial_balances {
        let owner = convert_raw_address(&genesis_balance.raw_address)
            .ok_or_else(|| {
                GenesisError::InvalidLegacyAddress(genesis_balance.raw_address.clone())
            })?;
        let condition = WithdrawCondition {
            asset_id: 0,
            slate_id: 0,
            condition: ClaimCondition::Signature { owner },
        };
        let id = condition.balance_id();
        // Balances snapshotted twice under one address accumulate.
        let mut record = pending.get_balance(&id)?.unwrap_or(BalanceRecord {
            condition,
            balance: 0,
            last_update: timestamp,
            snapshot_info: None,
        });
        record.balance += genesis_balance.balance;
        record.snapshot_info = Some(SnapshotRecord {
            original_address: genesis_balance.raw_address.clone(),
            original_balance: genesis_balance.balance,
        });
        record.last_update = timestamp;
        pending.store_balance(record);
        total_base_supply += genesis_balance.balance;
    }

    let vesting = &state.vesting_balances;
    for genesis_balance in &vesting.balances {
        let owner = convert_raw_address(&genesis_balance.raw_address)
            .ok_or_else(|| {
                GenesisError::InvalidLegacyAddress(genesis_balance.raw_address.clone())
            })?;
        let condition = WithdrawCondition {
            asset_id: 0,
            slate_id: 0,
            condition: ClaimCondition::Vesting {
                owner,
                start_time: vesting.start_time,
                duration_secs: vesting.duration_days * 24 * 60 * 60,
                original_balance: genesis_balance.balance,
            },
        };
        let id = condition.balance_id();
        let mut record = pending.get_balance(&id)?.unwrap_or(BalanceRecord {
            condition,
            balance: 0,
            last_update: vesting.start_time,
            snapshot_info: None,
        });
        record.balance += genesis_balance.balance;
        record.snapshot_info = Some(SnapshotRecord {
            original_address: genesis_balance.raw_address.clone(),
            original_balance: genesis_balance.balance,
        });
        pending.store_balance(record);
        total_base_supply += genesis_balance.balance;
    }

    pending.store_asset(AssetRecord {
        id: 0,
        symbol: config.base_symbol.clone(),
        name: config.base_name.clone(),
        description: "native shares of the chain".into(),
        issuer: AssetIssuer::Account(0),
        precision: config.base_precision,
        registration_date: timestamp,
        last_update: timestamp,
        current_supply: total_base_supply,
        maximum_supply: config.max_shares,
        collected_fees: 0,
        flags: 0,
        issuer_permissions: 0,
    });

    let mut last_asset_id = 0u32;
    for market_asset in &state.market_assets {
        last_asset_id += 1;
        pending.store_asset(AssetRecord {
            id: last_asset_id,
            symbol: market_asset.symbol.clone(),
            name: market_asset.name.clone(),
            description: market_asset.description.clone(),
            issuer: AssetIssuer::Market,
            precision: market_asset.precision,
            registration_date: timestamp,
            last_update: timestamp,
            current_supply: 0,
            maximum_supply: config.max_shares,
            collected_fees: 0,
            flags: 0,
            issuer_permissions: 0,
        });
    }

    pending.set_property(ChainProperty::ChainId, PropertyValue::ChainId(chain_id));
    pending.set_property(ChainProperty::LastAssetId, PropertyValue::Int(last_asset_id as i64));
    pending.set_property(
        ChainProperty::LastAccountId,
        PropertyValue::Int(state.delegates.len() as i64),
    );
    pending.set_property(ChainProperty::LastObjectId, PropertyValue::Int(0));
    pending.set_property(
        ChainProperty::RequiredConfirmations,
        PropertyValue::Int(2 * config.num_delegates as i64),
    );

    let (delta, _) = pending.into_parts();
    chain.apply_delta(&delta)?;

    // The initial active list is the registration order of the delegates;
    // with zero votes cast the vote index yields exactly that.
    let active = chain.next_round_active_delegates();
    chain.apply_delta(&{
        let mut delta = calder_primitives::StateDelta::default();
        delta.properties.insert(
            ChainProperty::ActiveDelegateList,
            Some(PropertyValue::DelegateList(active)),
        );
        delta
    })?;

    chain.fork_db.store_genesis_node()?;
    chain.sanity_check()?;

    info!(
        target: "chain",
        %chain_id,
        delegates = state.delegates.len(),
        balances = state.initial_balances.len(),
        "genesis state initialized"
    );
    Ok(chain_id)
}

/// Digest of a packed genesis description, exposed for tooling.
pub fn genesis_state_hash(state: &GenesisState) -> ChainId {
    crypto::sha256(&packing::pack(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use calder_primitives::Timestamp;

    #[test]
    fn pinning_constants_are_distinct_and_nonzero() {
        assert_ne!(EXPECTED_CHAIN_ID, DESIRED_CHAIN_ID);
        assert!(!EXPECTED_CHAIN_ID.is_zero());
        assert!(!DESIRED_CHAIN_ID.is_zero());
    }

    #[test]
    fn ordinary_genesis_keeps_its_own_id() {
        let mut state = GenesisState::default();
        state.timestamp = Timestamp(42);
        assert_eq!(resolve_chain_id(&state), state.chain_id());
        assert_ne!(resolve_chain_id(&state), DESIRED_CHAIN_ID);
    }
}
