//! The genesis description record.
//!
//! Supplied as a JSON document or as the length-prefixed binary packing of
//! the same structure; the chain id is the SHA-256 of the packed form.

use crate::{crypto, packing, Address, ChainId, PublicKey, ShareAmount, Timestamp};
use serde::{Deserialize, Serialize};

/// Legacy address prefixes accepted in raw genesis balances.
const LEGACY_PREFIXES: [&str; 4] = ["XTS", "BTS", "DVS", "KEY"];

/// An initial delegate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisDelegate {
    /// Account name.
    pub name: String,
    /// Owner (and initial signing) key.
    pub owner: PublicKey,
}

/// An initial balance snapshotted from another chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisBalance {
    /// Address in its original chain's format.
    pub raw_address: String,
    /// Amount in base-asset units.
    pub balance: ShareAmount,
}

/// A batch of vesting balances sharing one schedule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisVesting {
    /// When vesting starts.
    pub start_time: Timestamp,
    /// Vesting duration in days.
    pub duration_days: u32,
    /// The vesting balances.
    pub balances: Vec<GenesisBalance>,
}

/// A market-issued asset created at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAsset {
    /// Ticker symbol.
    pub symbol: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Base units per whole display unit.
    pub precision: u64,
}

/// The full genesis description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Timestamp of the genesis state; the first block must come after it.
    pub timestamp: Timestamp,
    /// The initial delegates, in account-id order.
    pub delegates: Vec<GenesisDelegate>,
    /// Immediately spendable initial balances.
    pub initial_balances: Vec<GenesisBalance>,
    /// Vesting initial balances.
    pub vesting_balances: GenesisVesting,
    /// Market-issued assets to create.
    pub market_assets: Vec<GenesisAsset>,
}

impl Default for GenesisDelegate {
    fn default() -> Self {
        // A throwaway well-known key; real genesis files always override it.
        let secret = secp256k1::SecretKey::from_slice(&[1u8; 32]).expect("valid key bytes");
        Self { name: String::new(), owner: PublicKey::from_secret(&secret) }
    }
}

impl GenesisState {
    /// The chain id of this description: SHA-256 over the packed form.
    pub fn chain_id(&self) -> ChainId {
        crypto::sha256(&packing::pack(self))
    }
}

/// Converts a raw genesis address into a native address.
///
/// Accepts a plain 40-hex-digit address or one carrying a known legacy
/// prefix; anything else is rejected.
pub fn convert_raw_address(raw: &str) -> Option<Address> {
    let stripped = LEGACY_PREFIXES
        .iter()
        .find_map(|prefix| raw.strip_prefix(prefix))
        .unwrap_or(raw);
    stripped.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_changes_with_content() {
        let a = GenesisState::default();
        let mut b = GenesisState::default();
        b.timestamp = Timestamp(1);
        assert_ne!(a.chain_id(), b.chain_id());
    }

    #[test]
    fn raw_address_prefixes() {
        let hex = "00".repeat(20);
        assert!(convert_raw_address(&hex).is_some());
        assert!(convert_raw_address(&format!("XTS{hex}")).is_some());
        assert!(convert_raw_address(&format!("BTS{hex}")).is_some());
        assert!(convert_raw_address("XTSnot-hex").is_none());
        assert!(convert_raw_address("tooshort").is_none());
    }
}
