//! The [`Table`] trait and order-preserving key encoding.

use calder_primitives::{
    AccountId, Address, BalanceId, BlockId, ChainProperty, FeedIndex, Hash160, MarketHistoryKey,
    MarketIndexKey, Price, TimeGranularity, Timestamp, TransactionId,
};
use serde::{de::DeserializeOwned, Serialize};

/// A typed table of the persistent index layer.
///
/// Implementors are unit types; the associated key and value types fix the
/// table's schema and `NAME` its on-disk tree.
pub trait Table: Send + Sync + 'static {
    /// On-disk name of the table.
    const NAME: &'static str;
    /// Key type; its [`KeyEncode`] byte form must sort like its `Ord`.
    type Key: KeyEncode + Ord + Clone + Serialize + DeserializeOwned;
    /// Value type, stored in packed form.
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync;
}

/// Byte-order-preserving key encoding.
///
/// The encoded bytes must compare (as unsigned byte strings) exactly like the
/// key values themselves, so that the engine's lexicographic iteration yields
/// keys in logical order.
pub trait KeyEncode: Sized + Send + Sync {
    /// Encodes the key.
    fn encode_key(&self) -> Vec<u8>;
    /// Decodes a key previously produced by [`KeyEncode::encode_key`].
    fn decode_key(bytes: &[u8]) -> Option<Self>;
}

impl KeyEncode for u8 {
    fn encode_key(&self) -> Vec<u8> {
        vec![*self]
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [byte] => Some(*byte),
            _ => None,
        }
    }
}

impl KeyEncode for u32 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl KeyEncode for u64 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl KeyEncode for u128 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        Some(u128::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl KeyEncode for i64 {
    fn encode_key(&self) -> Vec<u8> {
        // Flipping the sign bit maps the signed order onto the unsigned one.
        ((*self as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        let raw = u64::from_be_bytes(bytes.try_into().ok()?);
        Some((raw ^ (1 << 63)) as i64)
    }
}

impl KeyEncode for String {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl KeyEncode for Hash160 {
    fn encode_key(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        Some(Hash160(bytes.try_into().ok()?))
    }
}

macro_rules! delegate_to_hash160 {
    ($($name:ident),*) => {
        $(
            impl KeyEncode for $name {
                fn encode_key(&self) -> Vec<u8> {
                    self.0.encode_key()
                }

                fn decode_key(bytes: &[u8]) -> Option<Self> {
                    Hash160::decode_key(bytes).map($name)
                }
            }
        )*
    };
}

delegate_to_hash160!(BlockId, TransactionId, BalanceId, Address);

impl KeyEncode for Timestamp {
    fn encode_key(&self) -> Vec<u8> {
        self.0.encode_key()
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        u32::decode_key(bytes).map(Timestamp)
    }
}

impl KeyEncode for ChainProperty {
    fn encode_key(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        use ChainProperty::*;
        match u8::decode_key(bytes)? {
            0 => Some(DatabaseVersion),
            1 => Some(ChainId),
            2 => Some(ActiveDelegateList),
            3 => Some(LastRandomSeed),
            4 => Some(LastAssetId),
            5 => Some(LastAccountId),
            6 => Some(LastObjectId),
            7 => Some(RequiredConfirmations),
            _ => None,
        }
    }
}

impl KeyEncode for Price {
    fn encode_key(&self) -> Vec<u8> {
        // Pair first, ratio second: matches `Ord` for `Price` and keeps each
        // market's book contiguous.
        let mut out = Vec::with_capacity(4 + 4 + 16);
        out.extend_from_slice(&self.quote_asset_id.encode_key());
        out.extend_from_slice(&self.base_asset_id.encode_key());
        out.extend_from_slice(&self.ratio.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        Some(Price {
            quote_asset_id: u32::decode_key(&bytes[..4])?,
            base_asset_id: u32::decode_key(&bytes[4..8])?,
            ratio: u128::decode_key(&bytes[8..])?,
        })
    }
}

impl KeyEncode for MarketIndexKey {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = self.order_price.encode_key();
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(&self.expiration.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 + 20 + 4 {
            return None;
        }
        Some(MarketIndexKey {
            order_price: Price::decode_key(&bytes[..24])?,
            owner: Address::decode_key(&bytes[24..44])?,
            expiration: Timestamp::decode_key(&bytes[44..])?,
        })
    }
}

impl KeyEncode for FeedIndex {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = self.quote_asset_id.encode_key();
        out.extend_from_slice(&self.delegate_id.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        Some(FeedIndex {
            quote_asset_id: u32::decode_key(&bytes[..4])?,
            delegate_id: u32::decode_key(&bytes[4..])?,
        })
    }
}

impl KeyEncode for MarketHistoryKey {
    fn encode_key(&self) -> Vec<u8> {
        let granularity = match self.granularity {
            TimeGranularity::Second => 0u8,
            TimeGranularity::Minute => 1,
            TimeGranularity::Hour => 2,
            TimeGranularity::Day => 3,
        };
        let mut out = self.quote_asset_id.encode_key();
        out.extend_from_slice(&self.base_asset_id.encode_key());
        out.push(granularity);
        out.extend_from_slice(&self.timestamp.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 13 {
            return None;
        }
        let granularity = match bytes[8] {
            0 => TimeGranularity::Second,
            1 => TimeGranularity::Minute,
            2 => TimeGranularity::Hour,
            3 => TimeGranularity::Day,
            _ => return None,
        };
        Some(MarketHistoryKey {
            quote_asset_id: u32::decode_key(&bytes[..4])?,
            base_asset_id: u32::decode_key(&bytes[4..8])?,
            granularity,
            timestamp: Timestamp::decode_key(&bytes[9..])?,
        })
    }
}

impl KeyEncode for (AccountId, TransactionId) {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = self.0.encode_key();
        out.extend_from_slice(&self.1.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        Some((u32::decode_key(&bytes[..4])?, TransactionId::decode_key(&bytes[4..])?))
    }
}

impl KeyEncode for (Address, TransactionId) {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = self.0.encode_key();
        out.extend_from_slice(&self.1.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 40 {
            return None;
        }
        Some((Address::decode_key(&bytes[..20])?, TransactionId::decode_key(&bytes[20..])?))
    }
}

impl KeyEncode for (u32, u32) {
    fn encode_key(&self) -> Vec<u8> {
        let mut out = self.0.encode_key();
        out.extend_from_slice(&self.1.encode_key());
        out
    }

    fn decode_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        Some((u32::decode_key(&bytes[..4])?, u32::decode_key(&bytes[4..])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_keys_preserve_order() {
        let values = [-5i64, -1, 0, 1, i64::MAX, i64::MIN];
        let mut encoded: Vec<(Vec<u8>, i64)> =
            values.iter().map(|v| (v.encode_key(), *v)).collect();
        encoded.sort();
        let decoded: Vec<i64> = encoded.iter().map(|(_, v)| *v).collect();
        assert_eq!(decoded, vec![i64::MIN, -5, -1, 0, 1, i64::MAX]);
    }

    #[test]
    fn market_keys_round_trip_and_preserve_order() {
        let key = |ratio: u128, owner: u8| MarketIndexKey {
            order_price: Price { ratio, quote_asset_id: 1, base_asset_id: 0 },
            owner: Address(Hash160([owner; 20])),
            expiration: Timestamp(9),
        };
        let a = key(10, 0);
        let b = key(10, 1);
        let c = key(11, 0);

        for k in [&a, &b, &c] {
            assert_eq!(MarketIndexKey::decode_key(&k.encode_key()).unwrap(), *k);
        }
        assert!(a.encode_key() < b.encode_key());
        assert!(b.encode_key() < c.encode_key());
    }

    #[test]
    fn numeric_keys_are_big_endian() {
        assert!(1u32.encode_key() < 256u32.encode_key());
        assert!(255u64.encode_key() < 256u64.encode_key());
    }
}
