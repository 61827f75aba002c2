//! Bit-exact wire packing.
//!
//! All consensus digests (block ids, transaction ids, balance ids, the chain
//! id) are computed over this encoding, so it must be deterministic:
//! fixed-width little-endian integers and length-prefixed sequences.

use serde::{de::DeserializeOwned, Serialize};

/// Packs a value into its canonical wire form.
pub fn pack<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("wire packing cannot fail for in-memory values")
}

/// Unpacks a value from its canonical wire form.
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_fixed_width() {
        assert_eq!(pack(&1u32).len(), 4);
        assert_eq!(pack(&1u64).len(), 8);
        assert_eq!(pack(&(-1i64)).len(), 8);
    }

    #[test]
    fn sequences_are_length_prefixed() {
        let empty: Vec<u32> = vec![];
        assert_eq!(pack(&empty).len(), 8);
        assert_eq!(pack(&vec![7u32]).len(), 8 + 4);
    }

    #[test]
    fn round_trip() {
        let value = (42u32, String::from("calder"), vec![1u8, 2, 3]);
        let packed = pack(&value);
        let unpacked: (u32, String, Vec<u8>) = unpack(&packed).unwrap();
        assert_eq!(unpacked, value);
    }
}
