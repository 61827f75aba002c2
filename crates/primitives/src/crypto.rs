//! Digest helpers and the thin wrappers around recoverable secp256k1 keys.
//!
//! The engine only hashes, verifies and recovers; key generation and storage
//! belong to the wallet.

use crate::{Hash160, Hash256};
use ripemd::Ripemd160;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, Secp256k1, SecretKey, SECP256K1,
};
use sha2::{Digest, Sha256, Sha512};
use std::{fmt, str::FromStr};

/// RIPEMD-160 of the input bytes.
pub fn ripemd160(data: &[u8]) -> Hash160 {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    Hash160(hasher.finalize().into())
}

/// RIPEMD-160 over a SHA-512 preimage, the id construction used for blocks,
/// transactions, balances and addresses.
pub fn ripemd160_sha512(data: &[u8]) -> Hash160 {
    let digest = Sha512::digest(data);
    ripemd160(&digest)
}

/// SHA-256 of the input bytes.
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(data).into())
}

/// A compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub secp256k1::PublicKey);

impl PublicKey {
    /// Returns the 33-byte compressed encoding.
    #[inline]
    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }

    /// Derives the public key for a secret key.
    pub fn from_secret(secret: &SecretKey) -> Self {
        Self(secret.public_key(SECP256K1))
    }

    /// The address derived from this key.
    pub fn address(&self) -> Address {
        Address(ripemd160_sha512(&self.serialize()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.serialize()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = secp256k1::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| secp256k1::Error::InvalidPublicKey)?;
        Ok(Self(secp256k1::PublicKey::from_slice(&bytes)?))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.serialize())
        }
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = PublicKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a compressed secp256k1 public key")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                secp256k1::PublicKey::from_slice(v).map(PublicKey).map_err(E::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(Visitor)
        } else {
            deserializer.deserialize_bytes(Visitor)
        }
    }
}

/// A 160-bit account/balance owner address: `ripemd160(sha512(pubkey))`.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Address(pub Hash160);

impl Address {
    /// Returns the address as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<PublicKey> for Address {
    fn from(key: PublicKey) -> Self {
        key.address()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Address)
    }
}

/// A 65-byte recoverable ECDSA signature: recovery id followed by `r || s`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 33], pub [u8; 32]);

// `serde`'s built-in array impls only cover lengths up to 32, so the 33-byte
// head field can't use `#[derive(Serialize, Deserialize)]` directly. These
// impls replicate exactly what the derive would generate (a 2-element tuple
// struct, each field serialized element-by-element) so the wire format is
// unchanged.
impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTupleStruct;
        struct Head<'a>(&'a [u8; 33]);
        impl serde::Serialize for Head<'_> {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                use serde::ser::SerializeTuple;
                let mut tup = serializer.serialize_tuple(33)?;
                for byte in self.0 {
                    tup.serialize_element(byte)?;
                }
                tup.end()
            }
        }

        let mut ts = serializer.serialize_tuple_struct("Signature", 2)?;
        ts.serialize_field(&Head(&self.0))?;
        ts.serialize_field(&self.1)?;
        ts.end()
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Head([u8; 33]);
        impl<'de> serde::Deserialize<'de> for Head {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HeadVisitor;
                impl<'de> serde::de::Visitor<'de> for HeadVisitor {
                    type Value = Head;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("a 33-byte array")
                    }

                    fn visit_seq<A: serde::de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<Self::Value, A::Error> {
                        let mut buf = [0u8; 33];
                        for (i, slot) in buf.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                        }
                        Ok(Head(buf))
                    }
                }
                deserializer.deserialize_tuple(33, HeadVisitor)
            }
        }

        struct SignatureVisitor;
        impl<'de> serde::de::Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a Signature tuple struct")
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let head: Head = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let tail: [u8; 32] = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                Ok(Signature(head.0, tail))
            }
        }

        deserializer.deserialize_tuple_struct("Signature", 2, SignatureVisitor)
    }
}

impl Signature {
    /// Signs a 32-byte digest, producing a recoverable signature.
    pub fn sign(secret: &SecretKey, digest: &Hash256) -> Self {
        let message = Message::from_digest(digest.0);
        let sig = SECP256K1.sign_ecdsa_recoverable(&message, secret);
        Self::from_recoverable(sig)
    }

    /// Recovers the signing public key from a 32-byte digest.
    pub fn recover(&self, digest: &Hash256) -> Result<PublicKey, secp256k1::Error> {
        let message = Message::from_digest(digest.0);
        let sig = self.to_recoverable()?;
        let secp = Secp256k1::verification_only();
        Ok(PublicKey(secp.recover_ecdsa(&message, &sig)?))
    }

    /// Returns `true` if the signature is in canonical (low-s) form.
    pub fn is_canonical(&self) -> bool {
        // The upper half of the curve order starts at 0x7fff...5d576e73.
        const HALF_ORDER: [u8; 32] = [
            0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46,
            0x68, 0x1b, 0x20, 0xa0,
        ];
        self.1 <= HALF_ORDER
    }

    fn from_recoverable(sig: RecoverableSignature) -> Self {
        let (rec_id, data) = sig.serialize_compact();
        let mut head = [0u8; 33];
        head[0] = rec_id.to_i32() as u8;
        head[1..].copy_from_slice(&data[..32]);
        let mut s = [0u8; 32];
        s.copy_from_slice(&data[32..]);
        Self(head, s)
    }

    fn to_recoverable(&self) -> Result<RecoverableSignature, secp256k1::Error> {
        let rec_id = RecoveryId::from_i32(self.0[0] as i32)?;
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&self.0[1..]);
        data[32..].copy_from_slice(&self.1);
        RecoverableSignature::from_compact(&data, rec_id)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}{})", hex::encode(self.0), hex::encode(self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing;

    fn test_key(fill: u8) -> SecretKey {
        SecretKey::from_slice(&[fill; 32]).unwrap()
    }

    #[test]
    fn sign_and_recover() {
        let secret = test_key(0x11);
        let key = PublicKey::from_secret(&secret);
        let digest = sha256(b"payload");

        let sig = Signature::sign(&secret, &digest);
        assert_eq!(sig.recover(&digest).unwrap(), key);
    }

    #[test]
    fn recover_with_wrong_digest_mismatches() {
        let secret = test_key(0x22);
        let key = PublicKey::from_secret(&secret);
        let sig = Signature::sign(&secret, &sha256(b"a"));

        let recovered = sig.recover(&sha256(b"b")).unwrap();
        assert_ne!(recovered, key);
    }

    #[test]
    fn address_is_stable_across_encodings() {
        let key = PublicKey::from_secret(&test_key(0x33));
        let packed = packing::pack(&key.address());
        let unpacked: Address = packing::unpack(&packed).unwrap();
        assert_eq!(unpacked, key.address());
    }
}
