//! Block headers, bodies and stored block records.

use crate::{
    crypto, packing, BlockNumber, Hash160, Hash256, PublicKey, RandomSeed, ShareAmount,
    Signature, SignedTransaction, Timestamp, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a block: `ripemd160(sha512(pack(signed header)))`.
///
/// The all-zero id denotes the (virtual) predecessor of genesis.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub Hash160);

impl BlockId {
    /// The id every genesis block links to.
    pub const GENESIS_PARENT: BlockId = BlockId(Hash160([0; 20]));

    /// `true` for the virtual genesis parent.
    pub fn is_genesis_parent(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// A delegate's revealed secret or the hash committing to the next one.
pub type SecretHash = Hash160;

/// Hashes a revealed secret for comparison against the producer's prior
/// commitment.
pub fn hash_secret(secret: &SecretHash) -> SecretHash {
    crypto::ripemd160(secret.as_bytes())
}

/// The consensus fields of a block header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Id of the parent block; all-zero for genesis.
    pub previous: BlockId,
    /// Height of this block.
    pub block_num: BlockNumber,
    /// Slot-aligned production time.
    pub timestamp: Timestamp,
    /// Digest of the contained transaction list.
    pub transaction_digest: Hash256,
    /// The secret the producer committed to in its previous block.
    pub previous_secret: SecretHash,
    /// Commitment to the secret revealed with the producer's next block.
    pub next_secret_hash: SecretHash,
}

/// A block header with the producer's signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedBlockHeader {
    /// The unsigned header.
    pub header: BlockHeader,
    /// The producing delegate's recoverable signature over
    /// [`BlockHeader::digest`].
    pub delegate_signature: Signature,
}

impl BlockHeader {
    /// The digest the producer signs.
    pub fn digest(&self) -> Hash256 {
        crypto::sha256(&packing::pack(self))
    }
}

impl SignedBlockHeader {
    /// The block id.
    pub fn id(&self) -> BlockId {
        BlockId(crypto::ripemd160_sha512(&packing::pack(self)))
    }

    /// Recovers the producing delegate's key from the signature.
    pub fn signee(&self) -> Result<PublicKey, secp256k1::Error> {
        self.delegate_signature.recover(&self.header.digest())
    }

    /// Signs the header with the producing delegate's key.
    pub fn sign(header: BlockHeader, secret: &secp256k1::SecretKey) -> Self {
        let digest = header.digest();
        Self { header, delegate_signature: Signature::sign(secret, &digest) }
    }
}

/// A full block as shipped on the wire: signed header plus transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullBlock {
    /// The signed header.
    pub signed_header: SignedBlockHeader,
    /// The contained user transactions, in application order.
    pub user_transactions: Vec<SignedTransaction>,
}

impl FullBlock {
    /// The block id.
    pub fn id(&self) -> BlockId {
        self.signed_header.id()
    }

    /// The block height.
    pub fn block_num(&self) -> BlockNumber {
        self.signed_header.header.block_num
    }

    /// The production timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.signed_header.header.timestamp
    }

    /// The parent block id.
    pub fn previous(&self) -> BlockId {
        self.signed_header.header.previous
    }

    /// Packed size of the full block, in bytes.
    pub fn block_size(&self) -> usize {
        packing::pack(self).len()
    }

    /// Digest of the contained transaction list, recomputed.
    pub fn calculate_transaction_digest(&self) -> Hash256 {
        crypto::sha256(&packing::pack(&self.user_transactions))
    }

    /// `true` when no two contained transactions share an id.
    pub fn validate_unique_transactions(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.user_transactions.len());
        self.user_transactions.iter().all(|trx| seen.insert(trx.id()))
    }
}

/// Fork-tree bookkeeping for one (possibly not yet received) block.
///
/// A placeholder node has `is_known = false`: some child referenced the block
/// before it arrived. The genesis node has every flag set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockForkData {
    /// We hold the full block body.
    pub is_known: bool,
    /// The ancestor chain reaches genesis.
    pub is_linked: bool,
    /// Validation outcome; `None` until the block is first applied.
    pub is_valid: Option<bool>,
    /// Why the block was marked invalid.
    pub invalid_reason: Option<String>,
    /// The block is on the current main chain.
    pub is_included: bool,
    /// Ids of the known children.
    pub next_blocks: std::collections::BTreeSet<BlockId>,
}

impl BlockForkData {
    /// `true` when the block could be switched to: linked and not known
    /// invalid.
    pub fn can_link(&self) -> bool {
        self.is_linked && self.is_valid != Some(false)
    }

    /// `true` when the block has been validated.
    pub fn is_valid(&self) -> bool {
        self.is_valid == Some(true)
    }

    /// `true` when the block has been found invalid.
    pub fn is_invalid(&self) -> bool {
        self.is_valid == Some(false)
    }
}

/// The stored record of a known block: header plus bookkeeping only derived
/// locally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// The signed header.
    pub signed_header: SignedBlockHeader,
    /// Packed size of the full block, in bytes.
    pub block_size: u64,
    /// Seconds between production time and local receipt.
    pub latency_secs: u32,
    /// Wall-clock milliseconds spent applying the block locally.
    pub processing_time_ms: u64,
    /// New shares minted for the producing delegate.
    pub signee_shares_issued: ShareAmount,
    /// Fee-pool shares released to the producing delegate.
    pub signee_fees_collected: ShareAmount,
    /// Fee-pool shares destroyed instead of released.
    pub signee_fees_destroyed: ShareAmount,
    /// The random seed after applying this block.
    pub random_seed: RandomSeed,
    /// Ids of the contained transactions, in order.
    pub user_transaction_ids: Vec<TransactionId>,
}

impl BlockRecord {
    /// A record for a freshly received block, before it is applied.
    pub fn new(block: &FullBlock, latency_secs: u32) -> Self {
        Self {
            signed_header: block.signed_header.clone(),
            block_size: block.block_size() as u64,
            latency_secs,
            processing_time_ms: 0,
            signee_shares_issued: 0,
            signee_fees_collected: 0,
            signee_fees_destroyed: 0,
            random_seed: RandomSeed::default(),
            user_transaction_ids: block.user_transactions.iter().map(|t| t.id()).collect(),
        }
    }

    /// The block id.
    pub fn id(&self) -> BlockId {
        self.signed_header.id()
    }

    /// The block height.
    pub fn block_num(&self) -> BlockNumber {
        self.signed_header.header.block_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_key() -> secp256k1::SecretKey {
        secp256k1::SecretKey::from_slice(&[0x42; 32]).unwrap()
    }

    fn sample_header(num: BlockNumber) -> BlockHeader {
        BlockHeader {
            previous: BlockId::GENESIS_PARENT,
            block_num: num,
            timestamp: Timestamp(num * 10),
            transaction_digest: Hash256::default(),
            previous_secret: SecretHash::default(),
            next_secret_hash: SecretHash::default(),
        }
    }

    #[test]
    fn signee_recovery() {
        let secret = secret_key();
        let signed = SignedBlockHeader::sign(sample_header(1), &secret);
        assert_eq!(signed.signee().unwrap(), PublicKey::from_secret(&secret));
    }

    #[test]
    fn id_commits_to_signature() {
        let header = sample_header(1);
        let a = SignedBlockHeader::sign(header.clone(), &secret_key());
        let b = SignedBlockHeader::sign(
            header,
            &secp256k1::SecretKey::from_slice(&[0x43; 32]).unwrap(),
        );
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn duplicate_transactions_detected() {
        let trx = SignedTransaction {
            transaction: crate::Transaction { expiration: Timestamp(5), operations: vec![] },
            signatures: vec![],
        };
        let block = FullBlock {
            signed_header: SignedBlockHeader::sign(sample_header(2), &secret_key()),
            user_transactions: vec![trx.clone(), trx],
        };
        assert!(!block.validate_unique_transactions());
    }
}
