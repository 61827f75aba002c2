//! Transactions, operations and their stored records.

use crate::{
    crypto, packing, AccountId, AssetAmount, AssetId, BalanceId, BlockNumber, ChainId,
    ClaimCondition, Hash160, Price, PublicKey, ShareAmount, Signature, SlateId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Identifier of a transaction: `ripemd160(sha512(pack(unsigned trx)))`.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(pub Hash160);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

/// One state transition inside a transaction.
///
/// Handlers live in the chain crate; this enum is only the wire form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Register a new account, optionally as a delegate.
    RegisterAccount {
        /// Unique account name.
        name: String,
        /// The owning key.
        owner_key: PublicKey,
        /// Delegate pay rate in percent; `Some` registers a delegate.
        delegate_pay_rate: Option<u8>,
    },
    /// Update an existing account.
    UpdateAccount {
        /// The account to update.
        account_id: AccountId,
        /// New delegate pay rate; only valid for delegates.
        pay_rate: Option<u8>,
        /// New active key.
        active_key: Option<PublicKey>,
    },
    /// Withdraw from a balance record. Requires the owner's signature.
    Withdraw {
        /// The balance to withdraw from.
        balance_id: BalanceId,
        /// Amount to withdraw, in the balance's asset.
        amount: ShareAmount,
    },
    /// Deposit into the balance record implied by the condition.
    Deposit {
        /// Amount to deposit.
        amount: ShareAmount,
        /// The asset deposited.
        asset_id: AssetId,
        /// The vote slate the deposited amount supports; `0` for none.
        slate_id: SlateId,
        /// The claim condition of the target balance.
        condition: ClaimCondition,
    },
    /// Register a new user-issued asset. The signer becomes the issuer.
    CreateAsset {
        /// Unique ticker symbol.
        symbol: String,
        /// Display name.
        name: String,
        /// Free-form description.
        description: String,
        /// Base units per whole display unit.
        precision: u64,
        /// Hard supply cap, in base units.
        maximum_supply: ShareAmount,
    },
    /// Mint supply of a user-issued asset to a condition.
    IssueAsset {
        /// The amount to mint.
        amount: AssetAmount,
        /// The claim condition receiving the minted shares.
        condition: ClaimCondition,
    },
    /// Place a bid order: buy base with the withdrawn quote amount.
    SubmitBid {
        /// The order owner.
        owner: crate::Address,
        /// Quote amount escrowed into the order.
        amount: ShareAmount,
        /// Limit price.
        price: Price,
    },
    /// Place an ask order: sell the withdrawn base amount.
    SubmitAsk {
        /// The order owner.
        owner: crate::Address,
        /// Base amount escrowed into the order.
        amount: ShareAmount,
        /// Limit price.
        price: Price,
    },
    /// Place a short order backing a market-issued asset with base-asset
    /// collateral.
    SubmitShort {
        /// The order owner.
        owner: crate::Address,
        /// Base-asset collateral escrowed into the order.
        collateral: ShareAmount,
        /// Annual interest rate offered, in parts per million.
        interest_rate_ppm: u32,
        /// The market-issued asset being shorted.
        quote_asset_id: AssetId,
    },
    /// Pay down a cover position's debt.
    Cover {
        /// The amount of debt repaid, in the cover's quote asset.
        amount: ShareAmount,
        /// The collateral position being covered.
        cover_owner: crate::Address,
        /// Price key of the collateral position.
        cover_price: Price,
        /// Expiration key of the collateral position.
        cover_expiration: Timestamp,
    },
    /// Add base-asset collateral to an existing cover position.
    AddCollateral {
        /// The added collateral amount.
        amount: ShareAmount,
        /// The collateral position.
        cover_owner: crate::Address,
        /// Price key of the collateral position.
        cover_price: Price,
        /// Expiration key of the collateral position.
        cover_expiration: Timestamp,
    },
    /// Cancel a resting order, returning its escrow to the owner.
    CancelOrder {
        /// Which book the order rests in.
        kind: crate::market::OrderKind,
        /// The order owner.
        owner: crate::Address,
        /// The order's limit price.
        price: Price,
        /// The order's expiration key.
        expiration: Timestamp,
    },
    /// Register a delegate vote slate for later reference by deposits.
    DefineSlate {
        /// The delegates the slate supports.
        supported_delegates: Vec<AccountId>,
    },
    /// Publish a price feed. The signer must be an active delegate.
    PublishFeed {
        /// The publishing delegate.
        delegate_id: AccountId,
        /// The quoted price; base asset is implicit in the price pair.
        price: Price,
    },
    /// Destroy shares, optionally on an account's public record.
    Burn {
        /// The amount destroyed.
        amount: AssetAmount,
        /// The account the burn is recorded for.
        account_id: AccountId,
        /// Public burn message.
        message: String,
    },
}

impl Operation {
    /// A short mnemonic for logs and blacklists.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Operation::RegisterAccount { .. } => "register_account",
            Operation::UpdateAccount { .. } => "update_account",
            Operation::Withdraw { .. } => "withdraw",
            Operation::Deposit { .. } => "deposit",
            Operation::CreateAsset { .. } => "create_asset",
            Operation::IssueAsset { .. } => "issue_asset",
            Operation::SubmitBid { .. } => "submit_bid",
            Operation::SubmitAsk { .. } => "submit_ask",
            Operation::SubmitShort { .. } => "submit_short",
            Operation::Cover { .. } => "cover",
            Operation::AddCollateral { .. } => "add_collateral",
            Operation::CancelOrder { .. } => "cancel_order",
            Operation::DefineSlate { .. } => "define_slate",
            Operation::PublishFeed { .. } => "publish_feed",
            Operation::Burn { .. } => "burn",
        }
    }
}

/// The unsigned body of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// The transaction is invalid in blocks at or after this time.
    pub expiration: Timestamp,
    /// The operations applied in order.
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// The transaction id, independent of signatures.
    pub fn id(&self) -> TransactionId {
        TransactionId(crypto::ripemd160_sha512(&packing::pack(self)))
    }

    /// The digest signatures commit to, bound to a chain.
    pub fn digest(&self, chain_id: &ChainId) -> crate::Hash256 {
        let mut preimage = packing::pack(self);
        preimage.extend_from_slice(chain_id.as_bytes());
        crypto::sha256(&preimage)
    }
}

/// A transaction together with its claim signatures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The unsigned body.
    pub transaction: Transaction,
    /// Recoverable signatures over [`Transaction::digest`].
    pub signatures: Vec<Signature>,
}

impl SignedTransaction {
    /// The transaction id, independent of signatures.
    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Packed size of the signed form, in bytes.
    pub fn data_size(&self) -> usize {
        packing::pack(self).len()
    }

    /// Signs the body with `secret`, appending the signature.
    pub fn sign(&mut self, secret: &secp256k1::SecretKey, chain_id: &ChainId) {
        let digest = self.transaction.digest(chain_id);
        self.signatures.push(Signature::sign(secret, &digest));
    }

    /// Recovers the signer keys from all attached signatures.
    pub fn recover_signers(
        &self,
        chain_id: &ChainId,
    ) -> Result<Vec<PublicKey>, secp256k1::Error> {
        let digest = self.transaction.digest(chain_id);
        self.signatures.iter().map(|sig| sig.recover(&digest)).collect()
    }
}

/// A recorded share burn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnRecord {
    /// The destroyed amount.
    pub amount: AssetAmount,
    /// Public burn message.
    pub message: String,
}

/// Where in the chain a transaction was included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLocation {
    /// The including block.
    pub block_num: BlockNumber,
    /// Position inside the block.
    pub trx_num: u32,
}

/// The stored record of an included transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Where the transaction was included.
    pub location: TransactionLocation,
    /// The signed transaction.
    pub trx: SignedTransaction,
    /// Fees collected per asset while evaluating it.
    pub fees: BTreeMap<AssetId, ShareAmount>,
}

impl TransactionRecord {
    /// Total fees collected in the base asset.
    pub fn base_fees(&self) -> ShareAmount {
        self.fees.get(&0).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        Transaction {
            expiration: Timestamp(1_000),
            operations: vec![Operation::Burn {
                amount: AssetAmount::new(5, 0),
                account_id: 1,
                message: "test".into(),
            }],
        }
    }

    #[test]
    fn id_ignores_signatures() {
        let trx = sample_transaction();
        let unsigned_id = trx.id();

        let mut signed = SignedTransaction { transaction: trx, signatures: vec![] };
        signed.sign(&secp256k1::SecretKey::from_slice(&[7; 32]).unwrap(), &ChainId::default());
        assert_eq!(signed.id(), unsigned_id);
    }

    #[test]
    fn digest_binds_chain_id() {
        let trx = sample_transaction();
        let a = trx.digest(&crate::Hash256([1; 32]));
        let b = trx.digest(&crate::Hash256([2; 32]));
        assert_ne!(a, b);
    }
}
