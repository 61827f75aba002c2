//! The fork database: a tree of all known block headers.
//!
//! Every block ever received (and every block merely referenced as a parent)
//! has a node carrying the `{known, linked, valid, included}` flags and the
//! set of its children. All cascades walk `next_blocks` in BFS layers; no
//! node holds an owning reference to another, so the tree is a strict
//! predecessor-directed DAG keyed by block id.

use crate::error::{ChainError, ChainResult, ForkTreeError};
use calder_db::{tables, IndexStore, StoreEnv};
use calder_primitives::{BlockForkData, BlockId, BlockNumber, BlockRecord, FullBlock};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// The fork tree plus the block archive it indexes.
#[derive(Debug)]
pub struct ForkDatabase {
    fork_data: IndexStore<tables::ForkData>,
    fork_number: IndexStore<tables::ForkNumber>,
    block_records: IndexStore<tables::BlockRecords>,
    block_data: IndexStore<tables::BlockData>,
}

impl ForkDatabase {
    /// Opens the fork tree over the two store environments.
    pub fn open(index_env: &StoreEnv, raw_chain_env: &StoreEnv) -> ChainResult<Self> {
        Ok(Self {
            fork_data: index_env.store()?,
            fork_number: index_env.store()?,
            block_records: index_env.store()?,
            block_data: raw_chain_env.store()?,
        })
    }

    /// The fork node of `id`, if any.
    pub fn get(&self, id: &BlockId) -> ChainResult<Option<BlockForkData>> {
        Ok(self.fork_data.get(id)?)
    }

    /// The fork node of `id`, or [`ForkTreeError::UnknownBlock`].
    pub fn fetch(&self, id: &BlockId) -> ChainResult<BlockForkData> {
        self.get(id)?.ok_or_else(|| ForkTreeError::UnknownBlock(*id).into())
    }

    fn set(&self, id: &BlockId, data: &BlockForkData) -> ChainResult<()> {
        trace!(target: "fork_db", %id, ?data, "store fork node");
        Ok(self.fork_data.insert(id, data)?)
    }

    /// The full block body of `id`.
    pub fn get_block(&self, id: &BlockId) -> ChainResult<Option<FullBlock>> {
        Ok(self.block_data.get(id)?)
    }

    /// The full block body of `id`, or [`ForkTreeError::UnknownBlock`].
    pub fn fetch_block(&self, id: &BlockId) -> ChainResult<FullBlock> {
        self.get_block(id)?.ok_or_else(|| ForkTreeError::UnknownBlock(*id).into())
    }

    /// The stored record of `id`.
    pub fn get_block_record(&self, id: &BlockId) -> ChainResult<Option<BlockRecord>> {
        Ok(self.block_records.get(id)?)
    }

    /// Replaces the stored record of `id`.
    pub fn store_block_record(&self, id: &BlockId, record: &BlockRecord) -> ChainResult<()> {
        Ok(self.block_records.insert(id, record)?)
    }

    /// All known block ids at `block_num`, including sidechains.
    pub fn blocks_at_number(&self, block_num: BlockNumber) -> ChainResult<Vec<BlockId>> {
        Ok(self.fork_number.get(&block_num)?.unwrap_or_default())
    }

    /// Iterates every stored block record.
    pub fn all_block_records(&self) -> ChainResult<Vec<BlockRecord>> {
        let mut records = Vec::new();
        for item in self.block_records.iter() {
            records.push(item?.1);
        }
        Ok(records)
    }

    /// Iterates every fork node.
    pub fn all_fork_nodes(&self) -> ChainResult<Vec<(BlockId, BlockForkData)>> {
        let mut nodes = Vec::new();
        for item in self.fork_data.iter() {
            nodes.push(item?);
        }
        Ok(nodes)
    }

    /// Seeds the genesis fork node, with every flag set.
    pub fn store_genesis_node(&self) -> ChainResult<()> {
        let node = BlockForkData {
            is_known: true,
            is_linked: true,
            is_valid: Some(true),
            invalid_reason: None,
            is_included: true,
            next_blocks: BTreeSet::new(),
        };
        self.set(&BlockId::GENESIS_PARENT, &node)
    }

    /// Places a received block in the tree.
    ///
    /// Persists the body and a minimal record, registers the id at its
    /// height, wires it into its parent's `next_blocks` (creating an unknown
    /// placeholder parent when needed), upgrades an existing placeholder for
    /// the block itself, and cascades linkage or inherited invalidity to the
    /// descendants.
    ///
    /// Returns the id and fork data of the deepest linkable descendant when
    /// the block became linked, otherwise the block's own node.
    pub fn store_and_index(
        &self,
        block: &FullBlock,
        latency_secs: u32,
    ) -> ChainResult<(BlockId, BlockForkData)> {
        let block_id = block.id();

        if self.get(&block_id)?.is_some_and(|data| data.is_known) {
            return Err(ForkTreeError::DuplicateBlock(block_id).into());
        }

        self.block_data.insert(&block_id, block)?;
        if self.get_block_record(&block_id)?.is_none() {
            self.store_block_record(&block_id, &BlockRecord::new(block, latency_secs))?;
        }

        let mut siblings = self.blocks_at_number(block.block_num())?;
        if !siblings.contains(&block_id) {
            siblings.push(block_id);
            self.fork_number.insert(&block.block_num(), &siblings)?;
        }

        // Tell the parent about its new child, creating an unlinked
        // placeholder when the parent itself has never been seen.
        let previous = block.previous();
        let parent = match self.get(&previous)? {
            Some(mut parent) => {
                trace!(target: "fork_db", parent = %previous, "parent already known");
                parent.next_blocks.insert(block_id);
                self.set(&previous, &parent)?;
                parent
            }
            None => {
                debug!(target: "fork_db", parent = %previous, "parent unknown, storing placeholder");
                let mut placeholder = BlockForkData::default();
                placeholder.next_blocks.insert(block_id);
                self.set(&previous, &placeholder)?;
                placeholder
            }
        };

        let parent_is_invalid = parent.is_invalid();

        match self.get(&block_id)? {
            // A child arrived first and left a placeholder for this block.
            Some(mut current) => {
                current.is_known = true;
                if !parent.is_linked {
                    self.set(&block_id, &current)?;
                    return Ok((block_id, current));
                }

                current.is_linked = true;
                if parent_is_invalid {
                    current.is_valid = Some(false);
                    current.invalid_reason = parent.invalid_reason.clone();
                }
                self.set(&block_id, &current)?;

                if parent_is_invalid {
                    let reason =
                        parent.invalid_reason.clone().unwrap_or_else(|| "invalid parent".into());
                    self.recursive_mark_as_invalid(&current.next_blocks, &reason)?;
                    Ok((block_id, current))
                } else {
                    self.recursive_mark_as_linked(block_id, &current)
                }
            }
            // First mention of this block.
            None => {
                let mut current = BlockForkData {
                    is_known: true,
                    is_linked: parent.is_linked,
                    ..Default::default()
                };
                if parent_is_invalid {
                    current.is_valid = Some(false);
                    current.invalid_reason = parent.invalid_reason;
                }
                self.set(&block_id, &current)?;
                Ok((block_id, current))
            }
        }
    }

    /// Marks every transitively reachable descendant of `start` as linked and
    /// returns the deepest linked node found.
    fn recursive_mark_as_linked(
        &self,
        start_id: BlockId,
        start: &BlockForkData,
    ) -> ChainResult<(BlockId, BlockForkData)> {
        let mut deepest = (start_id, start.clone());
        let mut deepest_num = self.block_num_of(&start_id)?;

        let mut layer: BTreeSet<BlockId> = start.next_blocks.clone();
        while !layer.is_empty() {
            let mut next_layer = BTreeSet::new();
            for id in &layer {
                let mut node = self.fetch(id)?;
                node.is_linked = true;
                next_layer.extend(node.next_blocks.iter().copied());
                self.set(id, &node)?;

                let num = self.block_num_of(id)?;
                if num > deepest_num {
                    deepest_num = num;
                    deepest = (*id, node);
                }
            }
            layer = next_layer;
        }
        Ok(deepest)
    }

    /// Marks every node in `start` and its descendants invalid.
    ///
    /// Nodes already validated (`is_valid == Some(true)`) through another
    /// branch are left untouched; marking invalid is idempotent.
    fn recursive_mark_as_invalid(
        &self,
        start: &BTreeSet<BlockId>,
        reason: &str,
    ) -> ChainResult<()> {
        let mut layer = start.clone();
        while !layer.is_empty() {
            let mut next_layer = BTreeSet::new();
            for id in &layer {
                let mut node = self.fetch(id)?;
                next_layer.extend(node.next_blocks.iter().copied());
                if node.is_valid() {
                    warn!(target: "fork_db", %id, "skipping invalidation of a validated block");
                    continue;
                }
                node.is_valid = Some(false);
                node.invalid_reason = Some(reason.to_string());
                self.set(id, &node)?;
            }
            layer = next_layer;
        }
        Ok(())
    }

    /// Marks `id` and its descendants invalid with `reason`.
    pub fn mark_invalid(&self, id: &BlockId, reason: &str) -> ChainResult<()> {
        let mut node = self.fetch(id)?;
        if node.is_valid() {
            warn!(target: "fork_db", %id, "refusing to invalidate a validated block");
            return Ok(());
        }
        node.is_valid = Some(false);
        node.invalid_reason = Some(reason.to_string());
        self.set(id, &node)?;
        self.recursive_mark_as_invalid(&node.next_blocks, reason)
    }

    /// Clears the validity verdict of `id` and its descendants so they are
    /// checked again on the next fork switch.
    pub fn mark_as_unchecked(&self, id: &BlockId) -> ChainResult<()> {
        let mut node = self.fetch(id)?;
        node.is_valid = None;
        node.invalid_reason = None;
        self.set(id, &node)?;

        let mut layer = node.next_blocks;
        while !layer.is_empty() {
            let mut next_layer = BTreeSet::new();
            for id in &layer {
                let mut node = self.fetch(id)?;
                node.is_valid = None;
                node.invalid_reason = None;
                next_layer.extend(node.next_blocks.iter().copied());
                self.set(id, &node)?;
            }
            layer = next_layer;
        }
        Ok(())
    }

    /// Flags whether `id` is on the main chain; inclusion implies validity.
    pub fn mark_included(&self, id: &BlockId, included: bool) -> ChainResult<()> {
        let mut node = self.fetch(id)?;
        node.is_included = included;
        if included {
            node.is_valid = Some(true);
            node.invalid_reason = None;
        }
        self.set(id, &node)
    }

    /// The height of `id`, or zero for the genesis parent.
    fn block_num_of(&self, id: &BlockId) -> ChainResult<BlockNumber> {
        if id.is_genesis_parent() {
            return Ok(0);
        }
        Ok(self.get_block_record(id)?.map(|record| record.block_num()).unwrap_or(0))
    }

    /// Walks parent pointers from `id` until an included ancestor is found.
    ///
    /// The returned list starts at `id` and ends with the only element that
    /// is already included in the main chain (the common ancestor).
    pub fn fork_history(&self, id: &BlockId) -> ChainResult<Vec<BlockId>> {
        let mut history = vec![*id];
        let mut next_id = *id;
        loop {
            let record = self
                .get_block_record(&next_id)?
                .ok_or(ForkTreeError::UnknownBlock(next_id))?;
            let previous = record.signed_header.header.previous;
            history.push(previous);
            if previous.is_genesis_parent() {
                return Ok(history);
            }
            let prev_data = self.fetch(&previous)?;
            if !prev_data.is_linked {
                return Err(ChainError::ForkTree(ForkTreeError::BrokenForkHistory(*id)));
            }
            if prev_data.is_included {
                return Ok(history);
            }
            next_id = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calder_primitives::{
        BlockHeader, Hash256, SecretHash, SignedBlockHeader, Timestamp,
    };

    fn test_fork_db() -> (tempfile::TempDir, ForkDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let index = StoreEnv::open(&dir.path().join("index")).unwrap();
        let raw = StoreEnv::open(&dir.path().join("raw_chain")).unwrap();
        let fork_db = ForkDatabase::open(&index, &raw).unwrap();
        fork_db.store_genesis_node().unwrap();
        (dir, fork_db)
    }

    fn make_block(previous: BlockId, block_num: BlockNumber, salt: u8) -> FullBlock {
        let secret = secp256k1::SecretKey::from_slice(&[salt.max(1); 32]).unwrap();
        let header = BlockHeader {
            previous,
            block_num,
            timestamp: Timestamp(block_num * 10),
            transaction_digest: Hash256::default(),
            previous_secret: SecretHash::default(),
            next_secret_hash: SecretHash::default(),
        };
        FullBlock {
            signed_header: SignedBlockHeader::sign(header, &secret),
            user_transactions: vec![],
        }
    }

    #[test]
    fn linked_chain_extends_from_genesis() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        let (tip, data) = fork_db.store_and_index(&b1, 0).unwrap();
        assert_eq!(tip, b1.id());
        assert!(data.is_linked);
        assert!(data.is_known);
    }

    #[test]
    fn orphan_creates_placeholder_and_links_later() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        let b2 = make_block(b1.id(), 2, 2);

        // The child arrives first: unlinked, with a placeholder parent.
        let (tip, data) = fork_db.store_and_index(&b2, 0).unwrap();
        assert_eq!(tip, b2.id());
        assert!(!data.is_linked);
        let placeholder = fork_db.get(&b1.id()).unwrap().unwrap();
        assert!(!placeholder.is_known);
        assert_eq!(placeholder.next_blocks.len(), 1);

        // The missing link arrives: the cascade returns the deepest tip.
        let (tip, data) = fork_db.store_and_index(&b1, 0).unwrap();
        assert_eq!(tip, b2.id());
        assert!(data.is_linked);
        assert!(fork_db.get(&b1.id()).unwrap().unwrap().is_known);
        assert!(fork_db.get(&b2.id()).unwrap().unwrap().is_linked);
    }

    #[test]
    fn invalid_parent_poisons_descendants() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        let b2 = make_block(b1.id(), 2, 2);

        fork_db.store_and_index(&b1, 0).unwrap();
        fork_db.store_and_index(&b2, 0).unwrap();
        fork_db.mark_invalid(&b1.id(), "bad header").unwrap();

        let child = fork_db.get(&b2.id()).unwrap().unwrap();
        assert!(child.is_invalid());
        assert_eq!(child.invalid_reason.as_deref(), Some("bad header"));

        // Invalidation cascades into blocks that arrive afterwards too.
        let b3 = make_block(b2.id(), 3, 3);
        let (_, data) = fork_db.store_and_index(&b3, 0).unwrap();
        assert!(data.is_invalid());
    }

    #[test]
    fn mark_invalid_is_idempotent_and_spares_validated_blocks() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        fork_db.store_and_index(&b1, 0).unwrap();
        fork_db.mark_included(&b1.id(), true).unwrap();

        // A block validated through inclusion must not be downgraded.
        fork_db.mark_invalid(&b1.id(), "spurious").unwrap();
        assert!(fork_db.get(&b1.id()).unwrap().unwrap().is_valid());

        let b2 = make_block(b1.id(), 2, 2);
        fork_db.store_and_index(&b2, 0).unwrap();
        fork_db.mark_invalid(&b2.id(), "bad").unwrap();
        fork_db.mark_invalid(&b2.id(), "bad").unwrap();
        assert!(fork_db.get(&b2.id()).unwrap().unwrap().is_invalid());
    }

    #[test]
    fn duplicate_blocks_are_rejected() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        fork_db.store_and_index(&b1, 0).unwrap();
        let err = fork_db.store_and_index(&b1, 0).unwrap_err();
        assert!(matches!(
            err,
            ChainError::ForkTree(ForkTreeError::DuplicateBlock(id)) if id == b1.id()
        ));
    }

    #[test]
    fn fork_history_stops_at_included_ancestor() {
        let (_dir, fork_db) = test_fork_db();
        let b1 = make_block(BlockId::GENESIS_PARENT, 1, 1);
        let b2 = make_block(b1.id(), 2, 2);
        let b2_sibling = make_block(b1.id(), 2, 9);

        fork_db.store_and_index(&b1, 0).unwrap();
        fork_db.store_and_index(&b2, 0).unwrap();
        fork_db.store_and_index(&b2_sibling, 0).unwrap();
        fork_db.mark_included(&b1.id(), true).unwrap();

        let history = fork_db.fork_history(&b2_sibling.id()).unwrap();
        assert_eq!(history, vec![b2_sibling.id(), b1.id()]);
    }
}
