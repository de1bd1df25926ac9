//! Block cache: a bounded tree of recent blocks keyed by hash.
//!
//! Unlike a linear window, the cache keeps every branch it has been shown
//! until the branch ages out below the retention floor, so a reorg back to a
//! recently abandoned branch can be resolved without refetching.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::WatchError;
use crate::types::{BlockStub, ChainBlock};

/// Recently seen blocks with parent/child links and a declared head.
///
/// Invariants:
/// - every stored block either has its parent stored or sits at the
///   retention floor;
/// - hashes are unique;
/// - the head is whatever the owner last declared with [`set_head`].
///
/// [`set_head`]: BlockCache::set_head
pub struct BlockCache<B: ChainBlock> {
    blocks: HashMap<String, B>,
    children: HashMap<String, HashSet<String>>,
    by_number: BTreeMap<u64, HashSet<String>>,
    head: Option<String>,
    max_depth: u64,
}

impl<B: ChainBlock> BlockCache<B> {
    /// Create a cache retaining `max_depth` blocks behind the head.
    ///
    /// `max_depth` is also the deepest reorg that can be resolved; pick it
    /// above the deepest reorg the target chain shows in practice.
    pub fn new(max_depth: u64) -> Self {
        Self {
            blocks: HashMap::new(),
            children: HashMap::new(),
            by_number: BTreeMap::new(),
            head: None,
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Number of retained blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&B> {
        self.blocks.get(hash)
    }

    pub fn get_block_stub(&self, hash: &str) -> Option<BlockStub> {
        self.get(hash).map(ChainBlock::stub)
    }

    /// The currently declared head block.
    pub fn head(&self) -> Option<&B> {
        self.head.as_deref().and_then(|h| self.blocks.get(h))
    }

    /// Lowest block number a parentless block may be attached at.
    ///
    /// `head.number - max_depth` once a head is declared; before that, the
    /// lowest retained number. `None` for an empty cache with no head, in
    /// which case any block is accepted.
    pub fn retention_floor(&self) -> Option<u64> {
        match self.head() {
            Some(head) => Some(head.number().saturating_sub(self.max_depth)),
            None => self.by_number.keys().next().copied(),
        }
    }

    /// Insert `block` if it is new.
    ///
    /// Returns `Ok(true)` if the known set changed, `Ok(false)` if the block
    /// was already present. Fails with [`WatchError::OrphanBlock`] if the
    /// parent is unknown and the block sits above the retention floor; the
    /// caller must backfill the parent first.
    pub fn attach(&mut self, block: B) -> Result<bool, WatchError> {
        if self.blocks.contains_key(block.hash()) {
            return Ok(false);
        }

        let parent_known = self.blocks.contains_key(block.parent_hash());
        let at_floor = self
            .retention_floor()
            .map_or(true, |floor| block.number() <= floor);
        if !parent_known && !at_floor {
            return Err(WatchError::OrphanBlock {
                hash: block.hash().to_string(),
                number: block.number(),
                parent_hash: block.parent_hash().to_string(),
            });
        }

        let hash = block.hash().to_string();
        self.children
            .entry(block.parent_hash().to_string())
            .or_default()
            .insert(hash.clone());
        self.by_number
            .entry(block.number())
            .or_default()
            .insert(hash.clone());
        self.blocks.insert(hash, block);
        Ok(true)
    }

    /// Declare `hash` the chain head and evict blocks below the new floor.
    ///
    /// The head may move to a descendant or to another branch. Branches that
    /// are not ancestors of the head survive until they drop below
    /// `head.number - max_depth`.
    pub fn set_head(&mut self, hash: &str) -> Result<(), WatchError> {
        let number = self
            .blocks
            .get(hash)
            .map(ChainBlock::number)
            .ok_or_else(|| WatchError::UnknownBlock { hash: hash.to_string() })?;

        self.head = Some(hash.to_string());
        let evicted = self.prune_below(number.saturating_sub(self.max_depth));
        if evicted > 0 {
            tracing::trace!(evicted, head = number, "pruned block cache");
        }
        Ok(())
    }

    /// Nearest common ancestor of two retained blocks.
    ///
    /// Fails with [`WatchError::UnknownAncestor`] if either chain walks off
    /// the retained window before the two converge.
    pub fn find_ancestor(&self, left: &str, right: &str) -> Result<&B, WatchError> {
        let unknown = || WatchError::UnknownAncestor {
            left: left.to_string(),
            right: right.to_string(),
        };
        let mut a = self
            .get(left)
            .ok_or_else(|| WatchError::UnknownBlock { hash: left.to_string() })?;
        let mut b = self
            .get(right)
            .ok_or_else(|| WatchError::UnknownBlock { hash: right.to_string() })?;

        while a.hash() != b.hash() {
            if a.number() >= b.number() {
                a = self.get(a.parent_hash()).ok_or_else(unknown)?;
            } else {
                b = self.get(b.parent_hash()).ok_or_else(unknown)?;
            }
        }
        Ok(a)
    }

    /// Blocks from `hash` back to its oldest retained ancestor, newest first.
    ///
    /// Empty if `hash` is unknown.
    pub fn ancestry<'a>(&'a self, hash: &str) -> impl Iterator<Item = &'a B> + 'a {
        std::iter::successors(self.get(hash), move |b| self.get(b.parent_hash()))
    }

    /// Returns `true` if `ancestor` is `descendant` or one of its retained ancestors.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.ancestry(descendant).any(|b| b.hash() == ancestor)
    }

    /// Blocks strictly after `ancestor` up to and including `descendant`,
    /// oldest first. This is the replay order after a reorg.
    pub fn path(&self, ancestor: &str, descendant: &str) -> Result<Vec<&B>, WatchError> {
        let mut path = Vec::new();
        for block in self.ancestry(descendant) {
            if block.hash() == ancestor {
                path.reverse();
                return Ok(path);
            }
            path.push(block);
        }
        Err(WatchError::UnknownAncestor {
            left: ancestor.to_string(),
            right: descendant.to_string(),
        })
    }

    /// Hashes of the known children of `hash`.
    pub fn children_of(&self, hash: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(hash)
            .into_iter()
            .flat_map(|c| c.iter().map(String::as_str))
    }

    /// Drop every block and the head.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.children.clear();
        self.by_number.clear();
        self.head = None;
    }

    fn prune_below(&mut self, floor: u64) -> usize {
        let stale: Vec<u64> = self.by_number.range(..floor).map(|(n, _)| *n).collect();
        let mut evicted = 0;
        for number in stale {
            for hash in self.by_number.remove(&number).unwrap_or_default() {
                if let Some(block) = self.blocks.remove(&hash) {
                    if let Some(siblings) = self.children.get_mut(block.parent_hash()) {
                        siblings.remove(&hash);
                        if siblings.is_empty() {
                            self.children.remove(block.parent_hash());
                        }
                    }
                    evicted += 1;
                }
            }
        }
        // Child sets keyed by hashes that are no longer stored only matter
        // while those children are still retained.
        let blocks = &self.blocks;
        self.children
            .retain(|parent, kids| blocks.contains_key(parent) || kids.iter().any(|k| blocks.contains_key(k)));
        evicted
    }
}
