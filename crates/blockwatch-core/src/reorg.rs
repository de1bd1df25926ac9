//! Reorg description attached to head transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::BlockCache;
use crate::error::WatchError;
use crate::types::{BlockStub, ChainBlock};

/// Reorgs at most this deep are classified as [`ReorgType::ShortReorg`].
pub const SHORT_REORG_DEPTH: u64 = 3;

/// Classification of a head switch to another branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgType {
    /// 1–3 blocks rolled back.
    ShortReorg,
    /// More than 3 blocks rolled back, still within the retained window.
    DeepReorg,
}

impl fmt::Display for ReorgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
        }
    }
}

/// How the new head relates to the previous one when it does not descend
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgInfo {
    /// Nearest common ancestor of the old and new head.
    pub ancestor: BlockStub,
    /// Blocks of the previous branch rolled back.
    pub depth: u64,
    /// The rolled back blocks, most recent first.
    pub dropped: Vec<BlockStub>,
    pub reorg_type: ReorgType,
}

impl ReorgInfo {
    /// Compare `prev` and `next` in `cache`.
    ///
    /// Returns `Ok(None)` if `next` descends from `prev` (or is `prev`).
    pub fn detect<B: ChainBlock>(
        cache: &BlockCache<B>,
        prev: &str,
        next: &str,
    ) -> Result<Option<Self>, WatchError> {
        let ancestor = cache.find_ancestor(prev, next)?;
        if ancestor.hash() == prev {
            return Ok(None);
        }
        let ancestor = ancestor.stub();
        let dropped: Vec<BlockStub> = cache
            .ancestry(prev)
            .take_while(|b| b.hash() != ancestor.hash)
            .map(ChainBlock::stub)
            .collect();
        let depth = dropped.len() as u64;
        let reorg_type = if depth <= SHORT_REORG_DEPTH {
            ReorgType::ShortReorg
        } else {
            ReorgType::DeepReorg
        };
        Ok(Some(Self {
            ancestor,
            depth,
            dropped,
            reorg_type,
        }))
    }
}
