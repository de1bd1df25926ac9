//! Block model shared by the cache, processor and reducers.

use serde::{Deserialize, Serialize};

// ─── ChainBlock ───────────────────────────────────────────────────────────────

/// The minimal view of a block every core structure needs.
///
/// Identity is the hash; blocks never change once observed.
pub trait ChainBlock: Clone + Send + Sync + 'static {
    fn hash(&self) -> &str;
    fn number(&self) -> u64;
    fn parent_hash(&self) -> &str;

    /// Header-only copy of this block.
    fn stub(&self) -> BlockStub {
        BlockStub {
            number: self.number(),
            hash: self.hash().to_string(),
            parent_hash: self.parent_hash().to_string(),
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    fn extends<P: ChainBlock>(&self, parent: &P) -> bool {
        self.number() == parent.number() + 1 && self.parent_hash() == parent.hash()
    }
}

// ─── BlockStub ────────────────────────────────────────────────────────────────

/// Number, hash and parent hash of a block; nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockStub {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
}

impl ChainBlock for BlockStub {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn number(&self) -> u64 {
        self.number
    }

    fn parent_hash(&self) -> &str {
        &self.parent_hash
    }

    fn stub(&self) -> BlockStub {
        self.clone()
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A log entry emitted by a transaction in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emitting contract address.
    pub address: String,
    pub topics: Vec<String>,
    /// Hex-encoded data payload.
    pub data: String,
    pub tx_hash: String,
    pub log_index: u32,
}

impl LogEntry {
    /// Returns `true` if the log was emitted by `address` (case-insensitive).
    pub fn is_from(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }

    /// Returns `true` if `topic0` (the event signature) matches.
    pub fn has_topic0(&self, topic: &str) -> bool {
        self.topics
            .first()
            .map(|t| t.eq_ignore_ascii_case(topic))
            .unwrap_or(false)
    }
}

/// A block header plus the logs reducers look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Block {
    /// Logs emitted by `address` with the given `topic0`.
    pub fn logs_matching<'a>(
        &'a self,
        address: &'a str,
        topic0: &'a str,
    ) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.logs
            .iter()
            .filter(move |l| l.is_from(address) && l.has_topic0(topic0))
    }
}

impl ChainBlock for Block {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn number(&self) -> u64 {
        self.number
    }

    fn parent_hash(&self) -> &str {
        &self.parent_hash
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
