//! In-memory block source.
//!
//! A deterministic fake chain for tests and simulations: blocks are inserted
//! by hand, the head is declared explicitly, and transient failures can be
//! injected to exercise retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::WatchError;
use crate::source::{BlockSource, HeadReceiver};
use crate::types::{Block, BlockStub, ChainBlock};

/// In-memory [`BlockSource`].
pub struct MemoryBlockSource<B: ChainBlock = Block> {
    blocks: Mutex<HashMap<String, B>>,
    head: Mutex<Option<String>>,
    heads: watch::Sender<Option<BlockStub>>,
    failures: AtomicU32,
    fetches: AtomicU64,
}

impl<B: ChainBlock> Default for MemoryBlockSource<B> {
    fn default() -> Self {
        let (heads, _) = watch::channel(None);
        Self {
            blocks: Mutex::new(HashMap::new()),
            head: Mutex::new(None),
            heads,
            failures: AtomicU32::new(0),
            fetches: AtomicU64::new(0),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: ChainBlock> MemoryBlockSource<B> {
    /// Make a block known without changing the head.
    pub fn insert(&self, block: B) {
        lock(&self.blocks).insert(block.hash().to_string(), block);
    }

    /// Declare a previously inserted block the head and notify subscribers.
    pub fn set_head(&self, hash: &str) -> Result<(), WatchError> {
        let stub = lock(&self.blocks)
            .get(hash)
            .map(ChainBlock::stub)
            .ok_or_else(|| WatchError::BlockNotFound { hash: hash.to_string() })?;
        self.publish(stub);
        Ok(())
    }

    /// Insert `block` and make it the head.
    pub fn push(&self, block: B) {
        let stub = block.stub();
        self.insert(block);
        self.publish(stub);
    }

    fn publish(&self, stub: BlockStub) {
        *lock(&self.head) = Some(stub.hash.clone());
        self.heads.send_replace(Some(stub));
    }

    /// Make the next `n` fetches fail with a retryable source error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Total `get_block` + `get_head` calls served (including failed ones).
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of live head subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.heads.receiver_count()
    }

    fn begin_fetch(&self) -> Result<(), WatchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(WatchError::Source("injected failure".into()));
        }
        Ok(())
    }
}

impl MemoryBlockSource<Block> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append blocks `{prefix}{from}..={prefix}{to}` on top of their
    /// `{prefix}{n-1}` parents, moving the head one block at a time.
    ///
    /// Block 0's parent is `0x0`.
    pub fn extend_linear(&self, prefix: &str, from: u64, to: u64) {
        for n in from..=to {
            let parent = match n {
                0 => "0x0".to_string(),
                _ => format!("{prefix}{}", n - 1),
            };
            self.push(test_block(n, &format!("{prefix}{n}"), &parent));
        }
    }

    /// Append a branch `{prefix}{from}..={prefix}{to}` whose first block
    /// hangs off `parent`.
    pub fn fork(&self, prefix: &str, parent: &str, from: u64, to: u64) {
        for n in from..=to {
            let parent = if n == from {
                parent.to_string()
            } else {
                format!("{prefix}{}", n - 1)
            };
            self.push(test_block(n, &format!("{prefix}{n}"), &parent));
        }
    }
}

/// A payload-free [`Block`].
pub fn test_block(number: u64, hash: &str, parent: &str) -> Block {
    Block {
        number,
        hash: hash.into(),
        parent_hash: parent.into(),
        timestamp: (number * 12) as i64,
        logs: vec![],
    }
}

#[async_trait]
impl<B: ChainBlock> BlockSource<B> for MemoryBlockSource<B> {
    async fn get_block(&self, hash: &str) -> Result<Option<B>, WatchError> {
        self.begin_fetch()?;
        Ok(lock(&self.blocks).get(hash).cloned())
    }

    async fn get_head(&self) -> Result<B, WatchError> {
        self.begin_fetch()?;
        let head = lock(&self.head).clone().ok_or(WatchError::NotStarted)?;
        lock(&self.blocks)
            .get(&head)
            .cloned()
            .ok_or(WatchError::BlockNotFound { hash: head })
    }

    fn subscribe_heads(&self) -> HeadReceiver {
        self.heads.subscribe()
    }
}
