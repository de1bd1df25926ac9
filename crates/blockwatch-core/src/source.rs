//! `BlockSource` trait: where blocks and head notifications come from.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::WatchError;
use crate::types::{BlockStub, ChainBlock};

/// Head notifications. `None` until the source has seen a head.
///
/// A `watch` channel keeps only the latest value, so a burst of heads
/// collapses to the newest one for a slow reader. Dropping the receiver
/// unsubscribes.
pub type HeadReceiver = watch::Receiver<Option<BlockStub>>;

/// Supplies blocks by hash and notifies on every new head.
///
/// Implemented by chain adapters (e.g. the EVM JSON-RPC source) and by
/// [`MemoryBlockSource`](crate::memory::MemoryBlockSource) for tests.
#[async_trait]
pub trait BlockSource<B: ChainBlock>: Send + Sync {
    /// Fetch a block by hash; `Ok(None)` if the source does not know it.
    async fn get_block(&self, hash: &str) -> Result<Option<B>, WatchError>;

    /// Fetch the current head block.
    async fn get_head(&self) -> Result<B, WatchError>;

    /// Subscribe to new-head notifications.
    fn subscribe_heads(&self) -> HeadReceiver;
}

#[async_trait]
impl<B: ChainBlock, S: BlockSource<B> + ?Sized> BlockSource<B> for Arc<S> {
    async fn get_block(&self, hash: &str) -> Result<Option<B>, WatchError> {
        (**self).get_block(hash).await
    }

    async fn get_head(&self) -> Result<B, WatchError> {
        (**self).get_head().await
    }

    fn subscribe_heads(&self) -> HeadReceiver {
        (**self).subscribe_heads()
    }
}

// ─── DelayedBlockSource ───────────────────────────────────────────────────────

/// Reports the head as the block `delay` blocks behind the real head.
///
/// Useful to run a watcher a fixed number of confirmations behind the tip, and
/// to simulate a lagging node in tests. `get_block` passes through unchanged.
pub struct DelayedBlockSource<B: ChainBlock, S: BlockSource<B>> {
    inner: Arc<S>,
    delay: u64,
    _block: std::marker::PhantomData<fn() -> B>,
}

impl<B: ChainBlock, S: BlockSource<B> + 'static> DelayedBlockSource<B, S> {
    pub fn new(inner: Arc<S>, delay: u64) -> Self {
        Self {
            inner,
            delay,
            _block: std::marker::PhantomData,
        }
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Walk `delay` parents back from `head`.
    async fn delayed(inner: &S, head: B, delay: u64) -> Result<B, WatchError> {
        let mut block = head;
        for _ in 0..delay {
            if block.number() == 0 {
                break;
            }
            block = inner
                .get_block(block.parent_hash())
                .await?
                .ok_or_else(|| WatchError::BlockNotFound {
                    hash: block.parent_hash().to_string(),
                })?;
        }
        Ok(block)
    }
}

#[async_trait]
impl<B: ChainBlock, S: BlockSource<B> + 'static> BlockSource<B> for DelayedBlockSource<B, S> {
    async fn get_block(&self, hash: &str) -> Result<Option<B>, WatchError> {
        self.inner.get_block(hash).await
    }

    async fn get_head(&self) -> Result<B, WatchError> {
        let head = self.inner.get_head().await?;
        Self::delayed(&self.inner, head, self.delay).await
    }

    /// Spawns a forwarding task that lives as long as the returned receiver.
    fn subscribe_heads(&self) -> HeadReceiver {
        let mut upstream = self.inner.subscribe_heads();
        let (tx, rx) = watch::channel(None);
        let inner = Arc::clone(&self.inner);
        let delay = self.delay;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    changed = upstream.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let Some(stub) = upstream.borrow_and_update().clone() else {
                    continue;
                };
                let head = match inner.get_block(&stub.hash).await {
                    Ok(Some(head)) => head,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, head = stub.number, "delayed source could not fetch head");
                        continue;
                    }
                };
                match Self::delayed(&inner, head, delay).await {
                    Ok(block) => {
                        let stub = block.stub();
                        tx.send_if_modified(|current| {
                            if current.as_ref() == Some(&stub) {
                                false
                            } else {
                                *current = Some(stub);
                                true
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, delay, "delayed source could not walk back");
                    }
                }
            }
        });
        rx
    }
}
