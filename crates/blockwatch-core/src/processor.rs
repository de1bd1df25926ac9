//! Block processor: turns head notifications into ordered head transitions.
//!
//! The processor is the only writer of the [`BlockCache`]. For every new head
//! it fetches the block, backfills missing ancestors until it reaches a cached
//! block, attaches the discovered chain oldest-first and declares the new
//! head. Subscribers receive one [`ProcessorEvent::NewHead`] per distinct head
//! transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::BlockCache;
use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::reorg::ReorgInfo;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::source::{BlockSource, HeadReceiver};
use crate::types::{BlockStub, ChainBlock};
use crate::wait::with_timeout;

/// Block cache shared between the processor (writer) and the machine (reader).
pub type SharedCache<B> = Arc<RwLock<BlockCache<B>>>;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Cache retention and backfill bound.
    pub max_depth: u64,
    pub fetch_timeout: Duration,
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for ProcessorConfig {
    fn from(config: &WatchConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            fetch_timeout: config.fetch_timeout(),
            event_capacity: config.event_capacity,
            retry: config.retry_policy(),
        }
    }
}

/// A head transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadEvent {
    pub prev_head: BlockStub,
    pub new_head: BlockStub,
    /// Set when `new_head` does not descend from `prev_head`.
    pub reorg: Option<ReorgInfo>,
    pub observed_at: DateTime<Utc>,
}

impl HeadEvent {
    /// `true` if the new head is a direct child of the previous one.
    pub fn is_extension(&self) -> bool {
        self.new_head.extends(&self.prev_head)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    NewHead(HeadEvent),
    /// A head could not be processed; the processor carries on with the next one.
    Error(WatchError),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Follows a [`BlockSource`] and maintains the shared [`BlockCache`].
pub struct BlockProcessor<B: ChainBlock, S: BlockSource<B>> {
    inner: Arc<Inner<B, S>>,
    running: Mutex<Option<Running>>,
}

struct Inner<B: ChainBlock, S: BlockSource<B>> {
    source: Arc<S>,
    cache: SharedCache<B>,
    config: ProcessorConfig,
    events: broadcast::Sender<ProcessorEvent>,
}

impl<B: ChainBlock, S: BlockSource<B> + 'static> BlockProcessor<B, S> {
    pub fn new(source: Arc<S>, config: ProcessorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let cache = Arc::new(RwLock::new(BlockCache::new(config.max_depth)));
        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                config,
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to head transitions and processing errors.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.inner.events.subscribe()
    }

    /// Read handle on the block cache.
    pub fn cache(&self) -> SharedCache<B> {
        Arc::clone(&self.inner.cache)
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// The current head, once started.
    pub async fn head(&self) -> Option<BlockStub> {
        self.inner.cache.read().await.head().map(ChainBlock::stub)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Subscribe to the source, seed the cache with its current head and
    /// start following new heads. No event is published for the initial head.
    ///
    /// Calling `start` on a running processor is a no-op.
    pub async fn start(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let heads = self.inner.source.subscribe_heads();
        let head = self.inner.fetch_head(&cancel).await?;
        let number = head.number();
        match self.inner.advance(head, &cancel).await {
            Ok(_) => {}
            Err(e) if e.is_reorg_too_deep() => {
                tracing::warn!(error = %e, "cache re-seeded at start");
            }
            Err(e) => return Err(e),
        }
        tracing::info!(head = number, max_depth = self.inner.config.max_depth, "block processor started");

        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run(heads, token).await });
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stop following heads and release the source subscription.
    ///
    /// In-flight processing is abandoned. Once this returns no further
    /// events are published. Calling `stop` on a stopped processor is a no-op.
    pub async fn stop(&self) {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "block processor task failed");
        }
        tracing::info!("block processor stopped");
    }
}

impl<B: ChainBlock, S: BlockSource<B> + 'static> Inner<B, S> {
    async fn run(&self, mut heads: HeadReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = heads.changed() => {
                    if changed.is_err() {
                        tracing::warn!("block source closed its head stream");
                        break;
                    }
                }
            }
            // Only the latest head counts; anything superseded while the
            // previous head was being processed is skipped.
            let Some(stub) = heads.borrow_and_update().clone() else {
                continue;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.on_head(stub, &cancel) => {}
            }
        }
    }

    async fn on_head(&self, stub: BlockStub, cancel: &CancellationToken) {
        if self.is_current_head(&stub.hash).await {
            tracing::trace!(head = stub.number, "duplicate head notification");
            return;
        }

        let result = match self.resolve(&stub.hash, cancel).await {
            Ok(block) => self.advance(block, cancel).await,
            Err(e) => Err(e),
        };
        if cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(Some(event)) => {
                tracing::debug!(
                    from = event.prev_head.number,
                    to = event.new_head.number,
                    reorg = event.reorg.is_some(),
                    "new head"
                );
                let _ = self.events.send(ProcessorEvent::NewHead(event));
            }
            Ok(None) => {}
            Err(WatchError::Cancelled) => {}
            Err(e) => {
                tracing::error!(error = %e, head = stub.number, hash = %stub.hash, "failed to process head");
                let _ = self.events.send(ProcessorEvent::Error(e));
            }
        }
    }

    async fn is_current_head(&self, hash: &str) -> bool {
        self.cache
            .read()
            .await
            .head()
            .is_some_and(|h| h.hash() == hash)
    }

    /// Look `hash` up in the cache, fetching it if needed.
    async fn resolve(&self, hash: &str, cancel: &CancellationToken) -> Result<B, WatchError> {
        if let Some(block) = self.cache.read().await.get(hash) {
            return Ok(block.clone());
        }
        self.fetch_block(hash, cancel).await
    }

    /// Make `block` the head, backfilling its missing ancestors.
    ///
    /// Returns the transition, or `None` if there was no previous head or
    /// `block` already is the head.
    async fn advance(&self, block: B, cancel: &CancellationToken) -> Result<Option<HeadEvent>, WatchError> {
        let prev = self.cache.read().await.head().map(ChainBlock::stub);
        if prev.as_ref().is_some_and(|p| p.hash == block.hash()) {
            return Ok(None);
        }
        let new_head = block.stub();

        let missing = match self.backfill(&block, cancel).await {
            Ok(missing) => missing,
            Err(e) if e.is_reorg_too_deep() => {
                self.reseed(block).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut cache = self.cache.write().await;
        for ancestor in missing.into_iter().rev() {
            cache.attach(ancestor)?;
        }
        cache.attach(block)?;

        let Some(prev_head) = prev else {
            cache.set_head(&new_head.hash)?;
            return Ok(None);
        };

        let reorg = match ReorgInfo::detect(&cache, &prev_head.hash, &new_head.hash) {
            Ok(reorg) => reorg,
            Err(WatchError::UnknownAncestor { .. }) => {
                // Both branches are retained but meet below the floor.
                cache.set_head(&new_head.hash)?;
                return Err(self.too_deep(&new_head));
            }
            Err(e) => return Err(e),
        };
        if let Some(info) = &reorg {
            tracing::warn!(
                depth = info.depth,
                at = new_head.number,
                ancestor = info.ancestor.number,
                reorg_type = %info.reorg_type,
                "reorg detected"
            );
        }
        cache.set_head(&new_head.hash)?;

        Ok(Some(HeadEvent {
            prev_head,
            new_head,
            reorg,
            observed_at: Utc::now(),
        }))
    }

    /// Fetch the ancestors of `head` that are not cached, newest first.
    ///
    /// Fails with [`WatchError::ReorgTooDeep`] after `max_depth` fetches
    /// without reaching a cached block.
    async fn backfill(&self, head: &B, cancel: &CancellationToken) -> Result<Vec<B>, WatchError> {
        {
            let cache = self.cache.read().await;
            if cache.is_empty() || cache.contains(head.hash()) {
                return Ok(Vec::new());
            }
        }

        let mut missing: Vec<B> = Vec::new();
        let mut parent = head.parent_hash().to_string();
        let mut number = head.number();
        loop {
            if self.cache.read().await.contains(&parent) {
                if !missing.is_empty() {
                    tracing::debug!(fetched = missing.len(), head = head.number(), "backfilled ancestors");
                }
                return Ok(missing);
            }
            if missing.len() as u64 >= self.config.max_depth || number == 0 {
                return Err(self.too_deep(&head.stub()));
            }
            let block = self.fetch_block(&parent, cancel).await?;
            parent = block.parent_hash().to_string();
            number = block.number();
            missing.push(block);
        }
    }

    /// Replace the cache contents with `head` alone.
    async fn reseed(&self, head: B) -> Result<(), WatchError> {
        let hash = head.hash().to_string();
        let mut cache = self.cache.write().await;
        cache.reset();
        cache.attach(head)?;
        cache.set_head(&hash)?;
        tracing::warn!(head = %hash, "block cache re-seeded");
        Ok(())
    }

    fn too_deep(&self, head: &BlockStub) -> WatchError {
        WatchError::ReorgTooDeep {
            head_hash: head.hash.clone(),
            head_number: head.number,
            max_depth: self.config.max_depth,
        }
    }

    async fn fetch_block(&self, hash: &str, cancel: &CancellationToken) -> Result<B, WatchError> {
        let timeout = self.config.fetch_timeout;
        retry_with_backoff(&self.config.retry, cancel, "get_block", || {
            with_timeout(timeout, self.source.get_block(hash))
        })
        .await?
        .ok_or_else(|| WatchError::BlockNotFound { hash: hash.to_string() })
    }

    async fn fetch_head(&self, cancel: &CancellationToken) -> Result<B, WatchError> {
        let timeout = self.config.fetch_timeout;
        retry_with_backoff(&self.config.retry, cancel, "get_head", || {
            with_timeout(timeout, self.source.get_head())
        })
        .await
    }
}
