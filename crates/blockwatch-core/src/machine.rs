//! Blockchain machine: drives components from processor head events.
//!
//! Each head transition is handled in two phases. First every component's next
//! state is computed under the cache read lock with no side effects; then the
//! components are notified and their slots committed in registration order.
//! A reorg is resolved by replaying reducers from the common ancestor of the
//! component's anchor and the new head.
//!
//! A panic in a reducer or in `handle_changes` is caught and reported as a
//! [`WatchError::Component`] failure of that cycle.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ComponentSlot, Slot};
use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::processor::{BlockProcessor, HeadEvent, ProcessorEvent, SharedCache};
use crate::reducer::AnchorState;
use crate::source::BlockSource;
use crate::types::{BlockStub, ChainBlock};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Anchor states kept per component for replay after a reorg.
    pub history_depth: u64,
    /// Capacity of the error and anchor broadcast channels.
    pub event_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for MachineConfig {
    fn from(config: &WatchConfig) -> Self {
        Self {
            history_depth: config.history_depth(),
            event_capacity: config.event_capacity,
        }
    }
}

type Slots<B> = Arc<Mutex<Vec<Box<dyn Slot<B>>>>>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of components and their anchor states, fed by a [`BlockProcessor`].
pub struct BlockchainMachine<B: ChainBlock, S: BlockSource<B>> {
    processor: Arc<BlockProcessor<B, S>>,
    config: MachineConfig,
    slots: Slots<B>,
    errors: broadcast::Sender<WatchError>,
    anchors: broadcast::Sender<BlockStub>,
    running: Mutex<Option<Running>>,
}

impl<B: ChainBlock, S: BlockSource<B> + 'static> BlockchainMachine<B, S> {
    pub fn new(processor: Arc<BlockProcessor<B, S>>, config: MachineConfig) -> Self {
        let capacity = config.event_capacity.max(1);
        let (errors, _) = broadcast::channel(capacity);
        let (anchors, _) = broadcast::channel(capacity);
        Self {
            processor,
            config,
            slots: Arc::new(Mutex::new(Vec::new())),
            errors,
            anchors,
            running: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &Arc<BlockProcessor<B, S>> {
        &self.processor
    }

    /// Register a component. Must be called before [`start`](Self::start).
    pub async fn add_component<C: Component<B>>(&self, component: C) -> Result<(), WatchError> {
        if self.running.lock().await.is_some() {
            return Err(WatchError::MachineRunning);
        }
        let mut slots = self.slots.lock().await;
        if slots.iter().any(|s| s.name() == component.name()) {
            return Err(WatchError::DuplicateComponent {
                name: component.name().to_string(),
            });
        }
        let depth = usize::try_from(self.config.history_depth).unwrap_or(usize::MAX);
        slots.push(Box::new(ComponentSlot::new(component, depth)));
        Ok(())
    }

    /// Names of the registered components, in registration order.
    pub async fn components(&self) -> Vec<String> {
        self.slots.lock().await.iter().map(|s| s.name().to_string()).collect()
    }

    /// Current anchor state of the component named `name`.
    ///
    /// `None` if there is no such component, it has no state yet, or its
    /// state is not an `St`.
    pub async fn state<St: AnchorState>(&self, name: &str) -> Option<St> {
        let slots = self.slots.lock().await;
        let slot = slots.iter().find(|s| s.name() == name)?;
        slot.state_any()?.downcast_ref::<St>().cloned()
    }

    /// Block the named component's state is anchored to.
    pub async fn anchor(&self, name: &str) -> Option<BlockStub> {
        let slots = self.slots.lock().await;
        slots.iter().find(|s| s.name() == name)?.anchor().cloned()
    }

    /// Errors surfaced by processing cycles: failed components, reorgs
    /// deeper than the retained window, and processor failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<WatchError> {
        self.errors.subscribe()
    }

    /// Heads every component has been successfully advanced to.
    pub fn subscribe_anchors(&self) -> broadcast::Receiver<BlockStub> {
        self.anchors.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the processor (if it is not running yet), anchor every
    /// component at the current head with its initial state and begin
    /// following head transitions.
    ///
    /// Calling `start` on a running machine is a no-op.
    pub async fn start(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let events = self.processor.subscribe();
        self.processor.start().await?;
        let head = self.processor.head().await.ok_or(WatchError::NotStarted)?;

        let worker = Worker {
            slots: Arc::clone(&self.slots),
            cache: self.processor.cache(),
            errors: self.errors.clone(),
            anchors: self.anchors.clone(),
        };
        if let Err(e) = worker.cycle(&head).await {
            tracing::error!(error = %e, head = head.number, "could not anchor components at start");
            let _ = self.errors.send(e);
        }
        tracing::info!(
            head = head.number,
            components = self.slots.lock().await.len(),
            "blockchain machine started"
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(events, token).await });
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stop following head transitions, then stop the processor.
    ///
    /// A cycle already in progress completes; no `handle_changes` call is
    /// made after this returns.
    pub async fn stop(&self) {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "blockchain machine task failed");
        }
        self.processor.stop().await;
        tracing::info!("blockchain machine stopped");
    }
}

struct Worker<B: ChainBlock> {
    slots: Slots<B>,
    cache: SharedCache<B>,
    errors: broadcast::Sender<WatchError>,
    anchors: broadcast::Sender<BlockStub>,
}

impl<B: ChainBlock> Worker<B> {
    async fn run(&self, mut events: broadcast::Receiver<ProcessorEvent>, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let mut batch = match first {
                Ok(event) => vec![event],
                Err(RecvError::Lagged(skipped)) => {
                    // The next head still carries the full transition; the
                    // anchors compute their own path to it.
                    tracing::warn!(skipped, "machine lagged behind processor events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            loop {
                match events.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "machine lagged behind processor events");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            if !self.handle_batch(batch, &cancel).await {
                break;
            }
        }
    }

    /// Process queued events, coalescing consecutive heads to the newest.
    /// Returns `false` once cancelled.
    async fn handle_batch(&self, batch: Vec<ProcessorEvent>, cancel: &CancellationToken) -> bool {
        let mut latest: Option<HeadEvent> = None;
        for event in batch {
            match event {
                ProcessorEvent::NewHead(head) => latest = Some(head),
                ProcessorEvent::Error(e) => {
                    if let Some(head) = latest.take() {
                        if !self.advance(&head, cancel).await {
                            return false;
                        }
                    }
                    if e.is_reorg_too_deep() {
                        for slot in self.slots.lock().await.iter_mut() {
                            slot.mark_reanchor();
                        }
                    }
                    let _ = self.errors.send(e);
                }
            }
        }
        match latest {
            Some(head) => self.advance(&head, cancel).await,
            None => true,
        }
    }

    async fn advance(&self, event: &HeadEvent, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if let Err(e) = self.cycle(&event.new_head).await {
            tracing::error!(error = %e, head = event.new_head.number, "processing cycle failed");
            let _ = self.errors.send(e);
        }
        true
    }

    /// Move every component to `head`.
    async fn cycle(&self, head: &BlockStub) -> Result<(), WatchError> {
        let mut slots = self.slots.lock().await;

        {
            let cache = self.cache.read().await;
            let Some(block) = cache.get(&head.hash).cloned() else {
                // Evicted by a re-seed or a newer head; components keep their anchor.
                tracing::warn!(head = head.number, hash = %head.hash, "head no longer cached; cycle skipped");
                return Err(WatchError::UnknownBlock {
                    hash: head.hash.clone(),
                });
            };

            let mut failure = None;
            for slot in slots.iter_mut() {
                let prepared = catch_unwind(AssertUnwindSafe(|| slot.prepare(&cache, &block)))
                    .unwrap_or_else(|payload| Err(panicked(slot.name(), payload)));
                match prepared {
                    Ok(()) => {}
                    Err(WatchError::UnknownAncestor { .. }) | Err(WatchError::UnknownBlock { .. }) => {
                        slot.mark_reanchor();
                        failure.get_or_insert(WatchError::ReorgTooDeep {
                            head_hash: head.hash.clone(),
                            head_number: head.number,
                            max_depth: cache.max_depth(),
                        });
                    }
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = failure {
                for slot in slots.iter_mut() {
                    slot.discard();
                }
                return Err(e);
            }
        }

        for i in 0..slots.len() {
            let slot = &mut slots[i];
            let committed = catch_unwind(AssertUnwindSafe(|| slot.commit()))
                .unwrap_or_else(|payload| Err(panicked(slot.name(), payload)));
            if let Err(e) = committed {
                for rest in slots[i + 1..].iter_mut() {
                    rest.discard();
                }
                return Err(e);
            }
        }
        let _ = self.anchors.send(head.clone());
        Ok(())
    }
}

fn panicked(component: &str, payload: Box<dyn Any + Send>) -> WatchError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into());
    tracing::error!(component, %reason, "component panicked");
    WatchError::Component {
        component: component.to_string(),
        reason: format!("panicked: {reason}"),
    }
}
