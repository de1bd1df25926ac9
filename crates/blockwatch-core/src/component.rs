//! Components: consumers of anchor-state transitions.
//!
//! A component supplies a reducer and reacts to `(prev, next)` state pairs.
//! The machine owns the state; components never hold their own copy of the
//! anchor.
//!
//! # Example
//!
//! ```rust
//! use blockwatch_core::component::Component;
//! use blockwatch_core::error::WatchError;
//! use blockwatch_core::reducer::{BlockNumberReducer, BlockNumberState, StateReducer};
//! use blockwatch_core::types::Block;
//!
//! struct HeadLogger;
//!
//! impl Component<Block> for HeadLogger {
//!     type State = BlockNumberState;
//!
//!     fn name(&self) -> &str {
//!         "head-logger"
//!     }
//!
//!     fn reducer(&self) -> &dyn StateReducer<BlockNumberState, Block> {
//!         &BlockNumberReducer
//!     }
//!
//!     fn handle_changes(&self, prev: &BlockNumberState, next: &BlockNumberState) -> Result<(), WatchError> {
//!         println!("{} -> {}", prev.block_number, next.block_number);
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::collections::VecDeque;

use crate::cache::BlockCache;
use crate::error::WatchError;
use crate::reducer::{AnchorState, StateReducer};
use crate::types::{BlockStub, ChainBlock};

/// A pluggable consumer of anchor-state transitions.
///
/// `handle_changes` may perform arbitrary side effects. It must accept a
/// `next` state that undoes transitions it saw earlier: after a reorg the
/// state is recomputed along the new branch, and the component receives the
/// new canonical state rather than a list of reverted events.
pub trait Component<B: ChainBlock>: Send + Sync + 'static {
    type State: AnchorState;

    /// Unique name; identifies the component within a machine.
    fn name(&self) -> &str;

    fn reducer(&self) -> &dyn StateReducer<Self::State, B>;

    /// Called once per head transition, in registration order.
    fn handle_changes(&self, prev: &Self::State, next: &Self::State) -> Result<(), WatchError>;
}

/// A component's state as of one block.
#[derive(Debug, Clone)]
struct Anchored<S> {
    block: BlockStub,
    state: S,
}

/// A computed but not yet committed transition.
struct Pending<S> {
    /// Drop history entries above this height before appending `states`.
    keep_up_to: Option<u64>,
    /// States along the replayed path, oldest first; the last one is the new anchor.
    states: Vec<Anchored<S>>,
    /// Forget all history (re-anchoring onto an unrelated chain).
    reset: bool,
}

/// Type-erased per-component state slot owned by the machine.
pub(crate) trait Slot<B: ChainBlock>: Send + Sync {
    fn name(&self) -> &str;

    /// Compute the transition to `head` without side effects.
    fn prepare(&mut self, cache: &BlockCache<B>, head: &B) -> Result<(), WatchError>;

    /// Notify the component of the prepared transition and adopt it.
    fn commit(&mut self) -> Result<(), WatchError>;

    fn discard(&mut self);

    /// Re-anchor with `initial_state` on the next head.
    fn mark_reanchor(&mut self);

    fn anchor(&self) -> Option<&BlockStub>;

    fn state_any(&self) -> Option<&dyn Any>;
}

pub(crate) struct ComponentSlot<B: ChainBlock, C: Component<B>> {
    component: C,
    history: VecDeque<Anchored<C::State>>,
    history_depth: usize,
    pending: Option<Pending<C::State>>,
    reanchor: bool,
}

impl<B: ChainBlock, C: Component<B>> ComponentSlot<B, C> {
    pub(crate) fn new(component: C, history_depth: usize) -> Self {
        Self {
            component,
            history: VecDeque::new(),
            history_depth: history_depth.max(1),
            pending: None,
            reanchor: false,
        }
    }

    fn current(&self) -> Option<&Anchored<C::State>> {
        self.history.back()
    }

    fn fresh(&self, head: &B) -> Pending<C::State> {
        Pending {
            keep_up_to: None,
            states: vec![Anchored {
                block: head.stub(),
                state: self.component.reducer().initial_state(head),
            }],
            reset: true,
        }
    }

    /// Replay from the common ancestor of the current anchor and `head`.
    fn replay(
        &self,
        cache: &BlockCache<B>,
        anchor: &BlockStub,
        head: &B,
    ) -> Result<Pending<C::State>, WatchError> {
        let reducer = self.component.reducer();
        let ancestor = cache.find_ancestor(&anchor.hash, head.hash())?;
        let mut state = match self.history.iter().rev().find(|a| a.block.hash == ancestor.hash()) {
            Some(known) => known.state.clone(),
            None => reducer.initial_state(ancestor),
        };

        let path = cache.path(ancestor.hash(), head.hash())?;
        let mut states = Vec::with_capacity(path.len().max(1));
        for block in path {
            state = reducer.reduce(&state, block);
            states.push(Anchored {
                block: block.stub(),
                state: state.clone(),
            });
        }
        if states.is_empty() {
            // `head` is the ancestor: a rollback onto one of our own blocks.
            states.push(Anchored {
                block: head.stub(),
                state,
            });
        }
        Ok(Pending {
            keep_up_to: Some(ancestor.number()),
            states,
            reset: false,
        })
    }
}

impl<B: ChainBlock, C: Component<B>> Slot<B> for ComponentSlot<B, C> {
    fn name(&self) -> &str {
        self.component.name()
    }

    fn prepare(&mut self, cache: &BlockCache<B>, head: &B) -> Result<(), WatchError> {
        self.pending = None;
        if self.reanchor || self.history.is_empty() {
            self.pending = Some(self.fresh(head));
            return Ok(());
        }
        let Some(current) = self.current() else {
            return Ok(());
        };
        if current.block.hash == head.hash() {
            return Ok(());
        }

        let pending = if head.parent_hash() == current.block.hash {
            let state = self.component.reducer().reduce(&current.state, head);
            Pending {
                keep_up_to: None,
                states: vec![Anchored {
                    block: head.stub(),
                    state,
                }],
                reset: false,
            }
        } else {
            let anchor = current.block.clone();
            self.replay(cache, &anchor, head)?
        };
        self.pending = Some(pending);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), WatchError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let Some(next) = pending.states.last() else {
            return Ok(());
        };

        if let Some(prev) = self.current() {
            self.component
                .handle_changes(&prev.state, &next.state)
                .map_err(|e| WatchError::Component {
                    component: self.component.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        if pending.reset {
            self.history.clear();
        }
        if let Some(height) = pending.keep_up_to {
            while self.history.back().is_some_and(|a| a.block.number > height) {
                self.history.pop_back();
            }
        }
        self.history.extend(pending.states);
        while self.history.len() > self.history_depth {
            self.history.pop_front();
        }
        self.reanchor = false;
        Ok(())
    }

    fn discard(&mut self) {
        self.pending = None;
    }

    fn mark_reanchor(&mut self) {
        self.reanchor = true;
    }

    fn anchor(&self) -> Option<&BlockStub> {
        self.current().map(|a| &a.block)
    }

    fn state_any(&self) -> Option<&dyn Any> {
        self.current().map(|a| &a.state as &dyn Any)
    }
}
