//! State reducers: pure functions deriving anchor state from blocks.
//!
//! A reducer pairs `initial_state(block)` with `reduce(prev, block)`. For any
//! block `B` with parent `P`, `reduce(initial_state(P), B)` must equal
//! `initial_state(B)`; replay after a reorg may take either path.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::ChainBlock;

/// Marker for anchor state: application data valid as of one block.
///
/// Carries no behaviour; it only documents intent in generic bounds.
pub trait AnchorState: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> AnchorState for T {}

/// Computes the anchor state at a block.
///
/// Both methods must be pure: no hidden mutable state, and the same inputs
/// always give equivalent output.
pub trait StateReducer<S: AnchorState, B: ChainBlock>: Send + Sync {
    /// State at `block` computed from the block alone.
    fn initial_state(&self, block: &B) -> S;

    /// State at `block` given the state at its parent.
    fn reduce(&self, prev: &S, block: &B) -> S;
}

impl<S: AnchorState, B: ChainBlock, R: StateReducer<S, B> + ?Sized> StateReducer<S, B> for Arc<R> {
    fn initial_state(&self, block: &B) -> S {
        (**self).initial_state(block)
    }

    fn reduce(&self, prev: &S, block: &B) -> S {
        (**self).reduce(prev, block)
    }
}

// ─── BlockNumberReducer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNumberState {
    pub block_number: u64,
}

/// Selects the number of the anchor block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockNumberReducer;

impl<B: ChainBlock> StateReducer<BlockNumberState, B> for BlockNumberReducer {
    fn initial_state(&self, block: &B) -> BlockNumberState {
        BlockNumberState {
            block_number: block.number(),
        }
    }

    fn reduce(&self, _prev: &BlockNumberState, block: &B) -> BlockNumberState {
        BlockNumberState {
            block_number: block.number(),
        }
    }
}

// ─── MappedStateReducer ───────────────────────────────────────────────────────

/// An item tracked by a [`MappedStateReducer`], identified by a string id.
///
/// Items should be immutable; the collection they belong to may change.
pub trait MappedItem {
    fn id(&self) -> String;
}

/// Per-item states keyed by item id, plus the aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedState<S, A> {
    pub items: BTreeMap<String, S>,
    pub aggregate: A,
}

type ItemsFn<I> = dyn Fn() -> Vec<I> + Send + Sync;
type ItemReducerFn<I, S, B> = dyn Fn(&I) -> Arc<dyn StateReducer<S, B>> + Send + Sync;

/// Applies one reducer per item of a changing collection, alongside an
/// aggregate reducer over the whole state.
///
/// `items` is evaluated on every reduction, so membership can change from
/// block to block. Items that disappear are dropped from the state; new items
/// (or items without a previous state) are seeded with `initial_state`.
///
/// `item_reducer` must return an equivalent reducer every time it is called
/// for the same item, otherwise replay would not be consistent.
pub struct MappedStateReducer<I, S, A, B> {
    items: Arc<ItemsFn<I>>,
    item_reducer: Arc<ItemReducerFn<I, S, B>>,
    aggregate: Arc<dyn StateReducer<A, B>>,
}

impl<I, S, A, B> MappedStateReducer<I, S, A, B>
where
    I: MappedItem,
    S: AnchorState,
    A: AnchorState,
    B: ChainBlock,
{
    pub fn new(
        items: impl Fn() -> Vec<I> + Send + Sync + 'static,
        item_reducer: impl Fn(&I) -> Arc<dyn StateReducer<S, B>> + Send + Sync + 'static,
        aggregate: impl StateReducer<A, B> + 'static,
    ) -> Self {
        Self {
            items: Arc::new(items),
            item_reducer: Arc::new(item_reducer),
            aggregate: Arc::new(aggregate),
        }
    }
}

impl<I, S, A, B> StateReducer<MappedState<S, A>, B> for MappedStateReducer<I, S, A, B>
where
    I: MappedItem,
    S: AnchorState,
    A: AnchorState,
    B: ChainBlock,
{
    fn initial_state(&self, block: &B) -> MappedState<S, A> {
        let items = (self.items)()
            .iter()
            .map(|item| (item.id(), (self.item_reducer)(item).initial_state(block)))
            .collect();
        MappedState {
            items,
            aggregate: self.aggregate.initial_state(block),
        }
    }

    fn reduce(&self, prev: &MappedState<S, A>, block: &B) -> MappedState<S, A> {
        let items = (self.items)()
            .iter()
            .map(|item| {
                let id = item.id();
                let reducer = (self.item_reducer)(item);
                let state = match prev.items.get(&id) {
                    Some(prev_item) => reducer.reduce(prev_item, block),
                    None => reducer.initial_state(block),
                };
                (id, state)
            })
            .collect();
        MappedState {
            items,
            aggregate: self.aggregate.reduce(&prev.aggregate, block),
        }
    }
}

/// Aggregate reducer for mapped states that need no aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAggregate;

impl<B: ChainBlock> StateReducer<(), B> for NoAggregate {
    fn initial_state(&self, _block: &B) {}

    fn reduce(&self, _prev: &(), _block: &B) {}
}
