//! blockwatch-core: reorg-safe derived state over a live block stream.
//!
//! # Architecture
//!
//! ```text
//! BlockSource ──heads──▶ BlockProcessor ──HeadEvent──▶ BlockchainMachine
//!   (EVM / memory /          ├── backfill + retry          ├── Component slots
//!    delayed)                └── BlockCache (writer)       │     (history, anchor)
//!                                     ▲                    └── StateReducer replay
//!                                     └────── read-only ───────┘
//! ```

pub mod cache;
pub mod component;
pub mod config;
pub mod error;
pub mod machine;
pub mod memory;
pub mod processor;
pub mod reducer;
pub mod reorg;
pub mod retry;
pub mod source;
pub mod types;
pub mod wait;

pub use cache::BlockCache;
pub use component::Component;
pub use config::{WatchConfig, WatchConfigBuilder};
pub use error::WatchError;
pub use machine::{BlockchainMachine, MachineConfig};
pub use memory::MemoryBlockSource;
pub use processor::{BlockProcessor, HeadEvent, ProcessorConfig, ProcessorEvent, SharedCache};
pub use reducer::{
    AnchorState, BlockNumberReducer, BlockNumberState, MappedItem, MappedState,
    MappedStateReducer, NoAggregate, StateReducer,
};
pub use reorg::{ReorgInfo, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{BlockSource, DelayedBlockSource, HeadReceiver};
pub use types::{Block, BlockStub, ChainBlock, LogEntry};
pub use wait::{wait_for, wait_for_any, with_timeout};
