//! End-to-end tests: memory source → processor → machine → components.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blockwatch_core::memory::test_block;
use blockwatch_core::{
    wait_for, Block, BlockNumberReducer, BlockNumberState, BlockProcessor, BlockSource,
    BlockStub, BlockchainMachine, Component, DelayedBlockSource, LogEntry, MachineConfig,
    MemoryBlockSource, ProcessorConfig, RetryConfig, RetryPolicy, StateReducer, WatchError,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const ADJUDICATOR: &str = "0x00000000000000000000000000000000000000aa";
const CHALLENGE_REGISTERED: &str = "0xchallenge";

// ─── Fixtures ─────────────────────────────────────────────────────────────────

type Ledger = Arc<Mutex<HashMap<String, Block>>>;

/// A memory chain plus an append-only record of every block ever produced,
/// on any branch.
struct Chain {
    source: Arc<MemoryBlockSource>,
    ledger: Ledger,
}

impl Chain {
    fn new() -> Self {
        let chain = Self {
            source: Arc::new(MemoryBlockSource::new()),
            ledger: Arc::new(Mutex::new(HashMap::new())),
        };
        chain.push(0, "a0", "0x0", false);
        chain
    }

    fn block(&self, number: u64, hash: &str, parent: &str, challenge: bool) -> Block {
        let mut block = test_block(number, hash, parent);
        if challenge {
            block.logs.push(LogEntry {
                address: ADJUDICATOR.into(),
                topics: vec![CHALLENGE_REGISTERED.into()],
                data: "0x".into(),
                tx_hash: format!("0xtx{hash}"),
                log_index: 0,
            });
        }
        self.ledger.lock().unwrap().insert(hash.into(), block.clone());
        block
    }

    fn push(&self, number: u64, hash: &str, parent: &str, challenge: bool) {
        let block = self.block(number, hash, parent, challenge);
        self.source.push(block);
    }

    /// Push `{prefix}{from}..={prefix}{to}` without waiting in between.
    fn branch(&self, prefix: &str, parent: &str, from: u64, to: u64) {
        for n in from..=to {
            let parent = if n == from { parent.to_string() } else { format!("{prefix}{}", n - 1) };
            self.push(n, &format!("{prefix}{n}"), &parent, false);
        }
    }

    fn get(&self, hash: &str) -> Block {
        self.ledger.lock().unwrap()[hash].clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChallengeState {
    block_number: u64,
    challenges: u64,
}

/// Counts challenge logs on the branch ending at the anchor block.
#[derive(Clone)]
struct ChallengeReducer {
    ledger: Ledger,
}

fn challenged(block: &Block) -> bool {
    block.logs_matching(ADJUDICATOR, CHALLENGE_REGISTERED).next().is_some()
}

impl StateReducer<ChallengeState, Block> for ChallengeReducer {
    fn initial_state(&self, block: &Block) -> ChallengeState {
        let ledger = self.ledger.lock().unwrap();
        let mut challenges = 0;
        let mut cursor = Some(block.clone());
        while let Some(b) = cursor {
            challenges += u64::from(challenged(&b));
            cursor = ledger.get(&b.parent_hash).cloned();
        }
        ChallengeState {
            block_number: block.number,
            challenges,
        }
    }

    fn reduce(&self, prev: &ChallengeState, block: &Block) -> ChallengeState {
        ChallengeState {
            block_number: block.number,
            challenges: prev.challenges + u64::from(challenged(block)),
        }
    }
}

struct ChallengeWatcher {
    reducer: ChallengeReducer,
    calls: Arc<AtomicUsize>,
    fail_at: Option<u64>,
}

impl Component<Block> for ChallengeWatcher {
    type State = ChallengeState;

    fn name(&self) -> &str {
        "challenges"
    }

    fn reducer(&self) -> &dyn StateReducer<ChallengeState, Block> {
        &self.reducer
    }

    fn handle_changes(&self, _prev: &ChallengeState, next: &ChallengeState) -> Result<(), WatchError> {
        if self.fail_at == Some(next.block_number) {
            return Err(WatchError::Other("responder unavailable".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BlockNumbers {
    calls: Arc<AtomicUsize>,
}

impl Component<Block> for BlockNumbers {
    type State = BlockNumberState;

    fn name(&self) -> &str {
        "block-number"
    }

    fn reducer(&self) -> &dyn StateReducer<BlockNumberState, Block> {
        &BlockNumberReducer
    }

    fn handle_changes(&self, _: &BlockNumberState, _: &BlockNumberState) -> Result<(), WatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn processor_config(max_depth: u64) -> ProcessorConfig {
    ProcessorConfig {
        max_depth,
        fetch_timeout: Duration::from_secs(1),
        event_capacity: 64,
        retry: RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }),
    }
}

fn machine<S: BlockSource<Block> + 'static>(source: Arc<S>, max_depth: u64) -> BlockchainMachine<Block, S> {
    let processor = Arc::new(BlockProcessor::new(source, processor_config(max_depth)));
    BlockchainMachine::new(
        processor,
        MachineConfig {
            history_depth: max_depth,
            event_capacity: 64,
        },
    )
}

struct Harness {
    chain: Chain,
    machine: BlockchainMachine<Block, MemoryBlockSource>,
    reducer: ChallengeReducer,
    challenge_calls: Arc<AtomicUsize>,
    number_calls: Arc<AtomicUsize>,
}

async fn harness(max_depth: u64, fail_at: Option<u64>) -> Harness {
    let chain = Chain::new();
    let machine = machine(Arc::clone(&chain.source), max_depth);
    let reducer = ChallengeReducer {
        ledger: Arc::clone(&chain.ledger),
    };
    let challenge_calls = Arc::new(AtomicUsize::new(0));
    let number_calls = Arc::new(AtomicUsize::new(0));
    machine
        .add_component(ChallengeWatcher {
            reducer: reducer.clone(),
            calls: Arc::clone(&challenge_calls),
            fail_at,
        })
        .await
        .unwrap();
    machine
        .add_component(BlockNumbers {
            calls: Arc::clone(&number_calls),
        })
        .await
        .unwrap();
    Harness {
        chain,
        machine,
        reducer,
        challenge_calls,
        number_calls,
    }
}

async fn anchored(rx: broadcast::Receiver<BlockStub>, hash: &str) {
    let hash = hash.to_string();
    let found = tokio::time::timeout(
        Duration::from_secs(3),
        wait_for(rx, move |s: &BlockStub| s.hash == hash, CancellationToken::new()),
    )
    .await
    .expect("timed out waiting for anchor");
    assert!(found.is_some());
}

impl Harness {
    /// Push one block and wait until every component is anchored to it.
    async fn step(&self, number: u64, hash: &str, parent: &str, challenge: bool) {
        let rx = self.machine.subscribe_anchors();
        self.chain.push(number, hash, parent, challenge);
        anchored(rx, hash).await;
    }

    async fn challenges(&self) -> ChallengeState {
        self.machine.state("challenges").await.unwrap()
    }

    async fn block_number(&self) -> u64 {
        self.machine
            .state::<BlockNumberState>("block-number")
            .await
            .unwrap()
            .block_number
    }
}

// ─── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn extension_matches_single_pass() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();

    for n in 1..=10u64 {
        let parent = format!("a{}", n - 1);
        h.step(n, &format!("a{n}"), &parent, n == 3 || n == 7).await;
    }

    let mut expected = h.reducer.initial_state(&h.chain.get("a0"));
    for n in 1..=10 {
        expected = h.reducer.reduce(&expected, &h.chain.get(&format!("a{n}")));
    }
    assert_eq!(h.challenges().await, expected);
    assert_eq!(expected.challenges, 2);
    assert_eq!(h.reducer.initial_state(&h.chain.get("a10")), expected);
    assert_eq!(h.challenge_calls.load(Ordering::SeqCst), 10);
    assert_eq!(h.number_calls.load(Ordering::SeqCst), 10);
    h.machine.stop().await;
}

#[tokio::test]
async fn reorg_replay_leaves_no_trace_of_abandoned_branch() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    h.step(1, "a1", "a0", true).await;
    h.step(2, "a2", "a1", false).await;
    assert_eq!(h.challenges().await.challenges, 1);

    let rx = h.machine.subscribe_anchors();
    h.chain.branch("b", "a0", 1, 2);
    anchored(rx, "b2").await;

    // Same chain processed from scratch, without ever seeing a1/a2.
    let fresh = Chain::new();
    fresh.push(1, "b1", "a0", false);
    fresh.push(2, "b2", "b1", false);
    let reducer = ChallengeReducer {
        ledger: Arc::clone(&fresh.ledger),
    };
    let mut expected = reducer.initial_state(&fresh.get("a0"));
    expected = reducer.reduce(&expected, &fresh.get("b1"));
    expected = reducer.reduce(&expected, &fresh.get("b2"));

    assert_eq!(h.challenges().await, expected);
    assert_eq!(h.challenges().await.challenges, 0);
    assert_eq!(h.machine.anchor("challenges").await.unwrap().hash, "b2");
    h.machine.stop().await;
}

#[tokio::test]
async fn reorg_to_shorter_branch_moves_block_number_back() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    for n in 1..=10u64 {
        h.step(n, &format!("a{n}"), &format!("a{}", n - 1), n == 8).await;
    }
    assert_eq!(h.block_number().await, 10);

    let rx = h.machine.subscribe_anchors();
    h.chain.branch("c", "a5", 6, 8);
    anchored(rx, "c8").await;

    assert_eq!(h.block_number().await, 8);
    let state = h.challenges().await;
    assert_eq!(state, h.reducer.initial_state(&h.chain.get("c8")));
    assert_eq!(state.challenges, 0);
    h.machine.stop().await;
}

#[tokio::test]
async fn reorg_deeper_than_window_is_reported_and_recovered() {
    let h = harness(3, None).await;
    for n in 1..=4u64 {
        h.chain.push(n, &format!("a{n}"), &format!("a{}", n - 1), false);
    }
    h.machine.start().await.unwrap();
    assert_eq!(h.block_number().await, 4);

    let mut errors = h.machine.subscribe_errors();
    h.chain.branch("d", "a0", 1, 8);
    let err = tokio::time::timeout(Duration::from_secs(3), errors.recv())
        .await
        .expect("no error reported")
        .unwrap();
    assert!(err.is_reorg_too_deep(), "unexpected error {err:?}");

    // Components were not advanced onto the unresolved head.
    assert_eq!(h.machine.anchor("block-number").await.unwrap().hash, "a4");

    // The next head re-anchors every component on the new chain.
    h.step(9, "d9", "d8", true).await;
    assert_eq!(h.block_number().await, 9);
    assert_eq!(h.challenges().await, h.reducer.initial_state(&h.chain.get("d9")));

    let cache = h.machine.processor().cache();
    let cache = cache.read().await;
    assert_eq!(cache.head().unwrap().hash, "d9");
    assert!(cache.contains("d8"));
    assert!(!cache.contains("a4"));
    drop(cache);
    h.machine.stop().await;
}

#[tokio::test]
async fn failing_component_aborts_cycle_but_machine_continues() {
    let h = harness(50, Some(3)).await;
    h.machine.start().await.unwrap();
    h.step(1, "a1", "a0", false).await;
    h.step(2, "a2", "a1", false).await;

    let mut errors = h.machine.subscribe_errors();
    h.chain.push(3, "a3", "a2", false);
    let err = tokio::time::timeout(Duration::from_secs(3), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, WatchError::Component { ref component, .. } if component == "challenges"));
    // The later component was not notified and kept its anchor.
    assert_eq!(h.machine.anchor("block-number").await.unwrap().hash, "a2");
    assert_eq!(h.number_calls.load(Ordering::SeqCst), 2);

    h.step(4, "a4", "a3", true).await;
    assert_eq!(h.block_number().await, 4);
    assert_eq!(h.challenges().await.challenges, 1);
    assert_eq!(h.number_calls.load(Ordering::SeqCst), 3);
    h.machine.stop().await;
}

#[tokio::test]
async fn start_and_stop_are_idempotent_and_final() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    h.machine.start().await.unwrap();
    assert_eq!(h.chain.source.subscriber_count(), 1);
    h.step(1, "a1", "a0", false).await;

    h.machine.stop().await;
    h.machine.stop().await;
    assert_eq!(h.chain.source.subscriber_count(), 0);

    let calls = h.number_calls.load(Ordering::SeqCst);
    h.chain.push(2, "a2", "a1", false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.number_calls.load(Ordering::SeqCst), calls);
    assert_eq!(h.block_number().await, 1);
}

#[tokio::test]
async fn restart_catches_up() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    h.step(1, "a1", "a0", false).await;
    h.machine.stop().await;

    h.chain.push(2, "a2", "a1", true);
    h.chain.push(3, "a3", "a2", false);
    h.machine.start().await.unwrap();
    assert_eq!(h.block_number().await, 3);
    assert_eq!(h.challenges().await.challenges, 1);
    h.machine.stop().await;
}

#[tokio::test]
async fn transient_source_failures_are_invisible() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    let mut errors = h.machine.subscribe_errors();

    h.chain.source.fail_next(2);
    h.step(1, "a1", "a0", false).await;
    assert_eq!(h.block_number().await, 1);
    assert!(matches!(errors.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    h.machine.stop().await;
}

#[tokio::test]
async fn duplicate_head_notification_is_ignored() {
    let h = harness(50, None).await;
    h.machine.start().await.unwrap();
    h.step(1, "a1", "a0", false).await;
    let calls = h.number_calls.load(Ordering::SeqCst);

    let mut anchors = h.machine.subscribe_anchors();
    h.chain.source.set_head("a1").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(anchors.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    assert_eq!(h.number_calls.load(Ordering::SeqCst), calls);
    h.machine.stop().await;
}

#[tokio::test]
async fn delayed_source_anchors_behind_the_tip() {
    let chain = Chain::new();
    let delayed = Arc::new(DelayedBlockSource::new(Arc::clone(&chain.source), 2));
    let machine = machine(delayed, 50);
    machine
        .add_component(BlockNumbers {
            calls: Arc::new(AtomicUsize::new(0)),
        })
        .await
        .unwrap();
    for n in 1..=3u64 {
        chain.push(n, &format!("a{n}"), &format!("a{}", n - 1), false);
    }
    machine.start().await.unwrap();
    let state: BlockNumberState = machine.state("block-number").await.unwrap();
    assert_eq!(state.block_number, 1);

    let rx = machine.subscribe_anchors();
    for n in 4..=6u64 {
        chain.push(n, &format!("a{n}"), &format!("a{}", n - 1), false);
    }
    anchored(rx, "a4").await;
    machine.stop().await;
}
