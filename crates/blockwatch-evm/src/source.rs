//! Polling EVM block source.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use blockwatch_core::error::WatchError;
use blockwatch_core::source::{BlockSource, HeadReceiver};
use blockwatch_core::types::{Block, BlockStub, ChainBlock};

use crate::block::{block_from_json, log_from_json};
use crate::client::JsonRpcClient;

#[derive(Debug, Clone)]
pub struct EvmSourceConfig {
    /// How often `eth_getBlockByNumber("latest")` is polled while someone
    /// is subscribed to heads.
    pub poll_interval: Duration,
    /// Attach `eth_getLogs({ blockHash })` results to every fetched block.
    pub fetch_logs: bool,
}

impl Default for EvmSourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_logs: false,
        }
    }
}

/// [`BlockSource`] over an EVM JSON-RPC endpoint.
///
/// Head notifications come from a poller spawned on the first subscription.
/// The poller exits once every receiver has been dropped and is restarted by
/// the next subscription.
pub struct EvmBlockSource<C: JsonRpcClient> {
    client: Arc<C>,
    config: EvmSourceConfig,
    heads: Arc<watch::Sender<Option<BlockStub>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<C: JsonRpcClient + 'static> EvmBlockSource<C> {
    pub fn new(client: C, config: EvmSourceConfig) -> Self {
        let (heads, _) = watch::channel(None);
        Self {
            client: Arc::new(client),
            config,
            heads: Arc::new(heads),
            poller: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn ensure_poller(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let client = Arc::clone(&self.client);
        let heads = Arc::clone(&self.heads);
        let fetch_logs = self.config.fetch_logs;
        let period = self.config.poll_interval;
        *poller = Some(tokio::spawn(async move {
            poll_heads(client, heads, period, fetch_logs).await
        }));
    }
}

async fn poll_heads<C: JsonRpcClient>(
    client: Arc<C>,
    heads: Arc<watch::Sender<Option<BlockStub>>>,
    period: Duration,
    fetch_logs: bool,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(interval_ms = period.as_millis() as u64, "head poller started");
    loop {
        tokio::select! {
            _ = heads.closed() => break,
            _ = interval.tick() => {}
        }
        match latest_block(client.as_ref(), fetch_logs).await {
            Ok(block) => {
                let stub = block.stub();
                heads.send_if_modified(|current| {
                    if current.as_ref() == Some(&stub) {
                        false
                    } else {
                        tracing::trace!(number = stub.number, hash = %stub.hash, "polled new head");
                        *current = Some(stub);
                        true
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "head poll failed"),
        }
    }
    tracing::debug!("head poller stopped: no subscribers");
}

async fn latest_block<C: JsonRpcClient + ?Sized>(client: &C, fetch_logs: bool) -> Result<Block, WatchError> {
    let raw = client
        .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
        .await?;
    if raw.is_null() {
        return Err(WatchError::Source("node returned no latest block".into()));
    }
    let block = decode_block(&raw)?;
    with_logs(client, block, fetch_logs).await
}

fn decode_block(raw: &Value) -> Result<Block, WatchError> {
    block_from_json(raw).ok_or_else(|| WatchError::Other(format!("malformed block object: {raw}")))
}

async fn with_logs<C: JsonRpcClient + ?Sized>(
    client: &C,
    mut block: Block,
    fetch_logs: bool,
) -> Result<Block, WatchError> {
    if !fetch_logs {
        return Ok(block);
    }
    let raw = client
        .call("eth_getLogs", vec![json!({ "blockHash": block.hash })])
        .await?;
    block.logs = raw
        .as_array()
        .map(|logs| logs.iter().filter_map(log_from_json).collect())
        .unwrap_or_default();
    Ok(block)
}

#[async_trait]
impl<C: JsonRpcClient + 'static> BlockSource<Block> for EvmBlockSource<C> {
    async fn get_block(&self, hash: &str) -> Result<Option<Block>, WatchError> {
        let raw = self
            .client
            .call("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        let block = decode_block(&raw)?;
        with_logs(self.client.as_ref(), block, self.config.fetch_logs)
            .await
            .map(Some)
    }

    async fn get_head(&self) -> Result<Block, WatchError> {
        latest_block(self.client.as_ref(), self.config.fetch_logs).await
    }

    fn subscribe_heads(&self) -> HeadReceiver {
        let rx = self.heads.subscribe();
        self.ensure_poller();
        rx
    }
}
