//! blockwatch CLI: follow a chain and print anchor-state transitions.
//!
//! Usage:
//! ```bash
//! blockwatch watch --url http://127.0.0.1:8545 --max-depth 64 --poll-ms 2000
//! blockwatch watch --config blockwatch.json --delay 2
//! blockwatch info
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::EnvFilter;

use blockwatch_core::{
    BlockNumberReducer, BlockNumberState, BlockProcessor, BlockSource, BlockchainMachine, Block,
    Component, DelayedBlockSource, MachineConfig, ProcessorConfig, StateReducer, WatchConfig,
    WatchError,
};
use blockwatch_evm::{EvmBlockSource, EvmSourceConfig, HttpClientConfig, HttpRpcClient};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("blockwatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("blockwatch {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe block monitoring and derived state\n");
    println!("USAGE:");
    println!("    blockwatch <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    watch    Follow a node and log anchor-state transitions");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("WATCH OPTIONS:");
    println!("    --url <URL>        JSON-RPC endpoint (or BLOCKWATCH_RPC_URL)");
    println!("    --config <FILE>    JSON config file");
    println!("    --max-depth <N>    Blocks retained behind the head");
    println!("    --poll-ms <MS>     Head polling interval");
    println!("    --delay <N>        Follow the chain N blocks behind the tip");
}

fn cmd_info() {
    let config = WatchConfig::default();
    println!("blockwatch v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default max depth: {} blocks", config.max_depth);
    println!("  Default poll interval: {} ms", config.poll_interval_ms);
    println!("  Default fetch timeout: {} ms", config.fetch_timeout_ms);
    println!(
        "  Default retry: {} attempts, {} ms initial backoff",
        config.retry.max_retries, config.retry.initial_backoff_ms
    );
    println!("  Sources: EVM JSON-RPC over HTTP (polling)");
}

struct WatchArgs {
    url: Option<String>,
    config: Option<String>,
    max_depth: Option<u64>,
    poll_ms: Option<u64>,
    delay: u64,
}

fn parse_watch_args(args: &[String]) -> Result<WatchArgs> {
    let mut parsed = WatchArgs {
        url: env::var("BLOCKWATCH_RPC_URL").ok(),
        config: None,
        max_depth: None,
        poll_ms: None,
        delay: 0,
    };
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let mut value = || {
            it.next()
                .cloned()
                .ok_or_else(|| anyhow!("missing value for {flag}"))
        };
        match flag.as_str() {
            "--url" => parsed.url = Some(value()?),
            "--config" => parsed.config = Some(value()?),
            "--max-depth" => parsed.max_depth = Some(value()?.parse().context("--max-depth")?),
            "--poll-ms" => parsed.poll_ms = Some(value()?.parse().context("--poll-ms")?),
            "--delay" => parsed.delay = value()?.parse().context("--delay")?,
            other => bail!("unknown option {other}"),
        }
    }
    Ok(parsed)
}

async fn cmd_watch(args: &[String]) -> Result<()> {
    init_tracing();
    let args = parse_watch_args(args)?;

    let mut config = match &args.config {
        Some(path) => WatchConfig::load(path)?,
        None => WatchConfig::default(),
    };
    if let Some(depth) = args.max_depth {
        config.max_depth = depth;
    }
    if let Some(ms) = args.poll_ms {
        config.poll_interval_ms = ms;
    }
    config.validate()?;

    let url = args
        .url
        .ok_or_else(|| anyhow!("no RPC endpoint: pass --url or set BLOCKWATCH_RPC_URL"))?;
    let client = HttpRpcClient::new(
        url.clone(),
        HttpClientConfig {
            request_timeout: config.fetch_timeout(),
        },
    )?;
    let source = Arc::new(EvmBlockSource::new(
        client,
        EvmSourceConfig {
            poll_interval: config.poll_interval(),
            fetch_logs: false,
        },
    ));
    tracing::info!(chain = %config.chain, %url, max_depth = config.max_depth, delay = args.delay, "watching");

    if args.delay > 0 {
        run(Arc::new(DelayedBlockSource::new(source, args.delay)), &config).await
    } else {
        run(source, &config).await
    }
}

async fn run<S: BlockSource<Block> + 'static>(source: Arc<S>, config: &WatchConfig) -> Result<()> {
    let processor = Arc::new(BlockProcessor::new(source, ProcessorConfig::from(config)));
    let machine = BlockchainMachine::new(processor, MachineConfig::from(config));
    machine.add_component(HeadLogger).await?;

    let mut errors = machine.subscribe_errors();
    let reporter = tokio::spawn(async move {
        while let Ok(e) = errors.recv().await {
            if e.is_reorg_too_deep() {
                tracing::error!(error = %e, "ALERT: reorg beyond retained window; components re-anchored");
            } else {
                tracing::error!(error = %e, "processing cycle failed");
            }
        }
    });

    machine.start().await?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("failed to listen for ctrl-c: {e}"))?;
    tracing::info!("shutting down");
    machine.stop().await;
    reporter.abort();
    Ok(())
}

/// Logs every anchor transition, including rollbacks.
struct HeadLogger;

impl Component<Block> for HeadLogger {
    type State = BlockNumberState;

    fn name(&self) -> &str {
        "head-logger"
    }

    fn reducer(&self) -> &dyn StateReducer<BlockNumberState, Block> {
        &BlockNumberReducer
    }

    fn handle_changes(&self, prev: &BlockNumberState, next: &BlockNumberState) -> Result<(), WatchError> {
        if next.block_number < prev.block_number {
            tracing::warn!(from = prev.block_number, to = next.block_number, "anchor rolled back");
        } else {
            tracing::info!(from = prev.block_number, to = next.block_number, "anchor advanced");
        }
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
