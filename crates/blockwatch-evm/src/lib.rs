//! blockwatch-evm: EVM JSON-RPC block source for blockwatch.
//!
//! ```text
//! HttpRpcClient (reqwest) ── JsonRpcClient ──▶ EvmBlockSource ──▶ BlockProcessor
//!                                                ├── eth_getBlockByHash / ByNumber
//!                                                ├── eth_getLogs (optional)
//!                                                └── head poller (watch channel)
//! ```

pub mod block;
pub mod client;
pub mod rpc;
pub mod source;

pub use block::{block_from_json, log_from_json, parse_hex_u64};
pub use client::{HttpClientConfig, HttpRpcClient, JsonRpcClient};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use source::{EvmBlockSource, EvmSourceConfig};
