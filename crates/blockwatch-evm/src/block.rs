//! Decoding of EVM JSON-RPC block and log objects.

use serde_json::Value;

use blockwatch_core::types::{Block, LogEntry};

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Convert an `eth_getBlockBy*` result into a [`Block`] without logs.
///
/// Returns `None` for a `null` result or a malformed object.
pub fn block_from_json(v: &Value) -> Option<Block> {
    Some(Block {
        number: parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
        timestamp: parse_hex_u64(v["timestamp"].as_str()?)? as i64,
        logs: Vec::new(),
    })
}

/// Convert one `eth_getLogs` entry. Logs flagged `removed` are skipped.
pub fn log_from_json(v: &Value) -> Option<LogEntry> {
    if v["removed"].as_bool().unwrap_or(false) {
        return None;
    }
    Some(LogEntry {
        address: v["address"].as_str()?.to_string(),
        topics: v["topics"]
            .as_array()?
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        data: v["data"].as_str().unwrap_or("0x").to_string(),
        tx_hash: v["transactionHash"].as_str().unwrap_or_default().to_string(),
        log_index: v["logIndex"]
            .as_str()
            .and_then(parse_hex_u64)
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn block_decoding() {
        let v = json!({
            "number": "0x12a05f200",
            "hash": "0xbb",
            "parentHash": "0xaa",
            "timestamp": "0x65f0a1c0",
            "transactions": []
        });
        let block = block_from_json(&v).unwrap();
        assert_eq!(block.number, 5_000_000_000);
        assert_eq!(block.parent_hash, "0xaa");
        assert_eq!(block.timestamp, 0x65f0a1c0);
        assert!(block.logs.is_empty());

        assert!(block_from_json(&Value::Null).is_none());
        assert!(block_from_json(&json!({ "hash": "0xbb" })).is_none());
    }

    #[test]
    fn log_decoding() {
        let v = json!({
            "address": "0xC0FFEE",
            "topics": ["0xt0", "0xt1"],
            "data": "0x01",
            "transactionHash": "0xtx",
            "logIndex": "0x5",
            "removed": false
        });
        let log = log_from_json(&v).unwrap();
        assert_eq!(log.topics.len(), 2);
        assert_eq!(log.log_index, 5);
        assert!(log.is_from("0xc0ffee"));

        let removed = json!({ "address": "0x1", "topics": [], "removed": true });
        assert!(log_from_json(&removed).is_none());
    }
}
