use anyhow::{ensure, Context};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

const MAX_SYMBOL_LEN: usize = 32;

/// Payload of the "stock updates" topic. Only `symbol` is interpreted; any
/// other keys the producing side adds are carried along untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct StockUpdateEvent {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StockUpdateEvent {
    pub fn from_payload(payload: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice::<Self>(payload).with_context(|| {
            format!(
                "stock update payload is not a JSON object: {}",
                String::from_utf8_lossy(payload)
            )
        })
    }

    pub fn validated_symbol(&self) -> anyhow::Result<String> {
        let raw = self
            .symbol
            .as_deref()
            .context("stock update event has no symbol")?;
        normalize_symbol(raw)
    }
}

/// Trims and checks a ticker coming from any inbound surface.
pub fn normalize_symbol(raw: &str) -> anyhow::Result<String> {
    let symbol = raw.trim();
    ensure!(!symbol.is_empty(), "symbol must be non-empty");
    ensure!(
        symbol.len() <= MAX_SYMBOL_LEN,
        "symbol too long ({} > {MAX_SYMBOL_LEN}): {symbol}",
        symbol.len()
    );
    ensure!(
        !symbol.chars().any(|c| c.is_whitespace() || c.is_control()),
        "symbol must not contain whitespace: {symbol:?}"
    );
    Ok(symbol.to_string())
}
