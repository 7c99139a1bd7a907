pub(crate) mod bridge;
pub(crate) mod export;
pub(crate) mod hub;
pub(crate) mod inspect;
pub(crate) mod worker;

use bridgehub::rpc::socket;
use bridgehub::rpc::{discard_events, Peer, Router, DEFAULT_TIMEOUT, HUB_SOCKET};
use serde_json::Value;
use std::sync::Arc;

/// Connect to a running hub, if there is one.
pub(crate) async fn hub_client() -> Option<Arc<Peer>> {
    match socket::connect(HUB_SOCKET, Router::new(), discard_events(), DEFAULT_TIMEOUT).await {
        Ok(peer) => Some(peer),
        Err(e) => {
            tracing::debug!("Hub not reachable: {}", e);
            None
        }
    }
}

/// Turn a control-plane `{error, message}` answer into an error.
pub(crate) fn check_reply(answer: Option<Value>) -> anyhow::Result<Value> {
    let answer = answer.ok_or_else(|| anyhow::anyhow!("The hub did not answer"))?;
    if let Some(slug) = answer.get("error").and_then(Value::as_str) {
        let message = answer
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(slug);
        anyhow::bail!("{}", message);
    }
    Ok(answer)
}

pub(crate) fn parse_json(flag: &str, raw: Option<String>) -> anyhow::Result<Option<Value>> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("Invalid JSON for --{}: {}", flag, e))
    })
    .transpose()
}

pub(crate) fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
