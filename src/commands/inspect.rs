use bridgehub::rpc::socket::{self, bridge_socket};
use bridgehub::rpc::{discard_events, LogLine, Router, DEFAULT_TIMEOUT};
use bridgehub::{clienv, Registry};
use serde_json::{json, Value};

use super::{check_reply, hub_client, parse_json, print_json};

pub(crate) async fn cmd_status() -> anyhow::Result<()> {
    let Some(hub) = hub_client().await else {
        println!("Hub is not running.");
        let registry = Registry::load(clienv::paths(), clienv::dev_mode());
        for record in registry.list() {
            println!("  {:<20} port {:<6} stopped", record.id, record.port);
        }
        return Ok(());
    };

    let status = check_reply(hub.fetch("status:get", None, None).await)?;
    let health = hub.fetch("health:get", None, None).await.unwrap_or(Value::Null);
    hub.close();

    println!(
        "Hub {} running, up {}s, {} bridge(s)",
        status["version"].as_str().unwrap_or("?"),
        status["uptime"],
        status["bridges"]
    );
    for worker in status["workers"].as_array().into_iter().flatten() {
        println!(
            "  {:<20} pid {:<8} restarts {:<4} up {}s",
            worker["id"].as_str().unwrap_or("-"),
            worker["pid"],
            worker["restarts"],
            worker["uptime_secs"]
        );
    }
    for bridge in health["bridges"].as_array().into_iter().flatten() {
        println!(
            "  {:<20} {}",
            bridge["id"].as_str().unwrap_or("-"),
            bridge["status"].as_str().unwrap_or("-")
        );
    }
    Ok(())
}

/// `call hub <path>` talks to the hub; `call <id> <path>` goes through the
/// hub to that worker, or straight to a standalone worker's socket.
pub(crate) async fn cmd_call(
    target: &str,
    path: &str,
    params: Option<String>,
    body: Option<String>,
) -> anyhow::Result<()> {
    let params = parse_json("params", params)?;
    let body = parse_json("body", body)?;

    let answer = match (target, hub_client().await) {
        ("hub", Some(hub)) => hub.fetch(path, params, body).await,
        ("hub", None) => anyhow::bail!("Hub is not running"),
        (id, Some(hub)) => {
            hub.fetch(
                "bridge:fetch",
                Some(json!({ "id": id, "path": path })),
                Some(json!({ "params": params, "body": body })),
            )
            .await
        }
        (id, None) => {
            let peer = socket::connect(&bridge_socket(id), Router::new(), discard_events(), DEFAULT_TIMEOUT)
                .await
                .map_err(|e| anyhow::anyhow!("Neither the hub nor bridge '{}' is reachable: {}", id, e))?;
            let answer = peer.fetch(path, params, body).await;
            peer.close();
            answer
        }
    };

    match answer {
        Some(value) => print_json(&value),
        None => {
            println!("No answer.");
            Ok(())
        }
    }
}

pub(crate) async fn cmd_logs(id: &str, lines: usize) -> anyhow::Result<()> {
    let hub = hub_client()
        .await
        .ok_or_else(|| anyhow::anyhow!("Hub is not running"))?;
    let answer = check_reply(
        hub.fetch("logs:tail", Some(json!({ "id": id, "lines": lines })), None)
            .await
            .or(Some(json!([]))),
    )?;
    hub.close();

    let lines: Vec<LogLine> = serde_json::from_value(answer)?;
    for line in lines {
        println!(
            "{} [{:?}] {}",
            line.timestamp.as_deref().unwrap_or("-"),
            line.level,
            line.message
        );
    }
    Ok(())
}
