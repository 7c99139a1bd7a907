use bridgehub::registry::BridgeInfo;
use bridgehub::{clienv, Registry};
use serde_json::{json, Value};

use super::{check_reply, hub_client, print_json};
use crate::args::BridgeCommands;

pub(crate) async fn cmd_bridge(command: BridgeCommands) -> anyhow::Result<()> {
    let (path, params, body) = match &command {
        BridgeCommands::Create {
            name,
            port,
            pin,
            username,
            advertiser,
        } => (
            "bridges:create",
            json!({}),
            json!({
                "name": name,
                "port": port,
                "pin": pin,
                "username": username,
                "advertiser": advertiser,
            }),
        ),
        BridgeCommands::List => ("bridges:list", json!({}), json!({})),
        BridgeCommands::Info {
            id,
            display,
            pin,
            autostart,
            advertiser,
        } => (
            "bridges:info",
            json!({ "id": id }),
            json!({
                "display": display,
                "pin": pin,
                "autostart": autostart,
                "advertiser": advertiser,
            }),
        ),
        BridgeCommands::Ports { id, start, end } => (
            "bridges:ports",
            json!({ "id": id }),
            json!({ "start": start, "end": end }),
        ),
        BridgeCommands::Uninstall { id } => ("bridges:uninstall", json!({ "id": id }), json!({})),
    };

    if let Some(hub) = hub_client().await {
        let answer = check_reply(hub.fetch(path, Some(params), Some(body)).await)?;
        hub.close();
        return render(&command, &answer);
    }

    tracing::debug!("Hub not running, editing the registry directly");
    let local = command.clone();
    let answer = tokio::task::spawn_blocking(move || apply_locally(&local)).await??;
    render(&command, &answer)?;
    if !matches!(command, BridgeCommands::List) {
        println!("Hub is not running; changes take effect when it starts.");
    }
    Ok(())
}

fn apply_locally(command: &BridgeCommands) -> anyhow::Result<Value> {
    let paths = clienv::paths();
    let mut registry = Registry::load(paths.clone(), clienv::dev_mode());

    let answer = match command {
        BridgeCommands::Create {
            name,
            port,
            pin,
            username,
            advertiser,
        } => {
            let record = registry.create(name, *port, pin, username.as_deref(), advertiser)?;
            serde_json::to_value(record.describe(&paths))?
        }
        BridgeCommands::List => {
            let infos: Vec<BridgeInfo> = registry
                .list()
                .iter()
                .map(|r| r.describe(&paths))
                .collect();
            serde_json::to_value(infos)?
        }
        BridgeCommands::Info {
            id,
            display,
            pin,
            autostart,
            advertiser,
        } => {
            let record = registry.update(id)?.info(
                display.as_deref(),
                pin.as_deref(),
                *autostart,
                advertiser.as_deref(),
            )?;
            serde_json::to_value(record.describe(&paths))?
        }
        BridgeCommands::Ports { id, start, end } => {
            let record = registry.update(id)?.ports(*start, *end)?;
            serde_json::to_value(record.describe(&paths))?
        }
        BridgeCommands::Uninstall { id } => json!({ "removed": registry.uninstall(id)? }),
    };
    Ok(answer)
}

fn render(command: &BridgeCommands, answer: &Value) -> anyhow::Result<()> {
    match command {
        BridgeCommands::List => {
            let Some(bridges) = answer.as_array().filter(|b| !b.is_empty()) else {
                println!("No bridges registered.");
                return Ok(());
            };
            println!("{:<20} {:<8} {:<7} {:<12} DISPLAY", "ID", "TYPE", "PORT", "PIN");
            for bridge in bridges {
                println!(
                    "{:<20} {:<8} {:<7} {:<12} {}",
                    bridge["id"].as_str().unwrap_or("-"),
                    bridge["type"].as_str().unwrap_or("-"),
                    bridge["port"],
                    bridge["pin"].as_str().unwrap_or("-"),
                    bridge["display"].as_str().unwrap_or("-"),
                );
            }
            Ok(())
        }
        BridgeCommands::Uninstall { id } => {
            if answer["removed"].as_bool().unwrap_or(false) {
                println!("Removed bridge {id}.");
            } else {
                println!("No bridge named {id}.");
            }
            Ok(())
        }
        _ => print_json(answer),
    }
}
