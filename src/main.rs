mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use std::io::IsTerminal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Hub {
            port,
            pin,
            debug,
            container,
            orphans,
        } => commands::hub::cmd_hub(port, &pin, debug, cli.verbose, container, orphans).await?,
        Commands::Worker {
            bridge,
            port,
            debug,
            container,
            orphans,
        } => {
            commands::worker::cmd_worker(bridge, port, debug, cli.verbose, container, orphans)
                .await?
        }
        Commands::Bridge { command } => commands::bridge::cmd_bridge(command).await?,
        Commands::Status => commands::inspect::cmd_status().await?,
        Commands::Call {
            target,
            path,
            params,
            body,
        } => commands::inspect::cmd_call(&target, &path, params, body).await?,
        Commands::Logs { id, lines } => commands::inspect::cmd_logs(&id, lines).await?,
        Commands::Export { id, out } => commands::export::cmd_export(&id, &out).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("bridgehub={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .init();
}
