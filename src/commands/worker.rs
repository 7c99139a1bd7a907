use bridgehub::clienv;
use bridgehub::worker::{Worker, WorkerOptions};

pub(crate) async fn cmd_worker(
    bridge: String,
    port: u16,
    debug: bool,
    verbose: bool,
    container: bool,
    orphans: bool,
) -> anyhow::Result<()> {
    let options = WorkerOptions {
        bridge,
        port,
        debug,
        verbose,
        container,
        orphans,
    };
    tracing::trace!(?options, "cmd_worker invoked");

    let worker = Worker::new(options, clienv::paths(), clienv::dev_mode())?;
    worker.run().await
}
