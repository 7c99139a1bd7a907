use bridgehub::clienv;
use bridgehub::supervisor::{LaunchSpec, WorkerFlags};
use bridgehub::Hub;

pub(crate) async fn cmd_hub(
    port: u16,
    pin: &str,
    debug: bool,
    verbose: bool,
    container: bool,
    orphans: bool,
) -> anyhow::Result<()> {
    let flags = WorkerFlags {
        debug,
        verbose,
        container,
        orphans,
    };
    let launch = LaunchSpec::current_exe(flags)?;
    tracing::trace!(program = %launch.program.display(), ?flags, "cmd_hub invoked");

    let hub = Hub::new(clienv::paths(), clienv::dev_mode(), launch);
    hub.run(port, pin).await
}
