use bridgehub::archive;
use bridgehub::{clienv, Registry};
use std::path::Path;

pub(crate) async fn cmd_export(id: &str, out: &Path) -> anyhow::Result<()> {
    let paths = clienv::paths();
    let registry = Registry::load(paths.clone(), clienv::dev_mode());
    let record = registry
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Bridge '{}' not found", id))?;

    let target = out.to_path_buf();
    let files = tokio::task::spawn_blocking(move || archive::export_bridge(&paths, &record, &target))
        .await??;

    println!("Exported {} file(s) to {}", files, out.display());
    Ok(())
}
