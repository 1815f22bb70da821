//! Process-context host for tasks built into ferry.
//!
//! Spawned by the process backend; reads its bootstrap record from stdin. Crates
//! with their own task types ship a binary like this one that registers them and
//! point `FERRY_WORKER_BIN` at it.

use std::process;

use ferry::task::TaskRegistry;

fn main() {
    ferry::logging::init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "Context host failed");
        eprintln!("ferry-worker: {e:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ferry-worker")
        .build()?;

    let result = runtime.block_on(ferry::host::child_main(TaskRegistry::with_diagnostics()))?;
    tracing::debug!(success = result.is_success(), "Exit result delivered");
    Ok(())
}
