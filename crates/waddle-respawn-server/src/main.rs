use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use waddle_respawn::{get_args, ClapFlags, ListenerFactory, SpawnOption};

mod config;
mod server;
mod telemetry;
mod trap;

use config::{LoadedConfig, ServerConfig};
use server::Listeners;
use trap::{Drain, Trap, TrapSignal};

#[tokio::main]
async fn main() -> Result<()> {
    let loaded = ServerConfig::load().unwrap_or_else(|e| e.exit());

    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "Waddle respawn server starting"
    );
    loaded.config.log_config();

    if loaded.config.daemon {
        return run_daemonize(&loaded);
    }

    run(loaded.config).await
}

/// Start a detached copy of this server without `--daemon`, then return.
fn run_daemonize(loaded: &LoadedConfig) -> Result<()> {
    let flags = ClapFlags::new(&loaded.command, &loaded.matches);
    let args = get_args(&flags, Vec::<String>::new(), |name| name == "daemon")?;

    let mut option = SpawnOption::new();
    if let Some(path) = &loaded.config.stderr_log {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open stderr log {}", path.display()))?;
        option = option.stderr(log);
    }

    let exe = waddle_respawn::current_executable()?;
    let child = waddle_respawn::daemonize(exe, &option, &args)?;
    info!(pid = child.id(), args = ?args, "Daemon started");

    if let Some(path) = &loaded.config.pid_file {
        write_atomic(path, &format!("{}\n", child.id()))
            .with_context(|| format!("Failed to write pid file {}", path.display()))?;
    }
    Ok(())
}

async fn run(config: ServerConfig) -> Result<()> {
    let factory = ListenerFactory::global()?;
    if !factory.inherited().is_empty() {
        info!(
            inherited = factory.inherited().count(),
            "Inherited listeners from previous generation"
        );
    }

    let listeners = Listeners::open(factory, &config.listen, &config.udp, config.unix.as_deref())
        .context("Failed to open listeners")?;
    let unclaimed = factory.close_unclaimed();
    if unclaimed > 0 {
        warn!(unclaimed, "Inherited descriptors left unclaimed");
    }
    listeners.log_summary();

    let mut trap = Trap::install().context("Failed to install signal handlers")?;
    let drain = Drain::new(config.drain_timeout());
    listeners.serve(&drain)?;

    if let Some(path) = &config.ready_file {
        write_atomic(path, &format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write ready file {}", path.display()))?;
    }
    info!("Serving");

    loop {
        match trap.next().await {
            TrapSignal::Reload => match waddle_respawn::reload(&listeners.handles()) {
                Ok(child) => info!("Reloaded {} -> {}", std::process::id(), child.id()),
                Err(e) => error!(error = %e, "Reload failed, still serving"),
            },
            TrapSignal::Terminate => break,
        }
    }

    drain.shutdown().await;
    drop(listeners);
    info!("Shutdown complete");
    Ok(())
}

/// Write through a sibling temp file so readers never see partial content.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
