//! Command-line and environment configuration.
//!
//! # Environment Variables
//!
//! - `WADDLE_RESPAWN_LISTEN`: Comma-separated TCP listen addresses. Default: `127.0.0.1:12345`
//! - `WADDLE_RESPAWN_PID_FILE`: Where `--daemon` writes the daemon's pid
//! - `WADDLE_DRAIN_TIMEOUT_SECS`: Drain timeout in seconds. Default: 30
//!
//! Listeners are always created in the same order (TCP addresses, UDP
//! addresses, then the Unix socket), which is what lets a reloaded
//! generation adopt them positionally.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgMatches, Command, CommandFactory, FromArgMatches, Parser};
use tracing::info;

/// Server configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "waddle-respawn-server",
    version,
    about = "Pid echo server with daemonize and hot reload"
)]
pub struct ServerConfig {
    /// Detach into a background daemon and exit.
    #[arg(long)]
    pub daemon: bool,

    /// TCP address to listen on (repeatable).
    #[arg(
        long = "listen",
        value_name = "ADDR",
        env = "WADDLE_RESPAWN_LISTEN",
        value_delimiter = ',',
        default_value = "127.0.0.1:12345"
    )]
    pub listen: Vec<String>,

    /// UDP address to answer datagrams on (repeatable).
    #[arg(long = "udp", value_name = "ADDR")]
    pub udp: Vec<String>,

    /// Unix-domain stream socket path.
    #[arg(long, value_name = "PATH")]
    pub unix: Option<String>,

    /// File receiving the daemon's pid (with `--daemon`).
    #[arg(long, value_name = "PATH", env = "WADDLE_RESPAWN_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    /// File receiving the daemon's standard error (with `--daemon`).
    #[arg(long, value_name = "PATH")]
    pub stderr_log: Option<PathBuf>,

    /// File receiving this generation's pid once its listeners are up.
    #[arg(long, value_name = "PATH")]
    pub ready_file: Option<PathBuf>,

    /// Seconds to wait for in-flight connections on shutdown.
    #[arg(long, env = "WADDLE_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,
}

/// Parsed configuration along with the clap state it came from, which the
/// daemon path needs to rebuild an argv.
pub struct LoadedConfig {
    pub config: ServerConfig,
    pub command: Command,
    pub matches: ArgMatches,
}

impl ServerConfig {
    /// Parse the process arguments.
    pub fn load() -> Result<LoadedConfig, clap::Error> {
        Self::load_from(std::env::args_os())
    }

    pub fn load_from<I, T>(args: I) -> Result<LoadedConfig, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let command = Self::command();
        let matches = command.clone().try_get_matches_from(args)?;
        let config = Self::from_arg_matches(&matches)?;
        Ok(LoadedConfig {
            config,
            command,
            matches,
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Log the resolved configuration.
    pub fn log_config(&self) {
        info!(
            daemon = self.daemon,
            tcp = ?self.listen,
            udp = ?self.udp,
            unix = ?self.unix,
            drain_timeout_secs = self.drain_timeout_secs,
            "Resolved configuration"
        );
    }
}
