//! # waddle-respawn
//!
//! Daemonization and hot respawn for Waddle servers, with listening sockets
//! handed from one process generation to the next.
//!
//! ## Overview
//!
//! A hot respawn keeps the listen address bound the whole time:
//! 1. A generation creates its listeners through a [`ListenerFactory`]
//! 2. On a reload trigger it calls [`reload`] with its live handles
//! 3. The new generation starts with duplicates of those sockets at fd 3..N
//! 4. Its own startup calls the factory in the same order and adopts them
//! 5. Both generations accept on the shared sockets until the old one closes
//!    its handles
//!
//! Adoption is positional: the n-th factory call of the new generation gets
//! the n-th descriptor passed to [`reload`]. The order of factory calls must
//! not change between generations.
//!
//! [`daemonize`] uses the same launch path to start a detached background
//! process. Nothing supervises it afterwards.
//!
//! [`get_args`] rebuilds an argv from the current flags, typically to drop
//! the flag that requested daemonization.
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS_START`: First inherited descriptor (default 3)
//! - `LISTEN_FDS`: Number of inherited descriptors
//! - `LISTEN_PID`: Optional pid the markers are addressed to (systemd)
//!
//! Signal handling is left to the caller: a reload signal handler calls
//! [`reload`], a terminate handler closes the handles and exits.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("waddle-respawn requires a Unix platform (Linux or macOS)");

mod args;
mod error;
mod factory;
mod fd;
mod inherit;
mod listener;
mod spawn;

pub use args::{get_args, ClapFlags, Flag, FlagList, FlagSource};
pub use error::{RespawnError, Result};
pub use factory::ListenerFactory;
pub use inherit::{InheritedFds, FD_COUNT_ENV, FD_PID_ENV, FD_START_ENV, FIRST_INHERITED_FD};
pub use listener::{Inheritable, ListenAddr, Listener, Network, Origin, PacketConn};
pub use spawn::{
    current_executable, daemonize, reload, reload_with, resolve_executable, Redirect, SpawnOption,
};

/// Create a stream listener through the process-wide factory.
///
/// Adopts the next inherited descriptor if one is left, binds fresh otherwise.
pub fn listen(network: &str, address: &str) -> Result<Listener> {
    ListenerFactory::global()?.listen(network, address)
}

/// Create a datagram socket through the process-wide factory.
pub fn listen_packet(network: &str, address: &str) -> Result<PacketConn> {
    ListenerFactory::global()?.listen_packet(network, address)
}
