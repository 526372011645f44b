//! Process spawning shared by daemonization and hot respawn.
//!
//! Both entry points go through one launch path:
//!
//! 1. Resolve the executable to an absolute, canonical path
//! 2. Duplicate every inherited handle above the target block (close-on-exec)
//! 3. Build the standard-stream table and the environment markers
//! 4. In the child, between fork and exec, `dup2` the duplicates onto
//!    fd 3..3+N (this clears close-on-exec on the targets only)
//! 5. Return as soon as the child exists, without waiting on it
//!
//! Every fallible step runs before the child is created and only touches
//! descriptors owned by the spawner, so a failure leaves the caller's
//! listeners exactly as they were.
//!
//! Daemonized processes are fire-and-forget: nothing here reaps them or
//! restarts them on crash. Supervision belongs to an external supervisor.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;

use tracing::{debug, info};

use crate::error::{RespawnError, Result};
use crate::fd;
use crate::inherit::{InheritedFds, FD_COUNT_ENV, FD_PID_ENV, FD_START_ENV, FIRST_INHERITED_FD};
use crate::listener::Inheritable;

static CURRENT_EXE: OnceLock<PathBuf> = OnceLock::new();

/// Where a child's standard stream goes.
#[derive(Debug)]
pub enum Redirect {
    /// Share the caller's stream.
    Inherit,
    /// Any already-open descriptor (file, pipe, socket).
    Fd(OwnedFd),
}

impl Redirect {
    /// Redirect to a duplicate of `fd`, leaving `fd` with the caller.
    pub fn to(fd: impl AsFd) -> io::Result<Self> {
        Ok(Redirect::Fd(fd.as_fd().try_clone_to_owned()?))
    }
}

impl From<File> for Redirect {
    fn from(file: File) -> Self {
        Redirect::Fd(file.into())
    }
}

impl From<OwnedFd> for Redirect {
    fn from(fd: OwnedFd) -> Self {
        Redirect::Fd(fd)
    }
}

/// Standard streams, working directory and environment of a spawned process.
///
/// Unset streams mean an empty standard input and discarded output.
#[derive(Debug, Default)]
pub struct SpawnOption {
    stdin: Option<Redirect>,
    stdout: Option<Redirect>,
    stderr: Option<Redirect>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl SpawnOption {
    /// Empty stdin, discarded stdout and stderr.
    pub fn new() -> Self {
        Self::default()
    }

    /// All three standard streams shared with the caller.
    pub fn inherit() -> Self {
        Self {
            stdin: Some(Redirect::Inherit),
            stdout: Some(Redirect::Inherit),
            stderr: Some(Redirect::Inherit),
            ..Self::default()
        }
    }

    pub fn stdin(mut self, source: impl Into<Redirect>) -> Self {
        self.stdin = Some(source.into());
        self
    }

    pub fn stdout(mut self, sink: impl Into<Redirect>) -> Self {
        self.stdout = Some(sink.into());
        self
    }

    pub fn stderr(mut self, sink: impl Into<Redirect>) -> Self {
        self.stderr = Some(sink.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add or replace one environment variable of the child.
    ///
    /// The inheritance markers are always set by the spawner and win over
    /// overrides of the same name.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

fn stdio(slot: &Option<Redirect>, name: &str) -> Result<Stdio> {
    match slot {
        None => Ok(Stdio::null()),
        Some(Redirect::Inherit) => Ok(Stdio::inherit()),
        Some(Redirect::Fd(fd)) => fd
            .try_clone()
            .map(Stdio::from)
            .map_err(|e| RespawnError::spawn(format!("duplicate {}", name), e)),
    }
}

/// Absolute, canonical path of the running binary, resolved once.
///
/// Resolve it early (the global listener factory does) so a respawn still
/// finds the binary after the file on disk has been replaced.
pub fn current_executable() -> Result<&'static Path> {
    if let Some(exe) = CURRENT_EXE.get() {
        return Ok(exe.as_path());
    }
    let exe = std::env::current_exe()
        .and_then(|path| path.canonicalize())
        .map_err(|e| RespawnError::spawn("resolve current executable", e))?;
    Ok(CURRENT_EXE.get_or_init(|| exe).as_path())
}

/// Resolve `program` to an absolute, canonical path of an executable file.
/// Bare names are looked up on `PATH`.
pub fn resolve_executable(program: &Path) -> Result<PathBuf> {
    let is_bare = !program.is_absolute()
        && program
            .parent()
            .map_or(true, |parent| parent.as_os_str().is_empty());

    let candidate = if is_bare {
        which::which(program).map_err(|e| {
            RespawnError::spawn(
                format!("look up {}", program.display()),
                io::Error::new(io::ErrorKind::NotFound, e),
            )
        })?
    } else {
        program.to_path_buf()
    };

    let resolved = candidate
        .canonicalize()
        .map_err(|e| RespawnError::spawn(format!("resolve {}", program.display()), e))?;

    let metadata = std::fs::metadata(&resolved)
        .map_err(|e| RespawnError::spawn(format!("stat {}", resolved.display()), e))?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(RespawnError::spawn(
            format!("{} is not an executable file", resolved.display()),
            io::Error::from(io::ErrorKind::PermissionDenied),
        ));
    }
    Ok(resolved)
}

/// Duplicates handed to one child, parked above the target block, plus
/// placeholders holding the free slots of the target block until spawn.
struct ExtraFds {
    fds: Vec<OwnedFd>,
    reserved: Vec<OwnedFd>,
}

impl ExtraFds {
    fn collect(handles: &[&dyn Inheritable]) -> Result<Self> {
        // Sources above 3+N can never be clobbered while placing targets.
        let floor = FIRST_INHERITED_FD + handles.len() as RawFd;
        let mut fds = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            let dup = handle
                .duplicate_fd()
                .and_then(|dup| fd::dup_above(dup.as_fd(), floor))
                .map_err(|e| RespawnError::spawn(format!("duplicate handle #{}", index), e))?;
            fds.push(dup);
        }
        let reserved = reserve_block(fds.len())
            .map_err(|e| RespawnError::spawn("reserve inherited descriptor block", e))?;
        Ok(Self { fds, reserved })
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    fn raw(&self) -> Vec<RawFd> {
        self.fds.iter().map(AsRawFd::as_raw_fd).collect()
    }
}

/// Fill every free descriptor in 3..3+`count` with a close-on-exec
/// placeholder.
///
/// `Command::spawn` reports exec failures through a close-on-exec pipe it
/// opens on the lowest free descriptors. Placement `dup2`s over 3..3+N in
/// the child, so the pipe must not live there or a failed exec would look
/// like a successful spawn.
fn reserve_block(count: usize) -> io::Result<Vec<OwnedFd>> {
    let mut reserved = Vec::new();
    if count == 0 {
        return Ok(reserved);
    }
    let placeholder = OwnedFd::from(File::open("/dev/null")?);
    for index in 0..count {
        let slot = FIRST_INHERITED_FD + index as RawFd;
        if let Some(fd) = fd::fill_slot(placeholder.as_fd(), slot)? {
            reserved.push(fd);
        }
    }
    // It may itself have landed inside the block.
    reserved.push(placeholder);
    Ok(reserved)
}

/// Runs in the child between fork and exec: async-signal-safe calls only.
fn place_inherited(sources: &[RawFd]) -> io::Result<()> {
    for (index, source) in sources.iter().enumerate() {
        let target = FIRST_INHERITED_FD + index as RawFd;
        if unsafe { libc::dup2(*source, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The one launch path behind [`daemonize`] and [`reload_with`].
pub(crate) fn launch<I, S>(
    exe: &Path,
    args: I,
    option: &SpawnOption,
    handles: &[&dyn Inheritable],
    detach: bool,
) -> Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let extra = ExtraFds::collect(handles)?;

    let mut command = Command::new(exe);
    command
        .args(args)
        .stdin(stdio(&option.stdin, "stdin")?)
        .stdout(stdio(&option.stdout, "stdout")?)
        .stderr(stdio(&option.stderr, "stderr")?);

    if let Some(dir) = &option.current_dir {
        command.current_dir(dir);
    }
    for (key, value) in &option.envs {
        command.env(key, value);
    }

    // Placement addresses the markers to whoever execs; a stale systemd pid
    // would make the child ignore them.
    command.env_remove(FD_PID_ENV);
    if extra.is_empty() {
        command.env_remove(FD_START_ENV).env_remove(FD_COUNT_ENV);
    } else {
        for (key, value) in InheritedFds::markers_for(extra.len()) {
            command.env(key, value);
        }
    }

    let sources = extra.raw();
    // SAFETY: the hook only calls setsid and dup2, both async-signal-safe,
    // and reads a vector allocated before fork.
    unsafe {
        command.pre_exec(move || {
            if detach && libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            place_inherited(&sources)
        });
    }

    let child = command
        .spawn()
        .map_err(|e| RespawnError::spawn(format!("spawn {}", exe.display()), e))?;

    for handle in handles {
        handle.handed_over();
    }

    info!(
        pid = child.id(),
        exe = %exe.display(),
        inherited = extra.len(),
        detached = detach,
        reserved_slots = extra.reserved.len(),
        "Spawned process"
    );
    // `extra` drops here, closing the parked duplicates and placeholders.
    Ok(child)
}

/// Start `executable` as a daemon in a new session, detached from the
/// caller's controlling terminal.
///
/// Returns as soon as the process exists. The returned [`Child`] is only a
/// record: the caller may drop it and exit, nothing supervises the daemon.
pub fn daemonize<I, S>(
    executable: impl AsRef<Path>,
    option: &SpawnOption,
    args: I,
) -> Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let exe = resolve_executable(executable.as_ref())?;
    debug!(exe = %exe.display(), "Daemonizing");
    launch(&exe, args, option, &[], true)
}

/// Respawn the running binary with the current arguments and standard
/// streams, passing `handles` to the new generation in order.
///
/// See [`reload_with`].
pub fn reload(handles: &[&dyn Inheritable]) -> Result<Child> {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    reload_with(args, &SpawnOption::inherit(), handles)
}

/// Respawn the running binary with `args`, passing `handles` to the new
/// generation as fd 3, 4, ... in the order given.
///
/// The caller's handles stay open and usable: both generations accept on
/// the shared sockets until the caller closes its own. There is no
/// readiness handshake; deciding when to close the old handles is up to
/// the caller.
pub fn reload_with<I, S>(
    args: I,
    option: &SpawnOption,
    handles: &[&dyn Inheritable],
) -> Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let exe = current_executable()?;
    info!(
        exe = %exe.display(),
        handle_count = handles.len(),
        "Reloading into new generation"
    );
    launch(exe, args, option, handles, false)
}
