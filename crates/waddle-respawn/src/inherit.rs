//! Inheritance markers carried across the exec boundary.
//!
//! A generation started by [`reload`](crate::reload) finds its listening
//! sockets as a contiguous block of descriptors right after the standard
//! streams. Two environment variables describe the block:
//!
//! - `LISTEN_FDS_START`: first inherited descriptor (default 3)
//! - `LISTEN_FDS`: number of inherited descriptors
//!
//! `LISTEN_FDS` alone is the systemd socket-activation convention, so a first
//! generation started by systemd adopts its sockets the same way. As with
//! systemd, a `LISTEN_PID` naming another process means the markers were
//! meant for someone else and are ignored.
//!
//! The process-wide factory removes all three variables once it has read
//! them, so helpers started later with a plain `std::process::Command` do
//! not see a count for descriptors they never received.

use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::error::{RespawnError, Result};

/// Environment marker holding the first inherited descriptor.
pub const FD_START_ENV: &str = "LISTEN_FDS_START";

/// Environment marker holding the number of inherited descriptors.
pub const FD_COUNT_ENV: &str = "LISTEN_FDS";

/// Environment marker naming the process the markers are addressed to.
pub const FD_PID_ENV: &str = "LISTEN_PID";

/// First descriptor after stdin, stdout and stderr.
pub const FIRST_INHERITED_FD: RawFd = 3;

/// Positional description of the descriptors inherited by this generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedFds {
    start: RawFd,
    count: usize,
}

impl Default for InheritedFds {
    fn default() -> Self {
        Self::none()
    }
}

impl InheritedFds {
    /// No inherited descriptors: every listener is bound fresh.
    pub const fn none() -> Self {
        Self {
            start: FIRST_INHERITED_FD,
            count: 0,
        }
    }

    /// Describe `count` inherited descriptors starting at `start`.
    pub fn new(start: RawFd, count: usize) -> Result<Self> {
        if start < FIRST_INHERITED_FD {
            return Err(RespawnError::Descriptor(format!(
                "first inherited descriptor {} overlaps the standard streams",
                start
            )));
        }
        let last = i64::from(start) + count as i64;
        if last > i64::from(RawFd::MAX) {
            return Err(RespawnError::Descriptor(format!(
                "descriptor block {}+{} is out of range",
                start, count
            )));
        }
        Ok(Self { start, count })
    }

    /// Read the markers from the process environment.
    ///
    /// Markers addressed to another pid through `LISTEN_PID` describe
    /// nothing inherited by this process.
    pub fn from_env() -> Result<Self> {
        let listen_pid = std::env::var(FD_PID_ENV).ok();
        if !addressed_to(listen_pid.as_deref(), std::process::id())? {
            debug!(
                listen_pid = listen_pid.as_deref().unwrap_or_default(),
                "Inheritance markers belong to another process"
            );
            return Ok(Self::none());
        }
        let start = std::env::var(FD_START_ENV).ok();
        let count = std::env::var(FD_COUNT_ENV).ok();
        Self::from_vars(start.as_deref(), count.as_deref())
    }

    /// Remove every marker from the process environment.
    pub(crate) fn clear_env() {
        std::env::remove_var(FD_START_ENV);
        std::env::remove_var(FD_COUNT_ENV);
        std::env::remove_var(FD_PID_ENV);
    }

    /// Parse marker values. An absent or empty count means nothing was
    /// inherited, whatever the start marker says.
    pub fn from_vars(start: Option<&str>, count: Option<&str>) -> Result<Self> {
        let count = match count.map(str::trim) {
            None | Some("") => return Ok(Self::none()),
            Some(raw) => raw.parse::<usize>().map_err(|e| {
                warn!(value = raw, "Malformed {} marker", FD_COUNT_ENV);
                RespawnError::Descriptor(format!("{}={:?}: {}", FD_COUNT_ENV, raw, e))
            })?,
        };

        let start = match start.map(str::trim) {
            None | Some("") => FIRST_INHERITED_FD,
            Some(raw) => raw.parse::<RawFd>().map_err(|e| {
                warn!(value = raw, "Malformed {} marker", FD_START_ENV);
                RespawnError::Descriptor(format!("{}={:?}: {}", FD_START_ENV, raw, e))
            })?,
        };

        Self::new(start, count)
    }

    /// First inherited descriptor.
    pub fn start(&self) -> RawFd {
        self.start
    }

    /// Number of inherited descriptors.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Descriptor at position `index` of the block, if inherited.
    pub fn fd(&self, index: usize) -> Option<RawFd> {
        (index < self.count).then(|| self.start + index as RawFd)
    }

    /// Marker values for a child that receives `count` descriptors placed
    /// right after the standard streams.
    pub(crate) fn markers_for(count: usize) -> [(&'static str, String); 2] {
        [
            (FD_START_ENV, FIRST_INHERITED_FD.to_string()),
            (FD_COUNT_ENV, count.to_string()),
        ]
    }
}

/// Whether markers carrying `listen_pid` are meant for process `pid`.
/// An absent or empty `LISTEN_PID` addresses whoever reads the markers.
fn addressed_to(listen_pid: Option<&str>, pid: u32) -> Result<bool> {
    match listen_pid.map(str::trim) {
        None | Some("") => Ok(true),
        Some(raw) => raw
            .parse::<u32>()
            .map(|target| target == pid)
            .map_err(|e| RespawnError::Descriptor(format!("{}={:?}: {}", FD_PID_ENV, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_markers_mean_cold_start() {
        let fds = InheritedFds::from_vars(None, None).unwrap();
        assert!(fds.is_empty());
        assert_eq!(fds.fd(0), None);

        let fds = InheritedFds::from_vars(Some("7"), None).unwrap();
        assert!(fds.is_empty());

        let fds = InheritedFds::from_vars(None, Some("")).unwrap();
        assert!(fds.is_empty());
    }

    #[test]
    fn test_count_only_starts_after_stdio() {
        let fds = InheritedFds::from_vars(None, Some("2")).unwrap();
        assert_eq!(fds.start(), 3);
        assert_eq!(fds.count(), 2);
        assert_eq!(fds.fd(0), Some(3));
        assert_eq!(fds.fd(1), Some(4));
        assert_eq!(fds.fd(2), None);
    }

    #[test]
    fn test_explicit_start() {
        let fds = InheritedFds::from_vars(Some("10"), Some("3")).unwrap();
        assert_eq!(fds.fd(0), Some(10));
        assert_eq!(fds.fd(2), Some(12));
    }

    #[test]
    fn test_malformed_markers_are_descriptor_errors() {
        assert!(matches!(
            InheritedFds::from_vars(None, Some("two")),
            Err(RespawnError::Descriptor(_))
        ));
        assert!(matches!(
            InheritedFds::from_vars(Some("x"), Some("1")),
            Err(RespawnError::Descriptor(_))
        ));
        assert!(matches!(
            InheritedFds::from_vars(Some("1"), Some("1")),
            Err(RespawnError::Descriptor(_))
        ));
        assert!(matches!(
            InheritedFds::from_vars(Some("3"), Some("-1")),
            Err(RespawnError::Descriptor(_))
        ));
    }

    #[test]
    fn test_listen_pid_selects_the_reader() {
        assert!(addressed_to(None, 42).unwrap());
        assert!(addressed_to(Some(""), 42).unwrap());
        assert!(addressed_to(Some("42"), 42).unwrap());
        // A helper that inherited its parent's environment must not adopt.
        assert!(!addressed_to(Some("41"), 42).unwrap());
        assert!(matches!(
            addressed_to(Some("self"), 42),
            Err(RespawnError::Descriptor(_))
        ));
    }

    #[test]
    fn test_markers_for_child() {
        let markers = InheritedFds::markers_for(4);
        assert_eq!(markers[0], (FD_START_ENV, "3".to_string()));
        assert_eq!(markers[1], (FD_COUNT_ENV, "4".to_string()));
    }
}
