//! Argument vector reconstruction for self-respawn.
//!
//! [`get_args`] turns the flags of the current run back into an argv, so a
//! daemonized or reloaded child sees the same configuration. The usual use
//! is to suppress the flag that triggered daemonization, so the child runs
//! in the foreground for its own generation.

use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, Command};

use crate::error::{RespawnError, Result};

/// One flag set for the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub name: String,
    /// `None` for switches that take no value.
    pub value: Option<String>,
}

impl Flag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn switch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    fn render(&self, prefix: &str) -> Result<String> {
        if self.name.is_empty() {
            return Err(RespawnError::Argument {
                name: self.name.clone(),
                reason: "empty flag name".to_string(),
            });
        }
        Ok(match &self.value {
            Some(value) => format!("{}{}={}", prefix, self.name, value),
            None => format!("{}{}", prefix, self.name),
        })
    }
}

/// Enumerates the flags and positional arguments of the current run.
pub trait FlagSource {
    /// Flags explicitly set for this run. Defaults are not included.
    fn set_flags(&self) -> Result<Vec<Flag>>;

    /// Positional arguments in their original order.
    fn positionals(&self) -> Vec<String>;

    /// Written before each flag name.
    fn prefix(&self) -> &str {
        "-"
    }
}

/// Rebuild an argv from `source`.
///
/// Flags come first, sorted by name (repeated flags keep their relative
/// order), each as one `-name=value` token unless `filter(name)` is true.
/// Positional arguments follow in their original order, then `extra`
/// verbatim. A filter that never matches reproduces every set flag.
pub fn get_args<F, E, S>(
    source: &(impl FlagSource + ?Sized),
    extra: E,
    filter: F,
) -> Result<Vec<String>>
where
    F: Fn(&str) -> bool,
    E: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut flags = source.set_flags()?;
    flags.sort_by(|a, b| a.name.cmp(&b.name));

    let prefix = source.prefix();
    let mut args = Vec::with_capacity(flags.len());
    for flag in flags.iter().filter(|flag| !filter(&flag.name)) {
        args.push(flag.render(prefix)?);
    }
    args.extend(source.positionals());
    args.extend(extra.into_iter().map(Into::into));
    Ok(args)
}

/// An explicit list of flags and positionals.
#[derive(Debug, Clone)]
pub struct FlagList {
    flags: Vec<Flag>,
    positionals: Vec<String>,
    prefix: String,
}

impl Default for FlagList {
    fn default() -> Self {
        Self {
            flags: Vec::new(),
            positionals: Vec::new(),
            prefix: "-".to_string(),
        }
    }
}

impl FlagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.push(Flag::new(name, value));
        self
    }

    pub fn switch(mut self, name: impl Into<String>) -> Self {
        self.flags.push(Flag::switch(name));
        self
    }

    pub fn positional(mut self, arg: impl Into<String>) -> Self {
        self.positionals.push(arg.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl FlagSource for FlagList {
    fn set_flags(&self) -> Result<Vec<Flag>> {
        Ok(self.flags.clone())
    }

    fn positionals(&self) -> Vec<String> {
        self.positionals.clone()
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Flags parsed by clap, rendered as `--long=value`.
///
/// Only values given on the command line are reproduced; defaults and
/// environment fallbacks re-derive themselves in the child. Boolean
/// switches render bare (`--daemon`), counted switches repeat, and
/// repeated options give one token per value. Options without a long name
/// cannot be rendered.
#[derive(Debug, Clone, Copy)]
pub struct ClapFlags<'a> {
    command: &'a Command,
    matches: &'a ArgMatches,
}

impl<'a> ClapFlags<'a> {
    pub fn new(command: &'a Command, matches: &'a ArgMatches) -> Self {
        Self { command, matches }
    }

    fn from_command_line(&self, id: &str) -> bool {
        self.matches.value_source(id) == Some(ValueSource::CommandLine)
    }

    fn raw_values(&self, id: &str) -> Result<Vec<String>> {
        let raw = self
            .matches
            .try_get_raw(id)
            .map_err(|e| RespawnError::Argument {
                name: id.to_string(),
                reason: e.to_string(),
            })?;
        raw.into_iter()
            .flatten()
            .map(|value| {
                value
                    .to_str()
                    .map(str::to_string)
                    .ok_or_else(|| RespawnError::Argument {
                        name: id.to_string(),
                        reason: "value is not valid UTF-8".to_string(),
                    })
            })
            .collect()
    }
}

impl FlagSource for ClapFlags<'_> {
    fn set_flags(&self) -> Result<Vec<Flag>> {
        let mut flags = Vec::new();
        for arg in self.command.get_arguments() {
            let id = arg.get_id().as_str();
            if arg.is_positional() || !self.from_command_line(id) {
                continue;
            }

            let render_name = || {
                arg.get_long()
                    .map(str::to_string)
                    .ok_or_else(|| RespawnError::Argument {
                        name: id.to_string(),
                        reason: "no long name to render".to_string(),
                    })
            };

            match arg.get_action() {
                ArgAction::SetTrue | ArgAction::SetFalse => {
                    flags.push(Flag::switch(render_name()?));
                }
                ArgAction::Count => {
                    let name = render_name()?;
                    let count = self.matches.get_count(id);
                    flags.extend((0..count).map(|_| Flag::switch(name.clone())));
                }
                ArgAction::Set | ArgAction::Append => {
                    let name = render_name()?;
                    let values = self.raw_values(id)?;
                    if values.is_empty() {
                        return Err(RespawnError::Argument {
                            name: id.to_string(),
                            reason: "set without a value".to_string(),
                        });
                    }
                    flags.extend(values.into_iter().map(|v| Flag::new(name.clone(), v)));
                }
                _ => {}
            }
        }
        Ok(flags)
    }

    fn positionals(&self) -> Vec<String> {
        let mut positional: Vec<_> = self
            .command
            .get_arguments()
            .filter(|arg| arg.is_positional())
            .collect();
        positional.sort_by_key(|arg| arg.get_index());

        positional
            .into_iter()
            .filter(|arg| self.from_command_line(arg.get_id().as_str()))
            .flat_map(|arg| {
                self.matches
                    .get_raw(arg.get_id().as_str())
                    .into_iter()
                    .flatten()
                    .map(|value| value.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn prefix(&self) -> &str {
        "--"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Arg;

    fn server_command() -> Command {
        Command::new("srv")
            .arg(Arg::new("daemon").long("daemon").action(ArgAction::SetTrue))
            .arg(Arg::new("listen").long("listen").action(ArgAction::Append))
            .arg(Arg::new("level").long("level").default_value("info"))
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::Count),
            )
            .arg(Arg::new("files").num_args(0..).action(ArgAction::Append))
    }

    #[test]
    fn test_filter_suppresses_daemon_only() {
        let source = FlagList::new()
            .flag("daemon", "true")
            .flag("listen", "127.0.0.1:12345")
            .flag("config", "/etc/waddle.toml")
            .positional("first")
            .positional("second");

        let args = get_args(&source, ["--", "extra"], |name| name == "daemon").unwrap();
        assert_eq!(
            args,
            vec![
                "-config=/etc/waddle.toml",
                "-listen=127.0.0.1:12345",
                "first",
                "second",
                "--",
                "extra",
            ]
        );
    }

    #[test]
    fn test_never_matching_filter_keeps_everything() {
        let source = FlagList::new()
            .flag("listen", "a")
            .switch("daemon")
            .flag("listen", "b")
            .positional("p");

        let args = get_args(&source, Vec::<String>::new(), |_| false).unwrap();
        assert_eq!(args, vec!["-daemon", "-listen=a", "-listen=b", "p"]);
    }

    #[test]
    fn test_empty_name_is_argument_error() {
        let source = FlagList::new().flag("", "x");
        assert!(matches!(
            get_args(&source, Vec::<String>::new(), |_| false),
            Err(RespawnError::Argument { .. })
        ));
        // A suppressed flag is never rendered.
        assert!(get_args(&source, Vec::<String>::new(), |name| name.is_empty()).is_ok());
    }

    #[test]
    fn test_custom_prefix() {
        let source = FlagList::new().with_prefix("--").flag("port", "80");
        let args = get_args(&source, ["tail"], |_| false).unwrap();
        assert_eq!(args, vec!["--port=80", "tail"]);
    }

    #[test]
    fn test_clap_flags_round_trip() {
        let command = server_command();
        let matches = command
            .clone()
            .try_get_matches_from([
                "srv",
                "--listen",
                "127.0.0.1:1",
                "--daemon",
                "--listen=127.0.0.1:2",
                "-vv",
                "x.txt",
                "y.txt",
            ])
            .unwrap();
        let source = ClapFlags::new(&command, &matches);

        let args = get_args(&source, Vec::<String>::new(), |name| name == "daemon").unwrap();
        assert_eq!(
            args,
            vec![
                "--listen=127.0.0.1:1",
                "--listen=127.0.0.1:2",
                "--verbose",
                "--verbose",
                "x.txt",
                "y.txt",
            ]
        );

        let reparsed = server_command()
            .try_get_matches_from(std::iter::once("srv".to_string()).chain(args))
            .unwrap();
        assert!(!reparsed.get_flag("daemon"));
        assert_eq!(reparsed.get_count("verbose"), 2);
        let listen: Vec<&String> = reparsed.get_many("listen").unwrap().collect();
        assert_eq!(listen, vec!["127.0.0.1:1", "127.0.0.1:2"]);

        let full = get_args(&source, Vec::<String>::new(), |_| false).unwrap();
        assert_eq!(full[0], "--daemon");
        assert_eq!(full.len(), 7);
    }

    #[test]
    fn test_clap_defaults_are_not_reproduced() {
        let command = server_command();
        let matches = command.clone().try_get_matches_from(["srv"]).unwrap();
        let source = ClapFlags::new(&command, &matches);
        let args = get_args(&source, ["tail"], |_| false).unwrap();
        assert_eq!(args, vec!["tail"]);
    }

    #[test]
    fn test_clap_short_only_option_is_argument_error() {
        let command = Command::new("srv").arg(Arg::new("output").short('o'));
        let matches = command
            .clone()
            .try_get_matches_from(["srv", "-o", "file"])
            .unwrap();
        let source = ClapFlags::new(&command, &matches);
        assert!(matches!(
            get_args(&source, Vec::<String>::new(), |_| false),
            Err(RespawnError::Argument { .. })
        ));
    }
}
