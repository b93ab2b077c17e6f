//! Command descriptors, phases and the Catalog configuration the Console
//! binary loads at startup.
//!
//! The Catalog is the console-side analogue of the teacher's
//! `SupervisorConfig`/`load_supervisor_config` (`config.rs`): a plain
//! struct built once from an operator-authored file and handed to the
//! Dispatcher at construction, rather than accumulated through top-level
//! mutable globals.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

/// Progress of one command descriptor through a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready,
    Done,
}

/// One entry in the Catalog: a single command to run on a single target
/// machine, gated to a phase.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub alias: String,
    pub command_line: String,
    pub target: SocketAddr,
    pub phase: u32,
    pub wait_for_finish: bool,
    pub state: State,
}

/// The on-disk shape of one Catalog entry, as TOML.
#[derive(Debug, Deserialize)]
struct RawEntry {
    alias: Option<String>,
    command: String,
    host: String,
    port: u16,
    #[serde(default)]
    phase: u32,
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(rename = "command")]
    commands: Vec<RawEntry>,
}

/// The full set of command descriptors for one test run, plus every
/// distinct target machine a ProxyTo must be created for.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub commands: Vec<CommandDescriptor>,
}

impl Catalog {
    /// Loads and validates a Catalog from a TOML file. A malformed file,
    /// an unresolvable host:port, or a duplicate alias on the same
    /// target machine is a fatal startup error, never a panic.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog file {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let raw: RawCatalog =
            toml::from_str(contents).context("parsing catalog TOML")?;

        let mut commands = Vec::with_capacity(raw.commands.len());
        let mut seen_aliases: HashSet<(SocketAddr, String)> = HashSet::new();

        for entry in raw.commands {
            let target: SocketAddr = format!("{}:{}", entry.host, entry.port)
                .parse()
                .with_context(|| format!("invalid target address {}:{}", entry.host, entry.port))?;

            let alias = match entry.alias {
                Some(alias) => alias,
                None => crate::proto::Command::default_alias(&entry.command)
                    .context("deriving default alias from command")?,
            };

            ensure!(
                seen_aliases.insert((target, alias.clone())),
                "duplicate alias {alias:?} on target {target}"
            );

            commands.push(CommandDescriptor {
                alias,
                command_line: entry.command,
                target,
                phase: entry.phase,
                wait_for_finish: entry.wait,
                state: State::Done,
            });
        }

        if commands.is_empty() {
            bail!("catalog has no commands");
        }

        Ok(Catalog { commands })
    }

    /// Every distinct phase present in the catalog, ascending.
    pub fn phases(&self) -> Vec<u32> {
        let mut phases: Vec<u32> = self
            .commands
            .iter()
            .map(|c| c.phase)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        phases.sort_unstable();
        phases
    }

    /// Every distinct target machine a ProxyTo must be created for.
    pub fn targets(&self) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = self
            .commands
            .iter()
            .map(|c| c.target)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        targets.sort_by_key(|a| a.to_string());
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_valid_catalog() {
        let toml = r#"
            [[command]]
            alias = "store1"
            command = "mongod --dbpath /data/store1"
            host = "10.0.0.1"
            port = 2900
            phase = 0

            [[command]]
            command = "/bin/true"
            host = "10.0.0.2"
            port = 2900
            phase = 1
            wait = true
        "#;
        let catalog = Catalog::parse(toml).unwrap();
        assert_eq!(catalog.commands.len(), 2);
        assert_eq!(catalog.phases(), vec![0, 1]);
        assert_eq!(catalog.targets().len(), 2);
        assert_eq!(catalog.commands[1].alias, "true");
        assert!(catalog.commands[1].wait_for_finish);
    }

    #[test]
    fn rejects_duplicate_alias_on_same_target() {
        let toml = r#"
            [[command]]
            alias = "x"
            command = "/bin/true"
            host = "10.0.0.1"
            port = 2900

            [[command]]
            alias = "x"
            command = "/bin/false"
            host = "10.0.0.1"
            port = 2900
        "#;
        assert!(Catalog::parse(toml).is_err());
    }

    #[test]
    fn allows_same_alias_on_different_targets() {
        let toml = r#"
            [[command]]
            alias = "x"
            command = "/bin/true"
            host = "10.0.0.1"
            port = 2900

            [[command]]
            alias = "x"
            command = "/bin/true"
            host = "10.0.0.2"
            port = 2900
        "#;
        assert!(Catalog::parse(toml).is_ok());
    }

    #[test]
    fn rejects_empty_catalog() {
        assert!(Catalog::parse("").is_err());
    }

    #[test]
    fn rejects_missing_field() {
        let toml = r#"
            [[command]]
            command = "/bin/true"
            host = "10.0.0.1"
        "#;
        assert!(Catalog::parse(toml).is_err());
    }
}
