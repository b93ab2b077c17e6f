//! Wire protocol between a Console and a Process Manager, and the
//! internal six-token grammar between a Process Manager and its
//! Supervisors.
//!
//! Every line, on either channel, is UTF-8 and `\n`-terminated. Parsing
//! accepts exactly the grammars below; anything else is a parse error
//! that callers log and skip rather than propagate as fatal.

use anyhow::{anyhow, bail, Result};

/// A command sent from the Console to a Process Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `run [-as <alias>] [-w] <argv…>`
    Run {
        alias: Option<String>,
        wait: bool,
        command_line: String,
    },
    /// `stop [<alias>]`
    Stop { alias: Option<String> },
    /// `shutdown`
    Shutdown,
}

impl Command {
    /// Renders the command as the line a Console writes to the wire.
    pub fn to_line(&self) -> String {
        match self {
            Command::Run {
                alias,
                wait,
                command_line,
            } => {
                let mut parts = vec!["run".to_string()];
                if let Some(alias) = alias {
                    parts.push("-as".to_string());
                    parts.push(alias.clone());
                }
                if *wait {
                    parts.push("-w".to_string());
                }
                parts.push(command_line.clone());
                parts.join(" ") + "\n"
            }
            Command::Stop { alias } => match alias {
                Some(alias) => format!("stop {alias}\n"),
                None => "stop\n".to_string(),
            },
            Command::Shutdown => "shutdown\n".to_string(),
        }
    }

    /// The alias a `run` command will resolve to absent an explicit `-as`.
    pub fn default_alias(command_line: &str) -> Result<String> {
        shell_words::split(command_line)
            .ok()
            .and_then(|tokens| tokens.into_iter().next())
            .ok_or_else(|| anyhow!("empty command line has no default alias"))
    }
}

/// Parses one line of Console input. `line` must not include the
/// trailing newline.
pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim_end_matches('\r');
    if line == "shutdown" {
        return Ok(Command::Shutdown);
    }
    if let Some(rest) = line.strip_prefix("stop") {
        let alias = rest.trim();
        return Ok(Command::Stop {
            alias: if alias.is_empty() {
                None
            } else {
                Some(alias.to_string())
            },
        });
    }
    if let Some(rest) = line.strip_prefix("run") {
        let mut rest = rest.trim_start();
        if rest.is_empty() {
            bail!("run command missing arguments");
        }
        let mut alias = None;
        if let Some(after) = rest.strip_prefix("-as") {
            let after = after.trim_start();
            let (token, remainder) = split_first_token(after)
                .ok_or_else(|| anyhow!("run -as missing alias"))?;
            alias = Some(token.to_string());
            rest = remainder.trim_start();
        }
        let wait = if let Some(after) = rest.strip_prefix("-w") {
            rest = after.trim_start();
            true
        } else {
            false
        };
        if rest.is_empty() {
            bail!("run command missing a command line");
        }
        return Ok(Command::Run {
            alias,
            wait,
            command_line: rest.to_string(),
        });
    }
    bail!("unrecognized command line: {line:?}")
}

/// Splits off the first whitespace-delimited token, returning it and the
/// remainder of the string.
fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// An acknowledgement sent from a Process Manager back to the Console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// `<alias> ok`
    Ok(String),
    /// `<alias> duplicated alias`
    DuplicatedAlias(String),
}

impl Ack {
    pub fn to_line(&self) -> String {
        match self {
            Ack::Ok(alias) => format!("{alias} ok\n"),
            Ack::DuplicatedAlias(alias) => format!("{alias} duplicated alias\n"),
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            Ack::Ok(alias) => alias,
            Ack::DuplicatedAlias(alias) => alias,
        }
    }
}

/// Parses one acknowledgement line from a Process Manager. `line` must
/// not include the trailing newline.
pub fn parse_ack(line: &str) -> Result<Ack> {
    let line = line.trim_end_matches('\r');
    let (alias, rest) = split_first_token(line).ok_or_else(|| anyhow!("empty ack line"))?;
    match rest.trim() {
        "ok" => Ok(Ack::Ok(alias.to_string())),
        "duplicated alias" => Ok(Ack::DuplicatedAlias(alias.to_string())),
        other => bail!("unrecognized ack line: {alias:?} {other:?}"),
    }
}

/// The six tokens exchanged between a Process Manager and a Supervisor
/// over the in-process control channel. This is an implementation
/// boundary, not a wire protocol, but its grammar is fixed so the
/// Process Manager can keep treating it as trivially line-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorToken {
    Ready,
    Launch,
    Launched,
    Died,
    Relaunch,
    Finished,
}

impl SupervisorToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorToken::Ready => "ready",
            SupervisorToken::Launch => "launch",
            SupervisorToken::Launched => "launched",
            SupervisorToken::Died => "died",
            SupervisorToken::Relaunch => "relaunch",
            SupervisorToken::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim_end_matches(['\n', '\r']) {
            "ready" => Some(SupervisorToken::Ready),
            "launch" => Some(SupervisorToken::Launch),
            "launched" => Some(SupervisorToken::Launched),
            "died" => Some(SupervisorToken::Died),
            "relaunch" => Some(SupervisorToken::Relaunch),
            "finished" => Some(SupervisorToken::Finished),
            _ => None,
        }
    }
}
