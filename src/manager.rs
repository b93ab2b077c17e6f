//! The Process Manager: accepts one Console connection at a time, owns a
//! keyed collection of Supervisors, and multiplexes their control
//! channels with the Console socket through a single readiness loop.
//!
//! Where the original tool polls a `select()` list of raw file
//! descriptors with a 1s timeout purely so it can notice its own
//! shutdown flag, `tokio::select!` wakes on whichever branch becomes
//! ready with no polling interval needed: the `shutdown` command is
//! itself one of the events the loop reacts to, so no separate timeout
//! is required to observe it promptly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;

use crate::proto::{self, Ack, Command, SupervisorToken};
use crate::supervisor::{Interest, SupervisorHandle};

struct ConsoleConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl ConsoleConn {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (read_half, writer) = stream.into_split();
        ConsoleConn {
            lines: BufReader::new(read_half).lines(),
            writer,
            peer,
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await
    }
}

/// Agent running on a remote machine, accepting commands from a Console
/// over TCP and supervising the processes it is told to run.
pub struct ProcessManager {
    listener: TcpListener,
    cwd: PathBuf,
    supervisors: HashMap<String, SupervisorHandle>,
    /// Supervisors that were told to stop but not yet reaped; reaping is
    /// deferred to shutdown, matching the spec's "stopped Supervisors'
    /// tasks are reaped at shutdown" contract.
    stopped: Vec<SupervisorHandle>,
    console: Option<ConsoleConn>,
    tokens_tx: mpsc::UnboundedSender<(String, SupervisorToken)>,
    tokens_rx: mpsc::UnboundedReceiver<(String, SupervisorToken)>,
    done: bool,
}

impl ProcessManager {
    /// Binds the listening port with address-reuse enabled and a backlog
    /// of at least 5, per the listener contract.
    pub async fn bind(port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .expect("well-formed bind address");
        let socket = TcpSocket::new_v4().context("creating listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("setting SO_REUSEADDR")?;
        socket.bind(addr).with_context(|| format!("binding to {addr}"))?;
        let listener = socket.listen(16).context("listening")?;
        let (tokens_tx, tokens_rx) = mpsc::unbounded_channel();
        let cwd = std::env::current_dir().context("getting current directory")?;

        Ok(ProcessManager {
            listener,
            cwd,
            supervisors: HashMap::new(),
            stopped: Vec::new(),
            console: None,
            tokens_tx,
            tokens_rx,
            done: false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the readiness loop until a `shutdown` command is processed.
    /// On return, every Supervisor task has been reaped, the Console
    /// socket has been closed (if connected), and the listener is about
    /// to be dropped.
    pub async fn run(mut self) -> Result<()> {
        log::info!("process manager listening on {}", self.local_addr()?);

        while !self.done {
            tokio::select! {
                accept = self.listener.accept() => {
                    self.handle_accept(accept);
                }

                Some((alias, token)) = self.tokens_rx.recv() => {
                    self.handle_supervisor_token(alias, token).await;
                }

                line = Self::next_console_line(&mut self.console) => {
                    self.handle_console_line(line).await;
                }
            }
        }

        log::info!("shutting down: reaping supervisor tasks");
        for (_, sup) in self.supervisors.drain() {
            self.stopped.push(sup);
        }
        for sup in self.stopped.drain(..) {
            sup.join().await;
        }
        self.console = None;
        Ok(())
    }

    async fn next_console_line(console: &mut Option<ConsoleConn>) -> std::io::Result<Option<String>> {
        match console {
            Some(conn) => conn.lines.next_line().await,
            None => std::future::pending().await,
        }
    }

    fn handle_accept(&mut self, accept: std::io::Result<(TcpStream, SocketAddr)>) {
        match accept {
            Ok((stream, peer)) => {
                if self.console.is_some() {
                    log::warn!("rejecting second console connection from {peer}");
                    drop(stream);
                } else {
                    log::info!("console connected from {peer}");
                    self.console = Some(ConsoleConn::new(stream, peer));
                }
            }
            Err(e) => log::error!("accept failed: {e:#}"),
        }
    }

    async fn handle_console_line(&mut self, line: std::io::Result<Option<String>>) {
        match line {
            Ok(Some(text)) => match proto::parse_command(&text) {
                Ok(Command::Run {
                    alias,
                    wait,
                    command_line,
                }) => self.handle_run(alias, wait, command_line).await,
                Ok(Command::Stop { alias }) => self.handle_stop(alias).await,
                Ok(Command::Shutdown) => self.handle_shutdown().await,
                Err(e) => log::warn!("malformed console command {text:?}: {e:#}"),
            },
            Ok(None) => {
                let peer = self.console.as_ref().map(|c| c.peer);
                log::info!("console disconnected (EOF) from {peer:?}");
                self.console = None;
            }
            Err(e) => {
                log::error!("console socket error: {e:#}");
                self.console = None;
            }
        }
    }

    async fn handle_run(&mut self, alias: Option<String>, wait: bool, command_line: String) {
        let alias = match alias {
            Some(alias) => alias,
            None => match Command::default_alias(&command_line) {
                Ok(alias) => alias,
                Err(e) => {
                    log::warn!("cannot derive default alias from {command_line:?}: {e:#}");
                    return;
                }
            },
        };

        if self.supervisors.contains_key(&alias) {
            self.send_ack(Ack::DuplicatedAlias(alias)).await;
            return;
        }

        let interest = if wait {
            Interest::Finished
        } else {
            Interest::Launched
        };
        let handle = SupervisorHandle::spawn(
            alias.clone(),
            command_line,
            self.cwd.clone(),
            interest,
            self.tokens_tx.clone(),
        );
        self.supervisors.insert(alias, handle);
    }

    async fn handle_stop(&mut self, alias: Option<String>) {
        let aliases: Vec<String> = match alias {
            Some(alias) => vec![alias],
            None => self.supervisors.keys().cloned().collect(),
        };
        for alias in aliases {
            match self.supervisors.remove(&alias) {
                Some(sup) => {
                    sup.stop().await;
                    self.stopped.push(sup);
                }
                None => log::warn!(alias = alias.as_str(); "stop requested for unknown alias"),
            }
        }
    }

    async fn handle_shutdown(&mut self) {
        log::info!("shutdown requested");
        self.handle_stop(None).await;
        self.done = true;
    }

    async fn handle_supervisor_token(&mut self, alias: String, token: SupervisorToken) {
        match token {
            SupervisorToken::Ready => {
                if let Some(sup) = self.supervisors.get(&alias) {
                    sup.send_directive(SupervisorToken::Launch);
                }
            }
            SupervisorToken::Launched => {
                if let Some(sup) = self.supervisors.get_mut(&alias) {
                    if sup.interest == Some(Interest::Launched) {
                        sup.interest = None;
                        self.send_ack(Ack::Ok(alias)).await;
                    }
                }
            }
            SupervisorToken::Died => {
                if let Some(sup) = self.supervisors.get(&alias) {
                    sup.send_directive(SupervisorToken::Relaunch);
                }
            }
            SupervisorToken::Finished => {
                let should_ack = self
                    .supervisors
                    .get_mut(&alias)
                    .map(|sup| {
                        let interested = sup.interest == Some(Interest::Finished);
                        if interested {
                            sup.interest = None;
                        }
                        interested
                    })
                    .unwrap_or(false);
                if should_ack {
                    self.send_ack(Ack::Ok(alias.clone())).await;
                }
                // The `finished` token above has already been observed
                // from the channel, so it is safe to join the task now:
                // nothing further can be lost on this path (see the
                // ordering requirement in SPEC_FULL.md §9).
                if let Some(sup) = self.supervisors.remove(&alias) {
                    sup.join().await;
                }
            }
            SupervisorToken::Launch | SupervisorToken::Relaunch => {
                log::warn!(alias = alias.as_str(); "unexpected directive seen as supervisor output");
            }
        }
    }

    async fn send_ack(&mut self, ack: Ack) {
        if let Some(console) = self.console.as_mut() {
            if let Err(e) = console.write_line(&ack.to_line()).await {
                log::error!("console socket error on send: {e:#}");
                self.console = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt as _, BufReader as TokioBufReader};
    use tokio::net::TcpStream as ClientStream;

    async fn connect(addr: SocketAddr) -> ClientStream {
        ClientStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_alias_acks_once_each() {
        let pm = ProcessManager::bind(0).await.unwrap();
        let addr = pm.local_addr().unwrap();
        tokio::spawn(pm.run());

        let mut client = connect(addr).await;
        client
            .write_all(b"run -as x /bin/true\n")
            .await
            .unwrap();
        client
            .write_all(b"run -as x /bin/true\n")
            .await
            .unwrap();

        let mut reader = TokioBufReader::new(&mut client).lines();
        let first = reader.next_line().await.unwrap().unwrap();
        let second = reader.next_line().await.unwrap().unwrap();
        let mut lines = vec![first, second];
        lines.sort();
        assert_eq!(lines, vec!["x duplicated alias", "x ok"]);
    }

    #[tokio::test]
    async fn shutdown_closes_socket() {
        let pm = ProcessManager::bind(0).await.unwrap();
        let addr = pm.local_addr().unwrap();
        tokio::spawn(pm.run());

        let mut client = connect(addr).await;
        client.write_all(b"shutdown\n").await.unwrap();

        let mut reader = TokioBufReader::new(&mut client).lines();
        let eof = reader.next_line().await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn wait_for_finish_acks_after_exit() {
        let pm = ProcessManager::bind(0).await.unwrap();
        let addr = pm.local_addr().unwrap();
        tokio::spawn(pm.run());

        let mut client = connect(addr).await;
        client
            .write_all(b"run -as q -w /bin/sh -c \"exit 0\"\n")
            .await
            .unwrap();

        let mut reader = TokioBufReader::new(&mut client).lines();
        let ack = reader.next_line().await.unwrap().unwrap();
        assert_eq!(ack, "q ok");
    }
}
