//! Console side: one `ProxyTo` per target Process Manager, and the
//! Dispatcher that drives phased runs across all of them, plus the
//! interactive REPL surface built on top of it.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::catalog::{Catalog, CommandDescriptor, State};
use crate::proto::{self, Ack, Command};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

struct Conn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// One Console-side connection to a single Process Manager.
pub struct ProxyTo {
    pub target: SocketAddr,
    conn: Option<Conn>,
}

impl ProxyTo {
    pub fn new(target: SocketAddr) -> Self {
        ProxyTo { target, conn: None }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.target)
            .await
            .with_context(|| format!("connecting to {}", self.target))?;
        let (read_half, writer) = stream.into_split();
        self.conn = Some(Conn {
            lines: BufReader::new(read_half).lines(),
            writer,
        });
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to {}", self.target))?;
        conn.writer
            .write_all(command.to_line().as_bytes())
            .await
            .with_context(|| format!("writing to {}", self.target))
    }

    async fn recv_ack(&mut self) -> Result<Ack> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to {}", self.target))?;
        let line = conn
            .lines
            .next_line()
            .await
            .with_context(|| format!("reading from {}", self.target))?
            .ok_or_else(|| anyhow!("{} closed the connection", self.target))?;
        proto::parse_ack(&line)
    }

    pub async fn run(&mut self, descriptor: &CommandDescriptor) -> Result<()> {
        self.send(&Command::Run {
            alias: Some(descriptor.alias.clone()),
            wait: descriptor.wait_for_finish,
            command_line: descriptor.command_line.clone(),
        })
        .await
    }

    pub async fn stop(&mut self, alias: Option<String>) -> Result<()> {
        self.send(&Command::Stop { alias }).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.send(&Command::Shutdown).await
    }

    /// Waits for acks until every alias in `pending` has been accounted
    /// for. `ACK_TIMEOUT` bounds each individual wait purely for
    /// liveness (so a stalled proxy doesn't block forever unnoticed);
    /// elapsing it just re-polls rather than failing the gather.
    async fn await_acks(&mut self, mut pending: HashSet<String>) -> Result<()> {
        while !pending.is_empty() {
            match timeout(ACK_TIMEOUT, self.recv_ack()).await {
                Ok(ack) => {
                    let ack = ack?;
                    pending.remove(ack.alias());
                }
                Err(_) => {
                    log::debug!(
                        "still waiting on {} ack(s) from {}",
                        pending.len(),
                        self.target
                    );
                }
            }
        }
        Ok(())
    }

    /// Waits for the Process Manager to close the connection after a
    /// `shutdown`, then drops the connection locally.
    async fn await_eof(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.lines.next_line().await;
        }
        self.conn = None;
    }

    pub async fn close(&mut self) {
        self.conn = None;
    }
}

/// Drives a Catalog's command descriptors across every target machine,
/// phase by phase.
pub struct Dispatcher {
    proxies: HashMap<SocketAddr, ProxyTo>,
    catalog: Catalog,
}

impl Dispatcher {
    pub fn new(catalog: Catalog) -> Self {
        let proxies = catalog
            .targets()
            .into_iter()
            .map(|target| (target, ProxyTo::new(target)))
            .collect();
        Dispatcher { proxies, catalog }
    }

    pub fn target_count(&self) -> usize {
        self.proxies.len()
    }

    pub async fn connect_all(&mut self) -> Result<()> {
        for proxy in self.proxies.values_mut() {
            proxy.connect().await?;
        }
        Ok(())
    }

    /// Runs every phase in ascending order. A phase's RUN commands are
    /// fanned out to their targets, then every ack is gathered before
    /// `phase_ready` is consulted; a `false` return aborts the run
    /// without starting the next phase.
    pub async fn run_phased<F>(&mut self, mut phase_ready: F) -> Result<()>
    where
        F: FnMut(u32) -> bool,
    {
        for phase in self.catalog.phases() {
            log::info!("starting phase {phase}");
            let mut pending: HashMap<SocketAddr, HashSet<String>> = HashMap::new();

            for descriptor in self.catalog.commands.iter_mut().filter(|c| c.phase == phase) {
                let proxy = self
                    .proxies
                    .get_mut(&descriptor.target)
                    .ok_or_else(|| anyhow!("no proxy for target {}", descriptor.target))?;
                proxy.connect().await?;
                proxy.run(descriptor).await?;
                pending
                    .entry(descriptor.target)
                    .or_default()
                    .insert(descriptor.alias.clone());
                descriptor.state = State::Ready;
            }

            // Gather concurrently: one task per target waits on that
            // proxy's socket readiness independently, rather than
            // blocking on targets one at a time.
            let mut gathers = Vec::with_capacity(pending.len());
            for (target, aliases) in pending {
                let mut proxy = self
                    .proxies
                    .remove(&target)
                    .expect("proxy exists for every pending target");
                gathers.push(tokio::spawn(async move {
                    let result = proxy.await_acks(aliases).await;
                    (target, proxy, result)
                }));
            }
            for gather in gathers {
                let (target, proxy, result) =
                    gather.await.context("gather task for a phase panicked")?;
                self.proxies.insert(target, proxy);
                result?;
            }

            for descriptor in self
                .catalog
                .commands
                .iter_mut()
                .filter(|c| c.phase == phase)
            {
                descriptor.state = State::Done;
            }

            log::info!("phase {phase} complete");
            if !phase_ready(phase) {
                log::warn!("phase predicate rejected phase {phase}; aborting run");
                return Err(anyhow!("phase {phase} predicate failed"));
            }
        }
        Ok(())
    }

    pub async fn stop(&mut self, target: SocketAddr, alias: Option<String>) -> Result<()> {
        let proxy = self
            .proxies
            .get_mut(&target)
            .ok_or_else(|| anyhow!("no proxy for target {target}"))?;
        proxy.stop(alias).await
    }

    /// Stops `alias` everywhere it is scheduled to run, or every alias on
    /// every target if `alias` is `None`.
    pub async fn stop_all(&mut self, alias: Option<String>) -> Result<()> {
        match &alias {
            Some(alias) => {
                let targets: Vec<SocketAddr> = self
                    .catalog
                    .commands
                    .iter()
                    .filter(|c| &c.alias == alias)
                    .map(|c| c.target)
                    .collect();
                for target in targets {
                    self.stop(target, Some(alias.clone())).await?;
                }
            }
            None => {
                let targets: Vec<SocketAddr> = self.proxies.keys().cloned().collect();
                for target in targets {
                    self.stop(target, None).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown_all(&mut self) -> Result<()> {
        for proxy in self.proxies.values_mut() {
            if proxy.is_connected() {
                proxy.shutdown().await?;
                proxy.await_eof().await;
            }
        }
        Ok(())
    }

    pub async fn close_all(&mut self) {
        for proxy in self.proxies.values_mut() {
            proxy.close().await;
        }
    }

    pub fn show(&self) {
        for descriptor in &self.catalog.commands {
            println!(
                "{:<20} phase={:<4} target={:<21} wait={:<5} state={:?}",
                descriptor.alias,
                descriptor.phase,
                descriptor.target,
                descriptor.wait_for_finish,
                descriptor.state,
            );
        }
    }
}

/// The interactive front end: reads commands from stdin and drives a
/// Dispatcher, mirroring the verbs the original tool's console accepted.
pub struct Console {
    dispatcher: Dispatcher,
}

impl Console {
    pub fn new(catalog: Catalog) -> Self {
        Console {
            dispatcher: Dispatcher::new(catalog),
        }
    }

    pub async fn run_interactive(&mut self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        print_prompt();
        while let Some(line) = lines.next_line().await.context("reading stdin")? {
            let line = line.trim();
            if line.is_empty() {
                print_prompt();
                continue;
            }
            match self.dispatch_line(line).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => println!("error: {e:#}"),
            }
            print_prompt();
        }
        Ok(())
    }

    /// Returns `Ok(true)` once the REPL should exit.
    async fn dispatch_line(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match verb {
            "connect" => {
                self.dispatcher.connect_all().await?;
                println!("connected to {} target(s)", self.dispatcher.target_count());
            }
            "run" => {
                self.dispatcher.run_phased(|_phase| true).await?;
                println!("run complete");
            }
            "stop" => {
                let alias = if rest.is_empty() {
                    None
                } else {
                    Some(rest.to_string())
                };
                self.dispatcher.stop_all(alias).await?;
            }
            "shutdown" => {
                self.dispatcher.shutdown_all().await?;
                println!("all process managers shut down");
            }
            "show" => self.dispatcher.show(),
            "close" => {
                self.dispatcher.close_all().await;
                println!("closed");
            }
            "help" => print_help(),
            "setup" | "collect" | "clean" => println!("{verb}: not implemented; out of scope"),
            "exit" => return Ok(true),
            other => println!("unrecognized command: {other:?} (try `help`)"),
        }
        Ok(false)
    }
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("commands: connect, run, stop [alias], shutdown, show, close, help, exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A minimal stand-in for a Process Manager: acks every `run` line
    /// with `<alias> ok` and closes on `shutdown`.
    async fn fake_process_manager() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match proto::parse_command(&line) {
                    Ok(Command::Run { alias, .. }) => {
                        let alias = alias.unwrap_or_default();
                        let _ = writer.write_all(format!("{alias} ok\n").as_bytes()).await;
                    }
                    Ok(Command::Shutdown) => break,
                    _ => {}
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn proxy_runs_and_acks() {
        let addr = fake_process_manager().await;
        let mut proxy = ProxyTo::new(addr);
        proxy.connect().await.unwrap();
        let descriptor = CommandDescriptor {
            alias: "x".to_string(),
            command_line: "/bin/true".to_string(),
            target: addr,
            phase: 0,
            wait_for_finish: false,
            state: State::Done,
        };
        proxy.run(&descriptor).await.unwrap();
        let mut pending = HashSet::new();
        pending.insert("x".to_string());
        proxy.await_acks(pending).await.unwrap();
    }

    #[tokio::test]
    async fn dispatcher_runs_single_phase() {
        let addr = fake_process_manager().await;
        let toml = format!(
            "[[command]]\nalias = \"x\"\ncommand = \"/bin/true\"\nhost = \"{}\"\nport = {}\n",
            addr.ip(),
            addr.port()
        );
        let catalog = Catalog::parse(&toml).unwrap();
        let mut dispatcher = Dispatcher::new(catalog);
        dispatcher.run_phased(|_| true).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_eof() {
        let addr = fake_process_manager().await;
        let mut proxy = ProxyTo::new(addr);
        proxy.connect().await.unwrap();
        proxy.shutdown().await.unwrap();
        proxy.await_eof().await;
        assert!(!proxy.is_connected());
    }
}
