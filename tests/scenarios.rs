//! Scenario-driven integration tests exercised against real child
//! processes, matching this pack's preference for real OS behavior over
//! mocking the process boundary.

use std::net::SocketAddr;
use std::time::Duration;

use fleet_supervisor::catalog::Catalog;
use fleet_supervisor::dispatcher::Dispatcher;
use fleet_supervisor::manager::ProcessManager;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Client {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv_line(&mut self) -> Option<String> {
        timeout(STEP_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
    }
}

async fn start_manager() -> SocketAddr {
    let manager = ProcessManager::bind(0).await.unwrap();
    let addr = manager.local_addr().unwrap();
    tokio::spawn(manager.run());
    addr
}

#[tokio::test]
async fn duplicate_alias_gets_one_ok_and_one_duplicate() {
    let addr = start_manager().await;
    let mut client = Client::connect(addr).await;

    client.send("run -as x /bin/true").await;
    client.send("run -as x /bin/true").await;

    let mut replies = vec![
        client.recv_line().await.unwrap(),
        client.recv_line().await.unwrap(),
    ];
    replies.sort();
    assert_eq!(replies, vec!["x duplicated alias", "x ok"]);
}

#[tokio::test]
async fn wait_for_finish_acks_only_after_exit() {
    let addr = start_manager().await;
    let mut client = Client::connect(addr).await;

    client.send(r#"run -as q -w /bin/sh -c "exit 0""#).await;
    let reply = client.recv_line().await.unwrap();
    assert_eq!(reply, "q ok");
}

#[tokio::test]
async fn crash_looping_child_stays_stoppable() {
    let addr = start_manager().await;
    let mut client = Client::connect(addr).await;

    client.send(r#"run -as c /bin/sh -c "exit 1""#).await;
    // Give the crash loop a few restarts to happen.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.send("stop c").await;

    // The manager must remain responsive to further commands: a fresh
    // run under a different alias should still be acked promptly.
    client.send("run -as healthcheck /bin/true").await;
    let reply = client.recv_line().await.unwrap();
    assert_eq!(reply, "healthcheck ok");
}

#[tokio::test]
async fn shutdown_during_run_closes_the_socket() {
    let addr = start_manager().await;
    let mut client = Client::connect(addr).await;

    client.send("run -as s /bin/sleep 1000").await;
    let reply = client.recv_line().await.unwrap();
    assert_eq!(reply, "s ok");

    client.send("shutdown").await;
    let eof = client.recv_line().await;
    assert_eq!(eof, None);
}

#[tokio::test]
async fn phased_dispatch_runs_phases_in_order() {
    let addr_a = start_manager().await;
    let addr_b = start_manager().await;

    let toml = format!(
        r#"
        [[command]]
        alias = "a"
        command = "/bin/true"
        host = "{}"
        port = {}
        phase = 1
        wait = true

        [[command]]
        alias = "b"
        command = "/bin/true"
        host = "{}"
        port = {}
        phase = 2
        wait = true
        "#,
        addr_a.ip(),
        addr_a.port(),
        addr_b.ip(),
        addr_b.port(),
    );
    let catalog = Catalog::parse(&toml).unwrap();
    let mut dispatcher = Dispatcher::new(catalog);

    let mut completed_order = Vec::new();
    dispatcher
        .run_phased(|phase| {
            completed_order.push(phase);
            true
        })
        .await
        .unwrap();

    assert_eq!(completed_order, vec![1, 2]);
}

#[tokio::test]
async fn reconnect_preserves_running_supervisors() {
    let addr = start_manager().await;

    {
        let mut client = Client::connect(addr).await;
        client.send("run -as persistent /bin/sleep 5").await;
        let reply = client.recv_line().await.unwrap();
        assert_eq!(reply, "persistent ok");
        // Dropping `client` here closes the socket without a shutdown.
    }

    let mut client = Client::connect(addr).await;
    client.send("run -as persistent /bin/true").await;
    let reply = client.recv_line().await.unwrap();
    assert_eq!(reply, "persistent duplicated alias");

    client.send("stop persistent").await;
    client.send("shutdown").await;
    let eof = client.recv_line().await;
    assert_eq!(eof, None);
}
