use anyhow::{Context, Result};
use clap::Parser;
use fleet_supervisor::manager::ProcessManager;
use tokio_util::sync::CancellationToken;

/// Agent that accepts commands from a Console and supervises the
/// processes it is told to run.
#[derive(Parser)]
struct Args {
    /// TCP port to listen for a Console connection on.
    #[arg(long, default_value_t = 2900)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let manager = ProcessManager::bind(args.port)
        .await
        .context("binding process manager listener")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received ctrl-c; process manager will keep running until `shutdown`");
            signal_token.cancel();
        }
    });

    tokio::select! {
        result = manager.run() => result.context("process manager loop"),
        _ = shutdown.cancelled() => Ok(()),
    }
}
