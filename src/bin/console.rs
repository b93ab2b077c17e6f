use anyhow::{Context, Result};
use clap::Parser;
use fleet_supervisor::catalog::Catalog;
use fleet_supervisor::dispatcher::Console;
use std::path::PathBuf;

/// Interactive front end that loads a Catalog and drives phased runs
/// across every Process Manager it names.
#[derive(Parser)]
struct Args {
    /// Path to the TOML catalog describing what to run and where.
    #[arg(long, default_value = "catalog.toml")]
    catalog: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("loading catalog {}", args.catalog.display()))?;

    let mut console = Console::new(catalog);
    console.run_interactive().await
}
