use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ishell::config::Config;
use ishell::mux::Multiplexer;

/// A terminal multiplexer pairing an interactive shell with an assistant
/// REPL, side by side in one terminal.
#[derive(Parser, Debug)]
#[command(name = "ishell")]
#[command(about = "Shell and assistant REPL multiplexed in one terminal", long_about = None)]
#[command(version)]
struct Args {
    /// Shell to run in the bottom pane (default: $SHELL)
    #[arg(long, value_name = "PATH")]
    shell: Option<String>,

    /// Path to a JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write diagnostics to this file (stdout belongs to the panes)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "ishell=trace" (default: RUST_LOG, else info)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.log_file.as_deref(), args.log_level.as_deref())?;

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(shell) = args.shell {
        config.shell = shell;
    }
    tracing::info!(shell = %config.shell, term = %config.term, "starting");

    let mut mux = Multiplexer::new(&config)?;
    mux.run()?;
    drop(mux);

    tracing::info!("clean shutdown");
    Ok(())
}

/// Diagnostics go to a file because the terminal itself is the product.
/// Without `--log-file`, logging stays off.
fn init_tracing(log_file: Option<&std::path::Path>, level: Option<&str>) -> Result<()> {
    let Some(path) = log_file else {
        return Ok(());
    };

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let file = std::fs::File::create(path)
        .with_context(|| format!("create log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
