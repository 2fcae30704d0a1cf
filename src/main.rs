//! The `jobmill` binary.
//!
//! Logs go to stderr: `render` and `status` print their results on stdout.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = jobmill::cli::parse_cli();
    init_logging(&cli.log_level);
    jobmill::cli::run_with_cli(cli).await
}
