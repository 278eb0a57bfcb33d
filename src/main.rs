mod config;
mod dispatch;
mod latch;
mod lock;
mod process;

use config::{Limits, load_limits};
use dispatch::Executor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Diagnostics go to stderr; stdout carries only the task reports.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args: Vec<String> = std::env::args().collect();
    let limits = match args.get(1) {
        Some(path) => load_limits(path)?,
        None => Limits::default(),
    };
    let mut executor = Executor::new(limits);
    executor.run().await
}
