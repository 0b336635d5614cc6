use anyhow::Result;
use tracing::Level;

fn main() -> Result<()> {
    let json = std::env::var("STACKGATE_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);
    stackgate_core::init_tracing(json, Level::INFO);

    tracing::info!(version = stackgate_core::VERSION, "stackgated stub started");
    Ok(())
}
