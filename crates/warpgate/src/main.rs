use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging from core crate
    warpgate_core::logging::init()?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            signal_cancel.cancel();
        }
    });

    let parsed = cli::Cli::parse();
    parsed.dispatch(&cancel).await?;

    Ok(())
}
