use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use riptide_core::cli::Cli;
use riptide_core::{BootstrapError, TunnelConfig, bootstrap, logging};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

enum Outcome {
    Interrupted,
    Ended(Result<(), BootstrapError>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_config()).context("failed to initialise logging")?;
    let config = cli.tunnel_config().context("invalid configuration")?;
    run(config, cli.retry).await
}

async fn run(config: TunnelConfig, retry: bool) -> anyhow::Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let attempt = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target = "bootstrap", "interrupted during bootstrap");
                return Ok(());
            }
            attempt = bootstrap(config.clone()) => attempt,
        };

        let failure = match attempt {
            Ok(tunnel) => {
                backoff = INITIAL_BACKOFF;
                let outcome = tokio::select! {
                    _ = tokio::signal::ctrl_c() => Outcome::Interrupted,
                    ended = tunnel.wait_terminated() => Outcome::Ended(ended),
                };
                tunnel.shutdown().await;
                match outcome {
                    Outcome::Interrupted => {
                        tracing::info!(target = "bootstrap", "interrupted");
                        return Ok(());
                    }
                    Outcome::Ended(Ok(())) => return Ok(()),
                    Outcome::Ended(Err(err)) => err,
                }
            }
            Err(err) => err,
        };

        if !retry || !failure.is_retryable() {
            return Err(anyhow::Error::new(failure).context("tunnel failed"));
        }
        tracing::warn!(target = "bootstrap", retry_in = ?backoff, "tunnel failed: {failure}");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
