use anyhow::Context;
use faas_watchdog::WatchdogConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,faas_watchdog=debug")),
        )
        .init();

    let config = WatchdogConfig::from_env().context("invalid watchdog configuration")?;
    faas_watchdog::run(config)
        .await
        .context("watchdog terminated")?;
    Ok(())
}
