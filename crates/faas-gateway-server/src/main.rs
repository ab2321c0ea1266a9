use anyhow::Context;
use faas_gateway::GatewayConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,faas_gateway_server=debug,faas_gateway=debug")),
        )
        .init();

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    faas_gateway_server::run(config).await
}
