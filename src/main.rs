use tracing::info;

use vestnik::{init_logging, Broker, BrokerOptions, LoggingConfig, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let _logging = init_logging(LoggingConfig::default())
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        built = env!("BUILD_TIME"),
        "vestnik starting"
    );

    let broker = Broker::new(BrokerOptions::from_settings(&settings));
    let recovered = broker.recover()?;
    if recovered > 0 {
        info!(recovered, "persistent topics recovered");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    Ok(())
}
