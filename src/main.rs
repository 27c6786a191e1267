use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomwire::config::Config;
use roomwire::realtime::RealtimeServer;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("roomwire={}", config.default_log_level())));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("roomwire v{} starting", env!("CARGO_PKG_VERSION"));

    let server = RealtimeServer::bind(&config).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
