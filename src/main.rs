//! meshseek daemon entry point

use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshseek::{MeshConfig, MeshNode};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshseek=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = MeshConfig::default();
    if let Ok(dir) = std::env::var("MESHSEEK_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Ok(port) = std::env::var("MESHSEEK_PORT") {
        config.listen_port = port.parse().unwrap_or(0);
    }
    if let Ok(seeds) = std::env::var("MESHSEEK_BOOTSTRAP") {
        config.bootstrap = seeds.split(',').map(str::to_string).collect();
    }

    let node = match MeshNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "node failed to start");
            std::process::exit(1);
        }
    };

    info!(fingerprint = %node.identity().fingerprint(), "meshseek running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "signal handler failed"),
    }

    if let Err(e) = node.flush() {
        error!(error = %e, "flush on shutdown failed");
    }
}
