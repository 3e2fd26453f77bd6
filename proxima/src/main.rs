mod config;
mod logging;
mod server;
mod websocket;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use proxima_sfu::{PeerHub, RoomRegistry, SessionBroker, SfuEngine, SignalingService};

use config::Config;
use server::ProximaServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = config::load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Proxima signaling server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Media engine
    let engine = start_engine(&config).await?;

    // 4. Coordinator services
    let registry = Arc::new(RoomRegistry::new(engine, Arc::new(config.sfu.clone())));
    let hub = Arc::new(PeerHub::new());
    let service = Arc::new(SignalingService::new(registry, hub));
    let broker = Arc::new(SessionBroker::new(Arc::clone(&service)));

    // 5. Serve until shutdown
    ProximaServer::new(config, service, broker).start().await
}

#[cfg(feature = "mediasoup")]
async fn start_engine(config: &Config) -> Result<Arc<dyn SfuEngine>> {
    let engine = proxima_sfu::MediasoupEngine::start(config.sfu.transport.clone()).await?;
    info!(codecs = config.sfu.media_codecs.len(), "Media engine ready (mediasoup worker)");
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "mediasoup"))]
async fn start_engine(config: &Config) -> Result<Arc<dyn SfuEngine>> {
    let engine = proxima_sfu::LocalEngine::new(config.sfu.transport.clone());
    info!(
        codecs = config.sfu.media_codecs.len(),
        "Media engine ready (in-process, no media forwarding)"
    );
    Ok(Arc::new(engine))
}
