//! `controller-api`: serves the controller streaming API over gRPC and
//! gRPC-web on a single port.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use controller_core::memory::MemoryStore;
use controller_grpc::server::{self, ControllerConfig};
use controller_grpc::service::ControllerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    server::raise_nofile_limit();

    let config = ControllerConfig::from_env()?;
    let store = Arc::new(MemoryStore::new());
    let service = ControllerService::new(store, config.clone());

    info!(
        port = config.port,
        route_domain = %config.default_route_domain,
        "starting controller API"
    );
    server::serve(service, &config).await?;
    Ok(())
}
