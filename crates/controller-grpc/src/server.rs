//! Server bootstrap.
//!
//! One listening port serves both wire framings: native gRPC (HTTP/2,
//! `application/grpc` content types) passes through untouched, anything
//! else is handled by the gRPC-web translation layer. CORS fronts the
//! browser framing.

use std::net::SocketAddr;
use std::time::Duration;

use http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use http::Method;
use tonic_web::GrpcWebLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use controller_core::types::DEFAULT_SCALE_TIMEOUT;

use crate::proto::controller_server::ControllerServer;
use crate::service::ControllerService;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Listening port (`PORT`, default 3000).
    pub port: u16,
    /// Default domain for app routes (`DEFAULT_ROUTE_DOMAIN`), consumed by
    /// the storage collaborator's route management.
    pub default_route_domain: String,
    /// How long synchronous scale waits block before `DeadlineExceeded`.
    pub scale_request_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            default_route_domain: String::new(),
            scale_request_timeout: DEFAULT_SCALE_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    /// Reads `PORT` and `DEFAULT_ROUTE_DOMAIN` from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid PORT {port:?}: {err}"))?;
        }
        if let Ok(domain) = std::env::var("DEFAULT_ROUTE_DOMAIN") {
            config.default_route_domain = domain;
        }
        Ok(config)
    }
}

/// Raises `RLIMIT_NOFILE` to the hard maximum. Streaming fan-out holds one
/// descriptor per connected client.
pub fn raise_nofile_limit() {
    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => debug!(limit, "raised open-file limit"),
        Err(err) => warn!(error = %err, "could not raise open-file limit"),
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
        ])
        .allow_headers([
            AUTHORIZATION,
            ACCEPT,
            CONTENT_TYPE,
            IF_MATCH,
            IF_NONE_MATCH,
            HeaderName::from_static("x-grpc-web"),
        ])
        .expose_headers([ETAG])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

/// Serves the controller on `0.0.0.0:{port}` until shutdown.
pub async fn serve(
    service: ControllerService,
    config: &ControllerConfig,
) -> Result<(), tonic::transport::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "controller API listening");
    tonic::transport::Server::builder()
        .accept_http1(true)
        .layer(cors_layer())
        .layer(GrpcWebLayer::new())
        .add_service(ControllerServer::new(service))
        .serve(addr)
        .await
}
