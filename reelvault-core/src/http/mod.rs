//! Token-gated delivery endpoints.
//!
//! - `GET /manifest/{asset_id}`
//! - `GET /segments/{asset_id}/{stream}/{filename}`
//! - `GET|OPTIONS /license/{asset_id}`
//! - `GET /health`
//!
//! Operator routes live under `/admin` when an admin token is configured.

pub mod admin;
pub mod error;
pub mod extract;
pub mod handlers;

use std::net::SocketAddr;

use axum::http::header::{
    ACCEPT_RANGES, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cipher::StreamCipher;
use crate::config::ReelvaultConfig;
use crate::delivery::PackageServer;
use crate::license::LicenseService;
use crate::packager::PackageOrchestrator;
use crate::queue::{AdmissionConfig, AdmissionQueue};
use crate::token::TokenValidator;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use extract::RequestContext;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub trust_forwarded_for: bool,
    pub manifest_max_age_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub server: PackageServer,
    pub license: LicenseService,
    pub tokens: TokenValidator,
    /// Sole owner of packaging for this host; its queue is the one `/health`
    /// reports.
    pub orchestrator: PackageOrchestrator,
    pub admin_token: Option<String>,
    pub http: HttpSettings,
}

impl AppState {
    pub fn from_config(config: &ReelvaultConfig) -> Self {
        let queue = AdmissionQueue::new(AdmissionConfig::from(&config.queue));
        Self::new(config, PackageOrchestrator::new(config, queue))
    }

    pub fn new(config: &ReelvaultConfig, orchestrator: PackageOrchestrator) -> Self {
        let root = &config.paths.workspace_root;
        let keys = orchestrator.keys().clone();
        let cipher = config
            .cipher
            .encrypt_segments
            .then(|| StreamCipher::from_section(&config.cipher));
        Self {
            server: PackageServer::new(root, keys.clone(), cipher),
            license: LicenseService::new(keys),
            tokens: TokenValidator::new(&config.tokens),
            orchestrator,
            admin_token: config.server.admin_token.clone(),
            http: HttpSettings {
                trust_forwarded_for: config.server.trust_forwarded_for,
                manifest_max_age_seconds: config.server.manifest_max_age_seconds,
            },
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, RANGE, CONTENT_TYPE])
        .expose_headers([CONTENT_RANGE, CONTENT_LENGTH, ACCEPT_RANGES]);

    let mut app = Router::new()
        .route("/manifest/{asset_id}", get(handlers::manifest))
        .route(
            "/segments/{asset_id}/{stream}/{filename}",
            get(handlers::segment),
        )
        .route(
            "/license/{asset_id}",
            get(handlers::license).options(handlers::license_preflight),
        )
        .route("/health", get(handlers::health))
        .layer(cors);
    if state.admin_token.is_some() {
        app = app.nest("/admin", admin::routes());
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serves until Ctrl-C or SIGTERM, then drains in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "delivery server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("delivery server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
