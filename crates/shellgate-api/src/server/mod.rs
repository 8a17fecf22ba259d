//! Gateway HTTP server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::header::CONTENT_LENGTH;
use axum::http::Method;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{require_identity, TokenValidator};
use crate::credentials::CredentialResolver;
use crate::error::Error;
use crate::exec_proxy::{exec_handler, ExecSessionFactory};
use crate::probe::check_shell_handler;


/// PEM files for serving HTTPS
#[derive(Clone, Debug)]
pub struct TlsFiles {
    /// Certificate chain
    pub cert_path: PathBuf,
    /// Private key
    pub key_path: PathBuf,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// Serve HTTPS with these files; plain HTTP when unset
    pub tls: Option<TlsFiles>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Token validation for the authenticated routes
    pub auth: Arc<TokenValidator>,
    /// Cluster credential lookup
    pub resolver: Arc<CredentialResolver>,
    /// Exec backend
    pub sessions: Arc<dyn ExecSessionFactory>,
}

impl AppState {
    /// Bundle the gateway's collaborators
    pub fn new(
        auth: TokenValidator,
        resolver: CredentialResolver,
        sessions: Arc<dyn ExecSessionFactory>,
    ) -> Self {
        Self {
            auth: Arc::new(auth),
            resolver: Arc::new(resolver),
            sessions,
        }
    }
}

/// Permissive CORS: any origin and header, no credentials
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([CONTENT_LENGTH])
}

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/ws/exec", get(exec_handler))
        .route("/shell/check", get(check_shell_handler))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_identity,
        ));

    Router::new()
        .route("/livez", get(|| async { "livez" }))
        .route("/readyz", get(|| async { "readyz" }))
        .route("/actuator/health", get(|| async { "OK" }))
        .route("/actuator/health/liveness", get(|| async { "livez" }))
        .route("/actuator/health/readiness", get(|| async { "readyz" }))
        .merge(authenticated)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

/// Start the gateway server
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<(), Error> {
    let app = build_router(state);

    match config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, tls = true, "Starting shellgate server");

            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
        None => {
            info!(addr = %config.addr, tls = false, "Starting shellgate server");

            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
    }

    Ok(())
}
