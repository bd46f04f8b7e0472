//! HTTP API surface for the fleetmap registry
//!
//! The transport is a boundary: it translates wire requests into calls on
//! the registry façade and maps error kinds onto status codes. All registry
//! semantics live behind the façade.

pub mod handlers;
pub mod models;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use fleetmap_registry::Registry;

// TLS wiring
use axum_server::tls_rustls::RustlsConfig;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<Registry>,
    /// Fired at shutdown; threaded into registry calls as the cancellation
    /// handle for in-flight requests
    pub shutdown: CancellationToken,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleetmap Registry API",
        version = "0.1.0",
        description = "Control-plane registry tracking relay and agent liveness and placement"
    ),
    paths(
        handlers::register_relay,
        handlers::heartbeat_relay,
        handlers::list_relays,
        handlers::remove_relay,
        handlers::list_relay_agents,
        handlers::register_agent,
        handlers::heartbeat_agent,
        handlers::list_agents,
        handlers::get_agent_placement,
        handlers::remove_agents,
        handlers::health_check,
    ),
    components(schemas(
        models::RegisterRelayRequest,
        models::HeartbeatRelayRequest,
        models::RelayInfo,
        models::RelayList,
        models::RegisterAgentRequest,
        models::AgentInfo,
        models::AgentList,
        models::PlacementInfo,
        models::RemoveAgentsRequest,
        models::HealthResponse,
        models::ErrorResponse,
    )),
    tags(
        (name = "relays", description = "Relay lifecycle endpoints"),
        (name = "agents", description = "Agent lifecycle and placement endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// TLS certificate path (enables HTTPS when set together with the key)
    pub tls_cert_path: Option<String>,
    /// TLS private key path
    pub tls_key_path: Option<String>,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, registry: Arc<Registry>, shutdown: CancellationToken) -> Self {
        let state = Arc::new(AppState { registry, shutdown });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/relays", post(handlers::register_relay).get(handlers::list_relays))
            .route(
                "/api/relays/{id}",
                delete(handlers::remove_relay),
            )
            .route("/api/relays/{id}/heartbeat", post(handlers::heartbeat_relay))
            .route("/api/relays/{id}/agents", get(handlers::list_relay_agents))
            .route(
                "/api/agents",
                post(handlers::register_agent)
                    .get(handlers::list_agents)
                    .delete(handlers::remove_agents),
            )
            .route("/api/agents/{id}/heartbeat", post(handlers::heartbeat_agent))
            .route(
                "/api/agents/{id}/placement",
                get(handlers::get_agent_placement),
            )
            .route(
                "/api/openapi.json",
                get(move || async move { Json(api_doc) }),
            )
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the API server; returns when the shutdown token fires or the
    /// listener fails.
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let shutdown = self.state.shutdown.clone();

        let use_tls = self.config.tls_cert_path.is_some() && self.config.tls_key_path.is_some();
        let protocol = if use_tls { "https" } else { "http" };

        info!(
            "Registry API listening on {}://{}",
            protocol, self.config.bind_addr
        );
        info!(
            "OpenAPI spec: {}://{}/api/openapi.json",
            protocol, self.config.bind_addr
        );

        if use_tls {
            let cert_path = self.config.tls_cert_path.as_deref().unwrap_or_default();
            let key_path = self.config.tls_key_path.as_deref().unwrap_or_default();

            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {}", e))?;

            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
                });
            }

            axum_server::bind_rustls(self.config.bind_addr, tls_config)
                .handle(handle)
                .serve(router.into_make_service())
                .await
                .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;
        } else {
            let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        // Ensure the OpenAPI spec can be generated without panics
        let _api_doc = ApiDoc::openapi();
    }
}
