//! Fleet control plane: agent registry, config distribution, and log
//! intake for the ICS honeypot fleet.
//!
//! Mirrors the teacher's web UI crate — an `axum` router with `Extension`
//! state and an optional CORS layer — generalized from read-only PLC
//! telemetry to the bidirectional agent control-plane API in spec.md §6.

mod api;
pub mod registry;

pub use registry::{AgentRecord, AgentRegistry};

use axum::routing::{delete, get, post, Router};
use axum::Extension;
use plc_profiles::ProfileStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Configuration for the control-plane HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_addr: SocketAddr,
    /// Enable CORS for the operator dashboard.
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:8000".parse().expect("valid default address"), enable_cors: true }
    }
}

/// The control-plane server: agent registry and profile store behind an
/// `axum` router.
pub struct ControlPlaneServer {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    profiles: Arc<ProfileStore>,
}

impl ControlPlaneServer {
    /// Build a server over an already-loaded profile store.
    #[must_use]
    pub fn new(config: ServerConfig, profiles: ProfileStore) -> Self {
        Self { config, registry: Arc::new(AgentRegistry::new()), profiles: Arc::new(profiles) }
    }

    /// Shared handle to the agent registry, for diagnostics or tests.
    #[must_use]
    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and serve until the process is killed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is already in use or the
    /// accept loop fails.
    pub async fn start(self) -> anyhow::Result<()> {
        let bind_addr = self.config.bind_addr;
        let server_url = format!("http://{bind_addr}");
        info!(addr = %bind_addr, "starting fleet control plane");

        let app = self.build_router(server_url);

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "fleet control plane listening");
        axum::serve(listener, app).await?;
        Ok(())
    }

    fn build_router(self, server_url: String) -> Router {
        let mut app = Router::new()
            .route("/health", get(api::health_check))
            .route("/api/heartbeat", post(api::heartbeat))
            .route("/api/config/:node_id", get(api::get_config))
            .route("/api/logs", post(api::upload_logs))
            .route("/api/agents", get(api::list_agents).post(api::add_agent))
            .route("/api/agents/:id/toggle", post(api::toggle_agent))
            .route("/api/agents/:id", delete(api::delete_agent))
            .route("/api/update_agent_config", post(api::update_agent_config))
            .route("/api/profiles", get(api::list_profiles))
            .route("/api/profiles/:name", get(api::get_profile))
            .layer(Extension(self.registry))
            .layer(Extension(self.profiles))
            .layer(Extension(Arc::<str>::from(server_url)));

        if self.config.enable_cors {
            app = app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }

        app
    }
}
