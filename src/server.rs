use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::capability::CapabilityRegistry;
use crate::config::VdsConfig;
use crate::store::DbHandle;
use crate::supervisor::{Orchestrator, SupervisorSettings};

/// Configuration for the session server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub resume_on_startup: bool,
}

impl ServerConfig {
    pub fn from_config(config: &VdsConfig) -> Self {
        Self {
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            resume_on_startup: config.server.resume_on_startup,
        }
    }
}

/// Build the full application router: REST API, live events and health.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Open the store, resume unfinished sessions and serve until Ctrl+C.
pub async fn start_server(server: ServerConfig, config: &VdsConfig) -> Result<()> {
    let store = DbHandle::open(&server.db_path).context("Failed to initialize session database")?;
    let registry = CapabilityRegistry::from_config(&config.capabilities)
        .context("Failed to build capability registry")?;
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        registry,
        SupervisorSettings::from_config(config),
    )
    .context("Capability registry does not cover the analysis plan")?;

    if server.resume_on_startup {
        let resumed = orchestrator
            .resume_unfinished()
            .await
            .context("Failed to resume unfinished sessions")?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed unfinished sessions");
        }
    }

    let mut app = build_router(Arc::new(AppState { orchestrator }));
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %server.db_path.display(), "server listening");
    println!("VDS orchestrator running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Map, Value};
    use tower::ServiceExt;

    struct Noop;

    #[async_trait]
    impl Capability for Noop {
        async fn run(
            &self,
            _q: &str,
            _d: &str,
            _c: &Map<String, Value>,
            _ids: &[String],
        ) -> anyhow::Result<Map<String, Value>> {
            Ok(Map::new())
        }
    }

    fn test_router() -> Router {
        let mut registry = CapabilityRegistry::new();
        for id in crate::plan::default_step_ids() {
            registry.register(id, Arc::new(Noop));
        }
        let orchestrator = Orchestrator::new(
            Arc::new(DbHandle::in_memory().unwrap()),
            registry,
            SupervisorSettings::default(),
        )
        .unwrap();
        build_router(Arc::new(AppState { orchestrator }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let req = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = Request::builder()
            .uri("/no/such/route")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_from_defaults() {
        let server = ServerConfig::from_config(&VdsConfig::default());
        assert_eq!(server.port, 3150);
        assert!(server.resume_on_startup);
        assert!(!server.dev_mode);
    }
}
