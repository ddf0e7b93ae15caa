use anyhow::{Context, Result};
use std::time::Duration;

use axum::{
    extract::State, middleware, response::IntoResponse, routing::get, Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::{
    log_requests, metrics::metrics_handler, state::*, task_routes::task_routes,
    websocket::ws_handler, ServerConfig,
};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub version: String,
    pub hash: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hash: state.hash.clone(),
    };
    Json(stats)
}

pub fn make_app(config: ServerConfig, services: JobServices) -> Result<Router> {
    let state = ServerState::new(config, services);

    let app: Router = Router::new()
        .route("/", get(home))
        .route("/ws", get(ws_handler))
        .merge(task_routes())
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state);

    Ok(app)
}

fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve the API on `config.port` (and metrics on `config.metrics_port`)
/// until `shutdown` is cancelled.
pub async fn run_server(
    config: ServerConfig,
    services: JobServices,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, services)?;

    if let Some(metrics_port) = metrics_port {
        let metrics_listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", metrics_port))
            .await
            .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(metrics_listener, make_metrics_app())
                .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!("Metrics server failed: {}", e);
            }
        });
        info!("Metrics available at port {}!", metrics_port);
    }

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Ready to serve at port {}!", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsSettings;
    use crate::jobs::queue::MockJobQueue;
    use crate::jobs::SqliteJobStore;
    use crate::notifications::NotificationHub;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let services = JobServices::new(
            Arc::new(SqliteJobStore::in_memory().unwrap()),
            Arc::new(MockJobQueue::new()),
            Arc::new(NotificationHub::default()),
            &JobsSettings::default(),
        );
        make_app(ServerConfig::default(), services).unwrap()
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 01:01:01");
    }

    #[tokio::test]
    async fn home_reports_version() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime"].as_str().unwrap().starts_with("0d"));
    }

    #[tokio::test]
    async fn responds_forbidden_without_identity() {
        let app = app();
        let protected_routes = vec!["/tasks", "/tasks/statistics", "/tasks/123", "/admin/queue", "/ws"];

        for route in protected_routes.into_iter() {
            let request = Request::builder().uri(route).body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "route {}", route);
        }
    }
}
