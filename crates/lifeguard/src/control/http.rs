//! HTTP REST API for the control plane
//!
//! JSON endpoints for lifecycle commands plus a Server-Sent Events stream of
//! status transitions.

use crate::control::{
    CommandResponse, ControlPlane, LogsResponse, ServiceStatusResponse, ServiceSummary,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};

/// Query params for logs
#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

/// GET /health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// GET /services - List all services
async fn list_services(State(control): State<ControlPlane>) -> Json<Vec<ServiceSummary>> {
    Json(control.list_services().await)
}

/// GET /services/{name} - Status of a single service
async fn get_service(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
) -> Result<Json<ServiceStatusResponse>, StatusCode> {
    control
        .get_service_status(&name)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

fn not_found(name: &str) -> (StatusCode, Json<CommandResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(CommandResponse {
            success: false,
            error: Some(format!("Service not found: {}", name)),
        }),
    )
}

/// POST /services/{name}/start
async fn start_service(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
) -> (StatusCode, Json<CommandResponse>) {
    if !control.has_service(&name) {
        return not_found(&name);
    }
    (StatusCode::OK, Json(control.start_service(&name).await))
}

/// POST /services/{name}/stop
async fn stop_service(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
) -> (StatusCode, Json<CommandResponse>) {
    if !control.has_service(&name) {
        return not_found(&name);
    }
    (StatusCode::OK, Json(control.stop_service(&name).await))
}

/// POST /services/{name}/restart
async fn restart_service(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
) -> (StatusCode, Json<CommandResponse>) {
    if !control.has_service(&name) {
        return not_found(&name);
    }
    (StatusCode::OK, Json(control.restart_service(&name).await))
}

/// GET /services/{name}/logs - Captured output
async fn get_logs(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> (StatusCode, Json<LogsResponse>) {
    let response = control.get_service_logs(&name, query.lines);
    let status = if control.has_service(&name) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(response))
}

/// GET /events - Status transitions as Server-Sent Events
async fn events(
    State(control): State<ControlPlane>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = control.subscribe();

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default().event("status").json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Create the HTTP router
pub fn create_router(control: ControlPlane) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/services", get(list_services))
        .route("/services/{name}", get(get_service))
        .route("/services/{name}/start", post(start_service))
        .route("/services/{name}/stop", post(stop_service))
        .route("/services/{name}/restart", post(restart_service))
        .route("/services/{name}/logs", get(get_logs))
        .route("/events", get(events))
        .layer(cors)
        .with_state(control)
}

/// Serve the control plane on an already bound listener
pub async fn serve(listener: TcpListener, control: ControlPlane) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP control plane listening on {}", addr);
    }
    axum::serve(listener, create_router(control)).await
}

/// Bind `addr` and serve the control plane
pub async fn run_http_server(
    addr: &str,
    control: ControlPlane,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, control).await?;
    Ok(())
}
