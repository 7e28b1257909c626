// REST API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;

use super::{ErrorResponse, RouteView, StatusSnapshot};
use crate::interface::Interface;
use crate::kernel::KernEntry;
use crate::rdisc::DiscoveredRouter;

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct AppState {
    status: watch::Receiver<StatusSnapshot>,
}

impl AppState {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        AppState { status }
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }
}

pub fn create_api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/routes", get(get_routes))
        .route("/api/route/:addr", get(get_route))
        .route("/api/kernel", get(get_kernel))
        .route("/api/routers", get(get_routers))
        .route("/api/interfaces", get(get_interfaces))
        .with_state(state)
}

/// Serve the status API until the listener fails
pub async fn serve(addr: SocketAddr, status: watch::Receiver<StatusSnapshot>) -> anyhow::Result<()> {
    let app = create_api_router(Arc::new(AppState::new(status)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Status API listening on http://{}", addr);
    tracing::info!("  GET  http://{}/api/routes", addr);
    tracing::info!("  GET  http://{}/api/kernel", addr);
    tracing::info!("  GET  http://{}/api/routers", addr);
    tracing::info!("  GET  http://{}/api/interfaces", addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.snapshot())
}

async fn get_routes(State(state): State<Arc<AppState>>) -> Json<Vec<RouteView>> {
    Json(state.status.borrow().routes.clone())
}

async fn get_kernel(State(state): State<Arc<AppState>>) -> Json<Vec<KernEntry>> {
    Json(state.status.borrow().kernel.clone())
}

async fn get_routers(State(state): State<Arc<AppState>>) -> Json<Vec<DiscoveredRouter>> {
    Json(state.status.borrow().routers.clone())
}

async fn get_interfaces(State(state): State<Arc<AppState>>) -> Json<Vec<Interface>> {
    Json(state.status.borrow().interfaces.clone())
}

/// The route the daemon would use to reach an address
async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(addr): Path<String>,
) -> Result<Json<RouteView>, ApiError> {
    let ip: Ipv4Addr = addr.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "InvalidAddress".to_string(),
                message: format!("Not an IPv4 address: {}", addr),
            }),
        )
    })?;

    let status = state.status.borrow();
    match status.covering_route(ip) {
        Some(route) => Ok(Json(route.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "NoRouteToHost".to_string(),
                message: format!("No route found to {}", ip),
            }),
        )),
    }
}
