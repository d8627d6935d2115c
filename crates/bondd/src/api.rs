use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::device::Address;
use crate::error::Error;
use crate::manager::Manager;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Failure of an API request, rendered as a JSON body
enum ApiError {
    BadAddress(String),
    NotFound(String),
    Transport(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::Transport(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadAddress(e) => (StatusCode::BAD_REQUEST, e),
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            ApiError::Transport(e) => (StatusCode::BAD_GATEWAY, e),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse()
        .map_err(|e: crate::device::AddressParseError| ApiError::BadAddress(e.to_string()))
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/devices
#[tracing::instrument(skip(manager))]
async fn list_devices(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    Json(manager.list())
}

/// Handler for GET /v1/devices/:address
#[tracing::instrument(skip(manager))]
async fn get_device(
    State(manager): State<Arc<Manager>>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = parse_address(&address)?;
    manager
        .get(address)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(Error::NotFound(address).to_string()))
}

/// Handler for DELETE /v1/devices/:address
#[tracing::instrument(skip(manager))]
async fn remove_device(
    State(manager): State<Arc<Manager>>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    let address = parse_address(&address)?;
    manager.remove_device(address).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the API router with all endpoints
fn create_router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:address", get(get_device).delete(remove_device))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Start the HTTP API server
///
/// Serves the roster and removal endpoints until `shutdown_rx` fires.
pub async fn serve(
    listen: &str,
    port: u16,
    manager: Arc<Manager>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(manager);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
