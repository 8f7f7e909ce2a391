use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use surge::{RunControl, RunReport, ThresholdVerdict};
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

pub(crate) async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let socket_addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(socket_addr).await
}

pub(crate) async fn server_task(listener: TcpListener, control: RunControl) -> std::io::Result<()> {
    debug!("Status server listening on {:?}", listener.local_addr());
    axum::serve(listener, router(control)).await
}

/// Live status routes: `GET /status`, `GET /thresholds` and `POST /stop`.
pub fn router(control: RunControl) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/thresholds", get(thresholds))
        .route("/stop", post(stop))
        .with_state(control)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[derive(Error, Debug)]
enum HandlerError {
    #[error("Run is already stopping")]
    AlreadyStopping,
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        use HandlerError::*;
        match self {
            AlreadyStopping => (StatusCode::CONFLICT, self.to_string()),
        }
        .into_response()
    }
}

async fn status(State(control): State<RunControl>) -> Json<RunReport> {
    Json(control.live_report())
}

async fn thresholds(State(control): State<RunControl>) -> Json<Vec<ThresholdVerdict>> {
    Json(control.verdicts().as_ref().clone())
}

#[instrument(skip(control))]
async fn stop(State(control): State<RunControl>) -> Result<(StatusCode, String), HandlerError> {
    if control.is_cancelled() {
        return Err(HandlerError::AlreadyStopping);
    }

    info!("Stop requested through the status server");
    control.abort("stopped through the status server");
    Ok((StatusCode::ACCEPTED, "Stopping run".to_string()))
}
