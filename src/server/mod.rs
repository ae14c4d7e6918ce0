//! Thin HTTP adapter over the application layer.
//!
//! Handlers translate requests into orchestrator calls and map error
//! kinds onto status codes; no lifecycle decisions live here.

pub mod challenge;
pub mod tls;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{CertError, Result};
use crate::orchestrator::CertificateManager;

use challenge::serve_challenge;
use tls::{
    apply_certificate, create_certificate, delete_certificate, get_certificate,
    get_certificate_detail, invalidate_cache, list_certificates, publish_refresh,
    reapply_auto_certificate, reapply_manual_add_certificate, reapply_manual_apply_certificate,
    search_certificates, update_manual_add_certificate, update_manual_apply_certificate,
};

/// Server state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: CertificateManager,
    pub challenge_dir: PathBuf,
}

/// JSON error body; every failure carries `success: false` plus a message.
#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

/// Wrapper mapping orchestrator error kinds to HTTP status codes.
pub struct ApiError(pub CertError);

impl From<CertError> for ApiError {
    fn from(err: CertError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CertError::Validation(_) => StatusCode::BAD_REQUEST,
            CertError::Conflict(_) => StatusCode::CONFLICT,
            CertError::NotFound(_) => StatusCode::NOT_FOUND,
            CertError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/certificates",
            get(list_certificates).post(create_certificate),
        )
        .route("/certificates/detail", get(get_certificate_detail))
        .route("/certificates/search", get(search_certificates))
        .route("/certificates/apply", post(apply_certificate))
        .route("/certificates/refresh", post(publish_refresh))
        .route(
            "/certificates/manual-apply",
            axum::routing::put(update_manual_apply_certificate),
        )
        .route(
            "/certificates/{id}",
            get(get_certificate)
                .patch(update_manual_add_certificate)
                .delete(delete_certificate),
        )
        .route(
            "/certificates/{id}/reapply-auto",
            post(reapply_auto_certificate),
        )
        .route(
            "/certificates/{id}/reapply-manual-apply",
            post(reapply_manual_apply_certificate),
        )
        .route(
            "/certificates/{id}/reapply-manual-add",
            post(reapply_manual_add_certificate),
        )
        .route("/cache/invalidate", post(invalidate_cache));

    Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
        .nest("/api", api)
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Start the API server; returns when the shutdown flag flips.
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CertError::transport(format!("Failed to bind API server: {e}")))?;
    tracing::info!("API server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| CertError::transport(format!("Server error: {e}")))?;

    Ok(())
}
