/// ACME HTTP-01 challenge endpoint
///
/// Serves `GET /.well-known/acme-challenge/{token}` from the configured
/// webroot, with a legacy fallback read at the webroot top level.
use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use super::AppState;

pub async fn serve_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    // Tokens are single path segments; anything dotted or empty is junk.
    if token.is_empty() || token.starts_with('.') || token.contains("..") {
        return not_found(&token);
    }

    let primary = state
        .challenge_dir
        .join(".well-known/acme-challenge")
        .join(&token);
    let fallback = state.challenge_dir.join(&token);

    for path in [primary, fallback] {
        if let Ok(key_authorization) = tokio::fs::read_to_string(&path).await {
            tracing::info!("Served ACME challenge token: {token}");
            return (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response();
        }
    }

    not_found(&token)
}

fn not_found(token: &str) -> Response {
    tracing::warn!("ACME challenge token not found: {token}");
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("challenge token not found: {token}"),
    )
        .into_response()
}
