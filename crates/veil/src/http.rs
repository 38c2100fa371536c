//! Axum handlers for the control plane.
//!
//! `POST /jwt-for-pid` takes a signed identity token as the raw request
//! body and binds the verified identity to the pid named in its claims.
//! `GET /health` reports liveness and the number of bound identities.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use veil_core::{IdentityClaims, Pid};
use veil_cred::CredError;

use crate::VeilState;

/// Why a bind request was refused.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("empty token")]
    EmptyToken,

    #[error("verified claims carry no pid")]
    MissingPid,

    #[error(transparent)]
    Credential(#[from] CredError),
}

impl BindError {
    /// HTTP status reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            BindError::EmptyToken | BindError::MissingPid => StatusCode::BAD_REQUEST,
            BindError::Credential(e) if e.is_verification_failure() => StatusCode::UNAUTHORIZED,
            BindError::Credential(e) => match e {
                CredError::MalformedToken(_)
                | CredError::InvalidClaims(_)
                | CredError::InvalidIssuerName(_) => StatusCode::BAD_REQUEST,
                CredError::KeyFileMissing { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// Authenticate `token` and bind the identity to its `pid` claim.
///
/// The identity directory is only touched once every check has passed.
pub fn bind_from_token(state: &VeilState, token: &str) -> Result<(Pid, IdentityClaims), BindError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(BindError::EmptyToken);
    }
    let claims = state.authenticate_token(token)?;
    let pid = claims.pid.ok_or(BindError::MissingPid)?;
    state.bind(pid, claims.clone());
    Ok((pid, claims))
}

/// Build the Axum router with all endpoints.
pub fn build_router(state: Arc<VeilState>) -> Router {
    Router::new()
        .route(
            "/jwt-for-pid",
            post(handle_jwt_for_pid).fallback(handle_method_not_allowed),
        )
        .route("/health", get(handle_health))
        .with_state(state)
}

/// POST /jwt-for-pid -- bind a signed identity to a process
async fn handle_jwt_for_pid(State(state): State<Arc<VeilState>>, body: String) -> Response {
    // Key file reads and P-521 verification block.
    let outcome = tokio::task::spawn_blocking(move || bind_from_token(&state, &body)).await;

    match outcome {
        Ok(Ok((pid, claims))) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "pid": pid,
                "sub": claims.sub,
                "iss": claims.iss,
            })),
        )
            .into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "identity bind rejected");
            (e.status(), e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "identity bind task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
        }
    }
}

/// Any other method on a known route
async fn handle_method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// GET /health -- liveness and binding count
async fn handle_health(State(state): State<Arc<VeilState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bound_identities": state.identities.len(),
    }))
}
