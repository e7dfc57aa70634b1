//! Shared-secret query-token gate. A no-op when validation is disabled.

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::error::ProxyError;

use super::AppState;

#[derive(Deserialize)]
pub struct AccessTokenQuery {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

pub async fn access_token_middleware(
    State(state): State<AppState>,
    Query(query): Query<AccessTokenQuery>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    if !state.server.access_token_validation_enabled {
        return Ok(next.run(request).await);
    }

    match query.access_token {
        Some(token) if token == state.server.access_token => Ok(next.run(request).await),
        _ => Err(ProxyError::Unauthorized),
    }
}
