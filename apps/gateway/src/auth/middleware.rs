//! Bearer token extraction for HTTP and WebSocket upgrade requests.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::auth::jwt;
use crate::error::ApiError;
use crate::AppState;

/// Authenticated user, from `Authorization: Bearer <jwt>` or `?token=<jwt>`.
/// Browsers cannot set headers on a WebSocket upgrade, hence the query form.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(header) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return header.strip_prefix("Bearer ").map(str::to_string);
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token =
            bearer_token(parts).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let user_id = jwt::verify_token(&state.config.jwt_secret, &state.config.jwt_guard, &token)
            .map_err(|e| {
                tracing::debug!(?e, "token rejected");
                ApiError::unauthorized("Invalid or expired token")
            })?;

        // A failed lookup is a server fault, not a bad token.
        if jwt::is_blacklisted(state.kv.as_ref(), &token).await? {
            return Err(ApiError::unauthorized("Token has been revoked"));
        }

        Ok(AuthUser { user_id })
    }
}
