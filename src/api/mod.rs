//! API handlers for the lending REST endpoints

pub mod auth;
pub mod health;
pub mod loans;
pub mod openapi;
pub mod rate_limit;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::{AppError, AuthError},
    models::UserClaims,
    AppState,
};

/// Extractor for the caller identified by a bearer token
pub struct AuthenticatedUser(pub UserClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::Missing)?;

        let token = bearer_token(auth_header).ok_or(AuthError::Malformed)?;

        let claims = state.services.auth.tokens().verify(token)?;

        Ok(AuthenticatedUser(claims))
    }
}

/// Token of a `Bearer` credential; the scheme name is case-insensitive.
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim_start().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Create the application router with all routes
pub fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // API v1 routes
    let api_v1 = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Authentication
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        // Borrows
        .route("/borrows", get(loans::my_borrows).post(loans::borrow))
        .route("/borrows/:id/return", post(loans::return_borrow))
        .route("/users/:id/borrows", get(loans::user_borrows))
        .with_state(state.clone());

    // OpenAPI documentation
    let openapi = openapi::create_openapi_router();

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi)
        // Admission control covers every path, ahead of any extractor
        .layer(middleware::from_fn_with_state(state, rate_limit::rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
