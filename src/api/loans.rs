//! Borrow and return endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    error::AppResult,
    models::{borrow::BorrowRequest, Borrow, BorrowDetails},
    AppState,
};

use super::AuthenticatedUser;

/// Return response with the closed borrow
#[derive(Serialize, ToSchema)]
pub struct ReturnResponse {
    /// Return status
    pub status: String,
    pub borrow: Borrow,
}

/// Borrows of the authenticated user
#[utoipa::path(
    get,
    path = "/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Caller's borrows, newest first", body = Vec<BorrowDetails>),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn my_borrows(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<Vec<BorrowDetails>>> {
    let borrows = state.services.loans.user_borrows(claims.user_id).await?;
    Ok(Json(borrows))
}

/// Borrow a copy of a title
#[utoipa::path(
    post,
    path = "/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    request_body = BorrowRequest,
    responses(
        (status = 201, description = "Copy borrowed", body = BorrowDetails),
        (status = 400, description = "Loan duration out of range"),
        (status = 409, description = "No copies available or duplicate active loan")
    )
)]
pub async fn borrow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(request): Json<BorrowRequest>,
) -> AppResult<(StatusCode, Json<BorrowDetails>)> {
    request.validate()?;

    let details = state
        .services
        .loans
        .borrow(claims.user_id, request.title_id, request.days)
        .await?;

    Ok((StatusCode::CREATED, Json(details)))
}

/// Return a borrowed copy
#[utoipa::path(
    post,
    path = "/borrows/{id}/return",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "Borrow ID")
    ),
    responses(
        (status = 200, description = "Copy returned", body = ReturnResponse),
        (status = 404, description = "No active borrow with this id for the caller")
    )
)]
pub async fn return_borrow(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(borrow_id): Path<i64>,
) -> AppResult<Json<ReturnResponse>> {
    let borrow = state
        .services
        .loans
        .return_copy(claims.user_id, borrow_id)
        .await?;

    Ok(Json(ReturnResponse {
        status: "returned".to_string(),
        borrow,
    }))
}

/// Borrows of any user (admin only)
#[utoipa::path(
    get,
    path = "/users/{id}/borrows",
    tag = "borrows",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "User's borrows", body = Vec<BorrowDetails>),
        (status = 403, description = "Admin privileges required")
    )
)]
pub async fn user_borrows(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Vec<BorrowDetails>>> {
    claims.require_admin()?;

    let borrows = state.services.loans.user_borrows(user_id).await?;
    Ok(Json(borrows))
}
