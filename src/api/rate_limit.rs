//! Rate limit middleware
//!
//! Clients are keyed by peer IP address, or by the first `X-Forwarded-For`
//! hop when `rate_limit.trust_forwarded_for` is set (deployments behind a
//! reverse proxy).

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

use crate::{error::AppError, AppState};

const FORWARDED_FOR: &str = "x-forwarded-for";

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let settings = &state.config.rate_limit;
    if !settings.enabled {
        return Ok(next.run(request).await);
    }

    let client = client_key(&request, settings.trust_forwarded_for);
    let limiter = &state.services.rate_limiter;
    if !limiter.allow(&client) {
        tracing::debug!(%client, "rate limit exceeded");
        return Err(AppError::RateLimited {
            retry_after: Some(limiter.retry_after(&client)),
        });
    }

    Ok(next.run(request).await)
}

fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
