//! Business logic services

pub mod auth;
pub mod loans;
pub mod rate_limit;

use std::sync::Arc;

use crate::{config::AppConfig, repository::Repository};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub auth: auth::AuthService,
    pub loans: loans::LoansService,
    pub rate_limiter: Arc<rate_limit::RateLimiter>,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(repository: Repository, config: &AppConfig) -> Self {
        let tokens = auth::TokenAuthenticator::new(&config.auth);
        Self {
            auth: auth::AuthService::new(repository.clone(), tokens),
            loans: loans::LoansService::new(repository, config.lending.clone()),
            rate_limiter: Arc::new(rate_limit::RateLimiter::new(&config.rate_limit)),
        }
    }
}
