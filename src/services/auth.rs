//! Token authentication and account service

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use validator::Validate;

use crate::{
    config::AuthConfig,
    error::{AppError, AppResult, AuthError},
    models::{user::RegisterRequest, NewUser, Role, User, UserClaims},
    repository::Repository,
};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// A freshly signed token and the instant it stops being accepted
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies self-contained HS256 session tokens.
///
/// Holds only immutable key material, so clones can be shared freely
/// across request handlers.
#[derive(Clone)]
pub struct TokenAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    validity_secs: i64,
}

impl TokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        // The validity window is checked in `verify_at` against an explicit clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["sub", "iss", "iat", "nbf", "exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            validity_secs: i64::try_from(config.jwt_expiration_hours)
                .unwrap_or(i64::MAX)
                .saturating_mul(3600),
        }
    }

    pub fn issue(&self, user_id: i64, role: Role) -> AppResult<IssuedToken> {
        self.issue_at(user_id, role, Utc::now())
    }

    pub fn issue_at(&self, user_id: i64, role: Role, now: DateTime<Utc>) -> AppResult<IssuedToken> {
        // Claims carry whole seconds; the reported expiry must match the signed one.
        let issued_at = now.timestamp();
        let expires_at = issued_at
            .checked_add(self.validity_secs)
            .and_then(|exp| DateTime::from_timestamp(exp, 0))
            .ok_or_else(|| AppError::Internal("token expiry out of range".to_string()))?;
        let claims = UserClaims {
            sub: user_id.to_string(),
            user_id,
            role,
            iss: self.issuer.clone(),
            iat: issued_at,
            nbf: issued_at,
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))?;

        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<UserClaims, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Check structure, algorithm, signature and issuer, then require
    /// `nbf <= now < exp`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<UserClaims, AuthError> {
        let claims = decode::<UserClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed,
            })?
            .claims;

        if claims.sub != claims.user_id.to_string() {
            return Err(AuthError::Malformed);
        }

        let now = now.timestamp();
        if now < claims.nbf {
            return Err(AuthError::NotYetValid);
        }
        if now >= claims.exp {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(hash: &str, password: &str) -> AppResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Registration and credential login on top of [`TokenAuthenticator`]
#[derive(Clone)]
pub struct AuthService {
    repository: Repository,
    tokens: TokenAuthenticator,
}

impl AuthService {
    pub fn new(repository: Repository, tokens: TokenAuthenticator) -> Self {
        Self { repository, tokens }
    }

    pub fn tokens(&self) -> &TokenAuthenticator {
        &self.tokens
    }

    /// Create a `user`-role account
    pub async fn register(&self, request: RegisterRequest) -> AppResult<User> {
        request.validate()?;

        let user = self
            .repository
            .users
            .create(NewUser {
                username: request.username.trim().to_string(),
                email: request.email.trim().to_lowercase(),
                password_hash: hash_password(&request.password)?,
                role: Role::User,
            })
            .await?;

        tracing::info!(user_id = user.id, username = %user.username, "user registered");
        Ok(user)
    }

    /// Exchange a username and password for a signed token
    pub async fn login(&self, username: &str, password: &str) -> AppResult<(IssuedToken, User)> {
        let user = self
            .repository
            .users
            .find_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(&user.password_hash, password)? {
            tracing::debug!(user_id = user.id, "password mismatch");
            return Err(AuthError::InvalidCredentials.into());
        }

        let issued = self.tokens.issue(user.id, user.role)?;
        tracing::info!(user_id = user.id, "token issued");
        Ok((issued, user))
    }

    pub async fn get_user(&self, user_id: i64) -> AppResult<User> {
        self.repository
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::InvalidCredentials.into())
    }
}
