use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header, web::Data, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Settings,
    errors::AppError,
    structs::{Role, User},
    AppState,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub tenant_id: String,
    pub jti: String,
    pub iss: String,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
}

/// HS256 signing and validation keys plus the fixed issuer/audience.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl JwtKeys {
    pub fn new(secret: &[u8], issuer: &str, audience: &str, ttl: Duration) -> Self {
        JwtKeys {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            ttl,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.jwt_secret.as_bytes(),
            &settings.jwt_issuer,
            &settings.jwt_audience,
            Duration::days(settings.jwt_ttl_days),
        )
    }

    pub fn issue(&self, user: &User) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            role: user.role.to_string(),
            tenant_id: user.tenant_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp() as usize,
            exp: (now + self.ttl).timestamp() as usize,
        };
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }

    /// Checks signature, expiry, issuer and audience.
    pub fn decode(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The caller identified by a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub tenant_id: Uuid,
}

impl AuthUser {
    pub fn from_claims(claims: Claims) -> Result<Self, AppError> {
        let invalid = || AppError::Unauthorized("Invalid token".into());
        Ok(AuthUser {
            user_id: Uuid::parse_str(&claims.sub).map_err(|_| invalid())?,
            email: claims.email,
            role: claims.role.parse().map_err(|_| invalid())?,
            tenant_id: Uuid::parse_str(&claims.tenant_id).map_err(|_| invalid())?,
        })
    }

    pub fn require_role(&self, role: Role) -> Result<(), AppError> {
        if self.role == role {
            Ok(())
        } else {
            log::warn!("User {} lacks role {}", self.user_id, role);
            Err(AppError::Forbidden(
                "You do not have permission to perform this action".into(),
            ))
        }
    }
}

fn extract(req: &HttpRequest) -> Result<AuthUser, AppError> {
    let state = req
        .app_data::<Data<AppState>>()
        .ok_or_else(|| AppError::Config("application state is not registered".into()))?;
    let token = bearer_token(req)
        .ok_or_else(|| AppError::Unauthorized("Missing or invalid Authorization header".into()))?;
    let claims = state.jwt.decode(token).map_err(|e| {
        log::debug!("Rejected bearer token: {}", e);
        AppError::Unauthorized("Invalid or expired token".into())
    })?;
    AuthUser::from_claims(claims)
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract(req))
    }
}
