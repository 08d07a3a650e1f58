use std::{env, path::PathBuf};

use url::Url;

use crate::errors::AppError;

/// Runtime settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub tenant_data_dir: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_ttl_days: i64,
    pub app_url: Url,
    pub bind_addr: String,
    pub port: u16,
    pub static_dir: PathBuf,
}

const MIN_SECRET_LEN: usize = 32;

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let jwt_secret = lookup("JWT_SECRET")
            .ok_or_else(|| AppError::Config("JWT_SECRET environment variable not set".into()))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(AppError::Config(format!(
                "JWT_SECRET must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let jwt_ttl_days = var_or("JWT_TTL_DAYS", "7")
            .parse::<i64>()
            .ok()
            .filter(|days| *days > 0)
            .ok_or_else(|| AppError::Config("JWT_TTL_DAYS must be a positive integer".into()))?;

        let port = var_or("PORT", "8080")
            .parse::<u16>()
            .map_err(|e| AppError::Config(format!("PORT is invalid: {}", e)))?;

        let app_url = Url::parse(&var_or("APP_URL", "http://localhost:4200"))
            .map_err(|e| AppError::Config(format!("APP_URL is invalid: {}", e)))?;

        Ok(Settings {
            database_url: var_or("DATABASE_URL", "sqlite://master.db"),
            tenant_data_dir: PathBuf::from(var_or("TENANT_DATA_DIR", "tenants")),
            jwt_secret,
            jwt_issuer: var_or("JWT_ISSUER", "tenant-gate"),
            jwt_audience: var_or("JWT_AUDIENCE", "tenant-gate-app"),
            jwt_ttl_days,
            app_url,
            bind_addr: var_or("BIND_ADDR", "0.0.0.0"),
            port,
            static_dir: PathBuf::from(var_or("STATIC_DIR", "static")),
        })
    }
}
