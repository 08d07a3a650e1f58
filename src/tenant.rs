//! Tenant resolution and the per-request tenant database context.
//!
//! Every tenant owns a separate SQLite database. [`resolve_tenant`] runs in
//! front of the API routes and works out which tenant a request belongs to:
//!
//! 1. an `X-API-Key` header naming an active tenant,
//! 2. otherwise the `tenant_id` claim of a valid bearer token,
//! 3. otherwise no tenant; routes that need one reject the request.
//!
//! The resolved [`TenantContext`] (tenant row plus a pool for its database)
//! is stored in the request extensions and extracted by handlers.

use std::{
    collections::HashMap,
    future::{ready, Ready},
    path::PathBuf,
    sync::Arc,
};

use actix_web::{
    body::{EitherBody, MessageBody},
    dev::{Payload, ServiceRequest, ServiceResponse},
    middleware::Next,
    web::Data,
    Error, FromRequest, HttpMessage, HttpRequest, ResponseError,
};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    auth::{bearer_token, AuthUser},
    db,
    errors::AppError,
    structs::Tenant,
    AppState,
};

pub const API_KEY_HEADER: &str = "X-API-Key";

const TENANT_POOL_SIZE: u32 = 5;

/// Lazily opened connection pools, one per tenant database.
#[derive(Clone)]
pub struct TenantPools {
    data_dir: PathBuf,
    pools: Arc<RwLock<HashMap<Uuid, SqlitePool>>>,
}

impl TenantPools {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        TenantPools {
            data_dir: data_dir.into(),
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn database_url(&self, tenant_id: Uuid) -> String {
        let path = self.data_dir.join(format!("tenant_{}.db", tenant_id.simple()));
        format!("sqlite://{}", path.display())
    }

    async fn open(database_url: &str, create: bool) -> Result<SqlitePool, AppError> {
        let opts = db::connect_options(database_url)?.create_if_missing(create);
        let pool = SqlitePoolOptions::new()
            .max_connections(TENANT_POOL_SIZE)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations/tenant").run(&pool).await?;
        Ok(pool)
    }

    async fn remember(&self, tenant_id: Uuid, pool: SqlitePool) -> SqlitePool {
        let mut pools = self.pools.write().await;
        // a concurrent first use may have won the race; keep its pool
        pools.entry(tenant_id).or_insert(pool).clone()
    }

    /// Creates and migrates the database of a new tenant, returning its URL.
    pub async fn provision(&self, tenant_id: Uuid) -> Result<String, AppError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let database_url = self.database_url(tenant_id);
        log::info!("Creating database for tenant {}", tenant_id);
        let pool = Self::open(&database_url, true).await.map_err(|e| {
            log::error!("Failed to provision database for tenant {}: {}", tenant_id, e);
            e
        })?;
        self.remember(tenant_id, pool).await;
        Ok(database_url)
    }

    /// Pool for `tenant`'s database, opened (and migrated) on first use.
    pub async fn get(&self, tenant: &Tenant) -> Result<SqlitePool, AppError> {
        if let Some(pool) = self.pools.read().await.get(&tenant.id) {
            return Ok(pool.clone());
        }
        log::debug!("Opening database for tenant {}", tenant.id);
        let pool = Self::open(&tenant.database_url, false).await?;
        Ok(self.remember(tenant.id, pool).await)
    }

    /// Drops the cached pool; the next `get` reopens the database.
    pub async fn evict(&self, tenant_id: Uuid) {
        if let Some(pool) = self.pools.write().await.remove(&tenant_id) {
            pool.close().await;
        }
    }

    #[cfg(test)]
    pub async fn is_open(&self, tenant_id: Uuid) -> bool {
        self.pools.read().await.contains_key(&tenant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolvedBy {
    ApiKey,
    Token,
}

/// The tenant a request is scoped to and a pool for its database.
#[derive(Clone)]
pub struct TenantContext {
    pub tenant: Tenant,
    pub pool: SqlitePool,
    pub resolved_by: ResolvedBy,
}

impl TenantContext {
    /// Rejects callers whose token was issued for a different tenant.
    pub fn authorize(&self, user: &AuthUser) -> Result<(), AppError> {
        if user.tenant_id == self.tenant.id {
            Ok(())
        } else {
            log::warn!(
                "User {} of tenant {} addressed tenant {}",
                user.user_id,
                user.tenant_id,
                self.tenant.id
            );
            Err(AppError::Forbidden("Access to this tenant is not allowed".into()))
        }
    }
}

/// Resolution without the HTTP layer: API key first, then the token claim.
pub async fn resolve(
    state: &AppState,
    api_key: Option<&str>,
    bearer: Option<&str>,
) -> Result<Option<TenantContext>, AppError> {
    if let Some(key) = api_key {
        let tenant = db::find_tenant_by_api_key(&state.db_pool, key)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid API key".into()))?;
        let pool = state.tenants.get(&tenant).await?;
        return Ok(Some(TenantContext {
            tenant,
            pool,
            resolved_by: ResolvedBy::ApiKey,
        }));
    }

    let Some(token) = bearer else {
        return Ok(None);
    };
    // bad tokens are left for the auth extractor to reject
    let Some(tenant_id) = state
        .jwt
        .decode(token)
        .ok()
        .and_then(|claims| Uuid::parse_str(&claims.tenant_id).ok())
    else {
        return Ok(None);
    };

    let tenant = db::get_active_tenant(&state.db_pool, tenant_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Tenant not found or inactive".into()))?;
    let pool = state.tenants.get(&tenant).await?;
    Ok(Some(TenantContext {
        tenant,
        pool,
        resolved_by: ResolvedBy::Token,
    }))
}

/// Middleware attaching the [`TenantContext`] to the request, if any.
///
/// Resolution failures end the request here with the error's JSON body.
pub async fn resolve_tenant<B: MessageBody>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, Error> {
    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());
    let bearer = bearer_token(req.request()).map(str::to_owned);

    let resolved = match req.app_data::<Data<AppState>>().cloned() {
        Some(state) => resolve(&state, api_key.as_deref(), bearer.as_deref()).await,
        None => Err(AppError::Config("application state is not registered".into())),
    };
    match resolved {
        Ok(Some(ctx)) => {
            log::debug!(
                "Request scoped to tenant {} via {:?}",
                ctx.tenant.id,
                ctx.resolved_by
            );
            req.extensions_mut().insert(ctx);
        }
        Ok(None) => {}
        Err(e) => {
            log::debug!("Tenant resolution failed: {}", e);
            let (req, _) = req.into_parts();
            let resp = e.error_response();
            return Ok(ServiceResponse::new(req, resp).map_into_right_body());
        }
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

impl FromRequest for TenantContext {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<TenantContext>()
                .cloned()
                .ok_or(AppError::TenantUnresolved),
        )
    }
}
