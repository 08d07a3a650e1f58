use actix_web::{
    error::JsonPayloadError,
    get,
    middleware::from_fn,
    post,
    web::{self, Data, Json},
    HttpRequest, HttpResponse,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    db,
    errors::AppError,
    structs::{AuthResponse, NewInvitation, NewTenant, NewUser, Role, Tenant, User, UserDto},
    tenant::{self, TenantContext},
    utils,
    validation::Checks,
    AppState,
};

const TWO_FACTOR_TTL_MINUTES: i64 = 10;
const RESET_TOKEN_TTL_HOURS: i64 = 1;
const INVITATION_TTL_DAYS: i64 = 7;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(
            web::scope("/api")
                .wrap(from_fn(tenant::resolve_tenant))
                .service(health_handler)
                .service(register_handler)
                .service(validate_email_handler)
                .service(login_handler)
                .service(verify_two_factor_handler)
                .service(forgot_password_handler)
                .service(reset_password_handler)
                .service(accept_invitation_handler)
                .service(enable_two_factor_handler)
                .service(disable_two_factor_handler)
                .service(me_handler)
                .service(invite_user_handler)
                .service(list_users_handler)
                .service(current_tenant_handler),
        );
}

fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    log::debug!("Rejected request body: {}", err);
    AppError::BadRequest(format!("Invalid request body: {}", err)).into()
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub tenant_name: String,
    pub enable_two_factor: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub two_factor_code: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VerifyTwoFactorRequest {
    pub email: String,
    pub password: String,
    pub two_factor_code: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
    /// Narrows the token lookup to one tenant when the reset link carried it.
    pub email: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AcceptInvitationRequest {
    pub token: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub enable_two_factor: bool,
}

#[derive(Deserialize, Debug)]
pub struct InviteUserRequest {
    #[serde(default)]
    pub email: String,
    pub role: Role,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EmailValidationResponse {
    pub exists: bool,
    pub two_factor_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// An active user together with its tenant and that tenant's pool.
struct Account {
    tenant: Tenant,
    pool: SqlitePool,
    user: User,
}

async fn find_account(state: &AppState, email: &str) -> Result<Option<Account>, AppError> {
    let Some(entry) = db::find_directory_entry(&state.db_pool, email).await? else {
        return Ok(None);
    };
    let Some(tenant) = db::get_active_tenant(&state.db_pool, entry.tenant_id).await? else {
        return Ok(None);
    };
    let pool = state.tenants.get(&tenant).await?;
    let user = db::get_user(&pool, entry.user_id)
        .await?
        .filter(|user| user.is_active);
    Ok(user.map(|user| Account { tenant, pool, user }))
}

/// Tenants whose database cannot be opened are skipped.
async fn find_account_by_reset_token(
    state: &AppState,
    token: &str,
) -> Result<Option<Account>, AppError> {
    for tenant in db::list_active_tenants(&state.db_pool).await? {
        let pool = match state.tenants.get(&tenant).await {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("Skipping tenant {}: {}", tenant.id, e);
                continue;
            }
        };
        if let Some(user) = db::find_user_by_reset_token(&pool, token).await? {
            return Ok(Some(Account { tenant, pool, user }));
        }
    }
    Ok(None)
}

async fn check_credentials(
    state: &AppState,
    email: &str,
    password: &str,
) -> Result<Account, AppError> {
    let invalid = || AppError::Unauthorized("Invalid credentials".into());
    let Some(account) = find_account(state, email).await? else {
        log::warn!("Login attempt for unknown or inactive account");
        return Err(invalid());
    };
    if !utils::verify_password(password, &account.user.pwd_hash)? {
        log::warn!("Invalid password for user {}", account.user.id);
        return Err(invalid());
    }
    Ok(account)
}

/// Consumes the stored 2FA code and issues a token.
async fn complete_two_factor(
    state: &AppState,
    account: Account,
    code: &str,
) -> Result<HttpResponse, AppError> {
    let user = &account.user;
    if !db::consume_two_factor_code(&account.pool, user.id, code, Utc::now()).await? {
        log::warn!("Invalid or expired 2FA code for user {}", user.id);
        return Err(AppError::Unauthorized("Invalid or expired 2FA code".into()));
    }

    let token = state.jwt.issue(user)?;
    log::info!(
        "User {} signed in to tenant {} with 2FA",
        user.id,
        account.tenant.id
    );
    Ok(HttpResponse::Ok().json(AuthResponse::authenticated(token, user)))
}

/// Deactivates a tenant whose registration could not be completed.
async fn abandon_tenant(state: &AppState, tenant_id: Uuid) {
    if let Err(e) = db::set_tenant_active(&state.db_pool, tenant_id, false).await {
        log::error!("Failed to deactivate tenant {}: {}", tenant_id, e);
    }
    state.tenants.evict(tenant_id).await;
}

async fn release_email(state: &AppState, email: &str) {
    if let Err(e) = db::delete_directory_entry(&state.db_pool, email).await {
        log::error!("Failed to release directory entry: {}", e);
    }
}

/// Reserves the admin's email and creates the admin in the new tenant's
/// database. On failure the reservation is released and the tenant deactivated.
async fn create_tenant_admin(
    state: &AppState,
    tenant: &Tenant,
    admin: NewUser,
) -> Result<User, AppError> {
    if let Err(e) = db::create_directory_entry(&state.db_pool, &admin.email, tenant.id, admin.id).await
    {
        abandon_tenant(state, tenant.id).await;
        return Err(e);
    }

    let created = async {
        let pool = state.tenants.get(tenant).await?;
        db::create_user(&pool, &admin).await
    }
    .await;
    if let Err(e) = &created {
        log::error!("Failed to create admin for tenant {}: {}", tenant.id, e);
        release_email(state, &admin.email).await;
        abandon_tenant(state, tenant.id).await;
    }
    created
}

#[get("/health")]
pub async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[post("/auth/register")]
pub async fn register_handler(
    state: Data<AppState>,
    Json(form): Json<RegisterRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new()
        .email("email", &form.email)
        .new_password("password", &form.password)
        .name("firstName", "First name", &form.first_name)
        .name("lastName", "Last name", &form.last_name)
        .name("tenantName", "Tenant name", &form.tenant_name)
        .finish()?;

    let email = utils::normalize_email(&form.email);
    if db::find_directory_entry(&state.db_pool, &email).await?.is_some() {
        return Err(AppError::Conflict("Email is already registered".into()));
    }
    let pwd_hash = utils::hash_password(&form.password)?;

    let tenant_id = Uuid::new_v4();
    let database_url = state.tenants.provision(tenant_id).await?;
    let tenant = db::create_tenant(
        &state.db_pool,
        &NewTenant {
            id: tenant_id,
            name: form.tenant_name.trim().to_owned(),
            api_key: utils::generate_api_key(),
            database_url,
        },
    )
    .await?;

    let user = create_tenant_admin(
        &state,
        &tenant,
        NewUser {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            email,
            first_name: form.first_name.trim().to_owned(),
            last_name: form.last_name.trim().to_owned(),
            role: Role::Admin,
            pwd_hash,
            two_factor_enabled: form.enable_two_factor,
        },
    )
    .await?;

    log::info!("Registered tenant {} with admin {}", tenant.id, user.id);
    state.mailer.send_welcome(&user.email, &user.full_name());

    let token = state.jwt.issue(&user)?;
    Ok(HttpResponse::Ok().json(AuthResponse::authenticated(token, &user).with_api_key(tenant.api_key)))
}

#[post("/auth/validate-email")]
pub async fn validate_email_handler(
    state: Data<AppState>,
    Json(form): Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new().email("email", &form.email).finish()?;

    let email = utils::normalize_email(&form.email);
    let body = match find_account(&state, &email).await? {
        Some(Account { user, .. }) => EmailValidationResponse {
            exists: true,
            two_factor_enabled: user.two_factor_enabled,
            first_name: Some(user.first_name),
            last_name: Some(user.last_name),
        },
        None => EmailValidationResponse {
            exists: false,
            two_factor_enabled: false,
            first_name: None,
            last_name: None,
        },
    };
    Ok(HttpResponse::Ok().json(body))
}

#[post("/auth/login")]
pub async fn login_handler(
    state: Data<AppState>,
    Json(form): Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    let code = form
        .two_factor_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty());
    let mut checks = Checks::new();
    checks
        .email("email", &form.email)
        .password_present("password", &form.password);
    if let Some(code) = code {
        checks.two_factor_code("twoFactorCode", code);
    }
    checks.finish()?;

    let email = utils::normalize_email(&form.email);
    let account = check_credentials(&state, &email, &form.password).await?;

    if account.user.two_factor_enabled {
        if let Some(code) = code {
            return complete_two_factor(&state, account, code).await;
        }
        let code = utils::generate_two_factor_code();
        let expiry = Utc::now() + Duration::minutes(TWO_FACTOR_TTL_MINUTES);
        db::set_two_factor_code(&account.pool, account.user.id, &code, expiry).await?;
        state.mailer.send_two_factor_code(&account.user.email, &code);
        log::info!("2FA code issued for user {}", account.user.id);
        return Ok(HttpResponse::Ok().json(AuthResponse::two_factor_pending(
            "2FA code sent to your email",
        )));
    }

    let token = state.jwt.issue(&account.user)?;
    log::info!(
        "User {} signed in to tenant {}",
        account.user.id,
        account.tenant.id
    );
    Ok(HttpResponse::Ok().json(AuthResponse::authenticated(token, &account.user)))
}

#[post("/auth/verify-2fa")]
pub async fn verify_two_factor_handler(
    state: Data<AppState>,
    Json(form): Json<VerifyTwoFactorRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new()
        .email("email", &form.email)
        .password_present("password", &form.password)
        .two_factor_code("twoFactorCode", form.two_factor_code.trim())
        .finish()?;

    let email = utils::normalize_email(&form.email);
    let account = check_credentials(&state, &email, &form.password).await?;
    complete_two_factor(&state, account, form.two_factor_code.trim()).await
}

#[post("/auth/forgot-password")]
pub async fn forgot_password_handler(
    state: Data<AppState>,
    Json(form): Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new().email("email", &form.email).finish()?;

    let email = utils::normalize_email(&form.email);
    let Some(account) = find_account(&state, &email).await? else {
        log::warn!("Password reset requested for unknown account");
        return Err(AppError::NotFound(
            "No account is registered with this email".into(),
        ));
    };

    let token = utils::generate_token();
    let expiry = Utc::now() + Duration::hours(RESET_TOKEN_TTL_HOURS);
    db::set_password_reset_token(&account.pool, account.user.id, &token, expiry).await?;
    state.mailer.send_password_reset(&account.user.email, &token);
    log::info!("Password reset issued for user {}", account.user.id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Password reset instructions have been sent to your email"
    })))
}

#[post("/auth/reset-password")]
pub async fn reset_password_handler(
    state: Data<AppState>,
    Json(form): Json<ResetPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new()
        .required("token", "Reset token is required", &form.token)
        .new_password("newPassword", &form.new_password)
        .finish()?;

    let token = form.token.trim();
    let email = form
        .email
        .as_deref()
        .map(utils::normalize_email)
        .filter(|email| !email.is_empty());
    let located = match email {
        Some(email) => find_account(&state, &email)
            .await?
            .filter(|account| account.user.password_reset_token.as_deref() == Some(token)),
        None => find_account_by_reset_token(&state, token).await?,
    };

    let invalid = || AppError::BadRequest("Invalid or expired reset token".into());
    let account = located.ok_or_else(invalid)?;
    match account.user.password_reset_token_expiry {
        Some(expiry) if expiry > Utc::now() => {}
        _ => {
            log::warn!("Expired reset token used for user {}", account.user.id);
            return Err(invalid());
        }
    }

    let pwd_hash = utils::hash_password(&form.new_password)?;
    // a concurrent reset may have consumed the token since it was read
    if !db::update_password(&account.pool, account.user.id, token, &pwd_hash, Utc::now()).await? {
        log::warn!("Reset token already used for user {}", account.user.id);
        return Err(invalid());
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Password has been reset successfully"
    })))
}

#[post("/auth/accept-invitation")]
pub async fn accept_invitation_handler(
    state: Data<AppState>,
    Json(form): Json<AcceptInvitationRequest>,
) -> Result<HttpResponse, AppError> {
    Checks::new()
        .required("token", "Invitation token is required", &form.token)
        .new_password("password", &form.password)
        .name("firstName", "First name", &form.first_name)
        .name("lastName", "Last name", &form.last_name)
        .finish()?;

    let invalid = || AppError::BadRequest("Invalid or expired invitation".into());
    let token = form.token.trim();
    let mut found = None;
    for tenant in db::list_active_tenants(&state.db_pool).await? {
        let pool = match state.tenants.get(&tenant).await {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("Skipping tenant {}: {}", tenant.id, e);
                continue;
            }
        };
        if let Some(invitation) = db::find_open_invitation_by_token(&pool, token).await? {
            found = Some((tenant, pool, invitation));
            break;
        }
    }
    let (tenant, pool, invitation) = found.ok_or_else(invalid)?;
    if invitation.is_expired(Utc::now()) {
        log::warn!("Expired invitation {} presented", invitation.id);
        return Err(invalid());
    }

    let email = invitation.email.clone();
    let pwd_hash = utils::hash_password(&form.password)?;
    let user_id = Uuid::new_v4();
    // the directory entry reserves the email across tenants
    db::create_directory_entry(&state.db_pool, &email, tenant.id, user_id).await?;

    let created = async {
        let mut tx = pool.begin().await?;
        let user = db::create_user(
            &mut *tx,
            &NewUser {
                id: user_id,
                tenant_id: tenant.id,
                email: email.clone(),
                first_name: form.first_name.trim().to_owned(),
                last_name: form.last_name.trim().to_owned(),
                role: invitation.role,
                pwd_hash,
                two_factor_enabled: form.enable_two_factor,
            },
        )
        .await?;
        db::mark_invitation_accepted(&mut *tx, invitation.id, Utc::now()).await?;
        tx.commit().await?;
        Ok::<_, AppError>(user)
    }
    .await;
    let user = match created {
        Ok(user) => user,
        Err(e) => {
            release_email(&state, &email).await;
            return Err(e);
        }
    };

    log::info!(
        "Invitation {} accepted by user {} in tenant {}",
        invitation.id,
        user.id,
        tenant.id
    );
    state.mailer.send_welcome(&user.email, &user.full_name());

    let token = state.jwt.issue(&user)?;
    Ok(HttpResponse::Ok().json(AuthResponse::authenticated(token, &user)))
}

async fn set_two_factor(
    user: AuthUser,
    ctx: TenantContext,
    enabled: bool,
) -> Result<HttpResponse, AppError> {
    ctx.authorize(&user)?;
    if !db::set_two_factor_enabled(&ctx.pool, user.user_id, enabled).await? {
        return Err(AppError::NotFound("User not found".into()));
    }
    log::info!("2FA set to {} for user {}", enabled, user.user_id);
    let message = if enabled {
        "Two-factor authentication enabled"
    } else {
        "Two-factor authentication disabled"
    };
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": message })))
}

#[post("/auth/enable-2fa")]
pub async fn enable_two_factor_handler(
    user: AuthUser,
    ctx: TenantContext,
) -> Result<HttpResponse, AppError> {
    set_two_factor(user, ctx, true).await
}

#[post("/auth/disable-2fa")]
pub async fn disable_two_factor_handler(
    user: AuthUser,
    ctx: TenantContext,
) -> Result<HttpResponse, AppError> {
    set_two_factor(user, ctx, false).await
}

#[get("/auth/me")]
pub async fn me_handler(user: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "userId": user.user_id,
        "email": user.email,
        "role": user.role,
        "tenantId": user.tenant_id,
    }))
}

#[post("/users/invite")]
pub async fn invite_user_handler(
    state: Data<AppState>,
    user: AuthUser,
    ctx: TenantContext,
    Json(form): Json<InviteUserRequest>,
) -> Result<HttpResponse, AppError> {
    user.require_role(Role::Admin)?;
    ctx.authorize(&user)?;
    Checks::new().email("email", &form.email).finish()?;

    let email = utils::normalize_email(&form.email);
    if db::find_directory_entry(&state.db_pool, &email).await?.is_some() {
        return Err(AppError::Conflict("User already exists".into()));
    }
    let now = Utc::now();
    if db::find_pending_invitation_for_email(&ctx.pool, &email, now)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(
            "A pending invitation already exists for this email".into(),
        ));
    }

    let inviter = db::get_user(&ctx.pool, user.user_id)
        .await?
        .map(|inviter| inviter.full_name())
        .unwrap_or_else(|| user.email.clone());
    let invitation = db::create_invitation(
        &ctx.pool,
        &NewInvitation {
            email,
            role: form.role,
            token: utils::generate_token(),
            invited_by: user.user_id,
            expires_at: now + Duration::days(INVITATION_TTL_DAYS),
        },
    )
    .await?;
    state
        .mailer
        .send_invitation(&invitation.email, &invitation.token, &inviter);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Invitation sent successfully"
    })))
}

#[get("/users")]
pub async fn list_users_handler(
    user: AuthUser,
    ctx: TenantContext,
) -> Result<HttpResponse, AppError> {
    user.require_role(Role::Admin)?;
    ctx.authorize(&user)?;
    let users = db::list_users(&ctx.pool).await?;
    let body: Vec<UserDto> = users.iter().map(UserDto::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

#[get("/tenant")]
pub async fn current_tenant_handler(ctx: TenantContext) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "id": ctx.tenant.id,
        "name": ctx.tenant.name,
        "resolvedBy": ctx.resolved_by,
    }))
}
