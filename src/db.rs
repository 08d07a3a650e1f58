use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqliteExecutor, SqlitePool,
};
use uuid::Uuid;

use crate::{
    errors::AppError,
    structs::{DirectoryEntry, Invitation, NewInvitation, NewTenant, NewUser, Tenant, User},
};

pub fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, AppError> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .read_only(false)
        .busy_timeout(std::time::Duration::from_secs(5)))
}

/// Opens (creating if needed) and migrates the master database.
pub async fn connect_master(database_url: &str) -> Result<SqlitePool, AppError> {
    let opts = connect_options(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(opts)
        .await?;
    sqlx::migrate!("./migrations/master").run(&pool).await?;
    log::info!("Master database migrated successfully");
    Ok(pool)
}

// ---- master database ----

pub async fn create_tenant(pool: &SqlitePool, tenant: &NewTenant) -> Result<Tenant, AppError> {
    let created = sqlx::query_as::<_, Tenant>(
        "INSERT INTO tenants (id, name, api_key, database_url, created_at, is_active) \
         VALUES ($1, $2, $3, $4, $5, 1) RETURNING *",
    )
    .bind(tenant.id)
    .bind(&tenant.name)
    .bind(&tenant.api_key)
    .bind(&tenant.database_url)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Tenant already exists"))?;
    log::info!("Tenant created: {} ({})", created.name, created.id);
    Ok(created)
}

pub async fn get_active_tenant(pool: &SqlitePool, id: Uuid) -> Result<Option<Tenant>, AppError> {
    let tenant =
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1 AND is_active = 1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(tenant)
}

pub async fn find_tenant_by_api_key(
    pool: &SqlitePool,
    api_key: &str,
) -> Result<Option<Tenant>, AppError> {
    let tenant =
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE api_key = $1 AND is_active = 1")
            .bind(api_key)
            .fetch_optional(pool)
            .await?;
    Ok(tenant)
}

pub async fn list_active_tenants(pool: &SqlitePool) -> Result<Vec<Tenant>, AppError> {
    let tenants = sqlx::query_as::<_, Tenant>(
        "SELECT * FROM tenants WHERE is_active = 1 ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;
    Ok(tenants)
}

pub async fn set_tenant_active(pool: &SqlitePool, id: Uuid, active: bool) -> Result<(), AppError> {
    sqlx::query("UPDATE tenants SET is_active = $1, updated_at = $2 WHERE id = $3")
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    log::info!("Tenant {} active = {}", id, active);
    Ok(())
}

pub async fn find_directory_entry(
    pool: &SqlitePool,
    email: &str,
) -> Result<Option<DirectoryEntry>, AppError> {
    let entry =
        sqlx::query_as::<_, DirectoryEntry>("SELECT * FROM user_directory WHERE email = $1")
            .bind(email)
            .fetch_optional(pool)
            .await?;
    Ok(entry)
}

pub async fn create_directory_entry(
    pool: &SqlitePool,
    email: &str,
    tenant_id: Uuid,
    user_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO user_directory (email, tenant_id, user_id, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(email)
    .bind(tenant_id)
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Email is already registered"))?;
    Ok(())
}

pub async fn delete_directory_entry(pool: &SqlitePool, email: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM user_directory WHERE email = $1")
        .bind(email)
        .execute(pool)
        .await?;
    Ok(())
}

// ---- tenant databases ----

pub async fn create_user<'e>(
    executor: impl SqliteExecutor<'e>,
    user: &NewUser,
) -> Result<User, AppError> {
    let created = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, tenant_id, email, first_name, last_name, role, pwd_hash, \
         two_factor_enabled, created_at, is_active) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1) RETURNING *",
    )
    .bind(user.id)
    .bind(user.tenant_id)
    .bind(&user.email)
    .bind(user.first_name.trim())
    .bind(user.last_name.trim())
    .bind(user.role.as_str())
    .bind(&user.pwd_hash)
    .bind(user.two_factor_enabled)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "Email is already registered"))?;
    log::info!("User {} created in tenant {}", created.id, created.tenant_id);
    Ok(created)
}

pub async fn get_user(pool: &SqlitePool, id: Uuid) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn find_user_by_reset_token(
    pool: &SqlitePool,
    token: &str,
) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE password_reset_token = $1 AND is_active = 1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>, AppError> {
    let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    Ok(users)
}

pub async fn set_two_factor_code(
    pool: &SqlitePool,
    user_id: Uuid,
    code: &str,
    expiry: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE users SET two_factor_code = $1, two_factor_code_expiry = $2, updated_at = $3 \
         WHERE id = $4",
    )
    .bind(code)
    .bind(expiry)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clears the user's 2FA code if it is `code` and unexpired at `now`.
/// Of concurrent callers presenting the same code, exactly one gets `true`.
pub async fn consume_two_factor_code(
    pool: &SqlitePool,
    user_id: Uuid,
    code: &str,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE users SET two_factor_code = NULL, two_factor_code_expiry = NULL, \
         updated_at = $1 WHERE id = $2 AND two_factor_code = $3 \
         AND two_factor_code_expiry > $4",
    )
    .bind(now)
    .bind(user_id)
    .bind(code)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Returns `false` when no such user exists.
pub async fn set_two_factor_enabled(
    pool: &SqlitePool,
    user_id: Uuid,
    enabled: bool,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE users SET two_factor_enabled = $1, two_factor_code = NULL, \
         two_factor_code_expiry = NULL, updated_at = $2 WHERE id = $3 AND is_active = 1",
    )
    .bind(enabled)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_password_reset_token(
    pool: &SqlitePool,
    user_id: Uuid,
    token: &str,
    expiry: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE users SET password_reset_token = $1, password_reset_token_expiry = $2, \
         updated_at = $3 WHERE id = $4",
    )
    .bind(token)
    .bind(expiry)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stores a new hash if `token` is still the user's unexpired reset token,
/// consuming the token. `false` means the token was already used or expired.
pub async fn update_password(
    pool: &SqlitePool,
    user_id: Uuid,
    token: &str,
    pwd_hash: &str,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE users SET pwd_hash = $1, password_reset_token = NULL, \
         password_reset_token_expiry = NULL, updated_at = $2 WHERE id = $3 \
         AND password_reset_token = $4 AND password_reset_token_expiry > $5",
    )
    .bind(pwd_hash)
    .bind(now)
    .bind(user_id)
    .bind(token)
    .bind(now)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    log::info!("Password updated for user {}", user_id);
    Ok(true)
}

pub async fn create_invitation(
    pool: &SqlitePool,
    invitation: &NewInvitation,
) -> Result<Invitation, AppError> {
    let created = sqlx::query_as::<_, Invitation>(
        "INSERT INTO invitations (id, email, role, token, invited_by, created_at, expires_at, \
         is_accepted) VALUES ($1, $2, $3, $4, $5, $6, $7, 0) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&invitation.email)
    .bind(invitation.role.as_str())
    .bind(&invitation.token)
    .bind(invitation.invited_by)
    .bind(Utc::now())
    .bind(invitation.expires_at)
    .fetch_one(pool)
    .await?;
    log::info!("Invitation {} created by {}", created.id, created.invited_by);
    Ok(created)
}

/// Unaccepted invitation carrying `token`, expired or not.
pub async fn find_open_invitation_by_token(
    pool: &SqlitePool,
    token: &str,
) -> Result<Option<Invitation>, AppError> {
    let invitation = sqlx::query_as::<_, Invitation>(
        "SELECT * FROM invitations WHERE token = $1 AND is_accepted = 0",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    Ok(invitation)
}

pub async fn find_pending_invitation_for_email(
    pool: &SqlitePool,
    email: &str,
    now: DateTime<Utc>,
) -> Result<Option<Invitation>, AppError> {
    let open = sqlx::query_as::<_, Invitation>(
        "SELECT * FROM invitations WHERE email = $1 AND is_accepted = 0",
    )
    .bind(email)
    .fetch_all(pool)
    .await?;
    Ok(open.into_iter().find(|invitation| !invitation.is_expired(now)))
}

pub async fn mark_invitation_accepted<'e>(
    executor: impl SqliteExecutor<'e>,
    id: Uuid,
    accepted_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE invitations SET is_accepted = 1, accepted_at = $1 WHERE id = $2")
        .bind(accepted_at)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        structs::Role,
        testing::{TestState, PASSWORD},
        utils,
    };
    use chrono::Duration;

    async fn tenant(t: &TestState) -> (Tenant, SqlitePool) {
        let id = Uuid::new_v4();
        let database_url = t.state.tenants.provision(id).await.unwrap();
        let tenant = create_tenant(
            &t.state.db_pool,
            &NewTenant {
                id,
                name: "acme".into(),
                api_key: utils::generate_api_key(),
                database_url,
            },
        )
        .await
        .unwrap();
        let pool = t.state.tenants.get(&tenant).await.unwrap();
        (tenant, pool)
    }

    fn invitation(email: &str, expires_at: DateTime<Utc>) -> NewInvitation {
        NewInvitation {
            email: email.into(),
            role: Role::User,
            token: utils::generate_token(),
            invited_by: Uuid::new_v4(),
            expires_at,
        }
    }

    #[actix_web::test]
    async fn directory_rejects_duplicate_emails() {
        let t = TestState::new().await;
        let (tenant, _) = tenant(&t).await;
        create_directory_entry(&t.state.db_pool, "a@b.io", tenant.id, Uuid::new_v4())
            .await
            .unwrap();
        let err = create_directory_entry(&t.state.db_pool, "a@b.io", tenant.id, Uuid::new_v4())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Conflict(_)));

        delete_directory_entry(&t.state.db_pool, "a@b.io").await.unwrap();
        assert!(find_directory_entry(&t.state.db_pool, "a@b.io")
            .await
            .unwrap()
            .is_none());
    }

    #[actix_web::test]
    async fn inactive_tenants_are_hidden() {
        let t = TestState::new().await;
        let (tenant, _) = tenant(&t).await;
        assert_eq!(list_active_tenants(&t.state.db_pool).await.unwrap().len(), 1);

        set_tenant_active(&t.state.db_pool, tenant.id, false).await.unwrap();
        assert!(get_active_tenant(&t.state.db_pool, tenant.id)
            .await
            .unwrap()
            .is_none());
        assert!(find_tenant_by_api_key(&t.state.db_pool, &tenant.api_key)
            .await
            .unwrap()
            .is_none());
        assert!(list_active_tenants(&t.state.db_pool).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn password_update_clears_reset_token() {
        let t = TestState::new().await;
        let (tenant, pool) = tenant(&t).await;
        let user = t.user_in(&tenant, "a@b.io", Role::User).await;
        assert!(utils::verify_password(PASSWORD, &user.pwd_hash).unwrap());

        set_password_reset_token(&pool, user.id, "tok", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        let found = find_user_by_reset_token(&pool, "tok").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);

        assert!(!update_password(&pool, user.id, "other", "new-hash", Utc::now())
            .await
            .unwrap());
        assert!(update_password(&pool, user.id, "tok", "new-hash", Utc::now())
            .await
            .unwrap());
        assert!(find_user_by_reset_token(&pool, "tok").await.unwrap().is_none());
        let user = get_user(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(user.pwd_hash, "new-hash");
        assert!(user.password_reset_token_expiry.is_none());

        assert!(!update_password(&pool, user.id, "tok", "again", Utc::now())
            .await
            .unwrap());
    }

    #[actix_web::test]
    async fn expired_reset_token_leaves_password_alone() {
        let t = TestState::new().await;
        let (tenant, pool) = tenant(&t).await;
        let user = t.user_in(&tenant, "a@b.io", Role::User).await;
        let now = Utc::now();
        set_password_reset_token(&pool, user.id, "tok", now - Duration::seconds(1))
            .await
            .unwrap();

        assert!(!update_password(&pool, user.id, "tok", "new-hash", now)
            .await
            .unwrap());
        let stored = get_user(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(stored.pwd_hash, user.pwd_hash);
    }

    #[actix_web::test]
    async fn two_factor_code_is_consumed_once() {
        let t = TestState::new().await;
        let (tenant, pool) = tenant(&t).await;
        let user = t.user_in(&tenant, "a@b.io", Role::User).await;
        let now = Utc::now();
        set_two_factor_code(&pool, user.id, "123456", now + Duration::minutes(10))
            .await
            .unwrap();

        assert!(!consume_two_factor_code(&pool, user.id, "654321", now).await.unwrap());
        assert!(consume_two_factor_code(&pool, user.id, "123456", now).await.unwrap());
        assert!(!consume_two_factor_code(&pool, user.id, "123456", now).await.unwrap());
    }

    #[actix_web::test]
    async fn expired_two_factor_code_is_not_consumed() {
        let t = TestState::new().await;
        let (tenant, pool) = tenant(&t).await;
        let user = t.user_in(&tenant, "a@b.io", Role::User).await;
        let now = Utc::now();
        set_two_factor_code(&pool, user.id, "123456", now - Duration::minutes(1))
            .await
            .unwrap();

        assert!(!consume_two_factor_code(&pool, user.id, "123456", now).await.unwrap());
    }

    #[actix_web::test]
    async fn toggling_two_factor_drops_pending_code() {
        let t = TestState::new().await;
        let (tenant, pool) = tenant(&t).await;
        let user = t.user_in(&tenant, "a@b.io", Role::User).await;
        set_two_factor_code(&pool, user.id, "123456", Utc::now())
            .await
            .unwrap();

        assert!(set_two_factor_enabled(&pool, user.id, true).await.unwrap());
        let user = get_user(&pool, user.id).await.unwrap().unwrap();
        assert!(user.two_factor_enabled);
        let code: Option<String> =
            sqlx::query_scalar("SELECT two_factor_code FROM users WHERE id = $1")
                .bind(user.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(code.is_none());

        assert!(!set_two_factor_enabled(&pool, Uuid::new_v4(), true).await.unwrap());
    }

    #[actix_web::test]
    async fn pending_invitations_ignore_expired_and_accepted() {
        let t = TestState::new().await;
        let (_, pool) = tenant(&t).await;
        let now = Utc::now();
        let stale = create_invitation(&pool, &invitation("x@b.io", now - Duration::days(1)))
            .await
            .unwrap();
        assert!(find_pending_invitation_for_email(&pool, "x@b.io", now)
            .await
            .unwrap()
            .is_none());
        assert!(find_open_invitation_by_token(&pool, &stale.token)
            .await
            .unwrap()
            .is_some());

        let live = create_invitation(&pool, &invitation("x@b.io", now + Duration::days(7)))
            .await
            .unwrap();
        let pending = find_pending_invitation_for_email(&pool, "x@b.io", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.id, live.id);

        mark_invitation_accepted(&pool, live.id, now).await.unwrap();
        let (accepted, accepted_at): (bool, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT is_accepted, accepted_at FROM invitations WHERE id = $1")
                .bind(live.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(accepted);
        assert_eq!(accepted_at, Some(now));
        assert!(find_open_invitation_by_token(&pool, &live.token)
            .await
            .unwrap()
            .is_none());
    }
}
