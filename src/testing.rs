use std::sync::Arc;

use chrono::Duration;
use tempfile::TempDir;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::JwtKeys,
    db,
    mailer::{Mailer, MemoryOutbox},
    structs::{NewUser, Role, Tenant, User},
    tenant::TenantPools,
    utils, AppState,
};

pub const PASSWORD: &str = "Passw0rd!";

/// Application state over throwaway databases and a capturing mailbox.
pub struct TestState {
    pub state: AppState,
    pub outbox: Arc<MemoryOutbox>,
    _dir: TempDir,
}

impl TestState {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let master_url = format!("sqlite://{}", dir.path().join("master.db").display());
        let db_pool = db::connect_master(&master_url).await.unwrap();
        let outbox = Arc::new(MemoryOutbox::default());
        let state = AppState {
            db_pool,
            tenants: TenantPools::new(dir.path().join("tenants")),
            jwt: JwtKeys::new(
                b"0123456789abcdef0123456789abcdef",
                "tenant-gate",
                "tenant-gate-app",
                Duration::days(7),
            ),
            mailer: Mailer::new(outbox.clone(), Url::parse("http://localhost:4200").unwrap()),
        };
        TestState {
            state,
            outbox,
            _dir: dir,
        }
    }

    /// Inserts an active user (password [`PASSWORD`]) and its directory entry.
    pub async fn user_in(&self, tenant: &Tenant, email: &str, role: Role) -> User {
        let pool = self.state.tenants.get(tenant).await.unwrap();
        let user = db::create_user(
            &pool,
            &NewUser {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                email: email.to_owned(),
                first_name: "Test".into(),
                last_name: "User".into(),
                role,
                pwd_hash: utils::hash_password(PASSWORD).unwrap(),
                two_factor_enabled: false,
            },
        )
        .await
        .unwrap();
        db::create_directory_entry(&self.state.db_pool, email, tenant.id, user.id)
            .await
            .unwrap();
        user
    }
}
