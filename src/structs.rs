use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(String);

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::User => "User",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Admin" => Ok(Role::Admin),
            "User" => Ok(Role::User),
            other => Err(UnknownRole(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnknownRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Row of the master `tenants` table.
#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,
    pub database_url: String,
}

/// Global email -> tenant mapping kept in the master database.
#[derive(Debug, Clone, FromRow)]
pub struct DirectoryEntry {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

/// Row of a tenant database's `users` table.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub pwd_hash: String,
    pub two_factor_enabled: bool,
    pub password_reset_token: Option<String>,
    pub password_reset_token_expiry: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_owned()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Invitation {
    pub id: Uuid,
    pub email: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub token: String,
    pub invited_by: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct NewTenant {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,
    pub database_url: String,
}

pub struct NewUser {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub pwd_hash: String,
    pub two_factor_enabled: bool,
}

pub struct NewInvitation {
    pub email: String,
    pub role: Role,
    pub token: String,
    pub invited_by: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Public view of a user.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub two_factor_enabled: bool,
}

impl From<&User> for UserDto {
    fn from(user: &User) -> Self {
        UserDto {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role,
            two_factor_enabled: user.two_factor_enabled,
        }
    }
}

/// Body returned by register, login, verify-2fa and accept-invitation.
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub requires_two_factor: bool,
    pub two_factor_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserDto>,
}

impl AuthResponse {
    pub fn authenticated(token: String, user: &User) -> Self {
        AuthResponse {
            success: true,
            token: Some(token),
            user_id: Some(user.id),
            email: Some(user.email.clone()),
            first_name: Some(user.first_name.clone()),
            last_name: Some(user.last_name.clone()),
            role: Some(user.role),
            tenant_id: Some(user.tenant_id),
            user: Some(UserDto::from(user)),
            ..Default::default()
        }
    }

    pub fn two_factor_pending(message: &str) -> Self {
        AuthResponse {
            success: false,
            message: Some(message.to_owned()),
            requires_two_factor: true,
            two_factor_required: true,
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn role_parses_and_prints() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::try_from("User".to_string()).unwrap(), Role::User);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(Role::Admin.to_string(), "Admin");
    }

    #[test]
    fn two_factor_pending_response_shape() {
        let value = serde_json::to_value(AuthResponse::two_factor_pending("code sent")).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["twoFactorRequired"], true);
        assert_eq!(value["requiresTwoFactor"], true);
        assert!(value.get("token").is_none());
    }

    #[test]
    fn invitation_expiry_is_inclusive() {
        let now = Utc::now();
        let invitation = Invitation {
            id: Uuid::new_v4(),
            email: "a@b.io".into(),
            role: Role::User,
            token: "t".into(),
            invited_by: Uuid::new_v4(),
            expires_at: now,
        };
        assert!(invitation.is_expired(now));
        assert!(!invitation.is_expired(now - Duration::seconds(1)));
    }
}
