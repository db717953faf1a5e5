// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User records and the login cache.
//!
//! Every user row can carry one login token plus the time it was last
//! refreshed. The token is generated once, on the first login, and then kept
//! until it is explicitly cleared; later logins only move the refresh time
//! forward. Validity is computed at lookup time against [`TOKEN_TTL`].
//!
//! ```text
//! Unset ──login──▶ Issued ──login──▶ Refreshed ──lookup──▶ Valid | Expired
//!   ▲                                                         │
//!   └──────────────────────────── clear ──────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{ModelError, Result};

/// Lifetime of a login token. Also the session cookie lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Cookie carrying the login token.
pub const AUTH_TOKEN_COOKIE: &str = "quayside-token";

/// Header naming the API user.
pub const API_USER_HEADER: &str = "Api-User";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "Api-Key";

const TOKEN_BYTES: usize = 32;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Generate an unpredictable hex token from the OS random source.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Login token plus its last refresh time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCacheEntry {
    /// Opaque bearer token.
    pub token: String,
    /// Last time the token was issued or refreshed.
    pub refreshed_at: DateTime<Utc>,
}

impl LoginCacheEntry {
    /// Whether the token is still fresh at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.refreshed_at < ttl
    }
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name.
    pub id: String,
    /// Human readable name, may be empty.
    pub display_name: String,
    /// Email address.
    pub email: String,
    /// When the profile was first stored.
    pub created_at: DateTime<Utc>,
    /// API key, empty until one is generated.
    pub api_key: String,
    /// Granted roles.
    pub roles: Vec<String>,
    /// Cached login token, if any.
    pub login_cache: Option<LoginCacheEntry>,
}

impl User {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Identity supplied by an external authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Login name.
    pub id: String,
    /// Human readable name.
    pub display_name: String,
    /// Email address.
    pub email: String,
    /// Granted roles.
    pub roles: Vec<String>,
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name,
            email: user.email,
            roles: user.roles,
        }
    }
}

/// Outcome of a token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLookup {
    /// No user carries this token.
    NotFound,
    /// The token belongs to this user but is past its TTL.
    Expired(User),
    /// The token belongs to this user and is fresh.
    Valid(User),
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    display_name: String,
    email: String,
    created_at: DateTime<Utc>,
    api_key: String,
    roles: String,
    login_token: Option<String>,
    login_refreshed_at: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for User {
    type Error = ModelError;

    fn try_from(row: UserRow) -> Result<Self> {
        let login_cache = match (row.login_token, row.login_refreshed_at) {
            (Some(token), Some(refreshed_at)) if !token.is_empty() => Some(LoginCacheEntry {
                token,
                refreshed_at,
            }),
            _ => None,
        };

        Ok(User {
            id: row.id,
            display_name: row.display_name,
            email: row.email,
            created_at: row.created_at,
            api_key: row.api_key,
            roles: serde_json::from_str(&row.roles)?,
            login_cache,
        })
    }
}

const USER_COLUMNS: &str = "id, display_name, email, created_at, api_key, roles, login_token, login_refreshed_at";

/// Load a user by id.
pub async fn find_user(pool: &SqlitePool, id: &str) -> Result<User> {
    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {} FROM users WHERE id = ?",
        USER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None => Err(ModelError::not_found("user", id)),
    }
}

/// Insert or replace a user profile, including its login cache.
pub async fn save_user(pool: &SqlitePool, user: &User) -> Result<()> {
    let (token, refreshed_at) = match &user.login_cache {
        Some(entry) => (Some(entry.token.as_str()), Some(entry.refreshed_at)),
        None => (None, None),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO users (id, display_name, email, created_at, api_key, roles, login_token, login_refreshed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            display_name = excluded.display_name,
            email = excluded.email,
            api_key = excluded.api_key,
            roles = excluded.roles,
            login_token = excluded.login_token,
            login_refreshed_at = excluded.login_refreshed_at
        "#,
    )
    .bind(&user.id)
    .bind(&user.display_name)
    .bind(&user.email)
    .bind(user.created_at)
    .bind(&user.api_key)
    .bind(serde_json::to_string(&user.roles)?)
    .bind(token)
    .bind(refreshed_at)
    .execute(pool)
    .await?;

    if result.rows_affected() != 1 {
        return Err(ModelError::unexpected_rows(
            "save_user",
            1,
            result.rows_affected(),
        ));
    }

    Ok(())
}

/// Generate and store a fresh API key for a user, returning it.
pub async fn set_api_key(pool: &SqlitePool, id: &str) -> Result<String> {
    let key = generate_token();
    let result = sqlx::query("UPDATE users SET api_key = ? WHERE id = ?")
        .bind(&key)
        .bind(id)
        .execute(pool)
        .await?;

    match result.rows_affected() {
        0 => Err(ModelError::not_found("user", id)),
        1 => Ok(key),
        n => Err(ModelError::unexpected_rows("set_api_key", 1, n)),
    }
}

/// Token store for externally authenticated users.
#[derive(Clone)]
pub struct LoginCache {
    pool: SqlitePool,
    clock: Clock,
    ttl: TimeDelta,
}

impl std::fmt::Debug for LoginCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LoginCache {
    /// Login cache over the users table, using wall-clock time.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(Utc::now),
            ttl: TimeDelta::from_std(TOKEN_TTL).unwrap_or(TimeDelta::hours(1)),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Token time-to-live.
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// Pool backing the users table.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Issue a token for the user, or keep the existing one and bump its
    /// refresh time. Returns the token.
    pub async fn issue_or_refresh(&self, user_id: &str) -> Result<String> {
        let user = find_user(&self.pool, user_id).await?;
        let now = self.now();

        let candidate = match user.login_cache {
            Some(entry) => entry.token,
            None => generate_token(),
        };

        // COALESCE keeps a token set by a concurrent login.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET login_token = COALESCE(NULLIF(login_token, ''), ?), login_refreshed_at = ?
            WHERE id = ?
            RETURNING login_token
            "#,
        )
        .bind(&candidate)
        .bind(now)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((token,)) => {
                debug!(user = %user_id, "Login token refreshed");
                Ok(token)
            }
            None => Err(ModelError::unexpected_rows("update_login_cache", 1, 0)),
        }
    }

    /// Resolve a token to its user.
    pub async fn lookup(&self, token: &str) -> Result<TokenLookup> {
        if token.is_empty() {
            return Ok(TokenLookup::NotFound);
        }

        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE login_token = ?",
            USER_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(TokenLookup::NotFound);
        };
        let user = User::try_from(row)?;

        let fresh = user
            .login_cache
            .as_ref()
            .is_some_and(|entry| entry.is_valid_at(self.now(), self.ttl));

        if fresh {
            Ok(TokenLookup::Valid(user))
        } else {
            Ok(TokenLookup::Expired(user))
        }
    }

    /// Load a user and report whether its login token is fresh.
    pub async fn get_user(&self, user_id: &str) -> Result<(User, bool)> {
        let user = find_user(&self.pool, user_id).await?;
        let valid = user
            .login_cache
            .as_ref()
            .is_some_and(|entry| entry.is_valid_at(self.now(), self.ttl));
        Ok((user, valid))
    }

    /// Drop the login token of one user.
    pub async fn clear(&self, user_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET login_token = NULL, login_refreshed_at = NULL WHERE id = ?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ModelError::unexpected_rows(
                "clear_login_cache",
                1,
                result.rows_affected(),
            ));
        }

        info!(user = %user_id, "Login cache cleared");
        Ok(())
    }

    /// Drop every login token. Returns the number of users affected.
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users SET login_token = NULL, login_refreshed_at = NULL
            WHERE login_token IS NOT NULL OR login_refreshed_at IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(users = result.rows_affected(), "Login cache cleared for all users");
        Ok(result.rows_affected())
    }

    /// Return the stored profile for the identity, creating it with a fresh
    /// token when missing. Never overwrites an existing profile.
    pub async fn get_or_create(&self, identity: &Identity) -> Result<User> {
        match find_user(&self.pool, &identity.id).await {
            Ok(user) => return Ok(user),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let now = self.now();
        let user = User {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            email: identity.email.clone(),
            created_at: now,
            api_key: String::new(),
            roles: identity.roles.clone(),
            login_cache: Some(LoginCacheEntry {
                token: generate_token(),
                refreshed_at: now,
            }),
        };
        let token = user.login_cache.as_ref().map(|entry| entry.token.as_str());

        let result = sqlx::query(
            r#"
            INSERT INTO users (id, display_name, email, created_at, api_key, roles, login_token, login_refreshed_at)
            VALUES (?, ?, ?, ?, '', ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&user.id)
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(now)
        .bind(serde_json::to_string(&user.roles)?)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race with another login for the same identity.
            return find_user(&self.pool, &identity.id).await;
        }

        info!(user = %user.id, "Created user profile");
        Ok(user)
    }
}
