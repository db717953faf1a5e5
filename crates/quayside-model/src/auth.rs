// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User managers.
//!
//! A deployment authenticates either against a directory service or against
//! the static user list in the settings document. The choice is made once,
//! by [`UserManager::from_settings`], and never revisited per request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::{ModelError, Result};
use crate::settings::{ServiceSettings, StaticUser};
use crate::users::{
    Clock, Identity, LoginCache, LoginCacheEntry, TOKEN_TTL, TokenLookup, find_user,
    generate_token,
};

/// Seam to an external directory service.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Verify credentials and return the directory's view of the user.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity>;
}

/// The configured way of authenticating users.
pub enum UserManager {
    /// Directory-backed users with tokens in the login cache.
    Directory(DirectoryUserManager),
    /// Users declared in the settings document.
    Static(StaticUserManager),
}

impl std::fmt::Debug for UserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserManager::Directory(_) => f.write_str("UserManager::Directory"),
            UserManager::Static(m) => write!(f, "UserManager::Static({} users)", m.users.len()),
        }
    }
}

impl UserManager {
    /// Select a manager from the settings document.
    ///
    /// A configured directory wins over static auth and requires a client.
    /// Returns `None` when neither is configured.
    pub fn from_settings(
        settings: &ServiceSettings,
        pool: SqlitePool,
        directory: Option<Arc<dyn DirectoryClient>>,
    ) -> Result<Option<Self>> {
        if settings.directory.is_configured() {
            let client = directory.ok_or_else(|| {
                ModelError::InvalidSettings(
                    "directory url is set but no directory client is available".to_string(),
                )
            })?;
            return Ok(Some(UserManager::Directory(DirectoryUserManager::new(
                client,
                LoginCache::new(pool),
            ))));
        }

        if settings.static_auth.enabled {
            return Ok(Some(UserManager::Static(StaticUserManager::new(
                &settings.static_auth.users,
            ))));
        }

        Ok(None)
    }

    /// Verify credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Identity> {
        match self {
            UserManager::Directory(m) => m.client.authenticate(username, password).await,
            UserManager::Static(m) => m.authenticate(username, password),
        }
    }

    /// Verify credentials and return a login token.
    pub async fn create_user_token(&self, username: &str, password: &str) -> Result<String> {
        match self {
            UserManager::Directory(m) => m.create_user_token(username, password).await,
            UserManager::Static(m) => m.create_user_token(username, password),
        }
    }

    /// Resolve a login token to a user. Unknown and expired tokens are
    /// authentication failures.
    pub async fn user_by_token(&self, token: &str) -> Result<Identity> {
        match self {
            UserManager::Directory(m) => m.user_by_token(token).await,
            UserManager::Static(m) => m.user_by_token(token),
        }
    }

    /// Resolve an API user and key pair.
    pub async fn user_by_api_key(&self, username: &str, key: &str) -> Result<Identity> {
        match self {
            UserManager::Directory(m) => m.user_by_api_key(username, key).await,
            UserManager::Static(m) => m.user_by_api_key(username, key),
        }
    }
}

/// Directory-backed manager.
pub struct DirectoryUserManager {
    client: Arc<dyn DirectoryClient>,
    cache: LoginCache,
}

impl DirectoryUserManager {
    /// Build from a directory client and the login cache.
    pub fn new(client: Arc<dyn DirectoryClient>, cache: LoginCache) -> Self {
        Self { client, cache }
    }

    /// The underlying login cache.
    pub fn cache(&self) -> &LoginCache {
        &self.cache
    }

    async fn create_user_token(&self, username: &str, password: &str) -> Result<String> {
        let identity = self.client.authenticate(username, password).await?;
        let user = self.cache.get_or_create(&identity).await?;
        self.cache.issue_or_refresh(&user.id).await
    }

    async fn user_by_token(&self, token: &str) -> Result<Identity> {
        match self.cache.lookup(token).await? {
            TokenLookup::Valid(user) => Ok(user.into()),
            TokenLookup::Expired(user) => {
                debug!(user = %user.id, "Rejected expired login token");
                Err(ModelError::Authentication("login token expired".to_string()))
            }
            TokenLookup::NotFound => {
                Err(ModelError::Authentication("unknown login token".to_string()))
            }
        }
    }

    async fn user_by_api_key(&self, username: &str, key: &str) -> Result<Identity> {
        let user = match find_user(self.cache.pool(), username).await {
            Ok(user) => user,
            Err(e) if e.is_not_found() => {
                return Err(ModelError::Authentication("unknown api user".to_string()));
            }
            Err(e) => return Err(e),
        };

        if user.api_key.is_empty() || user.api_key != key {
            return Err(ModelError::Authentication("invalid api key".to_string()));
        }
        Ok(user.into())
    }
}

/// Manager over the static user list. Tokens live in memory only.
pub struct StaticUserManager {
    users: HashMap<String, StaticUser>,
    tokens: DashMap<String, LoginCacheEntry>,
    clock: Clock,
    ttl: TimeDelta,
}

impl StaticUserManager {
    /// Build from the configured users.
    pub fn new(users: &[StaticUser]) -> Self {
        Self {
            users: users.iter().map(|u| (u.id.clone(), u.clone())).collect(),
            tokens: DashMap::new(),
            clock: Arc::new(Utc::now),
            ttl: TimeDelta::from_std(TOKEN_TTL).unwrap_or(TimeDelta::hours(1)),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn identity(user: &StaticUser) -> Identity {
        Identity {
            id: user.id.clone(),
            display_name: user.name.clone(),
            email: user.email.clone(),
            roles: user.roles.clone(),
        }
    }

    fn active_user(&self, username: &str) -> Result<&StaticUser> {
        match self.users.get(username) {
            Some(user) if !user.invalid => Ok(user),
            Some(_) => {
                warn!(user = %username, "Rejected disabled static user");
                Err(ModelError::Authentication("user is disabled".to_string()))
            }
            None => Err(ModelError::Authentication("unknown user".to_string())),
        }
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<Identity> {
        let user = self.active_user(username)?;
        if user.password.is_empty() || user.password != password {
            return Err(ModelError::Authentication("invalid credentials".to_string()));
        }
        Ok(Self::identity(user))
    }

    fn create_user_token(&self, username: &str, password: &str) -> Result<String> {
        self.authenticate(username, password)?;
        let now = (self.clock)();

        let entry = self
            .tokens
            .entry(username.to_string())
            .and_modify(|entry| entry.refreshed_at = now)
            .or_insert_with(|| LoginCacheEntry {
                token: generate_token(),
                refreshed_at: now,
            });
        Ok(entry.token.clone())
    }

    fn user_by_token(&self, token: &str) -> Result<Identity> {
        let now = (self.clock)();
        let found = self
            .tokens
            .iter()
            .find(|item| item.value().token == token)
            .map(|item| (item.key().clone(), item.value().is_valid_at(now, self.ttl)));

        match found {
            Some((username, true)) => Ok(Self::identity(self.active_user(&username)?)),
            Some((username, false)) => {
                self.tokens.remove(&username);
                Err(ModelError::Authentication("login token expired".to_string()))
            }
            None => Err(ModelError::Authentication("unknown login token".to_string())),
        }
    }

    fn user_by_api_key(&self, username: &str, key: &str) -> Result<Identity> {
        let user = self.active_user(username)?;
        if user.key.is_empty() || user.key != key {
            return Err(ModelError::Authentication("invalid api key".to_string()));
        }
        Ok(Self::identity(user))
    }
}
