// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persisted service settings document.
//!
//! A single JSON document, addressed by [`SETTINGS_ID`], holds everything
//! operators can change at runtime: feature flags, alerting sinks, directory
//! (LDAP) connection settings, the static user list, and storage credentials
//! for artifact publishing. The document is read once at service setup and
//! again on every cron tick.
//!
//! A missing document is not an error: [`ServiceSettings::find_or_create`]
//! persists and returns the default document instead.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{ModelError, Result};
use crate::flags::FeatureFlags;

/// Well-known id of the settings document.
pub const SETTINGS_ID: &str = "quayside-service-settings";

/// Service-wide settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Document id; always [`SETTINGS_ID`] once saved.
    pub id: String,
    /// Alert and log forwarding sinks.
    pub alerting: AlertingSettings,
    /// Operational feature flags.
    pub flags: FeatureFlags,
    /// Directory service connection settings.
    pub directory: DirectorySettings,
    /// Static user list for deployments without a directory.
    pub static_auth: StaticAuthSettings,
    /// Artifact workspace and per-destination credentials.
    pub artifacts: ArtifactSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            id: SETTINGS_ID.to_string(),
            alerting: AlertingSettings::default(),
            flags: FeatureFlags::default(),
            directory: DirectorySettings::default(),
            static_auth: StaticAuthSettings::default(),
            artifacts: ArtifactSettings::default(),
        }
    }
}

impl ServiceSettings {
    /// Load the settings document, creating and persisting the default
    /// document when none exists.
    pub async fn find_or_create(pool: &SqlitePool) -> Result<Self> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM service_settings WHERE id = ?")
                .bind(SETTINGS_ID)
                .fetch_optional(pool)
                .await?;

        match row {
            Some((document,)) => Ok(serde_json::from_str(&document)?),
            None => {
                let mut settings = Self::default();
                settings.save(pool).await?;
                info!(id = SETTINGS_ID, "Created default service settings");
                Ok(settings)
            }
        }
    }

    /// Persist the whole document.
    ///
    /// An empty id is filled in with [`SETTINGS_ID`]; any other id is rejected.
    pub async fn save(&mut self, pool: &SqlitePool) -> Result<()> {
        if self.id.is_empty() {
            self.id = SETTINGS_ID.to_string();
        }

        if self.id != SETTINGS_ID {
            return Err(ModelError::InvalidSettings(format!(
                "settings id '{}' is unexpected",
                self.id
            )));
        }

        let document = serde_json::to_string(self)?;
        let result = sqlx::query(
            r#"
            INSERT INTO service_settings (id, document, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE
            SET document = excluded.document, updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.id)
        .bind(document)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ModelError::unexpected_rows(
                "save_settings",
                1,
                result.rows_affected(),
            ));
        }

        Ok(())
    }

    /// Check that every configured sink is complete.
    pub fn validate(&self) -> Result<()> {
        self.alerting.validate()
    }
}

/// Alert and log forwarding sinks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSettings {
    /// HTTP log collector (Splunk-style event endpoint).
    pub log_sink: Option<LogSinkSettings>,
    /// Chat alerts.
    pub slack: Option<SlackSettings>,
}

impl AlertingSettings {
    fn validate(&self) -> Result<()> {
        if let Some(sink) = &self.log_sink {
            if sink.url.is_empty() || sink.token.is_empty() {
                return Err(ModelError::InvalidSettings(
                    "log sink requires both url and token".to_string(),
                ));
            }
        }

        if let Some(slack) = &self.slack {
            if slack.channel.is_empty() {
                return Err(ModelError::InvalidSettings(
                    "slack alerts require a channel".to_string(),
                ));
            }
            if slack.token.is_empty() || slack.level.is_empty() {
                return Err(ModelError::InvalidSettings(
                    "slack alerts require a token and a threshold level".to_string(),
                ));
            }
            tracing::Level::from_str(&slack.level).map_err(|_| {
                ModelError::InvalidSettings(format!("unknown slack level '{}'", slack.level))
            })?;
        }

        Ok(())
    }
}

/// HTTP log collector settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkSettings {
    /// Collector endpoint.
    pub url: String,
    /// Collector token.
    pub token: String,
    /// Index or channel to write to.
    pub channel: String,
}

/// Chat alert settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    /// Channel receiving alerts.
    pub channel: String,
    /// API token.
    pub token: String,
    /// Minimum level forwarded (`error`, `warn`, ...).
    pub level: String,
}

/// Directory service (LDAP) connection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Server URL; directory auth is enabled iff this is set.
    pub url: String,
    /// Server port.
    pub port: String,
    /// Base path for user entries.
    pub user_path: String,
    /// Base path for service accounts.
    pub service_path: String,
    /// Group required for users.
    pub user_group: String,
    /// Group required for service accounts.
    pub service_group: String,
}

impl DirectorySettings {
    /// Whether a directory server is configured.
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Static user list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticAuthSettings {
    /// Whether static auth is enabled.
    pub enabled: bool,
    /// Known users.
    pub users: Vec<StaticUser>,
}

/// A user declared directly in the settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticUser {
    /// Login name.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Password.
    pub password: String,
    /// API key.
    pub key: String,
    /// Granted roles.
    pub roles: Vec<String>,
    /// Disabled users cannot log in.
    pub invalid: bool,
}

/// Artifact workspace and storage credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Local workspace path for artifact builds.
    pub path: String,
    /// Credentials per destination bucket.
    pub buckets: Vec<BucketCredentials>,
}

impl ArtifactSettings {
    /// Find the credentials for a named destination.
    pub fn bucket(&self, name: &str) -> Result<&BucketCredentials> {
        self.buckets
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| ModelError::not_found("bucket", name))
    }
}

/// Storage credentials for one destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketCredentials {
    /// Bucket name.
    pub name: String,
    /// Access key.
    pub key: String,
    /// Secret key.
    pub secret: String,
    /// Session token.
    pub token: String,
}
