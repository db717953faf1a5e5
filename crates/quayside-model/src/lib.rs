// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quayside Model - persisted documents of the quayside service
//!
//! Everything here lives in the service database (SQLite via sqlx) and is
//! independent of the in-memory environment:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`settings`] | The service settings document, created with defaults on first read |
//! | [`flags`] | Closed set of operational feature flags and their persistence |
//! | [`users`] | User profiles and the TTL-based login cache |
//! | [`auth`] | Directory-backed or static user managers |
//! | [`migrations`] | Embedded schema migrations |
//!
//! # Login cache
//!
//! One token per user. The token survives refreshes and only its timestamp
//! moves; [`users::LoginCache::lookup`] answers with
//! [`TokenLookup::NotFound`], [`TokenLookup::Expired`] or
//! [`TokenLookup::Valid`], computed against [`TOKEN_TTL`].

#![warn(missing_docs)]

/// Directory and static user managers.
pub mod auth;

/// Error types.
pub mod error;

/// Operational feature flags.
pub mod flags;

/// Embedded database migrations.
pub mod migrations;

/// Service settings document.
pub mod settings;

/// User profiles and login cache.
pub mod users;

pub use auth::{DirectoryClient, UserManager};
pub use error::{ModelError, Result};
pub use flags::{FeatureFlag, FeatureFlags};
pub use settings::{SETTINGS_ID, ServiceSettings};
pub use users::{
    API_KEY_HEADER, API_USER_HEADER, AUTH_TOKEN_COOKIE, Identity, LoginCache, TOKEN_TTL,
    TokenLookup, User,
};
