// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The process-wide current environment.
//!
//! Only entry points (the binary, job handlers that cannot be handed an
//! environment) should go through here. Everything else takes an
//! `&Environment` or `Arc<Environment>` parameter.

use std::sync::{Arc, PoisonError, RwLock};

use crate::environment::Environment;
use crate::error::{Error, Result};

static CURRENT: RwLock<Option<Arc<Environment>>> = RwLock::new(None);

/// Install `env` as the current environment, returning the previous one.
pub fn set_environment(env: Arc<Environment>) -> Option<Arc<Environment>> {
    CURRENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(env)
}

/// The current environment.
pub fn environment() -> Result<Arc<Environment>> {
    CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::NoEnvironment)
}

/// Uninstall and return the current environment.
pub fn take_environment() -> Option<Arc<Environment>> {
    CURRENT.write().unwrap_or_else(PoisonError::into_inner).take()
}
