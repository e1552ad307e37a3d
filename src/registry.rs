// ABOUTME: Provider site registry resolving configured sites by site-id or auth-value
// ABOUTME: Site ids are generated once, never regenerated, and are the only stable foreign key
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::constants::settings as keys;
use crate::database::SettingsStore;
use crate::errors::{AppError, AppResult};
use crate::models::ProviderConfig;
use rand::RngCore;
use std::sync::Arc;
use tracing::warn;

/// Read-side lookup over the configured provider sites.
///
/// Configuration itself is written by the admin surface through the settings
/// store; the registry's only mutation is [`assign_site_ids`](Self::assign_site_ids),
/// which the admin surface must invoke once after saving.
#[derive(Clone)]
pub struct ProviderRegistry {
    settings: Arc<dyn SettingsStore>,
}

impl ProviderRegistry {
    /// Create a registry over the settings store
    #[must_use]
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    /// All configured sites, in configuration order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Configuration` when the stored site list is corrupt.
    pub async fn list_all(&self) -> AppResult<Vec<ProviderConfig>> {
        match self.settings.get_setting(keys::SITES).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AppError::config(format!("malformed site list: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Resolve a site by its opaque id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Configuration` when the stored site list is corrupt.
    pub async fn get_by_site_id(&self, site_id: &str) -> AppResult<Option<ProviderConfig>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|site| site.site_id == site_id))
    }

    /// Resolve a site by its short auth-type token.
    ///
    /// Duplicate auth-values are a configuration error tolerated by taking
    /// the first match in configuration order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Configuration` when the stored site list is corrupt.
    pub async fn get_by_auth_value(&self, auth_value: &str) -> AppResult<Option<ProviderConfig>> {
        let sites = self.list_all().await?;
        let matches: Vec<&ProviderConfig> = sites
            .iter()
            .filter(|site| site.auth_value == auth_value)
            .collect();
        if matches.len() > 1 {
            warn!(auth_value, "duplicate auth-value configured; taking first match");
        }
        Ok(matches.first().map(|site| (*site).clone()))
    }

    /// True only when the id resolves to a currently configured site.
    /// Rejects stale and forged site ids.
    pub async fn verify_site_id(&self, site_id: &str) -> bool {
        if site_id.is_empty() {
            return false;
        }
        matches!(self.get_by_site_id(site_id).await, Ok(Some(_)))
    }

    /// Generate-if-absent site ids for every configured site and persist the
    /// list. Existing ids are never regenerated. Called by the admin surface
    /// exactly once after each configuration save.
    ///
    /// # Errors
    ///
    /// Returns an error when the site list cannot be read or written back.
    pub async fn assign_site_ids(&self) -> AppResult<()> {
        let mut sites = self.list_all().await?;
        let mut changed = false;
        for site in &mut sites {
            if site.site_id.is_empty() {
                site.site_id = generate_site_id();
                changed = true;
            }
        }
        if changed {
            let value = serde_json::to_value(&sites)
                .map_err(|e| AppError::internal(format!("unserializable site list: {e}")))?;
            self.settings.set_setting(keys::SITES, &value).await?;
        }
        Ok(())
    }
}

/// 16 random bytes, hex-encoded
#[must_use]
pub fn generate_site_id() -> String {
    let mut bytes = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
