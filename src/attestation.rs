// ABOUTME: Attestation gate tracking per-user, per-site acceptance of versioned consent text
// ABOUTME: A version bump re-gates every user of the site until they re-accept
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::constants::settings as keys;
use crate::database::SettingsStore;
use crate::errors::{AppError, AppResult};
use crate::models::{AttestationPrompt, AttestationRecord, ProviderConfig, UserProfile};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Gate interposed between successful provider authentication and host login.
///
/// State lives in the settings store under one key per (site, username) pair.
#[derive(Clone)]
pub struct AttestationGate {
    settings: Arc<dyn SettingsStore>,
}

impl AttestationGate {
    /// Create a gate over the settings store
    #[must_use]
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    fn record_key(site_id: &str, username: &str) -> String {
        format!("{}{site_id}:{username}", keys::ATTESTATION_PREFIX)
    }

    /// Stored acceptance for the pair, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn record(
        &self,
        username: &str,
        site_id: &str,
    ) -> AppResult<Option<AttestationRecord>> {
        match self
            .settings
            .get_setting(&Self::record_key(site_id, username))
            .await?
        {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| AppError::database(format!("corrupt attestation record: {e}"))),
            None => Ok(None),
        }
    }

    async fn version_pending(&self, site: &ProviderConfig, username: &str) -> AppResult<bool> {
        let Some(required) = site.attestation_version.as_deref() else {
            return Ok(false);
        };
        let accepted = self.record(username, &site.site_id).await?;
        Ok(accepted.is_none_or(|record| record.accepted_version != required))
    }

    /// Pre-login check, used during callback completion before any host
    /// session exists. The profile supplies the username.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn needs_attestation(
        &self,
        site: &ProviderConfig,
        profile: &UserProfile,
    ) -> AppResult<bool> {
        if profile.username.is_empty() {
            return Ok(false);
        }
        self.version_pending(site, &profile.username).await
    }

    /// Post-login check, used for already-authenticated local users being
    /// retroactively bound to a provider site.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn needs_attestation_local(
        &self,
        site: &ProviderConfig,
        username: &str,
    ) -> AppResult<bool> {
        self.version_pending(site, username).await
    }

    /// Record acceptance of a version. Idempotent: re-accepting the already
    /// stored version is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn record_acceptance(
        &self,
        username: &str,
        site_id: &str,
        version: &str,
    ) -> AppResult<()> {
        if let Some(existing) = self.record(username, site_id).await? {
            if existing.accepted_version == version {
                debug!(username, site_id, version, "attestation already accepted");
                return Ok(());
            }
        }
        let record = AttestationRecord {
            accepted_version: version.to_owned(),
            accepted_at: Utc::now(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| AppError::internal(format!("unserializable attestation record: {e}")))?;
        self.settings
            .set_setting(&Self::record_key(site_id, username), &value)
            .await
    }

    /// Remove all attestation state for a username on a site. Used by the
    /// user-deletion cascade.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn forget(&self, username: &str, site_id: &str) -> AppResult<()> {
        self.settings
            .remove_setting(&Self::record_key(site_id, username))
            .await
    }

    /// Build the consent-page payload for a suspension. `None` when the site
    /// carries no attestation version (nothing to present).
    #[must_use]
    pub fn prompt(
        site: &ProviderConfig,
        username: &str,
        profile: Option<UserProfile>,
        origin_url: &str,
    ) -> Option<AttestationPrompt> {
        let version = site.attestation_version.clone()?;
        Some(AttestationPrompt {
            username: username.to_owned(),
            site_id: site.site_id.clone(),
            version,
            text: site.attestation_text.clone(),
            profile,
            origin_url: origin_url.to_owned(),
        })
    }
}
