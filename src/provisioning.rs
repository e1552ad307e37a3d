// ABOUTME: User provisioning and account linking between password-based and provider-bound auth
// ABOUTME: Bulk conversions are transactional - either every username converts or none do
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::audit::{AuditKind, AuditLogger};
use crate::constants::{settings as keys, RESET_MAIL_LIMIT, RESET_MAIL_WINDOW_SECS};
use crate::database::{SettingsStore, UserDirectory};
use crate::errors::AppResult;
use crate::mailer::PasswordResetMailer;
use crate::models::{AuthSource, UserProfile, UserRecord};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a bulk account conversion. The batch is all-or-nothing: when any
/// username blocks it, nothing was changed.
#[derive(Debug, Clone, Default)]
pub struct BulkConversionOutcome {
    /// Usernames converted (empty when the batch aborted)
    pub converted: Vec<String>,
    /// Usernames that blocked the batch, with nothing converted
    pub blocked: Vec<String>,
}

impl BulkConversionOutcome {
    /// True when the whole batch went through
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// Creates local accounts from provider profiles and moves accounts between
/// the password-based and provider-bound worlds.
#[derive(Clone)]
pub struct UserProvisioner {
    directory: Arc<dyn UserDirectory>,
    settings: Arc<dyn SettingsStore>,
    audit: Arc<AuditLogger>,
}

impl UserProvisioner {
    /// Create a provisioner over the directory and settings store
    #[must_use]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        settings: Arc<dyn SettingsStore>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            directory,
            settings,
            audit,
        }
    }

    fn binding_key(username: &str) -> String {
        format!("{}{username}", keys::USER_BINDING_PREFIX)
    }

    /// Which mechanism currently owns this username.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores fail.
    pub async fn auth_source(&self, username: &str) -> AppResult<AuthSource> {
        if let Some(value) = self
            .settings
            .get_setting(&Self::binding_key(username))
            .await?
        {
            if let Some(site_id) = value.as_str() {
                if !site_id.is_empty() {
                    return Ok(AuthSource::Provider {
                        site_id: site_id.to_owned(),
                    });
                }
            }
        }
        if self.directory.is_password_user(username).await? {
            return Ok(AuthSource::LocalPassword);
        }
        if self.directory.in_allowlist(username).await? {
            return Ok(AuthSource::Allowlisted);
        }
        Ok(AuthSource::Unknown)
    }

    /// Set or clear the provider binding for a username.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn set_provider_binding(
        &self,
        username: &str,
        site_id: Option<&str>,
    ) -> AppResult<()> {
        match site_id {
            Some(site_id) => {
                self.settings
                    .set_setting(&Self::binding_key(username), &json!(site_id))
                    .await
            }
            None => {
                self.settings
                    .remove_setting(&Self::binding_key(username))
                    .await
            }
        }
    }

    /// Remove every broker setting attached to a username. Used by the
    /// user-deletion cascade; callers log but never propagate failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store fails.
    pub async fn forget_user(&self, username: &str) -> AppResult<()> {
        self.settings
            .remove_setting(&Self::binding_key(username))
            .await
    }

    /// Whether the username exists in the host directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory fails.
    pub async fn user_exists(&self, username: &str) -> AppResult<bool> {
        Ok(self.directory.get_user(username).await?.is_some())
    }

    /// Create a local account from a provider profile.
    ///
    /// Returns `Ok(false)` without touching the directory when the profile is
    /// missing any of first name, last name, or email; the caller decides
    /// whether that is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory insert fails.
    pub async fn create_user(&self, username: &str, profile: &UserProfile) -> AppResult<bool> {
        if profile.first_name.is_empty() || profile.last_name.is_empty() || profile.email.is_empty()
        {
            warn!(username, "profile incomplete; not creating user");
            return Ok(false);
        }
        let record = UserRecord {
            username: username.to_owned(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            email: profile.email.clone(),
            email_verify_code: String::new(),
            is_admin: false,
            created_at: Utc::now(),
        };
        self.directory.insert_user(&record).await?;
        self.audit
            .record(
                AuditKind::UserProvisioned,
                Some(username),
                json!({ "email": profile.email }),
            )
            .await;
        Ok(true)
    }

    /// Convert a password-based account to a provider-bound one. Destructive:
    /// the password credential row is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or settings store fails.
    pub async fn convert_to_provider_user(&self, username: &str, site_id: &str) -> AppResult<()> {
        if username.is_empty() {
            return Ok(());
        }
        self.directory.delete_credential(username).await?;
        self.set_provider_binding(username, Some(site_id)).await?;
        self.audit
            .record(
                AuditKind::UserConverted,
                Some(username),
                json!({ "to": "provider", "site_id": site_id }),
            )
            .await;
        Ok(())
    }

    /// Convert a provider-bound account back to a password-based one: insert
    /// a reset-pending credential, send the reset notice, clear the binding.
    ///
    /// Returns `Ok(false)` when the username is not provider-bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or settings store fails.
    pub async fn convert_to_local_user(
        &self,
        username: &str,
        mailer: &dyn PasswordResetMailer,
    ) -> AppResult<bool> {
        if username.is_empty() {
            return Ok(false);
        }
        let AuthSource::Provider { .. } = self.auth_source(username).await? else {
            return Ok(false);
        };
        self.directory.insert_credential(username).await?;
        if let Some(user) = self.directory.get_user(username).await? {
            if let Err(e) = mailer.send_reset(username, &user.email).await {
                warn!(username, error = %e, "password-reset notice failed to send");
            }
        }
        self.set_provider_binding(username, None).await?;
        self.audit
            .record(
                AuditKind::UserConverted,
                Some(username),
                json!({ "to": "local" }),
            )
            .await;
        Ok(true)
    }

    /// Bulk convert password-based accounts to provider-bound ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the transactional credential delete fails; no
    /// bindings are written in that case.
    pub async fn convert_all_to_provider_users(
        &self,
        usernames: &[String],
        site_id: &str,
    ) -> AppResult<()> {
        if usernames.is_empty() {
            return Ok(());
        }
        self.directory.delete_credentials(usernames).await?;
        for username in usernames {
            self.set_provider_binding(username, Some(site_id)).await?;
        }
        self.audit
            .record(
                AuditKind::UserConverted,
                None,
                json!({ "to": "provider", "site_id": site_id, "count": usernames.len() }),
            )
            .await;
        Ok(())
    }

    /// Bulk convert provider-bound accounts to password-based ones.
    ///
    /// All-or-nothing: if any target already has a password credential the
    /// whole batch aborts and the outcome names the blocking usernames.
    /// Reset notices are queued for the sweep, not sent inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores fail mid-check or mid-insert.
    pub async fn convert_all_to_local_users(
        &self,
        usernames: &[String],
    ) -> AppResult<BulkConversionOutcome> {
        if usernames.is_empty() {
            return Ok(BulkConversionOutcome::default());
        }
        let existing = self.directory.password_credential_count(usernames).await?;
        if existing > 0 {
            let mut blocked = Vec::new();
            for username in usernames {
                if self.directory.is_password_user(username).await? {
                    blocked.push(username.clone());
                }
            }
            warn!(?blocked, "bulk convert-to-local aborted; targets already password-based");
            return Ok(BulkConversionOutcome {
                converted: Vec::new(),
                blocked,
            });
        }
        self.directory.insert_credentials(usernames).await?;
        for username in usernames {
            self.directory.queue_password_reset(username).await?;
        }
        self.audit
            .record(
                AuditKind::UserConverted,
                None,
                json!({ "to": "local", "count": usernames.len() }),
            )
            .await;
        Ok(BulkConversionOutcome {
            converted: usernames.to_vec(),
            blocked: Vec::new(),
        })
    }

    /// Sweep the pending password-reset queue, sending at most the throttle
    /// budget per window. Successful sends clear the marker and the provider
    /// binding; failures stay queued for the next sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or the throttle counted.
    pub async fn send_password_reset_emails(
        &self,
        mailer: &dyn PasswordResetMailer,
    ) -> AppResult<usize> {
        let pending = self.directory.pending_password_resets().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let recent = self
            .audit
            .count_recent(AuditKind::PasswordResetSent, RESET_MAIL_WINDOW_SECS)
            .await?;
        if recent >= RESET_MAIL_LIMIT {
            info!(pending = pending.len(), "reset-mail throttle reached; deferring sweep");
            return Ok(0);
        }
        let budget = usize::try_from(RESET_MAIL_LIMIT - recent).unwrap_or(0);

        let mut sent = 0;
        for username in pending.iter().take(budget) {
            let email = self
                .directory
                .get_user(username)
                .await?
                .map(|u| u.email)
                .unwrap_or_default();
            match mailer.send_reset(username, &email).await {
                Ok(()) => {
                    self.audit
                        .record(
                            AuditKind::PasswordResetSent,
                            Some(username.as_str()),
                            JsonValue::Null,
                        )
                        .await;
                    self.directory.clear_password_reset(username).await?;
                    self.set_provider_binding(username, None).await?;
                    sent += 1;
                }
                Err(e) => {
                    warn!(%username, error = %e, "reset notice failed; will retry next sweep");
                }
            }
        }
        Ok(sent)
    }
}
