// ABOUTME: Audit logging for authentication events and account conversions
// ABOUTME: Emits structured tracing events and persists a row per event for later review
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::database::Database;
use crate::errors::{AppError, AppResult};
use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::Row;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Kinds of audit event the broker records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    /// Provider authentication completed and the session was marked
    LoginSuccess,
    /// Provider authentication failed (any taxonomy kind)
    LoginFailure,
    /// Callback arrived with a state token bound to a different session
    StateMismatch,
    /// Session destroyed via the logout flag
    Logout,
    /// Attestation version accepted
    AttestationAccepted,
    /// Account created from a provider profile
    UserProvisioned,
    /// Account converted between password-based and provider-bound
    UserConverted,
    /// Password-reset mail sent from the pending queue
    PasswordResetSent,
}

impl AuditKind {
    /// Stable string stored in the audit table
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::StateMismatch => "state_mismatch",
            Self::Logout => "logout",
            Self::AttestationAccepted => "attestation_accepted",
            Self::UserProvisioned => "user_provisioned",
            Self::UserConverted => "user_converted",
            Self::PasswordResetSent => "password_reset_sent",
        }
    }
}

/// Audit logger writing both to the structured log and the audit table.
///
/// Persistence failures are logged and swallowed: an audit-storage outage must
/// never block a login or logout.
pub struct AuditLogger {
    database: Arc<Database>,
}

impl AuditLogger {
    /// Create a logger over the shared database
    #[must_use]
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Record one event. `details` must not contain secrets or raw tokens.
    pub async fn record(&self, kind: AuditKind, username: Option<&str>, details: JsonValue) {
        info!(
            kind = kind.as_str(),
            username = username.unwrap_or("-"),
            %details,
            "audit event"
        );
        if let Err(e) = self.database.store_audit_event(kind, username, &details).await {
            warn!(kind = kind.as_str(), error = %e, "failed to persist audit event");
        }
    }

    /// Count events of a kind within the trailing window, for throttling.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn count_recent(&self, kind: AuditKind, window_secs: i64) -> AppResult<i64> {
        self.database.count_audit_events_since(kind, window_secs).await
    }
}

impl Database {
    /// Insert one audit row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn store_audit_event(
        &self,
        kind: AuditKind,
        username: Option<&str>,
        details: &JsonValue,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO audit_log (id, kind, username, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind.as_str())
        .bind(username)
        .bind(details.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to store audit event: {e}")))?;
        Ok(())
    }

    /// Count audit rows of one kind newer than the trailing window.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn count_audit_events_since(
        &self,
        kind: AuditKind,
        window_secs: i64,
    ) -> AppResult<i64> {
        let cutoff = Utc::now() - Duration::seconds(window_secs);
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM audit_log WHERE kind = $1 AND created_at > $2",
        )
        .bind(kind.as_str())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to count audit events: {e}")))?;
        let n: i64 = row.try_get("n")?;
        Ok(n)
    }
}
