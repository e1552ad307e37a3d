// ABOUTME: SQLite persistence layer and the collaborator traits the broker core consumes
// ABOUTME: Defines the settings store and user directory contracts plus schema migration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::errors::{AppError, AppResult};
use crate::models::UserRecord;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

mod settings;
mod users;

/// Simple externally-synchronized key/value store.
///
/// Keys are a stable prefix plus a username or site id; values are JSON so
/// array-valued settings (the multi-provider site list) fit naturally.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read a setting, `None` when unset
    async fn get_setting(&self, key: &str) -> AppResult<Option<JsonValue>>;

    /// Write a setting, overwriting any previous value
    async fn set_setting(&self, key: &str, value: &JsonValue) -> AppResult<()>;

    /// Remove a setting; removing an absent key is a no-op
    async fn remove_setting(&self, key: &str) -> AppResult<()>;
}

/// The host's user directory, as far as the broker needs it.
///
/// Password credentials live in their own table; a row's existence is what
/// makes a username a password-based account.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fetch one user record
    async fn get_user(&self, username: &str) -> AppResult<Option<UserRecord>>;

    /// Insert a new user record
    async fn insert_user(&self, record: &UserRecord) -> AppResult<()>;

    /// Update name and email fields of an existing record
    async fn update_user(
        &self,
        username: &str,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> AppResult<()>;

    /// Remove the password credential row, if any
    async fn delete_credential(&self, username: &str) -> AppResult<()>;

    /// Insert a password credential row in reset-pending state
    async fn insert_credential(&self, username: &str) -> AppResult<()>;

    /// Whether a password credential row exists for this username
    async fn is_password_user(&self, username: &str) -> AppResult<bool>;

    /// How many of the given usernames already have a password credential
    async fn password_credential_count(&self, usernames: &[String]) -> AppResult<i64>;

    /// Remove password credentials for all given usernames in one transaction
    async fn delete_credentials(&self, usernames: &[String]) -> AppResult<()>;

    /// Insert reset-pending credentials for all given usernames in one
    /// transaction
    async fn insert_credentials(&self, usernames: &[String]) -> AppResult<()>;

    /// Allow-list membership test
    async fn in_allowlist(&self, username: &str) -> AppResult<bool>;

    /// Add a username to the allow-list
    async fn add_to_allowlist(&self, username: &str) -> AppResult<()>;

    /// Record a successful login time
    async fn set_last_login(&self, username: &str) -> AppResult<()>;

    /// All usernames in the directory, ordered
    async fn list_usernames(&self) -> AppResult<Vec<String>>;

    /// Mark a username as needing a password-reset mail
    async fn queue_password_reset(&self, username: &str) -> AppResult<()>;

    /// Usernames currently queued for a password-reset mail
    async fn pending_password_resets(&self) -> AppResult<Vec<String>>;

    /// Clear a queued password-reset marker
    async fn clear_password_reset(&self, username: &str) -> AppResult<()>;
}

/// SQLite database holding broker settings, the user directory tables, the
/// allow-list, and the audit log.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (and create if missing) the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or the pool cannot connect.
    pub async fn new(database_url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::config(format!("invalid database url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| AppError::database(format!("failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Create the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                email_verify_code TEXT NOT NULL DEFAULT '',
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_login TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS password_credentials (
                username TEXT PRIMARY KEY,
                reset_pending INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS user_allowlist (username TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                username TEXT,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS password_reset_queue (
                username TEXT PRIMARY KEY,
                requested_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
