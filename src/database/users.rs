// ABOUTME: User directory database operations
// ABOUTME: Implements user records, password credentials, allow-list, and reset-queue queries
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{Database, UserDirectory};
use crate::errors::{AppError, AppResult};
use crate::models::UserRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> AppResult<UserRecord> {
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| AppError::database(format!("bad created_at column: {e}")))?;
    Ok(UserRecord {
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        email_verify_code: row.try_get("email_verify_code")?,
        is_admin: row.try_get("is_admin")?,
        created_at,
    })
}

#[async_trait]
impl UserDirectory for Database {
    async fn get_user(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(
            r"
            SELECT username, first_name, last_name, email, email_verify_code,
                   is_admin, created_at
            FROM users WHERE username = $1
            ",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to fetch user: {e}")))?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn insert_user(&self, record: &UserRecord) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO users (
                username, first_name, last_name, email, email_verify_code,
                is_admin, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(&record.username)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.email)
        .bind(&record.email_verify_code)
        .bind(record.is_admin)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to insert user: {e}")))?;
        Ok(())
    }

    async fn update_user(
        &self,
        username: &str,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE users SET first_name = $2, last_name = $3, email = $4
            WHERE username = $1
            ",
        )
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to update user: {e}")))?;
        Ok(())
    }

    async fn delete_credential(&self, username: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM password_credentials WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to delete credential: {e}")))?;
        Ok(())
    }

    async fn insert_credential(&self, username: &str) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO password_credentials (username, reset_pending, created_at)
            VALUES ($1, 1, $2)
            ",
        )
        .bind(username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to insert credential: {e}")))?;
        Ok(())
    }

    async fn is_password_user(&self, username: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM password_credentials WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to check credential: {e}")))?;
        Ok(row.is_some())
    }

    async fn password_credential_count(&self, usernames: &[String]) -> AppResult<i64> {
        if usernames.is_empty() {
            return Ok(0);
        }
        let placeholders = (1..=usernames.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql =
            format!("SELECT COUNT(*) AS n FROM password_credentials WHERE username IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for username in usernames {
            query = query.bind(username);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to count credentials: {e}")))?;
        let n: i64 = row.try_get("n")?;
        Ok(n)
    }

    async fn delete_credentials(&self, usernames: &[String]) -> AppResult<()> {
        if usernames.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("failed to begin transaction: {e}")))?;
        for username in usernames {
            sqlx::query("DELETE FROM password_credentials WHERE username = $1")
                .bind(username)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::database(format!("failed to delete credential: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn insert_credentials(&self, usernames: &[String]) -> AppResult<()> {
        if usernames.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("failed to begin transaction: {e}")))?;
        let now = Utc::now();
        for username in usernames {
            sqlx::query(
                r"
                INSERT INTO password_credentials (username, reset_pending, created_at)
                VALUES ($1, 1, $2)
                ",
            )
            .bind(username)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::database(format!("failed to insert credential: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("failed to commit: {e}")))?;
        Ok(())
    }

    async fn in_allowlist(&self, username: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM user_allowlist WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to check allowlist: {e}")))?;
        Ok(row.is_some())
    }

    async fn add_to_allowlist(&self, username: &str) -> AppResult<()> {
        sqlx::query("INSERT OR IGNORE INTO user_allowlist (username) VALUES ($1)")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to add to allowlist: {e}")))?;
        Ok(())
    }

    async fn set_last_login(&self, username: &str) -> AppResult<()> {
        sqlx::query("UPDATE users SET last_login = $2 WHERE username = $1")
            .bind(username)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to set last login: {e}")))?;
        Ok(())
    }

    async fn list_usernames(&self) -> AppResult<Vec<String>> {
        let rows = sqlx::query("SELECT username FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to list users: {e}")))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("username").map_err(AppError::from))
            .collect()
    }

    async fn queue_password_reset(&self, username: &str) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO password_reset_queue (username, requested_at)
            VALUES ($1, $2)
            ",
        )
        .bind(username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("failed to queue reset: {e}")))?;
        Ok(())
    }

    async fn pending_password_resets(&self) -> AppResult<Vec<String>> {
        let rows =
            sqlx::query("SELECT username FROM password_reset_queue ORDER BY requested_at")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::database(format!("failed to read reset queue: {e}")))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("username").map_err(AppError::from))
            .collect()
    }

    async fn clear_password_reset(&self, username: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM password_reset_queue WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to clear reset marker: {e}")))?;
        Ok(())
    }
}

impl Database {
    /// Set or clear the email-verification code for a user. An empty code
    /// marks the address verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_email_verify_code(&self, username: &str, code: &str) -> AppResult<()> {
        sqlx::query("UPDATE users SET email_verify_code = $2 WHERE username = $1")
            .bind(username)
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to set verify code: {e}")))?;
        Ok(())
    }

    /// Grant or revoke the elevated-privilege flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_admin(&self, username: &str, is_admin: bool) -> AppResult<()> {
        sqlx::query("UPDATE users SET is_admin = $2 WHERE username = $1")
            .bind(username)
            .bind(is_admin)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to set admin flag: {e}")))?;
        Ok(())
    }
}
