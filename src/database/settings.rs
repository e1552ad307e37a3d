// ABOUTME: Settings store database operations
// ABOUTME: JSON-valued key/value table backing provider sites, bindings, and feature flags
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{Database, SettingsStore};
use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::Row;

#[async_trait]
impl SettingsStore for Database {
    async fn get_setting(&self, key: &str) -> AppResult<Option<JsonValue>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to read setting: {e}")))?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| AppError::database(format!("corrupt setting {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_setting(&self, key: &str, value: &JsonValue) -> AppResult<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| AppError::internal(format!("unserializable setting {key}: {e}")))?;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ($1, $2)")
            .bind(key)
            .bind(raw)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to write setting: {e}")))?;
        Ok(())
    }

    async fn remove_setting(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("failed to remove setting: {e}")))?;
        Ok(())
    }
}
