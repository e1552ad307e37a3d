// ABOUTME: Mail delivery seam for password-reset notices
// ABOUTME: Production hosts supply their own transport; the default only logs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::errors::AppResult;
use async_trait::async_trait;
use tracing::info;

/// Sends the password-reset notice a user needs after conversion to a
/// password-based account.
#[async_trait]
pub trait PasswordResetMailer: Send + Sync {
    /// Deliver a reset notice
    async fn send_reset(&self, username: &str, email: &str) -> AppResult<()>;
}

/// Default mailer: records the would-be delivery in the log. Suitable for
/// development and tests.
pub struct LogOnlyMailer;

#[async_trait]
impl PasswordResetMailer for LogOnlyMailer {
    async fn send_reset(&self, username: &str, email: &str) -> AppResult<()> {
        info!(username, email, "password-reset notice (log-only mailer)");
        Ok(())
    }
}
