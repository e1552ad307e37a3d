// ABOUTME: Unified error handling for the broker with a fixed authentication-failure taxonomy
// ABOUTME: Maps every error kind to a safe HTTP response that never leaks which stage failed
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;

/// Application error taxonomy.
///
/// Authentication-flow kinds mirror the stages of a provider login so internal
/// logs can name the failing stage, while the user-facing rendering stays
/// generic ("could not sign you in").
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Provider not found or malformed site settings. Fails closed: no
    /// redirect is issued for a site the registry cannot resolve.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The state parameter on a callback did not match the live session.
    /// Treated as a possible CSRF/session-fixation attempt.
    #[error("state mismatch on provider callback")]
    StateMismatch,

    /// The authorization-code exchange with the provider failed.
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// The profile fetch against the provider graph endpoint failed.
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),

    /// Auto-provisioning is disabled and the authenticated user is unknown.
    #[error("user provisioning denied: {0}")]
    ProvisioningDenied(String),

    /// Authenticated but not in any of the site's required groups.
    #[error("group membership denied for {0}")]
    GroupMembershipDenied(String),

    /// Caller lacks the elevated privilege an admin action requires.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request input (bad RPC payload, unknown action).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Anything else that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Configuration error (provider not found / malformed settings)
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Token exchange failure (transport error or provider error field)
    pub fn token_exchange(msg: impl Into<String>) -> Self {
        Self::TokenExchangeFailed(msg.into())
    }

    /// Profile fetch failure (transport error or provider error field)
    pub fn profile_fetch(msg: impl Into<String>) -> Self {
        Self::ProfileFetchFailed(msg.into())
    }

    /// Provisioning denied (auto-create disabled, user unknown)
    pub fn provisioning_denied(msg: impl Into<String>) -> Self {
        Self::ProvisioningDenied(msg.into())
    }

    /// Authorization failure for admin-only actions
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Malformed request input
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Missing entity
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Database failure
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Internal failure
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable kind for logs and RPC error bodies
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::StateMismatch => "state_mismatch",
            Self::TokenExchangeFailed(_) => "token_exchange_failed",
            Self::ProfileFetchFailed(_) => "profile_fetch_failed",
            Self::ProvisioningDenied(_) => "provisioning_denied",
            Self::GroupMembershipDenied(_) => "group_membership_denied",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the safe external rendering of this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::StateMismatch
            | Self::TokenExchangeFailed(_)
            | Self::ProfileFetchFailed(_)
            | Self::GroupMembershipDenied(_) => StatusCode::UNAUTHORIZED,
            Self::ProvisioningDenied(_) | Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for kinds raised during an in-progress provider login, where the
    /// top-level handler must tear down the session before responding.
    #[must_use]
    pub const fn is_login_failure(&self) -> bool {
        matches!(
            self,
            Self::StateMismatch
                | Self::TokenExchangeFailed(_)
                | Self::ProfileFetchFailed(_)
                | Self::GroupMembershipDenied(_)
        )
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Internal logs keep the taxonomy kind; the body stays generic so a
        // caller cannot learn which stage of a login attempt failed.
        let message = match &self {
            Self::ProvisioningDenied(_) => {
                "Your account is not registered with this application. Contact an administrator."
            }
            Self::Unauthorized(_) => "You are not authorized to perform this action.",
            Self::InvalidInput(_) => "The request was malformed.",
            Self::NotFound(_) => "Not found.",
            _ if self.is_login_failure() => "Could not sign you in. Please try again.",
            _ => "An internal error occurred.",
        };
        let body = Json(json!({
            "error": self.kind(),
            "message": message,
        }));
        (self.status(), body).into_response()
    }
}
