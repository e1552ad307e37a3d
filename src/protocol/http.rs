// ABOUTME: Outbound HTTP transport seam used by the protocol clients
// ABOUTME: Carries the bounded provider timeout; mockable so tests can count network calls
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::constants::IDP_TIMEOUT_SECS;
use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Minimal transport the protocol clients need from the network.
///
/// Kept as a trait so tests can substitute a counting mock and assert that
/// the state check short-circuits before any call is made.
#[async_trait]
pub trait IdpTransport: Send + Sync {
    /// Form-encoded POST returning the provider's JSON body
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> AppResult<JsonValue>;

    /// JSON GET, optionally with a bearer token
    async fn get_json(&self, url: &str, bearer: Option<&str>) -> AppResult<JsonValue>;
}

/// Production transport over `reqwest` with the bounded provider timeout.
/// No retries: a transport failure is terminal for that login attempt.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` when the client cannot be constructed.
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(IDP_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IdpTransport for HttpTransport {
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> AppResult<JsonValue> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::internal(format!("provider request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| AppError::internal(format!("provider response unreadable: {e}")))
    }

    async fn get_json(&self, url: &str, bearer: Option<&str>) -> AppResult<JsonValue> {
        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::internal(format!("provider request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| AppError::internal(format!("provider response unreadable: {e}")))
    }
}
