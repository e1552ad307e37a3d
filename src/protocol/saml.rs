// ABOUTME: SAML web-SSO protocol client
// ABOUTME: Assertion signature checking is the SP endpoint's job; this client consumes its verdict
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{verify_state, ProtocolClient};
use crate::errors::{AppError, AppResult};
use crate::models::{ProviderConfig, TokenSet, UserProfile};
use crate::state_token::StateToken;
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value as JsonValue;

/// SAML client. The host's assertion-consumer endpoint verifies the
/// assertion signature and relays the attribute statement to the callback as
/// base64-encoded JSON; that payload is this protocol's "code".
pub struct SamlClient;

impl SamlClient {
    /// Create the client
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn attribute(claims: &JsonValue, names: &[&str]) -> String {
        for name in names {
            let value = &claims[*name];
            // Attribute statements arrive as scalars or one-element arrays
            if let Some(s) = value.as_str() {
                return s.to_owned();
            }
            if let Some(s) = value.get(0).and_then(JsonValue::as_str) {
                return s.to_owned();
            }
        }
        String::new()
    }
}

impl Default for SamlClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for SamlClient {
    fn begin_authentication(
        &self,
        provider: &ProviderConfig,
        session_id: &str,
        origin_url: &str,
        _refresh: bool,
    ) -> AppResult<String> {
        if provider.sso_uri.is_empty() {
            return Err(AppError::config(format!(
                "site {} missing SSO url",
                provider.auth_value
            )));
        }
        let state = StateToken::new(session_id, &provider.site_id, origin_url).encode();
        let join = if provider.sso_uri.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{join}RelayState={}",
            provider.sso_uri,
            urlencoding::encode(&state)
        ))
    }

    async fn exchange_code(
        &self,
        _provider: &ProviderConfig,
        live_session_id: &str,
        received_state: &str,
        code: &str,
    ) -> AppResult<TokenSet> {
        verify_state(received_state, live_session_id)?;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(code)
            .map_err(|_| AppError::token_exchange("undecodable assertion payload"))?;
        let claims: JsonValue = serde_json::from_slice(&raw)
            .map_err(|_| AppError::token_exchange("malformed assertion payload"))?;
        Ok(TokenSet {
            access_token: String::new(),
            expires_in: None,
            claims: Some(claims),
        })
    }

    async fn fetch_profile(
        &self,
        _provider: &ProviderConfig,
        tokens: &TokenSet,
    ) -> AppResult<UserProfile> {
        let claims = tokens
            .claims
            .as_ref()
            .ok_or_else(|| AppError::profile_fetch("no assertion captured"))?;
        Ok(UserProfile {
            username: Self::attribute(claims, &["sAMAccountName", "uid", "NameID"]),
            email: Self::attribute(claims, &["mail", "email", "emailAddress"]),
            first_name: Self::attribute(claims, &["givenName", "firstName"]),
            last_name: Self::attribute(claims, &["sn", "surname", "lastName"]),
            ..UserProfile::default()
        })
    }

    fn logout_url(&self, provider: &ProviderConfig) -> Option<String> {
        if provider.logout_uri.is_empty() {
            None
        } else {
            Some(provider.logout_uri.clone())
        }
    }
}
