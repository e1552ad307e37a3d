// ABOUTME: CAS protocol client using service-ticket validation
// ABOUTME: The ticket plays the role of the authorization code; validation returns the profile inline
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{verify_state, IdpTransport, ProtocolClient};
use crate::errors::{AppError, AppResult};
use crate::models::{ProviderConfig, TokenSet, UserProfile};
use crate::state_token::StateToken;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// CAS client. `sso_uri` on the site is the CAS server base URL.
pub struct CasClient {
    transport: Arc<dyn IdpTransport>,
}

impl CasClient {
    /// Create a client over the shared transport
    #[must_use]
    pub fn new(transport: Arc<dyn IdpTransport>) -> Self {
        Self { transport }
    }

    /// The service URL registered with CAS: our callback plus the state value,
    /// so the correlation token survives the round trip through the server.
    fn service_url(provider: &ProviderConfig, state: &str) -> String {
        format!(
            "{}?state={}",
            provider.redirect_uri,
            urlencoding::encode(state)
        )
    }

    fn attribute(claims: &JsonValue, names: &[&str]) -> String {
        let attributes = claims.get("attributes").unwrap_or(&JsonValue::Null);
        for name in names {
            let value = &attributes[*name];
            // CAS serializes attributes as scalars or single-element arrays
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

#[async_trait]
impl ProtocolClient for CasClient {
    fn begin_authentication(
        &self,
        provider: &ProviderConfig,
        session_id: &str,
        origin_url: &str,
        refresh: bool,
    ) -> AppResult<String> {
        if provider.sso_uri.is_empty() {
            return Err(AppError::config(format!(
                "site {} missing CAS server url",
                provider.auth_value
            )));
        }
        let state = StateToken::new(session_id, &provider.site_id, origin_url).encode();
        let mut url = format!(
            "{}/login?service={}",
            provider.sso_uri,
            urlencoding::encode(&Self::service_url(provider, &state))
        );
        if refresh {
            url.push_str("&renew=true");
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        live_session_id: &str,
        received_state: &str,
        code: &str,
    ) -> AppResult<TokenSet> {
        // Session binding first, before the validation round trip
        verify_state(received_state, live_session_id)?;

        let validate_url = format!(
            "{}/serviceValidate?service={}&ticket={}&format=JSON",
            provider.sso_uri,
            urlencoding::encode(&Self::service_url(provider, received_state)),
            urlencoding::encode(code),
        );
        let body = self
            .transport
            .get_json(&validate_url, None)
            .await
            .map_err(|e| AppError::token_exchange(e.to_string()))?;

        let response = body.get("serviceResponse").unwrap_or(&JsonValue::Null);
        if response.get("authenticationFailure").is_some() {
            return Err(AppError::token_exchange("ticket validation failed"));
        }
        let Some(success) = response.get("authenticationSuccess") else {
            return Err(AppError::token_exchange("unrecognized validation response"));
        };
        Ok(TokenSet {
            access_token: String::new(),
            expires_in: None,
            claims: Some(success.clone()),
        })
    }

    async fn fetch_profile(
        &self,
        _provider: &ProviderConfig,
        tokens: &TokenSet,
    ) -> AppResult<UserProfile> {
        // CAS delivers everything at validation time; this is a projection.
        let claims = tokens
            .claims
            .as_ref()
            .ok_or_else(|| AppError::profile_fetch("no validation response captured"))?;
        let username = claims
            .get("user")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(UserProfile {
            username,
            email: Self::attribute(claims, &["mail", "email"]),
            first_name: Self::attribute(claims, &["givenName", "firstName"]),
            last_name: Self::attribute(claims, &["sn", "surname", "lastName"]),
            ..UserProfile::default()
        })
    }

    fn logout_url(&self, provider: &ProviderConfig) -> Option<String> {
        if !provider.logout_uri.is_empty() {
            return Some(provider.logout_uri.clone());
        }
        if provider.sso_uri.is_empty() {
            None
        } else {
            Some(format!("{}/logout", provider.sso_uri))
        }
    }
}
