// ABOUTME: Entra ID OAuth2/OIDC protocol client
// ABOUTME: Authorization-code exchange plus graph profile and group-membership fetches
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{verify_state, IdpTransport, ProtocolClient};
use crate::constants::entra;
use crate::errors::{AppError, AppResult};
use crate::models::{ProviderConfig, ProviderGroup, TokenSet, UserProfile};
use crate::state_token::StateToken;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::warn;

/// `OAuth2` authorization-code client for Entra ID sites
pub struct OAuth2Client {
    transport: Arc<dyn IdpTransport>,
}

impl OAuth2Client {
    /// Create a client over the shared transport
    #[must_use]
    pub fn new(transport: Arc<dyn IdpTransport>) -> Self {
        Self { transport }
    }

    fn require(provider: &ProviderConfig, field: &str, value: &str) -> AppResult<()> {
        if value.is_empty() {
            return Err(AppError::config(format!(
                "site {} missing {field}",
                provider.auth_value
            )));
        }
        Ok(())
    }

    fn string_field(value: &JsonValue, field: &str) -> String {
        value
            .get(field)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_owned()
    }

    fn parse_groups(value: &JsonValue) -> Vec<ProviderGroup> {
        value
            .get("value")
            .and_then(JsonValue::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .map(|group| ProviderGroup {
                        id: Self::string_field(group, "id"),
                        display_name: Self::string_field(group, "displayName"),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProtocolClient for OAuth2Client {
    fn begin_authentication(
        &self,
        provider: &ProviderConfig,
        session_id: &str,
        origin_url: &str,
        refresh: bool,
    ) -> AppResult<String> {
        Self::require(provider, "tenant id", &provider.tenant_id)?;
        Self::require(provider, "client id", &provider.client_id)?;
        Self::require(provider, "redirect uri", &provider.redirect_uri)?;

        let state = StateToken::new(session_id, &provider.site_id, origin_url).encode();
        let mut url = format!(
            "{}/{}/oauth2/v2.0/authorize?state={}&scope={}&response_type=code&approval_prompt=auto&client_id={}&redirect_uri={}",
            entra::LOGIN_BASE,
            provider.tenant_id,
            urlencoding::encode(&state),
            entra::SCOPE,
            provider.client_id,
            urlencoding::encode(&provider.redirect_uri),
        );
        if refresh {
            url.push_str("&prompt=login");
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
        // Session binding first; a forged state must not reach the provider.
        verify_state(received_state, live_session_id)?;

        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            entra::LOGIN_BASE,
            provider.tenant_id
        );
        let form = [
            ("grant_type".to_owned(), "authorization_code".to_owned()),
            ("client_id".to_owned(), provider.client_id.clone()),
            ("redirect_uri".to_owned(), provider.redirect_uri.clone()),
            ("code".to_owned(), code.to_owned()),
            ("client_secret".to_owned(), provider.client_secret.clone()),
        ];
        let body = self
            .transport
            .post_form(&token_url, &form)
            .await
            .map_err(|e| AppError::token_exchange(e.to_string()))?;

        if body.get("error").is_some() {
            return Err(AppError::token_exchange(format!(
                "provider returned error: {}",
                Self::string_field(&body, "error")
            )));
        }
        let access_token = Self::string_field(&body, "access_token");
        if access_token.is_empty() {
            return Err(AppError::token_exchange("response missing access_token"));
        }
        Ok(TokenSet {
            access_token,
            expires_in: body.get("expires_in").and_then(JsonValue::as_i64),
            claims: None,
        })
    }

    async fn fetch_profile(
        &self,
        provider: &ProviderConfig,
        tokens: &TokenSet,
    ) -> AppResult<UserProfile> {
        let profile_url = format!(
            "{}/me?$select={}",
            entra::GRAPH_BASE,
            entra::PROFILE_SELECT
        );
        let body = self
            .transport
            .get_json(&profile_url, Some(&tokens.access_token))
            .await
            .map_err(|e| AppError::profile_fetch(e.to_string()))?;
        if body.get("error").is_some() {
            return Err(AppError::profile_fetch("profile fetch contained an error"));
        }

        // Group fetch failure degrades to an empty list rather than failing
        // the login; logged so transient denials can be traced.
        let groups_url = format!(
            "{}/me/memberOf/microsoft.graph.group?$select=displayName,id",
            entra::GRAPH_BASE
        );
        let groups = match self
            .transport
            .get_json(&groups_url, Some(&tokens.access_token))
            .await
        {
            Ok(group_body) if group_body.get("error").is_none() => Self::parse_groups(&group_body),
            Ok(_) | Err(_) => {
                warn!(
                    site = %provider.auth_value,
                    "group membership fetch failed; continuing with empty group list"
                );
                Vec::new()
            }
        };

        Ok(UserProfile {
            username: Self::string_field(&body, "onPremisesSamAccountName"),
            email: Self::string_field(&body, "mail"),
            first_name: Self::string_field(&body, "givenName"),
            last_name: Self::string_field(&body, "surname"),
            company: Self::string_field(&body, "companyName"),
            department: Self::string_field(&body, "department"),
            job_title: Self::string_field(&body, "jobTitle"),
            user_type: Self::string_field(&body, "userType"),
            account_enabled: body
                .get("accountEnabled")
                .and_then(JsonValue::as_bool)
                .unwrap_or(true),
            provider_id: Self::string_field(&body, "id"),
            groups,
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
