// ABOUTME: Protocol client contract shared by the OAuth2, SAML, and CAS implementations
// ABOUTME: State verification happens here, before any client may touch the network
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::errors::{AppError, AppResult};
use crate::models::{ProtocolKind, ProviderConfig, TokenSet, UserProfile};
use crate::state_token::StateToken;
use async_trait::async_trait;
use std::sync::Arc;

/// CAS ticket validation client
pub mod cas;
/// Outbound transport seam over the identity providers
pub mod http;
/// Entra ID `OAuth2`/OIDC authorization-code client
pub mod oauth2;
/// SAML web-SSO client
pub mod saml;

pub use http::{HttpTransport, IdpTransport};

/// One protocol family's view of a login flow.
///
/// The decision engine is written once against this trait; Entra ID, SAML,
/// and CAS differ only in how each method is carried out.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Build the provider redirect that begins authentication. `refresh`
    /// forces a fresh provider login for stale sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Configuration` when the site is missing fields the
    /// protocol requires.
    fn begin_authentication(
        &self,
        provider: &ProviderConfig,
        session_id: &str,
        origin_url: &str,
        refresh: bool,
    ) -> AppResult<String>;

    /// Complete the provider exchange for a callback.
    ///
    /// Implementations MUST verify `received_state` against
    /// `live_session_id` (via [`verify_state`]) before performing any network
    /// call, so forged callbacks cannot trigger observable provider traffic.
    ///
    /// # Errors
    ///
    /// `AppError::StateMismatch` on session mismatch,
    /// `AppError::TokenExchangeFailed` on transport or provider failure.
    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        live_session_id: &str,
        received_state: &str,
        code: &str,
    ) -> AppResult<TokenSet>;

    /// Fetch and normalize the user's profile and group memberships.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProfileFetchFailed` on transport or provider
    /// failure. A failed group fetch degrades to an empty group list instead
    /// of failing the call.
    async fn fetch_profile(
        &self,
        provider: &ProviderConfig,
        tokens: &TokenSet,
    ) -> AppResult<UserProfile>;

    /// Group gate: true when the site restricts nothing, or when the profile
    /// shares at least one group id with the site's allowed set.
    fn check_group_membership(&self, provider: &ProviderConfig, profile: &UserProfile) -> bool {
        if provider.allowed_groups.is_empty() {
            return true;
        }
        profile
            .groups
            .iter()
            .any(|group| provider.allowed_groups.contains(&group.id))
    }

    /// Provider end-session URL, when the site configures one
    fn logout_url(&self, provider: &ProviderConfig) -> Option<String>;
}

/// Decode a received state value and require that it was minted for the live
/// session. Mismatch is a hard failure (possible CSRF/session fixation).
///
/// # Errors
///
/// `AppError::InvalidInput` for malformed state, `AppError::StateMismatch`
/// when the embedded session id is not the live one.
pub fn verify_state(received_state: &str, live_session_id: &str) -> AppResult<StateToken> {
    let token = StateToken::decode(received_state)?;
    if token.session_id != live_session_id {
        return Err(AppError::StateMismatch);
    }
    Ok(token)
}

/// The full set of protocol clients, one per supported family
#[derive(Clone)]
pub struct ProtocolClients {
    oauth2: Arc<dyn ProtocolClient>,
    saml: Arc<dyn ProtocolClient>,
    cas: Arc<dyn ProtocolClient>,
}

impl ProtocolClients {
    /// Build the standard client set over one shared transport
    #[must_use]
    pub fn new(transport: Arc<dyn IdpTransport>) -> Self {
        Self {
            oauth2: Arc::new(oauth2::OAuth2Client::new(Arc::clone(&transport))),
            saml: Arc::new(saml::SamlClient::new()),
            cas: Arc::new(cas::CasClient::new(transport)),
        }
    }

    /// Client handling the given protocol family
    #[must_use]
    pub fn for_kind(&self, kind: ProtocolKind) -> Arc<dyn ProtocolClient> {
        match kind {
            ProtocolKind::OAuth2 => Arc::clone(&self.oauth2),
            ProtocolKind::Saml => Arc::clone(&self.saml),
            ProtocolKind::Cas => Arc::clone(&self.cas),
        }
    }
}
