// ABOUTME: Per-request authentication decision engine - the broker's central state machine
// ABOUTME: Evaluates a strict priority list per request and drives provider callback completion
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::attestation::AttestationGate;
use crate::audit::{AuditKind, AuditLogger};
use crate::constants::{query, settings as keys, LOCAL_AUTH};
use crate::database::{SettingsStore, UserDirectory};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AuthSource, ChooserMode, Decision, ProviderConfig, RequestContext, RequestPhase, UserProfile,
};
use crate::protocol::ProtocolClients;
use crate::provisioning::UserProvisioner;
use crate::registry::ProviderRegistry;
use crate::session::SessionFacade;
use crate::state_token::StateToken;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Service account exempt from every broker decision
const SYSTEM_USER: &str = "SYSTEM";

/// Host page identifiers with special handling
pub mod pages {
    /// Administrative user-deletion action
    pub const DELETE_USER: &str = "admin/delete_user";
    /// Locking action that records an e-signature
    pub const LOCKING_ACTION: &str = "locking/sign_action";
    /// Password recovery page
    pub const PASSWORD_RECOVERY: &str = "auth/password_recovery";
    /// Password reset page
    pub const PASSWORD_RESET: &str = "auth/password_reset";
}

/// Resolved user type returned by the admin RPC surface
#[derive(Debug, Clone, Serialize)]
pub struct UserTypeInfo {
    /// Username the record describes
    pub username: String,
    /// Owning mechanism
    pub auth_source: AuthSource,
    /// Site label for provider-bound users, a fixed label otherwise
    pub label: String,
}

/// The per-request router.
///
/// One instance serves every protocol family: provider differences live
/// entirely behind the [`ProtocolClients`] set.
#[derive(Clone)]
pub struct AuthDecisionEngine {
    settings: Arc<dyn SettingsStore>,
    directory: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionFacade>,
    registry: ProviderRegistry,
    clients: ProtocolClients,
    attestation: AttestationGate,
    provisioner: UserProvisioner,
    audit: Arc<AuditLogger>,
}

impl AuthDecisionEngine {
    /// Assemble the engine from its collaborators
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        directory: Arc<dyn UserDirectory>,
        sessions: Arc<dyn SessionFacade>,
        registry: ProviderRegistry,
        clients: ProtocolClients,
        attestation: AttestationGate,
        provisioner: UserProvisioner,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            settings,
            directory,
            sessions,
            registry,
            clients,
            attestation,
            provisioner,
            audit,
        }
    }

    /// Attestation gate, shared with the RPC surface
    #[must_use]
    pub const fn attestation(&self) -> &AttestationGate {
        &self.attestation
    }

    /// Provisioner, shared with the RPC surface
    #[must_use]
    pub const fn provisioner(&self) -> &UserProvisioner {
        &self.provisioner
    }

    /// Registry, shared with the RPC and chooser surfaces
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Session facade, shared with the route layer
    #[must_use]
    pub fn sessions(&self) -> Arc<dyn SessionFacade> {
        Arc::clone(&self.sessions)
    }

    // ------------------------------------------------------------------
    // Settings flags
    // ------------------------------------------------------------------

    async fn flag(&self, key: &str) -> bool {
        matches!(
            self.settings.get_setting(key).await,
            Ok(Some(value)) if value.as_bool() == Some(true)
        )
    }

    async fn chooser_mode(&self) -> String {
        match self.settings.get_setting(keys::CHOOSER_MODE).await {
            Ok(Some(value)) => value.as_str().unwrap_or("none").to_owned(),
            _ => "none".to_owned(),
        }
    }

    // ------------------------------------------------------------------
    // Request entry point
    // ------------------------------------------------------------------

    /// Per-request hook, invoked before the host renders the page.
    ///
    /// Never fails outward: any internal error is logged and, when it struck
    /// during an in-progress login, the session is torn down so no
    /// half-authenticated state survives.
    pub async fn on_page_request(&self, ctx: &RequestContext) -> Decision {
        match self.decide(ctx).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(kind = e.kind(), error = %e, page = %ctx.page, "request hook failed");
                if e.is_login_failure() {
                    self.sessions.destroy(&ctx.session_id).await;
                }
                Decision::Continue
            }
        }
    }

    /// The priority-ordered decision list. First match wins; evaluation order
    /// is part of the contract.
    async fn decide(&self, ctx: &RequestContext) -> AppResult<Decision> {
        if ctx.page.is_empty() || ctx.username.as_deref() == Some(SYSTEM_USER) {
            return Ok(Decision::Continue);
        }

        // 1. Logout request
        if ctx.query_param(query::LOGOUT).is_some_and(|v| v != "0") {
            return self.handle_logout(ctx).await;
        }

        // 2. Administrative user deletion: cascade-delete our settings, never
        //    block the deletion itself.
        if ctx.page == pages::DELETE_USER && ctx.method == http::Method::POST {
            self.handle_user_deletion(ctx).await;
            return Ok(Decision::Continue);
        }

        // 3. E-signature POST on a locking action
        if ctx.page == pages::LOCKING_ACTION && ctx.method == http::Method::POST {
            return self.handle_esignature(ctx).await;
        }

        // 4. Other POSTs are none of our business unless the host is inside
        //    its login handling.
        if ctx.method == http::Method::POST && ctx.phase != RequestPhase::LoginForm {
            return Ok(Decision::Continue);
        }

        // 5. Never interpose on password recovery
        if ctx.phase == RequestPhase::PasswordReset
            || ctx.page == pages::PASSWORD_RECOVERY
            || ctx.page == pages::PASSWORD_RESET
        {
            return Ok(Decision::Continue);
        }

        // 6. Already authenticated to the host
        if ctx.authenticated {
            return self.handle_authenticated(ctx).await;
        }

        // 7. Mid local-login with an unverified email
        if ctx.phase == RequestPhase::Authenticating {
            if let Some(username) = ctx.username.as_deref() {
                if !self.email_verified(username).await? {
                    return Ok(Decision::ShowEmailUpdate {
                        username: username.to_owned(),
                    });
                }
            }
        }

        // 8. Provider auth explicitly requested
        if let Some(auth_value) = ctx.query_param(query::AUTH_TYPE) {
            if auth_value != LOCAL_AUTH {
                return self.begin_provider_auth(ctx, auth_value).await;
            }
        }

        // 9. Stray site-id parameter with no auth-type: strip and redirect
        if ctx.query_param(query::AUTH_TYPE).is_none() && ctx.query_param(query::SITE_ID).is_some()
        {
            let clean = strip_query_param(&ctx.url, query::SITE_ID);
            return Ok(Decision::Redirect(clean));
        }

        // 10. Custom or modified login page
        if ctx.phase == RequestPhase::LoginForm && !ctx.doing_local_login() {
            match self.chooser_mode().await.as_str() {
                "complete" => {
                    return Ok(Decision::ShowChooser {
                        mode: ChooserMode::Complete,
                    })
                }
                "modified" => {
                    return Ok(Decision::ShowChooser {
                        mode: ChooserMode::Modified,
                    })
                }
                _ => {}
            }
        }

        // 11. Local login with a link back to the chooser
        if ctx.doing_local_login() && self.chooser_mode().await != "none" {
            return Ok(Decision::ShowChooser {
                mode: ChooserMode::LinkOnly,
            });
        }

        Ok(Decision::Continue)
    }

    // ------------------------------------------------------------------
    // Step handlers
    // ------------------------------------------------------------------

    async fn handle_logout(&self, ctx: &RequestContext) -> AppResult<Decision> {
        let username = self.sessions.authenticated_username(&ctx.session_id).await;
        self.sessions.destroy(&ctx.session_id).await;
        self.audit
            .record(AuditKind::Logout, username.as_deref(), json!({}))
            .await;

        // Provider-bound sessions continue to the provider's end-session URL
        if let Some(username) = username {
            if let AuthSource::Provider { site_id } = self.provisioner.auth_source(&username).await?
            {
                if let Some(site) = self.registry.get_by_site_id(&site_id).await? {
                    let client = self.clients.for_kind(site.protocol);
                    if let Some(url) = client.logout_url(&site) {
                        return Ok(Decision::Redirect(url));
                    }
                }
            }
        }
        Ok(Decision::Continue)
    }

    /// Cascade-delete broker settings for a deleted username. Failures are
    /// logged, never propagated: the deletion must not be blocked here.
    async fn handle_user_deletion(&self, ctx: &RequestContext) {
        let Some(username) = ctx.form_param("username").map(str::trim) else {
            return;
        };
        if username.is_empty() {
            return;
        }
        if let Err(e) = self.provisioner.forget_user(username).await {
            warn!(username, error = %e, "failed to delete user binding");
        }
        match self.registry.list_all().await {
            Ok(sites) => {
                for site in sites {
                    if let Err(e) = self.attestation.forget(username, &site.site_id).await {
                        warn!(username, site_id = %site.site_id, error = %e,
                            "failed to delete attestation record");
                    }
                }
            }
            Err(e) => warn!(username, error = %e, "failed to list sites for cascade delete"),
        }
    }

    /// Re-validate the provider-session correlation before an e-signature is
    /// recorded. Mismatch aborts the request silently.
    async fn handle_esignature(&self, ctx: &RequestContext) -> AppResult<Decision> {
        if ctx.form_param("esign_action") != Some("save") {
            return Ok(Decision::Continue);
        }
        let Some(acting_user) = ctx.form_param("username") else {
            return Ok(Decision::Continue);
        };

        // Password-based signers use the host's own credential check
        let source = self.provisioner.auth_source(acting_user).await?;
        let AuthSource::Provider { .. } = source else {
            return Ok(Decision::Continue);
        };

        let session_user = self.sessions.authenticated_username(&ctx.session_id).await;
        let presented = ctx.form_param("esign_code").unwrap_or_default();
        let expected = self.sessions.take_esign_code(&ctx.session_id).await;

        let valid = session_user.as_deref() == Some(acting_user)
            && !presented.is_empty()
            && expected.as_deref() == Some(presented);
        if valid {
            Ok(Decision::Continue)
        } else {
            warn!(acting_user, "e-signature correlation mismatch; aborting request");
            Ok(Decision::Halt)
        }
    }

    async fn handle_authenticated(&self, ctx: &RequestContext) -> AppResult<Decision> {
        let Some(username) = ctx
            .username
            .clone()
            .or(self.sessions.authenticated_username(&ctx.session_id).await)
        else {
            return Ok(Decision::Continue);
        };

        let source = self.provisioner.auth_source(&username).await?;
        let live_local = ctx.doing_local_login() || source.site_id().is_none();
        if live_local {
            let site_id = self.infer_site_id(ctx, &source).await?;

            // 6a. Silent conversion back to provider binding, only when the
            //     admin setting enables it and a provider hint is present.
            if let Some(site_id) = site_id.as_deref() {
                if ctx.query_param(query::SITE_ID).is_some() && self.flag(keys::AUTO_CONVERT).await
                {
                    self.provisioner
                        .set_provider_binding(&username, Some(site_id))
                        .await?;
                }

                // 6b. Attestation owed by a retroactively bound user
                if let Some(site) = self.registry.get_by_site_id(site_id).await? {
                    if self
                        .attestation
                        .needs_attestation_local(&site, &username)
                        .await?
                    {
                        if let Some(prompt) =
                            AttestationGate::prompt(&site, &username, None, &ctx.url)
                        {
                            return Ok(Decision::ShowAttestation(Box::new(prompt)));
                        }
                    }
                }
            }

            // 6c. Strip leftover provider parameters from the URL
            if ctx.query_param(query::AUTH_TYPE).is_some() {
                let clean = strip_query_param(&ctx.url, query::AUTH_TYPE);
                let clean = strip_query_param(&clean, query::SITE_ID);
                return Ok(Decision::Redirect(clean));
            }
        }

        // 6d. Allow-list, evaluated last
        if self.check_allowlist(&username).await? {
            Ok(Decision::Continue)
        } else {
            self.sessions.destroy(&ctx.session_id).await;
            Ok(Decision::ShowNoAccess { username })
        }
    }

    async fn begin_provider_auth(
        &self,
        ctx: &RequestContext,
        auth_value: &str,
    ) -> AppResult<Decision> {
        // Fails closed: an unresolvable auth-value issues no redirect
        let Some(site) = self.registry.get_by_auth_value(auth_value).await? else {
            warn!(auth_value, "auth type requested for unknown site");
            return Ok(Decision::Continue);
        };
        let client = self.clients.for_kind(site.protocol);
        let redirect = client.begin_authentication(&site, &ctx.session_id, &ctx.url, false)?;
        debug!(site = %site.auth_value, "redirecting to provider");
        Ok(Decision::Redirect(redirect))
    }

    // ------------------------------------------------------------------
    // Callback completion
    // ------------------------------------------------------------------

    /// Complete a provider callback: exchange the code, fetch the profile,
    /// and drive login. Any failure destroys the partially-established
    /// session before surfacing.
    ///
    /// # Errors
    ///
    /// Propagates the taxonomy kind of the failing stage; the session has
    /// already been destroyed when an error is returned.
    pub async fn complete_callback(
        &self,
        ctx: &RequestContext,
        received_state: &str,
        code: &str,
    ) -> AppResult<Decision> {
        match self.run_callback(ctx, received_state, code).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                let kind = if matches!(e, AppError::StateMismatch) {
                    AuditKind::StateMismatch
                } else {
                    AuditKind::LoginFailure
                };
                self.audit
                    .record(kind, ctx.username.as_deref(), json!({ "error": e.kind() }))
                    .await;
                self.sessions.destroy(&ctx.session_id).await;
                Err(e)
            }
        }
    }

    async fn run_callback(
        &self,
        ctx: &RequestContext,
        received_state: &str,
        code: &str,
    ) -> AppResult<Decision> {
        // Peek at the site id only; the session binding is enforced inside
        // exchange_code, before any network call.
        let token = StateToken::decode(received_state)?;
        let Some(site) = self.registry.get_by_site_id(&token.site_id).await? else {
            return Err(AppError::config("callback for unknown site"));
        };

        let client = self.clients.for_kind(site.protocol);
        let tokens = client
            .exchange_code(&site, &ctx.session_id, received_state, code)
            .await?;
        let profile = client.fetch_profile(&site, &tokens).await?;

        if !client.check_group_membership(&site, &profile) {
            self.audit
                .record(
                    AuditKind::LoginFailure,
                    Some(profile.username.as_str()),
                    json!({ "error": "group_membership_denied", "site_id": site.site_id }),
                )
                .await;
            self.sessions.destroy(&ctx.session_id).await;
            return Ok(Decision::ShowNoAccess {
                username: profile.username,
            });
        }

        self.login_provider_user(ctx, &site, profile, &token.origin_url)
            .await
    }

    /// Finalize (or suspend) a provider login for a fetched profile.
    ///
    /// # Errors
    ///
    /// `AppError::ProvisioningDenied` when the user is unknown and
    /// auto-provisioning is off, or the profile is too sparse to create from.
    pub async fn login_provider_user(
        &self,
        ctx: &RequestContext,
        site: &ProviderConfig,
        profile: UserProfile,
        origin_url: &str,
    ) -> AppResult<Decision> {
        // (a) No resolvable username: reject silently
        if profile.username.is_empty() {
            warn!(site = %site.auth_value, "profile has no resolvable username");
            return Ok(Decision::Halt);
        }
        let username = profile.username.clone();

        // (b) Unknown user and auto-provisioning disabled: fail fast
        let existed = self.provisioner.user_exists(&username).await?;
        if !existed && !self.flag(keys::AUTO_PROVISION).await {
            return Err(AppError::provisioning_denied(format!(
                "user {username} does not exist and auto-provisioning is disabled"
            )));
        }

        // (c) Attestation owed: suspend. The login is NOT finalized; the
        //     acceptance handler re-drives this method with the cached profile.
        if self.attestation.needs_attestation(site, &profile).await? {
            if let Some(prompt) =
                AttestationGate::prompt(site, &username, Some(profile.clone()), origin_url)
            {
                return Ok(Decision::ShowAttestation(Box::new(prompt)));
            }
        }

        // (d) Finalize host-session authentication
        self.sessions
            .mark_authenticated(&ctx.session_id, &username)
            .await;
        self.sessions
            .set_esign_code(&ctx.session_id, &Uuid::new_v4().to_string())
            .await;
        self.directory.set_last_login(&username).await?;
        self.audit
            .record(
                AuditKind::LoginSuccess,
                Some(username.as_str()),
                json!({ "site_id": site.site_id }),
            )
            .await;
        info!(%username, site = %site.auth_value, "provider login succeeded");

        // (e) Provision or convert as needed
        if existed {
            if self.directory.is_password_user(&username).await? {
                if self.flag(keys::AUTO_CONVERT).await {
                    self.provisioner
                        .convert_to_provider_user(&username, &site.site_id)
                        .await?;
                }
            } else {
                self.provisioner
                    .set_provider_binding(&username, Some(&site.site_id))
                    .await?;
            }
        } else {
            if !self.provisioner.create_user(&username, &profile).await? {
                return Err(AppError::provisioning_denied(format!(
                    "profile for {username} is too sparse to create an account"
                )));
            }
            self.provisioner
                .set_provider_binding(&username, Some(&site.site_id))
                .await?;
        }

        // (f) Email missing or unverified: not fully logged in this request
        if !self.email_verified(&username).await? {
            return Ok(Decision::ShowEmailUpdate { username });
        }

        // (g) Allow-list, last
        if !self.check_allowlist(&username).await? {
            self.sessions.destroy(&ctx.session_id).await;
            return Ok(Decision::ShowNoAccess { username });
        }

        let clean = strip_query_param(origin_url, query::AUTH_TYPE);
        let clean = strip_query_param(&clean, query::SITE_ID);
        Ok(Decision::Redirect(clean))
    }

    /// Resume a suspended login after an attestation acceptance. Provider
    /// flows re-drive [`Self::login_provider_user`] with the cached profile;
    /// post-login acceptances simply return to the origin URL.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidInput` for a stale or unknown site/version.
    pub async fn resume_after_attestation(
        &self,
        ctx: &RequestContext,
        site_id: &str,
        username: &str,
        version: &str,
        profile: Option<UserProfile>,
        origin_url: &str,
    ) -> AppResult<Decision> {
        let Some(site) = self.registry.get_by_site_id(site_id).await? else {
            return Err(AppError::invalid_input("attestation for unknown site"));
        };
        if site.attestation_version.as_deref() != Some(version) {
            return Err(AppError::invalid_input("attestation version is stale"));
        }
        if username.is_empty() {
            return Err(AppError::invalid_input("attestation without username"));
        }
        self.attestation
            .record_acceptance(username, site_id, version)
            .await?;
        self.audit
            .record(
                AuditKind::AttestationAccepted,
                Some(username),
                json!({ "site_id": site_id, "version": version }),
            )
            .await;

        match profile {
            Some(profile) => {
                self.login_provider_user(ctx, &site, profile, origin_url)
                    .await
            }
            None => Ok(Decision::Redirect(origin_url.to_owned())),
        }
    }

    // ------------------------------------------------------------------
    // Admin queries
    // ------------------------------------------------------------------

    /// Resolve the user-type record the admin surface displays.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores fail.
    pub async fn user_type(&self, username: &str) -> AppResult<UserTypeInfo> {
        let auth_source = self.provisioner.auth_source(username).await?;
        let label = match &auth_source {
            AuthSource::Provider { site_id } => self
                .registry
                .get_by_site_id(site_id)
                .await?
                .map_or_else(|| "Unknown Site".to_owned(), |site| site.label),
            AuthSource::LocalPassword => "Password User".to_owned(),
            AuthSource::Allowlisted => "Allowlisted User".to_owned(),
            AuthSource::Unknown => "Unknown".to_owned(),
        };
        Ok(UserTypeInfo {
            username: username.to_owned(),
            auth_source,
            label,
        })
    }

    /// User-type records for every username in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the stores fail.
    pub async fn list_user_types(&self) -> AppResult<Vec<UserTypeInfo>> {
        let mut out = Vec::new();
        for username in self.directory.list_usernames().await? {
            out.push(self.user_type(&username).await?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Shared checks
    // ------------------------------------------------------------------

    /// Site-id inference chain: explicit verified query parameter, then the
    /// auth-type parameter, then the user's stored binding. `None` is local.
    async fn infer_site_id(
        &self,
        ctx: &RequestContext,
        source: &AuthSource,
    ) -> AppResult<Option<String>> {
        if let Some(site_id) = ctx.query_param(query::SITE_ID) {
            if self.registry.verify_site_id(site_id).await {
                return Ok(Some(site_id.to_owned()));
            }
        }
        if let Some(auth_value) = ctx.query_param(query::AUTH_TYPE) {
            if auth_value != LOCAL_AUTH {
                if let Some(site) = self.registry.get_by_auth_value(auth_value).await? {
                    return Ok(Some(site.site_id));
                }
            }
        }
        Ok(source.site_id().map(str::to_owned))
    }

    /// Allow-list gate. Password-based accounts and the service account are
    /// implicitly exempt; the feature flag disables the gate entirely.
    async fn check_allowlist(&self, username: &str) -> AppResult<bool> {
        if username == SYSTEM_USER || !self.flag(keys::ALLOWLIST_ENABLED).await {
            return Ok(true);
        }
        if self.directory.is_password_user(username).await? {
            return Ok(true);
        }
        self.directory.in_allowlist(username).await
    }

    async fn email_verified(&self, username: &str) -> AppResult<bool> {
        Ok(self
            .directory
            .get_user(username)
            .await?
            .is_some_and(|user| user.email_verified()))
    }
}

/// Remove one query parameter from a URL, leaving the rest intact
#[must_use]
pub fn strip_query_param(url: &str, name: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_owned();
    };
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (key, value) in &remaining {
            pairs.append_pair(key, value);
        }
        drop(pairs);
    }
    parsed.to_string()
}

/// Add or replace one query parameter on a URL
#[must_use]
pub fn add_query_param(url: &str, name: &str, value: &str) -> String {
    let stripped = strip_query_param(url, name);
    let Ok(mut parsed) = Url::parse(&stripped) else {
        return stripped;
    };
    parsed.query_pairs_mut().append_pair(name, value);
    parsed.to_string()
}
