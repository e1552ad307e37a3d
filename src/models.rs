// ABOUTME: Common data models for provider sites, normalized profiles, and request context
// ABOUTME: Includes the AuthSource tagged union and the engine's Decision output type
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol family a provider site speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// `OAuth2`/OIDC authorization-code flow (Entra ID)
    #[default]
    OAuth2,
    /// SAML web-SSO, assertion verified by the host's SP endpoint
    Saml,
    /// CAS ticket validation
    Cas,
}

/// One configured identity-provider site.
///
/// `site_id` is generated once (16 random bytes, hex) and is the only stable
/// foreign key; admins may freely reconfigure `auth_value` and the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Opaque stable identifier, hex-encoded; empty until assigned
    #[serde(default)]
    pub site_id: String,
    /// Short token used as the auth-type query discriminator
    pub auth_value: String,
    /// Display name shown on the login chooser
    pub label: String,
    /// Protocol family for this site
    #[serde(default)]
    pub protocol: ProtocolKind,
    /// OAuth2 client id (or SP entity id / CAS service name)
    pub client_id: String,
    /// Entra directory (tenant) id; unused by SAML/CAS sites
    #[serde(default)]
    pub tenant_id: String,
    /// OAuth2 client secret; unused by SAML/CAS sites
    #[serde(default)]
    pub client_secret: String,
    /// Callback URL registered with the provider
    pub redirect_uri: String,
    /// Single-page-app callback variant, when registered
    #[serde(default)]
    pub redirect_uri_spa: String,
    /// Provider end-session URL; SAML SSO URL / CAS base URL for those kinds
    #[serde(default)]
    pub logout_uri: String,
    /// Provider SSO entry URL (SAML) or server base URL (CAS)
    #[serde(default)]
    pub sso_uri: String,
    /// Provider group ids permitted to log in; empty means no restriction
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    /// Opaque asset reference for the chooser button logo
    #[serde(default)]
    pub login_button_logo: String,
    /// Current attestation text version; `None` disables the gate for this site
    #[serde(default)]
    pub attestation_version: Option<String>,
    /// Attestation text rendered on the consent page
    #[serde(default)]
    pub attestation_text: String,
}

/// A provider group membership, as returned by the group fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderGroup {
    /// Provider-side group identifier
    pub id: String,
    /// Human-readable group name
    #[serde(default)]
    pub display_name: String,
}

/// Normalized user profile merged from the provider's profile and group fetches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Local username the profile resolves to (may be empty: unresolvable)
    #[serde(default)]
    pub username: String,
    /// Primary email address
    #[serde(default)]
    pub email: String,
    /// Given name
    #[serde(default)]
    pub first_name: String,
    /// Family name
    #[serde(default)]
    pub last_name: String,
    /// Company name, when the provider exposes it
    #[serde(default)]
    pub company: String,
    /// Department, when the provider exposes it
    #[serde(default)]
    pub department: String,
    /// Job title, when the provider exposes it
    #[serde(default)]
    pub job_title: String,
    /// Provider-side account type (e.g. Member/Guest)
    #[serde(default)]
    pub user_type: String,
    /// Whether the provider reports the account enabled
    #[serde(default = "default_true")]
    pub account_enabled: bool,
    /// Provider-side object id for the user
    #[serde(default)]
    pub provider_id: String,
    /// Group memberships; empty when the group fetch failed or returned none
    #[serde(default)]
    pub groups: Vec<ProviderGroup>,
}

const fn default_true() -> bool {
    true
}

/// Tokens obtained from a completed code exchange (or protocol equivalent)
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    /// Bearer token for subsequent profile fetches; CAS/SAML leave it empty
    pub access_token: String,
    /// Token lifetime in seconds, when reported
    pub expires_in: Option<i64>,
    /// Claims captured during the exchange itself; CAS and SAML deliver the
    /// whole profile here and the profile fetch is a pure projection
    pub claims: Option<serde_json::Value>,
}

/// Which mechanism currently owns a username.
///
/// Mutually exclusive: a username is at any instant either password-based or
/// bound to exactly one provider site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthSource {
    /// Password credential stored in the host directory
    LocalPassword,
    /// Bound to the provider site with this id
    Provider {
        /// Owning site id
        site_id: String,
    },
    /// No credential or binding, but present on the allow-list
    Allowlisted,
    /// Nothing known about this username
    Unknown,
}

impl AuthSource {
    /// Site id for provider-bound sources
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        match self {
            Self::Provider { site_id } => Some(site_id),
            _ => None,
        }
    }
}

/// A local user record as the host directory exposes it
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Username, case-sensitive as stored
    pub username: String,
    /// Given name
    pub first_name: String,
    /// Family name
    pub last_name: String,
    /// Email address; empty when never set
    pub email: String,
    /// Pending email-verification code; empty when verified
    pub email_verify_code: String,
    /// Elevated-privilege flag for admin RPC actions
    pub is_admin: bool,
    /// Account creation timestamp
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Email is usable: non-empty and with no pending verification code
    #[must_use]
    pub fn email_verified(&self) -> bool {
        !self.email.is_empty() && self.email_verify_code.is_empty()
    }
}

/// Per (username, site) acceptance of a versioned attestation text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Version string the user accepted
    pub accepted_version: String,
    /// When the acceptance was recorded
    pub accepted_at: DateTime<Utc>,
}

/// Where in the host's request lifecycle the engine is being invoked.
///
/// Threaded through the request context by the boundary code; replaces the
/// original design's call-stack inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPhase {
    /// Ordinary page navigation
    #[default]
    Navigation,
    /// Inside the host's login form handling
    LoginForm,
    /// Inside the host's credential-check ("authenticate") path
    Authenticating,
    /// Password recovery/reset flow
    PasswordReset,
}

/// Everything the engine may consult about the inbound request.
///
/// Explicit value, never ambient lookup: carries session identity, the
/// current user (if any), and the request's query and form parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Stable session identifier, available before any redirect
    pub session_id: String,
    /// Username the session is authenticated as, if any
    pub username: Option<String>,
    /// Whether the host considers the session authenticated
    pub authenticated: bool,
    /// HTTP method of the inbound request
    pub method: http::Method,
    /// Host page identifier for the request target
    pub page: String,
    /// Full request URL, used for post-login redirects
    pub url: String,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Form (POST body) parameters
    pub form: HashMap<String, String>,
    /// Request lifecycle phase, set by the invoking boundary
    pub phase: RequestPhase,
}

impl RequestContext {
    /// Query parameter lookup
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Form parameter lookup
    #[must_use]
    pub fn form_param(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// True when the auth-type query parameter selects the local login
    #[must_use]
    pub fn doing_local_login(&self) -> bool {
        self.query_param(crate::constants::query::AUTH_TYPE) == Some(crate::constants::LOCAL_AUTH)
    }
}

/// Login chooser rendering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChooserMode {
    /// Replace the host login page entirely
    Complete,
    /// Inject the provider list into the host's existing login form
    Modified,
    /// Append only a link back to the chooser (local-login page affordance)
    LinkOnly,
}

/// Data needed to render the attestation consent page and resume the login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationPrompt {
    /// Username the acceptance will be recorded for
    pub username: String,
    /// Site whose attestation text must be accepted
    pub site_id: String,
    /// Version being presented
    pub version: String,
    /// Consent text to render
    pub text: String,
    /// Profile cached across the suspension, for provider-flow resumption
    pub profile: Option<UserProfile>,
    /// URL the resumed login should return to
    pub origin_url: String,
}

/// Outcome of one engine invocation; the boundary code interprets it.
///
/// Suspension points are full HTTP round-trips: rendering any page variant
/// terminates the current request.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Nothing for the broker to do; the host proceeds normally
    Continue,
    /// Issue an HTTP redirect and halt
    Redirect(String),
    /// Render the attestation consent page and halt
    ShowAttestation(Box<AttestationPrompt>),
    /// Render the email-update page for this username and halt
    ShowEmailUpdate {
        /// Username whose profile the host's update flow should operate on
        username: String,
    },
    /// Render the provider chooser
    ShowChooser {
        /// Full replacement, injection, or link-back
        mode: ChooserMode,
    },
    /// Render the no-access page; the session has already been destroyed
    ShowNoAccess {
        /// Username that was rejected
        username: String,
    },
    /// Silently abort further processing of this request
    Halt,
}
