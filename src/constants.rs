// ABOUTME: Application constants shared across the broker
// ABOUTME: Query parameter names, settings-store keys, and provider endpoint bases
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

/// Query parameters recognized on any page request
pub mod query {
    /// Auth-type discriminator: a provider's `auth_value` or [`LOCAL_AUTH`](super::LOCAL_AUTH)
    pub const AUTH_TYPE: &str = "authtype";
    /// Opaque site-id, used to disambiguate when several providers fit the context
    pub const SITE_ID: &str = "sid";
    /// Logout flag
    pub const LOGOUT: &str = "logout";
}

/// Auth-type value selecting the host's own password login
pub const LOCAL_AUTH: &str = "local";

/// Settings-store keys and key prefixes
pub mod settings {
    /// JSON array of configured provider sites (configuration order preserved)
    pub const SITES: &str = "sites";
    /// Prefix for per-username provider-binding values (`binding:<username>`)
    pub const USER_BINDING_PREFIX: &str = "binding:";
    /// Prefix for per-site, per-username attestation records
    /// (`attestation:<site_id>:<username>`)
    pub const ATTESTATION_PREFIX: &str = "attestation:";
    /// Allow-list feature flag
    pub const ALLOWLIST_ENABLED: &str = "allowlist-enabled";
    /// Auto-provision unknown provider users on first login
    pub const AUTO_PROVISION: &str = "create-users-on-login";
    /// Automatically convert password accounts to provider accounts on login
    pub const AUTO_CONVERT: &str = "convert-password-users";
    /// Login chooser mode: "none", "complete", or "modified"
    pub const CHOOSER_MODE: &str = "login-chooser-mode";
    /// Support-ticket URL shown on the email-update page
    pub const TICKET_URL: &str = "ticket-url";
}

/// Entra ID endpoint bases (per-site tenant segments are appended)
pub mod entra {
    /// Authorization and token endpoint base
    pub const LOGIN_BASE: &str = "https://login.microsoftonline.com";
    /// Graph endpoint used for profile and group-membership fetches
    pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
    /// Scope requested on every authorization redirect
    pub const SCOPE: &str = "User.Read";
    /// Profile fields requested from the graph `/me` endpoint
    pub const PROFILE_SELECT: &str =
        "id,mail,givenName,surname,onPremisesSamAccountName,companyName,department,jobTitle,userType,accountEnabled";
}

/// Bounded timeout for every outbound call to an identity provider, in
/// seconds. Expiry is reported as a token-exchange or profile-fetch failure.
pub const IDP_TIMEOUT_SECS: u64 = 15;

/// Password-reset mail throttle: at most this many sends per window
pub const RESET_MAIL_LIMIT: i64 = 150;

/// Password-reset mail throttle window, in seconds
pub const RESET_MAIL_WINDOW_SECS: i64 = 60;
