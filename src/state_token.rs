// ABOUTME: Codec for the correlation value threaded through the provider state parameter
// ABOUTME: Binds a session id, a site id, and the post-login origin URL into one string
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use crate::errors::{AppError, AppResult};

/// Segment separator. Never produced by the session-id charset (UUID-style)
/// or the site-id charset (hex), and the origin segment is URL-escaped before
/// joining, so the separator cannot occur inside a segment.
const SEPARATOR: char = '|';

/// Decoded state token for one in-flight login attempt.
///
/// Created immediately before redirecting to the provider and consumed exactly
/// once on callback; authentication correctness depends on `session_id`
/// matching the live session at callback time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateToken {
    /// Session identifier captured at redirect time
    pub session_id: String,
    /// Site the redirect was issued for
    pub site_id: String,
    /// URL to return the user to after login completes
    pub origin_url: String,
}

impl StateToken {
    /// Build a token for the given login attempt
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        site_id: impl Into<String>,
        origin_url: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            site_id: site_id.into(),
            origin_url: origin_url.into(),
        }
    }

    /// Serialize into the wire form carried by the `state` parameter.
    ///
    /// The origin URL is escaped before joining so its `?`, `&`, and any
    /// literal separator characters survive the round trip.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.session_id,
            self.site_id,
            urlencoding::encode(&self.origin_url)
        )
    }

    /// Parse a received `state` value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` when the separator count is wrong or a
    /// segment violates its charset (session id: alphanumeric plus `-`;
    /// site id: lowercase hex).
    pub fn decode(raw: &str) -> AppResult<Self> {
        let segments: Vec<&str> = raw.split(SEPARATOR).collect();
        let [session_id, site_id, origin] = segments.as_slice() else {
            return Err(AppError::invalid_input("malformed state: segment count"));
        };

        if session_id.is_empty() || !session_id.chars().all(is_session_id_char) {
            return Err(AppError::invalid_input("malformed state: session id"));
        }
        if site_id.is_empty() || !site_id.chars().all(is_site_id_char) {
            return Err(AppError::invalid_input("malformed state: site id"));
        }
        let origin_url = urlencoding::decode(origin)
            .map_err(|_| AppError::invalid_input("malformed state: origin url"))?
            .into_owned();

        Ok(Self {
            session_id: (*session_id).to_owned(),
            site_id: (*site_id).to_owned(),
            origin_url,
        })
    }
}

fn is_session_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn is_site_id_char(c: char) -> bool {
    c.is_ascii_hexdigit() && !c.is_ascii_uppercase()
}
