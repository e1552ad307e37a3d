// ABOUTME: Host session facade and its in-memory implementation
// ABOUTME: Sessions are referenced by id only; destruction is idempotent by contract
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use async_trait::async_trait;
use dashmap::DashMap;

/// What the broker requires of the host's session machinery: a stable id
/// obtainable before redirect, the ability to mark a session authenticated as
/// a username, and idempotent destruction.
#[async_trait]
pub trait SessionFacade: Send + Sync {
    /// Whether the session is currently authenticated
    async fn is_authenticated(&self, session_id: &str) -> bool;

    /// Username the session is authenticated as, if any
    async fn authenticated_username(&self, session_id: &str) -> Option<String>;

    /// Mark the session authenticated as `username`
    async fn mark_authenticated(&self, session_id: &str, username: &str);

    /// Destroy the session. Safe to call repeatedly and for unknown ids.
    async fn destroy(&self, session_id: &str);

    /// Stash a one-time e-signature correlation code for the session
    async fn set_esign_code(&self, session_id: &str, code: &str);

    /// Take (and clear) the stashed e-signature code
    async fn take_esign_code(&self, session_id: &str) -> Option<String>;
}

#[derive(Default)]
struct SessionState {
    username: Option<String>,
    esign_code: Option<String>,
}

/// In-process session store used by the standalone server and the tests.
///
/// A host embedding the broker substitutes its own facade implementation.
#[derive(Default)]
pub struct InMemorySessions {
    sessions: DashMap<String, SessionState>,
}

impl InMemorySessions {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionFacade for InMemorySessions {
    async fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.username.is_some())
    }

    async fn authenticated_username(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.username.clone())
    }

    async fn mark_authenticated(&self, session_id: &str, username: &str) {
        self.sessions
            .entry(session_id.to_owned())
            .or_default()
            .username = Some(username.to_owned());
    }

    async fn destroy(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    async fn set_esign_code(&self, session_id: &str, code: &str) {
        self.sessions
            .entry(session_id.to_owned())
            .or_default()
            .esign_code = Some(code.to_owned());
    }

    async fn take_esign_code(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get_mut(session_id)
            .and_then(|mut s| s.esign_code.take())
    }
}
