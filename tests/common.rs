// ABOUTME: Shared test utilities for the broker integration tests
// ABOUTME: In-memory database factory, site fixtures, scripted transport, and engine assembly
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]
#![allow(
    dead_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use idp_broker::attestation::AttestationGate;
use idp_broker::audit::AuditLogger;
use idp_broker::constants::{query, settings as keys};
use idp_broker::database::{Database, SettingsStore, UserDirectory};
use idp_broker::engine::AuthDecisionEngine;
use idp_broker::errors::{AppError, AppResult};
use idp_broker::mailer::PasswordResetMailer;
use idp_broker::models::{
    ProtocolKind, ProviderConfig, RequestContext, RequestPhase, UserRecord,
};
use idp_broker::protocol::{IdpTransport, ProtocolClients};
use idp_broker::provisioning::UserProvisioner;
use idp_broker::registry::ProviderRegistry;
use idp_broker::session::{InMemorySessions, SessionFacade};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .init();
    });
}

/// Standard test database setup
pub async fn create_test_database() -> Result<Arc<Database>> {
    init_test_logging();
    let database = Arc::new(Database::new("sqlite::memory:").await?);
    database.migrate().await?;
    Ok(database)
}

/// A fully populated Entra ID site fixture
pub fn entra_site(auth_value: &str) -> ProviderConfig {
    ProviderConfig {
        site_id: format!("{:0>32}", auth_value.len()),
        auth_value: auth_value.to_owned(),
        label: format!("{auth_value} login"),
        protocol: ProtocolKind::OAuth2,
        client_id: "client-12345".to_owned(),
        tenant_id: "tenant-abcde".to_owned(),
        client_secret: "s3cret".to_owned(),
        redirect_uri: "https://app.example.org/auth/callback".to_owned(),
        redirect_uri_spa: String::new(),
        logout_uri: "https://login.microsoftonline.com/common/oauth2/v2.0/logout".to_owned(),
        sso_uri: String::new(),
        allowed_groups: Vec::new(),
        login_button_logo: String::new(),
        attestation_version: None,
        attestation_text: String::new(),
    }
}

/// Persist sites in configuration order
pub async fn store_sites(settings: &dyn SettingsStore, sites: &[ProviderConfig]) -> Result<()> {
    settings
        .set_setting(keys::SITES, &serde_json::to_value(sites)?)
        .await?;
    Ok(())
}

/// Scripted transport: pops canned responses in call order and counts every
/// network call the protocol clients attempt.
#[derive(Default)]
pub struct MockTransport {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<JsonValue, String>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, value: JsonValue) {
        self.responses.lock().unwrap().push_back(Ok(value));
    }

    pub fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> AppResult<JsonValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(AppError::internal(message)),
            None => Err(AppError::internal("no scripted response")),
        }
    }
}

#[async_trait]
impl IdpTransport for MockTransport {
    async fn post_form(&self, _url: &str, _form: &[(String, String)]) -> AppResult<JsonValue> {
        self.next()
    }

    async fn get_json(&self, _url: &str, _bearer: Option<&str>) -> AppResult<JsonValue> {
        self.next()
    }
}

/// Mailer that records deliveries instead of sending anything
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(username, _)| username.clone())
            .collect()
    }
}

#[async_trait]
impl PasswordResetMailer for RecordingMailer {
    async fn send_reset(&self, username: &str, email: &str) -> AppResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((username.to_owned(), email.to_owned()));
        Ok(())
    }
}

/// Everything a test needs to drive the engine end to end
pub struct TestHarness {
    pub database: Arc<Database>,
    pub engine: AuthDecisionEngine,
    pub sessions: Arc<InMemorySessions>,
    pub transport: Arc<MockTransport>,
    pub provisioner: UserProvisioner,
}

/// Assemble an engine over an in-memory database and a scripted transport
pub async fn create_test_harness() -> Result<TestHarness> {
    let database = create_test_database().await?;
    let settings: Arc<dyn SettingsStore> = database.clone();
    let directory: Arc<dyn UserDirectory> = database.clone();
    let sessions = Arc::new(InMemorySessions::new());
    let transport = MockTransport::new();

    let registry = ProviderRegistry::new(Arc::clone(&settings));
    let audit = Arc::new(AuditLogger::new(Arc::clone(&database)));
    let attestation = AttestationGate::new(Arc::clone(&settings));
    let provisioner = UserProvisioner::new(
        Arc::clone(&directory),
        Arc::clone(&settings),
        Arc::clone(&audit),
    );
    let clients =
        ProtocolClients::new(Arc::clone(&transport) as Arc<dyn IdpTransport>);

    let engine = AuthDecisionEngine::new(
        settings,
        directory,
        Arc::clone(&sessions) as Arc<dyn SessionFacade>,
        registry,
        clients,
        attestation,
        provisioner.clone(),
        audit,
    );
    Ok(TestHarness {
        database,
        engine,
        sessions,
        transport,
        provisioner,
    })
}

impl TestHarness {
    pub fn settings(&self) -> Arc<dyn SettingsStore> {
        self.database.clone()
    }

    pub fn directory(&self) -> Arc<dyn UserDirectory> {
        self.database.clone()
    }

    pub async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.settings().set_setting(key, &json!(value)).await?;
        Ok(())
    }
}

/// Insert a directory user with a verified email
pub async fn create_test_user(database: &Database, username: &str) -> Result<()> {
    let record = UserRecord {
        username: username.to_owned(),
        first_name: "Test".to_owned(),
        last_name: "User".to_owned(),
        email: format!("{username}@example.org"),
        email_verify_code: String::new(),
        is_admin: false,
        created_at: Utc::now(),
    };
    database.insert_user(&record).await?;
    Ok(())
}

/// An unauthenticated GET navigation request
pub fn navigation_ctx(session_id: &str, url: &str) -> RequestContext {
    let parsed = url::Url::parse(url).unwrap();
    let query: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    RequestContext {
        session_id: session_id.to_owned(),
        username: None,
        authenticated: false,
        method: http::Method::GET,
        page: parsed.path().trim_start_matches('/').to_owned(),
        url: url.to_owned(),
        query,
        form: HashMap::new(),
        phase: RequestPhase::Navigation,
    }
}

/// The same request as an authenticated session user
pub fn authenticated_ctx(session_id: &str, username: &str, url: &str) -> RequestContext {
    let mut ctx = navigation_ctx(session_id, url);
    ctx.username = Some(username.to_owned());
    ctx.authenticated = true;
    ctx
}

/// Canned Entra graph profile body for `jdoe`
pub fn jdoe_profile_body() -> JsonValue {
    json!({
        "id": "obj-123",
        "mail": "jdoe@example.org",
        "givenName": "Jane",
        "surname": "Doe",
        "onPremisesSamAccountName": "jdoe",
        "companyName": "Example Corp",
        "department": "Research",
        "jobTitle": "Scientist",
        "userType": "Member",
        "accountEnabled": true
    })
}

/// Auth-type login URL for a site fixture
pub fn login_url(site: &ProviderConfig) -> String {
    format!(
        "https://app.example.org/home?{}={}",
        query::AUTH_TYPE,
        site.auth_value
    )
}
