// ABOUTME: Axum HTTP surface for the broker - page hook, provider callback, chooser, and RPC
// ABOUTME: Renders engine decisions; suspension pages are embedded templates substituted at runtime
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

mod rpc;

use crate::constants::{query as query_params, settings as keys, LOCAL_AUTH};
use crate::database::{SettingsStore, UserDirectory};
use crate::engine::{add_query_param, AuthDecisionEngine};
use crate::errors::AppResult;
use crate::mailer::PasswordResetMailer;
use crate::models::{ChooserMode, Decision, RequestContext, RequestPhase};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Session cookie carrying the stable session identifier
const SESSION_COOKIE: &str = "broker_session";

/// Chooser page template embedded at compile time
const CHOOSER_TEMPLATE: &str = include_str!("../../templates/chooser.html");
/// Attestation page template embedded at compile time
const ATTESTATION_TEMPLATE: &str = include_str!("../../templates/attestation.html");
/// No-access page template embedded at compile time
const NO_ACCESS_TEMPLATE: &str = include_str!("../../templates/no_access.html");
/// Email-update page template embedded at compile time
const EMAIL_UPDATE_TEMPLATE: &str = include_str!("../../templates/email_update.html");

/// Shared state for every broker route
#[derive(Clone)]
pub struct BrokerState {
    /// The decision engine
    pub engine: AuthDecisionEngine,
    /// User directory, for the admin privilege check
    pub directory: Arc<dyn UserDirectory>,
    /// Settings store, for page-rendering configuration
    pub settings: Arc<dyn SettingsStore>,
    /// Reset-notice delivery
    pub mailer: Arc<dyn PasswordResetMailer>,
    /// Externally visible base URL, for absolute page URLs
    pub external_url: String,
}

/// Broker route set
pub struct BrokerRoutes;

impl BrokerRoutes {
    /// Assemble the router
    pub fn routes(state: BrokerState) -> Router {
        Router::new()
            .route("/auth/callback", get(handle_callback))
            .route("/auth/chooser", get(handle_chooser))
            .route("/auth/rpc", post(rpc::handle_rpc))
            .route("/", get(handle_page).post(handle_page_post))
            .route("/*page", get(handle_page).post(handle_page_post))
            .with_state(state)
    }
}

// ----------------------------------------------------------------------
// Session cookie plumbing
// ----------------------------------------------------------------------

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for cookie in cookies.split(';') {
        if let Some(value) = cookie.trim().strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Session id from the cookie, or a fresh one with its Set-Cookie header
fn session_for(headers: &HeaderMap) -> (String, Option<String>) {
    if let Some(existing) = cookie_value(headers, SESSION_COOKIE) {
        return (existing, None);
    }
    let session_id = Uuid::new_v4().to_string();
    let cookie = format!("{SESSION_COOKIE}={session_id}; HttpOnly; Path=/; SameSite=Lax");
    (session_id, Some(cookie))
}

fn with_cookie(response: Response, cookie: Option<String>) -> Response {
    let Some(cookie) = cookie else {
        return response;
    };
    let mut response = response;
    if let Ok(value) = cookie.parse() {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

// ----------------------------------------------------------------------
// Request context assembly
// ----------------------------------------------------------------------

async fn build_context(
    state: &BrokerState,
    headers: &HeaderMap,
    method: Method,
    uri: &Uri,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
) -> (RequestContext, Option<String>) {
    let (session_id, cookie) = session_for(headers);
    let username = state
        .engine
        .sessions()
        .authenticated_username(&session_id)
        .await;
    let authenticated = username.is_some();
    let mut page = uri.path().trim_start_matches('/').to_owned();
    if page.is_empty() {
        page = "login".to_owned();
    }

    // The standalone server infers the phase from the page; an embedding
    // host sets it from its own request lifecycle instead.
    let phase = if page == "login" {
        RequestPhase::LoginForm
    } else {
        RequestPhase::Navigation
    };

    let url = format!(
        "{}{}",
        state.external_url.trim_end_matches('/'),
        uri.path_and_query().map_or("/", |pq| pq.as_str())
    );

    let ctx = RequestContext {
        session_id,
        username,
        authenticated,
        method,
        page,
        url,
        query,
        form,
        phase,
    };
    (ctx, cookie)
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

/// The per-request entry point: runs the engine before "rendering" the page.
async fn handle_page(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let (ctx, cookie) = build_context(
        &state,
        &headers,
        Method::GET,
        &uri,
        query,
        HashMap::new(),
    )
    .await;
    let decision = state.engine.on_page_request(&ctx).await;
    with_cookie(render_decision(&state, &ctx, decision).await, cookie)
}

/// POST variant of the page hook (e-signature actions, deletion events)
async fn handle_page_post(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let (ctx, cookie) = build_context(&state, &headers, Method::POST, &uri, query, form).await;
    let decision = state.engine.on_page_request(&ctx).await;
    with_cookie(render_decision(&state, &ctx, decision).await, cookie)
}

/// Provider callback endpoint: accepts `state` and `code` (or the SAML/CAS
/// equivalents relayed by the host glue) and drives the exchange.
async fn handle_callback(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let received_state = query.get("state").cloned().unwrap_or_default();
    let code = query
        .get("code")
        .or_else(|| query.get("ticket"))
        .or_else(|| query.get("assertion"))
        .cloned()
        .unwrap_or_default();

    let (ctx, cookie) = build_context(
        &state,
        &headers,
        Method::GET,
        &uri,
        query,
        HashMap::new(),
    )
    .await;
    let response = match state
        .engine
        .complete_callback(&ctx, &received_state, &code)
        .await
    {
        Ok(decision) => render_decision(&state, &ctx, decision).await,
        Err(e) => e.into_response(),
    };
    with_cookie(response, cookie)
}

/// Standalone chooser page
async fn handle_chooser(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let (ctx, cookie) = build_context(
        &state,
        &headers,
        Method::GET,
        &uri,
        query,
        HashMap::new(),
    )
    .await;
    let response = match render_chooser(&state, &ctx).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => e.into_response(),
    };
    with_cookie(response, cookie)
}

// ----------------------------------------------------------------------
// Decision rendering
// ----------------------------------------------------------------------

/// Turn an engine decision into an HTTP response. `Continue` renders the
/// host's page; the standalone server substitutes a placeholder.
pub(crate) async fn render_decision(
    state: &BrokerState,
    ctx: &RequestContext,
    decision: Decision,
) -> Response {
    match decision {
        Decision::Continue => Html(format!(
            "<html><body><h3>{}</h3></body></html>",
            html_escape::encode_text(&format!("Host page: /{}", ctx.page))
        ))
        .into_response(),
        Decision::Redirect(url) => Redirect::to(&url).into_response(),
        Decision::ShowAttestation(prompt) => {
            let payload = serde_json::to_string(&prompt).unwrap_or_else(|_| "{}".to_owned());
            let html = ATTESTATION_TEMPLATE
                .replace(
                    "{{ATTESTATION_TEXT}}",
                    &html_escape::encode_text(&prompt.text),
                )
                .replace("{{PAYLOAD_JSON}}", &payload);
            Html(html).into_response()
        }
        Decision::ShowEmailUpdate { username } => {
            let ticket_link = match state.settings.get_setting(keys::TICKET_URL).await {
                Ok(Some(value)) => value.as_str().map(str::to_owned).unwrap_or_default(),
                _ => String::new(),
            };
            let link_html = if ticket_link.is_empty() {
                String::new()
            } else {
                format!(
                    r#"<a href="{}">Open a support ticket</a>"#,
                    html_escape::encode_double_quoted_attribute(&ticket_link)
                )
            };
            let html = EMAIL_UPDATE_TEMPLATE
                .replace("{{USERNAME}}", &html_escape::encode_text(&username))
                .replace("{{TICKET_LINK}}", &link_html);
            Html(html).into_response()
        }
        Decision::ShowChooser { mode } => match render_chooser(state, ctx).await {
            Ok(html) => match mode {
                ChooserMode::Complete | ChooserMode::Modified => Html(html).into_response(),
                // Injection mode returns the fragment for the host to place
                ChooserMode::LinkOnly => Html(
                    r#"<a href="/auth/chooser">Sign in with an identity provider</a>"#.to_owned(),
                )
                .into_response(),
            },
            Err(e) => e.into_response(),
        },
        Decision::ShowNoAccess { username } => {
            let html =
                NO_ACCESS_TEMPLATE.replace("{{USERNAME}}", &html_escape::encode_text(&username));
            (StatusCode::FORBIDDEN, Html(html)).into_response()
        }
        Decision::Halt => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Build the chooser HTML: one option per configured site, in configuration
/// order, plus the local-login link.
async fn render_chooser(state: &BrokerState, ctx: &RequestContext) -> AppResult<String> {
    let sites = state.engine.registry().list_all().await?;
    debug!(count = sites.len(), "rendering login chooser");

    let mut options = String::new();
    for site in &sites {
        let target = add_query_param(&ctx.url, query_params::AUTH_TYPE, &site.auth_value);
        let target = add_query_param(&target, query_params::SITE_ID, &site.site_id);
        options.push_str(&format!(
            r#"<a class="login-option" href="{}">{}</a>
"#,
            html_escape::encode_double_quoted_attribute(&target),
            html_escape::encode_text(&site.label),
        ));
    }
    let local_url = add_query_param(&ctx.url, query_params::AUTH_TYPE, LOCAL_AUTH);
    Ok(CHOOSER_TEMPLATE
        .replace("{{PROVIDER_OPTIONS}}", &options)
        .replace(
            "{{LOCAL_LOGIN_URL}}",
            &html_escape::encode_double_quoted_attribute(&local_url),
        ))
}
