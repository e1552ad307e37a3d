// ABOUTME: Decision engine tests - priority ordering, callback completion, and failure teardown
// ABOUTME: Drives full login scenarios over the scripted transport and in-memory stores
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use chrono::Utc;
use common::{
    authenticated_ctx, create_test_harness, create_test_user, entra_site, jdoe_profile_body,
    login_url, navigation_ctx, store_sites,
};
use idp_broker::audit::AuditKind;
use idp_broker::constants::settings as keys;
use idp_broker::database::UserDirectory;
use idp_broker::errors::AppError;
use idp_broker::models::{
    AuthSource, ChooserMode, Decision, RequestPhase, UserRecord,
};
use idp_broker::session::SessionFacade;
use idp_broker::state_token::StateToken;
use serde_json::json;

const ORIGIN: &str = "https://app.example.org/home?authtype=contoso";

/// Scripts a successful token + profile + group exchange on the transport
fn script_successful_exchange(harness: &common::TestHarness) {
    harness
        .transport
        .push_ok(json!({ "access_token": "tok-abc", "expires_in": 3599 }));
    harness.transport.push_ok(jdoe_profile_body());
    harness.transport.push_ok(json!({ "value": [] }));
}

#[tokio::test]
async fn unauthenticated_auth_request_redirects_to_provider() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();

    let ctx = navigation_ctx("sess-1", &login_url(&site));
    let decision = harness.engine.on_page_request(&ctx).await;

    let Decision::Redirect(url) = decision else {
        panic!("expected a provider redirect, got {decision:?}");
    };
    assert!(url.starts_with(
        "https://login.microsoftonline.com/tenant-abcde/oauth2/v2.0/authorize?"
    ));
    let expected_state = StateToken::new("sess-1", &site.site_id, &login_url(&site)).encode();
    assert!(url.contains(&format!("state={}", urlencoding::encode(&expected_state))));
    assert!(url.contains("scope=User.Read"));
    assert!(url.contains("response_type=code"));
    assert!(url.contains("client_id=client-12345"));
}

#[tokio::test]
async fn unknown_auth_type_fails_closed() {
    let harness = create_test_harness().await.unwrap();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/home?authtype=ghost");
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Continue));
}

#[tokio::test]
async fn callback_provisions_user_and_authenticates_session() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    harness.set_flag(keys::AUTO_PROVISION, true).await.unwrap();
    script_successful_exchange(&harness);

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let decision = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap();

    // Redirected back to the origin, stripped of provider parameters
    let Decision::Redirect(url) = decision else {
        panic!("expected redirect, got {decision:?}");
    };
    assert_eq!(url, "https://app.example.org/home");

    assert!(harness.sessions.is_authenticated("sess-1").await);
    assert_eq!(
        harness.sessions.authenticated_username("sess-1").await,
        Some("jdoe".to_owned())
    );
    let user = harness.directory().get_user("jdoe").await.unwrap().unwrap();
    assert_eq!(user.email, "jdoe@example.org");
    assert_eq!(
        harness.provisioner.auth_source("jdoe").await.unwrap(),
        AuthSource::Provider {
            site_id: site.site_id.clone()
        }
    );
    let successes = harness
        .database
        .count_audit_events_since(AuditKind::LoginSuccess, 60)
        .await
        .unwrap();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn callback_with_forged_state_fails_without_network_calls() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();

    let state = StateToken::new("other-session", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let err = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::StateMismatch));
    assert_eq!(harness.transport.call_count(), 0);
    assert!(!harness.sessions.is_authenticated("sess-1").await);
    let mismatches = harness
        .database
        .count_audit_events_since(AuditKind::StateMismatch, 60)
        .await
        .unwrap();
    assert_eq!(mismatches, 1);
}

#[tokio::test]
async fn callback_denied_when_autoprovision_disabled_and_user_unknown() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    script_successful_exchange(&harness);

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let err = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ProvisioningDenied(_)));
    assert!(!harness.sessions.is_authenticated("sess-1").await);
    assert!(!harness.provisioner.user_exists("jdoe").await.unwrap());
}

#[tokio::test]
async fn callback_suspends_on_pending_attestation_and_resumes() {
    let harness = create_test_harness().await.unwrap();
    let mut site = entra_site("contoso");
    site.attestation_version = Some("2".to_owned());
    site.attestation_text = "Terms of use".to_owned();
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    harness.set_flag(keys::AUTO_PROVISION, true).await.unwrap();
    script_successful_exchange(&harness);

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let decision = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap();

    // Deliberate suspension: login is not finalized
    let Decision::ShowAttestation(prompt) = decision else {
        panic!("expected attestation suspension, got {decision:?}");
    };
    assert_eq!(prompt.username, "jdoe");
    assert_eq!(prompt.version, "2");
    assert!(prompt.profile.is_some());
    assert!(!harness.sessions.is_authenticated("sess-1").await);

    // Re-submission records acceptance and re-drives the login
    let decision = harness
        .engine
        .resume_after_attestation(
            &ctx,
            &prompt.site_id,
            &prompt.username,
            &prompt.version,
            prompt.profile.clone(),
            &prompt.origin_url,
        )
        .await
        .unwrap();
    assert!(matches!(decision, Decision::Redirect(_)));
    assert!(harness.sessions.is_authenticated("sess-1").await);
    assert!(!harness
        .engine
        .attestation()
        .needs_attestation_local(&site, "jdoe")
        .await
        .unwrap());
}

#[tokio::test]
async fn resume_rejects_stale_attestation_version() {
    let harness = create_test_harness().await.unwrap();
    let mut site = entra_site("contoso");
    site.attestation_version = Some("3".to_owned());
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();

    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let err = harness
        .engine
        .resume_after_attestation(&ctx, &site.site_id, "jdoe", "2", None, "https://x/")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn callback_rejects_user_outside_allowlist_and_destroys_session() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    harness.set_flag(keys::AUTO_PROVISION, true).await.unwrap();
    harness.set_flag(keys::ALLOWLIST_ENABLED, true).await.unwrap();
    script_successful_exchange(&harness);

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let decision = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap();

    let Decision::ShowNoAccess { username } = decision else {
        panic!("expected no-access page, got {decision:?}");
    };
    assert_eq!(username, "jdoe");
    // No lasting authenticated state survives the rejection
    assert!(!harness.sessions.is_authenticated("sess-1").await);
}

#[tokio::test]
async fn callback_honors_group_restriction() {
    let harness = create_test_harness().await.unwrap();
    let mut site = entra_site("contoso");
    site.allowed_groups = vec!["g-needed".to_owned()];
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    harness.set_flag(keys::AUTO_PROVISION, true).await.unwrap();
    script_successful_exchange(&harness); // empty group list

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let decision = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap();

    assert!(matches!(decision, Decision::ShowNoAccess { .. }));
    assert!(!harness.sessions.is_authenticated("sess-1").await);
}

#[tokio::test]
async fn callback_shows_email_update_for_unverified_user() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();

    // Pre-existing user with a pending verification code
    let record = UserRecord {
        username: "jdoe".to_owned(),
        first_name: "Jane".to_owned(),
        last_name: "Doe".to_owned(),
        email: "jdoe@example.org".to_owned(),
        email_verify_code: "pending-123".to_owned(),
        is_admin: false,
        created_at: Utc::now(),
    };
    harness.directory().insert_user(&record).await.unwrap();
    script_successful_exchange(&harness);

    let state = StateToken::new("sess-1", &site.site_id, ORIGIN).encode();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/auth/callback");
    let decision = harness
        .engine
        .complete_callback(&ctx, &state, "code-1")
        .await
        .unwrap();

    let Decision::ShowEmailUpdate { username } = decision else {
        panic!("expected email-update page, got {decision:?}");
    };
    assert_eq!(username, "jdoe");
}

#[tokio::test]
async fn non_auth_posts_are_ignored() {
    let harness = create_test_harness().await.unwrap();
    let mut ctx = navigation_ctx("sess-1", "https://app.example.org/data/save");
    ctx.method = http::Method::POST;
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Continue));
}

#[tokio::test]
async fn password_reset_flow_is_never_interposed() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();

    let mut ctx = navigation_ctx("sess-1", &login_url(&site));
    ctx.phase = RequestPhase::PasswordReset;
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Continue));
}

#[tokio::test]
async fn stray_site_id_parameter_is_stripped() {
    let harness = create_test_harness().await.unwrap();
    let ctx = navigation_ctx("sess-1", "https://app.example.org/home?sid=00ff&view=2");
    let decision = harness.engine.on_page_request(&ctx).await;
    let Decision::Redirect(url) = decision else {
        panic!("expected redirect, got {decision:?}");
    };
    assert!(!url.contains("sid="));
    assert!(url.contains("view=2"));
}

#[tokio::test]
async fn authenticated_user_gets_provider_parameters_stripped() {
    let harness = create_test_harness().await.unwrap();
    create_test_user(&harness.database, "alice").await.unwrap();
    harness.sessions.mark_authenticated("sess-1", "alice").await;

    let ctx = authenticated_ctx(
        "sess-1",
        "alice",
        "https://app.example.org/home?authtype=local&view=2",
    );
    let decision = harness.engine.on_page_request(&ctx).await;
    let Decision::Redirect(url) = decision else {
        panic!("expected redirect, got {decision:?}");
    };
    assert!(!url.contains("authtype="));
    assert!(url.contains("view=2"));
}

#[tokio::test]
async fn authenticated_user_outside_allowlist_is_ejected() {
    let harness = create_test_harness().await.unwrap();
    create_test_user(&harness.database, "mallory").await.unwrap();
    harness.set_flag(keys::ALLOWLIST_ENABLED, true).await.unwrap();
    harness
        .provisioner
        .set_provider_binding("mallory", Some("00ff"))
        .await
        .unwrap();
    harness.sessions.mark_authenticated("sess-1", "mallory").await;

    let ctx = authenticated_ctx("sess-1", "mallory", "https://app.example.org/home");
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::ShowNoAccess { .. }));
    assert!(!harness.sessions.is_authenticated("sess-1").await);
}

#[tokio::test]
async fn allowlist_exempts_password_users() {
    let harness = create_test_harness().await.unwrap();
    create_test_user(&harness.database, "alice").await.unwrap();
    harness.directory().insert_credential("alice").await.unwrap();
    harness.set_flag(keys::ALLOWLIST_ENABLED, true).await.unwrap();
    harness.sessions.mark_authenticated("sess-1", "alice").await;

    let ctx = authenticated_ctx("sess-1", "alice", "https://app.example.org/home");
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Continue));
    assert!(harness.sessions.is_authenticated("sess-1").await);
}

#[tokio::test]
async fn logout_destroys_session_and_forwards_to_provider() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    create_test_user(&harness.database, "jdoe").await.unwrap();
    harness
        .provisioner
        .set_provider_binding("jdoe", Some(&site.site_id))
        .await
        .unwrap();
    harness.sessions.mark_authenticated("sess-1", "jdoe").await;

    let ctx = authenticated_ctx("sess-1", "jdoe", "https://app.example.org/home?logout=1");
    let decision = harness.engine.on_page_request(&ctx).await;
    let Decision::Redirect(url) = decision else {
        panic!("expected redirect to end-session URL, got {decision:?}");
    };
    assert_eq!(url, site.logout_uri);
    assert!(!harness.sessions.is_authenticated("sess-1").await);
}

#[tokio::test]
async fn chooser_replaces_login_page_when_configured() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    harness
        .settings()
        .set_setting(keys::CHOOSER_MODE, &json!("complete"))
        .await
        .unwrap();

    let mut ctx = navigation_ctx("sess-1", "https://app.example.org/login");
    ctx.phase = RequestPhase::LoginForm;
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(
        decision,
        Decision::ShowChooser {
            mode: ChooserMode::Complete
        }
    ));
}

#[tokio::test]
async fn local_login_gets_link_back_to_chooser() {
    let harness = create_test_harness().await.unwrap();
    harness
        .settings()
        .set_setting(keys::CHOOSER_MODE, &json!("modified"))
        .await
        .unwrap();

    let mut ctx = navigation_ctx("sess-1", "https://app.example.org/login?authtype=local");
    ctx.phase = RequestPhase::LoginForm;
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(
        decision,
        Decision::ShowChooser {
            mode: ChooserMode::LinkOnly
        }
    ));
}

#[tokio::test]
async fn unverified_email_interrupts_local_login() {
    let harness = create_test_harness().await.unwrap();
    let record = UserRecord {
        username: "alice".to_owned(),
        first_name: "Alice".to_owned(),
        last_name: "Liddell".to_owned(),
        email: String::new(),
        email_verify_code: String::new(),
        is_admin: false,
        created_at: Utc::now(),
    };
    harness.directory().insert_user(&record).await.unwrap();

    let mut ctx = navigation_ctx("sess-1", "https://app.example.org/login");
    ctx.username = Some("alice".to_owned());
    ctx.phase = RequestPhase::Authenticating;
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(
        decision,
        Decision::ShowEmailUpdate { username } if username == "alice"
    ));
}

#[tokio::test]
async fn user_deletion_cascades_broker_settings() {
    let harness = create_test_harness().await.unwrap();
    let mut site = entra_site("contoso");
    site.attestation_version = Some("1".to_owned());
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    create_test_user(&harness.database, "jdoe").await.unwrap();
    harness
        .provisioner
        .set_provider_binding("jdoe", Some(&site.site_id))
        .await
        .unwrap();
    harness
        .engine
        .attestation()
        .record_acceptance("jdoe", &site.site_id, "1")
        .await
        .unwrap();

    let mut ctx = navigation_ctx("sess-1", "https://app.example.org/admin/delete_user");
    ctx.method = http::Method::POST;
    ctx.page = "admin/delete_user".to_owned();
    ctx.form.insert("username".to_owned(), "jdoe".to_owned());
    let decision = harness.engine.on_page_request(&ctx).await;

    assert!(matches!(decision, Decision::Continue));
    assert_eq!(
        harness.provisioner.auth_source("jdoe").await.unwrap(),
        AuthSource::Unknown
    );
    assert!(harness
        .engine
        .attestation()
        .record("jdoe", &site.site_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn esignature_mismatch_halts_request() {
    let harness = create_test_harness().await.unwrap();
    create_test_user(&harness.database, "jdoe").await.unwrap();
    harness
        .provisioner
        .set_provider_binding("jdoe", Some("00ff"))
        .await
        .unwrap();
    harness.sessions.mark_authenticated("sess-1", "jdoe").await;
    harness.sessions.set_esign_code("sess-1", "right-code").await;

    let mut ctx = authenticated_ctx("sess-1", "jdoe", "https://app.example.org/locking/sign_action");
    ctx.method = http::Method::POST;
    ctx.page = "locking/sign_action".to_owned();
    ctx.form.insert("esign_action".to_owned(), "save".to_owned());
    ctx.form.insert("username".to_owned(), "jdoe".to_owned());
    ctx.form.insert("esign_code".to_owned(), "wrong-code".to_owned());

    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Halt));
}

#[tokio::test]
async fn esignature_match_continues_and_consumes_code() {
    let harness = create_test_harness().await.unwrap();
    create_test_user(&harness.database, "jdoe").await.unwrap();
    harness
        .provisioner
        .set_provider_binding("jdoe", Some("00ff"))
        .await
        .unwrap();
    harness.sessions.mark_authenticated("sess-1", "jdoe").await;
    harness.sessions.set_esign_code("sess-1", "right-code").await;

    let mut ctx = authenticated_ctx("sess-1", "jdoe", "https://app.example.org/locking/sign_action");
    ctx.method = http::Method::POST;
    ctx.page = "locking/sign_action".to_owned();
    ctx.form.insert("esign_action".to_owned(), "save".to_owned());
    ctx.form.insert("username".to_owned(), "jdoe".to_owned());
    ctx.form.insert("esign_code".to_owned(), "right-code".to_owned());

    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Continue));

    // One-time code: a replay of the same POST is rejected
    let decision = harness.engine.on_page_request(&ctx).await;
    assert!(matches!(decision, Decision::Halt));
}

#[tokio::test]
async fn user_type_resolution_for_admin_surface() {
    let harness = create_test_harness().await.unwrap();
    let site = entra_site("contoso");
    store_sites(harness.settings().as_ref(), &[site.clone()])
        .await
        .unwrap();
    create_test_user(&harness.database, "bound").await.unwrap();
    create_test_user(&harness.database, "pw").await.unwrap();
    harness
        .provisioner
        .set_provider_binding("bound", Some(&site.site_id))
        .await
        .unwrap();
    harness.directory().insert_credential("pw").await.unwrap();

    let info = harness.engine.user_type("bound").await.unwrap();
    assert_eq!(
        info.auth_source,
        AuthSource::Provider {
            site_id: site.site_id.clone()
        }
    );
    assert_eq!(info.label, "contoso login");

    let info = harness.engine.user_type("pw").await.unwrap();
    assert_eq!(info.auth_source, AuthSource::LocalPassword);

    let all = harness.engine.list_user_types().await.unwrap();
    assert_eq!(all.len(), 2);
}
