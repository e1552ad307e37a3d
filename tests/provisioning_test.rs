// ABOUTME: Provisioning and account-linking tests, including all-or-nothing bulk conversions
// ABOUTME: Covers auth-source resolution order and the throttled password-reset sweep
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use common::{create_test_harness, create_test_user, RecordingMailer};
use idp_broker::database::UserDirectory;
use idp_broker::models::{AuthSource, UserProfile};

fn full_profile(username: &str) -> UserProfile {
    UserProfile {
        username: username.to_owned(),
        email: format!("{username}@example.org"),
        first_name: "Jane".to_owned(),
        last_name: "Doe".to_owned(),
        ..UserProfile::default()
    }
}

#[tokio::test]
async fn create_user_requires_complete_profile() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;

    let mut sparse = full_profile("jdoe");
    sparse.last_name = String::new();
    assert!(!provisioner.create_user("jdoe", &sparse).await.unwrap());
    assert!(!provisioner.user_exists("jdoe").await.unwrap());

    assert!(provisioner
        .create_user("jdoe", &full_profile("jdoe"))
        .await
        .unwrap());
    assert!(provisioner.user_exists("jdoe").await.unwrap());
}

#[tokio::test]
async fn auth_source_resolution_order() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();

    // Unknown by default
    assert_eq!(
        provisioner.auth_source("nobody").await.unwrap(),
        AuthSource::Unknown
    );

    // Password credential wins when no binding exists
    create_test_user(&harness.database, "alice").await.unwrap();
    directory.insert_credential("alice").await.unwrap();
    assert_eq!(
        provisioner.auth_source("alice").await.unwrap(),
        AuthSource::LocalPassword
    );

    // Provider binding takes precedence over everything
    provisioner
        .set_provider_binding("alice", Some("00ff"))
        .await
        .unwrap();
    assert_eq!(
        provisioner.auth_source("alice").await.unwrap(),
        AuthSource::Provider {
            site_id: "00ff".to_owned()
        }
    );

    // Allow-list only resolves for users with neither
    directory.add_to_allowlist("carol").await.unwrap();
    assert_eq!(
        provisioner.auth_source("carol").await.unwrap(),
        AuthSource::Allowlisted
    );
}

#[tokio::test]
async fn convert_to_provider_removes_password_credential() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();

    create_test_user(&harness.database, "alice").await.unwrap();
    directory.insert_credential("alice").await.unwrap();

    provisioner
        .convert_to_provider_user("alice", "00ff")
        .await
        .unwrap();
    assert!(!directory.is_password_user("alice").await.unwrap());
    assert_eq!(
        provisioner.auth_source("alice").await.unwrap(),
        AuthSource::Provider {
            site_id: "00ff".to_owned()
        }
    );
}

#[tokio::test]
async fn convert_to_local_inserts_credential_and_sends_reset() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();
    let mailer = RecordingMailer::new();

    create_test_user(&harness.database, "alice").await.unwrap();
    provisioner
        .set_provider_binding("alice", Some("00ff"))
        .await
        .unwrap();

    assert!(provisioner
        .convert_to_local_user("alice", mailer.as_ref())
        .await
        .unwrap());
    assert!(directory.is_password_user("alice").await.unwrap());
    assert_eq!(
        provisioner.auth_source("alice").await.unwrap(),
        AuthSource::LocalPassword
    );
    assert_eq!(mailer.sent_to(), vec!["alice".to_owned()]);
}

#[tokio::test]
async fn convert_to_local_refuses_non_provider_users() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let mailer = RecordingMailer::new();

    create_test_user(&harness.database, "bob").await.unwrap();
    assert!(!provisioner
        .convert_to_local_user("bob", mailer.as_ref())
        .await
        .unwrap());
    assert!(mailer.sent_to().is_empty());
}

#[tokio::test]
async fn bulk_convert_to_local_is_all_or_nothing() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();

    // A is provider-bound; B already has a password credential
    create_test_user(&harness.database, "a").await.unwrap();
    create_test_user(&harness.database, "b").await.unwrap();
    provisioner.set_provider_binding("a", Some("00ff")).await.unwrap();
    directory.insert_credential("b").await.unwrap();

    let outcome = provisioner
        .convert_all_to_local_users(&["a".to_owned(), "b".to_owned()])
        .await
        .unwrap();
    assert!(!outcome.succeeded());
    assert_eq!(outcome.blocked, vec!["b".to_owned()]);
    assert!(outcome.converted.is_empty());

    // The batch aborted: A keeps its provider binding and no credential
    assert!(!directory.is_password_user("a").await.unwrap());
    assert_eq!(
        provisioner.auth_source("a").await.unwrap(),
        AuthSource::Provider {
            site_id: "00ff".to_owned()
        }
    );
}

#[tokio::test]
async fn bulk_convert_to_local_queues_reset_markers() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();

    create_test_user(&harness.database, "a").await.unwrap();
    create_test_user(&harness.database, "b").await.unwrap();
    provisioner.set_provider_binding("a", Some("00ff")).await.unwrap();
    provisioner.set_provider_binding("b", Some("00ff")).await.unwrap();

    let outcome = provisioner
        .convert_all_to_local_users(&["a".to_owned(), "b".to_owned()])
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert!(directory.is_password_user("a").await.unwrap());
    assert!(directory.is_password_user("b").await.unwrap());

    let pending = directory.pending_password_resets().await.unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn bulk_convert_to_provider_clears_credentials() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();

    for name in ["a", "b"] {
        create_test_user(&harness.database, name).await.unwrap();
        directory.insert_credential(name).await.unwrap();
    }

    provisioner
        .convert_all_to_provider_users(&["a".to_owned(), "b".to_owned()], "00ff")
        .await
        .unwrap();
    for name in ["a", "b"] {
        assert!(!directory.is_password_user(name).await.unwrap());
        assert_eq!(
            provisioner.auth_source(name).await.unwrap(),
            AuthSource::Provider {
                site_id: "00ff".to_owned()
            }
        );
    }
}

#[tokio::test]
async fn reset_sweep_sends_and_clears_markers() {
    let harness = create_test_harness().await.unwrap();
    let provisioner = &harness.provisioner;
    let directory = harness.directory();
    let mailer = RecordingMailer::new();

    create_test_user(&harness.database, "a").await.unwrap();
    provisioner.set_provider_binding("a", Some("00ff")).await.unwrap();
    let outcome = provisioner
        .convert_all_to_local_users(&["a".to_owned()])
        .await
        .unwrap();
    assert!(outcome.succeeded());

    let sent = provisioner
        .send_password_reset_emails(mailer.as_ref())
        .await
        .unwrap();
    assert_eq!(sent, 1);
    assert_eq!(mailer.sent_to(), vec!["a".to_owned()]);
    assert!(directory.pending_password_resets().await.unwrap().is_empty());
    // The binding is cleared once the reset notice is out
    assert_eq!(
        provisioner.auth_source("a").await.unwrap(),
        AuthSource::LocalPassword
    );

    // Nothing left: a second sweep is a no-op
    let sent = provisioner
        .send_password_reset_emails(mailer.as_ref())
        .await
        .unwrap();
    assert_eq!(sent, 0);
}
