// ABOUTME: Standalone broker server binary
// ABOUTME: Wires the sqlite stores, protocol clients, and engine into an Axum server
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use anyhow::{Context, Result};
use idp_broker::attestation::AttestationGate;
use idp_broker::audit::AuditLogger;
use idp_broker::config::ServerConfig;
use idp_broker::database::{Database, SettingsStore, UserDirectory};
use idp_broker::engine::AuthDecisionEngine;
use idp_broker::logging;
use idp_broker::mailer::{LogOnlyMailer, PasswordResetMailer};
use idp_broker::protocol::{HttpTransport, IdpTransport, ProtocolClients};
use idp_broker::registry::ProviderRegistry;
use idp_broker::routes::{BrokerRoutes, BrokerState};
use idp_broker::session::{InMemorySessions, SessionFacade};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let config = ServerConfig::from_env();

    let database = Arc::new(
        Database::new(&config.database_url)
            .await
            .context("failed to open database")?,
    );
    database.migrate().await.context("failed to migrate")?;

    let settings: Arc<dyn SettingsStore> = database.clone();
    let directory: Arc<dyn UserDirectory> = database.clone();
    let sessions: Arc<dyn SessionFacade> = Arc::new(InMemorySessions::new());
    let transport: Arc<dyn IdpTransport> =
        Arc::new(HttpTransport::new().context("failed to build transport")?);
    let mailer: Arc<dyn PasswordResetMailer> = Arc::new(LogOnlyMailer);

    let registry = ProviderRegistry::new(Arc::clone(&settings));
    // Newly configured sites receive their permanent ids at startup
    registry
        .assign_site_ids()
        .await
        .context("failed to assign site ids")?;

    let audit = Arc::new(AuditLogger::new(Arc::clone(&database)));
    let attestation = AttestationGate::new(Arc::clone(&settings));
    let provisioner = idp_broker::provisioning::UserProvisioner::new(
        Arc::clone(&directory),
        Arc::clone(&settings),
        Arc::clone(&audit),
    );
    let clients = ProtocolClients::new(transport);

    let engine = AuthDecisionEngine::new(
        Arc::clone(&settings),
        Arc::clone(&directory),
        sessions,
        registry,
        clients,
        attestation,
        provisioner,
        audit,
    );

    let state = BrokerState {
        engine,
        directory,
        settings,
        mailer,
        external_url: config.external_url.clone(),
    };
    let app = BrokerRoutes::routes(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.http_port);
    info!(%addr, "idp-broker listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
