// ABOUTME: AJAX-style RPC endpoint with named actions for attestation and admin account management
// ABOUTME: Attestation handling needs no auth (it is part of the pre-login flow); the rest is admin-only
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use super::{build_context, BrokerState};
use crate::errors::{AppError, AppResult};
use crate::models::{AttestationPrompt, Decision};
use axum::{
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use tracing::warn;

/// RPC envelope: a named action plus its payload
#[derive(Debug, Deserialize)]
pub(crate) struct RpcRequest {
    action: String,
    #[serde(default)]
    payload: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsernamePayload {
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertSinglePayload {
    username: String,
    site_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertManyPayload {
    usernames: Vec<String>,
    #[serde(default)]
    site_id: String,
}

/// Dispatch one RPC request
pub(crate) async fn handle_rpc(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    uri: Uri,
    Json(request): Json<RpcRequest>,
) -> Response {
    let (ctx, _) = build_context(
        &state,
        &headers,
        Method::POST,
        &uri,
        HashMap::new(),
        HashMap::new(),
    )
    .await;

    // Attestation acceptance is itself part of the pre-login flow
    if request.action == "handleAttestation" {
        return match handle_attestation(&state, &ctx, request.payload).await {
            Ok(body) => Json(body).into_response(),
            Err(e) => {
                warn!(error = %e, "attestation RPC failed");
                e.into_response()
            }
        };
    }

    match dispatch_admin(&state, &ctx, &request).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            warn!(action = %request.action, error = %e, "admin RPC failed");
            e.into_response()
        }
    }
}

async fn handle_attestation(
    state: &BrokerState,
    ctx: &crate::models::RequestContext,
    payload: JsonValue,
) -> AppResult<JsonValue> {
    let prompt: AttestationPrompt = serde_json::from_value(payload)
        .map_err(|e| AppError::invalid_input(format!("bad attestation payload: {e}")))?;
    let decision = state
        .engine
        .resume_after_attestation(
            ctx,
            &prompt.site_id,
            &prompt.username,
            &prompt.version,
            prompt.profile,
            &prompt.origin_url,
        )
        .await?;
    let redirect = match decision {
        Decision::Redirect(url) => Some(url),
        _ => None,
    };
    Ok(json!({ "status": "ok", "redirect": redirect }))
}

/// Admin actions require an authenticated session whose user carries the
/// elevated-privilege flag.
async fn require_admin(state: &BrokerState, ctx: &crate::models::RequestContext) -> AppResult<()> {
    let Some(username) = ctx.username.as_deref() else {
        return Err(AppError::unauthorized("admin action without a session"));
    };
    let is_admin = state
        .directory
        .get_user(username)
        .await?
        .is_some_and(|user| user.is_admin);
    if is_admin {
        Ok(())
    } else {
        Err(AppError::unauthorized(format!(
            "{username} is not an administrator"
        )))
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &JsonValue) -> AppResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| AppError::invalid_input(format!("bad payload: {e}")))
}

async fn dispatch_admin(
    state: &BrokerState,
    ctx: &crate::models::RequestContext,
    request: &RpcRequest,
) -> AppResult<JsonValue> {
    require_admin(state, ctx).await?;
    let provisioner = state.engine.provisioner();

    match request.action.as_str() {
        "getUserType" => {
            let payload: UsernamePayload = parse(&request.payload)?;
            let info = state.engine.user_type(&payload.username).await?;
            serde_json::to_value(info).map_err(|e| AppError::internal(e.to_string()))
        }
        "convertTableUserToProviderUser" => {
            let payload: ConvertSinglePayload = parse(&request.payload)?;
            provisioner
                .convert_to_provider_user(&payload.username, &payload.site_id)
                .await?;
            Ok(json!({ "status": "ok" }))
        }
        "convertTableUsersToProviderUsers" => {
            let payload: ConvertManyPayload = parse(&request.payload)?;
            // Single-user batches take the single-user path
            if let [username] = payload.usernames.as_slice() {
                provisioner
                    .convert_to_provider_user(username, &payload.site_id)
                    .await?;
            } else {
                provisioner
                    .convert_all_to_provider_users(&payload.usernames, &payload.site_id)
                    .await?;
            }
            Ok(json!({ "status": "ok" }))
        }
        "convertProviderUserToTableUser" => {
            let payload: UsernamePayload = parse(&request.payload)?;
            let converted = provisioner
                .convert_to_local_user(&payload.username, state.mailer.as_ref())
                .await?;
            Ok(json!({ "status": "ok", "converted": converted }))
        }
        "convertProviderUsersToTableUsers" => {
            let payload: ConvertManyPayload = parse(&request.payload)?;
            if let [username] = payload.usernames.as_slice() {
                let converted = provisioner
                    .convert_to_local_user(username, state.mailer.as_ref())
                    .await?;
                return Ok(json!({ "status": "ok", "converted": converted }));
            }
            let outcome = provisioner
                .convert_all_to_local_users(&payload.usernames)
                .await?;
            Ok(json!({
                "status": if outcome.succeeded() { "ok" } else { "blocked" },
                "converted": outcome.converted,
                "blocked": outcome.blocked,
            }))
        }
        "listProviderUsers" => {
            let users = state.engine.list_user_types().await?;
            serde_json::to_value(users).map_err(|e| AppError::internal(e.to_string()))
        }
        other => Err(AppError::invalid_input(format!("unknown action {other}"))),
    }
}
