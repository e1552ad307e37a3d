// ABOUTME: Main library entry point for the idp-broker authentication platform
// ABOUTME: Brokers logins between a host application and Entra ID, SAML, or CAS identity providers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

#![deny(unsafe_code)]

//! # IdP Broker
//!
//! An authentication broker that sits in front of a host web application and
//! decides, per request, which identity provider should authenticate the user.
//! The broker orchestrates the protocol exchange with that provider and
//! reconciles the result with the host's local user directory.
//!
//! ## Features
//!
//! - **Multi-provider support**: Entra ID (`OAuth2`/OIDC), SAML, and CAS sites
//!   configured side by side, selected per request
//! - **Anti-forgery state correlation**: every redirect carries a state token
//!   binding the session, the provider site, and the post-login URL
//! - **Account provisioning and linking**: creates local accounts from
//!   provider profiles and converts accounts between password-based and
//!   provider-bound authentication
//! - **Attestation gating**: versioned consent text a user must re-accept
//!   before a login completes
//! - **Allow-list enforcement**: optional explicit list of permitted usernames
//!
//! ## Architecture
//!
//! The server follows a modular architecture:
//! - **Engine**: the per-request decision state machine
//! - **Protocol**: `OAuth2`, SAML, and CAS clients behind one trait
//! - **Registry**: provider site configuration lookup
//! - **Provisioning**: user creation and account conversion
//! - **Database**: SQLite-backed settings store and user directory

/// Attestation (versioned consent) gate
pub mod attestation;

/// Audit logging for authentication events
pub mod audit;

/// Server configuration from environment/CLI
pub mod config;

/// Query parameter names, settings keys, and provider endpoints
pub mod constants;

/// SQLite persistence: settings store, user directory, allow-list
pub mod database;

/// Per-request authentication decision engine
pub mod engine;

/// Unified error handling with standard error kinds and HTTP responses
pub mod errors;

/// Production logging and structured output
pub mod logging;

/// Mail delivery seam for password-reset notices
pub mod mailer;

/// Common data models for provider sites, profiles, and request context
pub mod models;

/// Protocol clients for the supported identity-provider families
pub mod protocol;

/// User provisioning and account linking
pub mod provisioning;

/// Provider site registry
pub mod registry;

/// `HTTP` routes for the broker surface (callback, RPC, chooser, logout)
pub mod routes;

/// Host session facade
pub mod session;

/// State-token codec threaded through the provider `state` parameter
pub mod state_token;
