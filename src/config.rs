// ABOUTME: Server configuration parsed from CLI flags and environment variables
// ABOUTME: Environment-only deployments work with no flags at all
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use clap::Parser;

/// Runtime configuration for the standalone broker server
#[derive(Debug, Clone, Parser)]
#[command(name = "idp-broker", about = "Multi-provider authentication broker")]
pub struct ServerConfig {
    /// HTTP listen port
    #[arg(long, env = "BROKER_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// SQLite database URL
    #[arg(long, env = "BROKER_DATABASE_URL", default_value = "sqlite:idp-broker.db")]
    pub database_url: String,

    /// Externally visible base URL, used to build absolute page URLs
    #[arg(long, env = "BROKER_EXTERNAL_URL", default_value = "http://localhost:8080")]
    pub external_url: String,
}

impl ServerConfig {
    /// Parse from the process environment and arguments
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse()
    }
}
