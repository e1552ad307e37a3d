// ABOUTME: Structured logging initialization for the standalone server
// ABOUTME: RUST_LOG controls the filter; defaults to info for the broker, warn elsewhere
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 IdP Broker Contributors

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Call once at process start.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,idp_broker=info"));
    fmt().with_env_filter(filter).init();
}
