//! Shared utilities for demos.
//!
//! Provides common functionality used across all demos:
//! - Command-line argument parsing
//! - Logging initialization
//! - Credentials from the environment

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use anyhow::Context;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

/// Service address used when `FRANKLY_URL` is unset.
pub const DEFAULT_URL: &str = "wss://app.franklychat.com";

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments for demos.
#[derive(Debug, Clone)]
pub struct Args {
    pub debug: bool,
    pub http: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self {
            debug: args.iter().any(|a| a == "--debug"),
            http: args.iter().any(|a| a == "--http"),
        }
    }
}

/// App credentials read from the environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub url: String,
    pub app_key: String,
    pub app_secret: String,
    pub user_id: Option<u64>,
}

impl Credentials {
    /// Reads `FRANKLY_URL`, `FRANKLY_APP_KEY`, `FRANKLY_APP_SECRET` and
    /// `FRANKLY_USER_ID`.
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("FRANKLY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
        let app_key = std::env::var("FRANKLY_APP_KEY").context("FRANKLY_APP_KEY is not set")?;
        let app_secret =
            std::env::var("FRANKLY_APP_SECRET").context("FRANKLY_APP_SECRET is not set")?;
        let user_id = match std::env::var("FRANKLY_USER_ID") {
            Ok(id) => Some(id.parse().context("FRANKLY_USER_ID must be an integer")?),
            Err(_) => None,
        };
        Ok(Self {
            url,
            app_key,
            app_secret,
            user_id,
        })
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        "frankly_client=trace"
    } else {
        "frankly_client=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
