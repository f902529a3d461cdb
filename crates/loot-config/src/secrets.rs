//! Runtime secret resolution.
//!
//! Config YAML stores only env var NAMES (`daemon.admin_token_env`,
//! `daemon.database_url_env`). Binaries call [`resolve_secrets_for_mode`] once
//! at startup and pass the result into constructors; nothing else reads these
//! env vars. `Debug` redacts every value and errors name the variable, never
//! its contents.
//!
//! | Mode     | Required                          |
//! |----------|-----------------------------------|
//! | Daemon   | database URL unless `memory_store` |
//! | Operator | database URL                      |
//! | Client   | nothing                           |
//!
//! The admin token is always optional; a daemon without one refuses every
//! admin call.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::ConfigMode;

const DEFAULT_ADMIN_TOKEN_ENV: &str = "LOOT_ADMIN_TOKEN";
const DEFAULT_DATABASE_URL_ENV: &str = "LOOT_DATABASE_URL";

/// Secrets resolved from the environment. **Values are redacted in `Debug`.**
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub database_url: Option<String>,
    pub admin_token: Option<String>,
    /// Env var names, kept for error messages.
    pub database_url_env: String,
    pub admin_token_env: String,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field("database_url_env", &self.database_url_env)
            .field("admin_token_env", &self.admin_token_env)
            .finish()
    }
}

impl ResolvedSecrets {
    /// Constant-time comparison of a presented bearer token.
    pub fn admin_token_matches(&self, presented: &str) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return false;
        };
        let (a, b) = (expected.as_bytes(), presented.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve secrets for `mode`.
///
/// `memory_store` is the explicit dev switch (`LOOT_STORE=memory`); with it a
/// daemon starts without a database URL.
pub fn resolve_secrets_for_mode(
    config_json: &Value,
    mode: ConfigMode,
    memory_store: bool,
) -> Result<ResolvedSecrets> {
    let database_url_env = read_str_at(config_json, "/daemon/database_url_env")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL_ENV.to_string());
    let admin_token_env = read_str_at(config_json, "/daemon/admin_token_env")
        .unwrap_or_else(|| DEFAULT_ADMIN_TOKEN_ENV.to_string());

    let database_url = resolve_env(&database_url_env);
    let admin_token = resolve_env(&admin_token_env);

    let needs_db = match mode {
        ConfigMode::Daemon => !memory_store,
        ConfigMode::Operator => true,
        ConfigMode::Client => false,
    };
    if needs_db && database_url.is_none() {
        bail!(
            "SECRETS_MISSING mode={}: required env var '{}' (database url) is not set or empty",
            mode.as_str(),
            database_url_env,
        );
    }

    Ok(ResolvedSecrets {
        database_url,
        admin_token,
        database_url_env,
        admin_token_env,
    })
}
