//! Configuration module for Graph credentials and local paths
//!
//! All configuration is loaded from environment variables prefixed with
//! `OUTLOOK_`. Missing application credentials are not fatal: the server
//! starts and every tool fails with an actionable `AuthRequired` error until
//! credentials and consent are in place.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Address the consent callback listener binds
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Default Graph REST endpoint
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
/// Default identity platform host
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
/// Token cache file name placed in the home directory
const TOKEN_CACHE_FILE: &str = ".outlook_mcp_token_cache.json";
/// Attachment directory name placed in the home directory
const ATTACHMENT_DIR: &str = "outlook_mcp_attachments";

/// Server-wide configuration
///
/// Cloned into the auth manager, Graph client, and tool handlers at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application (client) id of the app registration
    pub client_id: String,
    /// Application secret; `None` disables app-only acquisition
    pub client_secret: Option<SecretString>,
    /// Tenant/directory id, or `common` for multi-tenant sign-in
    pub tenant_id: String,
    /// Identity platform host (no trailing slash)
    pub authority_host: String,
    /// Graph REST base URL (no trailing slash)
    pub graph_base_url: String,
    /// Serialized credential cache location
    pub token_cache_path: PathBuf,
    /// Destination directory for downloaded attachments
    pub attachment_dir: PathBuf,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
    /// Loopback port for the interactive consent callback
    pub redirect_port: u16,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed, or if no
    /// home directory can be resolved for a default path.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// OUTLOOK_CLIENT_ID=00000000-0000-0000-0000-000000000000
    /// OUTLOOK_CLIENT_SECRET=app-secret
    /// OUTLOOK_TENANT_ID=common
    /// OUTLOOK_ATTACHMENT_DIR=/tmp/outlook
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let client_id = optional_env("OUTLOOK_CLIENT_ID")?.unwrap_or_default();
        let client_secret =
            optional_env("OUTLOOK_CLIENT_SECRET")?.map(|s| SecretString::new(s.into()));
        if client_id.is_empty() || client_secret.is_none() {
            tracing::warn!(
                "OUTLOOK_CLIENT_ID and OUTLOOK_CLIENT_SECRET should be set; tools will fail until configured"
            );
        }

        let token_cache_path = match optional_env("OUTLOOK_TOKEN_CACHE_PATH")? {
            Some(p) => PathBuf::from(p),
            None => home_dir()?.join(TOKEN_CACHE_FILE),
        };
        let attachment_dir = match optional_env("OUTLOOK_ATTACHMENT_DIR")? {
            Some(p) => PathBuf::from(p),
            None => home_dir()?.join(ATTACHMENT_DIR),
        };

        Ok(Self {
            client_id,
            client_secret,
            tenant_id: optional_env("OUTLOOK_TENANT_ID")?.unwrap_or_else(|| "common".to_owned()),
            authority_host: trim_url(
                optional_env("OUTLOOK_AUTHORITY_HOST")?
                    .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_owned()),
            ),
            graph_base_url: trim_url(
                optional_env("OUTLOOK_GRAPH_BASE_URL")?
                    .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_owned()),
            ),
            token_cache_path,
            attachment_dir,
            request_timeout_secs: parse_u64_env("OUTLOOK_REQUEST_TIMEOUT_SECONDS", 30)?,
            redirect_port: parse_u16_env("OUTLOOK_REDIRECT_PORT", 5000)?,
        })
    }

    /// Redirect URI registered for the interactive consent flow
    ///
    /// Names the same address the callback listener binds.
    pub fn redirect_uri(&self) -> String {
        format!("http://{LOOPBACK_HOST}:{}/callback", self.redirect_port)
    }
}

fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| {
        AppError::InvalidInput(
            "cannot resolve home directory; set OUTLOOK_TOKEN_CACHE_PATH and OUTLOOK_ATTACHMENT_DIR"
                .to_owned(),
        )
    })
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_owned()
}

/// Read an optional environment variable, treating blank values as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u16` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match optional_env(key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a positive `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a positive `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => match v.parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(AppError::InvalidInput(format!(
                "invalid positive integer environment variable {key}: '{v}'"
            ))),
        },
        None => Ok(default),
    }
}
