//! Identity provider seam
//!
//! [`IdentityProvider`] is the boundary between the token lifecycle and the
//! network. [`EntraProvider`] talks to the Microsoft identity platform v2.0
//! endpoints; tests substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};

/// Identity of the user a grant was issued to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    /// Stable account key
    pub home_account_id: String,
    /// Sign-in name
    pub username: Option<String>,
}

/// Result of a successful token request
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds from issue
    pub expires_in: u64,
    /// Granted scopes; falls back to the requested scopes
    pub scopes: Vec<String>,
    /// Present when an id token accompanied the grant
    pub account: Option<AccountIdentity>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Token issuance operations of an OAuth2 identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Browser URL for the authorization-code flow with PKCE
    fn authorization_url(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> String;

    /// Redeem a one-time authorization code
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        scopes: &[String],
        code_verifier: &str,
    ) -> AppResult<TokenGrant>;

    /// Renew user tokens with a refresh token
    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> AppResult<TokenGrant>;

    /// Acquire an app-only token with the application secret
    async fn client_credentials(&self, scope: &str) -> AppResult<TokenGrant>;
}

/// Microsoft identity platform (v2.0 endpoints)
pub struct EntraProvider {
    client_id: String,
    client_secret: Option<SecretString>,
    authorize_endpoint: String,
    token_endpoint: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenEndpointError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl EntraProvider {
    /// Build a provider for the configured tenant
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be constructed.
    pub fn from_config(config: &ServerConfig) -> AppResult<Self> {
        let base = format!("{}/{}/oauth2/v2.0", config.authority_host, config.tenant_id);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authorize_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            http,
        })
    }

    fn require_client_id(&self) -> AppResult<()> {
        if self.client_id.is_empty() {
            return Err(AppError::AuthRequired(
                "OUTLOOK_CLIENT_ID is not configured".to_owned(),
            ));
        }
        Ok(())
    }

    async fn post_token(
        &self,
        mut form: Vec<(&str, String)>,
        requested: &[String],
    ) -> AppResult<TokenGrant> {
        self.require_client_id()?;
        form.push(("client_id", self.client_id.clone()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret().to_owned()));
        }

        let grant_type = form
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        tracing::debug!(grant_type = %grant_type, "requesting token");

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| map_send_error(&e))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<TokenEndpointError>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, first_line(&desc)),
                    None => err.error,
                },
                Err(_) => format!("HTTP {status}"),
            };
            tracing::warn!(grant_type = %grant_type, status = status.as_u16(), "token request rejected");
            return Err(AppError::Provider(format!("token request failed: {detail}")));
        }

        let parsed: TokenEndpointResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Provider(format!("invalid token response: {e}")))?;
        let scopes = match parsed.scope.as_deref() {
            Some(s) if !s.trim().is_empty() => s.split_whitespace().map(str::to_owned).collect(),
            _ => requested.to_vec(),
        };
        Ok(TokenGrant {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in.unwrap_or(3600),
            scopes,
            account: parsed.id_token.as_deref().and_then(identity_from_id_token),
        })
    }
}

#[async_trait]
impl IdentityProvider for EntraProvider {
    fn authorization_url(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> String {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("response_mode", "query"),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{query}", self.authorize_endpoint)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        scopes: &[String],
        code_verifier: &str,
    ) -> AppResult<TokenGrant> {
        let form = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("code", code.to_owned()),
            ("redirect_uri", redirect_uri.to_owned()),
            ("scope", scopes.join(" ")),
            ("code_verifier", code_verifier.to_owned()),
        ];
        self.post_token(form, scopes).await
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> AppResult<TokenGrant> {
        let form = vec![
            ("grant_type", "refresh_token".to_owned()),
            ("refresh_token", refresh_token.to_owned()),
            ("scope", scopes.join(" ")),
        ];
        self.post_token(form, scopes).await
    }

    async fn client_credentials(&self, scope: &str) -> AppResult<TokenGrant> {
        if self.client_secret.is_none() {
            return Err(AppError::AuthRequired(
                "no application secret configured for app-only access".to_owned(),
            ));
        }
        let form = vec![
            ("grant_type", "client_credentials".to_owned()),
            ("scope", scope.to_owned()),
        ];
        self.post_token(form, &[scope.to_owned()]).await
    }
}

fn map_send_error(e: &reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout("token endpoint did not respond".to_owned())
    } else {
        AppError::Provider(format!("token endpoint unreachable: {e}"))
    }
}

/// Identity platform descriptions carry trace ids on later lines
fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s).trim()
}

/// Read account claims from an id token payload
///
/// The token arrives directly from the token endpoint over TLS, so the
/// signature is not verified here.
fn identity_from_id_token(id_token: &str) -> Option<AccountIdentity> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let claim = |name: &str| claims.get(name).and_then(|v| v.as_str()).map(str::to_owned);

    let home_account_id = match (claim("oid"), claim("tid")) {
        (Some(oid), Some(tid)) => format!("{oid}.{tid}"),
        _ => claim("sub")?,
    };
    Some(AccountIdentity {
        home_account_id,
        username: claim("preferred_username").or_else(|| claim("email")),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory provider for lifecycle tests

    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{AccountIdentity, IdentityProvider, TokenGrant};
    use crate::errors::{AppError, AppResult};

    /// Fake provider issuing sequential tokens
    ///
    /// Authorization codes are single-use and their grants live for
    /// `expires_in` seconds. Refreshed and app-only grants live an hour.
    #[derive(Default)]
    pub struct FakeProvider {
        app_only: bool,
        refresh_fails: bool,
        expires_in: u64,
        consumed: Mutex<HashSet<String>>,
        issued: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub app_calls: AtomicUsize,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                expires_in: 3600,
                ..Self::default()
            }
        }

        /// Lifetime of grants issued for authorization codes
        pub fn with_expires_in(mut self, expires_in: u64) -> Self {
            self.expires_in = expires_in;
            self
        }

        /// Accept client-credentials requests
        pub fn with_app_only(mut self) -> Self {
            self.app_only = true;
            self
        }

        /// Reject every refresh with `invalid_grant`
        pub fn with_refresh_failure(mut self) -> Self {
            self.refresh_fails = true;
            self
        }

        fn grant(&self, scopes: &[String], with_refresh: bool, expires_in: u64) -> TokenGrant {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: with_refresh.then(|| format!("refresh-{n}")),
                expires_in,
                scopes: scopes.to_vec(),
                account: with_refresh.then(|| AccountIdentity {
                    home_account_id: "oid.tid".to_owned(),
                    username: Some("user@example.com".to_owned()),
                }),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        fn authorization_url(
            &self,
            _scopes: &[String],
            redirect_uri: &str,
            state: &str,
            code_challenge: &str,
        ) -> String {
            format!("https://login.test/authorize?redirect_uri={redirect_uri}&state={state}&code_challenge={code_challenge}")
        }

        async fn exchange_code(
            &self,
            code: &str,
            _redirect_uri: &str,
            scopes: &[String],
            code_verifier: &str,
        ) -> AppResult<TokenGrant> {
            if code_verifier.is_empty() {
                return Err(AppError::Provider("invalid_request: missing verifier".to_owned()));
            }
            let first_use = self
                .consumed
                .lock()
                .map_err(|_| AppError::Internal("poisoned".to_owned()))?
                .insert(code.to_owned());
            if !first_use {
                return Err(AppError::Provider(
                    "token request failed: invalid_grant: code already redeemed".to_owned(),
                ));
            }
            Ok(self.grant(scopes, true, self.expires_in))
        }

        async fn refresh(&self, _refresh_token: &str, scopes: &[String]) -> AppResult<TokenGrant> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails {
                return Err(AppError::Provider("token request failed: invalid_grant".to_owned()));
            }
            Ok(self.grant(scopes, true, 3600))
        }

        async fn client_credentials(&self, scope: &str) -> AppResult<TokenGrant> {
            self.app_calls.fetch_add(1, Ordering::SeqCst);
            if !self.app_only {
                return Err(AppError::AuthRequired("no application secret".to_owned()));
            }
            Ok(self.grant(&[scope.to_owned()], false, 3600))
        }
    }
}
