//! Token lifecycle management
//!
//! [`AuthManager`] owns the credential cache for the process. Token
//! acquisition runs in this order:
//!
//! 1. silent: a cached user access token, or a refresh-token renewal
//! 2. app-only: a cached or freshly issued client-credentials token
//! 3. otherwise `AuthRequired`, pointing at the interactive consent command
//!
//! The cache sits behind a `tokio::sync::RwLock`: readers take the fast path
//! for a valid cached token, and everything that may mutate the cache
//! (renewal, issuance, persistence) runs under the write lock so concurrent
//! callers never race on renewal or interleave disk writes.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::provider::{IdentityProvider, TokenGrant};
use crate::store::TokenStore;
use crate::token_cache::{CachedToken, CredentialCache};

/// Delegated Graph permissions requested for users
pub const GRAPH_SCOPES: [&str; 6] = [
    "https://graph.microsoft.com/Mail.Read",
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/Calendars.Read",
    "https://graph.microsoft.com/Calendars.ReadWrite",
    "https://graph.microsoft.com/User.Read",
];

/// Scope for app-only (client credentials) tokens
pub const APP_ONLY_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Added to interactive and refresh requests so a refresh token and id token are issued
const SIGN_IN_SCOPES: [&str; 3] = ["offline_access", "openid", "profile"];

/// Owned list of [`GRAPH_SCOPES`]
pub fn graph_scopes() -> Vec<String> {
    GRAPH_SCOPES.iter().map(|s| (*s).to_owned()).collect()
}

/// Bearer credential handed to the request pipeline
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Bearer value; never logged
    pub bearer: SecretString,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl From<&CachedToken> for AccessToken {
    fn from(token: &CachedToken) -> Self {
        Self {
            bearer: SecretString::new(token.secret().into()),
            expires_at: token.expires_at,
            scopes: token.scopes.clone(),
        }
    }
}

/// In-flight interactive authorization
///
/// Carries the PKCE verifier and anti-forgery state between
/// [`AuthManager::begin_interactive_authorization`] and
/// [`AuthManager::complete_interactive_authorization`].
#[derive(Debug, Clone)]
pub struct AuthorizationFlow {
    pub state: String,
    pub code_verifier: SecretString,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// URL to show the user plus the flow needed to complete it
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub flow: AuthorizationFlow,
}

/// Query parameters delivered to the redirect URI
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Signed-in account after consent
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub home_account_id: String,
    pub username: Option<String>,
    pub scopes: Vec<String>,
}

/// Process-wide token lifecycle manager
pub struct AuthManager {
    provider: Arc<dyn IdentityProvider>,
    store: TokenStore,
    cache: RwLock<CredentialCache>,
}

impl AuthManager {
    /// Load the persisted cache, or start empty when none exists
    ///
    /// # Errors
    ///
    /// Returns `Io` if the cache file exists but cannot be read, or
    /// `Internal` if it is corrupt.
    pub async fn load(provider: Arc<dyn IdentityProvider>, store: TokenStore) -> AppResult<Self> {
        let cache = match store.load().await? {
            Some(blob) => CredentialCache::deserialize(&blob)?,
            None => {
                tracing::info!(path = %store.path().display(), "no token cache yet; starting empty");
                CredentialCache::default()
            }
        };
        Ok(Self {
            provider,
            store,
            cache: RwLock::new(cache),
        })
    }

    /// Obtain a bearer token covering `scopes` without user interaction
    ///
    /// # Errors
    ///
    /// - `AuthRequired` when neither a user account nor app-only access works
    /// - `Io` when a changed cache cannot be persisted
    pub async fn acquire_token(&self, scopes: &[String]) -> AppResult<AccessToken> {
        {
            let cache = self.cache.read().await;
            if let Some(token) = cached_token(&cache, scopes, Utc::now()) {
                return Ok(token);
            }
        }

        let mut cache = self.cache.write().await;
        let now = Utc::now();
        // another caller may have renewed while we waited for the writer
        if let Some(token) = cached_token(&cache, scopes, now) {
            self.persist_if_changed(&mut cache).await?;
            return Ok(token);
        }

        if let Some(token) = self.refresh_account(&mut cache, scopes).await {
            self.persist_if_changed(&mut cache).await?;
            return Ok(token);
        }

        if let Some(token) = cache.find_app_token(APP_ONLY_SCOPE, now) {
            let token = AccessToken::from(token);
            self.persist_if_changed(&mut cache).await?;
            return Ok(token);
        }

        match self.provider.client_credentials(APP_ONLY_SCOPE).await {
            Ok(grant) => {
                let token = CachedToken::new(
                    grant.access_token,
                    expiry(now, grant.expires_in),
                    &grant.scopes,
                );
                let access = AccessToken::from(&token);
                cache.record_app_token(token, now);
                self.persist_if_changed(&mut cache).await?;
                tracing::info!("acquired app-only token");
                Ok(access)
            }
            Err(e) => {
                tracing::debug!(error = %e, "app-only acquisition unavailable");
                self.persist_if_changed(&mut cache).await?;
                let detail = match e {
                    AppError::AuthRequired(_) => {
                        "no signed-in account and no app-only credentials available".to_owned()
                    }
                    other => format!("no signed-in account and app-only acquisition failed ({other})"),
                };
                Err(AppError::AuthRequired(detail))
            }
        }
    }

    /// User token from cache or refresh only; never falls back to app-only
    pub async fn try_silent(&self, scopes: &[String]) -> AppResult<Option<AccessToken>> {
        let mut cache = self.cache.write().await;
        let now = Utc::now();
        let cached = cache
            .first_account()
            .and_then(|a| cache.find_access_token(&a.home_account_id, scopes, now))
            .map(AccessToken::from);
        let token = match cached {
            Some(token) => Some(token),
            None => self.refresh_account(&mut cache, scopes).await,
        };
        self.persist_if_changed(&mut cache).await?;
        Ok(token)
    }

    /// Sign-in name of the cached account, if any
    pub async fn account_username(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache.first_account().and_then(|a| a.username.clone())
    }

    /// Start the authorization-code flow with PKCE (S256)
    pub fn begin_interactive_authorization(
        &self,
        scopes: &[String],
        redirect_uri: &str,
    ) -> AuthorizationRequest {
        let scopes = with_sign_in_scopes(scopes);
        let state = Uuid::new_v4().simple().to_string();
        let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let challenge = code_challenge(&verifier);
        let authorization_url =
            self.provider
                .authorization_url(&scopes, redirect_uri, &state, &challenge);
        AuthorizationRequest {
            authorization_url,
            flow: AuthorizationFlow {
                state,
                code_verifier: SecretString::new(verifier.into()),
                redirect_uri: redirect_uri.to_owned(),
                scopes,
            },
        }
    }

    /// Redeem the callback of an interactive flow and persist the account
    ///
    /// # Errors
    ///
    /// Returns `Provider` when the callback carries an error, the state does
    /// not match, no code is present, or the code exchange fails. The cache
    /// is left untouched on any failure.
    pub async fn complete_interactive_authorization(
        &self,
        flow: &AuthorizationFlow,
        params: &CallbackParams,
    ) -> AppResult<AccountSummary> {
        if let Some(error) = &params.error {
            let detail = params.error_description.as_deref().unwrap_or("no description");
            return Err(AppError::Provider(format!("authorization denied: {error}: {detail}")));
        }
        if params.state.as_deref() != Some(flow.state.as_str()) {
            return Err(AppError::Provider(
                "authorization state mismatch; restart sign-in".to_owned(),
            ));
        }
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Provider("authorization response has no code".to_owned()))?;

        let grant = self
            .provider
            .exchange_code(
                code,
                &flow.redirect_uri,
                &flow.scopes,
                flow.code_verifier.expose_secret(),
            )
            .await?;

        let mut cache = self.cache.write().await;
        let summary = record_user_grant(&mut cache, None, grant, Utc::now());
        self.persist_if_changed(&mut cache).await?;
        tracing::info!(account = %summary.home_account_id, "interactive sign-in complete");
        Ok(summary)
    }

    /// Forget a bearer the resource server rejected
    pub async fn invalidate(&self, bearer: &SecretString) {
        let mut cache = self.cache.write().await;
        if cache.remove_access_token(bearer.expose_secret()) {
            tracing::debug!("dropped rejected access token from cache");
        }
    }

    /// Renew the first account's tokens; `None` when impossible
    async fn refresh_account(
        &self,
        cache: &mut CredentialCache,
        scopes: &[String],
    ) -> Option<AccessToken> {
        let account = cache.first_account()?;
        let refresh_token = account.refresh_token()?.to_owned();
        let home_account_id = account.home_account_id.clone();

        let requested = with_sign_in_scopes(scopes);
        match self.provider.refresh(&refresh_token, &requested).await {
            Ok(grant) => {
                let summary = record_user_grant(cache, Some(&home_account_id), grant, Utc::now());
                tracing::debug!(account = %summary.home_account_id, "refreshed user token");
                cache
                    .find_access_token(&summary.home_account_id, scopes, Utc::now())
                    .map(AccessToken::from)
            }
            Err(e) => {
                tracing::warn!(error = %e, "silent token renewal failed");
                None
            }
        }
    }

    async fn persist_if_changed(&self, cache: &mut CredentialCache) -> AppResult<()> {
        if !cache.has_state_changed() {
            return Ok(());
        }
        let blob = cache.serialize()?;
        self.store.save(&blob).await?;
        cache.mark_persisted();
        Ok(())
    }
}

/// Valid cached token usable without touching the network
///
/// A refreshable account takes precedence: its expired token must be renewed
/// rather than replaced by an app-only token.
fn cached_token(
    cache: &CredentialCache,
    scopes: &[String],
    now: DateTime<Utc>,
) -> Option<AccessToken> {
    if let Some(account) = cache.first_account() {
        if let Some(token) = cache.find_access_token(&account.home_account_id, scopes, now) {
            return Some(AccessToken::from(token));
        }
        if account.can_refresh() {
            return None;
        }
    }
    cache.find_app_token(APP_ONLY_SCOPE, now).map(AccessToken::from)
}

fn record_user_grant(
    cache: &mut CredentialCache,
    known_account: Option<&str>,
    grant: TokenGrant,
    now: DateTime<Utc>,
) -> AccountSummary {
    let home_account_id = known_account
        .map(str::to_owned)
        .or_else(|| grant.account.as_ref().map(|a| a.home_account_id.clone()))
        .unwrap_or_else(|| "default".to_owned());
    let username = grant.account.and_then(|a| a.username);
    let token = CachedToken::new(grant.access_token, expiry(now, grant.expires_in), &grant.scopes);
    let scopes = token.scopes.clone();
    cache.record_account_grant(&home_account_id, username.clone(), grant.refresh_token, token, now);
    AccountSummary {
        home_account_id,
        username,
        scopes,
    }
}

/// Lifetimes beyond a year are clamped
fn expiry(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    now + Duration::seconds(expires_in.min(31_536_000) as i64)
}

fn with_sign_in_scopes(scopes: &[String]) -> Vec<String> {
    let mut out = scopes.to_vec();
    for s in SIGN_IN_SCOPES {
        if !out.iter().any(|x| x == s) {
            out.push(s.to_owned());
        }
    }
    out
}

/// PKCE S256 challenge: base64url(sha256(verifier)) without padding
fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use secrecy::ExposeSecret;

    use super::{AuthManager, CallbackParams, code_challenge, graph_scopes};
    use crate::errors::AppError;
    use crate::provider::testing::FakeProvider;
    use crate::store::TokenStore;

    async fn manager(provider: Arc<FakeProvider>, dir: &tempfile::TempDir) -> AuthManager {
        let store = TokenStore::new(dir.path().join("cache.json"));
        AuthManager::load(provider, store).await.expect("load")
    }

    async fn sign_in(auth: &AuthManager, code: &str) {
        let request = auth.begin_interactive_authorization(&graph_scopes(), "http://localhost:5000/callback");
        let params = CallbackParams {
            code: Some(code.to_owned()),
            state: Some(request.flow.state.clone()),
            ..CallbackParams::default()
        };
        auth.complete_interactive_authorization(&request.flow, &params)
            .await
            .expect("sign in");
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[tokio::test]
    async fn empty_store_without_app_only_requires_auth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = manager(Arc::new(FakeProvider::new()), &dir).await;
        let err = auth.acquire_token(&graph_scopes()).await.expect_err("must fail");
        assert!(matches!(err, AppError::AuthRequired(_)));
        assert!(err.to_string().contains("outlook-mcp-rs auth"));
    }

    #[tokio::test]
    async fn completed_sign_in_persists_and_serves_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new());
        let auth = manager(provider.clone(), &dir).await;

        sign_in(&auth, "code-1").await;
        let blob = std::fs::read_to_string(dir.path().join("cache.json")).expect("cache file");
        assert!(!blob.is_empty());

        let token = auth.acquire_token(&graph_scopes()).await.expect("silent token");
        assert_eq!(token.bearer.expose_secret(), "access-1");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(auth.account_username().await.as_deref(), Some("user@example.com"));

        // a second manager over the same file sees the account
        let reloaded = manager(provider, &dir).await;
        let token = reloaded.acquire_token(&graph_scopes()).await.expect("reloaded token");
        assert_eq!(token.bearer.expose_secret(), "access-1");
    }

    #[tokio::test]
    async fn redeemed_code_fails_and_leaves_cache_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = manager(Arc::new(FakeProvider::new()), &dir).await;
        sign_in(&auth, "code-1").await;
        let before = std::fs::read_to_string(dir.path().join("cache.json")).expect("cache file");

        let request = auth.begin_interactive_authorization(&graph_scopes(), "http://localhost:5000/callback");
        let params = CallbackParams {
            code: Some("code-1".to_owned()),
            state: Some(request.flow.state.clone()),
            ..CallbackParams::default()
        };
        let err = auth
            .complete_interactive_authorization(&request.flow, &params)
            .await
            .expect_err("reused code");
        assert!(matches!(err, AppError::Provider(_)));

        let after = std::fs::read_to_string(dir.path().join("cache.json")).expect("cache file");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn state_mismatch_and_callback_error_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = manager(Arc::new(FakeProvider::new()), &dir).await;
        let request = auth.begin_interactive_authorization(&graph_scopes(), "http://localhost:5000/callback");

        let forged = CallbackParams {
            code: Some("code".to_owned()),
            state: Some("forged".to_owned()),
            ..CallbackParams::default()
        };
        let err = auth
            .complete_interactive_authorization(&request.flow, &forged)
            .await
            .expect_err("state mismatch");
        assert!(err.to_string().contains("state mismatch"));

        let denied = CallbackParams {
            error: Some("access_denied".to_owned()),
            error_description: Some("user cancelled".to_owned()),
            ..CallbackParams::default()
        };
        let err = auth
            .complete_interactive_authorization(&request.flow, &denied)
            .await
            .expect_err("denied");
        assert!(err.to_string().contains("access_denied"));
        assert!(!dir.path().join("cache.json").exists());
    }

    #[tokio::test]
    async fn unchanged_cache_is_not_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = manager(Arc::new(FakeProvider::new()), &dir).await;
        sign_in(&auth, "code-1").await;

        let path = dir.path().join("cache.json");
        std::fs::remove_file(&path).expect("remove");
        auth.acquire_token(&graph_scopes()).await.expect("first");
        auth.acquire_token(&graph_scopes()).await.expect("second");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new().with_expires_in(60));
        let auth = manager(provider.clone(), &dir).await;
        sign_in(&auth, "code-1").await;

        // a 60s lifetime is inside the expiry skew, so the first call renews
        let path = dir.path().join("cache.json");
        std::fs::remove_file(&path).expect("remove");
        let token = auth.acquire_token(&graph_scopes()).await.expect("renewed");
        assert_eq!(token.bearer.expose_secret(), "access-2");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(path.exists());

        auth.acquire_token(&graph_scopes()).await.expect("cached");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_bearer_is_not_served_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new());
        let auth = manager(provider.clone(), &dir).await;
        sign_in(&auth, "code-1").await;

        let first = auth.acquire_token(&graph_scopes()).await.expect("first");
        auth.invalidate(&first.bearer).await;
        let second = auth.acquire_token(&graph_scopes()).await.expect("second");
        assert_ne!(first.bearer.expose_secret(), second.bearer.expose_secret());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn app_only_fallback_is_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new().with_app_only());
        let auth = manager(provider.clone(), &dir).await;

        let first = auth.acquire_token(&graph_scopes()).await.expect("app token");
        let second = auth.acquire_token(&graph_scopes()).await.expect("cached app token");
        assert_eq!(first.bearer.expose_secret(), second.bearer.expose_secret());
        assert_eq!(provider.app_calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("cache.json").exists());
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_app_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(
            FakeProvider::new()
                .with_app_only()
                .with_refresh_failure()
                .with_expires_in(60),
        );
        let auth = manager(provider.clone(), &dir).await;
        sign_in(&auth, "code-1").await;

        let token = auth.acquire_token(&graph_scopes()).await.expect("fallback token");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.app_calls.load(Ordering::SeqCst), 1);
        assert_eq!(token.bearer.expose_secret(), "access-2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_renewal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new());
        let auth = Arc::new(manager(provider.clone(), &dir).await);
        sign_in(&auth, "code-1").await;
        let first = auth.acquire_token(&graph_scopes()).await.expect("first");
        auth.invalidate(&first.bearer).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move {
                auth.acquire_token(&graph_scopes()).await.expect("token")
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }
}
