//! In-memory credential cache
//!
//! Holds signed-in accounts (refresh token plus cached access tokens) and
//! app-only tokens. Outside this crate the cache is an opaque blob behind
//! `deserialize` / `serialize` / `has_state_changed`; only the auth manager
//! mutates it, and every mutation raises the dirty flag so the owner knows
//! when a disk write is due.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Tokens this close to expiry are treated as expired
const EXPIRY_SKEW_SECONDS: i64 = 300;
/// Scopes the identity platform adds to every user token; never required
const RESERVED_SCOPES: [&str; 4] = ["openid", "profile", "offline_access", "email"];
/// Current serialized format version
const FORMAT_VERSION: u32 = 1;

/// Serializable credential cache
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialCache {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: Vec<CachedAccount>,
    #[serde(default)]
    app_tokens: Vec<CachedToken>,
    #[serde(skip)]
    dirty: bool,
}

/// A signed-in user identity and its tokens
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedAccount {
    /// Stable account key (`<oid>.<tid>` when known)
    pub home_account_id: String,
    /// Sign-in name, when the provider returned one
    pub username: Option<String>,
    refresh_token: Option<String>,
    #[serde(default)]
    access_tokens: Vec<CachedToken>,
}

/// One access token with its expiry and granted scopes
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedToken {
    secret: String,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Granted scopes, normalized
    pub scopes: Vec<String>,
}

impl CachedToken {
    /// Build a token from a provider grant
    pub fn new(secret: String, expires_at: DateTime<Utc>, scopes: &[String]) -> Self {
        let mut scopes: Vec<String> = scopes.iter().map(|s| normalize_scope(s)).collect();
        scopes.sort();
        scopes.dedup();
        Self {
            secret,
            expires_at,
            scopes,
        }
    }

    /// Bearer value
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether the token is still usable at `now` (with skew)
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + Duration::seconds(EXPIRY_SKEW_SECONDS)
    }

    /// Whether every non-reserved required scope was granted
    pub fn covers(&self, required: &[String]) -> bool {
        required
            .iter()
            .map(|s| normalize_scope(s))
            .filter(|s| !RESERVED_SCOPES.contains(&s.as_str()))
            .all(|s| self.scopes.contains(&s))
    }
}

impl CachedAccount {
    /// Whether a refresh token is available for silent renewal
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Refresh token, if any
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }
}

impl CredentialCache {
    /// Parse a serialized cache; a blank blob yields an empty cache
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the blob is not a valid cache.
    pub fn deserialize(blob: &str) -> AppResult<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut cache: Self = serde_json::from_str(blob).map_err(|e| {
            AppError::Internal(format!(
                "token cache is unreadable ({e}); delete it and sign in again"
            ))
        })?;
        cache.dirty = false;
        Ok(cache)
    }

    /// Serialize the whole cache
    pub fn serialize(&self) -> AppResult<String> {
        let mut out = self.clone();
        out.version = FORMAT_VERSION;
        serde_json::to_string(&out)
            .map_err(|e| AppError::Internal(format!("failed to serialize token cache: {e}")))
    }

    /// Whether the cache changed since it was loaded or last persisted
    pub fn has_state_changed(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag after a successful write
    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    /// First signed-in account (one user per process)
    pub fn first_account(&self) -> Option<&CachedAccount> {
        self.accounts.first()
    }

    /// Valid access token for `home_account_id` covering `scopes`
    pub fn find_access_token(
        &self,
        home_account_id: &str,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> Option<&CachedToken> {
        self.accounts
            .iter()
            .find(|a| a.home_account_id == home_account_id)?
            .access_tokens
            .iter()
            .find(|t| t.is_valid_at(now) && t.covers(scopes))
    }

    /// Valid app-only token for `scope`
    pub fn find_app_token(&self, scope: &str, now: DateTime<Utc>) -> Option<&CachedToken> {
        let required = [scope.to_owned()];
        self.app_tokens
            .iter()
            .find(|t| t.is_valid_at(now) && t.covers(&required))
    }

    /// Record a user grant, creating the account on first sign-in
    ///
    /// A missing refresh token in the grant keeps the previous one.
    pub(crate) fn record_account_grant(
        &mut self,
        home_account_id: &str,
        username: Option<String>,
        refresh_token: Option<String>,
        token: CachedToken,
        now: DateTime<Utc>,
    ) {
        let idx = match self
            .accounts
            .iter()
            .position(|a| a.home_account_id == home_account_id)
        {
            Some(idx) => idx,
            None => {
                self.accounts.push(CachedAccount {
                    home_account_id: home_account_id.to_owned(),
                    username: None,
                    refresh_token: None,
                    access_tokens: Vec::new(),
                });
                self.accounts.len() - 1
            }
        };
        let account = &mut self.accounts[idx];
        if username.is_some() {
            account.username = username;
        }
        if refresh_token.is_some() {
            account.refresh_token = refresh_token;
        }
        account.access_tokens.retain(|t| t.expires_at > now);
        account.access_tokens.insert(0, token);
        self.dirty = true;
    }

    /// Record an app-only grant
    pub(crate) fn record_app_token(&mut self, token: CachedToken, now: DateTime<Utc>) {
        self.app_tokens.retain(|t| t.expires_at > now);
        self.app_tokens.insert(0, token);
        self.dirty = true;
    }

    /// Drop the access token with this bearer value
    ///
    /// Returns whether a token was removed.
    pub(crate) fn remove_access_token(&mut self, secret: &str) -> bool {
        let mut removed = false;
        for account in &mut self.accounts {
            let before = account.access_tokens.len();
            account.access_tokens.retain(|t| t.secret != secret);
            removed |= account.access_tokens.len() != before;
        }
        let before = self.app_tokens.len();
        self.app_tokens.retain(|t| t.secret != secret);
        removed |= self.app_tokens.len() != before;
        if removed {
            self.dirty = true;
        }
        removed
    }
}

/// Lowercase a scope and strip its resource prefix
///
/// `https://graph.microsoft.com/Mail.Read` and `Mail.Read` compare equal.
pub fn normalize_scope(scope: &str) -> String {
    let scope = scope.trim();
    let short = if scope.starts_with("https://") || scope.starts_with("api://") {
        scope.rsplit('/').next().unwrap_or(scope)
    } else {
        scope
    };
    short.to_ascii_lowercase()
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("accounts", &self.accounts)
            .field("app_tokens", &self.app_tokens)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl fmt::Debug for CachedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAccount")
            .field("home_account_id", &self.home_account_id)
            .field("username", &self.username)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("access_tokens", &self.access_tokens)
            .finish()
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("secret", &"***")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{CachedToken, CredentialCache, normalize_scope};

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn normalizes_resource_qualified_scopes() {
        assert_eq!(normalize_scope("https://graph.microsoft.com/Mail.Read"), "mail.read");
        assert_eq!(normalize_scope("Mail.Read"), "mail.read");
        assert_eq!(normalize_scope("https://graph.microsoft.com/.default"), ".default");
    }

    #[test]
    fn token_covers_required_scopes_ignoring_reserved() {
        let token = CachedToken::new(
            "t".to_owned(),
            Utc::now() + Duration::hours(1),
            &scopes(&["Mail.Read", "User.Read"]),
        );
        assert!(token.covers(&scopes(&[
            "https://graph.microsoft.com/Mail.Read",
            "offline_access",
            "openid"
        ])));
        assert!(!token.covers(&scopes(&["Mail.Send"])));
    }

    #[test]
    fn tokens_inside_expiry_skew_are_not_valid() {
        let now = Utc::now();
        let soon = CachedToken::new("t".to_owned(), now + Duration::seconds(60), &[]);
        let later = CachedToken::new("t".to_owned(), now + Duration::hours(1), &[]);
        assert!(!soon.is_valid_at(now));
        assert!(later.is_valid_at(now));
    }

    #[test]
    fn mutations_raise_dirty_flag_and_survive_round_trip() {
        let now = Utc::now();
        let mut cache = CredentialCache::default();
        assert!(!cache.has_state_changed());

        cache.record_account_grant(
            "oid.tid",
            Some("user@example.com".to_owned()),
            Some("refresh".to_owned()),
            CachedToken::new("access".to_owned(), now + Duration::hours(1), &scopes(&["Mail.Read"])),
            now,
        );
        assert!(cache.has_state_changed());

        let blob = cache.serialize().expect("serialize");
        let loaded = CredentialCache::deserialize(&blob).expect("deserialize");
        assert!(!loaded.has_state_changed());
        let account = loaded.first_account().expect("account");
        assert_eq!(account.username.as_deref(), Some("user@example.com"));
        assert_eq!(account.refresh_token(), Some("refresh"));
        assert!(
            loaded
                .find_access_token("oid.tid", &scopes(&["Mail.Read"]), now)
                .is_some()
        );
    }

    #[test]
    fn refresh_grant_without_refresh_token_keeps_previous() {
        let now = Utc::now();
        let mut cache = CredentialCache::default();
        let token = |s: &str| CachedToken::new(s.to_owned(), now + Duration::hours(1), &[]);
        cache.record_account_grant("a", None, Some("rt-1".to_owned()), token("at-1"), now);
        cache.record_account_grant("a", None, None, token("at-2"), now);

        let account = cache.first_account().expect("account");
        assert_eq!(account.refresh_token(), Some("rt-1"));
        assert_eq!(
            cache.find_access_token("a", &[], now).map(CachedToken::secret),
            Some("at-2")
        );
    }

    #[test]
    fn remove_access_token_only_marks_dirty_when_found() {
        let now = Utc::now();
        let mut cache = CredentialCache::default();
        cache.record_app_token(
            CachedToken::new("app".to_owned(), now + Duration::hours(1), &scopes(&[".default"])),
            now,
        );
        cache.mark_persisted();

        assert!(!cache.remove_access_token("other"));
        assert!(!cache.has_state_changed());
        assert!(cache.remove_access_token("app"));
        assert!(cache.has_state_changed());
        assert!(cache.find_app_token(".default", now).is_none());
    }

    #[test]
    fn blank_and_corrupt_blobs() {
        assert!(CredentialCache::deserialize("  ").expect("blank").first_account().is_none());
        let err = CredentialCache::deserialize("{not json").expect_err("must fail");
        assert!(err.to_string().contains("token cache is unreadable"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let now = Utc::now();
        let mut cache = CredentialCache::default();
        cache.record_account_grant(
            "a",
            None,
            Some("refresh-secret".to_owned()),
            CachedToken::new("access-secret".to_owned(), now + Duration::hours(1), &[]),
            now,
        );
        let debug = format!("{cache:?}");
        assert!(!debug.contains("refresh-secret"));
        assert!(!debug.contains("access-secret"));
    }
}
