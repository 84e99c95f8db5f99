//! OAuth token lifecycle: client construction, expiry checks, refresh,
//! code exchange and revocation.
//!
//! The read-check-refresh-write sequence runs under a process-wide lock and
//! the settings write is a compare-and-swap on the record revision, so two
//! follow-up calls never refresh the same token concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DefaultApp;
use crate::error::{AuthError, BridgeResult, RemoteError};
use crate::settings::{PluginSettings, SettingsStore};

/// OAuth client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Build a token from an endpoint grant. Google omits the refresh token
    /// on refresh responses, so the previous one is carried over.
    pub fn from_grant(grant: TokenGrant, now: DateTime<Utc>, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: now + Duration::seconds(grant.expires_in),
        }
    }
}

/// Raw response of the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// The OAuth endpoints of the delegated account's provider.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn authorization_url(&self) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    async fn revoke(&self, token: &str) -> Result<(), RemoteError>;
}

/// Builds an endpoint client for a set of credentials.
pub trait EndpointFactory: Send + Sync {
    fn build(&self, credentials: &Credentials) -> Arc<dyn TokenEndpoint>;
}

pub struct TokenManager {
    store: Arc<dyn SettingsStore>,
    factory: Arc<dyn EndpointFactory>,
    default_app: Option<DefaultApp>,
    redirect_uri: String,
    cached: Mutex<Option<(Credentials, Arc<dyn TokenEndpoint>)>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        factory: Arc<dyn EndpointFactory>,
        default_app: Option<DefaultApp>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            factory,
            default_app,
            redirect_uri: redirect_uri.into(),
            cached: Mutex::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Endpoint client for the credentials in `settings`. Rebuilt only when
    /// the credentials change.
    pub async fn get_client(&self, settings: &PluginSettings) -> BridgeResult<Arc<dyn TokenEndpoint>> {
        let credentials = settings.credentials(self.default_app.as_ref(), &self.redirect_uri)?;
        let mut cached = self.cached.lock().await;
        if let Some((creds, client)) = cached.as_ref() {
            if *creds == credentials {
                return Ok(client.clone());
            }
        }
        debug!(client_id = %credentials.client_id, "building oauth client");
        let client = self.factory.build(&credentials);
        *cached = Some((credentials, client.clone()));
        Ok(client)
    }

    /// True when a token has been stored, expired or not.
    pub async fn has_token(&self) -> BridgeResult<bool> {
        Ok(self.store.load().await?.settings.access_token.is_some())
    }

    pub async fn authorization_url(&self) -> BridgeResult<String> {
        let stored = self.store.load().await?;
        Ok(self.get_client(&stored.settings).await?.authorization_url())
    }

    pub async fn ensure_valid_token(&self) -> BridgeResult<Token> {
        self.ensure_valid_token_at(Utc::now()).await
    }

    /// Current token if unexpired at `now`, otherwise a refreshed one.
    #[instrument(skip_all)]
    pub async fn ensure_valid_token_at(&self, now: DateTime<Utc>) -> BridgeResult<Token> {
        let _guard = self.refresh_lock.lock().await;

        let stored = self.store.load().await?;
        let current = stored
            .settings
            .access_token
            .clone()
            .ok_or(AuthError::NotConfigured)?;
        if !current.is_expired_at(now) {
            return Ok(current);
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::RefreshDenied("no refresh token stored".into()))?;
        let client = self.get_client(&stored.settings).await?;

        info!("access token expired; refreshing");
        let grant = client.refresh(&refresh_token).await.map_err(|err| match err {
            AuthError::RefreshDenied(_) => err,
            other => AuthError::RefreshDenied(other.to_string()),
        })?;
        if grant.expires_in <= 0 {
            return Err(AuthError::RefreshDenied("token endpoint returned no lifetime".into()).into());
        }

        let refreshed = Token::from_grant(grant, now, Some(refresh_token));
        let mut settings = stored.settings;
        settings.access_token = Some(refreshed.clone());
        match self.store.save(&settings, stored.revision).await {
            Ok(_) => Ok(refreshed),
            Err(err) => {
                // Another process may have refreshed first; prefer its token.
                warn!(%err, "failed to persist refreshed token; re-reading settings");
                let again = self.store.load().await?;
                match again.settings.access_token {
                    Some(token) if !token.is_expired_at(now) => Ok(token),
                    _ => Err(err),
                }
            }
        }
    }

    /// One-time exchange of an authorization code; persists the new token.
    #[instrument(skip_all)]
    pub async fn exchange_auth_code(&self, code: &str) -> BridgeResult<Token> {
        self.exchange_auth_code_at(code, Utc::now()).await
    }

    pub async fn exchange_auth_code_at(&self, code: &str, now: DateTime<Utc>) -> BridgeResult<Token> {
        let _guard = self.refresh_lock.lock().await;
        let stored = self.store.load().await?;
        let client = self.get_client(&stored.settings).await?;

        let grant = client.exchange_code(code).await?;
        let token = Token::from_grant(grant, now, None);

        let mut settings = stored.settings;
        settings.access_token = Some(token.clone());
        self.store.save(&settings, stored.revision).await?;
        info!("stored new access token");
        Ok(token)
    }

    /// Best-effort remote revoke, then always clear the stored token.
    #[instrument(skip_all)]
    pub async fn revoke(&self) -> BridgeResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let stored = self.store.load().await?;
        let Some(token) = stored.settings.access_token.clone() else {
            return Ok(());
        };

        match self.get_client(&stored.settings).await {
            Ok(client) => {
                let target = token.refresh_token.as_deref().unwrap_or(&token.access_token);
                if let Err(err) = client.revoke(target).await {
                    warn!(%err, "remote token revoke failed; clearing locally");
                }
            }
            Err(err) => warn!(%err, "cannot build oauth client for revoke; clearing locally"),
        }

        let mut settings = stored.settings;
        settings.access_token = None;
        self.store.save(&settings, stored.revision).await?;
        info!("cleared stored access token");
        Ok(())
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::settings::StoredSettings;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        inner: StdMutex<StoredSettings>,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl SettingsStore for MemoryStore {
        async fn load(&self) -> BridgeResult<StoredSettings> {
            Ok(self.inner.lock().unwrap().clone())
        }

        async fn save(&self, settings: &PluginSettings, expected: i64) -> BridgeResult<i64> {
            let mut inner = self.inner.lock().unwrap();
            if inner.revision != expected {
                return Err(BridgeError::Storage("settings revision conflict".into()));
            }
            inner.settings = settings.clone();
            inner.revision += 1;
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(inner.revision)
        }
    }

    #[derive(Default)]
    struct FakeEndpoint {
        refreshes: StdMutex<VecDeque<Result<TokenGrant, AuthError>>>,
        refresh_calls: AtomicUsize,
        revoked: StdMutex<Vec<String>>,
        revoke_fails: bool,
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        fn authorization_url(&self) -> String {
            "https://auth.example/consent".into()
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
            if code == "good" {
                Ok(TokenGrant {
                    access_token: "fresh".into(),
                    refresh_token: Some("rt-1".into()),
                    expires_in: 3600,
                })
            } else {
                Err(AuthError::InvalidGrant("Code was already redeemed".into()))
            }
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refreshes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::RefreshDenied("exhausted".into())))
        }

        async fn revoke(&self, token: &str) -> Result<(), RemoteError> {
            self.revoked.lock().unwrap().push(token.to_string());
            if self.revoke_fails {
                Err(RemoteError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    struct FixedFactory(Arc<FakeEndpoint>, AtomicUsize);

    impl EndpointFactory for FixedFactory {
        fn build(&self, _credentials: &Credentials) -> Arc<dyn TokenEndpoint> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone()
        }
    }

    fn settings_with(token: Option<Token>) -> PluginSettings {
        PluginSettings {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            access_token: token,
            ..Default::default()
        }
    }

    fn setup(
        token: Option<Token>,
        endpoint: FakeEndpoint,
    ) -> (TokenManager, Arc<MemoryStore>, Arc<FakeEndpoint>) {
        let store = Arc::new(MemoryStore::default());
        store.inner.lock().unwrap().settings = settings_with(token);
        let endpoint = Arc::new(endpoint);
        let factory = Arc::new(FixedFactory(endpoint.clone(), AtomicUsize::new(0)));
        let manager = TokenManager::new(store.clone(), factory, None, "https://x/cb");
        (manager, store, endpoint)
    }

    fn token_expiring(at: DateTime<Utc>) -> Token {
        Token {
            access_token: "old".into(),
            refresh_token: Some("rt-0".into()),
            expires_at: at,
        }
    }

    #[tokio::test]
    async fn unexpired_token_is_returned_without_refresh() {
        let now = Utc::now();
        let (manager, store, endpoint) =
            setup(Some(token_expiring(now + Duration::minutes(5))), FakeEndpoint::default());
        let token = manager.ensure_valid_token_at(now).await.unwrap();
        assert_eq!(token.access_token, "old");
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_happens_exactly_at_expiry_and_persists_later_expiry() {
        let now = Utc::now();
        let endpoint = FakeEndpoint::default();
        endpoint.refreshes.lock().unwrap().push_back(Ok(TokenGrant {
            access_token: "new".into(),
            refresh_token: None,
            expires_in: 3600,
        }));
        let previous = token_expiring(now);
        let (manager, store, endpoint) = setup(Some(previous.clone()), endpoint);

        let token = manager.ensure_valid_token_at(now).await.unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-0"));
        assert!(token.expires_at > previous.expires_at);
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);

        let persisted = store.inner.lock().unwrap().settings.access_token.clone().unwrap();
        assert_eq!(persisted, token);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_leaves_stored_token_untouched() {
        let now = Utc::now();
        let previous = token_expiring(now - Duration::seconds(1));
        let (manager, store, _endpoint) = setup(Some(previous.clone()), FakeEndpoint::default());

        let err = manager.ensure_valid_token_at(now).await.unwrap_err();
        assert!(matches!(err, BridgeError::Auth(AuthError::RefreshDenied(_))));
        assert_eq!(store.inner.lock().unwrap().settings.access_token, Some(previous));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_token_is_not_configured() {
        let (manager, _store, _endpoint) = setup(None, FakeEndpoint::default());
        let err = manager.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, BridgeError::Auth(AuthError::NotConfigured)));
        assert!(!manager.has_token().await.unwrap());
    }

    #[tokio::test]
    async fn exchange_distinguishes_invalid_grant() {
        let (manager, store, _endpoint) = setup(None, FakeEndpoint::default());
        let err = manager.exchange_auth_code("stale").await.unwrap_err();
        assert!(matches!(err, BridgeError::Auth(AuthError::InvalidGrant(_))));
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);

        let token = manager.exchange_auth_code("good").await.unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(store.inner.lock().unwrap().settings.access_token, Some(token));
    }

    #[tokio::test]
    async fn revoke_clears_even_when_remote_fails() {
        let endpoint = FakeEndpoint {
            revoke_fails: true,
            ..Default::default()
        };
        let (manager, store, endpoint) =
            setup(Some(token_expiring(Utc::now() + Duration::hours(1))), endpoint);
        manager.revoke().await.unwrap();
        assert_eq!(endpoint.revoked.lock().unwrap().as_slice(), ["rt-0"]);
        assert!(store.inner.lock().unwrap().settings.access_token.is_none());
    }

    #[tokio::test]
    async fn client_is_cached_until_credentials_change() {
        let store = Arc::new(MemoryStore::default());
        let endpoint = Arc::new(FakeEndpoint::default());
        let factory = Arc::new(FixedFactory(endpoint, AtomicUsize::new(0)));
        let manager = TokenManager::new(store, factory.clone(), None, "https://x/cb");

        let mut settings = settings_with(None);
        manager.get_client(&settings).await.unwrap();
        manager.get_client(&settings).await.unwrap();
        assert_eq!(factory.1.load(Ordering::SeqCst), 1);

        settings.client_secret = "rotated".into();
        manager.get_client(&settings).await.unwrap();
        assert_eq!(factory.1.load(Ordering::SeqCst), 2);

        settings.client_id.clear();
        settings.client_secret.clear();
        assert!(matches!(
            manager.get_client(&settings).await,
            Err(BridgeError::Config(_))
        ));
    }
}
