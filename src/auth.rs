//! Bearer-token authentication for orchestrator requests.
//!
//! Tokens are cached in memory and on disk (`~/.zephyr-executor/auth.json`,
//! mode 0600) and validated against the identity provider before use. A
//! token within five minutes of expiry is treated as expired. All failure
//! paths collapse to "not authenticated": callers proceed without an
//! `Authorization` header and the orchestrator rejects them with 401.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::AuthError;

/// Margin before `expires_at` at which a token stops being used.
const EXPIRY_MARGIN: chrono::Duration = chrono::Duration::minutes(5);

/// Deadline for identity-provider calls.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Assumed lifetime of a token handed in via `login --token` when the
/// provider does not tell us otherwise.
const DEFAULT_TOKEN_TTL: chrono::Duration = chrono::Duration::hours(1);

/// Session document persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl CachedSession {
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now >= EXPIRY_MARGIN
    }
}

/// The authenticated user, as reported by the identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Configuration for the token store.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL of the identity provider.
    pub identity_url: String,
    /// Anonymous API key sent alongside every identity request.
    pub anon_key: SecretString,
    /// Path of the on-disk session cache.
    pub cache_path: PathBuf,
}

impl AuthConfig {
    pub fn new(identity_url: impl Into<String>, anon_key: SecretString) -> Self {
        Self {
            identity_url: identity_url.into(),
            anon_key,
            cache_path: default_cache_path(),
        }
    }

    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.cache_path = path;
        self
    }
}

/// Default cache location: `~/.zephyr-executor/auth.json`.
pub fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zephyr-executor")
        .join("auth.json")
}

/// Token store: in-memory session, on-disk cache, identity-provider probes.
pub struct AuthTokenStore {
    config: AuthConfig,
    client: Client,
    /// Current session. The token itself never appears in logs.
    session: RwLock<Option<CachedSession>>,
    /// Prevents concurrent refresh attempts from stampeding the provider.
    renewal_lock: Mutex<()>,
}

impl AuthTokenStore {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            client: Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            session: RwLock::new(None),
            renewal_lock: Mutex::new(()),
        }
    }

    /// Produce headers for an orchestrator request.
    ///
    /// Returns an empty map when no valid session can be established; this
    /// is never an error from the caller's point of view.
    pub async fn auth_headers(&self) -> HeaderMap {
        match self.valid_token().await {
            Some(token) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, value);
                }
                headers
            }
            None => HeaderMap::new(),
        }
    }

    /// Resolve a token that is unexpired *and* accepted by a live probe.
    async fn valid_token(&self) -> Option<String> {
        let now = Utc::now();

        // In-memory session first.
        let in_memory = self.session.read().await.clone();
        if let Some(session) = in_memory {
            if session.usable_at(now) && self.validate_token(&session.access_token).await {
                return Some(session.access_token);
            }
            tracing::debug!("in-memory session unusable, falling back to disk cache");
        }

        // Then the on-disk cache.
        if let Ok(cached) = self.load_cache().await {
            if cached.usable_at(now) && self.validate_token(&cached.access_token).await {
                let token = cached.access_token.clone();
                *self.session.write().await = Some(cached);
                return Some(token);
            }
        }

        // Last resort: exchange the refresh token.
        if let Some(token) = self.try_refresh().await {
            return Some(token);
        }

        // Nothing worked; a stale cache only causes repeated probe failures.
        self.clear_cache().await;
        None
    }

    /// Live validation probe: `GET /auth/v1/user` with a 10 s deadline.
    async fn validate_token(&self, token: &str) -> bool {
        let url = format!("{}/auth/v1/user", self.config.identity_url);
        let result = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("apikey", self.config.anon_key.expose_secret())
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("token validation probe failed: {e}");
                false
            }
        }
    }

    /// Exchange the refresh token for a new session.
    async fn try_refresh(&self) -> Option<String> {
        let _guard = self.renewal_lock.lock().await;

        // A concurrent caller may have refreshed while we waited.
        let now = Utc::now();
        if let Some(session) = self.session.read().await.clone() {
            if session.usable_at(now) {
                return Some(session.access_token);
            }
        }

        let refresh_token = {
            let session = self.session.read().await.clone();
            match session.and_then(|s| s.refresh_token) {
                Some(t) => t,
                None => match self.load_cache().await {
                    Ok(cached) => cached.refresh_token?,
                    Err(_) => return None,
                },
            }
        };

        match self.refresh_session(&refresh_token).await {
            Ok(session) => {
                let token = session.access_token.clone();
                if let Err(e) = self.save_cache(&session).await {
                    tracing::warn!("failed to persist refreshed session: {e}");
                }
                *self.session.write().await = Some(session);
                tracing::info!("session refreshed");
                Some(token)
            }
            Err(e) => {
                tracing::warn!("session refresh failed: {e}");
                None
            }
        }
    }

    /// `POST /auth/v1/token?grant_type=refresh_token`.
    async fn refresh_session(&self, refresh_token: &str) -> Result<CachedSession, AuthError> {
        let url = format!(
            "{}/auth/v1/token?grant_type=refresh_token",
            self.config.identity_url
        );

        let response = self
            .client
            .post(&url)
            .header("apikey", self.config.anon_key.expose_secret())
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::ProviderRequest {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(AuthError::ProviderRequest {
                reason: format!("refresh rejected with HTTP {}", response.status()),
            });
        }

        let body: RefreshResponse =
            response
                .json()
                .await
                .map_err(|e| AuthError::ProviderRequest {
                    reason: format!("invalid refresh response: {e}"),
                })?;

        Ok(CachedSession {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
            user_id: body.user.map(|u| u.id),
        })
    }

    /// Install a session from an externally obtained token pair.
    ///
    /// The token is validated against the identity provider before it is
    /// accepted and persisted.
    pub async fn login_with_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<UserInfo, AuthError> {
        let user = self
            .fetch_user(access_token)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;

        let session = CachedSession {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(String::from),
            expires_at: Utc::now() + DEFAULT_TOKEN_TTL,
            user_id: Some(user.id.clone()),
        };

        self.save_cache(&session).await?;
        *self.session.write().await = Some(session);
        tracing::info!(user_id = %user.id, "logged in");
        Ok(user)
    }

    /// Drop the in-memory session and remove the cache file.
    pub async fn logout(&self) {
        *self.session.write().await = None;
        self.clear_cache().await;
        tracing::info!("logged out");
    }

    /// The currently authenticated user, or `None`.
    pub async fn whoami(&self) -> Option<UserInfo> {
        let token = self.valid_token().await?;
        self.fetch_user(&token).await.ok().flatten()
    }

    async fn fetch_user(&self, token: &str) -> Result<Option<UserInfo>, AuthError> {
        let url = format!("{}/auth/v1/user", self.config.identity_url);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("apikey", self.config.anon_key.expose_secret())
            .send()
            .await
            .map_err(|e| AuthError::ProviderRequest {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let user = response.json().await.map_err(|e| AuthError::ProviderRequest {
            reason: format!("invalid userinfo response: {e}"),
        })?;
        Ok(Some(user))
    }

    // -- Cache file --

    async fn load_cache(&self) -> Result<CachedSession, AuthError> {
        let data = tokio::fs::read_to_string(&self.config.cache_path).await?;
        serde_json::from_str(&data).map_err(|e| AuthError::CacheUnusable {
            reason: e.to_string(),
        })
    }

    /// Atomic write: serialise to a sibling temp file, then rename over the
    /// final path. The file is owner-readable only.
    async fn save_cache(&self, session: &CachedSession) -> Result<(), AuthError> {
        if let Some(parent) = self.config.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json =
            serde_json::to_string_pretty(session).map_err(|e| AuthError::CacheUnusable {
                reason: e.to_string(),
            })?;

        let tmp_path = self.config.cache_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp_path, &self.config.cache_path).await?;
        tracing::debug!(
            "session cached at {}",
            self.config.cache_path.display()
        );
        Ok(())
    }

    async fn clear_cache(&self) {
        match tokio::fs::remove_file(&self.config.cache_path).await {
            Ok(()) => tracing::debug!("session cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to clear session cache: {e}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    user: Option<RefreshUser>,
}

#[derive(Debug, Deserialize)]
struct RefreshUser {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_at(dir: &std::path::Path, identity_url: &str) -> AuthTokenStore {
        let config = AuthConfig::new(identity_url, SecretString::from("anon-key"))
            .with_cache_path(dir.join("auth.json"));
        AuthTokenStore::new(config)
    }

    fn session(expires_at: DateTime<Utc>) -> CachedSession {
        CachedSession {
            access_token: "tok_abc".into(),
            refresh_token: Some("refresh_xyz".into()),
            expires_at,
            user_id: Some("user-1".into()),
        }
    }

    #[test]
    fn expiry_margin_is_five_minutes() {
        let now = Utc::now();
        assert!(session(now + chrono::Duration::minutes(6)).usable_at(now));
        assert!(!session(now + chrono::Duration::minutes(4)).usable_at(now));
        assert!(!session(now - chrono::Duration::minutes(1)).usable_at(now));
    }

    #[tokio::test]
    async fn cache_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), "http://127.0.0.1:1");

        let original = session(Utc::now() + chrono::Duration::hours(1));
        store.save_cache(&original).await.unwrap();

        let loaded = store.load_cache().await.unwrap();
        assert_eq!(loaded.access_token, original.access_token);
        assert_eq!(loaded.refresh_token, original.refresh_token);
        assert_eq!(loaded.user_id, original.user_id);

        // No temp file left behind.
        assert!(!dir.path().join("auth.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), "http://127.0.0.1:1");
        store
            .save_cache(&session(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("auth.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn no_session_yields_empty_headers() {
        let dir = tempdir().unwrap();
        // Unroutable identity URL: any probe would fail, but with no cached
        // session and no refresh token nothing is even attempted.
        let store = store_at(dir.path(), "http://127.0.0.1:1");

        let headers = store.auth_headers().await;
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn expired_cache_is_cleared_after_failed_resolution() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), "http://127.0.0.1:1");

        let expired = CachedSession {
            refresh_token: None,
            ..session(Utc::now() - chrono::Duration::hours(1))
        };
        store.save_cache(&expired).await.unwrap();
        assert!(dir.path().join("auth.json").exists());

        let headers = store.auth_headers().await;
        assert!(headers.is_empty());
        assert!(!dir.path().join("auth.json").exists());
    }

    #[tokio::test]
    async fn valid_cached_session_promotes_after_probe() {
        // Identity stub that accepts any bearer token.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/auth/v1/user",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({"id": "user-1", "email": "a@b.c"}))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempdir().unwrap();
        let store = store_at(dir.path(), &format!("http://{addr}"));
        store
            .save_cache(&session(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let headers = store.auth_headers().await;
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer tok_abc")
        );

        // Second call with no intervening mutation returns the same header.
        let again = store.auth_headers().await;
        assert_eq!(headers.get(AUTHORIZATION), again.get(AUTHORIZATION));

        let user = store.whoami().await.unwrap();
        assert_eq!(user.id, "user-1");
    }
}
