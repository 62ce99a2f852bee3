use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::endpoint::{IdentityProvider, TokenGrant};
use super::AccessTokenSource;
use crate::credentials::OAuth2Credential;
use crate::error::AuthError;

/// The bearer token pair held for an OAuth2 credential.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

impl TokenState {
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// Builds the state following a grant, carrying the previous refresh token
    /// over when the provider did not issue a new one.
    pub fn from_grant(grant: TokenGrant, now: DateTime<Utc>, previous: Option<&TokenState>) -> Self {
        let mut expiry = now + Duration::seconds(grant.expires_in.max(0));
        if let Some(prev) = previous {
            if expiry < prev.expiry {
                expiry = prev.expiry;
            }
        }

        Self {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expiry,
        }
    }
}

/// The token file layout written by Google's client libraries.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredToken {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// Milliseconds since the unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

impl StoredToken {
    fn into_state(self) -> Option<TokenState> {
        if self.access_token.is_none() && self.refresh_token.is_none() {
            return None;
        }

        // A token without an expiry is treated as already expired.
        let expiry = self
            .expiry_date
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Some(TokenState {
            access_token: self.access_token.unwrap_or_default(),
            refresh_token: self.refresh_token,
            expiry,
        })
    }

    fn from_state(state: &TokenState) -> Self {
        Self {
            access_token: Some(state.access_token.clone()),
            refresh_token: state.refresh_token.clone(),
            expiry_date: Some(state.expiry.timestamp_millis()),
            scope: None,
            token_type: Some("Bearer".to_string()),
        }
    }
}

/// Parses a serialized token, tolerating line breaks and escaping introduced
/// by environment variables.
pub fn parse_token(raw: &str) -> Option<TokenState> {
    let cleaned: String = raw.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    let value = crate::credentials::parse_inline(&cleaned).ok()?;
    let stored: StoredToken = serde_json::from_value(value).ok()?;
    stored.into_state()
}

/// The durable sink for the OAuth2 token.
///
/// An environment supplied token takes precedence over the file and is
/// never written back.
#[derive(Debug, Clone)]
pub struct TokenStore {
    file: Option<PathBuf>,
    env_override: Option<String>,
    ephemeral: bool,
}

impl TokenStore {
    pub fn new(file: Option<PathBuf>, env_override: Option<String>, ephemeral: bool) -> Self {
        Self {
            file,
            env_override: env_override.filter(|v| !v.trim().is_empty()),
            ephemeral,
        }
    }

    pub async fn load(&self) -> Option<TokenState> {
        if let Some(raw) = self.env_override.as_deref() {
            let state = parse_token(raw);
            if state.is_none() {
                warn!("token supplied through the environment could not be parsed");
            }
            return state;
        }

        let path = self.file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let state = parse_token(&raw);
                if state.is_none() {
                    warn!("token file {} could not be parsed", path.display());
                }
                state
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("unable to read token file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Writes the token to the file sink.
    ///
    /// Returns `false` when persistence was skipped.
    pub async fn persist(&self, state: &TokenState) -> Result<bool> {
        let path = match self.file.as_ref() {
            Some(path) if !self.ephemeral => path,
            _ => return Ok(false),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let out = serde_json::to_string_pretty(&StoredToken::from_state(state))?;
        tokio::fs::write(path, out).await?;
        Ok(true)
    }
}

/// Keeps the OAuth2 access token fresh for the lifetime of the process.
pub struct TokenManager {
    credential: RwLock<OAuth2Credential>,
    store: TokenStore,
    provider: Arc<dyn IdentityProvider>,

    /// Only one refresh is in flight at any time.
    refresh_guard: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        credential: OAuth2Credential,
        store: TokenStore,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            credential: RwLock::new(credential),
            store,
            provider,
            refresh_guard: Mutex::new(()),
        }
    }

    pub async fn ensure_fresh(&self) -> Result<TokenState, AuthError> {
        self.ensure_fresh_at(Utc::now()).await
    }

    pub async fn ensure_fresh_at(&self, now: DateTime<Utc>) -> Result<TokenState, AuthError> {
        if let Some(tokens) = self.fresh_tokens(now).await {
            return Ok(tokens);
        }

        let _guard = self.refresh_guard.lock().await;

        // Someone else may have refreshed while we waited.
        if let Some(tokens) = self.fresh_tokens(now).await {
            return Ok(tokens);
        }

        let held = self.credential.read().await.tokens.clone();
        let tokens = match held {
            Some(tokens) => tokens,
            None => {
                let loaded = self.store.load().await.ok_or(AuthError::NoToken)?;
                self.credential.write().await.tokens = Some(loaded.clone());
                loaded
            },
        };

        if !tokens.is_expired_at(now) {
            return Ok(tokens);
        }

        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::RefreshFailed("no refresh token is stored".to_string()))?;

        info!("access token expired at {}, refreshing", tokens.expiry);
        let client = self.credential.read().await.clone();
        let grant = self.provider.refresh(&client, &refresh_token).await?;
        let refreshed = TokenState::from_grant(grant, now, Some(&tokens));

        self.credential.write().await.tokens = Some(refreshed.clone());

        match self.store.persist(&refreshed).await {
            Ok(true) => debug!("refreshed token persisted"),
            Ok(false) => debug!("token persistence skipped"),
            Err(e) => warn!("refreshed token could not be persisted: {}", e),
        }

        Ok(refreshed)
    }

    async fn fresh_tokens(&self, now: DateTime<Utc>) -> Option<TokenState> {
        let credential = self.credential.read().await;
        credential
            .tokens
            .as_ref()
            .filter(|tokens| !tokens.is_expired_at(now))
            .cloned()
    }
}

#[async_trait]
impl AccessTokenSource for TokenManager {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.ensure_fresh().await?.access_token)
    }
}
