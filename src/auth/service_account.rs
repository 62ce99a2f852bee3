use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::endpoint::IdentityProvider;
use super::token::TokenState;
use super::AccessTokenSource;
use crate::credentials::ServiceAccountCredential;
use crate::error::AuthError;

/// Assertions are valid for the maximum an hour Google accepts.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are replaced a little before they actually expire.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mints access tokens for a service account via the JWT bearer grant.
pub struct ServiceAccountTokens {
    credential: ServiceAccountCredential,
    provider: Arc<dyn IdentityProvider>,
    cached: RwLock<Option<TokenState>>,
    mint_guard: Mutex<()>,
}

impl ServiceAccountTokens {
    pub fn new(credential: ServiceAccountCredential, provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            credential,
            provider,
            cached: RwLock::new(None),
            mint_guard: Mutex::new(()),
        }
    }

    fn sign_assertion(&self, now: DateTime<Utc>) -> Result<String, AuthError> {
        let claims = AssertionClaims {
            iss: &self.credential.client_email,
            scope: self.credential.scopes.join(" "),
            aud: &self.credential.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.credential.private_key_id.clone();

        let key = EncodingKey::from_rsa_pem(self.credential.private_key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        jsonwebtoken::encode(&header, &claims, &key).map_err(|e| AuthError::Signing(e.to_string()))
    }

    async fn cached_until(&self, deadline: DateTime<Utc>) -> Option<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|tokens| !tokens.is_expired_at(deadline))
            .map(|tokens| tokens.access_token.clone())
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String, AuthError> {
        let now = Utc::now();
        let deadline = now + Duration::seconds(EXPIRY_SKEW_SECS);

        if let Some(token) = self.cached_until(deadline).await {
            return Ok(token);
        }

        let _guard = self.mint_guard.lock().await;
        if let Some(token) = self.cached_until(deadline).await {
            return Ok(token);
        }

        debug!("minting access token for {}", self.credential.client_email);
        let assertion = self.sign_assertion(now)?;
        let grant = self
            .provider
            .jwt_bearer(&self.credential.token_uri, &assertion)
            .await?;

        let previous = self.cached.read().await.clone();
        let tokens = TokenState::from_grant(grant, now, previous.as_ref());
        let access = tokens.access_token.clone();
        *self.cached.write().await = Some(tokens);

        Ok(access)
    }
}
