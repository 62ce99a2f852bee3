use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::credentials::OAuth2Credential;
use crate::error::AuthError;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// A successful response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,

    /// Only present on the initial exchange and occasionally on refresh.
    pub refresh_token: Option<String>,

    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: i64,

    pub scope: Option<String>,
    pub token_type: Option<String>,
}

/// The identity provider as seen by the token lifecycle.
#[async_trait]
pub trait IdentityProvider: Sync + Send + 'static {
    /// The consent page the operator visits during `gallery authorize`.
    fn authorize_url(&self, client: &OAuth2Credential, scopes: &[String]) -> Result<String>;

    async fn exchange_code(
        &self,
        client: &OAuth2Credential,
        code: &str,
    ) -> Result<TokenGrant, AuthError>;

    async fn refresh(
        &self,
        client: &OAuth2Credential,
        refresh_token: &str,
    ) -> Result<TokenGrant, AuthError>;

    /// Exchanges a signed service account assertion for an access token.
    async fn jwt_bearer(&self, token_uri: &str, assertion: &str) -> Result<TokenGrant, AuthError>;
}

pub struct GoogleIdentity {
    http: Client,
}

impl GoogleIdentity {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }

    async fn post_form(
        &self,
        token_uri: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenGrant, String> {
        let resp = self
            .http
            .post(token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("token endpoint responded with {}: {}", status, body));
        }

        resp.json::<TokenGrant>().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl IdentityProvider for GoogleIdentity {
    fn authorize_url(&self, client: &OAuth2Credential, scopes: &[String]) -> Result<String> {
        let scope = scopes.join(" ");
        let url = Url::parse_with_params(
            &client.auth_uri,
            &[
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", client.redirect_uri.as_str()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("scope", scope.as_str()),
            ],
        )?;

        Ok(url.to_string())
    }

    #[instrument(skip_all, level = "debug")]
    async fn exchange_code(
        &self,
        client: &OAuth2Credential,
        code: &str,
    ) -> Result<TokenGrant, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
        ];

        self.post_form(&client.token_uri, &form)
            .await
            .map_err(AuthError::Exchange)
    }

    #[instrument(skip_all, level = "debug")]
    async fn refresh(
        &self,
        client: &OAuth2Credential,
        refresh_token: &str,
    ) -> Result<TokenGrant, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ];

        self.post_form(&client.token_uri, &form)
            .await
            .map_err(AuthError::RefreshFailed)
    }

    #[instrument(skip_all, level = "debug")]
    async fn jwt_bearer(&self, token_uri: &str, assertion: &str) -> Result<TokenGrant, AuthError> {
        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)];

        self.post_form(token_uri, &form)
            .await
            .map_err(AuthError::RefreshFailed)
    }
}
