use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::{IdentityProvider, TokenState, TokenStore};
use crate::config::RuntimeConfig;
use crate::credentials::{self, Credential, OAuth2Credential};
use crate::storage::backends::register::credential_sources;

/// How long the operator has to paste the authorization code.
pub const CODE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, PartialEq)]
pub enum AuthorizeOutcome {
    /// The token file already holds a fresh token, or one that refreshed.
    AlreadyAuthorized,

    /// Service accounts mint their own tokens.
    NotRequired,

    Stored(PathBuf),
}

/// Runs the interactive consent flow and writes the token file.
///
/// The consent URL is written to `output` and the code is read as a
/// single line from `input`.
pub async fn authorize<R, W>(
    cfg: &RuntimeConfig,
    identity: &dyn IdentityProvider,
    input: R,
    mut output: W,
    timeout: Duration,
) -> Result<AuthorizeOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let client = match credentials::resolve(&credential_sources(cfg))? {
        Credential::OAuth2(client) => client,
        Credential::ServiceAccount(account) => {
            info!("{} is a service account, no authorization needed", account.client_email);
            return Ok(AuthorizeOutcome::NotRequired);
        },
    };

    // The command only ever writes the file, an environment token is irrelevant here.
    let store = TokenStore::new(Some(cfg.cloud.token_file.clone()), None, false);
    if let Some(existing) = store.load().await {
        if revalidate(&client, identity, &store, existing).await {
            return Ok(AuthorizeOutcome::AlreadyAuthorized);
        }
    }

    let url = identity.authorize_url(&client, &cfg.cloud.scopes)?;
    let prompt = format!(
        "Authorize this application by visiting this url:\n\n{}\n\nEnter the code from that page here: ",
        url
    );
    output.write_all(prompt.as_bytes()).await?;
    output.flush().await?;

    let mut code = String::new();
    let mut lines = input;
    tokio::time::timeout(timeout, lines.read_line(&mut code))
        .await
        .map_err(|_| anyhow!("no authorization code was entered within {:?}", timeout))??;

    let code = code.trim();
    if code.is_empty() {
        return Err(anyhow!("no authorization code was entered"));
    }

    let grant = identity.exchange_code(&client, code).await?;
    let state = TokenState::from_grant(grant, Utc::now(), None);
    store.persist(&state).await?;

    Ok(AuthorizeOutcome::Stored(cfg.cloud.token_file.clone()))
}

/// Checks a stored token still works, refreshing it when it has expired.
///
/// A revoked refresh token sends the operator back through consent.
async fn revalidate(
    client: &OAuth2Credential,
    identity: &dyn IdentityProvider,
    store: &TokenStore,
    existing: TokenState,
) -> bool {
    let now = Utc::now();
    if !existing.is_expired_at(now) {
        return true;
    }

    let refresh_token = match existing.refresh_token.as_deref() {
        Some(token) => token,
        None => return false,
    };

    match identity.refresh(client, refresh_token).await {
        Ok(grant) => {
            let refreshed = TokenState::from_grant(grant, now, Some(&existing));
            if let Err(e) = store.persist(&refreshed).await {
                warn!("refreshed token could not be persisted: {}", e);
            }
            true
        },
        Err(e) => {
            warn!("stored token is no longer usable, starting consent again: {}", e);
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::{parse_token, tests::FakeIdentity};

    const CLIENT: &str =
        r#"{"web":{"client_id":"id","client_secret":"secret","redirect_uris":["http://localhost:3000"]}}"#;

    fn config(dir: &tempfile::TempDir) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.cloud.credentials_json = Some(CLIENT.to_string());
        cfg.cloud.default_credentials_file = dir.path().join("absent.json");
        cfg.cloud.token_file = dir.path().join("credentials").join("token.json");
        cfg
    }

    #[tokio::test]
    async fn test_code_is_exchanged_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let identity = FakeIdentity::new(false);
        let mut out = vec![];

        let outcome = authorize(&cfg, identity.as_ref(), &b"  abc \n"[..], &mut out, CODE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, AuthorizeOutcome::Stored(cfg.cloud.token_file.clone()));

        let prompt = String::from_utf8(out).unwrap();
        assert!(prompt.contains("https://example.invalid/auth"));

        let raw = std::fs::read_to_string(&cfg.cloud.token_file).unwrap();
        let state = parse_token(&raw).unwrap();
        assert_eq!(state.access_token, "exchanged-abc");
        assert_eq!(state.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_existing_refreshable_token_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        std::fs::create_dir_all(cfg.cloud.token_file.parent().unwrap()).unwrap();
        std::fs::write(
            &cfg.cloud.token_file,
            r#"{"access_token":"a","refresh_token":"r","expiry_date":1}"#,
        )
        .unwrap();

        let identity = FakeIdentity::new(false);
        let outcome = authorize(&cfg, identity.as_ref(), &b""[..], tokio::io::sink(), CODE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, AuthorizeOutcome::AlreadyAuthorized);
        assert_eq!(identity.count(), 1);

        let raw = std::fs::read_to_string(&cfg.cloud.token_file).unwrap();
        let state = parse_token(&raw).unwrap();
        assert_eq!(state.access_token, "access-1");
        assert_eq!(state.refresh_token.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_asks_for_consent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        std::fs::create_dir_all(cfg.cloud.token_file.parent().unwrap()).unwrap();
        std::fs::write(
            &cfg.cloud.token_file,
            r#"{"access_token":"a","refresh_token":"revoked","expiry_date":1}"#,
        )
        .unwrap();

        let identity = FakeIdentity::new(true);
        let mut out = vec![];
        let outcome = authorize(&cfg, identity.as_ref(), &b"fresh\n"[..], &mut out, CODE_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(outcome, AuthorizeOutcome::Stored(cfg.cloud.token_file.clone()));
        assert_eq!(identity.count(), 1);
        assert!(String::from_utf8(out).unwrap().contains("https://example.invalid/auth"));

        let raw = std::fs::read_to_string(&cfg.cloud.token_file).unwrap();
        assert_eq!(parse_token(&raw).unwrap().access_token, "exchanged-fresh");
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let identity = FakeIdentity::new(false);

        let result = authorize(&cfg, identity.as_ref(), &b"\n"[..], tokio::io::sink(), CODE_TIMEOUT).await;
        assert!(result.is_err());
        assert!(!cfg.cloud.token_file.exists());
    }
}
