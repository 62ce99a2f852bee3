use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::database::DatabaseBackend;
use super::drive::DriveBackend;
use super::filesystem::FileSystemBackend;
use crate::auth::{AccessTokenSource, IdentityProvider, ServiceAccountTokens, TokenManager, TokenStore};
use crate::config::RuntimeConfig;
use crate::credentials::{self, Credential, CredentialSources};
use crate::drive::{DriveApi, GoogleDrive};
use crate::error::BackendUnavailable;
use crate::storage::{BackendKind, StorageBackend};

const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The backend chosen at startup, fixed for the lifetime of the process.
#[derive(Clone)]
pub struct BackendHandle {
    pub kind: BackendKind,
    pub backend: Arc<dyn StorageBackend>,

    /// The remote folder photos are scoped to, set for the cloud tier only.
    pub folder_id: Option<String>,
}

impl BackendHandle {
    fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            kind: backend.kind(),
            backend,
            folder_id: None,
        }
    }
}

pub fn credential_sources(cfg: &RuntimeConfig) -> CredentialSources {
    CredentialSources {
        explicit_path: cfg.cloud.credentials_file.clone(),
        inline_json: cfg.cloud.credentials_json.clone(),
        default_path: Some(cfg.cloud.default_credentials_file.clone()),
        scopes: cfg.cloud.scopes.clone(),
    }
}

pub fn token_store(cfg: &RuntimeConfig) -> TokenStore {
    TokenStore::new(
        Some(cfg.cloud.token_file.clone()),
        cfg.cloud.token_json.clone(),
        cfg.ephemeral_filesystem,
    )
}

/// Builds an authenticated Drive client.
///
/// Fails when no credential is available or, for OAuth2, when no usable
/// token can be obtained.
pub async fn connect_remote(
    cfg: &RuntimeConfig,
    identity: Arc<dyn IdentityProvider>,
) -> Result<Arc<dyn DriveApi>> {
    let credential = credentials::resolve(&credential_sources(cfg))?;
    info!("loaded {} credential for the cloud backend", credential.kind());

    let tokens: Arc<dyn AccessTokenSource> = match credential {
        Credential::OAuth2(client) => {
            let manager = TokenManager::new(client, token_store(cfg), identity);
            manager.ensure_fresh().await?;
            Arc::new(manager)
        },
        Credential::ServiceAccount(account) => {
            let minter = ServiceAccountTokens::new(account, identity);
            minter.access_token().await?;
            Arc::new(minter)
        },
    };

    Ok(Arc::new(GoogleDrive::new(tokens, REMOTE_REQUEST_TIMEOUT)?))
}

/// Picks the active backend: database, then cloud folder, then local disk.
///
/// This never fails. Every tier that cannot be used is logged and skipped,
/// the local tier is always available.
pub async fn select_backend(cfg: &RuntimeConfig, remote: Option<Arc<dyn DriveApi>>) -> BackendHandle {
    if let Some(db_cfg) = cfg.database.as_ref() {
        match connect_database(db_cfg).await {
            Ok(backend) => {
                info!("using the relational backend");
                return BackendHandle::new(Arc::new(backend));
            },
            Err(e) => warn!("relational backend unavailable, trying the next tier: {:#}", e),
        }
    }

    if let Some(folder_id) = cfg.cloud.folder_id.as_ref() {
        match remote {
            Some(api) => match probe_folder(api.as_ref(), folder_id).await {
                Ok(name) => {
                    info!("using the cloud backend with folder {:?}", name);
                    let backend = DriveBackend::new(api, folder_id.clone(), std::env::temp_dir());
                    return BackendHandle {
                        kind: BackendKind::CloudFileStore,
                        backend: Arc::new(backend),
                        folder_id: Some(folder_id.clone()),
                    };
                },
                Err(e) => warn!("{}", e),
            },
            None => warn!("a cloud folder is configured but no authenticated client is available"),
        }
    }

    let dir = cfg.uploads_dir();
    if cfg.local.writable {
        info!("using the local filesystem backend at {:?}", &dir);
        BackendHandle::new(Arc::new(FileSystemBackend::new(dir)))
    } else {
        warn!(
            "no writable backend is available, serving {:?} read only and rejecting uploads",
            &dir
        );
        BackendHandle::new(Arc::new(FileSystemBackend::read_only(dir)))
    }
}

async fn connect_database(db_cfg: &crate::config::DatabaseConfig) -> Result<DatabaseBackend> {
    let backend = DatabaseBackend::connect(db_cfg).await?;
    backend.ensure_tables().await?;
    Ok(backend)
}

async fn probe_folder(api: &dyn DriveApi, folder_id: &str) -> Result<String, BackendUnavailable> {
    api.folder_metadata(folder_id)
        .await
        .map_err(|e| BackendUnavailable {
            backend: "cloud",
            reason: format!("folder {} could not be reached: {:#}", folder_id, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::tests::FakeIdentity;
    use crate::config::DatabaseConfig;
    use crate::drive::tests::FakeDrive;
    use crate::error::AuthError;
    use crate::storage::{NativeEntry, PendingUpload};

    fn local_config(dir: &tempfile::TempDir) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.local.directory = Some(dir.path().to_path_buf());
        cfg
    }

    #[tokio::test]
    async fn test_sqlite_uri_selects_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.database = Some(DatabaseConfig {
            connection_uri: "sqlite::memory:".to_string(),
            pool_size: 1,
        });

        let handle = select_backend(&cfg, None).await;
        assert_eq!(handle.kind, BackendKind::RelationalBlobStore);
        assert!(handle.backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_database_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.database = Some(DatabaseConfig {
            connection_uri: "postgres://nowhere/db".to_string(),
            pool_size: 1,
        });

        let handle = select_backend(&cfg, None).await;
        assert_eq!(handle.kind, BackendKind::LocalFilesystem);
    }

    #[tokio::test]
    async fn test_reachable_folder_selects_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.cloud.folder_id = Some("folder-1".to_string());

        let remote: Arc<dyn DriveApi> = Arc::new(FakeDrive::default());
        let handle = select_backend(&cfg, Some(remote)).await;
        assert_eq!(handle.kind, BackendKind::CloudFileStore);
        assert_eq!(handle.folder_id.as_deref(), Some("folder-1"));
    }

    #[tokio::test]
    async fn test_liveness_failure_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.cloud.folder_id = Some("folder-1".to_string());

        let remote: Arc<dyn DriveApi> = Arc::new(FakeDrive {
            fail_probe: true,
            ..Default::default()
        });
        let handle = select_backend(&cfg, Some(remote)).await;
        assert_eq!(handle.kind, BackendKind::LocalFilesystem);
        assert!(handle.folder_id.is_none());
        assert!(handle.backend.list().await.unwrap().is_empty());

        let entry = handle
            .backend
            .create(PendingUpload {
                stored_name: "cat-1.png".to_string(),
                mime_type: "image/png".to_string(),
                data: bytes::Bytes::from_static(b"\x89PNG\r\n\x1a\n"),
            })
            .await
            .unwrap();
        assert!(matches!(entry, NativeEntry::Local { .. }));
        assert!(dir.path().join("cat-1.png").exists());
        assert_eq!(handle.backend.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_writes_disabled_selects_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.local.writable = false;

        let handle = select_backend(&cfg, None).await;
        assert_eq!(handle.kind, BackendKind::ReadOnlyLocal);
    }

    #[tokio::test]
    async fn test_connect_remote_without_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let creds = dir.path().join("client_secret.json");
        std::fs::write(
            &creds,
            r#"{"web":{"client_id":"id","client_secret":"secret","redirect_uris":["http://localhost:3000"]}}"#,
        )
        .unwrap();

        let mut cfg = local_config(&dir);
        cfg.cloud.credentials_file = Some(creds);
        cfg.cloud.token_file = dir.path().join("missing-token.json");

        let err = connect_remote(&cfg, FakeIdentity::new(false)).await.err().unwrap();
        assert!(matches!(err.downcast_ref::<AuthError>(), Some(AuthError::NoToken)));
    }

    #[tokio::test]
    async fn test_connect_remote_refreshes_expired_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(&dir);
        cfg.cloud.credentials_json = Some(
            r#"{"web":{"client_id":"id","client_secret":"secret","redirect_uris":[]}}"#.to_string(),
        );
        cfg.cloud.default_credentials_file = dir.path().join("absent.json");
        cfg.cloud.token_file = dir.path().join("token.json");
        std::fs::write(
            &cfg.cloud.token_file,
            r#"{"access_token":"old","refresh_token":"r1","expiry_date":1000}"#,
        )
        .unwrap();

        let identity = FakeIdentity::new(false);
        assert!(connect_remote(&cfg, identity.clone()).await.is_ok());
        assert_eq!(identity.count(), 1);
    }
}
