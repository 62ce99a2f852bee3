use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::drive::{is_file_id, DriveApi};
use crate::storage::{is_absolute_url, BackendKind, NativeEntry, PendingUpload, Retrieved, StorageBackend};

const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// Photos kept in a single remote Drive folder.
pub struct DriveBackend {
    api: Arc<dyn DriveApi>,
    folder_id: String,
    staging_dir: PathBuf,
}

impl DriveBackend {
    pub fn new(api: Arc<dyn DriveApi>, folder_id: String, staging_dir: PathBuf) -> Self {
        Self {
            api,
            folder_id,
            staging_dir,
        }
    }

    async fn stage(&self, upload: &PendingUpload) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let path = self
            .staging_dir
            .join(format!("gallery-staging-{}", Uuid::new_v4()));
        tokio::fs::write(&path, &upload.data).await?;
        Ok(path)
    }
}

#[async_trait]
impl StorageBackend for DriveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudFileStore
    }

    #[instrument(skip(self, upload), fields(name = %upload.stored_name), level = "debug")]
    async fn create(&self, upload: PendingUpload) -> Result<NativeEntry> {
        let staged = self.stage(&upload).await?;

        let result = self
            .api
            .create(&staged, &upload.stored_name, &upload.mime_type, &self.folder_id)
            .await;

        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!("unable to remove staged upload {:?}: {}", &staged, e);
        }

        let file = result?;

        if let Err(e) = self.api.set_public_readable(&file.id).await {
            warn!(
                "uploaded {} but could not make it publicly readable: {}",
                file.id, e
            );
        }

        Ok(NativeEntry::Remote {
            id: file.id,
            name: file.name,
            created_at: file.created_time,
        })
    }

    async fn list(&self) -> Result<Vec<NativeEntry>> {
        let files = self.api.list(&self.folder_id).await?;
        Ok(files
            .into_iter()
            .map(|file| NativeEntry::Remote {
                id: file.id,
                name: file.name,
                created_at: file.created_time,
            })
            .collect())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Retrieved>> {
        // Records written by older releases hold a direct link.
        if is_absolute_url(key) {
            return Ok(Some(Retrieved::Redirect(key.to_string())));
        }

        if !is_file_id(key) {
            return Ok(None);
        }

        // The token can read the whole drive, only serve what lives in our folder.
        let file = match self.api.metadata(key).await? {
            Some(file) => file,
            None => return Ok(None),
        };
        let is_image = file
            .mime_type
            .as_deref()
            .map(|mime| IMAGE_TYPES.contains(&mime))
            .unwrap_or(false);
        if !file.is_in(&self.folder_id) || !is_image {
            debug!("not serving {}, it is not an image in the gallery folder", key);
            return Ok(None);
        }

        let download = self.api.get(key).await?;
        Ok(download.map(|d| Retrieved::Stream {
            filename: file.name,
            content_type: d.content_type,
            body: d.body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use bytes::Bytes;
    use futures::TryStreamExt;

    use crate::drive::tests::FakeDrive;

    fn upload(name: &str) -> PendingUpload {
        PendingUpload {
            stored_name: name.to_string(),
            mime_type: "image/png".to_string(),
            data: Bytes::from_static(b"\x89PNG\r\n\x1a\nrest"),
        }
    }

    fn backend(drive: Arc<FakeDrive>, dir: &tempfile::TempDir) -> DriveBackend {
        DriveBackend::new(drive, "folder-1".to_string(), dir.path().to_path_buf())
    }

    fn staged_files(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_create_then_stream_back() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::default());
        let backend = backend(drive.clone(), &dir);

        let entry = backend.create(upload("cat-1.png")).await.unwrap();
        let id = match entry {
            NativeEntry::Remote { id, name, created_at } => {
                assert_eq!(name, "cat-1.png");
                assert!(created_at.is_some());
                id
            },
            other => panic!("unexpected entry {:?}", other),
        };

        assert_eq!(drive.permission_grants.load(Ordering::SeqCst), 1);
        assert_eq!(staged_files(&dir), 0);

        match backend.fetch(&id).await.unwrap() {
            Some(Retrieved::Stream {
                filename,
                content_type,
                body,
            }) => {
                assert_eq!(filename, "cat-1.png");
                assert_eq!(content_type, "image/png");
                let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
                assert_eq!(chunks.concat(), b"\x89PNG\r\n\x1a\nrest".to_vec());
            },
            other => panic!("unexpected fetch result {:?}", other),
        }

        assert!(backend.fetch("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_staging_file_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive {
            fail_create: true,
            ..Default::default()
        });
        let backend = backend(drive.clone(), &dir);

        assert!(backend.create(upload("cat-1.png")).await.is_err());
        assert_eq!(drive.staged.lock().unwrap().len(), 1);
        assert_eq!(staged_files(&dir), 0);
        assert_eq!(drive.permission_grants.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permission_failure_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive {
            fail_permissions: true,
            ..Default::default()
        });
        let backend = backend(drive.clone(), &dir);

        assert!(backend.create(upload("cat-1.png")).await.is_ok());
        assert_eq!(drive.permission_grants.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_files_outside_the_folder_are_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(FakeDrive::default());
        let staged = dir.path().join("private.png");
        std::fs::write(&staged, b"\x89PNG\r\n\x1a\nprivate").unwrap();
        let private = drive
            .create(&staged, "private.png", "image/png", "private-folder")
            .await
            .unwrap();
        let notes = drive
            .create(&staged, "notes.txt", "text/plain", "folder-1")
            .await
            .unwrap();

        let backend = backend(drive.clone(), &dir);
        assert!(backend.fetch(&private.id).await.unwrap().is_none());
        assert!(backend.fetch(&notes.id).await.unwrap().is_none());
        assert!(backend.fetch("../about").await.unwrap().is_none());
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 0);

        assert_eq!(backend.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_absolute_keys_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(Arc::new(FakeDrive::default()), &dir);

        match backend.fetch("https://drive.google.com/uc?id=abc").await.unwrap() {
            Some(Retrieved::Redirect(url)) => assert_eq!(url, "https://drive.google.com/uc?id=abc"),
            other => panic!("unexpected fetch result {:?}", other),
        }
    }
}
