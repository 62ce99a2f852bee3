use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::{content_type_for, BackendKind, NativeEntry, PendingUpload, Retrieved, StorageBackend};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct FileSystemBackend {
    directory: PathBuf,
    writable: bool,
}

impl FileSystemBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            directory: dir,
            writable: true,
        }
    }

    /// The degraded tier: lists and serves, never writes.
    pub fn read_only(dir: PathBuf) -> Self {
        Self {
            directory: dir,
            writable: false,
        }
    }

    /// Reduces a key to a plain file name inside the uploads directory.
    #[inline]
    fn format_path(&self, key: &str) -> Option<PathBuf> {
        let name = Path::new(key).file_name()?;
        Some(self.directory.join(name))
    }
}

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    fn kind(&self) -> BackendKind {
        if self.writable {
            BackendKind::LocalFilesystem
        } else {
            BackendKind::ReadOnlyLocal
        }
    }

    async fn create(&self, upload: PendingUpload) -> anyhow::Result<NativeEntry> {
        if !self.writable {
            return Err(anyhow!("local storage is read only"));
        }

        let path = self
            .format_path(&upload.stored_name)
            .ok_or_else(|| anyhow!("invalid file name {:?}", upload.stored_name))?;

        debug!("Storing image @ {:?}", &path);
        match tokio::fs::write(&path, &upload.data).await {
            Ok(()) => {},
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.directory).await?;
                tokio::fs::write(&path, &upload.data).await?;
            },
            Err(other) => return Err(other.into()),
        }

        Ok(NativeEntry::Local {
            filename: upload.stored_name,
        })
    }

    async fn list(&self) -> anyhow::Result<Vec<NativeEntry>> {
        let mut read_dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(read_dir) => read_dir,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(other) => return Err(other.into()),
        };

        // Directory enumeration order, there is no reliable timestamp to sort by.
        let mut entries = vec![];
        while let Some(entry) = read_dir.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().to_string();
            if is_image(&filename) {
                entries.push(NativeEntry::Local { filename });
            }
        }

        Ok(entries)
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Retrieved>> {
        let path = match self.format_path(key) {
            Some(path) => path,
            None => return Ok(None),
        };

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        debug!("Retrieving image @ {:?}", &path);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Retrieved::Bytes {
                content_type: content_type_for(&filename).to_string(),
                filename,
                data: Bytes::from(data),
            })),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(ref e) if e.kind() == ErrorKind::PermissionDenied => Ok(None),
            Err(other) => {
                // Reading a directory lands here on most platforms.
                if path.is_dir() {
                    Ok(None)
                } else {
                    Err(other.into())
                }
            },
        }
    }
}
