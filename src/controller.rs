use std::sync::Arc;

use bytes::Bytes;

use crate::config::RuntimeConfig;
use crate::error::{RetrieveError, StoreError};
use crate::photo::{Normalizer, PhotoRecord};
use crate::storage::backends::filesystem::FileSystemBackend;
use crate::storage::backends::BackendHandle;
use crate::storage::{BackendKind, PendingUpload, Retrieved, StorageBackend};
use crate::utils::StoredNameGenerator;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];

/// The image formats accepted for upload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::AsRefStr)]
pub enum ImageKind {
    #[strum(serialize = "image/png")]
    Png,

    #[strum(serialize = "image/jpeg")]
    Jpeg,
}

impl ImageKind {
    /// Accepts `image/png`, `image/jpeg` and the non-standard `image/jpg`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let parsed: mime::Mime = content_type.trim().parse().ok()?;
        if parsed.type_() != mime::IMAGE {
            return None;
        }

        let subtype = parsed.subtype();
        if subtype == mime::PNG {
            Some(Self::Png)
        } else if subtype == mime::JPEG || subtype.as_str().eq_ignore_ascii_case("jpg") {
            Some(Self::Jpeg)
        } else {
            None
        }
    }

    pub fn matches_signature(self, data: &[u8]) -> bool {
        match self {
            Self::Png => data.starts_with(PNG_SIGNATURE),
            Self::Jpeg => data.starts_with(JPEG_SIGNATURE),
        }
    }
}

/// A single file of an upload request.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub original_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct UploadFailure {
    /// Position of the file in the request.
    pub index: usize,
    pub filename: String,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub records: Vec<PhotoRecord>,
    pub failures: Vec<UploadFailure>,
}

/// Validates, names and stores uploads and serves them back through
/// the backend selected at startup.
pub struct GalleryController {
    handle: BackendHandle,

    /// Photos written before a database or cloud backend was configured
    /// still live on local disk.
    local_fallback: Option<FileSystemBackend>,

    normalizer: Normalizer,
    names: StoredNameGenerator,
    upload_enabled: bool,
    max_upload_size: usize,
}

impl GalleryController {
    pub fn new(handle: BackendHandle, cfg: &RuntimeConfig) -> Self {
        let local_fallback = match handle.kind {
            BackendKind::LocalFilesystem | BackendKind::ReadOnlyLocal => None,
            _ => Some(FileSystemBackend::read_only(cfg.uploads_dir())),
        };

        Self {
            handle,
            local_fallback,
            normalizer: Normalizer::new(&cfg.local.public_prefix),
            names: StoredNameGenerator::new(),
            upload_enabled: cfg.upload_enabled,
            max_upload_size: cfg.max_upload_size,
        }
    }

    #[inline]
    pub fn is_upload_enabled(&self) -> bool {
        self.upload_enabled
    }

    /// The largest single file accepted, in bytes.
    #[inline]
    pub fn max_upload_size(&self) -> usize {
        self.max_upload_size
    }

    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        self.handle.kind
    }

    #[inline]
    fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.handle.backend
    }

    fn validate(&self, data: &[u8], mime_type: &str) -> Result<ImageKind, StoreError> {
        if !self.upload_enabled {
            return Err(StoreError::UploadsDisabled);
        }

        let kind = ImageKind::from_content_type(mime_type)
            .ok_or_else(|| StoreError::UnsupportedType(mime_type.to_string()))?;

        if data.len() > self.max_upload_size {
            return Err(StoreError::TooLarge {
                size: data.len(),
                limit: self.max_upload_size,
            });
        }

        if !kind.matches_signature(data) {
            return Err(StoreError::Corrupt(kind.as_ref().to_string()));
        }

        if self.handle.kind == BackendKind::ReadOnlyLocal {
            return Err(StoreError::NotConfigured);
        }

        Ok(kind)
    }

    #[instrument(skip(self, data), level = "debug")]
    pub async fn store(
        &self,
        data: Bytes,
        original_name: &str,
        mime_type: &str,
    ) -> Result<PhotoRecord, StoreError> {
        let kind = self.validate(&data, mime_type)?;

        let upload = PendingUpload {
            stored_name: self.names.next_name(original_name),
            mime_type: kind.as_ref().to_string(),
            data,
        };

        let stored_name = upload.stored_name.clone();
        let entry = self.backend().create(upload).await?;
        info!("stored {} via the {} backend", stored_name, self.handle.kind);

        Ok(self.normalizer.normalize(entry))
    }

    /// Stores every file in turn, a failing file never stops the ones after it.
    pub async fn store_batch(&self, files: Vec<FileUpload>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for (index, file) in files.into_iter().enumerate() {
            match self.store(file.data, &file.original_name, &file.mime_type).await {
                Ok(record) => outcome.records.push(record),
                Err(error) => {
                    warn!("upload of {:?} failed: {}", &file.original_name, error);
                    outcome.failures.push(UploadFailure {
                        index,
                        filename: file.original_name,
                        error,
                    });
                },
            }
        }

        outcome
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn retrieve(&self, key: &str) -> Result<Retrieved, RetrieveError> {
        if key.trim().is_empty() {
            return Err(RetrieveError::NotFound(key.to_string()));
        }

        if let Some(found) = self.backend().fetch(key).await? {
            return Ok(found);
        }

        if let Some(local) = self.local_fallback.as_ref() {
            if let Some(found) = local.fetch(key).await? {
                debug!("{} served from the local fallback", key);
                return Ok(found);
            }
        }

        Err(RetrieveError::NotFound(key.to_string()))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<PhotoRecord>> {
        let entries = self.backend().list().await?;
        Ok(self.normalizer.normalize_all(entries))
    }
}
