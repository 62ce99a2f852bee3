use std::io;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub mod backends;

/// The active backend tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    LocalFilesystem,
    RelationalBlobStore,
    CloudFileStore,

    /// Serves whatever is already on disk, uploads are rejected.
    ReadOnlyLocal,
}

/// A validated upload ready to be persisted.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    /// The collision resistant name the file is stored under.
    pub stored_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// A listing entry in the backend's own terms.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEntry {
    /// A file in the uploads directory.
    Local { filename: String },

    /// A row of the photos table.
    Row {
        id: i64,
        filename: String,
        url: String,
        created_at: Option<DateTime<Utc>>,
    },

    /// A file in the remote folder.
    Remote {
        id: String,
        name: String,
        created_at: Option<DateTime<Utc>>,
    },
}

pub enum Retrieved {
    Bytes {
        /// The name the photo was stored under, used for downloads.
        filename: String,
        content_type: String,
        data: Bytes,
    },
    Stream {
        filename: String,
        content_type: String,
        body: BoxStream<'static, io::Result<Bytes>>,
    },
    Redirect(String),
}

impl std::fmt::Debug for Retrieved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes {
                filename,
                content_type,
                data,
            } => f
                .debug_struct("Bytes")
                .field("filename", filename)
                .field("content_type", content_type)
                .field("len", &data.len())
                .finish(),
            Self::Stream {
                filename,
                content_type,
                ..
            } => f
                .debug_struct("Stream")
                .field("filename", filename)
                .field("content_type", content_type)
                .finish_non_exhaustive(),
            Self::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
        }
    }
}

#[async_trait]
pub trait StorageBackend: Sync + Send + 'static {
    fn kind(&self) -> BackendKind;

    async fn create(&self, upload: PendingUpload) -> Result<NativeEntry>;

    async fn list(&self) -> Result<Vec<NativeEntry>>;

    /// Looks up a photo by the key handed out in its record.
    async fn fetch(&self, key: &str) -> Result<Option<Retrieved>>;
}

/// The content type for a stored file name, based on its extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

#[inline]
pub fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}
