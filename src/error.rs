use thiserror::Error;

/// Failures while locating or parsing the cloud provider credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// None of the configured sources exist.
    #[error("no credential source is configured")]
    NotConfigured,

    /// A source exists but is not a credential we understand.
    #[error("credential from {source_name} is malformed: {reason}")]
    Malformed { source_name: String, reason: String },
}

impl CredentialError {
    pub fn malformed(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures of the token lifecycle.
///
/// None of these are retried automatically, the operator is expected
/// to re-run `gallery authorize` when they show up.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no stored OAuth2 token was found, run the authorize command first")]
    NoToken,

    #[error("refreshing the access token failed: {0}")]
    RefreshFailed(String),

    #[error("exchanging the authorization code failed: {0}")]
    Exchange(String),

    #[error("signing the service account assertion failed: {0}")]
    Signing(String),
}

/// Raised by the backend selector when a tier is configured but unreachable.
#[derive(Debug, Error)]
#[error("{backend} backend is unavailable: {reason}")]
pub struct BackendUnavailable {
    pub backend: &'static str,
    pub reason: String,
}

/// Per-file upload failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("photo uploads are disabled")]
    UploadsDisabled,

    #[error("unsupported file type {0:?}, only PNG and JPEG images are accepted")]
    UnsupportedType(String),

    /// Reads stop one byte past the limit, so `size` may be a lower bound.
    #[error("file exceeds the upload limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("file content does not match its declared type {0}")]
    Corrupt(String),

    #[error("no writable storage backend is configured")]
    NotConfigured,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("photo {0:?} was not found")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
