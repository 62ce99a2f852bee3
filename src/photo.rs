use std::cmp::Ordering;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::storage::{is_absolute_url, NativeEntry};

/// A photo as handed to clients, whatever backend holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoRecord {
    pub filename: String,
    pub url: String,
    pub download_url: Option<String>,

    /// The backend native id, absent for plain files.
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Maps backend native entries onto [PhotoRecord]s.
#[derive(Debug, Clone)]
pub struct Normalizer {
    public_prefix: String,
}

impl Normalizer {
    pub fn new(public_prefix: &str) -> Self {
        Self {
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn normalize(&self, entry: NativeEntry) -> PhotoRecord {
        match entry {
            NativeEntry::Local { filename } => {
                let filename = Path::new(&filename)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or(filename);

                // Files dropped into the directory by hand may need escaping.
                let encoded = urlencoding::encode(&filename).into_owned();
                PhotoRecord {
                    url: format!("{}/{}", self.public_prefix, encoded),
                    download_url: Some(format!("/download/{}", encoded)),
                    filename,
                    id: None,
                    created_at: None,
                }
            },
            NativeEntry::Row {
                id,
                filename,
                url,
                created_at,
            } => {
                let url = if is_absolute_url(&url) {
                    url
                } else {
                    format!("/photo/{}", id)
                };

                PhotoRecord {
                    filename,
                    url,
                    download_url: Some(format!("/download/{}", id)),
                    id: Some(id.to_string()),
                    created_at,
                }
            },
            NativeEntry::Remote {
                id,
                name,
                created_at,
            } => PhotoRecord {
                filename: name,
                url: format!("/photo/{}", id),
                download_url: Some(format!("/download/{}", id)),
                id: Some(id),
                created_at,
            },
        }
    }

    pub fn normalize_all(&self, entries: Vec<NativeEntry>) -> Vec<PhotoRecord> {
        let mut records: Vec<PhotoRecord> = entries.into_iter().map(|e| self.normalize(e)).collect();
        sort_newest_first(&mut records);
        records
    }
}

/// Newest first. Records without a timestamp keep their relative
/// order after every timestamped record.
pub fn sort_newest_first(records: &mut [PhotoRecord]) {
    records.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
