use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AccessTokenSource;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FILE_FIELDS: &str = "id,name,mimeType,createdTime,parents";
const LIST_PAGE_SIZE: &str = "200";

/// A file in the remote folder.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl RemoteFile {
    #[inline]
    pub fn is_in(&self, folder_id: &str) -> bool {
        self.parents.iter().any(|parent| parent == folder_id)
    }
}

/// Drive ids only ever use the URL safe base64 alphabet.
pub fn is_file_id(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn file_url(id: &str) -> Result<String> {
    if !is_file_id(id) {
        return Err(anyhow!("{:?} is not a drive file id", id));
    }
    Ok(format!("{}/files/{}", API_BASE, id))
}

pub struct RemoteDownload {
    pub content_type: String,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

/// The subset of the Drive API the gallery relies on.
#[async_trait]
pub trait DriveApi: Sync + Send + 'static {
    /// Uploads the staged file at `source` into the `parent` folder.
    async fn create(
        &self,
        source: &Path,
        name: &str,
        mime_type: &str,
        parent: &str,
    ) -> Result<RemoteFile>;

    /// Grants read access to anyone holding the link.
    async fn set_public_readable(&self, id: &str) -> Result<()>;

    /// Looks up a file's name, type and parents.
    async fn metadata(&self, id: &str) -> Result<Option<RemoteFile>>;

    async fn get(&self, id: &str) -> Result<Option<RemoteDownload>>;

    /// Lists the PNG and JPEG files in `parent`, newest first.
    async fn list(&self, parent: &str) -> Result<Vec<RemoteFile>>;

    /// Fetches the name of a folder, used as the liveness probe.
    async fn folder_metadata(&self, id: &str) -> Result<String>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct FolderMetadata {
    name: String,
}

/// Drive v3 over REST.
pub struct GoogleDrive {
    http: Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl GoogleDrive {
    pub fn new(tokens: Arc<dyn AccessTokenSource>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, tokens })
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.tokens.access_token().await?;
        Ok(builder.bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = self.authorized(builder).await?.send().await?;
        error_for_status(resp).await
    }
}

async fn error_for_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(anyhow!("drive responded with {}: {}", status, body))
}

/// The listing query: images directly inside `parent` that are not trashed.
fn list_query(parent: &str) -> String {
    format!(
        "'{}' in parents and trashed=false and (mimeType='image/png' or mimeType='image/jpeg')",
        parent.replace('\\', "\\\\").replace('\'', "\\'"),
    )
}

#[async_trait]
impl DriveApi for GoogleDrive {
    #[instrument(skip(self, source), level = "debug")]
    async fn create(
        &self,
        source: &Path,
        name: &str,
        mime_type: &str,
        parent: &str,
    ) -> Result<RemoteFile> {
        let metadata = json!({
            "name": name,
            "parents": [parent],
            "mimeType": mime_type,
        });

        let session = self
            .send(
                self.http
                    .post(format!("{}/files", UPLOAD_BASE))
                    .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
                    .header("X-Upload-Content-Type", mime_type)
                    .json(&metadata),
            )
            .await?;

        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("drive did not return an upload session"))?
            .to_string();

        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("unable to open staged upload {}", source.display()))?;
        let len = file.metadata().await?.len();

        let resp = self
            .send(
                self.http
                    .put(location)
                    .header(CONTENT_TYPE, mime_type)
                    .header(CONTENT_LENGTH, len)
                    .body(file),
            )
            .await?;

        Ok(resp.json::<RemoteFile>().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_public_readable(&self, id: &str) -> Result<()> {
        self.send(
            self.http
                .post(format!("{}/permissions", file_url(id)?))
                .json(&json!({ "role": "reader", "type": "anyone" })),
        )
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn metadata(&self, id: &str) -> Result<Option<RemoteFile>> {
        let builder = self
            .http
            .get(file_url(id)?)
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")]);

        let resp = self.authorized(builder).await?.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let resp = error_for_status(resp).await?;
        Ok(Some(resp.json::<RemoteFile>().await?))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, id: &str) -> Result<Option<RemoteDownload>> {
        let builder = self
            .http
            .get(file_url(id)?)
            .query(&[("alt", "media")]);

        let resp = self.authorized(builder).await?.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = error_for_status(resp).await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();

        Ok(Some(RemoteDownload { content_type, body }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, parent: &str) -> Result<Vec<RemoteFile>> {
        let query = list_query(parent);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);

        let mut files = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("orderBy", "createdTime desc"),
                ("fields", fields.as_str()),
                ("pageSize", LIST_PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let resp = self
                .send(self.http.get(format!("{}/files", API_BASE)).query(&params))
                .await?;
            let page = resp.json::<FileList>().await?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    #[instrument(skip(self), level = "debug")]
    async fn folder_metadata(&self, id: &str) -> Result<String> {
        let resp = self
            .send(
                self.http
                    .get(file_url(id)?)
                    .query(&[("fields", "id,name"), ("supportsAllDrives", "true")]),
            )
            .await?;

        Ok(resp.json::<FolderMetadata>().await?.name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// An in-memory stand in for the remote folder.
    #[derive(Default)]
    pub(crate) struct FakeDrive {
        pub files: Mutex<Vec<(RemoteFile, Vec<u8>)>>,
        pub fail_probe: bool,
        pub fail_permissions: bool,
        pub fail_create: bool,
        pub creates: AtomicUsize,
        pub permission_grants: AtomicUsize,
        pub downloads: AtomicUsize,

        /// Every staged path handed to `create`.
        pub staged: Mutex<Vec<std::path::PathBuf>>,
    }

    #[async_trait]
    impl DriveApi for FakeDrive {
        async fn create(
            &self,
            source: &Path,
            name: &str,
            mime_type: &str,
            parent: &str,
        ) -> Result<RemoteFile> {
            self.staged.lock().unwrap().push(source.to_path_buf());
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(anyhow!("quota exceeded"));
            }

            let data = tokio::fs::read(source).await?;
            let file = RemoteFile {
                id: format!("remote-{}", n),
                name: name.to_string(),
                mime_type: Some(mime_type.to_string()),
                created_time: Some(Utc::now()),
                parents: vec![parent.to_string()],
            };
            self.files.lock().unwrap().push((file.clone(), data));
            Ok(file)
        }

        async fn set_public_readable(&self, _id: &str) -> Result<()> {
            self.permission_grants.fetch_add(1, Ordering::SeqCst);
            if self.fail_permissions {
                return Err(anyhow!("permission denied"));
            }
            Ok(())
        }

        async fn metadata(&self, id: &str) -> Result<Option<RemoteFile>> {
            let files = self.files.lock().unwrap();
            Ok(files.iter().find(|(file, _)| file.id == id).map(|(file, _)| file.clone()))
        }

        async fn get(&self, id: &str) -> Result<Option<RemoteDownload>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let files = self.files.lock().unwrap();
            let found = files.iter().find(|(file, _)| file.id == id);
            Ok(found.map(|(file, data)| RemoteDownload {
                content_type: file.mime_type.clone().unwrap_or_default(),
                body: futures::stream::iter(vec![Ok(Bytes::from(data.clone()))]).boxed(),
            }))
        }

        async fn list(&self, parent: &str) -> Result<Vec<RemoteFile>> {
            let mut files: Vec<RemoteFile> = self
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(file, _)| file.clone())
                .filter(|file| file.is_in(parent))
                .collect();
            files.reverse();
            Ok(files)
        }

        async fn folder_metadata(&self, _id: &str) -> Result<String> {
            if self.fail_probe {
                return Err(anyhow!("drive responded with 404 Not Found"));
            }
            Ok("Gallery".to_string())
        }
    }

    #[test]
    fn test_list_query_escapes_folder_id() {
        assert_eq!(
            list_query("abc"),
            "'abc' in parents and trashed=false and (mimeType='image/png' or mimeType='image/jpeg')"
        );
        assert!(list_query("a'b").starts_with("'a\\'b' in parents"));
    }

    #[test]
    fn test_remote_file_from_drive_json() {
        let file: RemoteFile = serde_json::from_str(
            r#"{"id":"1","name":"cat.png","mimeType":"image/png","createdTime":"2024-05-01T10:00:00.000Z","parents":["folder-1"]}"#,
        )
        .unwrap();

        assert_eq!(file.name, "cat.png");
        assert_eq!(file.mime_type.as_deref(), Some("image/png"));
        assert!(file.created_time.is_some());
        assert!(file.is_in("folder-1"));
        assert!(!file.is_in("folder-2"));

        let orphan: RemoteFile = serde_json::from_str(r#"{"id":"2","name":"dog.png"}"#).unwrap();
        assert!(orphan.parents.is_empty());
    }

    #[test]
    fn test_file_ids_cannot_leave_the_files_collection() {
        assert!(is_file_id("1AbC-d_9"));
        assert!(!is_file_id(""));
        assert!(!is_file_id("../about"));
        assert!(!is_file_id("abc/permissions"));
        assert!(!is_file_id("abc?alt=media"));

        assert_eq!(
            file_url("1AbC").unwrap(),
            "https://www.googleapis.com/drive/v3/files/1AbC"
        );
        assert!(file_url("../about").is_err());
    }
}
