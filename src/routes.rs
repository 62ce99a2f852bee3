use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::SecondsFormat;
use poem::endpoint::StaticFilesEndpoint;
use poem::http::{header, StatusCode};
use poem::web::{Data, Field, Json as PlainJson, Multipart, Path};
use poem::{get, handler, post, Body, Endpoint, EndpointExt, IntoResponse, Response, Route};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService};
use serde_json::json;
use tokio::io::AsyncReadExt;

use crate::controller::{BatchOutcome, FileUpload, GalleryController};
use crate::error::{RetrieveError, StoreError};
use crate::photo::PhotoRecord;
use crate::storage::Retrieved;

#[derive(Object, Debug)]
pub struct UploadStatus {
    /// If the server currently accepts uploads.
    enabled: bool,
}

#[derive(Object, Debug)]
pub struct Photo {
    filename: String,

    /// Where the photo can be viewed.
    url: String,

    /// Where the photo can be downloaded as an attachment.
    download_url: Option<String>,

    /// The id of the photo in the storage backend, if it has one.
    id: Option<String>,

    /// RFC 3339 creation time, if the backend tracks one.
    created_at: Option<String>,
}

impl From<PhotoRecord> for Photo {
    fn from(record: PhotoRecord) -> Self {
        Self {
            filename: record.filename,
            url: record.url,
            download_url: record.download_url,
            id: record.id,
            created_at: record
                .created_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

#[derive(Object, Debug)]
pub struct PhotoList {
    success: bool,
    photos: Vec<Photo>,
}

#[derive(Object, Debug)]
pub struct Detail {
    success: bool,
    message: String,
}

impl Detail {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

#[derive(ApiResponse)]
pub enum ListResponse {
    #[oai(status = 200)]
    Ok(Json<PhotoList>),

    #[oai(status = 500)]
    Failed(Json<Detail>),
}

pub struct GalleryApi {
    ctx: Arc<GalleryController>,
}

impl GalleryApi {
    pub fn new(ctx: Arc<GalleryController>) -> Self {
        Self { ctx }
    }
}

#[OpenApi]
impl GalleryApi {
    /// Upload Status
    ///
    /// Reports whether the server currently accepts new photos.
    #[oai(path = "/api/upload-status", method = "get")]
    async fn upload_status(&self) -> Json<UploadStatus> {
        Json(UploadStatus {
            enabled: self.ctx.is_upload_enabled(),
        })
    }

    /// List Photos
    ///
    /// Lists every stored photo, newest first when the backend
    /// records creation times.
    #[oai(path = "/photos", method = "get")]
    async fn list_photos(&self) -> ListResponse {
        match self.ctx.list().await {
            Ok(records) => ListResponse::Ok(Json(PhotoList {
                success: true,
                photos: records.into_iter().map(Photo::from).collect(),
            })),
            Err(e) => {
                error!("failed to list photos: {:#}", e);
                ListResponse::Failed(Detail::new("unable to list photos"))
            },
        }
    }
}

/// Accepts any number of files, under any field name.
#[handler]
async fn upload(ctx: Data<&Arc<GalleryController>>, mut multipart: Multipart) -> Response {
    if !ctx.is_upload_enabled() {
        return PlainJson(json!({
            "success": false,
            "message": StoreError::UploadsDisabled.to_string(),
        }))
        .with_status(StatusCode::FORBIDDEN)
        .into_response();
    }

    let limit = ctx.max_upload_size();
    let mut files = vec![];
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return PlainJson(json!({
                    "success": false,
                    "message": format!("malformed multipart body: {}", e),
                }))
                .with_status(StatusCode::BAD_REQUEST)
                .into_response();
            },
        };

        // Plain form values are not files.
        let original_name = match field.file_name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = match read_bounded(field, limit).await {
            Ok(data) => data,
            Err(e) => {
                return PlainJson(json!({
                    "success": false,
                    "message": format!("failed to read {}: {}", original_name, e),
                }))
                .with_status(StatusCode::BAD_REQUEST)
                .into_response();
            },
        };

        files.push(FileUpload {
            original_name,
            mime_type,
            data: Bytes::from(data),
        });
    }

    upload_response(ctx.store_batch(files).await)
}

/// Reads no more of a part than is needed to tell it is too large.
async fn read_bounded(field: Field, limit: usize) -> std::io::Result<Vec<u8>> {
    let reader = field.into_async_read();
    tokio::pin!(reader);

    let mut data = vec![];
    reader.take(limit as u64 + 1).read_to_end(&mut data).await?;
    Ok(data)
}

fn upload_response(outcome: BatchOutcome) -> Response {
    let BatchOutcome { records, failures } = outcome;

    if records.is_empty() && !failures.is_empty() {
        let all_unconfigured = failures
            .iter()
            .all(|f| matches!(f.error, StoreError::NotConfigured));
        let any_backend = failures
            .iter()
            .any(|f| matches!(f.error, StoreError::Backend(_)));

        if all_unconfigured || any_backend {
            let message = if all_unconfigured {
                StoreError::NotConfigured.to_string()
            } else {
                "unable to save the uploaded photos".to_string()
            };

            return PlainJson(json!({ "success": false, "message": message }))
                .with_status(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }

    let photos: Vec<_> = records
        .into_iter()
        .map(|record| {
            let photo = Photo::from(record);
            json!({
                "filename": photo.filename,
                "url": photo.url,
                "download_url": photo.download_url,
                "id": photo.id,
                "created_at": photo.created_at,
            })
        })
        .collect();

    let failures: Vec<_> = failures
        .into_iter()
        .map(|f| {
            json!({
                "index": f.index,
                "filename": f.filename,
                "message": f.error.to_string(),
            })
        })
        .collect();

    PlainJson(json!({
        "success": !photos.is_empty() || failures.is_empty(),
        "photos": photos,
        "failures": failures,
    }))
    .into_response()
}

#[handler]
async fn view_photo(ctx: Data<&Arc<GalleryController>>, Path(key): Path<String>) -> Response {
    serve(&ctx, &key, false).await
}

#[handler]
async fn download_photo(ctx: Data<&Arc<GalleryController>>, Path(key): Path<String>) -> Response {
    serve(&ctx, &key, true).await
}

async fn serve(ctx: &GalleryController, key: &str, attachment: bool) -> Response {
    let found = match ctx.retrieve(key).await {
        Ok(found) => found,
        Err(RetrieveError::NotFound(_)) => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body("photo not found");
        },
        Err(e) => {
            error!("failed to retrieve photo {:?}: {:#}", key, e);
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("unable to retrieve photo");
        },
    };

    let (filename, content_type, body) = match found {
        Retrieved::Redirect(url) => {
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, url)
                .finish();
        },
        Retrieved::Bytes {
            filename,
            content_type,
            data,
        } => (filename, content_type, Body::from(data)),
        Retrieved::Stream {
            filename,
            content_type,
            body,
        } => (filename, content_type, Body::from_bytes_stream(body)),
    };

    let mut builder = Response::builder().content_type(&content_type);
    if attachment {
        builder = builder.header(header::CONTENT_DISPOSITION, attachment_header(&filename));
    }

    builder.body(body)
}

fn attachment_header(name: &str) -> String {
    let filename: String = name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();

    format!("attachment; filename=\"{}\"", filename)
}

/// Builds the full application around a controller.
pub fn build_app(
    ctx: Arc<GalleryController>,
    uploads_dir: PathBuf,
    public_prefix: &str,
    server_url: &str,
) -> impl Endpoint {
    let api_service = OpenApiService::new(
        GalleryApi::new(ctx.clone()),
        "Gallery API",
        env!("CARGO_PKG_VERSION"),
    )
    .server(server_url);

    let docs = api_service.redoc();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", docs)
        .at("/upload", post(upload))
        .at("/photo/:key", get(view_photo))
        .at("/download/:key", get(download_photo))
        .nest(public_prefix, StaticFilesEndpoint::new(uploads_dir))
        .data(ctx)
}
