use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyPool;
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::storage::{
    content_type_for,
    is_absolute_url,
    BackendKind,
    NativeEntry,
    PendingUpload,
    Retrieved,
    StorageBackend,
};

const TABLE: &str = "photos";

/// The SQL flavours the photos table is created for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let scheme = uri
            .split(':')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(anyhow!("unsupported database scheme {:?}", other)),
        }
    }

    fn create_table_qry(self) -> String {
        match self {
            Self::MySql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                    id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                    filename VARCHAR(255) NOT NULL, \
                    url VARCHAR(512) NOT NULL, \
                    image_data LONGBLOB NULL, \
                    mime_type VARCHAR(100) NULL, \
                    created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3)\
                )",
                table = TABLE,
            ),
            Self::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                    id INTEGER PRIMARY KEY AUTOINCREMENT, \
                    filename TEXT NOT NULL, \
                    url TEXT NOT NULL, \
                    image_data BLOB, \
                    mime_type TEXT, \
                    created_at TIMESTAMP NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))\
                )",
                table = TABLE,
            ),
        }
    }

    /// Run on every new connection.
    ///
    /// MySQL renders `TIMESTAMP` columns in the session zone while rows are
    /// read back as UTC. SQLite timestamps are written in UTC already.
    fn session_init(self) -> Option<&'static str> {
        match self {
            Self::MySql => Some("SET time_zone = '+00:00'"),
            Self::Sqlite => None,
        }
    }

    /// Columns added after the first release of the table.
    fn late_columns(self) -> [(&'static str, &'static str); 2] {
        match self {
            Self::MySql => [("image_data", "LONGBLOB NULL"), ("mime_type", "VARCHAR(100) NULL")],
            Self::Sqlite => [("image_data", "BLOB"), ("mime_type", "TEXT")],
        }
    }
}

/// A row of the photos table, minus the image data.
#[derive(Debug, Clone)]
struct PhotoRow {
    id: i64,
    filename: String,
    url: String,
    created_at: Option<DateTime<Utc>>,
}

impl PhotoRow {
    fn from_row(row: &AnyRow) -> Result<Self> {
        let created_at: Option<String> = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            filename: row.try_get("filename")?,
            url: row.try_get("url")?,
            created_at: created_at.as_deref().and_then(parse_db_timestamp),
        })
    }

    fn into_entry(self) -> NativeEntry {
        NativeEntry::Row {
            id: self.id,
            filename: self.filename,
            url: self.url,
            created_at: self.created_at,
        }
    }
}

/// Parses the textual form of a timestamp column, assumed to be UTC.
pub fn parse_db_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

pub struct DatabaseBackend {
    pool: AnyPool,
    dialect: Dialect,
}

impl DatabaseBackend {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = Dialect::from_uri(&cfg.connection_uri)?;

        let mut options = AnyPoolOptions::new().max_connections(cfg.pool_size.max(1));

        // Every in-memory sqlite connection is its own database, so keep exactly one alive.
        if cfg.connection_uri.contains(":memory:") {
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        if let Some(init) = dialect.session_init() {
            options = options.after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(init).execute(&mut *conn).await?;
                    Ok(())
                })
            });
        }

        let pool = options
            .connect(&cfg.connection_uri)
            .await
            .context("failed to connect to the database")?;

        Ok(Self { pool, dialect })
    }

    /// Creates the photos table if it is absent and adds any
    /// columns older deployments are missing.
    pub async fn ensure_tables(&self) -> Result<()> {
        let qry = self.dialect.create_table_qry();
        debug!("executing query {}", qry);
        sqlx::query(&qry).execute(&self.pool).await?;

        for (column, definition) in self.dialect.late_columns() {
            let probe = format!("SELECT {} FROM {} LIMIT 1", column, TABLE);
            if sqlx::query(&probe).fetch_optional(&self.pool).await.is_ok() {
                continue;
            }

            info!("adding missing column {} to table {}", column, TABLE);
            let alter = format!("ALTER TABLE {} ADD COLUMN {} {}", TABLE, column, definition);
            sqlx::query(&alter).execute(&self.pool).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn insert_row(
        &self,
        filename: &str,
        url: &str,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<i64> {
        let qry = format!(
            "INSERT INTO {} (filename, url, image_data, mime_type) VALUES (?, ?, ?, ?)",
            TABLE
        );

        let result = sqlx::query(&qry)
            .bind(filename.to_string())
            .bind(url.to_string())
            .bind(data)
            .bind(mime_type.to_string())
            .execute(&self.pool)
            .await?;

        result
            .last_insert_id()
            .ok_or_else(|| anyhow!("database did not report the inserted row id"))
    }

    async fn select_row(&self, id: i64) -> Result<Option<PhotoRow>> {
        let qry = format!(
            "SELECT id, filename, url, CAST(created_at AS CHAR) AS created_at \
            FROM {} WHERE id = ?",
            TABLE
        );

        let row = sqlx::query(&qry).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(PhotoRow::from_row).transpose()
    }

    async fn select_data(&self, key: &str) -> Result<Option<(PhotoRow, Option<Vec<u8>>, Option<String>)>> {
        let columns = "id, filename, url, CAST(created_at AS CHAR) AS created_at, image_data, mime_type";

        let row = match key.parse::<i64>() {
            Ok(id) => {
                let qry = format!("SELECT {} FROM {} WHERE id = ?", columns, TABLE);
                sqlx::query(&qry).bind(id).fetch_optional(&self.pool).await?
            },
            Err(_) => {
                let qry = format!(
                    "SELECT {} FROM {} WHERE filename = ? ORDER BY id DESC LIMIT 1",
                    columns, TABLE
                );
                sqlx::query(&qry)
                    .bind(key.to_string())
                    .fetch_optional(&self.pool)
                    .await?
            },
        };

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let data: Option<Vec<u8>> = row.try_get("image_data")?;
        let mime_type: Option<String> = row.try_get("mime_type")?;
        Ok(Some((PhotoRow::from_row(&row)?, data, mime_type)))
    }
}

#[async_trait]
impl StorageBackend for DatabaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RelationalBlobStore
    }

    async fn create(&self, upload: PendingUpload) -> Result<NativeEntry> {
        let url = format!("/photo/{}", upload.stored_name);
        let id = self
            .insert_row(&upload.stored_name, &url, upload.data.to_vec(), &upload.mime_type)
            .await?;

        let row = self
            .select_row(id)
            .await?
            .ok_or_else(|| anyhow!("inserted row {} could not be read back", id))?;

        Ok(row.into_entry())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self) -> Result<Vec<NativeEntry>> {
        let qry = format!(
            "SELECT id, filename, url, CAST(created_at AS CHAR) AS created_at \
            FROM {} ORDER BY created_at DESC, id DESC",
            TABLE
        );

        let rows = sqlx::query(&qry).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| PhotoRow::from_row(row).map(PhotoRow::into_entry))
            .collect()
    }

    async fn fetch(&self, key: &str) -> Result<Option<Retrieved>> {
        let (row, data, mime_type) = match self.select_data(key).await? {
            Some(found) => found,
            None => return Ok(None),
        };

        if let Some(data) = data {
            let content_type =
                mime_type.unwrap_or_else(|| content_type_for(&row.filename).to_string());
            return Ok(Some(Retrieved::Bytes {
                filename: row.filename,
                content_type,
                data: Bytes::from(data),
            }));
        }

        if is_absolute_url(&row.url) {
            return Ok(Some(Retrieved::Redirect(row.url)));
        }

        // Rows from before blobs were stored only point at local files.
        Ok(None)
    }
}
