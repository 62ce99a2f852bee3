#[macro_use]
extern crate tracing;

mod auth;
mod authorize;
mod config;
mod controller;
mod credentials;
mod drive;
mod error;
mod photo;
mod routes;
mod storage;
mod utils;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::Server;
use tracing::Level;

use crate::auth::{GoogleIdentity, IdentityProvider};
use crate::config::{AddonDatabase, Overrides, RuntimeConfig};
use crate::controller::GalleryController;
use crate::storage::backends::register;
use crate::storage::BackendKind;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const IDENTITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct ServerConfig {
    /// The IP address the server should bind to.
    #[clap(long, env, default_value = "0.0.0.0")]
    host: String,

    /// The port the server should bind to.
    #[clap(long, env, default_value = "3000")]
    port: u16,

    /// The external URL advertised in the API docs.
    #[clap(long, env)]
    external_url: Option<String>,

    /// The log level filter, any of `error`, `warn`, `info`, `debug` or `trace`.
    #[clap(long, env, default_value = "info")]
    log_level: Level,

    /// An optional YAML or JSON file holding the runtime configuration.
    #[clap(long, env)]
    config_file: Option<PathBuf>,

    #[clap(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[clap(long, env = "DB_HOST")]
    db_host: Option<String>,

    #[clap(long, env = "DB_PORT")]
    db_port: Option<u16>,

    #[clap(long, env = "DB_USER")]
    db_user: Option<String>,

    #[clap(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    #[clap(long, env = "DB_NAME")]
    db_name: Option<String>,

    /// The database of a managed MySQL add-on, takes precedence over `DB_*`.
    #[clap(long, env = "MYSQL_ADDON_DB")]
    addon_db: Option<String>,

    #[clap(long, env = "MYSQL_ADDON_USER")]
    addon_user: Option<String>,

    #[clap(long, env = "MYSQL_ADDON_PASSWORD", hide_env_values = true)]
    addon_password: Option<String>,

    /// The unix socket of the add-on's connection proxy.
    #[clap(long, env = "CC_MYSQL_PROXYSQL_SOCKET_PATH")]
    addon_socket_path: Option<String>,

    /// The Drive folder photos are kept in.
    #[clap(long, env = "DRIVE_FOLDER_ID")]
    drive_folder_id: Option<String>,

    #[clap(long, env = "GOOGLE_CREDENTIALS_PATH")]
    credentials_path: Option<PathBuf>,

    /// The credential JSON itself.
    #[clap(long, env = "GOOGLE_CREDENTIALS", hide_env_values = true)]
    credentials_json: Option<String>,

    /// A serialized OAuth2 token, takes precedence over the token file.
    #[clap(long, env = "GOOGLE_TOKEN", hide_env_values = true)]
    token_json: Option<String>,

    /// Uploads are enabled unless this is exactly `false`.
    #[clap(long, env = "ENABLE_UPLOAD")]
    enable_upload: Option<String>,

    /// Set by serverless hosts whose filesystem does not outlive the process.
    #[clap(long, env = "VERCEL")]
    vercel: Option<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the gallery server (the default).
    Run,

    /// Runs the OAuth2 consent flow and writes the token file.
    Authorize,
}

impl ServerConfig {
    fn overrides(&self) -> Overrides {
        Overrides {
            database_url: self.database_url.clone(),
            db_host: self.db_host.clone(),
            db_port: self.db_port,
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            db_name: self.db_name.clone(),
            addon: AddonDatabase {
                database: self.addon_db.clone(),
                user: self.addon_user.clone(),
                password: self.addon_password.clone(),
                socket_path: self.addon_socket_path.clone(),
            },
            folder_id: self.drive_folder_id.clone(),
            credentials_path: self.credentials_path.clone(),
            credentials_json: self.credentials_json.clone(),
            token_json: self.token_json.clone(),
            upload_enabled: self.enable_upload.clone(),
            ephemeral: self.vercel.as_deref().map(|v| !v.is_empty()).unwrap_or(false),
        }
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut cfg = match self.config_file.as_ref() {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };

        cfg.apply(self.overrides());
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: ServerConfig = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let cfg = args.runtime_config()?;

    match args.command.as_ref() {
        Some(Command::Authorize) => run_authorize(&cfg).await,
        Some(Command::Run) | None => run_server(&args, cfg).await,
    }
}

async fn run_authorize(cfg: &RuntimeConfig) -> Result<()> {
    let identity = GoogleIdentity::new(IDENTITY_TIMEOUT)?;
    let outcome = authorize::authorize(
        cfg,
        &identity,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        authorize::CODE_TIMEOUT,
    )
    .await?;

    match outcome {
        authorize::AuthorizeOutcome::AlreadyAuthorized => {
            info!("a usable token already exists at {}", cfg.cloud.token_file.display())
        },
        authorize::AuthorizeOutcome::NotRequired => {},
        authorize::AuthorizeOutcome::Stored(path) => info!("token stored at {}", path.display()),
    }

    Ok(())
}

async fn run_server(args: &ServerConfig, cfg: RuntimeConfig) -> Result<()> {
    // Nothing here is fatal, the selector degrades to local storage.
    let remote = if cfg.cloud.folder_id.is_some() {
        let identity: Arc<dyn IdentityProvider> = Arc::new(GoogleIdentity::new(IDENTITY_TIMEOUT)?);
        match register::connect_remote(&cfg, identity).await {
            Ok(remote) => Some(remote),
            Err(e) => {
                warn!("cloud backend unavailable: {:#}", e);
                None
            },
        }
    } else {
        None
    };

    let handle = register::select_backend(&cfg, remote).await;
    if let Some(folder) = handle.folder_id.as_deref() {
        info!("photos are scoped to folder {}", folder);
    }
    if handle.kind == BackendKind::LocalFilesystem {
        if let Err(e) = tokio::fs::create_dir_all(cfg.uploads_dir()).await {
            warn!("unable to create the uploads directory: {}", e);
        }
    }

    let ctx = Arc::new(GalleryController::new(handle, &cfg));

    let bind = format!("{}:{}", args.host, args.port);
    let server_url = args
        .external_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", &bind));

    let app = routes::build_app(ctx, cfg.uploads_dir(), &cfg.local.public_prefix, &server_url);

    info!(
        "gallery listening on {} (uploads enabled: {})",
        &bind, cfg.upload_enabled
    );
    Server::new(TcpListener::bind(bind)).run(app).await?;

    Ok(())
}
