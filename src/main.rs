use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chunked_media::{
    client::{http::HttpChunkSender, uploader::Uploader},
    config::{AppConfig, RunMode, UploadJob},
    routes,
    services::{
        assembly::AssemblyPipeline,
        chunk_spool::ChunkSpool,
        media::{MediaToolkit, default_processors},
        metadata_store::{MemoryMetadataStore, UploadMetadataStore},
        sqlite_store::SqliteMetadataStore,
        upload_service::UploadService,
        validation::UploadRules,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        RunMode::Upload(job) => run_upload(job).await,
        RunMode::Migrate => {
            let store = open_sqlite(&cfg).await?;
            store.migrate().await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::Serve => serve(cfg).await,
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting chunked-media with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.uploads_dir, &cfg.temp_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Metadata store ---
    let store: Arc<dyn UploadMetadataStore> = if cfg.memory_store {
        tracing::warn!("Using in-memory metadata store; uploads will not survive a restart");
        Arc::new(MemoryMetadataStore::new(cfg.metadata_ttl_secs))
    } else {
        let store = open_sqlite(&cfg).await?;
        store.migrate().await?;
        Arc::new(store)
    };

    // --- Assembly pipeline ---
    let spool = ChunkSpool::new(&cfg.temp_dir);
    let mut pipeline = AssemblyPipeline::new(&cfg.uploads_dir, spool, &cfg.public_prefix);
    if cfg.media_processing {
        let tools = MediaToolkit::new(&cfg.ffmpeg, &cfg.ffprobe);
        pipeline = pipeline.with_processors(default_processors(&tools));
    } else {
        tracing::info!("Media processing disabled");
    }

    let rules = UploadRules {
        max_file_size: cfg.max_file_size,
        max_chunk_size: cfg.max_chunk_size,
        ..UploadRules::default()
    };

    // --- Initialize core service ---
    let service = UploadService::new(store, rules, pipeline);
    service.spawn_sweeper(cfg.sweep_interval());

    // --- Build router ---
    let app: Router = routes::routes::routes(&service).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Connect to the SQLite metadata database, creating its directory first.
async fn open_sqlite(cfg: &AppConfig) -> Result<SqliteMetadataStore> {
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);

    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        // SQLx refuses to open a missing file without `mode=rwc`.
        if let Err(e) = fs::OpenOptions::new().create(true).append(true).open(db_path) {
            tracing::warn!("Failed to open database file manually: {}", e);
        }
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(SqliteMetadataStore::new(Arc::new(db), cfg.metadata_ttl_secs))
}

/// Client mode: upload the files as one group and print the final group.
async fn run_upload(job: UploadJob) -> Result<()> {
    tracing::info!(
        "Uploading {} file(s) to {} as group {:?}",
        job.files.len(),
        job.endpoint,
        job.group
    );

    let sender = HttpChunkSender::new(&job.endpoint)?;
    let uploader = Uploader::new(Arc::new(sender), job.client);

    let group_id = uploader.upload_files(&job.group, &job.files, None).await?;
    let snapshot = uploader
        .wait(&group_id)
        .await
        .context("upload group disappeared")?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if snapshot.group.failed_files > 0 {
        anyhow::bail!(
            "{} of {} file(s) failed",
            snapshot.group.failed_files,
            snapshot.files.len()
        );
    }
    Ok(())
}
