use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use crate::client::{ClientConfig, RetryPolicy};
use crate::services::validation::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE};

const ENV_PREFIX: &str = "CHUNKED_MEDIA_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub uploads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub database_url: String,
    pub memory_store: bool,
    pub metadata_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub public_prefix: String,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub media_processing: bool,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    Serve,
    /// Apply the metadata schema and exit.
    Migrate,
    Upload(UploadJob),
}

/// Client run: upload `files` as one group against `endpoint`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadJob {
    pub endpoint: String,
    pub group: String,
    pub files: Vec<PathBuf>,
    pub client: ClientConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked media upload service")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides CHUNKED_MEDIA_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_MEDIA_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory assembled files are written to (overrides CHUNKED_MEDIA_UPLOADS_DIR)
    #[arg(long)]
    pub uploads_dir: Option<PathBuf>,

    /// Directory for in-flight chunks; defaults to `<uploads-dir>/temp`
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Database URL (overrides CHUNKED_MEDIA_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Keep upload metadata in process memory instead of SQLite
    #[arg(long)]
    pub memory_store: bool,

    /// Seconds of inactivity before an upload's metadata expires
    #[arg(long)]
    pub metadata_ttl_secs: Option<u64>,

    /// Seconds between sweeps for expired uploads
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Largest accepted declared file size, in bytes
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Largest accepted chunk body, in bytes
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// URL prefix assembled files are served under
    #[arg(long)]
    pub public_prefix: Option<String>,

    /// ffmpeg executable
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// ffprobe executable
    #[arg(long)]
    pub ffprobe: Option<PathBuf>,

    /// Skip format conversion and thumbnail extraction
    #[arg(long)]
    pub no_media_processing: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload files to a running server as one group
    Upload {
        /// Server base URL (overrides CHUNKED_MEDIA_ENDPOINT)
        #[arg(long)]
        endpoint: Option<String>,

        /// Group name
        #[arg(long, default_value = "upload")]
        group: String,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Tries per chunk, the first one included
        #[arg(long)]
        attempts: Option<u32>,

        /// Delay between tries, in milliseconds
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge parsed arguments over `lookup` (environment) over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = lookup(&env_key("HOST")).unwrap_or_else(|| "0.0.0.0".into());
        let env_port: u16 = env_parsed(&lookup, "PORT", 3000)?;
        let env_uploads = lookup(&env_key("UPLOADS_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./uploads"));
        let env_temp = lookup(&env_key("TEMP_DIR")).map(PathBuf::from);
        let env_db = lookup(&env_key("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let env_memory = env_flag(&lookup, "MEMORY_STORE")?;
        let env_ttl = env_parsed(&lookup, "METADATA_TTL_SECS", 24 * 60 * 60)?;
        let env_sweep = env_parsed(&lookup, "SWEEP_INTERVAL_SECS", 300)?;
        let env_max_file = env_parsed(&lookup, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?;
        let env_max_chunk = env_parsed(&lookup, "MAX_CHUNK_SIZE", DEFAULT_MAX_CHUNK_SIZE)?;
        let env_prefix = lookup(&env_key("PUBLIC_PREFIX")).unwrap_or_else(|| "/uploads".into());
        let env_ffmpeg = lookup(&env_key("FFMPEG"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let env_ffprobe = lookup(&env_key("FFPROBE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffprobe"));
        let env_no_media = env_flag(&lookup, "NO_MEDIA_PROCESSING")?;

        // --- Merge ---
        let uploads_dir = args.uploads_dir.unwrap_or(env_uploads);
        let temp_dir = args
            .temp_dir
            .or(env_temp)
            .unwrap_or_else(|| uploads_dir.join("temp"));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            uploads_dir,
            temp_dir,
            database_url: args.database_url.unwrap_or(env_db),
            memory_store: args.memory_store || env_memory,
            metadata_ttl_secs: args.metadata_ttl_secs.unwrap_or(env_ttl),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            max_file_size: args.max_file_size.unwrap_or(env_max_file),
            max_chunk_size: args.max_chunk_size.unwrap_or(env_max_chunk),
            public_prefix: args.public_prefix.unwrap_or(env_prefix),
            ffmpeg: args.ffmpeg.unwrap_or(env_ffmpeg),
            ffprobe: args.ffprobe.unwrap_or(env_ffprobe),
            media_processing: !(args.no_media_processing || env_no_media),
        };

        if cfg.sweep_interval_secs == 0 {
            bail!("sweep interval must be at least one second");
        }
        if cfg.max_chunk_size == 0 {
            bail!("max chunk size must be positive");
        }

        let mode = match args.command {
            Some(Command::Upload {
                endpoint,
                group,
                chunk_size,
                attempts,
                retry_delay_ms,
                files,
            }) => {
                let defaults = ClientConfig::default();
                let client = ClientConfig {
                    chunk_size: chunk_size.unwrap_or(defaults.chunk_size),
                    retry: RetryPolicy {
                        attempts: attempts.unwrap_or(defaults.retry.attempts),
                        delay: retry_delay_ms
                            .map(Duration::from_millis)
                            .unwrap_or(defaults.retry.delay),
                    },
                };
                if client.chunk_size == 0 {
                    bail!("chunk size must be positive");
                }
                if client.retry.attempts == 0 {
                    bail!("attempts must be at least 1");
                }
                let endpoint = endpoint
                    .or_else(|| lookup(&env_key("ENDPOINT")))
                    .unwrap_or_else(|| format!("http://127.0.0.1:{}", cfg.port));
                RunMode::Upload(UploadJob {
                    endpoint,
                    group,
                    files,
                    client,
                })
            }
            None if args.migrate => RunMode::Migrate,
            None => RunMode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn env_key(name: &str) -> String {
    format!("{}{}", ENV_PREFIX, name)
}

fn env_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let key = env_key(name);
    match lookup(&key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}

fn env_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool> {
    let key = env_key(name);
    match lookup(&key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => bail!("parsing {} value `{}`: expected a boolean", key, v),
    }
}
