//! Media type detection and the post-assembly processors.
//!
//! Processors are keyed on the detected MIME type; the first registered
//! processor that accepts a type handles it. Conversion and probing shell out
//! to `ffmpeg`/`ffprobe`.

use async_trait::async_trait;
use serde::Deserialize;
use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{fs, io::AsyncReadExt, process::Command};
use tracing::{debug, warn};

use crate::services::{UploadError, UploadResult};

/// Seek offset of the poster frame extracted from videos, in seconds.
pub const POSTER_FRAME_OFFSET_SECS: f64 = 1.0;

const SNIFF_LEN: usize = 64;

/// Identify a file from its leading bytes.
pub fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return Some("image/webp"),
            b"WAVE" => return Some("audio/wav"),
            _ => {}
        }
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some(match &head[8..12] {
            b"heic" | b"heix" | b"hevc" | b"hevx" => "image/heic",
            b"mif1" | b"msf1" | b"heim" | b"heis" => "image/heif",
            b"qt  " => "video/quicktime",
            _ => "video/mp4",
        });
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }
    if head.starts_with(b"OggS") {
        return Some("audio/ogg");
    }
    if head.starts_with(b"ID3") || (head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0) {
        return Some("audio/mpeg");
    }
    None
}

/// Sniff the file at `path`, falling back to the declared type.
pub async fn detect_media_type(path: &Path, declared: &str) -> UploadResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let detected = sniff_mime(&head)
        .map(str::to_string)
        .unwrap_or_else(|| declared.to_ascii_lowercase());
    debug!("detected {} for {} (declared {})", detected, path.display(), declared);
    Ok(detected)
}

/// MIME type by file extension, `application/octet-stream` when unknown.
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// The assembled file as it moves through processing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedArtifact {
    pub path: PathBuf,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u64>,
    pub codec: Option<String>,
    /// Poster frame written next to the artifact.
    pub thumbnail: Option<PathBuf>,
}

impl ProcessedArtifact {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            ..Default::default()
        }
    }

    fn apply_probe(&mut self, probe: ProbeReport) {
        self.width = probe.width.or(self.width);
        self.height = probe.height.or(self.height);
        self.duration = probe.duration.or(self.duration);
        self.frame_rate = probe.frame_rate.or(self.frame_rate);
        self.bitrate = probe.bitrate.or(self.bitrate);
        self.codec = probe.codec.or(self.codec.take());
    }
}

/// A post-assembly step for one family of media types.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, mime_type: &str) -> bool;

    /// Transform the artifact in place. Files the processor replaces must be
    /// removed by it; on error the caller removes whatever `artifact.path`
    /// and `artifact.thumbnail` point at.
    async fn process(&self, artifact: &mut ProcessedArtifact) -> UploadResult<()>;
}

/// Technical metadata reported by `ffprobe`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u64>,
    pub codec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe(json: &[u8]) -> Result<ProbeReport, serde_json::Error> {
    let output: FfprobeOutput = serde_json::from_slice(json)?;
    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let primary = video.or_else(|| output.streams.first());

    let format_duration = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let format_bitrate = output
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok());

    Ok(ProbeReport {
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        duration: format_duration.or_else(|| {
            primary
                .and_then(|s| s.duration.as_deref())
                .and_then(|d| d.parse().ok())
        }),
        frame_rate: video.and_then(|s| {
            s.avg_frame_rate
                .as_deref()
                .and_then(parse_rational)
                .or_else(|| s.r_frame_rate.as_deref().and_then(parse_rational))
        }),
        bitrate: format_bitrate.or_else(|| {
            primary
                .and_then(|s| s.bit_rate.as_deref())
                .and_then(|b| b.parse().ok())
        }),
        codec: primary.and_then(|s| s.codec_name.clone()),
    })
}

/// `"30000/1001"` → 29.97; zero denominators and `"0/0"` yield `None`.
fn parse_rational(raw: &str) -> Option<f64> {
    let (num, den) = match raw.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (raw.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(((num / den) * 100.0).round() / 100.0)
}

/// Locations of the external media tools.
#[derive(Debug, Clone)]
pub struct MediaToolkit {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MediaToolkit {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl MediaToolkit {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run(&self, program: &Path, args: Vec<OsString>) -> UploadResult<Vec<u8>> {
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    UploadError::assembly(format!("`{}` is not installed", program.display()))
                } else {
                    UploadError::Io(err)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UploadError::assembly(format!(
                "`{}` exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Run ffmpeg with `-y -v error` prepended.
    pub async fn ffmpeg(&self, args: Vec<OsString>) -> UploadResult<()> {
        let mut full: Vec<OsString> = vec!["-y".into(), "-v".into(), "error".into()];
        full.extend(args);
        self.run(&self.ffmpeg, full).await.map(|_| ())
    }

    pub async fn probe(&self, path: &Path) -> UploadResult<ProbeReport> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
            path.as_os_str().to_owned(),
        ];
        let stdout = self.run(&self.ffprobe, args).await?;
        parse_probe(&stdout)
            .map_err(|err| UploadError::assembly(format!("unreadable ffprobe output: {}", err)))
    }
}

/// `dir/name.ext` → `dir/name<suffix>.<ext>`.
fn sibling_path(path: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}.{}", stem, suffix, ext))
}

/// Where the PNG rendition of `path` goes. Never `path` itself, even when
/// HEIC content arrived under a `.png` name.
fn png_output_path(path: &Path) -> PathBuf {
    let already_png = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
    if already_png {
        sibling_path(path, "_converted", "png")
    } else {
        sibling_path(path, "", "png")
    }
}

/// Converts HEIC/HEIF stills to PNG and drops the original.
#[derive(Debug, Clone, Default)]
pub struct HeicToPngProcessor {
    tools: MediaToolkit,
}

impl HeicToPngProcessor {
    pub fn new(tools: MediaToolkit) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl MediaProcessor for HeicToPngProcessor {
    fn name(&self) -> &'static str {
        "heic-to-png"
    }

    fn accepts(&self, mime_type: &str) -> bool {
        matches!(mime_type, "image/heic" | "image/heif")
    }

    async fn process(&self, artifact: &mut ProcessedArtifact) -> UploadResult<()> {
        let output = png_output_path(&artifact.path);
        let converted = self
            .tools
            .ffmpeg(vec![
                "-i".into(),
                artifact.path.as_os_str().to_owned(),
                "-frames:v".into(),
                "1".into(),
                output.as_os_str().to_owned(),
            ])
            .await;
        if let Err(err) = converted {
            let _ = fs::remove_file(&output).await;
            return Err(err);
        }

        let original = std::mem::replace(&mut artifact.path, output);
        artifact.mime_type = "image/png".to_string();
        if let Err(err) = fs::remove_file(&original).await {
            warn!("failed to remove converted original {}: {}", original.display(), err);
        }

        let probe = self.tools.probe(&artifact.path).await?;
        artifact.apply_probe(probe);
        Ok(())
    }
}

/// Extracts a poster frame and technical metadata from videos.
#[derive(Debug, Clone, Default)]
pub struct VideoProcessor {
    tools: MediaToolkit,
}

impl VideoProcessor {
    pub fn new(tools: MediaToolkit) -> Self {
        Self { tools }
    }

    async fn poster_frame(&self, source: &Path, target: &Path, offset: f64) -> UploadResult<bool> {
        self.tools
            .ffmpeg(vec![
                "-ss".into(),
                format!("{}", offset).into(),
                "-i".into(),
                source.as_os_str().to_owned(),
                "-frames:v".into(),
                "1".into(),
                "-q:v".into(),
                "2".into(),
                target.as_os_str().to_owned(),
            ])
            .await?;
        Ok(fs::try_exists(target).await?)
    }
}

#[async_trait]
impl MediaProcessor for VideoProcessor {
    fn name(&self) -> &'static str {
        "video-poster"
    }

    fn accepts(&self, mime_type: &str) -> bool {
        mime_type.starts_with("video/")
    }

    async fn process(&self, artifact: &mut ProcessedArtifact) -> UploadResult<()> {
        let probe = self.tools.probe(&artifact.path).await?;
        artifact.apply_probe(probe);

        let thumb = sibling_path(&artifact.path, "_thumb", "jpg");
        artifact.thumbnail = Some(thumb.clone());

        // Clips shorter than the offset produce no frame; take the first one.
        let mut written = self
            .poster_frame(&artifact.path, &thumb, POSTER_FRAME_OFFSET_SECS)
            .await?;
        if !written {
            written = self.poster_frame(&artifact.path, &thumb, 0.0).await?;
        }
        if !written {
            return Err(UploadError::assembly(format!(
                "no poster frame could be extracted from {}",
                artifact.path.display()
            )));
        }
        Ok(())
    }
}

/// The default processor chain.
pub fn default_processors(tools: &MediaToolkit) -> Vec<Box<dyn MediaProcessor>> {
    vec![
        Box::new(HeicToPngProcessor::new(tools.clone())),
        Box::new(VideoProcessor::new(tools.clone())),
    ]
}
