use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_stream::stream;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    net::TcpListener,
    process::Command,
    time::{Duration, interval, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Clone)]
struct AppState {
    storage: StorageDir,
}

const MAX_QUERY_LENGTH: usize = 100;
const MAX_VIDEO_ID_LENGTH: usize = 100;
const DEFAULT_PAGE: usize = 1;
const DEFAULT_PAGE_SIZE: usize = 8;
const MAX_PAGE_SIZE: usize = 50;
const SEARCH_POOL_SIZE: usize = 50;
const AUDIO_EXTENSION: &str = "mp3";
const PLATFORM_DIR: &str = "youtube";
const DEFAULT_STORAGE_DIR: &str = "storage";
const YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const STALE_DOWNLOAD_SECONDS: u64 = 60 * 60;
const STALE_SWEEP_INTERVAL_SECONDS: u64 = 30 * 60;

#[derive(Debug, Serialize)]
struct VideoSummary {
    video_id: String,
    title: String,
    thumbnail: Option<String>,
    length: Option<u64>,
    views: Option<u64>,
    rating: Option<f64>,
    author: Option<String>,
    publish_date: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum StreamKind {
    Audio,
    Video,
    Combined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct StreamDescriptor {
    itag: u32,
    kind: StreamKind,
    resolution: Option<String>,
    audio_bitrate: Option<String>,
    container: String,
    filesize: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    DEFAULT_PAGE
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    page: usize,
    page_size: usize,
    total_results: usize,
    total_pages: usize,
    results: Vec<VideoSummary>,
}

#[derive(Debug, Serialize)]
struct VideoDetailResponse {
    #[serde(flatten)]
    video: VideoSummary,
    streams: Vec<StreamDescriptor>,
    audio_streams: Vec<StreamDescriptor>,
    video_streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpSearchResults {
    #[serde(default)]
    entries: Vec<YtDlpSearchEntry>,
}

#[derive(Debug, Deserialize)]
struct YtDlpSearchEntry {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    channel: Option<String>,
    uploader: Option<String>,
    thumbnails: Option<Vec<YtDlpThumbnail>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    average_rating: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
    upload_date: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    abr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Clone)]
struct StorageDir {
    root: PathBuf,
}

impl StorageDir {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn platform_root(&self) -> PathBuf {
        self.root.join(PLATFORM_DIR)
    }

    async fn resolve(&self, video_id: &str) -> Result<PathBuf, ApiError> {
        let directory = self.platform_root().join(video_id);
        tokio::fs::create_dir_all(&directory).await.map_err(|error| {
            ApiError::internal(format!("Could not create the download directory: {error}"))
        })?;
        Ok(directory)
    }
}

// Deletes the file when dropped. Owned by the response body stream, so the
// delete runs once the body has finished, whether it was fully sent or the
// client went away mid-transfer.
#[derive(Debug)]
struct TransientFile {
    path: PathBuf,
}

impl TransientFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove transient file {:?}: {error}", self.path);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "youtube_downloader_api=info,tower_http=info".to_string()
        }))
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let storage_root = std::env::var("STORAGE_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    let storage = StorageDir::new(storage_root);

    let platform_root = storage.platform_root();
    tokio::fs::create_dir_all(&platform_root)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the storage directory: {error}"))
        })?;

    cleanup_stale_downloads(&platform_root, STALE_DOWNLOAD_SECONDS).await;
    spawn_stale_sweep(platform_root);

    let state = AppState { storage };
    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/search", get(search_videos))
        .route("/api/video/{video_id}", get(video_detail))
        .route("/api/download/{video_id}/{itag}", get(download_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("API listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn search_videos(
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = params.query.trim();
    if query.is_empty() || query.len() > MAX_QUERY_LENGTH {
        return Err(ApiError::bad_request(format!(
            "query must be between 1 and {MAX_QUERY_LENGTH} characters."
        )));
    }
    if params.page < 1 {
        return Err(ApiError::bad_request("page must be at least 1."));
    }
    if params.page_size < 1 || params.page_size > MAX_PAGE_SIZE {
        return Err(ApiError::bad_request(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}."
        )));
    }

    let candidates = search_candidates(query).await?;
    let total_results = candidates.len();
    let results = paginate(candidates, params.page, params.page_size);

    Ok(Json(SearchResponse {
        page: params.page,
        page_size: params.page_size,
        total_results,
        total_pages: total_pages(total_results, params.page_size),
        results,
    }))
}

async fn video_detail(
    UrlPath(video_id): UrlPath<String>,
) -> Result<Json<VideoDetailResponse>, ApiError> {
    validate_video_id(&video_id)?;

    let info = fetch_video_info(&video_id).await?;
    let streams = build_stream_descriptors(&info.formats);
    let audio_streams = streams
        .iter()
        .filter(|stream| stream.kind == StreamKind::Audio)
        .cloned()
        .collect();
    let video_streams = streams
        .iter()
        .filter(|stream| stream.kind == StreamKind::Video)
        .cloned()
        .collect();

    Ok(Json(VideoDetailResponse {
        video: summary_from_video_info(&video_id, &info),
        streams,
        audio_streams,
        video_streams,
    }))
}

async fn download_stream(
    State(state): State<AppState>,
    UrlPath((video_id, itag)): UrlPath<(String, u32)>,
) -> Result<Response, ApiError> {
    validate_video_id(&video_id)?;
    if itag == 0 {
        return Err(ApiError::bad_request("itag must be a positive integer."));
    }

    let info = fetch_video_info(&video_id).await?;
    let streams = build_stream_descriptors(&info.formats);
    let Some(stream) = select_stream(streams, itag) else {
        return Err(ApiError::not_found("Stream not found"));
    };

    let title = info
        .title
        .as_deref()
        .and_then(non_empty)
        .unwrap_or("Untitled");
    let filename = download_filename(title, &stream);
    let directory = state.storage.resolve(&video_id).await?;
    let full_path = directory.join(&filename);

    materialize_stream(&video_id, itag, &full_path).await?;

    // From here on the guard owns the file; every early return below drops
    // it and removes the file before the error response goes out.
    let transient = TransientFile::new(full_path.clone());

    let file = File::open(&full_path).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloaded file: {error}"))
    })?;
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("Could not read the downloaded file size: {error}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let mut reader = ReaderStream::new(file);
    let body = Body::from_stream(stream! {
        let _transient = transient;
        while let Some(chunk) = reader.next().await {
            yield chunk;
        }
    });

    Ok((headers, body).into_response())
}

fn validate_video_id(video_id: &str) -> Result<(), ApiError> {
    if video_id.is_empty() || video_id.len() > MAX_VIDEO_ID_LENGTH {
        return Err(ApiError::bad_request(format!(
            "video_id must be between 1 and {MAX_VIDEO_ID_LENGTH} characters."
        )));
    }

    // The id names a directory under the storage root; never let it climb out.
    if video_id.contains(['/', '\\']) || video_id == "." || video_id == ".." {
        return Err(ApiError::bad_request(
            "video_id contains invalid characters.",
        ));
    }

    Ok(())
}

fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

async fn search_candidates(query: &str) -> Result<Vec<VideoSummary>, ApiError> {
    let output = run_yt_dlp(vec![
        "-J".to_string(),
        "--flat-playlist".to_string(),
        "--no-warnings".to_string(),
        format!("ytsearch{SEARCH_POOL_SIZE}:{query}"),
    ])
    .await?;

    let results: YtDlpSearchResults = serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::internal(format!("Could not parse yt-dlp search results: {error}"))
    })?;

    Ok(results
        .entries
        .into_iter()
        .filter_map(summary_from_search_entry)
        .collect())
}

async fn fetch_video_info(video_id: &str) -> Result<YtDlpVideoInfo, ApiError> {
    let output = match run_yt_dlp(vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        watch_url(video_id),
    ])
    .await
    {
        Ok(output) => output,
        Err(error) if is_unresolvable_video_error(&error.message) => {
            return Err(ApiError::not_found(format!("Video not found: {video_id}")));
        }
        Err(error) => return Err(error),
    };

    serde_json::from_slice(&output.stdout)
        .map_err(|error| ApiError::internal(format!("Could not parse yt-dlp metadata: {error}")))
}

async fn materialize_stream(
    video_id: &str,
    itag: u32,
    output_path: &Path,
) -> Result<(), ApiError> {
    let result = run_yt_dlp(vec![
        "-f".to_string(),
        itag.to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        output_path.to_string_lossy().into_owned(),
        watch_url(video_id),
    ])
    .await;

    if let Err(error) = result {
        remove_partial_output(output_path).await;
        return Err(error);
    }

    match tokio::fs::metadata(output_path).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => Err(ApiError::internal(
            "yt-dlp finished but the output path is not a regular file.",
        )),
        Err(_) => Err(ApiError::internal(
            "yt-dlp finished but the output file is missing.",
        )),
    }
}

async fn remove_partial_output(output_path: &Path) {
    for candidate in partial_output_candidates(output_path) {
        if let Err(error) = tokio::fs::remove_file(&candidate).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove partial download {:?}: {error}", candidate);
        }
    }
}

fn partial_output_candidates(output_path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![output_path.to_path_buf()];
    if let Some(name) = output_path.file_name().and_then(|name| name.to_str()) {
        candidates.push(output_path.with_file_name(format!("{name}.part")));
    }
    candidates
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, ApiError> {
    let command_future = Command::new("yt-dlp").args(args).output();
    let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
        .await
        .map_err(|_| ApiError::internal("The retrieval operation timed out."))?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed on this system. Install yt-dlp and restart the server.",
                )
            } else {
                ApiError::internal(format!("Could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(ApiError::internal(run_error_message(&output.stderr)));
    }

    Ok(output)
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn is_unresolvable_video_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("video unavailable")
        || lower.contains("is not a valid url")
        || lower.contains("incomplete youtube id")
        || lower.contains("private video")
        || lower.contains("has been removed")
}

fn summary_from_search_entry(entry: YtDlpSearchEntry) -> Option<VideoSummary> {
    let video_id = entry.id?;
    Some(VideoSummary {
        video_id,
        title: entry
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: entry
            .thumbnails
            .and_then(|thumbnails| thumbnails.into_iter().next_back())
            .map(|thumbnail| thumbnail.url),
        length: entry.duration.map(|seconds| seconds.round() as u64),
        views: entry.view_count,
        rating: None,
        author: entry.channel.or(entry.uploader),
        publish_date: None,
        description: entry.description,
    })
}

fn summary_from_video_info(video_id: &str, info: &YtDlpVideoInfo) -> VideoSummary {
    VideoSummary {
        video_id: video_id.to_string(),
        title: info
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: info.thumbnail.clone(),
        length: info.duration.map(|seconds| seconds.round() as u64),
        views: info.view_count,
        rating: info.average_rating,
        author: info.channel.clone().or_else(|| info.uploader.clone()),
        publish_date: info.upload_date.as_deref().map(format_upload_date),
        description: info.description.clone(),
    }
}

fn format_upload_date(raw: &str) -> String {
    if raw.len() == 8 && raw.bytes().all(|byte| byte.is_ascii_digit()) {
        format!("{}-{}-{}", &raw[..4], &raw[4..6], &raw[6..8])
    } else {
        raw.to_string()
    }
}

fn build_stream_descriptors(formats: &[YtDlpFormat]) -> Vec<StreamDescriptor> {
    formats.iter().filter_map(descriptor_for_format).collect()
}

fn descriptor_for_format(format: &YtDlpFormat) -> Option<StreamDescriptor> {
    // Storyboards and HLS manifests carry non-numeric format ids; they are
    // not downloadable streams and are excluded here.
    let itag = format.format_id.parse::<u32>().ok()?;

    let kind = match (has_video(format), has_audio(format)) {
        (true, true) => StreamKind::Combined,
        (true, false) => StreamKind::Video,
        (false, true) => StreamKind::Audio,
        (false, false) => return None,
    };

    Some(StreamDescriptor {
        itag,
        kind,
        resolution: format.height.map(|height| format!("{height}p")),
        audio_bitrate: format
            .abr
            .filter(|abr| *abr > 0.0)
            .map(|abr| format!("{}kbps", abr.round() as u32)),
        container: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
        filesize: format
            .filesize
            .or(format.filesize_approx)
            .map(|bytes| bytes as u64),
    })
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn select_stream(streams: Vec<StreamDescriptor>, itag: u32) -> Option<StreamDescriptor> {
    streams.into_iter().find(|stream| stream.itag == itag)
}

fn download_filename(title: &str, stream: &StreamDescriptor) -> String {
    let quality = match stream.kind {
        StreamKind::Audio => stream
            .audio_bitrate
            .clone()
            .unwrap_or_else(|| "audio".to_string()),
        StreamKind::Video | StreamKind::Combined => stream
            .resolution
            .clone()
            .unwrap_or_else(|| "video".to_string()),
    };
    let extension = match stream.kind {
        StreamKind::Audio => AUDIO_EXTENSION.to_string(),
        StreamKind::Video | StreamKind::Combined => stream.container.clone(),
    };

    sanitize_filename(&format!("{title}-{quality}.{extension}"))
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|character| {
            !matches!(
                character,
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'
            )
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    items
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .collect()
}

fn total_pages(total_results: usize, page_size: usize) -> usize {
    total_results.div_ceil(page_size)
}

fn spawn_stale_sweep(platform_root: PathBuf) {
    tokio::spawn(async move {
        let mut sweep = interval(Duration::from_secs(STALE_SWEEP_INTERVAL_SECONDS));
        // The first tick fires immediately; the startup sweep already ran.
        sweep.tick().await;
        loop {
            sweep.tick().await;
            cleanup_stale_downloads(&platform_root, STALE_DOWNLOAD_SECONDS).await;
        }
    });
}

async fn cleanup_stale_downloads(platform_root: &Path, older_than_secs: u64) {
    let mut entries = match tokio::fs::read_dir(platform_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open the storage directory for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = std::time::SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate the storage directory for cleanup: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < max_age {
            continue;
        }

        if metadata.is_dir() {
            if let Err(error) = tokio::fs::remove_dir_all(&path).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("Could not remove stale download directory {:?}: {error}", path);
            }
        } else if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove stale download file {:?}: {error}", path);
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8001".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to local development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<std::collections::HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);

    info!(
        "CORS allow-list loaded with {} origin(s)",
        allowed_origins.len()
    );

    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_fixture(
        format_id: &str,
        vcodec: Option<&str>,
        acodec: Option<&str>,
        height: Option<u32>,
        abr: Option<f32>,
        ext: Option<&str>,
    ) -> YtDlpFormat {
        YtDlpFormat {
            format_id: format_id.to_string(),
            ext: ext.map(ToString::to_string),
            vcodec: vcodec.map(ToString::to_string),
            acodec: acodec.map(ToString::to_string),
            height,
            abr,
            filesize: None,
            filesize_approx: None,
        }
    }

    fn descriptor_fixture(itag: u32, kind: StreamKind) -> StreamDescriptor {
        StreamDescriptor {
            itag,
            kind,
            resolution: Some("720p".to_string()),
            audio_bitrate: Some("128kbps".to_string()),
            container: "mp4".to_string(),
            filesize: None,
        }
    }

    #[test]
    fn test_sanitize_filename_strips_reserved_characters() {
        assert_eq!(sanitize_filename(r#"a<b>c:d"e/f\g|h?i*j"#), "abcdefghij");
        assert_eq!(sanitize_filename("  padded title  "), "padded title");
        assert_eq!(sanitize_filename(r#"<>:"/\|?*"#), "");
    }

    #[test]
    fn test_sanitize_filename_is_idempotent() {
        let inputs = [r#"What? A "Video": part 1/2"#, "  plain  ", ""];
        for input in inputs {
            let once = sanitize_filename(input);
            assert_eq!(sanitize_filename(&once), once);
        }
    }

    #[test]
    fn test_total_pages_is_ceiling_division() {
        assert_eq!(total_pages(12, 5), 3);
        assert_eq!(total_pages(0, 8), 0);
        assert_eq!(total_pages(8, 8), 1);
        assert_eq!(total_pages(9, 8), 2);
        assert_eq!(total_pages(1, 50), 1);
    }

    #[test]
    fn test_paginate_slices_the_requested_page() {
        let items: Vec<u32> = (0..12).collect();
        assert_eq!(paginate(items.clone(), 1, 5), vec![0, 1, 2, 3, 4]);
        assert_eq!(paginate(items, 2, 5), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_paginate_past_the_last_page_is_empty() {
        let items: Vec<u32> = (0..12).collect();
        assert_eq!(paginate(items.clone(), 4, 5), Vec::<u32>::new());
        assert_eq!(paginate(items, usize::MAX, 50), Vec::<u32>::new());
    }

    #[test]
    fn test_build_stream_descriptors_classifies_kinds() {
        let formats = vec![
            format_fixture("22", Some("avc1"), Some("mp4a"), Some(720), None, Some("mp4")),
            format_fixture("137", Some("avc1"), Some("none"), Some(1080), None, Some("mp4")),
            format_fixture("140", Some("none"), Some("mp4a"), None, Some(129.5), Some("m4a")),
            // Storyboards and codec-less entries are not downloadable streams.
            format_fixture("sb0", None, None, None, None, Some("mhtml")),
            format_fixture("18", Some("none"), Some("none"), None, None, Some("mp4")),
        ];

        let descriptors = build_stream_descriptors(&formats);
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].itag, 22);
        assert_eq!(descriptors[0].kind, StreamKind::Combined);
        assert_eq!(descriptors[0].resolution.as_deref(), Some("720p"));
        assert_eq!(descriptors[1].kind, StreamKind::Video);
        assert_eq!(descriptors[2].kind, StreamKind::Audio);
        assert_eq!(descriptors[2].audio_bitrate.as_deref(), Some("130kbps"));
    }

    #[test]
    fn test_select_stream_matches_itag() {
        let streams = vec![
            descriptor_fixture(22, StreamKind::Combined),
            descriptor_fixture(140, StreamKind::Audio),
        ];
        assert_eq!(
            select_stream(streams.clone(), 140).map(|stream| stream.itag),
            Some(140)
        );
        assert_eq!(select_stream(streams, 999), None);
    }

    #[test]
    fn test_download_filename_for_video_streams() {
        let stream = StreamDescriptor {
            itag: 22,
            kind: StreamKind::Combined,
            resolution: Some("720p".to_string()),
            audio_bitrate: None,
            container: "mp4".to_string(),
            filesize: None,
        };
        assert_eq!(
            download_filename("Cats: The Movie?", &stream),
            "Cats The Movie-720p.mp4"
        );
    }

    #[test]
    fn test_download_filename_for_audio_streams_uses_fixed_extension() {
        let stream = StreamDescriptor {
            itag: 140,
            kind: StreamKind::Audio,
            resolution: None,
            audio_bitrate: Some("128kbps".to_string()),
            container: "m4a".to_string(),
            filesize: None,
        };
        assert_eq!(
            download_filename("Lo-fi beats", &stream),
            "Lo-fi beats-128kbps.mp3"
        );
    }

    #[test]
    fn test_format_upload_date() {
        assert_eq!(format_upload_date("20230115"), "2023-01-15");
        assert_eq!(format_upload_date("2023"), "2023");
        assert_eq!(format_upload_date("not a date"), "not a date");
    }

    #[test]
    fn test_validate_video_id() {
        assert!(validate_video_id("dQw4w9WgXcQ").is_ok());
        assert!(validate_video_id("").is_err());
        assert!(validate_video_id(&"x".repeat(101)).is_err());
        assert!(validate_video_id("../escape").is_err());
        assert!(validate_video_id("a\\b").is_err());
        assert!(validate_video_id("..").is_err());
    }

    #[test]
    fn test_run_error_message_takes_the_last_stderr_line() {
        let stderr = b"WARNING: something minor\n\nERROR: [youtube] abc: Video unavailable\n";
        assert_eq!(
            run_error_message(stderr),
            "ERROR: [youtube] abc: Video unavailable"
        );
        assert_eq!(
            run_error_message(b""),
            "yt-dlp could not complete the operation"
        );
    }

    #[test]
    fn test_is_unresolvable_video_error() {
        assert!(is_unresolvable_video_error(
            "ERROR: [youtube] abc: Video unavailable"
        ));
        assert!(is_unresolvable_video_error("ERROR: 'xyz' is not a valid URL"));
        assert!(is_unresolvable_video_error("ERROR: Incomplete YouTube ID abc"));
        assert!(!is_unresolvable_video_error(
            "ERROR: unable to download video data"
        ));
    }

    #[test]
    fn test_normalize_origin() {
        assert_eq!(
            normalize_origin("http://Example.com"),
            Some("http://example.com".to_string())
        );
        assert_eq!(
            normalize_origin("https://example.com:443"),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://example.com:5173"),
            Some("http://example.com:5173".to_string())
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
        assert_eq!(normalize_origin("not an origin"), None);
    }

    #[test]
    fn test_build_content_disposition_has_ascii_and_utf8_names() {
        let header = build_content_disposition("Café-720p.mp4");
        assert!(header.starts_with("attachment; filename=\"Caf_-720p.mp4\""));
        assert!(header.contains("filename*=UTF-8''Caf%C3%A9-720p.mp4"));
    }

    #[test]
    fn test_sanitize_ascii_filename_replaces_unsafe_characters() {
        assert_eq!(sanitize_ascii_filename("видео.mp4"), "_____.mp4");
        assert_eq!(sanitize_ascii_filename("clip (1).mp4"), "clip (1).mp4");
        assert_eq!(sanitize_ascii_filename("   "), "download.bin");
    }

    #[test]
    fn test_partial_output_candidates_include_the_part_file() {
        let candidates = partial_output_candidates(Path::new("/tmp/job/clip.mp4"));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/tmp/job/clip.mp4"),
                PathBuf::from("/tmp/job/clip.mp4.part"),
            ]
        );
    }

    #[test]
    fn test_transient_file_removes_the_file_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("served.mp4");
        std::fs::write(&path, b"bytes").expect("write");

        drop(TransientFile::new(path.clone()));
        assert!(!path.exists());

        // A second guard over the now-missing file must not panic.
        drop(TransientFile::new(path));
    }

    #[tokio::test]
    async fn test_storage_dir_resolve_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageDir::new(dir.path().to_path_buf());

        let first = storage.resolve("dQw4w9WgXcQ").await.expect("first resolve");
        let second = storage
            .resolve("dQw4w9WgXcQ")
            .await
            .expect("second resolve");

        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("youtube").join("dQw4w9WgXcQ"));
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn test_remove_partial_output_clears_part_remnants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        let part = dir.path().join("clip.mp4.part");
        std::fs::write(&path, b"half").expect("write");
        std::fs::write(&part, b"half").expect("write");

        remove_partial_output(&path).await;

        assert!(!path.exists());
        assert!(!part.exists());
    }

    #[test]
    fn test_search_summary_uses_the_largest_thumbnail() {
        let entry = YtDlpSearchEntry {
            id: Some("abc123".to_string()),
            title: Some("A video".to_string()),
            description: None,
            duration: Some(212.4),
            view_count: Some(1000),
            channel: Some("Channel".to_string()),
            uploader: None,
            thumbnails: Some(vec![
                YtDlpThumbnail {
                    url: "https://i.ytimg.com/small.jpg".to_string(),
                },
                YtDlpThumbnail {
                    url: "https://i.ytimg.com/large.jpg".to_string(),
                },
            ]),
        };

        let summary = summary_from_search_entry(entry).expect("summary");
        assert_eq!(summary.video_id, "abc123");
        assert_eq!(summary.length, Some(212));
        assert_eq!(
            summary.thumbnail.as_deref(),
            Some("https://i.ytimg.com/large.jpg")
        );

        let missing_id = YtDlpSearchEntry {
            id: None,
            title: None,
            description: None,
            duration: None,
            view_count: None,
            channel: None,
            uploader: None,
            thumbnails: None,
        };
        assert!(summary_from_search_entry(missing_id).is_none());
    }
}
