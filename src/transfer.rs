//! Per-request job directories and streaming the downloaded file back.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::{
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior, interval_at},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::ApiError, fetcher::FetchedVideo};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

/// Owns one job directory and removes it when dropped.
///
/// The guard travels inside the response body stream, so the directory
/// disappears once the body is fully sent or the client goes away.
#[derive(Debug)]
pub struct JobDirGuard {
    job_dir: Option<PathBuf>,
}

impl JobDirGuard {
    pub async fn create(transfer_dir: &Path) -> std::io::Result<Self> {
        let job_dir = transfer_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&job_dir).await?;
        Ok(Self {
            job_dir: Some(job_dir),
        })
    }

    pub fn path(&self) -> &Path {
        self.job_dir.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Removes the directory now instead of on drop.
    pub async fn cleanup(mut self) {
        if let Some(job_dir) = self.job_dir.take() {
            cleanup_download_job(&job_dir).await;
        }
    }
}

impl Drop for JobDirGuard {
    fn drop(&mut self) {
        let Some(job_dir) = self.job_dir.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    cleanup_download_job(&job_dir).await;
                });
            }
            Err(_) => {
                if let Err(error) = std::fs::remove_dir_all(&job_dir)
                    && error.kind() != ErrorKind::NotFound
                {
                    warn!("Could not remove job directory {:?}: {error}", job_dir);
                }
            }
        }
    }
}

pub async fn cleanup_download_job(job_dir: &Path) {
    match tokio::fs::remove_dir_all(job_dir).await {
        Ok(()) => debug!("Removed job directory {:?}", job_dir),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => info!("Could not remove job directory {:?}: {error}", job_dir),
    }
}

/// Deletes entries of `transfer_dir` last modified more than
/// `older_than_secs` ago and returns how many went. Zero disables the sweep.
pub async fn cleanup_stale_download_jobs(transfer_dir: &Path, older_than_secs: u64) -> usize {
    if older_than_secs == 0 {
        return 0;
    }

    match sweep_transfer_dir(transfer_dir, Duration::from_secs(older_than_secs)).await {
        Ok(0) => 0,
        Ok(removed) => {
            info!(removed, "Removed stale download jobs from {:?}", transfer_dir);
            removed
        }
        Err(error) if error.kind() == ErrorKind::NotFound => 0,
        Err(error) => {
            warn!("Stale job sweep of {:?} stopped: {error}", transfer_dir);
            0
        }
    }
}

/// Repeats [`cleanup_stale_download_jobs`] every `every`, starting one period
/// from now. Returns `None` when the sweep is disabled.
pub fn spawn_stale_job_sweeper(
    transfer_dir: PathBuf,
    older_than_secs: u64,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if older_than_secs == 0 || every.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + every, every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            cleanup_stale_download_jobs(&transfer_dir, older_than_secs).await;
        }
    }))
}

async fn sweep_transfer_dir(transfer_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = tokio::fs::read_dir(transfer_dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match remove_if_stale(&path, max_age).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale entry {:?}: {error}", path),
        }
    }

    Ok(removed)
}

async fn remove_if_stale(path: &Path, max_age: Duration) -> std::io::Result<bool> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    let age = metadata.modified()?.elapsed().unwrap_or_default();
    if age < max_age {
        return Ok(false);
    }

    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}

/// Streams `fetched` as an attachment. The job directory goes away with the
/// body, or immediately if the response cannot be built.
pub async fn file_response(
    fetched: FetchedVideo,
    guard: JobDirGuard,
    max_bytes: u64,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(&fetched.path).await.map_err(|error| {
        ApiError::internal(format!("Could not read the downloaded file metadata: {error}"))
    })?;
    if metadata.len() > max_bytes {
        return Err(ApiError::file_too_large(max_bytes));
    }

    let file = tokio::fs::File::open(&fetched.path).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloaded file: {error}"))
    })?;

    let filename = attachment_filename(fetched.title.as_deref(), &fetched.path);

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    info!("Video downloaded: {filename}");

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _keep_until_sent = &guard;
        chunk
    });

    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Title with spaces replaced by underscores, keeping the file's extension.
pub fn attachment_filename(title: Option<&str>, path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or("mp4");

    match title.map(str::trim).filter(|title| !title.is_empty()) {
        Some(title) => format!("{}.{extension}", title.replace(' ', "_")),
        None => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("video.{extension}")),
    }
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "video.mp4".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use axum::body::to_bytes;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn attachment_name_comes_from_title() {
        assert_eq!(
            attachment_filename(Some("Never Gonna Give You Up"), Path::new("/j/x-abc.mp4")),
            "Never_Gonna_Give_You_Up.mp4"
        );
        assert_eq!(
            attachment_filename(Some("Clip"), Path::new("/j/x-abc.webm")),
            "Clip.webm"
        );
        assert_eq!(
            attachment_filename(Some("   "), Path::new("/j/raw name.mp4")),
            "raw name.mp4"
        );
        assert_eq!(attachment_filename(None, Path::new("/j/noext")), "noext");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for_filename("a.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.webm"), "video/webm");
        assert_eq!(content_type_for_filename("a"), "application/octet-stream");
    }

    #[test]
    fn content_disposition_has_ascii_and_utf8_names() {
        assert_eq!(
            build_content_disposition("Canción_1.mp4"),
            "attachment; filename=\"Canci_n_1.mp4\"; filename*=UTF-8''Canci%C3%B3n_1.mp4"
        );
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_ascii_filename("a/b\"c.mp4"), "a_b_c.mp4");
        assert_eq!(sanitize_ascii_filename("   "), "video.mp4");
    }

    #[tokio::test]
    async fn explicit_cleanup_removes_job_dir() {
        let transfer = tempdir().unwrap();
        let guard = JobDirGuard::create(transfer.path()).await.unwrap();
        let job_dir = guard.path().to_path_buf();
        assert!(job_dir.is_dir());
        assert!(job_dir.starts_with(transfer.path()));

        guard.cleanup().await;
        assert!(!job_dir.exists());
    }

    #[test]
    fn drop_outside_runtime_removes_job_dir() {
        let transfer = tempdir().unwrap();
        let job_dir = transfer.path().join("job");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("video.mp4"), b"x").unwrap();

        drop(JobDirGuard {
            job_dir: Some(job_dir.clone()),
        });
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn response_streams_file_then_removes_job_dir() {
        let transfer = tempdir().unwrap();
        let guard = JobDirGuard::create(transfer.path()).await.unwrap();
        let job_dir = guard.path().to_path_buf();
        let path = job_dir.join("clip-abc.mp4");
        tokio::fs::write(&path, b"video bytes").await.unwrap();

        let fetched = FetchedVideo {
            path,
            title: Some("My Clip".to_string()),
        };
        let response = file_response(fetched, guard, 1024).await.unwrap();
        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[CONTENT_LENGTH], "11");
        assert_eq!(headers[DOWNLOAD_FILENAME_HEADER], "My_Clip.mp4");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"video bytes");

        for _ in 0..50 {
            if !job_dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let transfer = tempdir().unwrap();
        let guard = JobDirGuard::create(transfer.path()).await.unwrap();
        let path = guard.path().join("big.mp4");
        tokio::fs::write(&path, vec![0u8; 64]).await.unwrap();

        let fetched = FetchedVideo { path, title: None };
        let error = file_response(fetched, guard, 16).await.unwrap_err();
        assert_eq!(error.code, Some("FILE_TOO_LARGE"));
    }

    #[tokio::test]
    async fn stale_sweep_keeps_fresh_entries() {
        let transfer = tempdir().unwrap();
        let fresh = transfer.path().join("fresh");
        std::fs::create_dir_all(&fresh).unwrap();

        assert_eq!(cleanup_stale_download_jobs(transfer.path(), 3600).await, 0);
        assert!(fresh.exists());

        assert_eq!(cleanup_stale_download_jobs(transfer.path(), 0).await, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn stale_sweep_of_missing_dir_is_quiet() {
        let transfer = tempdir().unwrap();
        let missing = transfer.path().join("not-created");
        assert_eq!(cleanup_stale_download_jobs(&missing, 60).await, 0);
    }

    #[cfg(unix)]
    fn age_entry(path: &Path, age: Duration) {
        let file = if path.is_dir() {
            std::fs::File::open(path).unwrap()
        } else {
            std::fs::File::options().write(true).open(path).unwrap()
        };
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_sweep_removes_old_entries() {
        let transfer = tempdir().unwrap();
        let old_dir = transfer.path().join("old-job");
        std::fs::create_dir_all(&old_dir).unwrap();
        let old_file = transfer.path().join("orphan.part");
        std::fs::write(&old_file, b"x").unwrap();
        let fresh = transfer.path().join("fresh-job");
        std::fs::create_dir_all(&fresh).unwrap();

        let two_hours = Duration::from_secs(2 * 60 * 60);
        age_entry(&old_dir, two_hours);
        age_entry(&old_file, two_hours);

        assert_eq!(cleanup_stale_download_jobs(transfer.path(), 60).await, 2);
        assert!(!old_dir.exists());
        assert!(!old_file.exists());
        assert!(fresh.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sweeper_keeps_clearing_on_its_interval() {
        let transfer = tempdir().unwrap();
        let sweeper =
            spawn_stale_job_sweeper(transfer.path().to_path_buf(), 60, Duration::from_millis(25))
                .unwrap();

        for name in ["first", "second"] {
            let job_dir = transfer.path().join(name);
            std::fs::create_dir_all(&job_dir).unwrap();
            age_entry(&job_dir, Duration::from_secs(2 * 60 * 60));

            for _ in 0..100 {
                if !job_dir.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(!job_dir.exists(), "{name} was not swept");
        }

        sweeper.abort();
    }

    #[tokio::test]
    async fn disabled_sweeper_is_not_spawned() {
        let transfer = tempdir().unwrap();
        let path = transfer.path().to_path_buf();
        assert!(spawn_stale_job_sweeper(path.clone(), 0, Duration::from_secs(1)).is_none());
        assert!(spawn_stale_job_sweeper(path, 60, Duration::ZERO).is_none());
    }
}
