//! Video retrieval behind the [`VideoFetcher`] seam.
//!
//! Production uses `yt-dlp`; the HTTP layer only ever hands it a canonical
//! watch URL and a fresh job directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, warn};

use crate::config::AppConfig;

/// Best single file with audio and video, preferring mp4.
const MUXED_FORMAT_SELECTOR: &str = "best[ext=mp4]/best";

#[derive(Debug, Clone)]
pub struct FetchedVideo {
    pub path: PathBuf,
    pub title: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{binary} is not installed on this system")]
    NotInstalled { binary: String },
    #[error("the download exceeded the {0} second time limit")]
    TimedOut(u64),
    #[error("{0}")]
    Failed(String),
    #[error("the downloaded file could not be located")]
    MissingOutput,
    #[error("temporary file error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait VideoFetcher: Send + Sync {
    /// Downloads `canonical_url` into `job_dir`, which exists and is empty.
    async fn fetch(
        &self,
        canonical_url: &str,
        job_dir: &Path,
    ) -> Result<FetchedVideo, FetchError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.yt_dlp_bin.clone(),
            Duration::from_secs(config.yt_dlp_timeout_seconds),
        )
    }

    fn build_args(&self, canonical_url: &str, job_dir: &Path) -> Vec<String> {
        let output_template =
            format!("{}/%(title).140B-%(id)s.%(ext)s", job_dir.to_string_lossy());

        vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "-f".to_string(),
            MUXED_FORMAT_SELECTOR.to_string(),
            "--print".to_string(),
            "after_move:title".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            output_template,
            canonical_url.to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, FetchError> {
        // Dropping the future on timeout or client disconnect must not leave
        // yt-dlp writing into a job directory that is about to be removed.
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| FetchError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    FetchError::NotInstalled {
                        binary: self.binary.clone(),
                    }
                } else {
                    FetchError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(FetchError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl VideoFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        canonical_url: &str,
        job_dir: &Path,
    ) -> Result<FetchedVideo, FetchError> {
        debug!(binary = %self.binary, canonical_url, "starting yt-dlp");
        let output = self.run(self.build_args(canonical_url, job_dir)).await?;
        let (title, printed_path) = parse_printed_output(&output.stdout);
        let path = resolve_downloaded_file(job_dir, printed_path.as_deref()).await?;

        Ok(FetchedVideo { path, title })
    }
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the download")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "the URL is not supported by the downloader".to_string()
    } else {
        message
    }
}

/// Splits the `--print` output into (title, file path): the last two lines.
fn parse_printed_output(stdout: &[u8]) -> (Option<String>, Option<String>) {
    let text = String::from_utf8_lossy(stdout);
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .rev();

    let path = lines.next().map(ToString::to_string);
    let title = lines.next().map(ToString::to_string);
    (title, path)
}

/// Finds the downloaded file: the printed path (absolute or relative to the
/// job directory) if it is a regular file inside the job directory, otherwise
/// the first such file in the directory.
async fn resolve_downloaded_file(
    job_dir: &Path,
    printed_path: Option<&str>,
) -> Result<PathBuf, FetchError> {
    let job_root = tokio::fs::canonicalize(job_dir).await?;

    let printed = printed_path
        .into_iter()
        .flat_map(|value| [PathBuf::from(value), job_dir.join(value)]);
    for candidate in printed {
        if let Some(path) = contained_file(&job_root, &candidate).await? {
            return Ok(path);
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(path) = contained_file(&job_root, &entry.path()).await? {
            return Ok(path);
        }
    }

    Err(FetchError::MissingOutput)
}

async fn contained_file(
    job_root: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, FetchError> {
    let resolved = match tokio::fs::canonicalize(candidate).await {
        Ok(resolved) => resolved,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !resolved.starts_with(job_root) {
        warn!(?resolved, "Ignoring yt-dlp output outside the job directory");
        return Ok(None);
    }

    let is_file = tokio::fs::metadata(&resolved).await?.is_file();
    Ok(is_file.then_some(resolved))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn args_select_muxed_stream_and_end_with_url() {
        let fetcher = YtDlpFetcher::new("yt-dlp", Duration::from_secs(5));
        let args = fetcher.build_args(
            "https://www.youtube.com/watch?v=abc",
            Path::new("/tmp/job"),
        );

        let selector = args.iter().position(|arg| arg == "-f").unwrap() + 1;
        assert_eq!(args[selector], "best[ext=mp4]/best");
        assert!(args.contains(&"/tmp/job/%(title).140B-%(id)s.%(ext)s".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=abc")
        );
    }

    #[test]
    fn error_message_uses_last_stderr_line() {
        let stderr = b"[youtube] abc: Downloading webpage\nERROR: Video unavailable\n\n";
        assert_eq!(run_error_message(stderr), "ERROR: Video unavailable");
        assert_eq!(
            run_error_message(b"ERROR: Unsupported URL: https://x"),
            "the URL is not supported by the downloader"
        );
        assert_eq!(run_error_message(b""), "yt-dlp could not complete the download");
    }

    #[test]
    fn printed_output_yields_title_and_path() {
        let stdout = b"Never Gonna Give You Up\n/tmp/job/Never Gonna-dQw4w9WgXcQ.mp4\n";
        let (title, path) = parse_printed_output(stdout);
        assert_eq!(title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(path.as_deref(), Some("/tmp/job/Never Gonna-dQw4w9WgXcQ.mp4"));

        let (title, path) = parse_printed_output(b"/tmp/job/only.mp4\n");
        assert_eq!(title, None);
        assert_eq!(path.as_deref(), Some("/tmp/job/only.mp4"));
    }

    #[tokio::test]
    async fn printed_path_inside_job_dir_is_used() {
        let job = tempdir().unwrap();
        let file = job.path().join("clip.mp4");
        std::fs::write(&file, b"data").unwrap();

        let resolved = resolve_downloaded_file(job.path(), file.to_str())
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&file).unwrap());
    }

    #[tokio::test]
    async fn path_outside_job_dir_falls_back_to_scan() {
        let job = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let outside = elsewhere.path().join("evil.mp4");
        std::fs::write(&outside, b"nope").unwrap();
        let inside = job.path().join("real.mp4");
        std::fs::write(&inside, b"data").unwrap();

        let resolved = resolve_downloaded_file(job.path(), outside.to_str())
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&inside).unwrap());
    }

    #[tokio::test]
    async fn empty_job_dir_is_missing_output() {
        let job = tempdir().unwrap();
        let result = resolve_downloaded_file(job.path(), Some("ghost.mp4")).await;
        assert!(matches!(result, Err(FetchError::MissingOutput)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_download_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = tempdir().unwrap();
        let marker = scratch.path().join("still-running");
        let script = scratch.path().join("slow-yt-dlp");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nsleep 2\ntouch '{}'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let job = tempdir().unwrap();
        let fetcher = YtDlpFetcher::new(script.to_string_lossy(), Duration::from_millis(300));
        let result = fetcher
            .fetch("https://www.youtube.com/watch?v=abc", job.path())
            .await;
        assert!(matches!(result, Err(FetchError::TimedOut(_))));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "yt-dlp kept running after the timeout");
    }

    #[tokio::test]
    async fn printed_relative_path_is_resolved_in_job_dir() {
        let job = tempdir().unwrap();
        std::fs::write(job.path().join("clip.mp4"), b"data").unwrap();
        std::fs::write(job.path().join("another.mp4"), b"data").unwrap();

        let resolved = resolve_downloaded_file(job.path(), Some("clip.mp4"))
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(job.path().join("clip.mp4")).unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let job = tempdir().unwrap();
        let fetcher =
            YtDlpFetcher::new("yt-dlp-binary-that-does-not-exist", Duration::from_secs(5));
        let result = fetcher
            .fetch("https://www.youtube.com/watch?v=abc", job.path())
            .await;
        assert!(matches!(result, Err(FetchError::NotInstalled { .. })));
    }
}
