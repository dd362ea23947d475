use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_MAX_DOWNLOAD_MB: u64 = 250;
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_STALE_SWEEP_INTERVAL_SECONDS: u64 = 10 * 60;

/// Runtime settings, read from environment variables at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub transfer_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_download_bytes: u64,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout_seconds: u64,
    /// Age after which leftover job directories are swept. Zero disables it.
    pub stale_job_seconds: u64,
    /// How often the background sweep runs after the startup sweep.
    pub stale_sweep_interval_seconds: u64,
    pub repair_typo_prefix: bool,
    /// Empty means any origin may call the API.
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let transfer_dir = lookup("TRANSFER_DIR")
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("downloads"));
        let max_download_mb = read_u64(&lookup, "MAX_DOWNLOAD_MB")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_DOWNLOAD_MB);

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            transfer_dir,
            max_concurrent_downloads: read_usize(&lookup, "MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            max_download_bytes: max_download_mb.saturating_mul(1_048_576),
            yt_dlp_bin: lookup("YT_DLP_BIN")
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            yt_dlp_timeout_seconds: read_u64(&lookup, "YT_DLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            stale_job_seconds: read_u64(&lookup, "STALE_JOB_SECONDS")
                .unwrap_or(DEFAULT_STALE_JOB_SECONDS),
            stale_sweep_interval_seconds: read_u64(&lookup, "STALE_SWEEP_INTERVAL_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_STALE_SWEEP_INTERVAL_SECONDS),
            repair_typo_prefix: read_bool(&lookup, "REPAIR_TYPO_PREFIX").unwrap_or(true),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let value = lookup(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<usize> {
    lookup(name).and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) =
        lookup("APP_ADDR").and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
