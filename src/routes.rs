use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    response::Response,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    canonical::{Canonicalizer, TracingObserver},
    config::AppConfig,
    error::ApiError,
    fetcher::VideoFetcher,
    transfer::{DOWNLOAD_FILENAME_HEADER, JobDirGuard, file_response},
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    canonicalizer: Arc<Canonicalizer>,
    fetcher: Arc<dyn VideoFetcher>,
    download_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: AppConfig, fetcher: Arc<dyn VideoFetcher>) -> Self {
        let canonicalizer = Canonicalizer::new()
            .with_typo_repair(config.repair_typo_prefix)
            .with_observer(Arc::new(TracingObserver));

        Self {
            download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config: Arc::new(config),
            canonicalizer: Arc::new(canonicalizer),
            fetcher,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: String,
}

#[derive(Debug, Serialize)]
struct CanonicalizeResponse {
    video_id: String,
    canonical_url: String,
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    Ok(Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/canonicalize", get(canonicalize_url))
        .route("/download", get(download_video))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "YouTube Downloader API is running. Use /download?url=..."
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn canonicalize_url(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<CanonicalizeResponse>, ApiError> {
    let reference = state.canonicalizer.canonicalize(query.url.trim())?;

    Ok(Json(CanonicalizeResponse {
        canonical_url: reference.canonical_url(),
        video_id: reference.video_id().to_string(),
    }))
}

async fn download_video(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<Response, ApiError> {
    let reference = state.canonicalizer.canonicalize(query.url.trim())?;
    let canonical_url = reference.canonical_url();
    info!("Cleaned URL: {canonical_url}");

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    let guard = JobDirGuard::create(&state.config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not prepare the temporary download: {error}"))
        })?;

    let fetched = match state.fetcher.fetch(&canonical_url, guard.path()).await {
        Ok(fetched) => fetched,
        Err(error) => {
            warn!("Download failed for {canonical_url}: {error}");
            guard.cleanup().await;
            return Err(ApiError::download_failed(&error));
        }
    };

    file_response(fetched, guard, state.config.max_download_bytes).await
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Any origin may call the API.");
        return Ok(base.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(base.allow_origin(allow_origin))
}

/// `scheme://host[:port]` for a bare http(s) origin, with default ports
/// dropped. Anything carrying a path, query or credentials is refused.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let bare_origin = matches!(parsed.scheme(), "http" | "https")
        && parsed.path() == "/"
        && parsed.query().is_none()
        && parsed.fragment().is_none()
        && parsed.username().is_empty()
        && parsed.password().is_none();

    bare_origin.then(|| parsed.origin().ascii_serialization())
}
