//! HTTP service that downloads a YouTube video and streams it back to the caller.
//!
//! Every incoming link goes through [`canonical::Canonicalizer`] first; only the
//! canonical `https://www.youtube.com/watch?v=<id>` form is handed to the
//! [`fetcher::VideoFetcher`].

pub mod canonical;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod routes;
pub mod transfer;

pub use canonical::{CanonicalVideoReference, Canonicalizer, Rejection, canonicalize};
pub use config::AppConfig;
pub use error::ApiError;
pub use routes::{AppState, build_router};
