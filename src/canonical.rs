//! YouTube link canonicalization.
//!
//! People paste `youtu.be/<id>` short links, `/shorts/<id>` links and
//! `/watch?v=<id>` links with tracking parameters attached. Everything is
//! folded into `https://www.youtube.com/watch?v=<id>` before it reaches the
//! downloader. The canonicalizer is pure: it performs no I/O and owns no
//! shared state, and observation goes through [`CanonicalizeObserver`].

use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};
use url::Url;

pub const CANONICAL_WATCH_PREFIX: &str = "https://www.youtube.com/watch?v=";

const DEFAULT_TYPO_PREFIXES: [char; 1] = ['l'];

/// A video identifier that formats to a canonical watch URL.
///
/// The identifier is kept exactly as it appeared in the parsed link,
/// percent escapes included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalVideoReference {
    video_id: String,
}

impl CanonicalVideoReference {
    fn new(video_id: String) -> Option<Self> {
        if video_id.is_empty() {
            None
        } else {
            Some(Self { video_id })
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn canonical_url(&self) -> String {
        format!("{CANONICAL_WATCH_PREFIX}{}", self.video_id)
    }
}

impl fmt::Display for CanonicalVideoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_url())
    }
}

/// Why an input could not be turned into a canonical reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("the input is not an http or https URL")]
    MalformedUrl,
    #[error("the youtu.be link has no video identifier")]
    EmptyIdentifier,
    #[error("the shorts link has no video identifier")]
    MissingShortsId,
    #[error("the watch link has no `v` parameter")]
    MissingVParam,
    #[error("the URL is not a recognized YouTube video link")]
    UnsupportedUrlShape,
}

impl Rejection {
    pub fn code(self) -> &'static str {
        match self {
            Rejection::MalformedUrl => "MALFORMED_URL",
            Rejection::EmptyIdentifier => "EMPTY_IDENTIFIER",
            Rejection::MissingShortsId => "MISSING_SHORTS_ID",
            Rejection::MissingVParam => "MISSING_V_PARAM",
            Rejection::UnsupportedUrlShape => "UNSUPPORTED_URL_SHAPE",
        }
    }
}

/// The link shape an accepted input was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlShape {
    ShortLink,
    Shorts,
    Watch,
}

impl UrlShape {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlShape::ShortLink => "youtu.be",
            UrlShape::Shorts => "shorts",
            UrlShape::Watch => "watch",
        }
    }
}

impl fmt::Display for UrlShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened while canonicalizing one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizeEvent<'a> {
    Received { input: &'a str },
    TypoPrefixStripped { prefix: char },
    Accepted { shape: UrlShape, video_id: &'a str },
    Rejected { rejection: Rejection },
}

pub trait CanonicalizeObserver: Send + Sync {
    fn observe(&self, event: &CanonicalizeEvent<'_>);
}

impl<F> CanonicalizeObserver for F
where
    F: Fn(&CanonicalizeEvent<'_>) + Send + Sync,
{
    fn observe(&self, event: &CanonicalizeEvent<'_>) {
        self(event)
    }
}

/// Forwards canonicalization events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CanonicalizeObserver for TracingObserver {
    fn observe(&self, event: &CanonicalizeEvent<'_>) {
        match event {
            CanonicalizeEvent::Received { input } => info!("Raw URL input: {input:?}"),
            CanonicalizeEvent::TypoPrefixStripped { prefix } => {
                debug!("Stripped stray {prefix:?} in front of the URL scheme")
            }
            CanonicalizeEvent::Accepted { shape, video_id } => {
                debug!(%shape, video_id, "URL canonicalized")
            }
            CanonicalizeEvent::Rejected { rejection } => {
                warn!(code = rejection.code(), "URL rejected: {rejection}")
            }
        }
    }
}

struct ShapeRule {
    shape: UrlShape,
    matches: fn(host: &str, path: &str) -> bool,
    extract: fn(url: &Url) -> Result<String, Rejection>,
}

// First match wins.
const SHAPE_RULES: [ShapeRule; 3] = [
    ShapeRule {
        shape: UrlShape::ShortLink,
        matches: is_short_link_host,
        extract: extract_short_link_id,
    },
    ShapeRule {
        shape: UrlShape::Shorts,
        matches: mentions_shorts,
        extract: extract_shorts_id,
    },
    ShapeRule {
        shape: UrlShape::Watch,
        matches: is_watch_path,
        extract: extract_watch_id,
    },
];

fn is_short_link_host(host: &str, _path: &str) -> bool {
    host.contains("youtu.be")
}

fn mentions_shorts(_host: &str, path: &str) -> bool {
    path.contains("shorts")
}

fn is_watch_path(_host: &str, path: &str) -> bool {
    path == "/watch"
}

fn extract_short_link_id(url: &Url) -> Result<String, Rejection> {
    let video_id = url.path().trim_start_matches('/');
    if video_id.is_empty() {
        return Err(Rejection::EmptyIdentifier);
    }
    Ok(video_id.to_string())
}

fn extract_shorts_id(url: &Url) -> Result<String, Rejection> {
    let (_, tail) = url
        .path()
        .rsplit_once("/shorts/")
        .ok_or(Rejection::MissingShortsId)?;
    let video_id = tail.split('?').next().unwrap_or_default();
    if video_id.is_empty() {
        return Err(Rejection::MissingShortsId);
    }
    Ok(video_id.to_string())
}

/// First non-empty `v` value, taken from the raw query without decoding.
fn extract_watch_id(url: &Url) -> Result<String, Rejection> {
    url.query()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "v" && !value.is_empty())
        .map(|(_, value)| value.to_string())
        .ok_or(Rejection::MissingVParam)
}

fn parse_web_url(input: &str) -> Option<Url> {
    Url::parse(input)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Classifies YouTube links and extracts their video identifier.
///
/// The typo repair step strips one stray leading character (by default `l`,
/// as in `lhttps://...`) when the rest of the input is a valid http(s) URL.
/// It is enabled by default and can be switched off with
/// [`Canonicalizer::with_typo_repair`].
#[derive(Clone)]
pub struct Canonicalizer {
    typo_repair: bool,
    typo_prefixes: Vec<char>,
    observer: Option<Arc<dyn CanonicalizeObserver>>,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self {
            typo_repair: true,
            typo_prefixes: DEFAULT_TYPO_PREFIXES.to_vec(),
            observer: None,
        }
    }
}

impl fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("typo_repair", &self.typo_repair)
            .field("typo_prefixes", &self.typo_prefixes)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_typo_repair(mut self, enabled: bool) -> Self {
        self.typo_repair = enabled;
        self
    }

    pub fn with_typo_prefixes(mut self, prefixes: impl IntoIterator<Item = char>) -> Self {
        self.typo_prefixes = prefixes.into_iter().collect();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CanonicalizeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn canonicalize(&self, input: &str) -> Result<CanonicalVideoReference, Rejection> {
        self.emit(&CanonicalizeEvent::Received { input });

        match self.classify(input) {
            Ok((shape, reference)) => {
                self.emit(&CanonicalizeEvent::Accepted {
                    shape,
                    video_id: reference.video_id(),
                });
                Ok(reference)
            }
            Err(rejection) => {
                self.emit(&CanonicalizeEvent::Rejected { rejection });
                Err(rejection)
            }
        }
    }

    fn classify(&self, input: &str) -> Result<(UrlShape, CanonicalVideoReference), Rejection> {
        let url = match self.repair_typo_prefix(input) {
            Some(url) => url,
            None => parse_web_url(input).ok_or(Rejection::MalformedUrl)?,
        };

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let rule = SHAPE_RULES
            .iter()
            .find(|rule| (rule.matches)(&host, url.path()))
            .ok_or(Rejection::UnsupportedUrlShape)?;

        let video_id = (rule.extract)(&url)?;
        let reference =
            CanonicalVideoReference::new(video_id).ok_or(Rejection::UnsupportedUrlShape)?;
        Ok((rule.shape, reference))
    }

    fn repair_typo_prefix(&self, input: &str) -> Option<Url> {
        if !self.typo_repair {
            return None;
        }

        let mut chars = input.chars();
        let prefix = chars.next().filter(|c| self.typo_prefixes.contains(c))?;
        let rest = chars.as_str();
        if !rest.starts_with("http") {
            return None;
        }

        let url = parse_web_url(rest)?;
        self.emit(&CanonicalizeEvent::TypoPrefixStripped { prefix });
        Some(url)
    }

    fn emit(&self, event: &CanonicalizeEvent<'_>) {
        if let Some(observer) = &self.observer {
            observer.observe(event);
        }
    }
}

/// Canonicalizes with the default policy and no observer.
pub fn canonicalize(input: &str) -> Result<CanonicalVideoReference, Rejection> {
    Canonicalizer::new().canonicalize(input)
}
