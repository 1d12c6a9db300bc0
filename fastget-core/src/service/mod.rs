//! The uniform abstraction over heterogeneous streaming back-ends.

pub mod adapters;
pub mod auth;
pub mod registry;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;

use crate::cdm::LicenseFraming;
use crate::manifest::{self, dash, ManifestError};
use crate::title::{Episode, MovieGroup, Series, Title};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded fan-out for per-season and per-episode metadata fetches.
pub const FAN_OUT: usize = 8;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported url: {0}")]
    BadUrl(String),
    #[error("title not found: {0}")]
    NotFound(String),
    #[error("region locked: {0}")]
    RegionLocked(String),
    #[error("subscription required: {0}")]
    RequiresSubscription(String),
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    #[error("manifest malformed: {0}")]
    ManifestMalformed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid playback token: {0}")]
    InvalidToken(String),
    #[error("unexpected {service} payload: {detail}")]
    Payload {
        service: &'static str,
        detail: String,
    },
    #[error("{service} does not support {operation}")]
    Unsupported {
        service: &'static str,
        operation: &'static str,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ServiceError {
    /// Whether the error terminates the whole run rather than the current
    /// title.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServiceError::BadUrl(_) | ServiceError::AuthExpired(_))
    }
}

impl From<ManifestError> for ServiceError {
    fn from(err: ManifestError) -> Self {
        ServiceError::ManifestMalformed(err.to_string())
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// URL classification per each service's grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Catalog,
    Episode,
    Movie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Dash,
    Hls,
}

/// Everything needed to start fetching one title: manifest location, license
/// negotiation parameters and any pre-resolved subtitle.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub manifest_url: String,
    pub kind: ManifestKind,
    pub license_url: Option<String>,
    pub framing: Option<LicenseFraming>,
    pub subtitle_url: Option<String>,
    pub drm: bool,
}

/// Outcome of manifest inspection for one title.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub height: u64,
    pub pssh: Option<String>,
    pub audio: String,
    /// Rewritten manifest under `tmp/`, when the adapter had to mutate it.
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub service: String,
    pub title: String,
    pub year: Option<i32>,
    pub kind: String,
    pub url: String,
}

/// Per-run shared state handed into every adapter call. No module-level
/// singletons: the HTTP client and scratch directory travel explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub http: reqwest::Client,
    pub tmp_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        user_agent: &str,
        proxy: Option<&str>,
        tmp_dir: PathBuf,
    ) -> ServiceResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_store(true)
            .timeout(HTTP_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            tmp_dir,
        })
    }
}

/// Capability set every service adapter implements.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Audio tag used for Dolby Digital tracks in filenames.
    fn dolby_tag(&self) -> &'static str {
        "DDP5.1"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind>;

    async fn get_series(&self, ctx: &RunContext, url: &str) -> ServiceResult<Series>;

    async fn get_movies(&self, _ctx: &RunContext, _url: &str) -> ServiceResult<MovieGroup> {
        Err(ServiceError::Unsupported {
            service: self.name(),
            operation: "movies",
        })
    }

    async fn get_episode_from_url(
        &self,
        ctx: &RunContext,
        url: &str,
    ) -> ServiceResult<(Episode, String)>;

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist>;

    async fn get_mediainfo(
        &self,
        ctx: &RunContext,
        playlist: &Playlist,
        quality: Option<u64>,
    ) -> ServiceResult<MediaInfo>;

    async fn search(
        &self,
        _ctx: &RunContext,
        _keywords: &str,
    ) -> ServiceResult<Vec<SearchHit>> {
        Err(ServiceError::Unsupported {
            service: self.name(),
            operation: "search",
        })
    }
}

/// Runs `op` over `items` with bounded concurrency, preserving input order.
pub(crate) async fn fan_out<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    op: F,
) -> ServiceResult<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ServiceResult<R>>,
{
    stream::iter(items.into_iter().map(op))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Shared DASH `get_mediainfo` path: fetch, enumerate the ladder, pick a
/// height, derive PSSH from the embedded box or the default KID.
pub(crate) async fn dash_mediainfo(
    ctx: &RunContext,
    playlist: &Playlist,
    quality: Option<u64>,
    dolby_tag: &str,
) -> ServiceResult<(dash::Mpd, MediaInfo)> {
    let text = ctx
        .http
        .get(&playlist.manifest_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let mpd = dash::parse(&text)?;
    let heights = mpd.video_heights();
    let height = manifest::choose_height(&heights, quality)
        .ok_or_else(|| ServiceError::ManifestMalformed("no video representations".to_string()))?;
    let pssh = mpd.widevine_pssh().or_else(|| {
        mpd.default_kid()
            .and_then(|kid| manifest::pssh::pssh_from_kid(&kid).ok())
    });
    let codecs = mpd.codecs();
    let audio = manifest::audio_label(codecs.iter().map(String::as_str), dolby_tag);
    let info = MediaInfo {
        height,
        pssh,
        audio,
        manifest_path: None,
    };
    Ok((mpd, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_preserves_input_order() {
        let items = vec![3u64, 1, 2];
        let results = fan_out(items, 2, |n| async move {
            tokio::time::sleep(Duration::from_millis(n * 5)).await;
            Ok::<_, ServiceError>(n * 10)
        })
        .await
        .unwrap();
        assert_eq!(results, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn fan_out_propagates_errors() {
        let result = fan_out(vec![1, 2], 2, |n| async move {
            if n == 2 {
                Err(ServiceError::NotFound("missing".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn fatal_errors_are_the_documented_subset() {
        assert!(ServiceError::BadUrl("x".into()).is_fatal());
        assert!(ServiceError::AuthExpired("x".into()).is_fatal());
        assert!(!ServiceError::NotFound("x".into()).is_fatal());
        assert!(!ServiceError::RegionLocked("x".into()).is_fatal());
        assert!(!ServiceError::RequiresSubscription("x".into()).is_fatal());
        assert!(!ServiceError::ManifestMalformed("x".into()).is_fatal());
    }
}
