//! Pluto TV. A boot call issues the session token used for both the VOD
//! catalog and the stitcher; manifests come back pointing at a placeholder
//! origin that is swapped for the fixed CDN host before download. Most of
//! the library is served in the clear.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cdm::LicenseFraming;
use crate::manifest::{self, hls};
use crate::service::{
    ManifestKind, MediaInfo, Playlist, RunContext, SearchHit, ServiceAdapter, ServiceError,
    ServiceResult, UrlKind,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const BOOT_URL: &str = "https://boot.pluto.tv/v4/start";
const VOD_BASE: &str = "https://service-vod.clusters.pluto.tv/v4/vod";
const SEARCH_URL: &str = "https://service-media-search.clusters.pluto.tv/v1/search";
const LICENSE_URL: &str = "https://service-concierge.clusters.pluto.tv/v1/wv/alt";
const CDN_HOST: &str = "silo-hybrik.pluto.tv";

const APP_NAME: &str = "web";
const APP_VERSION: &str = "9.3.0";
const CLIENT_ID: &str = "fastget-3c6a3a3e-web";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();
static MOVIE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?pluto\.tv/(?:[a-z]{2}/)?on-demand/series/([^/]+)/?")
            .expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(
            r"^https?://(?:www\.)?pluto\.tv/(?:[a-z]{2}/)?on-demand/series/([^/]+)/season/(\d+)/episode/([^/]+)/?$",
        )
        .expect("valid regex")
    })
}

fn movie_re() -> &'static Regex {
    MOVIE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?pluto\.tv/(?:[a-z]{2}/)?on-demand/movies/([^/]+)/?$")
            .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootResponse {
    session_token: String,
    #[serde(default)]
    servers: BootServers,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootServers {
    #[serde(default)]
    stitcher: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VodItem {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    seasons: Vec<VodSeason>,
    #[serde(default)]
    stitched: Option<Stitched>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VodSeason {
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    episodes: Vec<VodEpisode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VodEpisode {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    season: Option<u32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    stitched: Option<Stitched>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stitched {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    paths: Vec<StitchedPath>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StitchedPath {
    path: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRow {
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    year: Option<i32>,
}

#[derive(Debug, Default)]
pub struct PlutoAdapter;

impl PlutoAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn boot(&self, ctx: &RunContext) -> ServiceResult<BootResponse> {
        let response = ctx
            .http
            .get(BOOT_URL)
            .query(&[
                ("appName", APP_NAME),
                ("appVersion", APP_VERSION),
                ("deviceType", "web"),
                ("deviceMake", "chrome"),
                ("deviceModel", "web"),
                ("clientID", CLIENT_ID),
                ("clientModelNumber", "1.0.0"),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn vod_item(&self, ctx: &RunContext, token: &str, slug: &str) -> ServiceResult<VodItem> {
        let response = ctx
            .http
            .get(format!("{VOD_BASE}/slugs/{slug}"))
            .bearer_auth(token)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(slug.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    fn stitched_manifest(
        &self,
        boot: &BootResponse,
        stitched: &Stitched,
        id: &str,
    ) -> ServiceResult<String> {
        let stitcher = boot
            .servers
            .stitcher
            .clone()
            .unwrap_or_else(|| "https://service-stitcher.clusters.pluto.tv".to_string());
        let path = stitched
            .path
            .clone()
            .or_else(|| stitched.paths.first().map(|p| p.path.clone()))
            .ok_or_else(|| ServiceError::Payload {
                service: "pluto",
                detail: format!("item {id} has no stitched path"),
            })?;
        let manifest = format!(
            "{}{}?jwt={}",
            stitcher.trim_end_matches('/'),
            path,
            boot.session_token
        );
        // Stitcher URLs point at a per-session origin; pin the fixed CDN
        // host so the downloader fetches segments directly.
        Ok(manifest::swap_host(&manifest, CDN_HOST)?)
    }

    fn episode_from(&self, show: &VodItem, season: &VodSeason, raw: VodEpisode) -> Episode {
        Episode {
            id: raw.id.clone(),
            service: "PLUTO".to_string(),
            title: show.name.clone(),
            season: raw.season.or(season.number).unwrap_or(0),
            number: raw.number.unwrap_or(0),
            name: normalize_episode_name(&raw.name, &show.name),
            year: show.year,
            data: raw
                .stitched
                .as_ref()
                .map(|stitched| serde_json::to_value(StitchedData::from(stitched)).unwrap_or_default()),
            drm: Some(false),
            description: raw.description,
            ..Episode::default()
        }
    }
}

/// Opaque playback payload stored on each title.
#[derive(Debug, Serialize, Deserialize)]
struct StitchedData {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
}

impl From<&Stitched> for StitchedData {
    fn from(stitched: &Stitched) -> Self {
        Self {
            path: stitched.path.clone(),
            paths: stitched.paths.iter().map(|p| p.path.clone()).collect(),
        }
    }
}

impl From<StitchedData> for Stitched {
    fn from(data: StitchedData) -> Self {
        Self {
            path: data.path,
            paths: data
                .paths
                .into_iter()
                .map(|path| StitchedPath { path })
                .collect(),
        }
    }
}

#[async_trait]
impl ServiceAdapter for PlutoAdapter {
    fn name(&self) -> &'static str {
        "pluto"
    }

    fn dolby_tag(&self) -> &'static str {
        "DD5.1"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
        } else if catalog_re().is_match(url) {
            Ok(UrlKind::Catalog)
        } else if movie_re().is_match(url) {
            Ok(UrlKind::Movie)
        } else {
            Err(ServiceError::BadUrl(url.to_string()))
        }
    }

    async fn get_series(&self, ctx: &RunContext, url: &str) -> ServiceResult<Series> {
        let slug = catalog_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let boot = self.boot(ctx).await?;
        let show = self.vod_item(ctx, &boot.session_token, slug).await?;
        let mut episodes = Vec::new();
        for season in &show.seasons {
            for raw in season.episodes.clone() {
                episodes.push(self.episode_from(&show, season, raw));
            }
        }
        Ok(Series::new(episodes))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let slug = movie_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let boot = self.boot(ctx).await?;
        let item = self.vod_item(ctx, &boot.session_token, slug).await?;
        Ok(MovieGroup::new(vec![Movie {
            id: item.id.clone(),
            service: "PLUTO".to_string(),
            title: item.name.clone(),
            year: item.year,
            data: item
                .stitched
                .as_ref()
                .map(|stitched| serde_json::to_value(StitchedData::from(stitched)).unwrap_or_default()),
            drm: Some(false),
            description: item.description,
            ..Movie::default()
        }]))
    }

    async fn get_episode_from_url(
        &self,
        ctx: &RunContext,
        url: &str,
    ) -> ServiceResult<(Episode, String)> {
        let captures = episode_re()
            .captures(url)
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?;
        let slug = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let episode_slug = captures.get(3).map(|m| m.as_str()).unwrap_or_default();

        let boot = self.boot(ctx).await?;
        let show = self.vod_item(ctx, &boot.session_token, &slug).await?;
        for season in &show.seasons {
            for raw in season.episodes.clone() {
                if raw.id == episode_slug
                    || raw.name.to_lowercase().replace(' ', "-") == episode_slug
                {
                    return Ok((self.episode_from(&show, season, raw), slug));
                }
            }
        }
        Err(ServiceError::NotFound(format!("{slug}/{episode_slug}")))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let data: StitchedData = title
            .data()
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| ServiceError::Payload {
                service: "pluto",
                detail: "title is missing its stitched paths".to_string(),
            })?;
        let boot = self.boot(ctx).await?;
        let manifest_url =
            self.stitched_manifest(&boot, &Stitched::from(data), title.id())?;
        Ok(Playlist {
            manifest_url,
            kind: ManifestKind::Hls,
            license_url: Some(LICENSE_URL.to_string()),
            framing: Some(LicenseFraming::Raw),
            subtitle_url: None,
            drm: false,
        })
    }

    async fn get_mediainfo(
        &self,
        ctx: &RunContext,
        playlist: &Playlist,
        quality: Option<u64>,
    ) -> ServiceResult<MediaInfo> {
        let text = ctx
            .http
            .get(&playlist.manifest_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let variants = hls::parse_master(&text)?;
        let heights = hls::heights(&variants);
        let height = manifest::choose_height(&heights, quality).ok_or_else(|| {
            ServiceError::ManifestMalformed("master playlist has no video variants".to_string())
        })?;
        let codecs: Vec<&str> = variants
            .iter()
            .filter_map(|variant| variant.codecs.as_deref())
            .collect();
        Ok(MediaInfo {
            height,
            pssh: None,
            audio: manifest::audio_label(codecs, self.dolby_tag()),
            manifest_path: None,
        })
    }

    async fn search(&self, ctx: &RunContext, keywords: &str) -> ServiceResult<Vec<SearchHit>> {
        let boot = self.boot(ctx).await?;
        let response = ctx
            .http
            .get(SEARCH_URL)
            .bearer_auth(&boot.session_token)
            .query(&[("q", keywords), ("limit", "20")])
            .send()
            .await?
            .error_for_status()?;
        let payload: SearchResponse = response.json().await?;
        Ok(payload
            .data
            .into_iter()
            .map(|row| {
                let kind = row.kind.unwrap_or_else(|| "series".to_string());
                let slug = row.slug.unwrap_or_default();
                let url = if kind == "movie" {
                    format!("https://pluto.tv/en/on-demand/movies/{slug}")
                } else {
                    format!("https://pluto.tv/en/on-demand/series/{slug}")
                };
                SearchHit {
                    service: "PLUTO".to_string(),
                    title: row.name,
                    year: row.year,
                    kind,
                    url,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = PlutoAdapter::new();
        assert_eq!(
            adapter
                .parse_url("https://pluto.tv/en/on-demand/series/dr-quinn/season/1")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://pluto.tv/en/on-demand/series/dr-quinn/season/1/episode/pilot-1")
                .unwrap(),
            UrlKind::Episode
        );
        assert_eq!(
            adapter
                .parse_url("https://pluto.tv/on-demand/movies/big-film-1993")
                .unwrap(),
            UrlKind::Movie
        );
        assert!(adapter.parse_url("https://pluto.tv/live-tv/cops").is_err());
    }

    #[test]
    fn stitched_manifest_is_pinned_to_cdn_host() {
        let adapter = PlutoAdapter::new();
        let boot = BootResponse {
            session_token: "jwt-token".to_string(),
            servers: BootServers {
                stitcher: Some("https://service-stitcher.clusters.pluto.tv".to_string()),
            },
        };
        let stitched = Stitched {
            path: Some("/v2/stitch/hls/episode/abc/master.m3u8".to_string()),
            paths: Vec::new(),
        };
        let manifest = adapter.stitched_manifest(&boot, &stitched, "abc").unwrap();
        assert!(manifest.starts_with("https://silo-hybrik.pluto.tv/v2/stitch/hls/episode/abc/"));
        assert!(manifest.ends_with("?jwt=jwt-token"));
    }

    #[test]
    fn vod_payload_maps_episodes() {
        let raw = r#"{
            "_id": "show1",
            "name": "Dr. Quinn",
            "type": "series",
            "year": 1993,
            "seasons": [
                {"number": 1, "episodes": [
                    {"_id": "e1", "name": "Pilot", "number": 1, "season": 1,
                     "stitched": {"path": "/stitch/hls/episode/e1/master.m3u8"}}
                ]}
            ]
        }"#;
        let item: VodItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.seasons.len(), 1);
        let adapter = PlutoAdapter::new();
        let episode = adapter.episode_from(
            &item,
            &item.seasons[0],
            item.seasons[0].episodes[0].clone(),
        );
        assert_eq!(episode.season, 1);
        assert_eq!(episode.number, 1);
        assert_eq!(episode.title, "Dr. Quinn");
        assert_eq!(episode.year, Some(1993));
        assert!(episode.data.is_some());
    }
}
