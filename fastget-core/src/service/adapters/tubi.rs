//! Tubi (tubitv.com). Authentication rides on the `refresh_token` cookie
//! from an exported Netscape jar, exchanged for a short-lived access token.
//! Streams are HLS; the Widevine PSSH is not in the playlist and has to be
//! dug out of the first initialization segment.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cdm::LicenseFraming;
use crate::manifest::{self, hls, pssh};
use crate::service::{
    auth, fan_out, ManifestKind, MediaInfo, Playlist, RunContext, SearchHit, ServiceAdapter,
    ServiceError, ServiceResult, UrlKind, FAN_OUT,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const REFRESH_URL: &str = "https://account.tubitv.com/api/v2/refresh_token";
const CONTENT_URL: &str = "https://tubitv.com/oz/videos";
const SEARCH_URL: &str = "https://tubitv.com/oz/search";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();
static MOVIE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?tubitv\.com/series/(\d+)(?:/[^/]*)?/?$")
            .expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?tubitv\.com/tv-shows/(\d+)(?:/[^/]*)?/?$")
            .expect("valid regex")
    })
}

fn movie_re() -> &'static Regex {
    MOVIE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?tubitv\.com/movies/(\d+)(?:/[^/]*)?/?$")
            .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    title: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    series_title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    children: Vec<ContentChild>,
    #[serde(default)]
    video_resources: Vec<VideoResource>,
    #[serde(default)]
    subtitles: Vec<Subtitle>,
}

#[derive(Debug, Deserialize)]
struct ContentChild {
    id: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    children: Vec<ContentChild>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VideoResource {
    #[serde(rename = "type")]
    kind: String,
    manifest: ResourceManifest,
    #[serde(default)]
    license_server: Option<LicenseServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceManifest {
    url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LicenseServer {
    url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Subtitle {
    url: String,
    #[serde(default)]
    lang: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaybackData {
    video_resources: Vec<VideoResource>,
    #[serde(default)]
    subtitles: Vec<Subtitle>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchRow>,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    id: String,
    title: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    year: Option<i32>,
}

pub struct TubiAdapter {
    cookies_path: PathBuf,
}

impl TubiAdapter {
    pub fn new(cookies_path: PathBuf) -> Self {
        Self { cookies_path }
    }

    async fn bearer(&self, ctx: &RunContext) -> ServiceResult<String> {
        let refresh = auth::refresh_token_from_jar(&self.cookies_path, "refresh_token", Utc::now())?;
        let response = ctx
            .http
            .post(REFRESH_URL)
            .json(&json!({"refresh_token": refresh}))
            .send()
            .await?;
        if response.status().as_u16() == 401 {
            return Err(ServiceError::AuthExpired(
                "tubi rejected the refresh token, export a fresh cookie jar".to_string(),
            ));
        }
        let payload: RefreshResponse = response.error_for_status()?.json().await?;
        Ok(payload.access_token)
    }

    async fn content(
        &self,
        ctx: &RunContext,
        token: &str,
        id: &str,
        with_resources: bool,
    ) -> ServiceResult<ContentItem> {
        let mut request = ctx
            .http
            .get(format!("{CONTENT_URL}/{id}/content"))
            .bearer_auth(token);
        if with_resources {
            request = request.query(&[
                ("video_resources[]", "hlsv6_widevine"),
                ("video_resources[]", "hlsv6"),
            ]);
        }
        let response = request.send().await?;
        match response.status().as_u16() {
            404 => return Err(ServiceError::NotFound(id.to_string())),
            451 => {
                return Err(ServiceError::RegionLocked(
                    "this title is not available in your country".to_string(),
                ))
            }
            _ => {}
        }
        Ok(response.error_for_status()?.json().await?)
    }

    fn episode_from(&self, show_title: &str, year: Option<i32>, item: ContentItem) -> Episode {
        let playback = PlaybackData {
            video_resources: item.video_resources,
            subtitles: item.subtitles,
        };
        let subtitle_url = playback.subtitles.first().map(|sub| sub.url.clone());
        let drm = playback
            .video_resources
            .iter()
            .any(|resource| resource.kind.contains("widevine"));
        Episode {
            id: item.id.clone(),
            service: "TUBI".to_string(),
            title: show_title.to_string(),
            season: item.season_number.unwrap_or(0),
            number: item.episode_number.unwrap_or(0),
            name: normalize_episode_name(&strip_ordinal_prefix(&item.title), show_title),
            year: item.year.or(year),
            data: serde_json::to_value(&playback).ok(),
            subtitle_url,
            drm: Some(drm),
            description: item.description,
            ..Episode::default()
        }
    }
}

/// Tubi titles episodes as `S01:E01 - Name`; keep only the name.
fn strip_ordinal_prefix(title: &str) -> String {
    match title.split_once(" - ") {
        Some((prefix, rest))
            if prefix.starts_with('S') && prefix.contains(":E") && !rest.is_empty() =>
        {
            rest.to_string()
        }
        _ => title.to_string(),
    }
}

#[async_trait]
impl ServiceAdapter for TubiAdapter {
    fn name(&self) -> &'static str {
        "tubi"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if catalog_re().is_match(url) {
            Ok(UrlKind::Catalog)
        } else if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
        } else if movie_re().is_match(url) {
            Ok(UrlKind::Movie)
        } else {
            Err(ServiceError::BadUrl(url.to_string()))
        }
    }

    async fn get_series(&self, ctx: &RunContext, url: &str) -> ServiceResult<Series> {
        let series_id = catalog_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let token = self.bearer(ctx).await?;
        let show = self.content(ctx, &token, series_id, false).await?;

        // Seasons only list episode ids; fetch per-episode metadata with a
        // bounded fan-out across the flat id list.
        let mut episode_ids: Vec<(u32, String)> = Vec::new();
        for season in &show.children {
            let season_number = season.season_number.unwrap_or(0);
            for child in &season.children {
                if child.kind.as_deref() != Some("season") {
                    episode_ids.push((season_number, child.id.clone()));
                }
            }
        }

        let show_title = show.title.clone();
        let year = show.year;
        let token_ref = &token;
        let episodes = fan_out(episode_ids, FAN_OUT, |(season_number, id)| {
            let show_title = show_title.clone();
            async move {
                let mut item = self.content(ctx, token_ref, &id, true).await?;
                if item.season_number.is_none() {
                    item.season_number = Some(season_number);
                }
                Ok(self.episode_from(&show_title, year, item))
            }
        })
        .await?;
        Ok(Series::new(episodes))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let movie_id = movie_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let token = self.bearer(ctx).await?;
        let item = self.content(ctx, &token, movie_id, true).await?;
        let playback = PlaybackData {
            video_resources: item.video_resources,
            subtitles: item.subtitles,
        };
        let drm = playback
            .video_resources
            .iter()
            .any(|resource| resource.kind.contains("widevine"));
        Ok(MovieGroup::new(vec![Movie {
            id: item.id,
            service: "TUBI".to_string(),
            title: item.title,
            year: item.year,
            data: serde_json::to_value(&playback).ok(),
            subtitle_url: playback.subtitles.first().map(|sub| sub.url.clone()),
            drm: Some(drm),
            description: item.description,
            ..Movie::default()
        }]))
    }

    async fn get_episode_from_url(
        &self,
        ctx: &RunContext,
        url: &str,
    ) -> ServiceResult<(Episode, String)> {
        let episode_id = episode_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let token = self.bearer(ctx).await?;
        let item = self.content(ctx, &token, episode_id, true).await?;
        let show_title = item
            .series_title
            .clone()
            .unwrap_or_else(|| item.title.clone());
        let slug = show_title.to_lowercase().replace(' ', "-");
        Ok((self.episode_from(&show_title, item.year, item), slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let playback: PlaybackData = title
            .data()
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| ServiceError::Payload {
                service: "tubi",
                detail: "title is missing video resources".to_string(),
            })?;
        let resource = playback
            .video_resources
            .iter()
            .find(|resource| resource.kind.contains("widevine"))
            .or_else(|| playback.video_resources.first())
            .ok_or_else(|| ServiceError::NotFound(title.display_name()))?;

        let drm = resource.kind.contains("widevine");
        let framing = if drm {
            let token = self.bearer(ctx).await?;
            Some(LicenseFraming::JsonMessage {
                token,
                request_id: title.id().to_string(),
                manifest_url: resource.manifest.url.clone(),
            })
        } else {
            None
        };
        Ok(Playlist {
            manifest_url: resource.manifest.url.clone(),
            kind: ManifestKind::Hls,
            license_url: resource.license_server.as_ref().map(|ls| ls.url.clone()),
            framing,
            subtitle_url: playback.subtitles.first().map(|sub| sub.url.clone()),
            drm,
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

        let pssh = if playlist.drm {
            let variant = hls::variant_for_height(&variants, height)
                .ok_or_else(|| ServiceError::ManifestMalformed("no variant for height".into()))?;
            self.init_segment_pssh(ctx, &playlist.manifest_url, &variant.uri)
                .await?
        } else {
            None
        };

        let codecs: Vec<&str> = variants
            .iter()
            .filter_map(|variant| variant.codecs.as_deref())
            .collect();
        Ok(MediaInfo {
            height,
            pssh,
            audio: manifest::audio_label(codecs, self.dolby_tag()),
            manifest_path: None,
        })
    }

    async fn search(&self, ctx: &RunContext, keywords: &str) -> ServiceResult<Vec<SearchHit>> {
        let token = self.bearer(ctx).await?;
        let response = ctx
            .http
            .get(SEARCH_URL)
            .bearer_auth(&token)
            .query(&[("search", keywords)])
            .send()
            .await?
            .error_for_status()?;
        let payload: SearchResponse = response.json().await?;
        Ok(payload
            .results
            .into_iter()
            .map(|row| {
                let kind = row.kind.unwrap_or_else(|| "series".to_string());
                let url = if kind == "movie" {
                    format!("https://tubitv.com/movies/{}", row.id)
                } else {
                    format!("https://tubitv.com/series/{}", row.id)
                };
                SearchHit {
                    service: "TUBI".to_string(),
                    title: row.title,
                    year: row.year,
                    kind,
                    url,
                }
            })
            .collect())
    }
}

impl TubiAdapter {
    /// Fetches the chosen variant's first init segment (range 0-9999) and
    /// scans it for the Widevine PSSH box.
    async fn init_segment_pssh(
        &self,
        ctx: &RunContext,
        master_url: &str,
        variant_uri: &str,
    ) -> ServiceResult<Option<String>> {
        let base = url::Url::parse(master_url)
            .map_err(|err| ServiceError::ManifestMalformed(err.to_string()))?;
        let variant_url = base
            .join(variant_uri)
            .map_err(|err| ServiceError::ManifestMalformed(err.to_string()))?;
        let media_text = ctx
            .http
            .get(variant_url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let map_uri = match m3u8_rs::parse_playlist_res(media_text.as_bytes()) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => media
                .segments
                .iter()
                .find_map(|segment| segment.map.as_ref().map(|map| map.uri.clone())),
            _ => None,
        };
        let map_uri = match map_uri {
            Some(uri) => uri,
            None => return Ok(None),
        };
        let init_url = variant_url
            .join(&map_uri)
            .map_err(|err| ServiceError::ManifestMalformed(err.to_string()))?;
        let bytes = ctx
            .http
            .get(init_url)
            .header("range", "bytes=0-9999")
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(pssh::pssh_from_init(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = TubiAdapter::new(PathBuf::from("cookies.txt"));
        assert_eq!(
            adapter
                .parse_url("https://tubitv.com/series/300001936/gotham")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://tubitv.com/tv-shows/545997/s01-e01-pilot")
                .unwrap(),
            UrlKind::Episode
        );
        assert_eq!(
            adapter.parse_url("https://tubitv.com/movies/621439/heat").unwrap(),
            UrlKind::Movie
        );
        assert!(adapter.parse_url("https://tubitv.com/live/news").is_err());
        assert!(adapter
            .parse_url("https://tubitv.com/series/not-a-number")
            .is_err());
    }

    #[test]
    fn ordinal_prefix_is_stripped() {
        assert_eq!(strip_ordinal_prefix("S01:E03 - The Fix"), "The Fix");
        assert_eq!(strip_ordinal_prefix("Plain Name"), "Plain Name");
    }

    #[test]
    fn episode_mapping_marks_widevine_resources() {
        let raw = r#"{
            "id": "545997",
            "title": "S01:E01 - Pilot",
            "type": "episode",
            "episode_number": 1,
            "season_number": 1,
            "video_resources": [
                {"type": "hlsv6_widevine", "manifest": {"url": "https://c.tubi.video/m.m3u8"},
                 "license_server": {"url": "https://l.tubi.video/wv"}}
            ],
            "subtitles": [{"url": "https://s.tubi.video/en.vtt", "lang": "en"}]
        }"#;
        let item: ContentItem = serde_json::from_str(raw).unwrap();
        let adapter = TubiAdapter::new(PathBuf::from("cookies.txt"));
        let episode = adapter.episode_from("Gotham", Some(2014), item);
        assert_eq!(episode.name, "Pilot");
        assert_eq!(episode.drm, Some(true));
        assert_eq!(
            episode.subtitle_url.as_deref(),
            Some("https://s.tubi.video/en.vtt")
        );
        let playback: PlaybackData =
            serde_json::from_value(episode.data.unwrap()).unwrap();
        assert_eq!(playback.video_resources[0].kind, "hlsv6_widevine");
    }
}
