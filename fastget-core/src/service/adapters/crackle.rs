//! Crackle. Every call carries the static platform credentials; the license
//! server wants its token echoed back in a `customdata` header.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::cdm::LicenseFraming;
use crate::service::{
    dash_mediainfo, fan_out, ManifestKind, MediaInfo, Playlist, RunContext, SearchHit,
    ServiceAdapter, ServiceError, ServiceResult, UrlKind, FAN_OUT,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const API_BASE: &str = "https://prod-api.crackle.com";
const API_KEY: &str = "IB2xkaK6HTkjMLg3Pr37rGJvfZUeVKcN";
const PLATFORM: &str = "web";

static WATCH_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();

fn watch_re() -> &'static Regex {
    WATCH_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?crackle\.com/watch/([a-z0-9-]+)/?$").expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?crackle\.com/watch/([a-z0-9-]+)/([a-z0-9-]+)/?$")
            .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailsData {
    id: String,
    metadata: Metadata,
    #[serde(default)]
    season_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    title: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    release_year: Option<i32>,
    #[serde(default)]
    long_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpisodeRow {
    id: String,
    title: String,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    release_year: Option<i32>,
    #[serde(default)]
    series_title: Option<String>,
    #[serde(default)]
    long_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VodData {
    #[serde(default)]
    streams: Vec<Stream>,
    #[serde(default)]
    closed_captions: Vec<Caption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stream {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    drm: Option<StreamDrm>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamDrm {
    key_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Caption {
    url: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseToken {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    id: String,
    metadata: Metadata,
}

#[derive(Debug, Default)]
pub struct CrackleAdapter;

impl CrackleAdapter {
    pub fn new() -> Self {
        Self
    }

    fn request(&self, ctx: &RunContext, path: &str) -> reqwest::RequestBuilder {
        ctx.http
            .get(format!("{API_BASE}{path}"))
            .header("x-crackle-apiversion", "v2.0.0")
            .header("x-crackle-platform", PLATFORM)
            .header("x-crackle-apikey", API_KEY)
    }

    async fn details(&self, ctx: &RunContext, id: &str) -> ServiceResult<DetailsData> {
        let response = self
            .request(ctx, &format!("/contentdiscovery/views/details/{id}"))
            .send()
            .await?;
        match response.status().as_u16() {
            404 => return Err(ServiceError::NotFound(id.to_string())),
            403 | 451 => {
                return Err(ServiceError::RegionLocked(
                    "Crackle is only available in the US".to_string(),
                ))
            }
            _ => {}
        }
        let envelope: Envelope<DetailsData> = response.error_for_status()?.json().await?;
        Ok(envelope.data)
    }

    async fn season_episodes(
        &self,
        ctx: &RunContext,
        series_id: &str,
        season: u32,
        show_title: &str,
        year: Option<i32>,
    ) -> ServiceResult<Vec<Episode>> {
        let response = self
            .request(
                ctx,
                &format!("/contentdiscovery/series/{series_id}/episodes?seasonNumber={season}"),
            )
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope<Vec<EpisodeRow>> = response.json().await?;
        Ok(envelope
            .data
            .into_iter()
            .map(|row| Episode {
                id: row.id.clone(),
                service: "CRKL".to_string(),
                title: show_title.to_string(),
                season: row.season_number.unwrap_or(season),
                number: row.episode_number.unwrap_or(0),
                name: normalize_episode_name(&row.title, show_title),
                year: row.release_year.or(year),
                data: Some(json!(row.id)),
                drm: Some(true),
                description: row.long_description,
                ..Episode::default()
            })
            .collect())
    }
}

#[async_trait]
impl ServiceAdapter for CrackleAdapter {
    fn name(&self) -> &'static str {
        "crackle"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
        } else if watch_re().is_match(url) {
            Ok(UrlKind::Catalog)
        } else {
            Err(ServiceError::BadUrl(url.to_string()))
        }
    }

    async fn get_series(&self, ctx: &RunContext, url: &str) -> ServiceResult<Series> {
        let id = watch_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let details = self.details(ctx, id).await?;
        let seasons: Vec<u32> = (1..=details.season_count.unwrap_or(1)).collect();
        let show_title = details.metadata.title.clone();
        let year = details.metadata.release_year;
        let series_id = details.id.clone();

        let batches = fan_out(seasons, FAN_OUT, |season| {
            let show_title = show_title.clone();
            let series_id = series_id.clone();
            async move {
                self.season_episodes(ctx, &series_id, season, &show_title, year)
                    .await
            }
        })
        .await?;
        Ok(Series::new(batches.into_iter().flatten().collect()))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let id = watch_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let details = self.details(ctx, id).await?;
        if details.metadata.kind.as_deref() != Some("movie") {
            return Err(ServiceError::NotFound(format!("{id} is not a movie")));
        }
        Ok(MovieGroup::new(vec![Movie {
            id: details.id.clone(),
            service: "CRKL".to_string(),
            title: details.metadata.title,
            year: details.metadata.release_year,
            data: Some(json!(details.id)),
            drm: Some(true),
            description: details.metadata.long_description,
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
        let series_slug = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let episode_id = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let details = self.details(ctx, episode_id).await?;
        let episode = Episode {
            id: details.id.clone(),
            service: "CRKL".to_string(),
            title: details.metadata.title.clone(),
            season: 0,
            number: 0,
            name: String::new(),
            year: details.metadata.release_year,
            data: Some(json!(details.id)),
            drm: Some(true),
            description: details.metadata.long_description,
            ..Episode::default()
        };
        Ok((episode, series_slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let content_id = title
            .data()
            .and_then(|value| value.as_str())
            .ok_or_else(|| ServiceError::Payload {
                service: "crackle",
                detail: "title is missing its content id".to_string(),
            })?;
        let response = self
            .request(ctx, &format!("/playback/vod/{content_id}"))
            .send()
            .await?;
        match response.status().as_u16() {
            404 => return Err(ServiceError::NotFound(title.display_name())),
            403 | 451 => {
                return Err(ServiceError::RegionLocked(
                    "Crackle is only available in the US".to_string(),
                ))
            }
            _ => {}
        }
        let envelope: Envelope<VodData> = response.error_for_status()?.json().await?;
        let stream = envelope
            .data
            .streams
            .iter()
            .find(|stream| stream.kind == "dash-widevine")
            .or_else(|| envelope.data.streams.iter().find(|s| s.kind.starts_with("dash")))
            .ok_or_else(|| {
                ServiceError::ManifestMalformed("no dash stream in playback response".to_string())
            })?;

        let drm = stream.drm.is_some();
        let framing = if drm {
            let token_response = self
                .request(ctx, &format!("/license/token?contentId={content_id}"))
                .send()
                .await?
                .error_for_status()?;
            let envelope: Envelope<LicenseToken> = token_response.json().await?;
            Some(LicenseFraming::CustomData {
                value: envelope.data.token,
            })
        } else {
            None
        };
        Ok(Playlist {
            manifest_url: stream.url.clone(),
            kind: ManifestKind::Dash,
            license_url: stream.drm.as_ref().map(|drm| drm.key_url.clone()),
            framing,
            subtitle_url: envelope
                .data
                .closed_captions
                .iter()
                .find(|caption| {
                    caption
                        .language
                        .as_deref()
                        .map(|lang| lang.starts_with("en"))
                        .unwrap_or(true)
                })
                .map(|caption| caption.url.clone()),
            drm,
        })
    }

    async fn get_mediainfo(
        &self,
        ctx: &RunContext,
        playlist: &Playlist,
        quality: Option<u64>,
    ) -> ServiceResult<MediaInfo> {
        let (_, info) = dash_mediainfo(ctx, playlist, quality, self.dolby_tag()).await?;
        Ok(info)
    }

    async fn search(&self, ctx: &RunContext, keywords: &str) -> ServiceResult<Vec<SearchHit>> {
        let response = self
            .request(ctx, &format!("/contentdiscovery/search?query={keywords}"))
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope<SearchData> = response.json().await?;
        Ok(envelope
            .data
            .items
            .into_iter()
            .map(|item| SearchHit {
                service: "CRKL".to_string(),
                title: item.metadata.title,
                year: item.metadata.release_year,
                kind: item.metadata.kind.unwrap_or_else(|| "series".to_string()),
                url: format!("https://www.crackle.com/watch/{}", item.id),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = CrackleAdapter::new();
        assert_eq!(
            adapter.parse_url("https://www.crackle.com/watch/abc123").unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://www.crackle.com/watch/abc123/ep456")
                .unwrap(),
            UrlKind::Episode
        );
        assert!(adapter.parse_url("https://www.crackle.com/shows").is_err());
    }

    #[test]
    fn playback_payload_prefers_widevine_stream() {
        let raw = r#"{
            "data": {
                "streams": [
                    {"type": "hls", "url": "https://cdn.crackle.com/x.m3u8"},
                    {"type": "dash-widevine", "url": "https://cdn.crackle.com/x.mpd",
                     "drm": {"keyUrl": "https://lic.crackle.com/wv"}}
                ],
                "closedCaptions": [{"url": "https://cdn.crackle.com/x.vtt", "language": "en"}]
            }
        }"#;
        let envelope: Envelope<VodData> = serde_json::from_str(raw).unwrap();
        let widevine = envelope
            .data
            .streams
            .iter()
            .find(|stream| stream.kind == "dash-widevine")
            .unwrap();
        assert!(widevine.drm.is_some());
    }
}
