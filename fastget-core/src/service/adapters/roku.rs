//! The Roku Channel. Playback descriptors carry a DASH manifest plus a
//! short-lived `x-dt-auth-token` for the license server. Subtitles arrive as
//! a bare VTT URL and are grafted onto the manifest as a text AdaptationSet.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use crate::cdm::LicenseFraming;
use crate::manifest::dash;
use crate::service::{
    dash_mediainfo, ManifestKind, MediaInfo, Playlist, RunContext, SearchHit, ServiceAdapter,
    ServiceError, ServiceResult, UrlKind,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const CONTENT_BASE: &str = "https://content.sr.roku.com/content/v1/roku-trc";
const PLAYBACK_URL: &str = "https://therokuchannel.roku.com/api/v3/playback";
const SEARCH_API: &str = "https://therokuchannel.roku.com/api/v1/search";

static DETAILS_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();

fn details_re() -> &'static Regex {
    DETAILS_RE.get_or_init(|| {
        Regex::new(r"^https?://therokuchannel\.roku\.com/details/([0-9a-f]+)(?:/[^/]*)?/?$")
            .expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(
            r"^https?://therokuchannel\.roku\.com/details/([0-9a-f]+)/[^/]+/episode/([0-9a-f]+)/?$",
        )
        .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentNode {
    meta: ContentMeta,
    title: String,
    #[serde(default)]
    release_year: Option<i32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    episode_number: Option<String>,
    #[serde(default)]
    season_number: Option<String>,
    #[serde(default)]
    series: Option<SeriesRef>,
    #[serde(default)]
    seasons: Option<Collection<SeasonNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentMeta {
    id: String,
    #[serde(default)]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesRef {
    title: String,
    #[serde(default)]
    release_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeasonNode {
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    episodes: Option<Collection<ContentNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackResponse {
    url: String,
    #[serde(default)]
    drm_params: Option<DrmParams>,
    #[serde(default)]
    captions: Vec<Caption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrmParams {
    license_server_url: String,
    auth_token: String,
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
struct SearchResponse {
    #[serde(default)]
    view: Vec<SearchView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchView {
    content: SearchContent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchContent {
    meta: ContentMeta,
    title: String,
    #[serde(default)]
    release_year: Option<i32>,
}

#[derive(Debug, Default)]
pub struct RokuAdapter;

impl RokuAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn content(&self, ctx: &RunContext, id: &str) -> ServiceResult<ContentNode> {
        let expand = "seasons.episodes,series";
        let response = ctx
            .http
            .get(format!("{CONTENT_BASE}/{id}"))
            .query(&[("expand", expand)])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    fn episode_from(&self, show_title: &str, year: Option<i32>, node: ContentNode) -> Episode {
        let season = node
            .season_number
            .as_deref()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let number = node
            .episode_number
            .as_deref()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        Episode {
            id: node.meta.id.clone(),
            service: "ROKU".to_string(),
            title: show_title.to_string(),
            season,
            number,
            name: normalize_episode_name(&node.title, show_title),
            year: node.release_year.or(year),
            data: Some(json!(node.meta.id)),
            drm: Some(true),
            description: node.description,
            ..Episode::default()
        }
    }
}

#[async_trait]
impl ServiceAdapter for RokuAdapter {
    fn name(&self) -> &'static str {
        "roku"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
        } else if details_re().is_match(url) {
            Ok(UrlKind::Catalog)
        } else {
            Err(ServiceError::BadUrl(url.to_string()))
        }
    }

    async fn get_series(&self, ctx: &RunContext, url: &str) -> ServiceResult<Series> {
        let id = details_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let show = self.content(ctx, id).await?;
        let show_title = show.title.clone();
        let year = show.release_year;
        let mut episodes = Vec::new();
        if let Some(seasons) = show.seasons {
            for season in seasons.data {
                let season_number = season.season_number;
                if let Some(list) = season.episodes {
                    for mut node in list.data {
                        if node.season_number.is_none() {
                            node.season_number = season_number.map(|n| n.to_string());
                        }
                        episodes.push(self.episode_from(&show_title, year, node));
                    }
                }
            }
        }
        Ok(Series::new(episodes))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let id = details_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let node = self.content(ctx, id).await?;
        if node.meta.media_type.as_deref() != Some("movie") {
            return Err(ServiceError::NotFound(format!("{id} is not a movie")));
        }
        Ok(MovieGroup::new(vec![Movie {
            id: node.meta.id.clone(),
            service: "ROKU".to_string(),
            title: node.title,
            year: node.release_year,
            data: Some(json!(node.meta.id)),
            drm: Some(true),
            description: node.description,
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
        let episode_id = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let node = self.content(ctx, episode_id).await?;
        let (show_title, year) = match &node.series {
            Some(series) => (series.title.clone(), series.release_year),
            None => (node.title.clone(), node.release_year),
        };
        let slug = show_title.to_lowercase().replace(' ', "-");
        Ok((self.episode_from(&show_title, year, node), slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let roku_id = title
            .data()
            .and_then(|value| value.as_str())
            .ok_or_else(|| ServiceError::Payload {
                service: "roku",
                detail: "title is missing its roku id".to_string(),
            })?;
        let response = ctx
            .http
            .post(PLAYBACK_URL)
            .json(&json!({
                "rokuId": roku_id,
                "mediaFormat": "mpeg-dash",
                "drmType": "widevine",
                "quality": "fhd",
                "providerId": "rokuavod",
            }))
            .send()
            .await?;
        match response.status().as_u16() {
            403 => {
                return Err(ServiceError::RegionLocked(
                    "The Roku Channel is only available in the US".to_string(),
                ))
            }
            404 => return Err(ServiceError::NotFound(title.display_name())),
            _ => {}
        }
        let playback: PlaybackResponse = response.error_for_status()?.json().await?;
        let (license_url, framing, drm) = match playback.drm_params {
            Some(params) => (
                Some(params.license_server_url),
                Some(LicenseFraming::AuthTokenHeader {
                    token: params.auth_token,
                }),
                true,
            ),
            None => (None, None, false),
        };
        let subtitle_url = playback
            .captions
            .iter()
            .find(|caption| {
                caption
                    .language
                    .as_deref()
                    .map(|lang| lang.starts_with("en"))
                    .unwrap_or(true)
            })
            .map(|caption| caption.url.clone());
        Ok(Playlist {
            manifest_url: playback.url,
            kind: ManifestKind::Dash,
            license_url,
            framing,
            subtitle_url,
            drm,
        })
    }

    async fn get_mediainfo(
        &self,
        ctx: &RunContext,
        playlist: &Playlist,
        quality: Option<u64>,
    ) -> ServiceResult<MediaInfo> {
        let (mut mpd, mut info) =
            dash_mediainfo(ctx, playlist, quality, self.dolby_tag()).await?;
        if let Some(vtt_url) = &playlist.subtitle_url {
            mpd.add_subtitle_adaptation(vtt_url)?;
            let rendered = dash::serialize(&mpd)?;
            let path = ctx.tmp_dir.join("manifest.mpd");
            fs::write(&path, rendered)
                .await
                .map_err(|source| ServiceError::Io {
                    path: path.clone(),
                    source,
                })?;
            info.manifest_path = Some(path);
        }
        Ok(info)
    }

    async fn search(&self, ctx: &RunContext, keywords: &str) -> ServiceResult<Vec<SearchHit>> {
        let response = ctx
            .http
            .post(SEARCH_API)
            .json(&json!({"query": keywords}))
            .send()
            .await?
            .error_for_status()?;
        let payload: SearchResponse = response.json().await?;
        Ok(payload
            .view
            .into_iter()
            .map(|view| SearchHit {
                service: "ROKU".to_string(),
                title: view.content.title,
                year: view.content.release_year,
                kind: view
                    .content
                    .meta
                    .media_type
                    .unwrap_or_else(|| "series".to_string()),
                url: format!(
                    "https://therokuchannel.roku.com/details/{}/title",
                    view.content.meta.id
                ),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = RokuAdapter::new();
        assert_eq!(
            adapter
                .parse_url("https://therokuchannel.roku.com/details/2c8f05a9e36e5d4fa5aab0b7b1a5b4a1/weird-science")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://therokuchannel.roku.com/details/2c8f05a9e36e5d4f/weird-science/episode/0a1b2c3d4e5f6071")
                .unwrap(),
            UrlKind::Episode
        );
        assert!(adapter
            .parse_url("https://therokuchannel.roku.com/browse")
            .is_err());
    }

    #[test]
    fn playback_payload_maps_drm_and_captions() {
        let raw = r#"{
            "url": "https://vod.delivery.roku.com/abc/main.mpd",
            "drmParams": {
                "licenseServerUrl": "https://wv.license.roku.com/license",
                "authToken": "tok-123"
            },
            "captions": [
                {"url": "https://vod.delivery.roku.com/abc/en.vtt", "language": "en-US"}
            ]
        }"#;
        let playback: PlaybackResponse = serde_json::from_str(raw).unwrap();
        assert!(playback.drm_params.is_some());
        assert_eq!(playback.captions.len(), 1);
    }

    #[test]
    fn episode_numbers_parse_from_strings() {
        let raw = r#"{
            "meta": {"id": "0a1b", "mediaType": "episode"},
            "title": "The Fix",
            "episodeNumber": "3",
            "seasonNumber": "1"
        }"#;
        let node: ContentNode = serde_json::from_str(raw).unwrap();
        let adapter = RokuAdapter::new();
        let episode = adapter.episode_from("Show", None, node);
        assert_eq!(episode.season, 1);
        assert_eq!(episode.number, 3);
        assert_eq!(episode.name, "The Fix");
    }
}
