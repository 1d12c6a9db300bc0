//! STV Player (player.stv.tv). Brightcove playback with theplatform
//! entitlement: the Widevine challenge travels inside a `getWidevineLicense`
//! envelope, authorized by query token and account. Some programmes sit
//! behind the STV Player+ paywall.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::cdm::LicenseFraming;
use crate::service::{
    dash_mediainfo, ManifestKind, MediaInfo, Playlist, RunContext, ServiceAdapter, ServiceError,
    ServiceResult, UrlKind,
};
use crate::title::{normalize_episode_name, Episode, Series, Title};

const API_BASE: &str = "https://player.api.stv.tv/v1";
const PLAYBACK_BASE: &str = "https://edge.api.brightcove.com/playback/v1/accounts";
const ACCOUNT_ID: &str = "1486976045";
const POLICY_KEY: &str = "BCpkADawqM1WJ12abR6oLZkAmHkAnCqKRid2";
const LICENSE_URL: &str =
    "https://widevine.entitlement.theplatform.eu/wv/web/ModularDrm/getRawWidevineLicense";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://player\.stv\.tv/programmes/([a-z0-9-]+)/?$").expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(r"^https?://player\.stv\.tv/episode/([a-z0-9]+)(?:/[^/]*)?/?$")
            .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
struct ProgrammeEnvelope {
    results: Programme,
}

#[derive(Debug, Deserialize)]
struct Programme {
    name: String,
    guid: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpisodesEnvelope {
    #[serde(default)]
    results: Vec<EpisodeRow>,
}

#[derive(Debug, Deserialize)]
struct EpisodeRow {
    guid: String,
    title: String,
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    series: Option<SeriesRef>,
    #[serde(default)]
    programme: Option<ProgrammeRef>,
    #[serde(default)]
    video: Option<VideoRef>,
    #[serde(default)]
    subscription: bool,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesRef {
    #[serde(default)]
    number: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProgrammeRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VideoRef {
    id: String,
    #[serde(default)]
    release_pid: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrightcoveVideo {
    #[serde(default)]
    sources: Vec<BrightcoveSource>,
}

#[derive(Debug, Deserialize)]
struct BrightcoveSource {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    src: Option<String>,
}

#[derive(Debug, Default)]
pub struct StvAdapter;

impl StvAdapter {
    pub fn new() -> Self {
        Self
    }

    fn episode_from(&self, fallback_title: &str, row: EpisodeRow) -> Episode {
        let show_title = row
            .programme
            .as_ref()
            .map(|programme| programme.name.clone())
            .unwrap_or_else(|| fallback_title.to_string());
        let playback = row.video.as_ref().map(|video| {
            json!({
                "video_id": video.id,
                "release_pid": video.release_pid,
                "token": video.token,
                "subscription": row.subscription,
            })
        });
        Episode {
            id: row.guid.clone(),
            service: "STV".to_string(),
            title: show_title.clone(),
            season: row.series.as_ref().and_then(|series| series.number).unwrap_or(0),
            number: row.number.unwrap_or(0),
            name: normalize_episode_name(&row.title, &show_title),
            year: None,
            data: playback,
            drm: Some(true),
            description: row.summary,
            ..Episode::default()
        }
    }

    async fn episodes_for(&self, ctx: &RunContext, guid: &str) -> ServiceResult<Vec<EpisodeRow>> {
        let response = ctx
            .http
            .get(format!("{API_BASE}/episodes"))
            .query(&[("series.guid", guid), ("limit", "200")])
            .send()
            .await?
            .error_for_status()?;
        let envelope: EpisodesEnvelope = response.json().await?;
        Ok(envelope.results)
    }
}

#[async_trait]
impl ServiceAdapter for StvAdapter {
    fn name(&self) -> &'static str {
        "stv"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if catalog_re().is_match(url) {
            Ok(UrlKind::Catalog)
        } else if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
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
        let response = ctx
            .http
            .get(format!("{API_BASE}/programmes/{slug}"))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(slug.to_string()));
        }
        let envelope: ProgrammeEnvelope = response.error_for_status()?.json().await?;
        let programme = envelope.results;
        let rows = self.episodes_for(ctx, &programme.guid).await?;
        let episodes = rows
            .into_iter()
            .map(|row| self.episode_from(&programme.name, row))
            .collect();
        Ok(Series::new(episodes))
    }

    async fn get_episode_from_url(
        &self,
        ctx: &RunContext,
        url: &str,
    ) -> ServiceResult<(Episode, String)> {
        let guid = episode_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let response = ctx
            .http
            .get(format!("{API_BASE}/episodes/{guid}"))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(guid.to_string()));
        }
        let envelope: serde_json::Value = response.error_for_status()?.json().await?;
        let row: EpisodeRow = serde_json::from_value(
            envelope.get("results").cloned().unwrap_or(envelope),
        )
        .map_err(|err| ServiceError::Payload {
            service: "stv",
            detail: err.to_string(),
        })?;
        let slug = row
            .programme
            .as_ref()
            .map(|programme| programme.name.to_lowercase().replace(' ', "-"))
            .unwrap_or_default();
        Ok((self.episode_from("", row), slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let data = title.data().ok_or_else(|| ServiceError::Payload {
            service: "stv",
            detail: "title is missing playback data".to_string(),
        })?;
        if data
            .get("subscription")
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
        {
            return Err(ServiceError::RequiresSubscription(
                "this programme needs STV Player+".to_string(),
            ));
        }
        let video_id = data
            .get("video_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| ServiceError::Payload {
                service: "stv",
                detail: "playback data is missing the video id".to_string(),
            })?;
        let release_pid = data
            .get("release_pid")
            .and_then(|value| value.as_str())
            .unwrap_or(video_id)
            .to_string();
        let token = data
            .get("token")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();

        let response = ctx
            .http
            .get(format!("{PLAYBACK_BASE}/{ACCOUNT_ID}/videos/{video_id}"))
            .header("accept", format!("application/json;pk={POLICY_KEY}"))
            .send()
            .await?;
        match response.status().as_u16() {
            404 => return Err(ServiceError::NotFound(title.display_name())),
            403 => {
                return Err(ServiceError::RegionLocked(
                    "STV Player is only available in the UK".to_string(),
                ))
            }
            _ => {}
        }
        let video: BrightcoveVideo = response.error_for_status()?.json().await?;
        let manifest_url = video
            .sources
            .iter()
            .find(|source| {
                source.kind.as_deref() == Some("application/dash+xml") && source.src.is_some()
            })
            .and_then(|source| source.src.clone())
            .ok_or_else(|| {
                ServiceError::ManifestMalformed("brightcove response has no dash source".into())
            })?;

        Ok(Playlist {
            manifest_url,
            kind: ManifestKind::Dash,
            license_url: Some(LICENSE_URL.to_string()),
            framing: Some(LicenseFraming::GetWidevineLicense {
                release_pid,
                token,
                account: ACCOUNT_ID.to_string(),
            }),
            subtitle_url: None,
            drm: true,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = StvAdapter::new();
        assert_eq!(
            adapter
                .parse_url("https://player.stv.tv/programmes/rebus")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://player.stv.tv/episode/4fgh/rebus-episode-1")
                .unwrap(),
            UrlKind::Episode
        );
        assert!(adapter.parse_url("https://player.stv.tv/live").is_err());
    }

    #[test]
    fn subscription_rows_become_paywalled_payloads() {
        let raw = r#"{
            "guid": "4fgh",
            "title": "Episode 1",
            "number": 1,
            "series": {"number": 2},
            "programme": {"name": "Rebus"},
            "video": {"id": "777", "release_pid": "pid777", "token": "tok"},
            "subscription": true
        }"#;
        let row: EpisodeRow = serde_json::from_str(raw).unwrap();
        let adapter = StvAdapter::new();
        let episode = adapter.episode_from("", row);
        assert_eq!(episode.title, "Rebus");
        assert_eq!(episode.season, 2);
        assert_eq!(episode.name, "");
        assert_eq!(
            episode.data.as_ref().unwrap().get("subscription"),
            Some(&serde_json::Value::Bool(true))
        );
    }
}
