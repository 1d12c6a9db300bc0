//! UKTV Play (uktvplay.co.uk). Brightcove-backed playback. The license
//! endpoint and its bearer arrive as one AES-CBC encrypted blob that decrypts
//! to a `license_api|bearer` pair. Feeds habitually label every episode 0,
//! and the top 1080p rung is hidden from the public manifest; both are
//! repaired here.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use crate::cdm::LicenseFraming;
use crate::manifest::dash;
use crate::service::{
    auth, dash_mediainfo, fan_out, ManifestKind, MediaInfo, Playlist, RunContext,
    ServiceAdapter, ServiceError, ServiceResult, UrlKind, FAN_OUT,
};
use crate::title::{normalize_episode_name, Episode, Series, Title};

const SCHEDULE_BASE: &str = "https://vschedules.uktv.co.uk/vod";
const PLAYBACK_BASE: &str = "https://edge.api.brightcove.com/playback/v1/accounts";
const ACCOUNT_ID: &str = "1242911124001";
const POLICY_KEY: &str = "BCpkADawqM3ic9SJTHNfLJXqJ9OqnGV7Xk0q";

// Fixed key/iv pair baked into the web player build.
const TOKEN_KEY: &[u8; 16] = b"ukTvPlAy2024keY!";
const TOKEN_IV: &[u8; 16] = b"uKtVwEbPlAyEriV!";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?uktvplay\.co\.uk/shows/([a-z0-9-]+)(?:/watch-online)?/?$")
            .expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(
            r"^https?://(?:www\.)?uktvplay\.co\.uk/shows/([a-z0-9-]+)/series-(\d+)/episode-(\d+)/?$",
        )
        .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
struct Brand {
    name: String,
    #[serde(default)]
    series: Vec<BrandSeries>,
}

#[derive(Debug, Deserialize)]
struct BrandSeries {
    id: String,
    #[serde(default)]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesPayload {
    #[serde(default)]
    episodes: Vec<EpisodeRow>,
}

#[derive(Debug, Deserialize)]
struct EpisodeRow {
    video_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    series_number: Option<String>,
    #[serde(default)]
    brand_name: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    synopsis: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserToken {
    token: String,
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
pub struct UktvPlayAdapter;

impl UktvPlayAdapter {
    pub fn new() -> Self {
        Self
    }

    fn episode_from(&self, fallback_title: &str, row: EpisodeRow) -> Episode {
        let show_title = row
            .brand_name
            .clone()
            .unwrap_or_else(|| fallback_title.to_string());
        let raw_name = row.name.clone().unwrap_or_default();
        Episode {
            id: row.video_id.clone(),
            service: "UKTV".to_string(),
            title: show_title.clone(),
            season: row
                .series_number
                .as_deref()
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            number: row.episode_number.unwrap_or(0),
            name: normalize_episode_name(&raw_name, &show_title),
            year: row.year,
            data: Some(json!(row.video_id)),
            drm: Some(true),
            description: row.synopsis,
            ..Episode::default()
        }
    }

    async fn brand(&self, ctx: &RunContext, slug: &str) -> ServiceResult<Brand> {
        let response = ctx
            .http
            .get(format!("{SCHEDULE_BASE}/brand/"))
            .query(&[("slug", slug)])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(slug.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn series_episodes(
        &self,
        ctx: &RunContext,
        brand_name: &str,
        series_id: &str,
    ) -> ServiceResult<Vec<Episode>> {
        let response = ctx
            .http
            .get(format!("{SCHEDULE_BASE}/series/"))
            .query(&[("id", series_id)])
            .send()
            .await?
            .error_for_status()?;
        let payload: SeriesPayload = response.json().await?;
        Ok(payload
            .episodes
            .into_iter()
            .map(|row| self.episode_from(brand_name, row))
            .collect())
    }

    /// Fetches and decrypts the playback token into license endpoint and
    /// bearer.
    async fn license_pair(&self, ctx: &RunContext) -> ServiceResult<(String, String)> {
        let response = ctx
            .http
            .get(format!("{SCHEDULE_BASE}/usertoken/"))
            .send()
            .await?
            .error_for_status()?;
        let payload: UserToken = response.json().await?;
        let decrypted = auth::decrypt_playback_token(TOKEN_KEY, TOKEN_IV, &payload.token)?;
        auth::split_token_pair(&decrypted)
    }
}

#[async_trait]
impl ServiceAdapter for UktvPlayAdapter {
    fn name(&self) -> &'static str {
        "uktvplay"
    }

    fn parse_url(&self, url: &str) -> ServiceResult<UrlKind> {
        if episode_re().is_match(url) {
            Ok(UrlKind::Episode)
        } else if catalog_re().is_match(url) {
            Ok(UrlKind::Catalog)
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
        let brand = self.brand(ctx, slug).await?;
        let brand_name = brand.name.clone();
        let series_ids: Vec<String> = brand.series.iter().map(|s| s.id.clone()).collect();

        let batches = fan_out(series_ids, FAN_OUT, |series_id| {
            let brand_name = brand_name.clone();
            async move { self.series_episodes(ctx, &brand_name, &series_id).await }
        })
        .await?;
        let mut series = Series::new(batches.into_iter().flatten().collect());
        // The schedule feed labels most archive content E00 across the
        // board; renumber ordinally when that happens.
        if series.iter().all(|episode| episode.number == 0) && !series.is_empty() {
            series.force_numbering();
        }
        Ok(series)
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
        let series_number: u32 = captures
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let episode_number: u32 = captures
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);

        let brand = self.brand(ctx, &slug).await?;
        let series_id = brand
            .series
            .iter()
            .find(|series| {
                series
                    .number
                    .as_deref()
                    .and_then(|value| value.parse::<u32>().ok())
                    == Some(series_number)
            })
            .map(|series| series.id.clone())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("{slug} series {series_number}"))
            })?;
        let episodes = self.series_episodes(ctx, &brand.name, &series_id).await?;
        let episode = episodes
            .into_iter()
            .find(|episode| episode.number == episode_number)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "{slug} series {series_number} episode {episode_number}"
                ))
            })?;
        Ok((episode, slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let video_id = title
            .data()
            .and_then(|value| value.as_str())
            .ok_or_else(|| ServiceError::Payload {
                service: "uktvplay",
                detail: "title is missing its brightcove id".to_string(),
            })?;
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
                    "UKTV Play is only available in the UK".to_string(),
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

        let (license_api, bearer) = self.license_pair(ctx).await?;
        Ok(Playlist {
            manifest_url: manifest_url.clone(),
            kind: ManifestKind::Dash,
            license_url: Some(license_api),
            framing: Some(LicenseFraming::JsonMessage {
                token: bearer,
                request_id: video_id.to_string(),
                manifest_url,
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
        let (mut mpd, info) = dash_mediainfo(ctx, playlist, quality, self.dolby_tag()).await?;
        let heights = mpd.video_heights();
        let top = heights.first().copied().unwrap_or(0);
        if top >= 720 && !heights.contains(&1080) {
            // The public manifest stops at 720p; the CDN serves a 1080p rung
            // at double the top advertised bandwidth.
            let donor_bandwidth = mpd
                .periods
                .iter()
                .flat_map(|p| p.adaptation_sets.iter())
                .flat_map(|set| set.representations.iter())
                .filter_map(|rep| rep.bandwidth)
                .max()
                .unwrap_or(0);
            mpd.inject_representation(1920, 1080, donor_bandwidth * 2)?;

            let rendered = dash::serialize(&mpd)?;
            let path = ctx.tmp_dir.join("manifest.mpd");
            fs::write(&path, rendered)
                .await
                .map_err(|source| ServiceError::Io {
                    path: path.clone(),
                    source,
                })?;

            let heights = mpd.video_heights();
            let height = crate::manifest::choose_height(&heights, quality)
                .unwrap_or(info.height);
            return Ok(MediaInfo {
                height,
                manifest_path: Some(path),
                ..info
            });
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = UktvPlayAdapter::new();
        assert_eq!(
            adapter
                .parse_url("https://uktvplay.co.uk/shows/taskmaster/watch-online")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://uktvplay.co.uk/shows/taskmaster/series-3/episode-2")
                .unwrap(),
            UrlKind::Episode
        );
        assert!(adapter
            .parse_url("https://uktvplay.co.uk/collections/comedy")
            .is_err());
    }

    #[test]
    fn all_zero_feeds_get_ordinal_numbers() {
        let adapter = UktvPlayAdapter::new();
        let rows = vec![
            EpisodeRow {
                video_id: "a".into(),
                name: Some("One".into()),
                episode_number: None,
                series_number: Some("1".into()),
                brand_name: Some("Taskmaster".into()),
                year: None,
                synopsis: None,
            },
            EpisodeRow {
                video_id: "b".into(),
                name: Some("Two".into()),
                episode_number: None,
                series_number: Some("1".into()),
                brand_name: Some("Taskmaster".into()),
                year: None,
                synopsis: None,
            },
        ];
        let episodes: Vec<Episode> = rows
            .into_iter()
            .map(|row| adapter.episode_from("Taskmaster", row))
            .collect();
        let mut series = Series::new(episodes);
        assert!(series.iter().all(|episode| episode.number == 0));
        series.force_numbering();
        let numbers: Vec<u32> = series.iter().map(|episode| episode.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }
}
