//! CBC Gem (gem.cbc.ca). Sign-in is a password flow: credentials from
//! `profile.yaml` buy a login artifact, the artifact buys a short-lived
//! claims token, and the token is cached back into the profile with its
//! expiry. Playback validation yields a DASH manifest; the license endpoint
//! takes the raw challenge with the claims token in the query.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::cdm::LicenseFraming;
use crate::service::{
    auth, dash_mediainfo, fan_out, ManifestKind, MediaInfo, Playlist, RunContext, SearchHit,
    ServiceAdapter, ServiceError, ServiceResult, UrlKind, FAN_OUT,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const LOGIN_URL: &str = "https://api.loginradius.com/identity/v2/auth/login";
const LOGIN_API_KEY: &str = "3f4beddd-2061-49b0-ae80-6f1f2ed65b37";
const CLAIMS_URL: &str = "https://services.radio-canada.ca/ott/subscription/v2/gem/token";
const CATALOG_BASE: &str = "https://services.radio-canada.ca/ott/catalog/v2/gem";
const VALIDATION_URL: &str = "https://services.radio-canada.ca/media/validation/v2/";
const LICENSE_BASE: &str = "https://services.radio-canada.ca/media/drm/v1/widevine/getlicense";
const SEARCH_URL: &str = "https://services.radio-canada.ca/ott/catalog/v1/gem/search";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://gem\.cbc\.ca/(?:media/)?([a-z0-9-]+)/?$").expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(r"^https?://gem\.cbc\.ca/(?:media/)?([a-z0-9-]+)/s(\d+)e(\d+)/?$")
            .expect("valid regex")
    })
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimsResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Show {
    title: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    first_air_year: Option<i32>,
    #[serde(default)]
    seasons: Vec<ShowSeason>,
    #[serde(default)]
    id_media: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShowSeason {
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeasonLineup {
    #[serde(default)]
    items: Vec<LineupItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineupItem {
    id_media: i64,
    title: String,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Validation {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchEnvelope {
    #[serde(default)]
    result: Vec<SearchRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRow {
    title: String,
    url: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

pub struct GemAdapter {
    profile_path: PathBuf,
}

impl GemAdapter {
    pub fn new(profile_path: PathBuf) -> Self {
        Self { profile_path }
    }

    /// Cached claims token, or a fresh password-flow exchange.
    async fn claims_token(&self, ctx: &RunContext) -> ServiceResult<String> {
        if let Some(token) = auth::cached_bearer(&self.profile_path, Utc::now()) {
            return Ok(token);
        }
        let (username, password) =
            auth::stored_credentials(&self.profile_path).ok_or_else(|| {
                ServiceError::AuthExpired(
                    "no stored CBC Gem credentials; run `profile --service gem` first"
                        .to_string(),
                )
            })?;

        let response = ctx
            .http
            .post(LOGIN_URL)
            .query(&[("apikey", LOGIN_API_KEY)])
            .json(&json!({"email": username, "password": password}))
            .send()
            .await?;
        if response.status().as_u16() == 401 {
            return Err(ServiceError::AuthExpired(
                "CBC Gem rejected the stored credentials".to_string(),
            ));
        }
        let login: LoginResponse = response.error_for_status()?.json().await?;

        let response = ctx
            .http
            .get(CLAIMS_URL)
            .header("ott-access-token", login.access_token)
            .send()
            .await?
            .error_for_status()?;
        let claims: ClaimsResponse = response.json().await?;
        auth::store_bearer(
            &self.profile_path,
            &claims.access_token,
            claims.expires_in.unwrap_or(3600),
            None,
        );
        Ok(claims.access_token)
    }

    async fn show(&self, ctx: &RunContext, slug: &str) -> ServiceResult<Show> {
        let response = ctx
            .http
            .get(format!("{CATALOG_BASE}/show/{slug}"))
            .query(&[("device", "web")])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::NotFound(slug.to_string()));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn season_lineup(
        &self,
        ctx: &RunContext,
        show_title: &str,
        year: Option<i32>,
        season: ShowSeason,
    ) -> ServiceResult<Vec<Episode>> {
        let url = season.url.ok_or_else(|| ServiceError::Payload {
            service: "gem",
            detail: "season without a lineup url".to_string(),
        })?;
        let response = ctx
            .http
            .get(&url)
            .query(&[("device", "web")])
            .send()
            .await?
            .error_for_status()?;
        let lineup: SeasonLineup = response.json().await?;
        Ok(lineup
            .items
            .into_iter()
            .map(|item| Episode {
                id: item.id_media.to_string(),
                service: "GEM".to_string(),
                title: show_title.to_string(),
                season: item.season_number.or(season.season_number).unwrap_or(0),
                number: item.episode_number.unwrap_or(0),
                name: normalize_episode_name(&item.title, show_title),
                year,
                data: Some(json!(item.id_media)),
                drm: Some(true),
                description: item.description,
                ..Episode::default()
            })
            .collect())
    }
}

#[async_trait]
impl ServiceAdapter for GemAdapter {
    fn name(&self) -> &'static str {
        "gem"
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
        let show = self.show(ctx, slug).await?;
        let show_title = show.title.clone();
        let year = show.first_air_year;

        let batches = fan_out(show.seasons, FAN_OUT, |season| {
            let show_title = show_title.clone();
            async move { self.season_lineup(ctx, &show_title, year, season).await }
        })
        .await?;
        Ok(Series::new(batches.into_iter().flatten().collect()))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let slug = catalog_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let show = self.show(ctx, slug).await?;
        // One-off titles are movies only when the catalog says so; anything
        // else stays a single-episode series for a stable cache identity.
        if show.kind.as_deref() != Some("movie") {
            return Err(ServiceError::NotFound(format!("{slug} is not a movie")));
        }
        let id_media = show.id_media.ok_or_else(|| ServiceError::Payload {
            service: "gem",
            detail: "movie without idMedia".to_string(),
        })?;
        Ok(MovieGroup::new(vec![Movie {
            id: id_media.to_string(),
            service: "GEM".to_string(),
            title: show.title,
            year: show.first_air_year,
            data: Some(json!(id_media)),
            drm: Some(true),
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
        let season_number: u32 = captures
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let episode_number: u32 = captures
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);

        let series = self.get_series(ctx, &format!("https://gem.cbc.ca/{slug}")).await?;
        let episode = series
            .iter()
            .find(|episode| {
                episode.season == season_number && episode.number == episode_number
            })
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("{slug} s{season_number:02}e{episode_number:02}"))
            })?;
        Ok((episode, slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let id_media = title
            .data()
            .and_then(|value| value.as_i64())
            .ok_or_else(|| ServiceError::Payload {
                service: "gem",
                detail: "title is missing idMedia".to_string(),
            })?;
        let token = self.claims_token(ctx).await?;
        let response = ctx
            .http
            .get(VALIDATION_URL)
            .query(&[
                ("appCode", "gem"),
                ("connectionType", "hd"),
                ("deviceType", "web"),
                ("idMedia", &id_media.to_string()),
                ("multibitrate", "true"),
                ("output", "json"),
                ("tech", "dash"),
                ("manifestType", "desktop"),
            ])
            .header("x-claims-token", &token)
            .send()
            .await?
            .error_for_status()?;
        let validation: Validation = response.json().await?;
        match validation.error_code {
            Some(1) => {
                return Err(ServiceError::RegionLocked(
                    validation
                        .message
                        .unwrap_or_else(|| "CBC Gem is only available in Canada".to_string()),
                ))
            }
            Some(_) => {
                return Err(ServiceError::NotFound(
                    validation.message.unwrap_or_else(|| title.display_name()),
                ))
            }
            None => {}
        }
        let manifest_url = validation.url.ok_or_else(|| {
            ServiceError::ManifestMalformed("validation response has no manifest url".into())
        })?;

        Ok(Playlist {
            manifest_url,
            kind: ManifestKind::Dash,
            license_url: Some(format!("{LICENSE_BASE}?claims={token}")),
            framing: Some(LicenseFraming::Raw),
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

    async fn search(&self, ctx: &RunContext, keywords: &str) -> ServiceResult<Vec<SearchHit>> {
        let response = ctx
            .http
            .get(SEARCH_URL)
            .query(&[("device", "web"), ("term", keywords)])
            .send()
            .await?
            .error_for_status()?;
        let envelope: SearchEnvelope = response.json().await?;
        Ok(envelope
            .result
            .into_iter()
            .map(|row| SearchHit {
                service: "GEM".to_string(),
                title: row.title,
                year: None,
                kind: row.kind.unwrap_or_else(|| "show".to_string()),
                url: format!("https://gem.cbc.ca/{}", row.url.trim_start_matches('/')),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = GemAdapter::new(PathBuf::from("profile.yaml"));
        assert_eq!(
            adapter.parse_url("https://gem.cbc.ca/schitts-creek").unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://gem.cbc.ca/media/schitts-creek")
                .unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://gem.cbc.ca/schitts-creek/s01e03")
                .unwrap(),
            UrlKind::Episode
        );
        assert!(adapter.parse_url("https://gem.cbc.ca/live/tv").is_err());
    }

    #[test]
    fn lineup_maps_to_episodes() {
        let raw = r#"{
            "items": [
                {"idMedia": 9001, "title": "Our Cabin", "episodeNumber": 3, "seasonNumber": 2},
                {"idMedia": 9002, "title": "Episode 4", "episodeNumber": 4}
            ]
        }"#;
        let lineup: SeasonLineup = serde_json::from_str(raw).unwrap();
        assert_eq!(lineup.items.len(), 2);
        assert_eq!(lineup.items[0].id_media, 9001);
        assert_eq!(normalize_episode_name(&lineup.items[1].title, "Show"), "");
    }
}
