//! CTV (ctv.ca). Catalog discovery goes through the Apollo persisted-query
//! GraphQL endpoint; playback resolves through the 9c9media content API with
//! a raw-challenge Widevine license server.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cdm::LicenseFraming;
use crate::service::{
    dash_mediainfo, fan_out, ManifestKind, MediaInfo, Playlist, RunContext, SearchHit,
    ServiceAdapter, ServiceError, ServiceResult, UrlKind, FAN_OUT,
};
use crate::title::{normalize_episode_name, Episode, Movie, MovieGroup, Series, Title};

const GRAPHQL_URL: &str = "https://www.ctv.ca/space-graphql/apq/graphql";
const CAPI_BASE: &str = "https://capi.9c9media.com/destinations/ctv_android/platforms/desktop";
const LICENSE_URL: &str = "https://license.9c9media.ca/widevine";

const RESOLVE_PATH_QUERY: &str = "query resolvePath($path: String!) { resolvedPath(path: $path) { lastSegment { content { id title type firstAirYear axisId seasonNumber episodeNumber seasons { id title seasonNumber } } } } }";
const SEASON_EPISODES_QUERY: &str = "query seasonEpisodes($seasonId: ID!) { axisSeason(id: $seasonId) { episodes { axisId title episodeNumber seasonNumber firstAirYear description } } }";
const SEARCH_QUERY: &str = "query searchMedia($title: String!) { searchMedia(titleMatches: $title) { page { items { title path type firstAirYear } } } }";

static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
static EPISODE_RE: OnceLock<Regex> = OnceLock::new();
static MOVIE_RE: OnceLock<Regex> = OnceLock::new();

fn catalog_re() -> &'static Regex {
    CATALOG_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?ctv\.ca/shows/([a-z0-9-]+)/?$").expect("valid regex")
    })
}

fn episode_re() -> &'static Regex {
    EPISODE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?ctv\.ca/shows/([a-z0-9-]+)/([a-z0-9-]+)/?$")
            .expect("valid regex")
    })
}

fn movie_re() -> &'static Regex {
    MOVIE_RE.get_or_init(|| {
        Regex::new(r"^https?://(?:www\.)?ctv\.ca/movies/([a-z0-9-]+)/?$").expect("valid regex")
    })
}

/// Apollo persisted-query hash: sha256 of the canonical query text.
fn persisted_hash(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvePathData {
    resolved_path: Option<ResolvedPath>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedPath {
    last_segment: LastSegment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastSegment {
    content: Option<AxisContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AxisContent {
    title: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    first_air_year: Option<i32>,
    #[serde(default)]
    axis_id: Option<i64>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    seasons: Vec<AxisSeason>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AxisSeason {
    id: String,
    #[serde(default)]
    season_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeasonEpisodesData {
    axis_season: Option<AxisSeasonEpisodes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AxisSeasonEpisodes {
    #[serde(default)]
    episodes: Vec<AxisEpisode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AxisEpisode {
    axis_id: i64,
    title: String,
    #[serde(default)]
    episode_number: Option<u32>,
    #[serde(default)]
    season_number: Option<u32>,
    #[serde(default)]
    first_air_year: Option<i32>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    search_media: Option<SearchPage>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    page: SearchItems,
}

#[derive(Debug, Deserialize)]
struct SearchItems {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    title: String,
    path: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    first_air_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContentPackages {
    #[serde(default)]
    items: Vec<ContentPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContentPackage {
    id: i64,
}

#[derive(Debug, Default)]
pub struct CtvAdapter;

impl CtvAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        ctx: &RunContext,
        operation: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> ServiceResult<T> {
        let extensions = json!({
            "persistedQuery": {"version": 1, "sha256Hash": persisted_hash(query)}
        });
        let response = ctx
            .http
            .get(GRAPHQL_URL)
            .query(&[
                ("operationName", operation),
                ("variables", &variables.to_string()),
                ("extensions", &extensions.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let envelope: GraphQlEnvelope<T> = response.json().await?;
        envelope.data.ok_or_else(|| ServiceError::Payload {
            service: "ctv",
            detail: format!("{operation} returned no data"),
        })
    }

    async fn resolve_content(&self, ctx: &RunContext, path: &str) -> ServiceResult<AxisContent> {
        let data: ResolvePathData = self
            .graphql(
                ctx,
                "resolvePath",
                RESOLVE_PATH_QUERY,
                json!({"path": path}),
            )
            .await?;
        data.resolved_path
            .and_then(|resolved| resolved.last_segment.content)
            .ok_or_else(|| ServiceError::NotFound(format!("nothing published at {path}")))
    }

    async fn season_episodes(
        &self,
        ctx: &RunContext,
        show_title: &str,
        year: Option<i32>,
        season: &AxisSeason,
    ) -> ServiceResult<Vec<Episode>> {
        let data: SeasonEpisodesData = self
            .graphql(
                ctx,
                "seasonEpisodes",
                SEASON_EPISODES_QUERY,
                json!({"seasonId": season.id}),
            )
            .await?;
        let episodes = data
            .axis_season
            .map(|season| season.episodes)
            .unwrap_or_default();
        Ok(episodes
            .into_iter()
            .map(|raw| Episode {
                id: raw.axis_id.to_string(),
                service: "CTV".to_string(),
                title: show_title.to_string(),
                season: raw.season_number.or(season.season_number).unwrap_or(0),
                number: raw.episode_number.unwrap_or(0),
                name: normalize_episode_name(&raw.title, show_title),
                year: raw.first_air_year.or(year),
                data: Some(json!(raw.axis_id)),
                drm: Some(true),
                description: raw.description,
                ..Episode::default()
            })
            .collect())
    }

    fn axis_id(&self, title: &Title) -> ServiceResult<i64> {
        title
            .data()
            .and_then(|data| data.as_i64())
            .ok_or_else(|| ServiceError::Payload {
                service: "ctv",
                detail: "title is missing its axis id".to_string(),
            })
    }
}

#[async_trait]
impl ServiceAdapter for CtvAdapter {
    fn name(&self) -> &'static str {
        "ctv"
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
        let slug = catalog_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let content = self.resolve_content(ctx, &format!("/shows/{slug}")).await?;
        debug!(slug, seasons = content.seasons.len(), "ctv catalog resolved");

        let show_title = content.title.clone();
        let year = content.first_air_year;
        let batches = fan_out(content.seasons, FAN_OUT, |season| {
            let show_title = show_title.clone();
            async move { self.season_episodes(ctx, &show_title, year, &season).await }
        })
        .await?;
        Ok(Series::new(batches.into_iter().flatten().collect()))
    }

    async fn get_movies(&self, ctx: &RunContext, url: &str) -> ServiceResult<MovieGroup> {
        let slug = movie_re()
            .captures(url)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ServiceError::BadUrl(url.to_string()))?
            .as_str();
        let content = self.resolve_content(ctx, &format!("/movies/{slug}")).await?;
        let axis_id = content.axis_id.ok_or_else(|| ServiceError::Payload {
            service: "ctv",
            detail: "movie without axis id".to_string(),
        })?;
        Ok(MovieGroup::new(vec![Movie {
            id: axis_id.to_string(),
            service: "CTV".to_string(),
            title: content.title,
            year: content.first_air_year,
            data: Some(json!(axis_id)),
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
        let show_slug = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let episode_slug = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let content = self
            .resolve_content(ctx, &format!("/shows/{show_slug}/{episode_slug}"))
            .await?;
        let axis_id = content.axis_id.ok_or_else(|| ServiceError::Payload {
            service: "ctv",
            detail: "episode without axis id".to_string(),
        })?;
        let show_title = content.title.clone();
        let episode = Episode {
            id: axis_id.to_string(),
            service: "CTV".to_string(),
            title: show_title,
            season: content.season_number.unwrap_or(0),
            number: content.episode_number.unwrap_or(0),
            name: String::new(),
            year: content.first_air_year,
            data: Some(json!(axis_id)),
            drm: Some(true),
            ..Episode::default()
        };
        Ok((episode, show_slug))
    }

    async fn get_playlist(&self, ctx: &RunContext, title: &Title) -> ServiceResult<Playlist> {
        let axis_id = self.axis_id(title)?;
        let packages_url =
            format!("{CAPI_BASE}/contents/{axis_id}/contentPackages?$include=[Id,Constraints]");
        let response = ctx.http.get(&packages_url).send().await?;
        match response.status().as_u16() {
            404 => return Err(ServiceError::NotFound(title.display_name())),
            403 | 451 => {
                return Err(ServiceError::RegionLocked(
                    "CTV playback is only available in Canada".to_string(),
                ))
            }
            _ => {}
        }
        let packages: ContentPackages = response.error_for_status()?.json().await?;
        let package = packages
            .items
            .first()
            .ok_or_else(|| ServiceError::NotFound(title.display_name()))?;
        Ok(Playlist {
            manifest_url: format!(
                "{CAPI_BASE}/contents/{axis_id}/contentPackages/{}/manifest.mpd",
                package.id
            ),
            kind: ManifestKind::Dash,
            license_url: Some(LICENSE_URL.to_string()),
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
        let data: SearchData = self
            .graphql(ctx, "searchMedia", SEARCH_QUERY, json!({"title": keywords}))
            .await?;
        Ok(data
            .search_media
            .map(|media| media.page.items)
            .unwrap_or_default()
            .into_iter()
            .map(|item| SearchHit {
                service: "CTV".to_string(),
                title: item.title,
                year: item.first_air_year,
                kind: item.kind.unwrap_or_else(|| "show".to_string()),
                url: format!("https://www.ctv.ca{}", item.path),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_grammar() {
        let adapter = CtvAdapter::new();
        assert_eq!(
            adapter.parse_url("https://www.ctv.ca/shows/the-name").unwrap(),
            UrlKind::Catalog
        );
        assert_eq!(
            adapter
                .parse_url("https://www.ctv.ca/shows/the-name/the-pilot-s01e01")
                .unwrap(),
            UrlKind::Episode
        );
        assert_eq!(
            adapter.parse_url("https://ctv.ca/movies/big-film").unwrap(),
            UrlKind::Movie
        );
        assert!(adapter.parse_url("https://www.ctv.ca/live").is_err());
        assert!(adapter.parse_url("https://other.ca/shows/x").is_err());
    }

    #[test]
    fn persisted_hash_is_sha256_of_query_text() {
        let hash = persisted_hash("{ ping }");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, persisted_hash("{ ping }"));
        assert_ne!(hash, persisted_hash("{ pong }"));
    }

    #[test]
    fn season_payload_maps_to_episodes() {
        let raw = r#"{
            "axisSeason": {
                "episodes": [
                    {"axisId": 101, "title": "Episode 1", "episodeNumber": 1, "seasonNumber": 1},
                    {"axisId": 102, "title": "The Reckoning", "episodeNumber": 2, "seasonNumber": 1, "firstAirYear": 2021}
                ]
            }
        }"#;
        let data: SeasonEpisodesData = serde_json::from_str(raw).unwrap();
        let episodes = data.axis_season.unwrap().episodes;
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].axis_id, 101);
        assert_eq!(normalize_episode_name(&episodes[0].title, "Show"), "");
        assert_eq!(episodes[1].title, "The Reckoning");
    }
}
